//! Upload staging and input path expansion.
//!
//! Ingestion works from a staging directory: uploaded `(name, bytes)` pairs
//! are written there first, so the loader reads a stable copy even when the
//! originals move. Staged names are reduced to their final path component;
//! when two uploads share a name, later ones get a `-2`, `-3`, … suffix.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Write `files` into `dir`, clearing previously staged files first when
/// `remove_old` is set. Returns the staged paths in input order.
pub fn stage_files(dir: &Path, files: &[(String, Vec<u8>)], remove_old: bool) -> Result<Vec<PathBuf>> {
    if remove_old && dir.exists() {
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read staging dir: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove staged file: {}", path.display()))?;
            }
        }
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create staging dir: {}", dir.display()))?;

    let mut staged = Vec::with_capacity(files.len());
    let mut used = HashSet::new();
    for (name, bytes) in files {
        let file_name = Path::new(name)
            .file_name()
            .with_context(|| format!("Invalid upload name: '{}'", name))?;
        let target = dir.join(unique_name(Path::new(file_name), &mut used));
        std::fs::write(&target, bytes)
            .with_context(|| format!("Failed to stage file: {}", target.display()))?;
        staged.push(target);
    }
    Ok(staged)
}

/// `name` itself, or `stem-N.ext` with the smallest `N >= 2` not yet in `used`.
fn unique_name(name: &Path, used: &mut HashSet<String>) -> String {
    let plain = name.to_string_lossy().into_owned();
    if used.insert(plain.clone()) {
        return plain;
    }
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}{}", stem, n, ext);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Read each path into a `(file name, bytes)` pair ready for [`stage_files`].
pub fn read_uploads(paths: &[PathBuf]) -> Result<Vec<(String, Vec<u8>)>> {
    paths
        .iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("Invalid input path: {}", path.display()))?;
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok((name, bytes))
        })
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Expand CLI paths into files. Files are taken as given; directories are
/// walked and filtered by `include_globs` (matched relative to the directory).
/// Results within each directory are sorted.
pub fn expand_paths(paths: &[PathBuf], include_globs: &[String]) -> Result<Vec<PathBuf>> {
    let includes = build_globset(include_globs)?;
    let mut out = Vec::new();

    for path in paths {
        if path.is_file() {
            out.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            bail!("Input path does not exist: {}", path.display());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
            if includes.is_match(relative) {
                found.push(entry.path().to_path_buf());
            }
        }
        found.sort();
        out.extend(found);
    }

    Ok(out)
}
