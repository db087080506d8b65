//! Document loading: file on disk → page texts.
//!
//! | Extension | Pages |
//! |-----------|-------|
//! | `.pdf` | one string per page (`pdf-extract`) |
//! | `.docx` | one string; paragraphs separated by `\n` (`zip` + `quick-xml`) |
//! | `.md`, `.markdown`, `.txt` | the file contents as one string |
//!
//! Anything else is [`LoadError::Unsupported`]. Corrupt inputs return an
//! error, never a panic.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Largest decompressed `word/document.xml` read from a DOCX archive.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Ooxml(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Read `path` and return its text, one entry per page.
pub fn load_pages(path: &Path) -> Result<Vec<String>, LoadError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let read = || {
        std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })
    };

    match ext.as_str() {
        "pdf" => load_pdf(&read()?),
        "docx" => Ok(vec![load_docx(&read()?)?]),
        "md" | "markdown" | "txt" => Ok(vec![String::from_utf8_lossy(&read()?).into_owned()]),
        _ => Err(LoadError::Unsupported(path.display().to_string())),
    }
}

fn load_pdf(bytes: &[u8]) -> Result<Vec<String>, LoadError> {
    match pdf_extract::extract_text_from_mem_by_pages(bytes) {
        Ok(pages) => Ok(pages),
        Err(by_page) => {
            tracing::debug!(error = %by_page, "per-page PDF extraction failed; retrying whole document");
            pdf_extract::extract_text_from_mem(bytes)
                .map(|text| vec![text])
                .map_err(|e| LoadError::Pdf(e.to_string()))
        }
    }
}

fn load_docx(bytes: &[u8]) -> Result<String, LoadError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| LoadError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| LoadError::Ooxml("word/document.xml not found".to_string()))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| LoadError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(LoadError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_text(&doc_xml)
}

/// Collect `<w:t>` runs, ending each `<w:p>` paragraph with a newline.
fn docx_text(xml: &[u8]) -> Result<String, LoadError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| LoadError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(LoadError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}
