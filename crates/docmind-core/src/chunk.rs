//! Two-stage document chunker.
//!
//! Splits a document's full text into [`Chunk`]s in two cascaded passes:
//!
//! 1. **Semantic stage.** The text is split into sentences, each sentence is
//!    embedded together with its immediate neighbours, and a segment boundary
//!    is placed wherever the cosine distance between consecutive windows is an
//!    outlier for this document: `distance > mean + m × IQR`, with `m` the
//!    configured `breakpoint_iqr_multiplier`.
//! 2. **Fixed-size stage.** Each semantic segment is split recursively on
//!    `"\n\n"`, `"\n"`, `" "`, then single characters, and the pieces are
//!    merged into chunks of at most `chunk_size` characters, each sharing up
//!    to `chunk_overlap` trailing characters with its predecessor.
//!
//! All splitting works on byte ranges of the original text, so every chunk
//! is an exact slice of the document and its `start_offset` (in characters)
//! is recovered without searching.
//!
//! ```text
//! text ──▶ sentences ──▶ windows ──▶ embed ──▶ distances ──▶ segments
//!                                                                │
//!                          chunks ◀── merge(overlap) ◀── recursive split
//! ```

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::models::Chunk;

/// Separators tried by the fixed-size stage, coarsest first.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkerConfig {
    /// Maximum chunk length in characters.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks of one segment.
    pub chunk_overlap: usize,
    pub breakpoint_iqr_multiplier: f64,
    /// When false the whole document is treated as a single segment.
    pub semantic: bool,
    /// Most sentence windows sent to the embedder in one call.
    pub embed_batch_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2048,
            chunk_overlap: 100,
            breakpoint_iqr_multiplier: 1.5,
            semantic: true,
            embed_batch_size: 64,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if self.chunk_overlap >= self.chunk_size {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap,
                self.chunk_size
            );
        }
        if self.embed_batch_size == 0 {
            bail!("embed_batch_size must be > 0");
        }
        Ok(())
    }
}

/// Splits document text into retrieval-sized chunks.
///
/// The embedder is only used by the semantic stage; it should be the same
/// model that embeds the resulting chunks.
pub struct Chunker {
    config: ChunkerConfig,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Chunker {
    pub fn new(config: ChunkerConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { config, embedder }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split `text` into chunks carrying `metadata` plus `chunk_index` and
    /// `start_index` entries.
    ///
    /// Empty or whitespace-only text yields an empty vector.
    pub async fn split(&self, text: &str, metadata: &Map<String, Value>) -> Result<Vec<Chunk>> {
        self.config.validate()?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let segments = if self.config.semantic {
            self.semantic_segments(text).await?
        } else {
            vec![trim_range(text, 0..text.len())]
        };

        let mut spans = Vec::new();
        for segment in segments {
            spans.extend(split_fixed(
                text,
                segment,
                self.config.chunk_size,
                self.config.chunk_overlap,
            ));
        }

        let mut offsets = CharOffsets::new(text);
        let chunks = spans
            .into_iter()
            .enumerate()
            .map(|(i, span)| {
                let start_offset = offsets.char_offset(span.start);
                let mut meta = metadata.clone();
                meta.insert("chunk_index".to_string(), Value::from(i as i64));
                meta.insert("start_index".to_string(), Value::from(start_offset));
                Chunk {
                    id: Uuid::new_v4().to_string(),
                    chunk_index: i as i64,
                    start_offset,
                    text: text[span].to_string(),
                    metadata: meta,
                }
            })
            .collect();
        Ok(chunks)
    }

    /// Byte ranges of the semantic segments of `text`, in document order.
    pub async fn semantic_segments(&self, text: &str) -> Result<Vec<Range<usize>>> {
        let sentences = sentence_spans(text);
        if sentences.len() < 2 {
            return Ok(sentences);
        }

        let windows: Vec<String> = (0..sentences.len())
            .map(|i| {
                let lo = i.saturating_sub(1);
                let hi = (i + 1).min(sentences.len() - 1);
                sentences[lo..=hi]
                    .iter()
                    .map(|r| &text[r.clone()])
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();

        let mut embeddings = Vec::with_capacity(windows.len());
        for batch in windows.chunks(self.config.embed_batch_size.max(1)) {
            let vectors = self.embedder.embed_documents(batch).await?;
            if vectors.len() != batch.len() {
                bail!(
                    "embedder returned {} vectors for {} sentence windows",
                    vectors.len(),
                    batch.len()
                );
            }
            embeddings.extend(vectors);
        }

        let distances: Vec<f64> = embeddings
            .windows(2)
            .map(|pair| 1.0 - cosine_similarity(&pair[0], &pair[1]) as f64)
            .collect();
        let threshold = iqr_threshold(&distances, self.config.breakpoint_iqr_multiplier);

        let mut segments = Vec::new();
        let mut first = 0;
        for (i, distance) in distances.iter().enumerate() {
            if *distance > threshold {
                segments.push(sentences[first].start..sentences[i].end);
                first = i + 1;
            }
        }
        segments.push(sentences[first].start..sentences[sentences.len() - 1].end);

        tracing::debug!(
            sentences = sentences.len(),
            segments = segments.len(),
            threshold,
            "semantic segmentation"
        );
        Ok(segments)
    }
}

/// Outlier boundary `mean + multiplier × (p75 − p25)` of `distances`.
pub fn iqr_threshold(distances: &[f64], multiplier: f64) -> f64 {
    if distances.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted = distances.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    let iqr = percentile(&sorted, 75.0) - percentile(&sorted, 25.0);
    mean + multiplier * iqr
}

/// Linear-interpolated percentile of an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let pos = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Sentence byte ranges of `text`, trimmed, empties dropped.
///
/// A sentence ends at a whitespace run that follows `.`, `?` or `!`, or at
/// any whitespace run containing a blank line.
pub fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut sentence_start = 0;
    let mut prev: Option<char> = None;
    let mut iter = text.char_indices().peekable();

    while let Some((i, c)) = iter.next() {
        if !c.is_whitespace() {
            prev = Some(c);
            continue;
        }

        let run_start = i;
        let mut run_end = i + c.len_utf8();
        let mut newlines = usize::from(c == '\n');
        while let Some(&(j, next)) = iter.peek() {
            if !next.is_whitespace() {
                break;
            }
            newlines += usize::from(next == '\n');
            run_end = j + next.len_utf8();
            iter.next();
        }

        if matches!(prev, Some('.' | '?' | '!')) || newlines >= 2 {
            spans.push(sentence_start..run_start);
            sentence_start = run_end;
        }
        prev = None;
    }
    spans.push(sentence_start..text.len());

    spans
        .into_iter()
        .map(|r| trim_range(text, r))
        .filter(|r| !r.is_empty())
        .collect()
}

/// Split `range` of `text` into chunk ranges of at most `chunk_size`
/// characters with up to `chunk_overlap` characters shared between
/// neighbours. Returned ranges are trimmed and non-empty.
pub fn split_fixed(
    text: &str,
    range: Range<usize>,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<Range<usize>> {
    if range.is_empty() {
        return Vec::new();
    }
    recursive_split(text, range, &SEPARATORS, chunk_size, chunk_overlap)
}

fn recursive_split(
    text: &str,
    range: Range<usize>,
    separators: &[&str],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<Range<usize>> {
    let slice = &text[range.clone()];
    let sep_idx = separators
        .iter()
        .position(|s| s.is_empty() || slice.contains(s))
        .unwrap_or(separators.len() - 1);
    let separator = separators[sep_idx];
    let remaining = &separators[sep_idx + 1..];

    let mut out = Vec::new();
    let mut good: Vec<Range<usize>> = Vec::new();
    for piece in split_keep_start(text, range, separator) {
        if char_len(text, &piece) < chunk_size {
            good.push(piece);
            continue;
        }
        if !good.is_empty() {
            out.extend(merge_pieces(text, &good, chunk_size, chunk_overlap));
            good.clear();
        }
        if remaining.is_empty() {
            out.push(piece);
        } else {
            out.extend(recursive_split(text, piece, remaining, chunk_size, chunk_overlap));
        }
    }
    if !good.is_empty() {
        out.extend(merge_pieces(text, &good, chunk_size, chunk_overlap));
    }

    out.into_iter()
        .map(|r| trim_range(text, r))
        .filter(|r| !r.is_empty())
        .collect()
}

/// Split at every occurrence of `separator`, keeping the separator at the
/// start of the following piece. An empty separator splits into characters.
fn split_keep_start(text: &str, range: Range<usize>, separator: &str) -> Vec<Range<usize>> {
    let base = range.start;
    let slice = &text[range.clone()];

    if separator.is_empty() {
        return slice
            .char_indices()
            .map(|(i, c)| base + i..base + i + c.len_utf8())
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in slice.match_indices(separator) {
        if idx > start {
            pieces.push(base + start..base + idx);
        }
        start = idx;
    }
    if start < slice.len() {
        pieces.push(base + start..range.end);
    }
    pieces
}

/// Greedily merge adjacent pieces into windows of at most `chunk_size`
/// characters, carrying up to `chunk_overlap` characters into the next one.
fn merge_pieces(
    text: &str,
    pieces: &[Range<usize>],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<Range<usize>> {
    let mut merged = Vec::new();
    let mut current: VecDeque<(Range<usize>, usize)> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let len = char_len(text, piece);
        if total + len > chunk_size && !current.is_empty() {
            push_window(text, &current, &mut merged);
            while total > chunk_overlap || (total + len > chunk_size && total > 0) {
                match current.pop_front() {
                    Some((_, dropped)) => total -= dropped,
                    None => break,
                }
            }
        }
        current.push_back((piece.clone(), len));
        total += len;
    }
    push_window(text, &current, &mut merged);
    merged
}

fn push_window(text: &str, window: &VecDeque<(Range<usize>, usize)>, out: &mut Vec<Range<usize>>) {
    if let (Some((first, _)), Some((last, _))) = (window.front(), window.back()) {
        let span = trim_range(text, first.start..last.end);
        if !span.is_empty() {
            out.push(span);
        }
    }
}

fn char_len(text: &str, range: &Range<usize>) -> usize {
    text[range.clone()].chars().count()
}

fn trim_range(text: &str, range: Range<usize>) -> Range<usize> {
    let slice = &text[range.clone()];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead == slice.len() {
        return range.start..range.start;
    }
    range.start + lead..range.end - trail
}

/// Incremental byte-to-character offset conversion for mostly ascending lookups.
struct CharOffsets<'a> {
    text: &'a str,
    byte: usize,
    chars: usize,
}

impl<'a> CharOffsets<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            byte: 0,
            chars: 0,
        }
    }

    fn char_offset(&mut self, byte: usize) -> usize {
        if byte >= self.byte {
            self.chars += self.text[self.byte..byte].chars().count();
        } else {
            self.chars = self.text[..byte].chars().count();
        }
        self.byte = byte;
        self.chars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use async_trait::async_trait;

    /// Two-topic embedder: counts "cat" and "stock" mentions.
    struct TopicEmbedder;

    #[async_trait]
    impl EmbeddingProvider for TopicEmbedder {
        fn model_name(&self) -> &str {
            "topic"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let lower = t.to_lowercase();
                    vec![
                        lower.matches("cat").count() as f32,
                        lower.matches("stock").count() as f32,
                    ]
                })
                .collect())
        }
    }

    fn hash_chunker(chunk_size: usize, chunk_overlap: usize) -> Chunker {
        Chunker::new(
            ChunkerConfig {
                chunk_size,
                chunk_overlap,
                ..Default::default()
            },
            Arc::new(HashEmbedder::new(64)),
        )
    }

    fn char_slice(text: &str, offset: usize, len: usize) -> String {
        text.chars().skip(offset).take(len).collect()
    }

    #[tokio::test]
    async fn test_empty_input_yields_no_chunks() {
        let chunker = hash_chunker(100, 10);
        assert!(chunker.split("", &Map::new()).await.unwrap().is_empty());
        assert!(chunker.split(" \n\t ", &Map::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_text_is_single_chunk() {
        let chunker = hash_chunker(100, 10);
        let chunks = chunker.split("  Hello world.", &Map::new()).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world.");
        assert_eq!(chunks[0].start_offset, 2);
        assert_eq!(chunks[0].metadata["start_index"], Value::from(2));
    }

    #[tokio::test]
    async fn test_chunks_are_bounded_monotone_slices() {
        let text = "Über café naïve résumé. ".repeat(40)
            + "\n\nSecond section talks about something else entirely. "
            + &"Words keep flowing here without end ".repeat(30);
        let chunker = hash_chunker(120, 20);
        let mut meta = Map::new();
        meta.insert("source".to_string(), Value::from("doc.txt"));
        let chunks = chunker.split(&text, &meta).await.unwrap();

        assert!(chunks.len() > 3);
        let mut last = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            let len = chunk.text.chars().count();
            assert!(len <= 120, "chunk {} has {} chars", i, len);
            assert!(chunk.start_offset >= last);
            last = chunk.start_offset;
            assert_eq!(char_slice(&text, chunk.start_offset, len), chunk.text);
            assert_eq!(chunk.chunk_index, i as i64);
            assert_eq!(chunk.source(), Some("doc.txt"));
        }
    }

    #[tokio::test]
    async fn test_chunks_cover_all_content() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu nu xi";
        let chunker = Chunker::new(
            ChunkerConfig {
                chunk_size: 20,
                chunk_overlap: 6,
                semantic: false,
                ..Default::default()
            },
            Arc::new(HashEmbedder::new(16)),
        );
        let chunks = chunker.split(text, &Map::new()).await.unwrap();

        let total = text.chars().count();
        let mut covered = vec![false; total];
        for chunk in &chunks {
            let len = chunk.text.chars().count();
            for slot in covered.iter_mut().skip(chunk.start_offset).take(len) {
                *slot = true;
            }
        }
        for (i, c) in text.chars().enumerate() {
            if !c.is_whitespace() {
                assert!(covered[i], "char {} ({:?}) not covered", i, c);
            }
        }

        let overlapping = chunks
            .windows(2)
            .any(|w| w[1].start_offset < w[0].start_offset + w[0].text.chars().count());
        assert!(overlapping, "expected consecutive chunks to share text");
    }

    #[tokio::test]
    async fn test_semantic_stage_splits_at_topic_shift() {
        let text = "Cats purr. Cats nap. Cats hunt. Cats meow. Cats climb. Cats sleep. \
                    Stocks fell. Stocks rose. Stocks dipped. Stocks rallied. Stocks slid. Stocks soared.";
        let chunker = Chunker::new(ChunkerConfig::default(), Arc::new(TopicEmbedder));

        let segments = chunker.semantic_segments(text).await.unwrap();
        assert_eq!(segments.len(), 2);
        assert!(text[segments[0].clone()].ends_with("Cats sleep."));
        assert!(text[segments[1].clone()].starts_with("Stocks fell."));

        let chunks = chunker.split(text, &Map::new()).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].start_offset, text.find("Stocks").unwrap());
    }

    /// Records the size of every `embed_documents` call.
    struct CountingEmbedder {
        calls: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }

        fn dims(&self) -> usize {
            1
        }

        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.lock().unwrap().push(texts.len());
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    #[tokio::test]
    async fn test_semantic_stage_embeds_in_batches() {
        let text = (0..500)
            .map(|i| format!("Sentence number {}.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let embedder = Arc::new(CountingEmbedder {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let chunker = Chunker::new(
            ChunkerConfig {
                embed_batch_size: 32,
                ..Default::default()
            },
            embedder.clone(),
        );

        chunker.semantic_segments(&text).await.unwrap();

        let calls = embedder.calls.lock().unwrap();
        assert_eq!(calls.iter().sum::<usize>(), 500);
        assert!(calls.iter().all(|n| *n <= 32), "oversized call: {:?}", calls);
        assert_eq!(calls.len(), 16);
    }

    #[test]
    fn test_sentence_spans() {
        let text = "First one. Second?  Third!\nFourth line\n\nNew para";
        let spans: Vec<&str> = sentence_spans(text)
            .into_iter()
            .map(|r| &text[r])
            .collect();
        assert_eq!(
            spans,
            vec!["First one.", "Second?", "Third!", "Fourth line", "New para"]
        );
    }

    #[test]
    fn test_iqr_threshold() {
        let distances = [0.0, 0.0, 0.0, 0.0, 1.0];
        let t = iqr_threshold(&distances, 1.5);
        assert!((t - 0.2).abs() < 1e-9);
        assert!(iqr_threshold(&[], 1.5).is_infinite());
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&sorted, 25.0) - 1.75).abs() < 1e-9);
        assert!((percentile(&sorted, 75.0) - 3.25).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_config() {
        let cfg = ChunkerConfig {
            chunk_size: 10,
            chunk_overlap: 10,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ChunkerConfig {
            embed_batch_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert!(ChunkerConfig::default().validate().is_ok());
    }
}
