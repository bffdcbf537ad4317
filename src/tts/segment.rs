//! Sentence segmentation with character offsets
//!
//! Splits narration text into sentences at `.`, `?`, `!` followed by
//! whitespace, while refusing to split after dotted initialisms ("e.g.") and
//! titlecase abbreviations ("Mr."). Every segment carries the trimmed byte
//! span into its parent paragraph so clients can highlight the exact
//! substring without searching for it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// A sentence terminator followed by at least one whitespace character. The
/// abbreviation checks run separately because the regex crate has no
/// look-behind support.
static BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").expect("boundary regex"));

/// One sentence of a flattened chapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentenceSegment {
    pub paragraph_index: usize,
    pub sentence_index: usize,
    pub text: String,
    pub is_last_in_paragraph: bool,
    /// Trimmed byte offset into the parent paragraph.
    pub char_start: usize,
    /// Exclusive end offset; `paragraph[char_start..char_end] == text`.
    pub char_end: usize,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// True when the terminator at byte `term` ends an abbreviation rather than
/// a sentence. Mirrors the two look-behinds of the upstream splitter: a
/// dotted initialism (`\w.\w.`) and a titlecase abbreviation (`[A-Z][a-z].`).
fn ends_abbreviation(text: &str, term: usize) -> bool {
    let b = text.as_bytes();
    if term >= 3 && is_word_byte(b[term - 3]) && b[term - 2] == b'.' && is_word_byte(b[term - 1]) {
        return true;
    }
    if b[term] == b'.'
        && term >= 2
        && b[term - 2].is_ascii_uppercase()
        && b[term - 1].is_ascii_lowercase()
    {
        return true;
    }
    false
}

/// Shrink `[start, end)` past outer whitespace. Returns `None` for spans
/// that are empty after trimming.
fn trim_span(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim_end();
    let new_start = start + lead;
    let new_end = start + lead + trimmed.trim_start().len();
    if new_start < new_end {
        Some((new_start, new_end))
    } else {
        None
    }
}

/// Split `text` into trimmed sentence spans `(sentence, char_start, char_end)`.
///
/// Spans are non-overlapping and strictly increasing. When no boundary
/// matches, the whole trimmed text is one span.
pub fn split_with_offsets(text: &str) -> Vec<(&str, usize, usize)> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut cursor = 0;
    for m in BOUNDARY.find_iter(text) {
        if ends_abbreviation(text, m.start()) {
            continue;
        }
        // The span keeps the terminator; the whitespace run is dropped.
        if let Some((s, e)) = trim_span(text, cursor, m.start() + 1) {
            out.push((&text[s..e], s, e));
        }
        cursor = m.end();
    }

    if cursor < text.len() {
        if let Some((s, e)) = trim_span(text, cursor, text.len()) {
            out.push((&text[s..e], s, e));
        }
    }

    // No boundary matched anywhere: the entire text is one sentence.
    if out.is_empty() {
        if let Some((s, e)) = trim_span(text, 0, text.len()) {
            out.push((&text[s..e], s, e));
        }
    }
    out
}

/// Split `text` into trimmed sentence strings.
pub fn split(text: &str) -> Vec<String> {
    split_with_offsets(text)
        .into_iter()
        .map(|(s, _, _)| s.to_string())
        .collect()
}

/// Flatten paragraphs into ordered sentence segments.
///
/// Paragraphs that are empty after trimming produce nothing; every non-empty
/// paragraph has exactly one segment with `is_last_in_paragraph` set.
pub fn flatten(paragraphs: &[String]) -> Vec<SentenceSegment> {
    flatten_from(paragraphs, 0)
}

/// Like [`flatten`] but numbers paragraphs starting at `first_index`, so
/// segments of a chapter slice still index into the full paragraph list.
pub fn flatten_from(paragraphs: &[String], first_index: usize) -> Vec<SentenceSegment> {
    let mut out = Vec::new();
    for (offset, paragraph) in paragraphs.iter().enumerate() {
        if paragraph.trim().is_empty() {
            continue;
        }
        let parts = split_with_offsets(paragraph);
        let count = parts.len();
        for (s_idx, (sentence, start, end)) in parts.into_iter().enumerate() {
            out.push(SentenceSegment {
                paragraph_index: first_index + offset,
                sentence_index: s_idx,
                text: sentence.to_string(),
                is_last_in_paragraph: s_idx == count - 1,
                char_start: start,
                char_end: end,
            });
        }
    }
    out
}
