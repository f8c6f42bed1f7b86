use sha2::{Digest, Sha256};

/// A chunk of text cut from a knowledge document
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// The chunk text content
    pub text: String,
    /// 1-based start line in the original content
    pub start_line: usize,
    /// 1-based end line in the original content (inclusive)
    pub end_line: usize,
    /// SHA-256 hash of the chunk text (hex string)
    pub hash: String,
}

/// Configuration for the chunker
pub struct ChunkerConfig {
    /// Target chunk size in characters
    pub target_size: usize,
    /// Overlap size in characters between adjacent chunks
    pub overlap_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_size: 1000,
            overlap_size: 200,
        }
    }
}

/// Split document content into overlapping chunks.
///
/// Strategy:
/// 1. Split by paragraphs (double newline) as natural boundaries
/// 2. Pack adjacent paragraphs into a chunk while it fits target_size
/// 3. A paragraph exceeding target_size is split at line boundaries
/// 4. A single line exceeding target_size falls back to a fixed window
///    that prefers breaking at the last whitespace
/// 5. Adjacent chunks overlap by overlap_size characters from the end of
///    the previous chunk
///
/// Returns empty vec for empty input.
pub fn chunk_text(content: &str, config: &ChunkerConfig) -> Vec<TextChunk> {
    if content.is_empty() {
        return Vec::new();
    }

    let target_size = config.target_size.max(1);
    let overlap_size = config.overlap_size.min(target_size.saturating_sub(1));
    let line_starts = collect_line_starts(content);

    let core_ranges = pack_paragraphs(content, target_size, overlap_size);

    let mut with_overlap: Vec<std::ops::Range<usize>> = Vec::new();
    for range in core_ranges {
        let mut start = range.start;
        if let Some(prev) = with_overlap.last() {
            let desired = prev.end.saturating_sub(overlap_size);
            if start > desired {
                start = floor_char_boundary(content, desired);
            }
        }
        with_overlap.push(start..range.end);
    }

    let mut chunks = Vec::new();
    for range in with_overlap {
        if range.start >= range.end {
            continue;
        }
        let text = content[range.start..range.end].to_owned();
        let start_line = line_number_for_offset(&line_starts, range.start);
        let end_line = line_number_for_offset(&line_starts, range.end.saturating_sub(1));
        chunks.push(TextChunk {
            hash: compute_hash(&text),
            text,
            start_line,
            end_line,
        });
    }

    chunks
}

fn collect_line_starts(content: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (idx, ch) in content.char_indices() {
        if ch == '\n' && idx + 1 < content.len() {
            starts.push(idx + 1);
        }
    }
    starts
}

fn line_number_for_offset(line_starts: &[usize], offset: usize) -> usize {
    match line_starts.binary_search(&offset) {
        Ok(idx) => idx + 1,
        Err(idx) => idx,
    }
}

fn floor_char_boundary(content: &str, mut offset: usize) -> usize {
    while offset > 0 && !content.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Pack paragraphs into ranges no larger than target_size, descending to
/// line and fixed-window splits when a single unit is oversized.
fn pack_paragraphs(
    text: &str,
    target_size: usize,
    overlap_size: usize,
) -> Vec<std::ops::Range<usize>> {
    let mut core_ranges: Vec<std::ops::Range<usize>> = Vec::new();
    let mut current: Option<std::ops::Range<usize>> = None;

    for paragraph in split_paragraph_ranges(text) {
        let paragraph_len = paragraph.end - paragraph.start;
        if paragraph_len > target_size {
            if let Some(cur) = current.take() {
                core_ranges.push(cur);
            }
            core_ranges.extend(split_by_lines(
                text,
                paragraph.start,
                paragraph.end,
                target_size,
                overlap_size,
            ));
            continue;
        }

        if let Some(cur) = current.as_mut() {
            if paragraph.end - cur.start <= target_size {
                cur.end = paragraph.end;
            } else {
                core_ranges.push(cur.clone());
                *cur = paragraph;
            }
        } else {
            current = Some(paragraph);
        }
    }

    if let Some(cur) = current {
        core_ranges.push(cur);
    }

    core_ranges
}

fn split_paragraph_ranges(text: &str) -> Vec<std::ops::Range<usize>> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    let mut start = 0;
    let mut cursor = 0;

    while let Some(pos) = text[cursor..].find("\n\n") {
        let split_end = cursor + pos + 2;
        ranges.push(start..split_end);
        start = split_end;
        cursor = split_end;
    }

    if start < text.len() {
        ranges.push(start..text.len());
    }

    ranges
}

/// Split an oversized paragraph at line boundaries; lines that still exceed
/// the target fall back to a whitespace-preferring fixed window.
fn split_by_lines(
    text: &str,
    start: usize,
    end: usize,
    target_size: usize,
    overlap_size: usize,
) -> Vec<std::ops::Range<usize>> {
    let mut ranges: Vec<std::ops::Range<usize>> = Vec::new();
    let mut current: Option<std::ops::Range<usize>> = None;
    let mut offset = start;

    for line in text[start..end].split_inclusive('\n') {
        let line_start = offset;
        let line_end = offset + line.len();
        offset = line_end;

        if line.len() > target_size {
            if let Some(cur) = current.take() {
                ranges.push(cur);
            }
            ranges.extend(split_fixed_window(
                text,
                line_start,
                line_end,
                target_size,
                overlap_size,
            ));
            continue;
        }

        if let Some(cur) = current.as_mut() {
            if line_end - cur.start <= target_size {
                cur.end = line_end;
            } else {
                ranges.push(cur.clone());
                *cur = line_start..line_end;
            }
        } else {
            current = Some(line_start..line_end);
        }
    }

    if let Some(cur) = current {
        ranges.push(cur);
    }

    ranges
}

fn split_fixed_window(
    text: &str,
    start: usize,
    end: usize,
    target_size: usize,
    overlap_size: usize,
) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut cursor = start;
    let step = target_size.saturating_sub(overlap_size).max(1);

    while cursor < end {
        let window_end = floor_char_boundary(text, (cursor + target_size).min(end));
        let mut split_end = window_end;

        if window_end < end && window_end > cursor {
            let window = &text[cursor..window_end];
            if let Some(last_space) = window.rfind(char::is_whitespace) {
                if last_space > 0 {
                    split_end = cursor + last_space;
                }
            }
        }

        if split_end <= cursor {
            split_end = window_end;
        }
        if split_end <= cursor {
            break;
        }

        ranges.push(cursor..split_end);
        if split_end >= end {
            break;
        }

        cursor = floor_char_boundary(text, cursor.saturating_add(step));
    }

    ranges
}

fn compute_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(target_size: usize, overlap_size: usize) -> ChunkerConfig {
        ChunkerConfig {
            target_size,
            overlap_size,
        }
    }

    #[test]
    fn empty_input_returns_empty() {
        let chunks = chunk_text("", &cfg(100, 20));
        assert!(chunks.is_empty());
    }

    #[test]
    fn small_content_single_chunk() {
        let content = "A short knowledge document.\n\nTwo paragraphs.";
        let chunks = chunk_text(content, &cfg(100, 20));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, content);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }

    #[test]
    fn paragraphs_pack_up_to_target() {
        let content = "aaaa\n\nbbbb\n\ncccc";
        let chunks = chunk_text(content, &cfg(12, 3));
        assert!(chunks.len() >= 2);
        assert!(chunks[0].text.starts_with("aaaa"));
    }

    #[test]
    fn oversized_paragraph_splits_by_lines() {
        let content = "line one here\nline two here\nline three here";
        let chunks = chunk_text(content, &cfg(20, 4));
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
    }

    #[test]
    fn huge_line_fixed_window() {
        let content = "abcdefghij klmnopqrst uvwxyz abcdefg";
        let chunks = chunk_text(content, &cfg(12, 3));
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.text.len() <= 12 + 3));
    }

    #[test]
    fn overlap_between_chunks() {
        let content = "first paragraph with enough text\n\nsecond paragraph with enough text";
        let chunks = chunk_text(content, &cfg(34, 8));
        assert!(chunks.len() >= 2);
        let a = &chunks[0].text;
        let b = &chunks[1].text;
        let tail = &a[a.len().saturating_sub(8)..];
        assert!(b.starts_with(tail));
    }

    #[test]
    fn line_numbers_correct() {
        let content = "intro\n\nbody line\nmore body";
        let chunks = chunk_text(content, &cfg(100, 10));
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 4));
    }

    #[test]
    fn hash_is_deterministic() {
        let content = "hello chunk";
        let first = chunk_text(content, &cfg(100, 10));
        let second = chunk_text(content, &cfg(100, 10));
        assert_eq!(first[0].hash, second[0].hash);
    }

    #[test]
    fn hash_differs_for_different_content() {
        let a = chunk_text("hello", &cfg(100, 10));
        let b = chunk_text("world", &cfg(100, 10));
        assert_ne!(a[0].hash, b[0].hash);
    }

    #[test]
    fn default_config_values() {
        let config = ChunkerConfig::default();
        assert_eq!(config.target_size, 1000);
        assert_eq!(config.overlap_size, 200);
    }

    #[test]
    fn multibyte_content_does_not_panic() {
        let content = "héllo wörld ".repeat(50);
        let chunks = chunk_text(&content, &cfg(40, 10));
        assert!(!chunks.is_empty());
    }
}
