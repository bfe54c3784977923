//! Word-budget text chunker.
//!
//! Splits a document into chunks of approximately `target_words` words with
//! `overlap_words` of tail-head overlap between consecutive chunks. Cut
//! points prefer paragraph boundaries, then sentence boundaries, then plain
//! word boundaries, searched backward within a slack window from the word
//! budget.
//!
//! The output is an ordered, finite sequence of `(chunk_index, text,
//! byte_range)`. Deterministic: the same input and parameters always yield
//! the same sequence.

/// One chunk of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub chunk_index: i64,
    pub text: String,
    /// Byte range of this chunk within the original text. Consecutive
    /// ranges overlap by roughly `overlap_words` words.
    pub byte_range: (usize, usize),
}

/// A word with its byte offsets and the boundary preceding it.
#[derive(Debug, Clone, Copy)]
struct Word {
    start: usize,
    end: usize,
    /// Quality of a cut placed immediately before this word.
    boundary: Boundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Boundary {
    Word,
    Sentence,
    Paragraph,
}

/// Fraction of the word budget searched backward for a good boundary.
const SLACK: f64 = 0.25;

/// Split text into overlapping chunks bounded by a target word count.
pub fn chunk_text(text: &str, target_words: usize, overlap_words: usize) -> Vec<ChunkPiece> {
    let target_words = target_words.max(1);
    // Overlap below target keeps the walk strictly advancing.
    let overlap_words = overlap_words.min(target_words.saturating_sub(1));

    let words = tokenize(text);
    if words.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut chunk_index: i64 = 0;

    while start < words.len() {
        let ideal_end = (start + target_words).min(words.len());
        let end = if ideal_end == words.len() {
            ideal_end
        } else {
            best_cut(&words, start, ideal_end, target_words)
        };

        let byte_start = words[start].start;
        let byte_end = words[end - 1].end;
        chunks.push(ChunkPiece {
            chunk_index,
            text: text[byte_start..byte_end].to_string(),
            byte_range: (byte_start, byte_end),
        });
        chunk_index += 1;

        if end == words.len() {
            break;
        }
        // Tail-head overlap: the next chunk re-reads the last overlap_words.
        start = end.saturating_sub(overlap_words).max(start + 1);
    }

    chunks
}

/// Tokenize into words, recording the strongest boundary in the gap before
/// each word.
fn tokenize(text: &str) -> Vec<Word> {
    let mut words = Vec::new();
    let mut offset = 0;

    for (start, end) in split_keep_offsets(text) {
        let gap = &text[offset..start];
        let boundary = if gap.matches('\n').count() >= 2 {
            Boundary::Paragraph
        } else if text[..start]
            .trim_end()
            .ends_with(['.', '!', '?'])
        {
            Boundary::Sentence
        } else {
            Boundary::Word
        };
        words.push(Word {
            start,
            end,
            boundary,
        });
        offset = end;
    }

    words
}

/// Collect (start, end) byte offsets of each whitespace-separated word.
fn split_keep_offsets(text: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                out.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        out.push((s, text.len()));
    }
    out
}

/// Pick the cut index in `(start, ideal_end]` with the best boundary inside
/// the slack window, preferring paragraph over sentence over word.
fn best_cut(words: &[Word], start: usize, ideal_end: usize, target_words: usize) -> usize {
    let slack = ((target_words as f64 * SLACK) as usize).max(1);
    let window_start = ideal_end.saturating_sub(slack).max(start + 1);

    let mut best = ideal_end;
    let mut best_quality = Boundary::Word;
    for cut in (window_start..=ideal_end).rev() {
        if cut >= words.len() {
            continue;
        }
        let q = words[cut].boundary;
        if q > best_quality {
            best_quality = q;
            best = cut;
            if q == Boundary::Paragraph {
                break;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_count(s: &str) -> usize {
        s.split_whitespace().count()
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 1000, 200);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].byte_range, (0, 13));
    }

    #[test]
    fn empty_text_no_chunks() {
        assert!(chunk_text("", 1000, 200).is_empty());
        assert!(chunk_text("   \n\n  ", 1000, 200).is_empty());
    }

    #[test]
    fn chunks_respect_word_budget() {
        let text = (0..500)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 100, 20);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(word_count(&c.text) <= 100, "chunk too large: {}", word_count(&c.text));
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = (0..300)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 100, 20);
        for pair in chunks.windows(2) {
            // The next chunk starts before the previous one ends.
            assert!(pair[1].byte_range.0 < pair[0].byte_range.1);
            let tail: Vec<&str> = pair[0].text.split_whitespace().rev().take(5).collect();
            for w in tail {
                assert!(pair[1].text.contains(w));
            }
        }
    }

    #[test]
    fn prefers_paragraph_boundary() {
        // 90 words, then a paragraph break, then more words. With a target
        // of 100 the cut should land on the paragraph break.
        let first: String = (0..90).map(|i| format!("alpha{} ", i)).collect();
        let second: String = (0..90).map(|i| format!("beta{} ", i)).collect();
        let text = format!("{}\n\n{}", first.trim(), second.trim());
        let chunks = chunk_text(&text, 100, 0);
        assert!(chunks.len() >= 2);
        assert_eq!(word_count(&chunks[0].text), 90);
        assert!(chunks[0].text.contains("alpha89"));
        assert!(!chunks[0].text.contains("beta0"));
    }

    #[test]
    fn prefers_sentence_boundary_when_no_paragraph() {
        let first: String = (0..95).map(|i| format!("alpha{} ", i)).collect();
        let second: String = (0..95).map(|i| format!("beta{} ", i)).collect();
        let text = format!("{}. {}", first.trim(), second.trim());
        let chunks = chunk_text(&text, 100, 0);
        assert!(chunks.len() >= 2);
        // First chunk ends at the sentence boundary (95 words).
        assert_eq!(word_count(&chunks[0].text), 95);
    }

    #[test]
    fn indices_are_contiguous() {
        let text = (0..400)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 50, 10);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta. Eta theta iota kappa.";
        let a = chunk_text(text, 5, 2);
        let b = chunk_text(text, 5, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn byte_ranges_slice_original_text() {
        let text = (0..300)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        for c in chunk_text(&text, 80, 15) {
            assert_eq!(&text[c.byte_range.0..c.byte_range.1], c.text);
        }
    }
}
