use crate::error::IngestError;
use crate::models::{Chunk, ChunkMetadata, KnowledgeDocument};
use regex::Regex;
use serde::{Deserialize, Serialize};

const SENTENCE_TERMINATORS: [char; 5] = ['.', '!', '?', '।', '॥'];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 600,
            overlap_chars: 100,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be greater than zero".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_chars ({}) must be smaller than max_chars ({})",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Paragraph,
    Line,
    Sentence,
    Whitespace,
}

const BOUNDARIES: [Boundary; 4] = [
    Boundary::Paragraph,
    Boundary::Line,
    Boundary::Sentence,
    Boundary::Whitespace,
];

/// Cleans extracted text without destroying paragraph and line structure,
/// which the splitter relies on.
pub fn normalize_text(text: &str) -> Result<String, IngestError> {
    let spaces = Regex::new(r"[ \t\u{a0}\u{200b}]+")?;
    let blank_lines = Regex::new(r"\n{3,}")?;

    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines = unified
        .lines()
        .map(|line| spaces.replace_all(line, " ").trim().to_string())
        .collect::<Vec<_>>()
        .join("\n");

    Ok(blank_lines.replace_all(&lines, "\n\n").trim().to_string())
}

/// Splits `text` into pieces of at most `max_chars` characters, preferring to
/// cut at paragraph, then line, then sentence, then whitespace boundaries and
/// falling back to a hard cut. Consecutive pieces share up to
/// `overlap_chars` characters of literal text.
pub fn split_text(text: &str, config: ChunkingConfig) -> Result<Vec<String>, IngestError> {
    config.validate()?;
    let chars: Vec<char> = text.chars().collect();

    Ok(split_spans(&chars, config)
        .into_iter()
        .map(|(start, end)| chars[start..end].iter().collect::<String>())
        .filter(|piece| !piece.trim().is_empty())
        .collect())
}

fn split_spans(chars: &[char], config: ChunkingConfig) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let hard_end = (start + config.max_chars).min(chars.len());
        if hard_end == chars.len() {
            spans.push((start, hard_end));
            break;
        }

        // Breaks before this point would either stall progress once the
        // overlap is subtracted or produce needlessly small pieces.
        let earliest = start + (config.overlap_chars + 1).max(config.max_chars / 2);
        let end = BOUNDARIES
            .iter()
            .find_map(|boundary| last_boundary(chars, earliest, hard_end, *boundary))
            .unwrap_or(hard_end);

        spans.push((start, end));
        start = next_start(chars, end, config.overlap_chars);
    }

    spans
}

/// Returns the largest split position `p` with `earliest <= p <= hard_end`
/// such that the text before `p` ends with the given boundary.
fn last_boundary(chars: &[char], earliest: usize, hard_end: usize, boundary: Boundary) -> Option<usize> {
    (earliest.max(1)..=hard_end).rev().find(|&position| match boundary {
        Boundary::Paragraph => position >= 2 && chars[position - 1] == '\n' && chars[position - 2] == '\n',
        Boundary::Line => chars[position - 1] == '\n',
        Boundary::Sentence => {
            position >= 2
                && chars[position - 1].is_whitespace()
                && SENTENCE_TERMINATORS.contains(&chars[position - 2])
        }
        Boundary::Whitespace => chars[position - 1].is_whitespace(),
    })
}

fn next_start(chars: &[char], end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }

    let candidate = end - overlap;
    // Start the overlap on a word boundary when the window contains one.
    (candidate + 1..end)
        .find(|&position| chars[position - 1].is_whitespace() && !chars[position].is_whitespace())
        .unwrap_or(candidate)
}

/// Turns one loaded document into chunks. Structured records stay whole.
pub fn build_chunks(document: &KnowledgeDocument, config: ChunkingConfig) -> Result<Vec<Chunk>, IngestError> {
    let normalized = normalize_text(&document.raw_text)?;
    if normalized.is_empty() {
        return Ok(Vec::new());
    }

    let pieces = if document.doc_type.is_structured() {
        vec![normalized]
    } else {
        split_text(&normalized, config)?
    };

    pieces
        .into_iter()
        .enumerate()
        .map(|(position, content)| {
            let metadata = ChunkMetadata::new(
                document.source_id.clone(),
                position,
                document.doc_type,
                document.extra.clone(),
            )?;
            Ok(Chunk { content, metadata })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocType;
    use proptest::prelude::*;

    fn long_document() -> String {
        let sentence = "Students from rural districts can apply for vocational training programs. ";
        let mut text = String::new();
        let mut paragraph = 0;
        while text.chars().count() < 3_000 {
            text.push_str(sentence);
            if text.len() / 400 > paragraph {
                paragraph += 1;
                text.push('\n');
            }
        }
        text.chars().take(3_000).collect()
    }

    #[test]
    fn text_is_normalized_but_keeps_paragraphs() {
        let input = "A  \t  lot\u{a0}of   spacing\r\n\r\n\r\n\nNext   paragraph";
        assert_eq!(
            normalize_text(input).expect("normalize"),
            "A lot of spacing\n\nNext paragraph"
        );
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let zero = ChunkingConfig { max_chars: 0, overlap_chars: 0 };
        let wide = ChunkingConfig { max_chars: 50, overlap_chars: 50 };
        assert!(matches!(zero.validate(), Err(IngestError::InvalidChunkConfig(_))));
        assert!(matches!(wide.validate(), Err(IngestError::InvalidChunkConfig(_))));
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let pieces = split_text("Short text", ChunkingConfig::default()).expect("split");
        assert_eq!(pieces, vec!["Short text".to_string()]);
    }

    #[test]
    fn three_thousand_chars_at_500_with_50_overlap() {
        let text = long_document();
        let chars: Vec<char> = text.chars().collect();
        let config = ChunkingConfig { max_chars: 500, overlap_chars: 50 };
        let spans = split_spans(&chars, config);

        assert!(spans.len() >= 6);
        assert_eq!(spans.first().map(|span| span.0), Some(0));
        assert_eq!(spans.last().map(|span| span.1), Some(chars.len()));

        for (start, end) in &spans {
            assert!(end - start <= 500, "chunk of {} chars", end - start);
        }
        let pieces = split_text(&text, config).expect("split");
        assert_eq!(pieces.len(), spans.len());
        for (index, pair) in spans.windows(2).enumerate() {
            let shared = pair[0].1 - pair[1].0;
            assert!((30..=50).contains(&shared), "overlap was {shared}");
            let head: String = pieces[index + 1].chars().take(shared).collect();
            assert!(pieces[index].ends_with(&head));
        }
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let first = "a".repeat(30);
        let second = "b ".repeat(20);
        let text = format!("{first}\n\n{second}");
        let config = ChunkingConfig { max_chars: 40, overlap_chars: 0 };
        let pieces = split_text(&text, config).expect("split");
        assert_eq!(pieces[0], format!("{first}\n\n"));
    }

    #[test]
    fn hard_cut_when_no_boundary_exists() {
        let text = "x".repeat(95);
        let config = ChunkingConfig { max_chars: 40, overlap_chars: 10 };
        let pieces = split_text(&text, config).expect("split");
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|piece| piece.chars().count() <= 40));
    }

    #[test]
    fn structured_records_are_not_split() {
        let record = "title: Java Developer\n".repeat(80);
        let document = KnowledgeDocument::new("careers.json", record, DocType::Career);
        let chunks = build_chunks(&document, ChunkingConfig { max_chars: 100, overlap_chars: 10 })
            .expect("chunks");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.source, "careers.json");
        assert_eq!(chunks[0].metadata.position, 0);
    }

    #[test]
    fn chunks_inherit_document_metadata_and_positions() {
        let document = KnowledgeDocument::new("guide.pdf", long_document(), DocType::Pdf).with_extra("page", 2);
        let chunks = build_chunks(&document, ChunkingConfig { max_chars: 500, overlap_chars: 50 })
            .expect("chunks");

        assert!(chunks.len() > 1);
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.position, index);
            assert_eq!(chunk.metadata.source, "guide.pdf");
            assert_eq!(chunk.metadata.get("page"), Some("2"));
        }
    }

    proptest! {
        #[test]
        fn spans_cover_text_within_budget(
            text in "[a-z .\n]{0,600}",
            max_chars in 10usize..120,
            overlap_ratio in 0usize..50,
        ) {
            let overlap_chars = max_chars * overlap_ratio / 100;
            let config = ChunkingConfig { max_chars, overlap_chars };
            let chars: Vec<char> = text.chars().collect();
            let spans = split_spans(&chars, config);

            if chars.is_empty() {
                prop_assert!(spans.is_empty());
            } else {
                prop_assert_eq!(spans[0].0, 0);
                prop_assert_eq!(spans[spans.len() - 1].1, chars.len());
            }
            for (start, end) in &spans {
                prop_assert!(end > start);
                prop_assert!(end - start <= max_chars);
            }
            for pair in spans.windows(2) {
                prop_assert!(pair[1].0 > pair[0].0);
                prop_assert!(pair[1].0 <= pair[0].1);
                prop_assert!(pair[0].1 - pair[1].0 <= overlap_chars);
            }
        }
    }
}
