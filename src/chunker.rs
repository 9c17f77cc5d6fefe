//! Markdown chunking.
//!
//! Splits one document into an ordered sequence of overlapping text
//! fragments, each carrying its source path and the nearest preceding
//! heading. Chunk order is the contract the rest of the system builds on:
//! a chunk's position in the returned sequence is its `chunk_index`, which
//! feeds the ID derivation in `identity`.

use serde::{Deserialize, Serialize};

/// Default maximum chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between adjacent chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Metadata attached to every chunk and persisted with the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Absolute path of the source file.
    pub file_path: String,
    /// Nearest Markdown heading at or above the chunk's first line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub metadata: ChunkMeta,
}

pub trait Chunker: Send + Sync {
    /// Split `content` into ordered chunks for the file at `file_path`.
    fn chunk(&self, file_path: &str, content: &str) -> Vec<Chunk>;
}

/// Line-based Markdown splitter with heading tracking.
pub struct MarkdownChunker {
    chunk_size: usize,
    overlap: usize,
}

impl Default for MarkdownChunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl MarkdownChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        // Overlap must leave room for forward progress.
        let overlap = overlap.min(chunk_size / 2);
        Self {
            chunk_size: chunk_size.max(1),
            overlap,
        }
    }

    fn heading_text(line: &str) -> Option<String> {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#') {
            return None;
        }
        let stripped = trimmed.trim_start_matches('#');
        // ATX headings require whitespace after the marker run.
        if stripped.is_empty() || stripped.starts_with(char::is_whitespace) {
            Some(stripped.trim().to_string()).filter(|s| !s.is_empty())
        } else {
            None
        }
    }
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, file_path: &str, content: &str) -> Vec<Chunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        // Precompute the heading in effect at each line.
        let lines: Vec<&str> = content.lines().collect();
        let mut sections: Vec<Option<String>> = Vec::with_capacity(lines.len());
        let mut current: Option<String> = None;
        for line in &lines {
            if let Some(heading) = Self::heading_text(line) {
                current = Some(heading);
            }
            sections.push(current.clone());
        }

        let mut chunks = Vec::new();
        let mut chunk_lines: Vec<&str> = Vec::new();
        let mut chunk_start = 0usize;
        let mut current_chars = 0usize;

        let emit = |chunk_lines: &[&str], start: usize, chunks: &mut Vec<Chunk>| {
            let text = chunk_lines.join("\n");
            if text.trim().is_empty() {
                return;
            }
            chunks.push(Chunk {
                text,
                metadata: ChunkMeta {
                    file_path: file_path.to_string(),
                    section: sections[start].clone(),
                },
            });
        };

        for &line in &lines {
            let line_chars = line.chars().count() + 1;

            if current_chars + line_chars > self.chunk_size && !chunk_lines.is_empty() {
                emit(&chunk_lines, chunk_start, &mut chunks);

                // Back up by up to `overlap` characters, whole lines at a time.
                let mut overlap_chars = 0usize;
                let mut keep_from = chunk_lines.len();
                for (j, kept) in chunk_lines.iter().enumerate().rev() {
                    overlap_chars += kept.chars().count() + 1;
                    if overlap_chars > self.overlap {
                        break;
                    }
                    keep_from = j;
                }

                chunk_start += keep_from;
                chunk_lines.drain(..keep_from);
                current_chars = chunk_lines.iter().map(|l| l.chars().count() + 1).sum();
            }

            chunk_lines.push(line);
            current_chars += line_chars;
        }

        if !chunk_lines.is_empty() {
            emit(&chunk_lines, chunk_start, &mut chunks);
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_all(content: &str) -> Vec<Chunk> {
        MarkdownChunker::default().chunk("/docs/a.md", content)
    }

    #[test]
    fn small_document_is_one_chunk() {
        let chunks = chunk_all("# Hello\n\nWorld.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "# Hello\n\nWorld.");
        assert_eq!(chunks[0].metadata.file_path, "/docs/a.md");
        assert_eq!(chunks[0].metadata.section.as_deref(), Some("Hello"));
    }

    #[test]
    fn empty_and_blank_content_produce_nothing() {
        assert!(chunk_all("").is_empty());
        assert!(chunk_all("   \n\n  ").is_empty());
    }

    #[test]
    fn long_document_splits_with_overlap() {
        let body: String = (0..200)
            .map(|i| format!("line {i} with some padding text"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = MarkdownChunker::new(300, 60).chunk("/docs/b.md", &body);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 300 + 40);
        }
        // Adjacent chunks share their boundary lines.
        let first_tail = chunks[0].text.lines().last().unwrap();
        assert!(chunks[1].text.contains(first_tail));
    }

    #[test]
    fn section_tracks_the_nearest_preceding_heading() {
        let doc = format!(
            "# Intro\n{}\n## Details\n{}",
            "intro text. ".repeat(60),
            "detail text. ".repeat(60)
        );
        let chunks = MarkdownChunker::new(200, 0).chunk("/docs/c.md", &doc);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].metadata.section.as_deref(), Some("Intro"));
        assert_eq!(
            chunks.last().unwrap().metadata.section.as_deref(),
            Some("Details")
        );
    }

    #[test]
    fn text_before_any_heading_has_no_section() {
        let chunks = chunk_all("plain preamble\n\n# Later");
        assert_eq!(chunks[0].metadata.section, None);
    }

    #[test]
    fn hash_without_space_is_not_a_heading() {
        let chunks = chunk_all("#hashtag but not a heading");
        assert_eq!(chunks[0].metadata.section, None);
    }
}
