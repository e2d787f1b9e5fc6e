
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Minimum length for a sentence fragment to be kept after splitting.
const MIN_SENTENCE_LEN: usize = 10;

/// A chunk of document text ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The chunk text.
    pub text: String,
    /// The index of this chunk within the document.
    pub index: usize,
    /// Total number of chunks produced from the document.
    pub total_chunks: usize,
}

/// Configuration for document chunking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    pub chunk_size: usize,
    /// Number of trailing characters carried into the next chunk.
    pub overlap_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap_size: 200,
        }
    }
}

/// Split cleaned document text into overlapping, sentence-respecting chunks.
///
/// Sentences are accumulated greedily up to `chunk_size` characters; each new
/// chunk is seeded with the trailing `overlap_size` characters of its
/// predecessor, trimmed back to a word boundary. A single sentence longer
/// than the target size is kept whole rather than split mid-sentence.
pub fn chunk_document(content: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let cleaned = clean_content(content);
    let sentences = split_into_sentences(&cleaned);

    let mut texts: Vec<String> = Vec::new();
    let mut current = String::new();

    for sentence in sentences {
        if current.len() + sentence.len() > config.chunk_size && !current.is_empty() {
            let overlap = overlap_seed(&current, config.overlap_size);
            texts.push(std::mem::take(&mut current));

            current = overlap;
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);
        }
    }

    if !current.trim().is_empty() {
        texts.push(current);
    }

    let total = texts.len();
    let chunks: Vec<Chunk> = texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            text: text.trim().to_string(),
            index,
            total_chunks: total,
        })
        .collect();

    debug!(
        "Chunked {} chars into {} chunks (target {} chars, overlap {})",
        cleaned.len(),
        chunks.len(),
        config.chunk_size,
        config.overlap_size
    );

    chunks
}

/// Normalize whitespace and strip characters outside a safe set.
fn clean_content(content: &str) -> String {
    let safe: String = content
        .chars()
        .map(|c| {
            if c.is_alphanumeric()
                || c.is_whitespace()
                || matches!(
                    c,
                    '.' | ',' | '!' | '?' | ';' | ':' | '-' | '(' | ')' | '[' | ']' | '"' | '\''
                )
            {
                c
            } else {
                ' '
            }
        })
        .collect();

    // Collapse runs of whitespace into single spaces.
    safe.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split content on sentence boundaries (`.`, `!`, `?` followed by
/// whitespace), discarding fragments under [`MIN_SENTENCE_LEN`] characters.
fn split_into_sentences(content: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let bytes = content.as_bytes();
    let mut start = 0;

    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?')
            && bytes.get(i + 1).is_some_and(|next| next.is_ascii_whitespace())
        {
            let sentence = content[start..=i].trim();
            if sentence.len() > MIN_SENTENCE_LEN {
                sentences.push(sentence);
            }
            start = i + 1;
        }
    }

    if start < content.len() {
        let tail = content[start..].trim();
        if tail.len() > MIN_SENTENCE_LEN {
            sentences.push(tail);
        }
    }

    sentences
}

/// Extract the overlap seed from the end of a closed chunk.
///
/// Takes the trailing `overlap_size` characters, then trims forward past the
/// nearest sentence ending or word boundary so the seed never starts
/// mid-word.
fn overlap_seed(chunk: &str, overlap_size: usize) -> String {
    if overlap_size == 0 {
        return String::new();
    }
    if chunk.len() <= overlap_size {
        return chunk.to_string();
    }

    let mut cut = chunk.len() - overlap_size;
    while cut < chunk.len() && !chunk.is_char_boundary(cut) {
        cut += 1;
    }
    let window = &chunk[cut..];

    // Prefer restarting after a sentence ending inside the window.
    for ending in [". ", "! ", "? "] {
        if let Some(pos) = window.rfind(ending) {
            return window[pos + ending.len()..].to_string();
        }
    }

    // Otherwise fall back to the nearest word boundary.
    if let Some(pos) = window.find(' ') {
        return window[pos + 1..].to_string();
    }

    window.to_string()
}
