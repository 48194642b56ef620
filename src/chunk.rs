//! Paragraph-boundary text chunker.
//!
//! Splits document text into bounded chunks on paragraph boundaries
//! (`\n\n`), hard-splitting oversized paragraphs at word boundaries.
//! Boundaries are deterministic: the same input always yields the same
//! chunk sequence, which keeps fingerprint-level dedup meaningful.

/// Split text into chunks of at most `max_chars` characters.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut chunks = Vec::new();
    let mut current_buf = String::new();

    for para in paragraphs {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len() // +2 for \n\n separator
        };

        if would_be > max_chars && !current_buf.is_empty() {
            chunks.push(std::mem::take(&mut current_buf));
        }

        // A single paragraph over the limit is hard-split at word boundaries
        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                chunks.push(std::mem::take(&mut current_buf));
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, remaining.len().min(max_chars));
                let mut actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                // A max_chars smaller than the first character still has to
                // make progress: take that one character, over budget or not.
                if actual_split == 0 {
                    actual_split = remaining
                        .chars()
                        .next()
                        .map_or(remaining.len(), |c| c.len_utf8());
                }
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    chunks.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        chunks.push(current_buf);
    }

    if chunks.is_empty() {
        chunks.push(text.trim().to_string());
    }

    chunks
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
