//! Token-budgeted chunkers for session transcripts and documents.
//!
//! Both chunkers convert `max_tokens` to a character budget using a
//! 4 chars/token ratio (counted in `char`s, not bytes), accumulate whole units (messages or paragraphs)
//! until the next one would overflow, and hard-split any single unit that
//! is larger than the budget on its own.
//!
//! Every chunk carries a SHA-256 hash of its text and a [`ChunkLocation`]
//! pointing back at its origin.
//!
//! # Guarantees
//!
//! - No chunk is empty or whitespace-only.
//! - Empty input produces zero chunks.
//! - Splits never land inside a UTF-8 code point.
//!
//! # Example
//!
//! ```rust
//! use chat_kb_core::chunk::chunk_document;
//!
//! let chunks = chunk_document("Hello world.\n\nSecond paragraph.", 500, "file:///a.md", "a");
//! assert_eq!(chunks.len(), 1);
//! assert!(chunk_document("  \n\n ", 500, "file:///b.md", "b").is_empty());
//! ```

use sha2::{Digest, Sha256};

use crate::models::{ChunkLocation, Message, NewChunk};

/// Approximate characters-per-token ratio. Only batching efficiency depends
/// on it, so a real tokenizer is not needed.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// SHA-256 of `text`, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split a session transcript into chunks of consecutive messages.
///
/// Each message is rendered as `"<role>: <content>"`, one per line. A
/// chunk's location is the inclusive message index range it covers, with
/// the timestamps of its first and last message. Messages with blank
/// content are skipped.
pub fn chunk_session(messages: &[Message], max_tokens: usize) -> Vec<NewChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0;
    let mut range: Option<(usize, usize)> = None;

    for (index, message) in messages.iter().enumerate() {
        let content = message.content.trim();
        if content.is_empty() {
            continue;
        }
        let line = format!("{}: {}", message.role.as_str(), content);
        let line_chars = line.chars().count();

        if line_chars > max_chars {
            flush_messages(&mut chunks, &mut buf, &mut range, messages);
            buf_chars = 0;
            for piece in hard_split(&line, max_chars) {
                chunks.push(make_chunk(
                    piece,
                    message_location(messages, index, index),
                ));
            }
            continue;
        }

        let would_be = if buf.is_empty() {
            line_chars
        } else {
            buf_chars + 1 + line_chars
        };
        if would_be > max_chars {
            flush_messages(&mut chunks, &mut buf, &mut range, messages);
            buf_chars = 0;
        }

        if !buf.is_empty() {
            buf.push('\n');
            buf_chars += 1;
        }
        buf.push_str(&line);
        buf_chars += line_chars;
        range = Some(match range {
            Some((first, _)) => (first, index),
            None => (index, index),
        });
    }

    flush_messages(&mut chunks, &mut buf, &mut range, messages);
    chunks
}

fn flush_messages(
    chunks: &mut Vec<NewChunk>,
    buf: &mut String,
    range: &mut Option<(usize, usize)>,
    messages: &[Message],
) {
    if let Some((first, last)) = range.take() {
        if !buf.trim().is_empty() {
            chunks.push(make_chunk(buf.trim(), message_location(messages, first, last)));
        }
    }
    buf.clear();
}

fn message_location(messages: &[Message], first: usize, last: usize) -> ChunkLocation {
    ChunkLocation::Messages {
        first_message: first,
        last_message: last,
        started_at: messages[first].timestamp,
        ended_at: messages[last].timestamp,
    }
}

/// Split document text into chunks on paragraph (`\n\n`) boundaries.
///
/// Locations carry `url` and a 1-based section label `"<title> §<n>"`.
pub fn chunk_document(text: &str, max_tokens: usize, url: &str, title: &str) -> Vec<NewChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces: Vec<String> = Vec::new();
    let mut current_buf = String::new();
    let mut current_chars = 0;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        let para_chars = trimmed.chars().count();

        let would_be = if current_buf.is_empty() {
            para_chars
        } else {
            current_chars + 2 + para_chars
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
            current_chars = 0;
        }

        if para_chars > max_chars {
            pieces.extend(hard_split(trimmed, max_chars).into_iter().map(str::to_string));
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
                current_chars += 2;
            }
            current_buf.push_str(trimmed);
            current_chars += para_chars;
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| {
            make_chunk(
                piece,
                ChunkLocation::Document {
                    url: url.to_string(),
                    label: format!("{} §{}", title, i + 1),
                },
            )
        })
        .collect()
}

/// Hard-split `text` into pieces of at most `max_chars` chars, preferring
/// the last newline, then the last space, inside each window.
fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        // Byte offset just past the first `max_chars` chars.
        let mut split_at = remaining
            .char_indices()
            .nth(max_chars)
            .map_or(remaining.len(), |(i, _)| i);
        if split_at < remaining.len() {
            let window = &remaining[..split_at];
            if let Some(pos) = window.rfind('\n').or_else(|| window.rfind(' ')) {
                split_at = pos + 1;
            }
        }

        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = &remaining[split_at..];
    }

    pieces
}

fn make_chunk(text: &str, location: ChunkLocation) -> NewChunk {
    NewChunk {
        content: text.to_string(),
        location,
        token_count: estimate_tokens(text),
        hash: content_hash(text),
    }
}
