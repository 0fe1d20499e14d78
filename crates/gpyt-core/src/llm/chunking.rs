use crate::llm::{ChunkStream, StreamEvent};
use futures::channel::mpsc;

/// Split `text` into pieces of at most `chunk_chars` characters.
/// Never splits inside a UTF-8 code point.
pub fn split_chunks(text: &str, chunk_chars: usize) -> Vec<String> {
    let chunk_chars = chunk_chars.max(1);
    let mut chunks = Vec::with_capacity(text.len() / chunk_chars + 1);
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == chunk_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Turn a complete response into a stream, for providers that cannot stream.
pub fn chunked_stream(text: &str, chunk_chars: usize) -> ChunkStream {
    let (tx, rx) = mpsc::unbounded();
    for chunk in split_chunks(text, chunk_chars) {
        let _ = tx.unbounded_send(StreamEvent::TextDelta(chunk));
    }
    let _ = tx.unbounded_send(StreamEvent::Done);
    rx
}
