//! Sliding-window text chunker.
//!
//! Splits document body text into fixed-size [`Chunk`]s with a configured
//! overlap between consecutive windows, so that the ordered spans tile the
//! whole document. The final chunk may be shorter than the window.
//!
//! Each chunk receives a UUID, its character span within the document, and
//! a SHA-256 hash of its text for staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::IngestionError;
use crate::models::Chunk;

/// Split `text` into overlapping chunks of at most `size` characters, with
/// `overlap` characters shared between consecutive chunks.
///
/// Window positions advance by `size - overlap`, so concatenating the spans
/// in order reconstructs the document modulo the overlapping regions.
/// Spans are character offsets, never splitting a UTF-8 code point.
///
/// # Errors
///
/// [`IngestionError::EmptyDocument`] if `text` is empty, and
/// [`IngestionError::InvalidWindow`] unless `0 <= overlap < size`.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, IngestionError> {
    if size == 0 || overlap >= size {
        return Err(IngestionError::InvalidWindow { size, overlap });
    }
    if text.is_empty() {
        return Err(IngestionError::EmptyDocument);
    }

    // Byte offset of every character boundary, plus the end sentinel.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total_chars = boundaries.len() - 1;

    let stride = size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut ordinal: i64 = 0;

    loop {
        let end = (start + size).min(total_chars);
        let piece = &text[boundaries[start]..boundaries[end]];
        chunks.push(make_chunk(document_id, ordinal, start, end, piece));
        ordinal += 1;

        if end == total_chars {
            break;
        }
        start += stride;
    }

    Ok(chunks)
}

fn make_chunk(document_id: &str, ordinal: i64, start: usize, end: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        ordinal,
        start_char: start as i64,
        end_char: end as i64,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_document("doc1", "Hello, world!", 200, 50).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].start_char, 0);
        assert_eq!(chunks[0].end_char, 13);
    }

    #[test]
    fn test_empty_text_rejected() {
        let result = chunk_document("doc1", "", 200, 50);
        assert!(matches!(result, Err(IngestionError::EmptyDocument)));
    }

    #[test]
    fn test_invalid_window_rejected() {
        assert!(matches!(
            chunk_document("doc1", "text", 50, 50),
            Err(IngestionError::InvalidWindow { .. })
        ));
        assert!(matches!(
            chunk_document("doc1", "text", 0, 0),
            Err(IngestionError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_thousand_chars_size_200_overlap_50() {
        let text: String = std::iter::repeat('x').take(1000).collect();
        let chunks = chunk_document("doc1", &text, 200, 50).unwrap();

        assert_eq!(chunks.len(), 7);
        let starts: Vec<i64> = chunks.iter().map(|c| c.start_char).collect();
        assert_eq!(starts, vec![0, 150, 300, 450, 600, 750, 900]);
        assert_eq!(chunks[6].end_char, 1000);
        assert_eq!(chunks[6].text.len(), 100);
    }

    #[test]
    fn test_coverage_reconstructs_document() {
        let text: String = (0..937).map(|i| ((i % 26) as u8 + b'a') as char).collect();
        let size = 120;
        let overlap = 30;
        let chunks = chunk_document("doc1", &text, size, overlap).unwrap();

        // Dropping each chunk's leading overlap (except the first) and
        // concatenating must reproduce the original text exactly.
        let mut rebuilt = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let skip = if i == 0 { 0 } else { overlap };
            rebuilt.extend(chunk.text.chars().skip(skip));
        }
        assert_eq!(rebuilt, text);

        // Ordinals contiguous, spans monotone.
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal, i as i64);
            assert!(chunk.start_char < chunk.end_char);
        }
    }

    #[test]
    fn test_zero_overlap_tiles_exactly() {
        let text: String = std::iter::repeat('y').take(500).collect();
        let chunks = chunk_document("doc1", &text, 100, 0).unwrap();
        assert_eq!(chunks.len(), 5);
        for window in chunks.windows(2) {
            assert_eq!(window[0].end_char, window[1].start_char);
        }
    }

    #[test]
    fn test_multibyte_boundaries() {
        // 4 chars per snowman+space pair; spans must count chars, not bytes.
        let text = "☃ ".repeat(150);
        let chunks = chunk_document("doc1", &text, 100, 20).unwrap();
        assert!(chunks.len() > 1);
        let total: i64 = chunks.last().unwrap().end_char;
        assert_eq!(total, 300);
    }

    #[test]
    fn test_deterministic_hashes() {
        let text = "alpha beta gamma delta epsilon".repeat(20);
        let a = chunk_document("doc1", &text, 100, 25).unwrap();
        let b = chunk_document("doc1", &text, 100, 25).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.hash, y.hash);
            assert_eq!((x.start_char, x.end_char), (y.start_char, y.end_char));
        }
    }
}
