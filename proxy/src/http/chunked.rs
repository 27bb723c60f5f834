//! `Transfer-Encoding: chunked` codec
//!
//! Each chunk is `<hex len>\r\n<bytes>\r\n`; a zero-length chunk followed by
//! an (optionally empty) trailer section terminates the body.

use memchr::memmem;

use crate::error::HttpError;

/// The zero-length chunk that ends a chunked body
pub const TERMINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frame one chunk. Empty payloads produce no bytes, since an empty chunk
/// would terminate the transfer early.
pub fn encode_chunk(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

/// Decode a complete chunked body from the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed, otherwise the decoded body
/// and the number of input bytes consumed (trailers included).
pub fn decode_chunked(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, HttpError> {
    decode_chunked_within(buf, usize::MAX)
}

/// [`decode_chunked`] with an upper bound on the decoded body size
pub fn decode_chunked_within(
    buf: &[u8],
    limit: usize,
) -> Result<Option<(Vec<u8>, usize)>, HttpError> {
    let mut body = Vec::new();
    let mut pos = 0usize;

    loop {
        let Some(line_len) = memmem::find(&buf[pos..], b"\r\n") else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&buf[pos..pos + line_len])
            .map_err(|_| HttpError::BadChunk("non-utf8 size line".to_string()))?;
        let size_field = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| HttpError::BadChunk(format!("bad chunk size '{}'", size_field)))?;
        pos += line_len + 2;

        if size == 0 {
            // Trailer section: header lines until an empty line
            loop {
                let Some(trailer_len) = memmem::find(&buf[pos..], b"\r\n") else {
                    return Ok(None);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }

        if body.len().saturating_add(size) > limit {
            return Err(HttpError::BodyTooLarge(limit));
        }
        let end = pos
            .checked_add(size)
            .and_then(|n| n.checked_add(2))
            .ok_or_else(|| HttpError::BadChunk(format!("chunk size '{}' out of range", size_field)))?;
        if buf.len() < end {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size;
        if &buf[pos..pos + 2] != b"\r\n" {
            return Err(HttpError::BadChunk("missing CRLF after chunk data".to_string()));
        }
        pos += 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_chunk_prefix() {
        assert_eq!(encode_chunk(b"hello"), b"5\r\nhello\r\n".to_vec());
        assert_eq!(encode_chunk(&[0u8; 26])[..4], *b"1a\r\n");
        assert!(encode_chunk(b"").is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        assert!(decode_chunked(b"5\r\nhel").unwrap().is_none());
        assert!(decode_chunked(b"5\r\nhello\r\n").unwrap().is_none());
        assert!(decode_chunked(b"5\r\nhello\r\n0\r\n").unwrap().is_none());
    }

    #[test]
    fn test_decode_with_extension_and_trailer() {
        let raw = b"3;ext=1\r\nabc\r\n0\r\nX-Trailer: yes\r\n\r\nGET";
        let (body, used) = decode_chunked(raw).unwrap().unwrap();
        assert_eq!(body, b"abc");
        assert_eq!(&raw[used..], b"GET");
    }

    #[test]
    fn test_decode_rejects_oversized_chunk() {
        let raw = b"ffffffffffffffff\r\nabc";
        assert!(matches!(decode_chunked(raw), Err(HttpError::BadChunk(_))));
        assert!(matches!(
            decode_chunked_within(raw, 1024),
            Err(HttpError::BodyTooLarge(1024))
        ));
        assert!(matches!(
            decode_chunked_within(b"3\r\nabc\r\n3\r\ndef\r\n", 4),
            Err(HttpError::BodyTooLarge(4))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_chunked(b"zz\r\n").is_err());
        assert!(decode_chunked(b"2\r\nabXY").is_err());
    }

    proptest! {
        #[test]
        fn chunked_round_trip(pieces in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64), 0..16)
        ) {
            let mut wire = Vec::new();
            for piece in &pieces {
                wire.extend(encode_chunk(piece));
            }
            wire.extend_from_slice(TERMINAL_CHUNK);

            let (body, used) = decode_chunked(&wire).unwrap().unwrap();
            prop_assert_eq!(body, pieces.concat());
            prop_assert_eq!(used, wire.len());
            prop_assert!(wire.ends_with(TERMINAL_CHUNK));
        }
    }
}
