//! Rendezvous wire format.
//!
//! Each message is a 4-byte big-endian length followed by the payload.
//! Payloads are text; senders historically pad them with NUL bytes, so
//! receivers must strip trailing padding before comparing.

use std::io::{self, Read, Write};

use crate::error::HarnessError;

/// Maximum payload size of a single rendezvous frame.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), HarnessError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(HarnessError::Protocol(format!(
            "frame payload of {} bytes exceeds maximum {MAX_FRAME_PAYLOAD}",
            payload.len()
        )));
    }
    // Checked against MAX_FRAME_PAYLOAD above.
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns the raw payload including any padding.
///
/// A clean EOF before the header yields `UnexpectedEof`, which callers
/// report as the peer having gone away.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds maximum {MAX_FRAME_PAYLOAD}"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Decode a received payload: strip trailing NUL padding and surrounding
/// ASCII whitespace.
pub fn decode_payload(raw: &[u8]) -> Result<String, HarnessError> {
    let end = raw.iter().rposition(|b| *b != 0).map_or(0, |idx| idx + 1);
    let text = std::str::from_utf8(&raw[..end])
        .map_err(|e| HarnessError::Protocol(format!("payload is not UTF-8: {e}")))?;
    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_decode_strips_null_padding() {
        assert_eq!(decode_payload(b"10\0\0\0\0").unwrap(), "10");
        assert_eq!(decode_payload(b"4242\0").unwrap(), "4242");
        assert_eq!(decode_payload(b"\0\0").unwrap(), "");
        assert_eq!(decode_payload(b"").unwrap(), "");
    }

    #[test]
    fn test_decode_keeps_interior_nul() {
        // Only trailing padding is stripped.
        assert_eq!(decode_payload(b"a\0b\0").unwrap(), "a\0b");
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let err = decode_payload(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
    }

    #[test]
    fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"8").unwrap();
        assert_eq!(buf, vec![0, 0, 0, 1, b'8']);
    }

    #[test]
    fn test_empty_frame_is_an_acknowledgement() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"").unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_LEN);
        let payload = read_frame(&mut Cursor::new(buf)).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_oversized_frames_rejected_both_ways() {
        let big = vec![b'x'; MAX_FRAME_PAYLOAD + 1];
        assert!(write_frame(&mut Vec::new(), &big).is_err());

        let mut forged = ((MAX_FRAME_PAYLOAD + 1) as u32).to_be_bytes().to_vec();
        forged.extend_from_slice(b"xx");
        let err = read_frame(&mut Cursor::new(forged)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame_is_eof() {
        let err = read_frame(&mut Cursor::new(vec![0, 0, 0, 5, b'a'])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
