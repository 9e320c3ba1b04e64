//! Frame codec for the PPC wire protocol.
//!
//! Frame format:
//! ```text
//! ┌───────────┬──────────┬────────────────────────┐
//! │ opcode(1B)│ len (4B) │   payload (len bytes)  │
//! │ u8        │ u32 BE   │                        │
//! └───────────┴──────────┴────────────────────────┘
//! ```
//! `len` counts payload bytes only and never exceeds [`MAX_PAYLOAD`].

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind, Read, Write};

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 8 * 1024;

/// Size of the opcode byte plus the length prefix.
pub const HEADER_LEN: usize = 5;

/// One decoded PPC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Bytes,
}

/// Read one frame from the stream.
///
/// Returns `None` on clean EOF (zero bytes before the opcode). A stream that
/// ends inside a frame, or announces more than `max_payload` bytes, is an
/// `InvalidData` error.
pub fn read_frame<R: Read>(reader: &mut R, max_payload: usize) -> io::Result<Option<Frame>> {
    let mut opcode = [0u8; 1];
    loop {
        match reader.read(&mut opcode) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let mut len_buf = [0u8; 4];
    read_exact_in_frame(reader, &mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut payload = vec![0u8; len];
    read_exact_in_frame(reader, &mut payload)?;

    Ok(Some(Frame {
        opcode: opcode[0],
        payload: Bytes::from(payload),
    }))
}

fn read_exact_in_frame<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            io::Error::new(ErrorKind::InvalidData, "truncated frame")
        } else {
            e
        }
    })
}

/// Encode a frame into a single buffer.
pub fn encode_frame(opcode: u8, payload: &[u8]) -> io::Result<Bytes> {
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("payload too large: {} bytes", payload.len()),
        ));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(opcode);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write one frame to the stream with a single `write_all`.
pub fn write_frame<W: Write>(writer: &mut W, opcode: u8, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(opcode, payload)?;
    writer.write_all(&frame)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_layout_is_opcode_then_length() {
        let wire = encode_frame(0x05, b"abc").unwrap();
        assert_eq!(&wire[..], &[0x05, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn empty_stream_is_clean_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor, MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn consecutive_frames_are_read_in_order() {
        let mut wire = Vec::new();
        write_frame(&mut wire, 1, b"").unwrap();
        write_frame(&mut wire, 2, b"second").unwrap();

        let mut cursor = Cursor::new(wire);
        let first = read_frame(&mut cursor, MAX_PAYLOAD).unwrap().unwrap();
        let second = read_frame(&mut cursor, MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(first.opcode, 1);
        assert!(first.payload.is_empty());
        assert_eq!(second.opcode, 2);
        assert_eq!(&second.payload[..], b"second");
        assert!(read_frame(&mut cursor, MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_invalid_data() {
        let mut cursor = Cursor::new(vec![1u8, 0, 0]);
        let err = read_frame(&mut cursor, MAX_PAYLOAD).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_payload_is_invalid_data() {
        let mut cursor = Cursor::new(vec![1u8, 0, 0, 0, 10, b'x']);
        let err = read_frame(&mut cursor, MAX_PAYLOAD).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let mut cursor = Cursor::new(vec![1u8, 0xFF, 0xFF, 0xFF, 0xFF]);
        let err = read_frame(&mut cursor, MAX_PAYLOAD).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn oversized_payload_is_not_encoded() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        let err = encode_frame(1, &payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
