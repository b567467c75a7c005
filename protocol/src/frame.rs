//! Wire framing for the P3 line protocol (§6 of the protocol spec).
//!
//! Every frame on the wire starts with `MAGIC` and ends with `TERMINATOR`.
//! DATA frames (`TYPE_DATA`) carry a 2-byte ASCII token and a 16-bit
//! big-endian stream id ahead of their payload; short control frames
//! (`TYPE_ACK`) carry neither and are only ever emitted by the server.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

pub const MAGIC: u8 = 0x5A;
pub const TERMINATOR: u8 = 0x0D;
pub const TYPE_DATA: u8 = 0x20;
pub const TYPE_ACK: u8 = 0x24;

/// Bytes before the token in a DATA frame: magic, crc(2), len(2), tx, rx, type.
const DATA_PREFIX_LEN: usize = 8;
/// Bytes before the body in a DATA frame, including the 2-byte token.
const DATA_HEADER_LEN: usize = DATA_PREFIX_LEN + 2;

/// A decoded inbound DATA frame. `stream_id` and `payload` are the raw bytes
/// following the token; individual handlers interpret them per §4/§6 (e.g.
/// the chat handler treats the first two payload bytes as the stream id,
/// while `f2` treats the GID as living at payload offset 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub tx: u8,
    pub rx: u8,
    pub token: [u8; 2],
    pub body: Vec<u8>,
}

impl InboundFrame {
    pub fn token_str(&self) -> String {
        String::from_utf8_lossy(&self.token).into_owned()
    }
}

/// An outbound DATA frame awaiting TX/RX stamping by the pacer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub token: [u8; 2],
    pub body: Vec<u8>,
}

impl OutboundFrame {
    pub fn new(token: [u8; 2], body: Vec<u8>) -> Self {
        OutboundFrame { token, body }
    }

    /// Stamp CRC/length/TX/RX and serialize to wire bytes. Called by the
    /// pacer immediately before a frame is written to the socket.
    pub fn stamp(&self, tx: u8, rx: u8) -> Vec<u8> {
        let total_len = DATA_HEADER_LEN + self.body.len() + 1;
        let mut out = Vec::with_capacity(total_len);

        out.push(MAGIC);
        out.write_u16::<BigEndian>(0).expect("vec write is infallible");
        out.write_u16::<BigEndian>(total_len as u16)
            .expect("vec write is infallible");
        out.push(tx);
        out.push(rx);
        out.push(TYPE_DATA);
        out.extend_from_slice(&self.token);
        out.extend_from_slice(&self.body);
        out.push(TERMINATOR);

        let crc = crc16(&out[3..]);
        (&mut out[1..3])
            .write_u16::<BigEndian>(crc)
            .expect("slice write is infallible");

        out
    }
}

/// A short 5-byte control frame: `[MAGIC][0x00 0x03][type][TERMINATOR]`.
pub fn short_frame(ftype: u8) -> [u8; 5] {
    [MAGIC, 0x00, 0x03, ftype, TERMINATOR]
}

/// Result of attempting to pull one frame off the front of a connection's
/// read buffer.
pub enum ParseOutcome {
    /// A full frame was parsed; `consumed` bytes should be dropped from the
    /// front of the buffer.
    Frame { frame: InboundFrame, consumed: usize },
    /// Not enough bytes buffered yet for even a length field.
    Incomplete,
    /// The frame is malformed (bad magic, missing terminator, truncated
    /// header). The caller should log and drop the connection per §7
    /// ("unrecoverable codec failure").
    Corrupt,
}

/// Attempt to parse a single DATA frame from the front of `buf`.
///
/// Unknown frame types are tolerated by treating the frame generically:
/// only `MAGIC`/`TERMINATOR`/length are validated, matching §4.2's "protocol
/// tolerates unknowns" for the 2-byte token, not the envelope itself.
pub fn parse_frame(buf: &[u8]) -> ParseOutcome {
    if buf.len() < 5 {
        return ParseOutcome::Incomplete;
    }
    if buf[0] != MAGIC {
        return ParseOutcome::Corrupt;
    }

    let mut cursor = Cursor::new(&buf[3..5]);
    let len = match cursor.read_u16::<BigEndian>() {
        Ok(v) => v as usize,
        Err(_) => return ParseOutcome::Corrupt,
    };

    if len < DATA_HEADER_LEN + 1 {
        return ParseOutcome::Corrupt;
    }
    if buf.len() < len {
        return ParseOutcome::Incomplete;
    }
    if buf[len - 1] != TERMINATOR {
        return ParseOutcome::Corrupt;
    }

    let tx = buf[5];
    let rx = buf[6];
    let mut token = [0u8; 2];
    token.copy_from_slice(&buf[DATA_PREFIX_LEN..DATA_HEADER_LEN]);
    let body = buf[DATA_HEADER_LEN..len - 1].to_vec();

    ParseOutcome::Frame {
        frame: InboundFrame { tx, rx, token, body },
        consumed: len,
    }
}

/// CRC-16/CCITT-FALSE, computed over everything from the length field
/// onward (the crc field itself is excluded).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

pub fn read_stream_id(body: &[u8]) -> io::Result<u16> {
    if body.len() < 2 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Cursor::new(&body[..2]).read_u16::<BigEndian>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_roundtrips_through_parse() {
        let out = OutboundFrame::new(*b"Aa", b"hello".to_vec());
        let bytes = out.stamp(3, 7);

        match parse_frame(&bytes) {
            ParseOutcome::Frame { frame, consumed } => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(frame.tx, 3);
                assert_eq!(frame.rx, 7);
                assert_eq!(&frame.token, b"Aa");
                assert_eq!(frame.body, b"hello");
            }
            _ => panic!("expected a parsed frame"),
        }
    }

    #[test]
    fn incomplete_when_buffer_short() {
        let out = OutboundFrame::new(*b"Aa", b"hello".to_vec());
        let bytes = out.stamp(0, 0);
        assert!(matches!(
            parse_frame(&bytes[..bytes.len() - 2]),
            ParseOutcome::Incomplete
        ));
    }

    #[test]
    fn corrupt_on_bad_magic() {
        let mut bytes = OutboundFrame::new(*b"Aa", b"hi".to_vec()).stamp(0, 0);
        bytes[0] = 0x00;
        assert!(matches!(parse_frame(&bytes), ParseOutcome::Corrupt));
    }

    #[test]
    fn short_frame_has_fixed_shape() {
        assert_eq!(short_frame(TYPE_ACK), [MAGIC, 0x00, 0x03, TYPE_ACK, TERMINATOR]);
    }
}
