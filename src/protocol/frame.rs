//! Frame layout shared by every message on the wire.
//!
//! ```text
//! 0      2       3      4            8          10         12           16
//! +------+-------+------+------------+----------+----------+------------+---------+-------+
//! |magic |version| kind | seq/req id | frag idx | frag cnt | payload len| payload | crc32 |
//! +------+-------+------+------------+----------+----------+------------+---------+-------+
//! ```
//!
//! All integers are big-endian. The CRC-32 covers header and payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Result, TransferError};

pub const MAGIC: u16 = 0x534C;
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;
pub const TRAILER_LEN: usize = 4;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = 60_000;

/// Message kind carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ImageFragment,
    ParameterRequest,
    ParameterResponse,
    Heartbeat,
    HeartbeatAck,
    Hello,
    HelloAck,
    Reject,
}

impl MessageKind {
    pub fn to_u8(self) -> u8 {
        match self {
            MessageKind::ImageFragment => 1,
            MessageKind::ParameterRequest => 2,
            MessageKind::ParameterResponse => 3,
            MessageKind::Heartbeat => 4,
            MessageKind::HeartbeatAck => 5,
            MessageKind::Hello => 6,
            MessageKind::HelloAck => 7,
            MessageKind::Reject => 8,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::ImageFragment),
            2 => Some(MessageKind::ParameterRequest),
            3 => Some(MessageKind::ParameterResponse),
            4 => Some(MessageKind::Heartbeat),
            5 => Some(MessageKind::HeartbeatAck),
            6 => Some(MessageKind::Hello),
            7 => Some(MessageKind::HelloAck),
            8 => Some(MessageKind::Reject),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    /// Image sequence number or parameter request id
    pub id: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Single-fragment frame.
    pub fn new(kind: MessageKind, id: u32, payload: impl Into<Bytes>) -> Self {
        Self { kind, id, fragment_index: 0, fragment_count: 1, payload: payload.into() }
    }

    /// Frame without payload, used for heartbeats and their acks.
    pub fn control(kind: MessageKind, id: u32) -> Self {
        Self::new(kind, id, Bytes::new())
    }

    pub fn hello(protocol_version: u8) -> Self {
        Self::new(MessageKind::Hello, 0, vec![protocol_version])
    }

    pub fn reject(reason: &str) -> Self {
        Self::new(MessageKind::Reject, 0, reason.as_bytes().to_vec())
    }

    /// Protocol version carried by Hello and HelloAck frames.
    pub fn protocol_version(&self) -> Option<u8> {
        match self.kind {
            MessageKind::Hello | MessageKind::HelloAck => self.payload.first().copied(),
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + TRAILER_LEN
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransferError::malformed(format!(
                "payload of {} bytes exceeds {}",
                self.payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        if self.fragment_count == 0 || self.fragment_index >= self.fragment_count {
            return Err(TransferError::malformed(format!(
                "fragment {}/{} is inconsistent",
                self.fragment_index, self.fragment_count
            )));
        }

        dst.reserve(self.encoded_len());
        let start = dst.len();
        dst.put_u16(MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.kind.to_u8());
        dst.put_u32(self.id);
        dst.put_u16(self.fragment_index);
        dst.put_u16(self.fragment_count);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        let crc = crc32fast::hash(&dst[start..]);
        dst.put_u32(crc);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Header fields, validated except for the checksum.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub kind: MessageKind,
    pub id: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload_len: usize,
}

impl Header {
    /// Parse and validate a header from at least [`HEADER_LEN`] bytes.
    pub(crate) fn parse(mut buf: &[u8]) -> Result<Self> {
        let magic = buf.get_u16();
        if magic != MAGIC {
            return Err(TransferError::malformed(format!("bad magic 0x{magic:04X}")));
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransferError::malformed(format!("unsupported frame version {version}")));
        }
        let kind_byte = buf.get_u8();
        let kind = MessageKind::from_u8(kind_byte)
            .ok_or_else(|| TransferError::malformed(format!("unknown message kind {kind_byte}")))?;
        let id = buf.get_u32();
        let fragment_index = buf.get_u16();
        let fragment_count = buf.get_u16();
        let payload_len = buf.get_u32() as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TransferError::malformed(format!(
                "declared payload of {payload_len} bytes exceeds {MAX_PAYLOAD_SIZE}"
            )));
        }
        if fragment_count == 0 || fragment_index >= fragment_count {
            return Err(TransferError::malformed(format!(
                "fragment {fragment_index}/{fragment_count} is inconsistent"
            )));
        }

        Ok(Self { kind, id, fragment_index, fragment_count, payload_len })
    }

    pub(crate) fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len + TRAILER_LEN
    }
}

/// Verify the checksum of a complete encoded frame and build the [`Frame`].
pub(crate) fn finish_frame(header: Header, encoded: Bytes) -> Result<Frame> {
    let body_end = HEADER_LEN + header.payload_len;
    let expected = (&encoded[body_end..]).get_u32();
    let actual = crc32fast::hash(&encoded[..body_end]);
    if expected != actual {
        return Err(TransferError::malformed(format!(
            "checksum mismatch (expected 0x{expected:08X}, computed 0x{actual:08X})"
        )));
    }
    Ok(Frame {
        kind: header.kind,
        id: header.id,
        fragment_index: header.fragment_index,
        fragment_count: header.fragment_count,
        payload: encoded.slice(HEADER_LEN..body_end),
    })
}

/// Decode exactly one frame from a datagram.
pub fn decode_datagram(datagram: &[u8]) -> Result<Frame> {
    if datagram.len() < HEADER_LEN + TRAILER_LEN {
        return Err(TransferError::malformed(format!(
            "datagram of {} bytes is truncated",
            datagram.len()
        )));
    }
    let header = Header::parse(datagram)?;
    if header.frame_len() != datagram.len() {
        return Err(TransferError::malformed(format!(
            "datagram length {} does not match frame length {}",
            datagram.len(),
            header.frame_len()
        )));
    }
    finish_frame(header, Bytes::copy_from_slice(datagram))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_u8() {
        for code in 1..=8u8 {
            assert_eq!(MessageKind::from_u8(code).map(MessageKind::to_u8), Some(code));
        }
        assert_eq!(MessageKind::from_u8(0), None);
        assert_eq!(MessageKind::from_u8(9), None);
    }

    #[test]
    fn header_layout_is_big_endian() {
        let frame = Frame {
            kind: MessageKind::ImageFragment,
            id: 0x01020304,
            fragment_index: 2,
            fragment_count: 5,
            payload: Bytes::from_static(b"abc"),
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x53, 0x4C, PROTOCOL_VERSION, 1]);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..12], &[0, 2, 0, 5]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 3]);
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(decode_datagram(&bytes).unwrap(), frame);
    }

    #[test]
    fn datagram_with_flipped_bit_fails_checksum() {
        let mut bytes = Frame::hello(PROTOCOL_VERSION).to_bytes().unwrap().to_vec();
        bytes[HEADER_LEN] ^= 0x01;
        let err = decode_datagram(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn inconsistent_fragment_fields_are_rejected() {
        let mut frame = Frame::control(MessageKind::Heartbeat, 1);
        frame.fragment_index = 3;
        frame.fragment_count = 3;
        assert!(frame.to_bytes().is_err());
    }

    #[test]
    fn trailing_bytes_in_datagram_are_rejected() {
        let mut bytes = Frame::control(MessageKind::Heartbeat, 7).to_bytes().unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(decode_datagram(&bytes), Err(TransferError::MalformedFrame { .. })));
    }
}
