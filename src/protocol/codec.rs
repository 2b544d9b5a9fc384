//! Stream framing for TCP and in-memory transports.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{Frame, HEADER_LEN, Header, TRAILER_LEN, finish_frame};
use crate::TransferError;

/// Tokio codec turning a byte stream into [`Frame`]s and back.
///
/// Decoding fails with [`TransferError::MalformedFrame`] as soon as a header
/// is inconsistent, before waiting for the rest of the frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

impl WireCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = TransferError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = Header::parse(&src[..HEADER_LEN])?;
        let total_len = header.frame_len();

        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let encoded = src.split_to(total_len).freeze();
        finish_frame(header, encoded).map(Some)
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = TransferError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HEADER_LEN + item.payload.len() + TRAILER_LEN);
        item.encode(dst)
    }
}
