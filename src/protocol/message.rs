//! Parameter channel messages, serialized with bincode.
//!
//! Requests always fit one frame. Responses larger than one frame payload,
//! typically full listings, are split into fragments sharing the request id
//! and rebuilt by [`ResponseAssembler`].

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::frame::{Frame, MAX_PAYLOAD_SIZE, MessageKind};
use crate::types::{ParameterDescriptor, ParameterValue};
use crate::{Result, TransferError};

/// Request id used for responses the device sends unprompted.
pub const UNSOLICITED_REQUEST_ID: u32 = 0;

/// Fragmented responses tracked at once before the oldest are dropped.
const MAX_PARTIAL_RESPONSES: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterOp {
    Get { id: String },
    Set { id: String, value: ParameterValue },
    List,
    /// Apply every write or none of them
    Batch { writes: Vec<(String, ParameterValue)> },
    /// Store current values so they survive a device restart
    Persist { ids: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRequest {
    pub request_id: u32,
    pub op: ParameterOp,
}

/// Failure categories a device reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    UnknownParameter,
    NotWritable,
    ValueOutOfRange,
    TypeMismatch,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Descriptor(ParameterDescriptor),
    Listing(Vec<ParameterDescriptor>),
    /// Write applied, carrying the updated descriptor
    Ack(ParameterDescriptor),
    Error { kind: RemoteErrorKind, id: String, message: String },
    /// Pushed by the device when a value changes outside this client
    Update(ParameterDescriptor),
    /// Batch applied, carrying every updated descriptor
    BatchAck(Vec<ParameterDescriptor>),
    Persisted(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterResponse {
    pub request_id: u32,
    pub body: ResponseBody,
}

impl ParameterRequest {
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(MessageKind::ParameterRequest, self.request_id, bincode::serialize(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        expect_kind(frame, MessageKind::ParameterRequest)?;
        let request: ParameterRequest = decode_body(&frame.payload)?;
        check_request_id(frame, request.request_id)?;
        Ok(request)
    }
}

impl ParameterResponse {
    pub fn is_unsolicited(&self) -> bool {
        self.request_id == UNSOLICITED_REQUEST_ID
    }

    /// Encode into a single frame; fails if the body exceeds one payload.
    pub fn to_frame(&self) -> Result<Frame> {
        let mut frames = self.to_frames(MAX_PAYLOAD_SIZE)?;
        match frames.len() {
            1 => Ok(frames.remove(0)),
            n => Err(TransferError::malformed(format!(
                "parameter response {} needs {n} frames",
                self.request_id
            ))),
        }
    }

    /// Encode into as many frames as needed, each carrying at most
    /// `max_payload` bytes.
    pub fn to_frames(&self, max_payload: usize) -> Result<Vec<Frame>> {
        let max_payload = max_payload.clamp(1, MAX_PAYLOAD_SIZE);
        let body = Bytes::from(bincode::serialize(self)?);
        let count = body.len().div_ceil(max_payload).max(1);
        let fragment_count = u16::try_from(count).map_err(|_| {
            TransferError::malformed(format!(
                "parameter response of {} bytes needs {count} fragments",
                body.len()
            ))
        })?;

        let frames = (0..fragment_count)
            .map(|index| {
                let start = index as usize * max_payload;
                let end = (start + max_payload).min(body.len());
                Frame {
                    kind: MessageKind::ParameterResponse,
                    id: self.request_id,
                    fragment_index: index,
                    fragment_count,
                    payload: body.slice(start..end),
                }
            })
            .collect();
        Ok(frames)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        expect_kind(frame, MessageKind::ParameterResponse)?;
        Self::decode(frame.id, &frame.payload)
    }

    fn decode(frame_id: u32, payload: &[u8]) -> Result<Self> {
        let response: ParameterResponse = decode_body(payload)?;
        if response.request_id != frame_id {
            return Err(id_mismatch(frame_id, response.request_id));
        }
        Ok(response)
    }
}

#[derive(Debug)]
struct PartialResponse {
    fragments: Vec<Option<Bytes>>,
    received: u16,
}

/// Rebuilds parameter responses split over several frames.
///
/// Fragments of different requests may interleave; each request id is
/// assembled independently.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    partial: HashMap<u32, PartialResponse>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Responses still missing fragments.
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }

    /// Drop all partial responses, e.g. after the link was lost.
    pub fn reset(&mut self) {
        self.partial.clear();
    }

    /// Feed one response frame. Returns the response once all of its
    /// fragments arrived.
    pub fn push(&mut self, frame: Frame) -> Result<Option<ParameterResponse>> {
        if frame.kind != MessageKind::ParameterResponse {
            return Err(TransferError::malformed(format!(
                "{:?} frame fed to response assembler",
                frame.kind
            )));
        }
        if frame.fragment_count == 0 || frame.fragment_index >= frame.fragment_count {
            return Err(TransferError::malformed(format!(
                "response fragment {}/{} is inconsistent",
                frame.fragment_index, frame.fragment_count
            )));
        }
        if frame.fragment_count == 1 {
            return ParameterResponse::decode(frame.id, &frame.payload).map(Some);
        }

        if !self.partial.contains_key(&frame.id) && self.partial.len() >= MAX_PARTIAL_RESPONSES {
            warn!(
                tracked = self.partial.len(),
                "Too many partial parameter responses, dropping them"
            );
            self.partial.clear();
        }
        let partial = self.partial.entry(frame.id).or_insert_with(|| PartialResponse {
            fragments: vec![None; frame.fragment_count as usize],
            received: 0,
        });
        if partial.fragments.len() != frame.fragment_count as usize {
            let expected = partial.fragments.len();
            self.partial.remove(&frame.id);
            return Err(TransferError::malformed(format!(
                "response {} changed fragment count from {expected} to {}",
                frame.id, frame.fragment_count
            )));
        }

        let slot = &mut partial.fragments[frame.fragment_index as usize];
        if slot.is_some() {
            trace!(
                request_id = frame.id,
                index = frame.fragment_index,
                "Duplicate response fragment"
            );
            return Ok(None);
        }
        *slot = Some(frame.payload);
        partial.received += 1;
        if partial.received < frame.fragment_count {
            return Ok(None);
        }

        let Some(partial) = self.partial.remove(&frame.id) else {
            return Ok(None);
        };
        let mut body = BytesMut::new();
        for fragment in partial.fragments.into_iter().flatten() {
            body.extend_from_slice(&fragment);
        }
        ParameterResponse::decode(frame.id, &body).map(Some)
    }
}

impl RemoteErrorKind {
    /// Map a device-side failure to the matching local error.
    pub fn into_error(self, id: String, message: String) -> TransferError {
        match self {
            RemoteErrorKind::UnknownParameter => TransferError::UnknownParameter { id },
            RemoteErrorKind::NotWritable => TransferError::NotWritable { id },
            RemoteErrorKind::ValueOutOfRange => {
                TransferError::ValueOutOfRange { id, details: message }
            }
            RemoteErrorKind::TypeMismatch => TransferError::TypeMismatch {
                id,
                expected: "device type".to_string(),
                found: message,
            },
            RemoteErrorKind::Other => TransferError::Remote { id, reason: message },
        }
    }

    /// Classify a local validation error for sending back to a client.
    pub fn from_error(error: &TransferError) -> Self {
        match error {
            TransferError::UnknownParameter { .. } => RemoteErrorKind::UnknownParameter,
            TransferError::NotWritable { .. } => RemoteErrorKind::NotWritable,
            TransferError::ValueOutOfRange { .. } => RemoteErrorKind::ValueOutOfRange,
            TransferError::TypeMismatch { .. } => RemoteErrorKind::TypeMismatch,
            _ => RemoteErrorKind::Other,
        }
    }
}

fn expect_kind(frame: &Frame, kind: MessageKind) -> Result<()> {
    if frame.kind != kind || frame.fragment_count != 1 {
        return Err(TransferError::malformed(format!(
            "expected single {kind:?} frame, got {:?} {}/{}",
            frame.kind, frame.fragment_index, frame.fragment_count
        )));
    }
    Ok(())
}

fn decode_body<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload)
        .map_err(|e| TransferError::malformed(format!("undecodable parameter message: {e}")))
}

fn check_request_id(frame: &Frame, body_id: u32) -> Result<()> {
    if frame.id != body_id {
        return Err(id_mismatch(frame.id, body_id));
    }
    Ok(())
}

fn id_mismatch(header_id: u32, body_id: u32) -> TransferError {
    TransferError::malformed(format!(
        "header request id {header_id} differs from body request id {body_id}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParameterType;

    #[test]
    fn tagged_values_survive_the_wire() {
        let values = [
            ParameterValue::Int(-5),
            ParameterValue::Double(12.5),
            ParameterValue::Bool(true),
            ParameterValue::String("camera".into()),
            ParameterValue::Tensor { shape: vec![3, 3], data: vec![0.25; 9] },
            ParameterValue::EnumIndex(2),
        ];
        for (i, value) in values.into_iter().enumerate() {
            let request = ParameterRequest {
                request_id: i as u32 + 1,
                op: ParameterOp::Set { id: "p".into(), value },
            };
            let frame = request.to_frame().unwrap();
            assert_eq!(ParameterRequest::from_frame(&frame).unwrap(), request);
        }
    }

    #[test]
    fn response_kind_is_checked() {
        let descriptor = ParameterDescriptor::new("gain", ParameterType::Int, 1i64.into());
        let response = ParameterResponse { request_id: 4, body: ResponseBody::Ack(descriptor) };
        let frame = response.to_frame().unwrap();
        assert!(ParameterRequest::from_frame(&frame).is_err());
        assert_eq!(ParameterResponse::from_frame(&frame).unwrap(), response);
    }

    #[test]
    fn mismatched_request_id_is_malformed() {
        let request = ParameterRequest { request_id: 8, op: ParameterOp::List };
        let mut frame = request.to_frame().unwrap();
        frame.id = 9;
        assert!(matches!(
            ParameterRequest::from_frame(&frame),
            Err(TransferError::MalformedFrame { .. })
        ));
    }

    fn large_listing(count: usize) -> ParameterResponse {
        let descriptors = (0..count)
            .map(|i| {
                let mut d =
                    ParameterDescriptor::new(format!("p{i}"), ParameterType::Int, 0i64.into());
                d.description = format!("Parameter number {i} with an ordinary description");
                d
            })
            .collect();
        ParameterResponse { request_id: 12, body: ResponseBody::Listing(descriptors) }
    }

    #[test]
    fn large_response_is_split_and_rebuilt_in_any_order() {
        let response = large_listing(2000);
        let mut frames = response.to_frames(MAX_PAYLOAD_SIZE).unwrap();
        assert!(frames.len() > 1);
        assert!(response.to_frame().is_err());
        frames.reverse();

        let mut assembler = ResponseAssembler::new();
        let last = frames.pop().unwrap();
        for frame in frames {
            assert_eq!(assembler.push(frame).unwrap(), None);
        }
        assert_eq!(assembler.in_progress(), 1);
        assert_eq!(assembler.push(last).unwrap(), Some(response));
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn interleaved_responses_assemble_independently() {
        let first = large_listing(40);
        let mut second = large_listing(40);
        second.request_id = 13;
        let a = first.to_frames(512).unwrap();
        let b = second.to_frames(512).unwrap();

        let mut assembler = ResponseAssembler::new();
        let mut done = Vec::new();
        for (x, y) in a.into_iter().zip(b) {
            done.extend(assembler.push(x).unwrap());
            done.extend(assembler.push(y).unwrap());
        }
        assert_eq!(done, vec![first, second]);
    }

    #[test]
    fn inconsistent_response_fragments_are_malformed() {
        let mut assembler = ResponseAssembler::new();
        let mut frames = large_listing(40).to_frames(512).unwrap();
        let mut bad = frames.remove(0);
        bad.fragment_index = bad.fragment_count;
        assert!(matches!(assembler.push(bad), Err(TransferError::MalformedFrame { .. })));

        let mut changed = frames.remove(0);
        assembler.push(changed.clone()).unwrap();
        changed.fragment_index = 0;
        changed.fragment_count += 1;
        assert!(matches!(assembler.push(changed), Err(TransferError::MalformedFrame { .. })));
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn remote_errors_map_to_distinct_variants() {
        let unknown = RemoteErrorKind::UnknownParameter.into_error("x".into(), String::new());
        let read_only = RemoteErrorKind::NotWritable.into_error("x".into(), String::new());
        assert!(matches!(unknown, TransferError::UnknownParameter { .. }));
        assert!(matches!(read_only, TransferError::NotWritable { .. }));
        assert_eq!(RemoteErrorKind::from_error(&read_only), RemoteErrorKind::NotWritable);
    }
}
