//! Image block encoding and fragmentation.
//!
//! An image set travels as one image block split across fragments:
//!
//! ```text
//! channels u8 | seconds u64 | microseconds u32 | sequence u32 | exposure u32
//! per channel: type u8 | format u8 | width u32 | height u32 | stride u32 | len u32 | samples
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::frame::{Frame, MAX_PAYLOAD_SIZE, MessageKind};
use crate::types::{Channel, ImageSet, ImageType, MAX_CHANNELS, PixelFormat, Timestamp};
use crate::{Result, TransferError};

const BLOCK_HEADER_LEN: usize = 1 + 8 + 4 + 4 + 4;
const CHANNEL_HEADER_LEN: usize = 1 + 1 + 4 + 4 + 4 + 4;

/// Serialize an image set into one contiguous image block.
pub fn encode_image_block(set: &ImageSet) -> Result<Bytes> {
    set.validate()?;
    let mut buf = BytesMut::with_capacity(
        BLOCK_HEADER_LEN + set.channels.len() * CHANNEL_HEADER_LEN + set.payload_len(),
    );
    buf.put_u8(set.channels.len() as u8);
    buf.put_u64(set.timestamp.seconds);
    buf.put_u32(set.timestamp.microseconds);
    buf.put_u32(set.sequence_number);
    buf.put_u32(set.exposure_us);
    for channel in &set.channels {
        buf.put_u8(channel.image_type.to_wire());
        buf.put_u8(channel.format.to_wire());
        buf.put_u32(channel.width);
        buf.put_u32(channel.height);
        buf.put_u32(channel.row_stride);
        buf.put_u32(channel.data.len() as u32);
        buf.put_slice(&channel.data);
    }
    Ok(buf.freeze())
}

/// Parse an image block, validating every length against the buffer.
pub fn decode_image_block(mut block: &[u8]) -> Result<ImageSet> {
    if block.len() < BLOCK_HEADER_LEN {
        return Err(TransferError::malformed("image block shorter than its header"));
    }
    let channel_count = block.get_u8() as usize;
    if channel_count == 0 || channel_count > MAX_CHANNELS {
        return Err(TransferError::malformed(format!(
            "image block declares {channel_count} channels"
        )));
    }
    let timestamp = Timestamp::new(block.get_u64(), block.get_u32());
    let sequence_number = block.get_u32();
    let exposure_us = block.get_u32();

    let mut channels = Vec::with_capacity(channel_count);
    for index in 0..channel_count {
        if block.remaining() < CHANNEL_HEADER_LEN {
            return Err(TransferError::malformed(format!("channel {index} header truncated")));
        }
        let type_byte = block.get_u8();
        let format_byte = block.get_u8();
        let image_type = ImageType::from_wire(type_byte)
            .ok_or_else(|| TransferError::malformed(format!("unknown image type {type_byte}")))?;
        let format = PixelFormat::from_wire(format_byte)
            .ok_or_else(|| {
                TransferError::malformed(format!("unknown pixel format {format_byte}"))
            })?;
        let width = block.get_u32();
        let height = block.get_u32();
        let row_stride = block.get_u32();
        let len = block.get_u32() as usize;
        if block.remaining() < len {
            return Err(TransferError::malformed(format!(
                "channel {index} declares {len} bytes, {} remain",
                block.remaining()
            )));
        }
        let data = block[..len].to_vec();
        block.advance(len);
        channels.push(Channel { image_type, format, width, height, row_stride, data });
    }

    if block.has_remaining() {
        return Err(TransferError::malformed(format!(
            "{} trailing bytes after image block",
            block.remaining()
        )));
    }

    let set = ImageSet { sequence_number, timestamp, exposure_us, channels };
    set.validate()?;
    Ok(set)
}

/// Split an image set into fragments of at most `max_payload` bytes each.
pub fn fragment_image_set(set: &ImageSet, max_payload: usize) -> Result<Vec<Frame>> {
    if max_payload == 0 || max_payload > MAX_PAYLOAD_SIZE {
        return Err(TransferError::config(format!(
            "fragment payload size {max_payload} outside 1..={MAX_PAYLOAD_SIZE}"
        )));
    }
    let block = encode_image_block(set)?;
    let count = block.len().div_ceil(max_payload);
    let count = u16::try_from(count).map_err(|_| {
        TransferError::malformed(format!(
            "image set of {} bytes needs {count} fragments",
            block.len()
        ))
    })?;

    Ok((0..count)
        .map(|index| {
            let start = index as usize * max_payload;
            let end = (start + max_payload).min(block.len());
            Frame {
                kind: MessageKind::ImageFragment,
                id: set.sequence_number,
                fragment_index: index,
                fragment_count: count,
                payload: block.slice(start..end),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ImageSet {
        let ramp = (0..=255).cycle().take(512).collect();
        let left = Channel::new(ImageType::Left, PixelFormat::Mono8, 32, 16, ramp).unwrap();
        let right =
            Channel::new(ImageType::Right, PixelFormat::Mono8, 32, 16, vec![7; 512]).unwrap();
        let mut set =
            ImageSet::new(11, Timestamp::new(1_700_000_000, 42), vec![left, right]).unwrap();
        set.exposure_us = 900;
        set
    }

    #[test]
    fn fragments_cover_the_block() {
        let set = sample_set();
        let frames = fragment_image_set(&set, 100).unwrap();
        let block = encode_image_block(&set).unwrap();

        assert_eq!(frames.len(), block.len().div_ceil(100));
        assert!(frames.iter().all(|f| f.payload.len() <= 100 && f.id == 11));
        assert!(frames.iter().all(|f| f.fragment_count as usize == frames.len()));

        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.iter().copied()).collect();
        assert_eq!(decode_image_block(&joined).unwrap(), set);
    }

    #[test]
    fn truncated_block_is_malformed() {
        let block = encode_image_block(&sample_set()).unwrap();
        let err = decode_image_block(&block[..block.len() - 1]).unwrap_err();
        assert!(matches!(err, TransferError::MalformedFrame { .. }));
    }

    #[test]
    fn geometry_mismatch_is_malformed() {
        let mut block = encode_image_block(&sample_set()).unwrap().to_vec();
        // width of the first channel
        block[BLOCK_HEADER_LEN + 2..BLOCK_HEADER_LEN + 6].copy_from_slice(&64u32.to_be_bytes());
        assert!(decode_image_block(&block).is_err());
    }

    #[test]
    fn zero_fragment_size_is_rejected() {
        assert!(fragment_image_set(&sample_set(), 0).is_err());
    }
}
