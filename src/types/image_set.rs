//! Image set types: one synchronized capture of one or more camera channels

use serde::{Deserialize, Serialize};

use crate::{Result, TransferError};

/// Magic prefix of persisted image set blobs.
const BLOB_MAGIC: [u8; 4] = *b"SLIS";

/// Version of the persisted blob layout.
const BLOB_VERSION: u8 = 1;

/// Maximum number of channels carried by one image set.
pub const MAX_CHANNELS: usize = 4;

/// Pixel formats that can be transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit greyscale
    Mono8,
    /// 8-bit interleaved RGB
    Rgb8,
    /// 12-bit greyscale stored in 16 bits
    Mono12,
}

impl PixelFormat {
    /// Significant bits per pixel.
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Mono8 => 8,
            PixelFormat::Rgb8 => 24,
            PixelFormat::Mono12 => 12,
        }
    }

    /// Storage bytes per pixel.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Mono12 => 2,
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            PixelFormat::Mono8 => 0,
            PixelFormat::Rgb8 => 1,
            PixelFormat::Mono12 => 2,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(PixelFormat::Mono8),
            1 => Some(PixelFormat::Rgb8),
            2 => Some(PixelFormat::Mono12),
            _ => None,
        }
    }
}

/// Role of a channel within the image set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    Undefined,
    Left,
    Disparity,
    Right,
    /// Third colour camera on devices that have one
    Color,
}

impl ImageType {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ImageType::Undefined => 0,
            ImageType::Left => 1,
            ImageType::Disparity => 2,
            ImageType::Right => 3,
            ImageType::Color => 4,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ImageType::Undefined),
            1 => Some(ImageType::Left),
            2 => Some(ImageType::Disparity),
            3 => Some(ImageType::Right),
            4 => Some(ImageType::Color),
            _ => None,
        }
    }
}

/// One camera channel inside an [`ImageSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub image_type: ImageType,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per row including padding
    pub row_stride: u32,
    /// Raw samples, `row_stride * height` bytes
    pub data: Vec<u8>,
}

impl Channel {
    /// Create a channel with a tightly packed row stride.
    pub fn new(
        image_type: ImageType,
        format: PixelFormat,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Result<Self> {
        let row_stride = width.checked_mul(format.bytes_per_pixel()).ok_or_else(|| {
            TransferError::malformed(format!("{width}px wide {format:?} rows overflow the stride"))
        })?;
        let channel = Self { image_type, format, width, height, row_stride, data };
        channel.validate()?;
        Ok(channel)
    }

    /// Check that the sample buffer matches the declared geometry.
    pub fn validate(&self) -> Result<()> {
        let min_stride = self.width as u64 * self.format.bytes_per_pixel() as u64;
        if (self.row_stride as u64) < min_stride {
            return Err(TransferError::malformed(format!(
                "row stride {} below {} for {}px wide {:?}",
                self.row_stride, min_stride, self.width, self.format
            )));
        }
        let expected = self.row_stride as u64 * self.height as u64;
        if self.data.len() as u64 != expected {
            return Err(TransferError::malformed(format!(
                "channel {:?} carries {} bytes, geometry needs {}",
                self.image_type,
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }

    /// Bit depth of the samples.
    pub fn bit_depth(&self) -> u32 {
        self.format.bits_per_pixel()
    }

    /// Borrow one row of samples, without padding.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = usize::try_from(y as u64 * self.row_stride as u64).ok()?;
        let len = usize::try_from(self.width as u64 * self.format.bytes_per_pixel() as u64).ok()?;
        self.data.get(start..start.checked_add(len)?)
    }
}

/// Capture time of an image set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: u64,
    pub microseconds: u32,
}

impl Timestamp {
    pub fn new(seconds: u64, microseconds: u32) -> Self {
        Self { seconds, microseconds }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self { seconds: elapsed.as_secs(), microseconds: elapsed.subsec_micros() }
    }
}

/// Channel count and per-channel geometry, fixed for one operation mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub channels: Vec<(ImageType, PixelFormat, u32, u32)>,
}

/// A synchronized bundle of camera channels captured at the same instant.
///
/// Sequence numbers strictly increase within one device session. An image set
/// handed out by the receiver is owned by the caller; clone it to keep it
/// around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSet {
    pub sequence_number: u32,
    pub timestamp: Timestamp,
    /// Exposure time in microseconds, 0 if unknown
    pub exposure_us: u32,
    pub channels: Vec<Channel>,
}

impl ImageSet {
    /// Create an image set, validating every channel.
    pub fn new(sequence_number: u32, timestamp: Timestamp, channels: Vec<Channel>) -> Result<Self> {
        let set = Self { sequence_number, timestamp, exposure_us: 0, channels };
        set.validate()?;
        Ok(set)
    }

    /// Validate channel count and per-channel geometry.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            return Err(TransferError::malformed(format!(
                "image set carries {} channels (1..={} allowed)",
                self.channels.len(),
                MAX_CHANNELS
            )));
        }
        self.channels.iter().try_for_each(Channel::validate)
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Find the channel with the given role.
    pub fn channel(&self, image_type: ImageType) -> Option<&Channel> {
        self.channels.iter().find(|c| c.image_type == image_type)
    }

    /// Total sample bytes across all channels.
    pub fn payload_len(&self) -> usize {
        self.channels.iter().map(|c| c.data.len()).sum()
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            channels: self
                .channels
                .iter()
                .map(|c| (c.image_type, c.format, c.width, c.height))
                .collect(),
        }
    }

    /// Serialize into an opaque blob for persistence.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut blob = Vec::with_capacity(BLOB_MAGIC.len() + 1 + body.len());
        blob.extend_from_slice(&BLOB_MAGIC);
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    /// Restore an image set from a blob produced by [`ImageSet::to_blob`].
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let header = BLOB_MAGIC.len() + 1;
        if blob.len() < header || blob[..BLOB_MAGIC.len()] != BLOB_MAGIC {
            return Err(TransferError::Serialization {
                details: "missing image set blob header".to_string(),
            });
        }
        if blob[BLOB_MAGIC.len()] != BLOB_VERSION {
            return Err(TransferError::Serialization {
                details: format!("unsupported blob version {}", blob[BLOB_MAGIC.len()]),
            });
        }
        let set: ImageSet = bincode::deserialize(&blob[header..])?;
        set.validate()?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_pair(seq: u32) -> ImageSet {
        let left = Channel::new(ImageType::Left, PixelFormat::Mono8, 4, 2, vec![1; 8]).unwrap();
        let disparity =
            Channel::new(ImageType::Disparity, PixelFormat::Mono12, 4, 2, vec![2; 16]).unwrap();
        ImageSet::new(seq, Timestamp::new(10, 500), vec![left, disparity]).unwrap()
    }

    #[test]
    fn channel_rejects_short_buffer() {
        let err = Channel::new(ImageType::Left, PixelFormat::Rgb8, 4, 4, vec![0; 47]).unwrap_err();
        assert!(matches!(err, TransferError::MalformedFrame { .. }));
    }

    #[test]
    fn padded_rows_are_trimmed() {
        let channel = Channel {
            image_type: ImageType::Left,
            format: PixelFormat::Mono8,
            width: 3,
            height: 2,
            row_stride: 4,
            data: vec![1, 2, 3, 0, 4, 5, 6, 0],
        };
        channel.validate().unwrap();
        assert_eq!(channel.row(1), Some(&[4u8, 5, 6][..]));
        assert_eq!(channel.row(2), None);
    }

    #[test]
    fn oversized_geometry_is_an_error() {
        let err = Channel::new(ImageType::Color, PixelFormat::Rgb8, u32::MAX, 1, Vec::new())
            .unwrap_err();
        assert!(matches!(err, TransferError::MalformedFrame { .. }));

        let channel = Channel {
            image_type: ImageType::Left,
            format: PixelFormat::Mono8,
            width: 2,
            height: 3,
            row_stride: u32::MAX,
            data: vec![0; 4],
        };
        assert!(channel.validate().is_err());
        assert_eq!(channel.row(2), None);
    }

    #[test]
    fn blob_restores_identical_set() {
        let mut set = stereo_pair(42);
        set.exposure_us = 1800;
        let restored = ImageSet::from_blob(&set.to_blob().unwrap()).unwrap();
        assert_eq!(restored, set);
        assert_eq!(restored.geometry(), set.geometry());
    }

    #[test]
    fn blob_with_foreign_header_is_rejected() {
        let mut blob = stereo_pair(1).to_blob().unwrap();
        blob[0] = b'X';
        assert!(matches!(ImageSet::from_blob(&blob), Err(TransferError::Serialization { .. })));
        assert!(ImageSet::from_blob(&[]).is_err());
    }

    #[test]
    fn too_many_channels_rejected() {
        let c = Channel::new(ImageType::Left, PixelFormat::Mono8, 1, 1, vec![0]).unwrap();
        let err = ImageSet::new(0, Timestamp::default(), vec![c; MAX_CHANNELS + 1]).unwrap_err();
        assert!(matches!(err, TransferError::MalformedFrame { .. }));
    }
}
