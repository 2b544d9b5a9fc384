//! Wire protocol: frames, stream codec, image fragmentation and parameter messages.
//!
//! Every message is a [`Frame`] with a fixed 16-byte header and a CRC-32
//! trailer. Image sets are encoded into an image block and split into
//! [`MessageKind::ImageFragment`] frames which the [`FragmentAssembler`]
//! rebuilds on the receiving side. Parameter traffic uses bincode-encoded
//! [`ParameterRequest`] and [`ParameterResponse`] bodies.
//!
//! ```rust
//! use stereolink::protocol::{FragmentAssembler, Assembled, fragment_image_set};
//! use stereolink::types::{Channel, ImageSet, ImageType, PixelFormat, Timestamp};
//! use stereolink::StalePolicy;
//!
//! let left = Channel::new(ImageType::Left, PixelFormat::Mono8, 64, 48, vec![0; 64 * 48])?;
//! let set = ImageSet::new(1, Timestamp::now(), vec![left])?;
//!
//! let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
//! let mut frames = fragment_image_set(&set, 1024)?;
//! frames.reverse();
//! let mut rebuilt = None;
//! for frame in frames {
//!     if let Assembled::Complete(done) = assembler.push(frame)? {
//!         rebuilt = Some(done);
//!     }
//! }
//! assert_eq!(rebuilt, Some(set));
//! # Ok::<(), stereolink::TransferError>(())
//! ```

mod assembler;
mod codec;
mod frame;
mod image;
mod message;

pub use assembler::{Assembled, AssemblerStats, AssemblyState, FragmentAssembler};
pub(crate) use assembler::sequence_after;
pub use codec::WireCodec;
pub use frame::{
    Frame, HEADER_LEN, MAGIC, MAX_PAYLOAD_SIZE, MessageKind, PROTOCOL_VERSION, TRAILER_LEN,
    decode_datagram,
};
pub use image::{decode_image_block, encode_image_block, fragment_image_set};
pub use message::{
    ParameterOp, ParameterRequest, ParameterResponse, RemoteErrorKind, ResponseAssembler,
    ResponseBody, UNSOLICITED_REQUEST_ID,
};
