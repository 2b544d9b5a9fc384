//! Core types for image transfer and parameter synchronization.
//!
//! ## Overview
//!
//! - [`ImageSet`] is one synchronized capture made of up to four [`Channel`]s
//! - [`DeviceDescriptor`] identifies a device found by discovery
//! - [`ParameterDescriptor`] and [`ParameterValue`] describe device parameters,
//!   with local validation of type, range, increment and enum options
//! - [`ParameterSet`] is a disconnected snapshot of all parameters
//! - [`UpdateRate`] controls how fast image set streams deliver
//!
//! ## Usage Example
//!
//! ```rust
//! use stereolink::types::{ParameterDescriptor, ParameterType, ParameterValue};
//!
//! let frequency =
//!     ParameterDescriptor::new("trigger_frequency", ParameterType::Double, 10.0.into())
//!         .with_range(1.0, 60.0)
//!         .with_increment(0.5);
//!
//! assert!(frequency.validate(ParameterValue::Double(25.5)).is_ok());
//! assert!(frequency.validate(ParameterValue::Double(120.0)).is_err());
//! ```

mod device;
mod image_set;
mod parameter;
mod parameter_set;
mod update_rate;

pub use device::{DeviceDescriptor, DeviceModel, DeviceStatus, NetworkProtocol};
pub use image_set::{Channel, Geometry, ImageSet, ImageType, MAX_CHANNELS, PixelFormat, Timestamp};
pub use parameter::{
    Access, EnumOption, ParameterDescriptor, ParameterKind, ParameterType, ParameterValue, Range,
};
pub use parameter_set::ParameterSet;
pub use update_rate::UpdateRate;
