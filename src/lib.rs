//! Async client for networked stereo vision devices.
//!
//! Stereolink finds devices on the local network, receives synchronized image
//! sets (left/right/disparity/color channels) from them and reads and writes
//! their processing parameters over a shared, self-healing session.
//!
//! # Features
//!
//! - **Discovery**: UDP broadcast probe with status and serial number replies
//! - **Image transfer**: fragment reassembly with freshest-wins delivery
//! - **Parameters**: request/response channel with local validation and a
//!   session-stamped cache
//! - **Resilience**: heartbeats, liveness detection and bounded reconnects
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use stereolink::{Stereolink, TransferConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> stereolink::Result<()> {
//!     let config = TransferConfig::default();
//!     let devices = Stereolink::discover(Duration::from_secs(1), &config).await?;
//!     let Some(device) = devices.first() else {
//!         return Ok(());
//!     };
//!
//!     let connection = Stereolink::connect(device, config).await?;
//!     connection.parameters().set_trigger_frequency(15.0).await?;
//!
//!     let images = connection.images();
//!     if let Some(set) = images.collect_received_image_set(Duration::from_secs(1)).await {
//!         let channels = set.number_of_channels();
//!         println!("image set {} with {channels} channels", set.sequence_number);
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
pub mod types;

// Wire protocol and transports
pub mod protocol;
pub mod transport;

// Session-based transfer architecture
pub mod connection;
pub mod discovery;
pub mod params;
pub mod receiver;
pub mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Core exports
pub use config::{StalePolicy, TransferConfig};
pub use error::*;
pub use types::*;

// Main API exports
pub use connection::{DeviceConnection, SessionState, SessionStatus};
pub use discovery::DeviceEnumeration;
pub use params::{OperationMode, ParameterChannel};
pub use receiver::{ImageReceiver, ReceiverStats};

use std::sync::Arc;
use std::time::Duration;

use transport::Connector;

/// Unified entry point for device discovery and connections.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use stereolink::{Stereolink, TransferConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> stereolink::Result<()> {
/// let config = TransferConfig::default();
/// let devices = Stereolink::discover(Duration::from_millis(500), &config).await?;
/// for device in &devices {
///     println!("{device}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Stereolink;

impl Stereolink {
    /// Broadcast a discovery probe and collect replies for `timeout`.
    ///
    /// An empty list is not an error; see
    /// [`DeviceEnumeration::require_devices`] for that.
    pub async fn discover(
        timeout: Duration,
        config: &TransferConfig,
    ) -> Result<Vec<DeviceDescriptor>> {
        discovery::discover_devices(timeout, config).await
    }

    /// Connect to a discovered device.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Connection`] if the transport cannot be opened,
    /// the handshake times out or the device rejects the session, and
    /// [`TransferError::Config`] for an invalid configuration.
    pub async fn connect(
        device: &DeviceDescriptor,
        config: TransferConfig,
    ) -> Result<DeviceConnection> {
        DeviceConnection::connect(device, config).await
    }

    /// Connect through a custom [`Connector`].
    pub async fn connect_with(
        connector: Arc<dyn Connector>,
        config: TransferConfig,
    ) -> Result<DeviceConnection> {
        DeviceConnection::connect_with(connector, config).await
    }
}
