//! Frame transports and connectors.
//!
//! A [`Transport`] moves whole [`Frame`]s in both directions and is shared by
//! the session receive loop (the only reader) and the parameter channel. A
//! [`Connector`] opens fresh transports, which is what the connection manager
//! uses to reconnect.

mod memory;
mod tcp;
mod udp;

use std::sync::Arc;
use std::time::Duration;

use crate::protocol::Frame;
use crate::types::{DeviceDescriptor, NetworkProtocol};
use crate::{Result, TransferError};

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Bidirectional frame channel to one device.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one frame.
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Receive the next frame.
    ///
    /// Returns:
    /// - `Ok(frame)` - a frame with a valid checksum
    /// - `Err(MalformedFrame)` - one bad frame was discarded, the transport is still usable
    /// - `Err(ConnectionLost)` or `Err(Io)` - the transport is gone
    async fn recv(&self) -> Result<Frame>;

    /// Close the transport; pending and future `recv` calls fail.
    async fn close(&self);

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;
}

/// Factory for transports to one device.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<Arc<dyn Transport>>;
}

/// Opens TCP or UDP transports according to a discovered device.
#[derive(Debug, Clone)]
pub struct DeviceConnector {
    device: DeviceDescriptor,
    connect_timeout: Duration,
}

impl DeviceConnector {
    pub fn new(device: DeviceDescriptor, connect_timeout: Duration) -> Self {
        Self { device, connect_timeout }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }
}

#[async_trait::async_trait]
impl Connector for DeviceConnector {
    async fn open(&self) -> Result<Arc<dyn Transport>> {
        let address = self.device.address;
        let transport: Arc<dyn Transport> = match self.device.protocol {
            NetworkProtocol::Tcp => {
                let connect = TcpTransport::connect(address);
                let transport = tokio::time::timeout(self.connect_timeout, connect)
                    .await
                    .map_err(|_| {
                        TransferError::connection_failed(format!(
                            "TCP connect to {address} timed out after {:?}",
                            self.connect_timeout
                        ))
                    })??;
                Arc::new(transport)
            }
            NetworkProtocol::Udp => Arc::new(UdpTransport::connect(address).await?),
        };
        Ok(transport)
    }
}

/// True when an error from [`Transport::recv`] means the link is gone.
pub(crate) fn is_link_failure(error: &TransferError) -> bool {
    matches!(
        error,
        TransferError::ConnectionLost { .. }
            | TransferError::Io { .. }
            | TransferError::Connection { .. }
    )
}
