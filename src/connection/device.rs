//! Caller-facing connection to one device.

use std::sync::Arc;

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::manager::ConnectionManager;
use super::session::{Session, SessionState, SessionStatus};
use crate::config::TransferConfig;
use crate::params::ParameterChannel;
use crate::receiver::ImageReceiver;
use crate::transport::{Connector, DeviceConnector};
use crate::types::DeviceDescriptor;
use crate::Result;

/// Live connection to a device: image transfer plus parameter channel.
///
/// Both halves share one session and survive transparent reconnects. Dropping
/// the connection stops the receive loop; outstanding handles then observe a
/// closed session.
pub struct DeviceConnection {
    device: Option<DeviceDescriptor>,
    session: Arc<Session>,
    parameters: ParameterChannel,
    images: ImageReceiver,
    cancel: CancellationToken,
}

impl DeviceConnection {
    /// Connect to a discovered device using its advertised protocol.
    pub async fn connect(device: &DeviceDescriptor, config: TransferConfig) -> Result<Self> {
        info!(%device, "Connecting to device");
        let connector = DeviceConnector::new(device.clone(), config.connect_timeout());
        let mut connection = Self::connect_with(Arc::new(connector), config).await?;
        let device_fps = device.status.as_ref().map(|s| s.last_fps).filter(|fps| *fps > 0.0);
        connection.images.set_device_fps(device_fps);
        connection.device = Some(device.clone());
        Ok(connection)
    }

    /// Connect through a custom connector, e.g. an in-memory simulator.
    pub async fn connect_with(
        connector: Arc<dyn Connector>,
        config: TransferConfig,
    ) -> Result<Self> {
        let request_timeout = config.request_timeout();
        let parts = ConnectionManager::start(connector, config).await?;
        let parameters = ParameterChannel::new(
            parts.session.clone(),
            parts.pending,
            parts.cache,
            request_timeout,
        );
        let images = ImageReceiver::new(parts.receiver, parts.session.clone(), None);
        Ok(Self {
            device: None,
            session: parts.session,
            parameters,
            images,
            cancel: parts.cancel,
        })
    }

    /// Parameter channel sharing this connection's session.
    pub fn parameters(&self) -> ParameterChannel {
        self.parameters.clone()
    }

    /// Image receiver sharing this connection's session.
    pub fn images(&self) -> ImageReceiver {
        self.images.clone()
    }

    /// Descriptor used to connect, if the connection came from discovery.
    pub fn device(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn state_changes(&self) -> impl Stream<Item = SessionState> + Send + 'static {
        self.images.state_changes()
    }

    /// Stop the session. Pending waits resolve with `ConnectionLost` or `None`.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        debug!("Dropping device connection");
        self.cancel.cancel();
    }
}
