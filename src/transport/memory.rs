//! In-process transport pair, used by the device simulator and tests.

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use super::Transport;
use crate::protocol::{Frame, WireCodec, decode_datagram};
use crate::{Result, TransferError};

/// One end of an in-memory link. Frames go through the real encoder and
/// decoder so checksums and header validation are exercised.
pub struct MemoryTransport {
    name: String,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair(name: &str) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self::end(format!("{name}/client"), a_tx, b_rx),
            Self::end(format!("{name}/device"), b_tx, a_rx),
        )
    }

    fn end(
        name: String,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            name,
            outbound: parking_lot::Mutex::new(Some(tx)),
            inbound: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Push raw bytes to the peer as if they were one datagram.
    pub fn send_raw(&self, bytes: Bytes) -> Result<()> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or_else(|| TransferError::connection_lost("transport closed"))?;
        tx.send(bytes).map_err(|_| TransferError::connection_lost("peer dropped"))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Frame) -> Result<()> {
        let mut buf = BytesMut::new();
        WireCodec.encode(frame, &mut buf)?;
        self.send_raw(buf.freeze())
    }

    async fn recv(&self) -> Result<Frame> {
        let mut inbound = self.inbound.lock().await;
        let bytes = tokio::select! {
            _ = self.closed.cancelled() => {
                return Err(TransferError::connection_lost("transport closed"));
            }
            bytes = inbound.recv() => bytes,
        };
        match bytes {
            Some(bytes) => decode_datagram(&bytes),
            None => Err(TransferError::connection_lost("peer closed")),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.outbound.lock().take();
    }

    fn peer(&self) -> String {
        format!("memory://{}", self.name)
    }
}
