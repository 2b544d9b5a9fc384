//! UDP transport, one frame per datagram.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::Transport;
use crate::protocol::{Frame, decode_datagram};
use crate::{Result, TransferError};

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 65_536;

pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    /// Receive buffer reused across datagrams
    buffer: Mutex<BytesMut>,
    closed: CancellationToken,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect it to `peer`.
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await.map_err(|e| TransferError::io(local, e))?;
        socket.connect(peer).await.map_err(|e| TransferError::io(peer, e))?;
        debug!(%peer, local = ?socket.local_addr().ok(), "UDP transport ready");
        Ok(Self {
            socket,
            peer,
            buffer: Mutex::new(BytesMut::with_capacity(MAX_DATAGRAM)),
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransferError::connection_lost("transport closed"));
        }
        let bytes = frame.to_bytes()?;
        self.socket.send(&bytes).await.map_err(|e| TransferError::io(self.peer, e))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Frame> {
        let mut buf = self.buffer.lock().await;
        buf.clear();
        buf.reserve(MAX_DATAGRAM);
        let len = tokio::select! {
            _ = self.closed.cancelled() => {
                return Err(TransferError::connection_lost("transport closed"));
            }
            received = self.socket.recv_buf(&mut *buf) => {
                received.map_err(|e| TransferError::io(self.peer, e))?
            }
        };
        trace!(peer = %self.peer, len, "Datagram received");
        decode_datagram(&buf[..len])
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn peer(&self) -> String {
        format!("udp://{}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;

    #[tokio::test]
    async fn frames_cross_a_loopback_socket() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::connect(device.local_addr().unwrap()).await.unwrap();

        transport.send(Frame::control(MessageKind::Heartbeat, 3)).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, client) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(decode_datagram(&buf[..len]).unwrap().id, 3);

        let ack = Frame::control(MessageKind::HeartbeatAck, 3).to_bytes().unwrap();
        device.send_to(&ack, client).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().kind, MessageKind::HeartbeatAck);

        // a corrupt datagram is reported without closing the transport
        device.send_to(b"garbage", client).await.unwrap();
        assert!(matches!(transport.recv().await, Err(TransferError::MalformedFrame { .. })));

        // the reused receive buffer holds only the newest datagram
        let short = Frame::control(MessageKind::HeartbeatAck, 4).to_bytes().unwrap();
        device.send_to(&short, client).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().id, 4);

        transport.close().await;
        assert!(matches!(transport.recv().await, Err(TransferError::ConnectionLost { .. })));
    }
}
