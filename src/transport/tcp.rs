//! TCP transport, frames delimited by [`WireCodec`] on a byte stream.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Transport;
use crate::protocol::{Frame, WireCodec};
use crate::{Result, TransferError};

/// How long `close` waits for queued frames to drain.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

pub struct TcpTransport {
    reader: Mutex<FramedRead<OwnedReadHalf, WireCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, WireCodec>>,
    peer: SocketAddr,
    closed: CancellationToken,
}

impl TcpTransport {
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(peer).await.map_err(|e| {
            TransferError::connection_failed_with_source(
                format!("TCP connect to {peer}"),
                Box::new(e),
            )
        })?;
        Self::from_stream(stream)
    }

    /// Wrap an already connected stream, e.g. one accepted by a listener.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true).map_err(|e| TransferError::io(peer, e))?;
        let (read_half, write_half) = stream.into_split();
        debug!(%peer, "TCP transport ready");
        Ok(Self {
            reader: Mutex::new(FramedRead::new(read_half, WireCodec)),
            writer: Mutex::new(FramedWrite::new(write_half, WireCodec)),
            peer,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransferError::connection_lost("transport closed"));
        }
        // A peer that stops reading fills the socket buffer; closing must still
        // release every sender blocked here.
        let sent = tokio::select! {
            _ = self.closed.cancelled() => {
                return Err(TransferError::connection_lost("transport closed"));
            }
            sent = async {
                let mut writer = self.writer.lock().await;
                writer.send(frame).await
            } => sent,
        };
        sent.map_err(|e| match e {
            TransferError::Io { source, .. } => TransferError::io(self.peer, source),
            other => other,
        })
    }

    async fn recv(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        let next = tokio::select! {
            _ = self.closed.cancelled() => {
                return Err(TransferError::connection_lost("transport closed"));
            }
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) => Ok(frame),
            // Stream framing cannot resynchronize after a bad header.
            Some(Err(err)) => {
                warn!(peer = %self.peer, error = %err, "Dropping TCP stream after decode failure");
                self.closed.cancel();
                Err(TransferError::connection_lost(format!("stream corrupted: {err}")))
            }
            None => Err(TransferError::connection_lost("closed by peer")),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        let flushed = tokio::time::timeout(CLOSE_GRACE, async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        })
        .await;
        if flushed.is_err() {
            debug!(peer = %self.peer, "Peer not reading, dropping unflushed frames");
        }
    }

    fn peer(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_cross_a_loopback_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpTransport::connect(address), listener.accept());
        let client = client.unwrap();
        let device = TcpTransport::from_stream(accepted.unwrap().0).unwrap();

        client.send(Frame::hello(1)).await.unwrap();
        assert_eq!(device.recv().await.unwrap().protocol_version(), Some(1));

        device.close().await;
        assert!(matches!(client.recv().await, Err(TransferError::ConnectionLost { .. })));
    }

    #[tokio::test]
    async fn close_releases_sender_blocked_on_full_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpTransport::connect(address), listener.accept());
        let client = std::sync::Arc::new(client.unwrap());
        // accepted but never read
        let _device = accepted.unwrap().0;

        let sender = {
            let client = client.clone();
            tokio::spawn(async move {
                let payload = bytes::Bytes::from(vec![0u8; 50_000]);
                loop {
                    let frame = Frame::new(MessageKind::ParameterRequest, 1, payload.clone());
                    if let Err(err) = client.send(frame).await {
                        return err;
                    }
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!sender.is_finished(), "socket buffer should be full by now");

        tokio::time::timeout(Duration::from_secs(2), client.close()).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(2), sender).await.unwrap().unwrap();
        assert!(matches!(err, TransferError::ConnectionLost { .. }));
    }

    #[tokio::test]
    async fn corrupt_stream_counts_as_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpTransport::connect(address), listener.accept());
        let client = client.unwrap();
        let (mut raw, _) = accepted.unwrap();

        raw.write_all(&[0u8; 32]).await.unwrap();
        assert!(matches!(client.recv().await, Err(TransferError::ConnectionLost { .. })));
        assert!(client.send(Frame::control(MessageKind::Heartbeat, 1)).await.is_err());
    }
}
