//! Connection manager: handshake, receive loop, heartbeats and reconnects.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::session::Session;
use crate::config::TransferConfig;
use crate::params::{ParameterCache, PendingRequests};
use crate::protocol::{
    Assembled, FragmentAssembler, Frame, MessageKind, PROTOCOL_VERSION, ParameterResponse,
    ResponseAssembler, ResponseBody,
};
use crate::receiver::ReceiverShared;
use crate::transport::{Connector, Transport, is_link_failure};
use crate::{Result, TransferError};

/// Why a live session stopped being served.
enum Exit {
    Cancelled,
    Lost(String),
}

/// Shared handles produced by [`ConnectionManager::start`].
pub(crate) struct SessionParts {
    pub session: Arc<Session>,
    pub receiver: Arc<ReceiverShared>,
    pub pending: Arc<PendingRequests>,
    pub cache: Arc<ParameterCache>,
    pub cancel: CancellationToken,
}

/// Owns the device session for its whole lifetime.
///
/// The spawned receive loop is the only reader of the transport and the only
/// writer of assembly state, the image handoff slot and session liveness.
pub(crate) struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: TransferConfig,
    session: Arc<Session>,
    receiver: Arc<ReceiverShared>,
    pending: Arc<PendingRequests>,
    cache: Arc<ParameterCache>,
    assembler: FragmentAssembler,
    responses: ResponseAssembler,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Open the first transport, handshake, and spawn the receive loop.
    pub(crate) async fn start(
        connector: Arc<dyn Connector>,
        config: TransferConfig,
    ) -> Result<SessionParts> {
        config.validate()?;
        let session = Arc::new(Session::new());

        let (transport, version) = open_and_handshake(connector.as_ref(), &config).await?;
        info!(peer = %transport.peer(), protocol_version = version, "Device session established");
        session.go_live(transport, version);

        let manager = Self {
            assembler: FragmentAssembler::new(config.stale_policy),
            responses: ResponseAssembler::new(),
            connector,
            config,
            session: session.clone(),
            receiver: Arc::new(ReceiverShared::new()),
            pending: Arc::new(PendingRequests::new()),
            cache: Arc::new(ParameterCache::new()),
            cancel: CancellationToken::new(),
        };
        let parts = SessionParts {
            session,
            receiver: manager.receiver.clone(),
            pending: manager.pending.clone(),
            cache: manager.cache.clone(),
            cancel: manager.cancel.clone(),
        };

        tokio::spawn(manager.run());
        Ok(parts)
    }

    async fn run(mut self) {
        info!("Session receive loop started");
        loop {
            let Some(transport) = self.session.transport() else {
                break;
            };
            match self.serve(transport.clone()).await {
                Exit::Cancelled => {
                    info!("Session cancelled");
                    break;
                }
                Exit::Lost(reason) => {
                    self.on_link_lost(transport, &reason).await;
                    if !self.reconnect().await {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
        info!(stats = ?self.assembler.stats(), "Session receive loop ended");
    }

    /// Serve one live transport until it fails or the session is cancelled.
    async fn serve(&mut self, transport: Arc<dyn Transport>) -> Exit {
        let mut heartbeat = interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let liveness_window = self.config.liveness_window();
        let mut last_traffic = Instant::now();
        let mut heartbeat_id = 0u32;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Cancelled,

                _ = heartbeat.tick() => {
                    let now = Instant::now();
                    let expired = self.pending.sweep_expired(now);
                    if expired > 0 {
                        debug!(expired, "Parameter requests timed out");
                    }
                    if now.duration_since(last_traffic) >= liveness_window {
                        return Exit::Lost(format!("no traffic for {liveness_window:?}"));
                    }
                    heartbeat_id = heartbeat_id.wrapping_add(1);
                    let ping = Frame::control(MessageKind::Heartbeat, heartbeat_id);
                    let sent = send_within(transport.as_ref(), ping, liveness_window).await;
                    if let Some(reason) = sent {
                        return Exit::Lost(format!("heartbeat {reason}"));
                    }
                }

                received = transport.recv() => match received {
                    Ok(frame) => {
                        last_traffic = Instant::now();
                        if let Some(reason) = self.dispatch(frame, transport.as_ref()).await {
                            return Exit::Lost(reason);
                        }
                    }
                    Err(err) if is_link_failure(&err) => return Exit::Lost(err.to_string()),
                    Err(err) => {
                        warn!(error = %err, "Discarding undecodable frame");
                        self.receiver.record_malformed();
                    }
                },
            }
        }
    }

    /// Route one inbound frame. Returns a reason when the device ended the session.
    async fn dispatch(&mut self, frame: Frame, transport: &dyn Transport) -> Option<String> {
        match frame.kind {
            MessageKind::ImageFragment => {
                match self.assembler.push(frame) {
                    Ok(Assembled::Complete(set)) => {
                        trace!(
                            sequence = set.sequence_number,
                            channels = set.channels.len(),
                            "Image set complete"
                        );
                        self.receiver.publish(set);
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "Image fragment rejected"),
                }
                self.receiver.record_assembler(self.assembler.stats());
            }
            MessageKind::ParameterResponse => match self.responses.push(frame) {
                Ok(Some(response)) => self.on_parameter_response(response),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Discarding parameter response");
                    self.receiver.record_malformed();
                }
            },
            MessageKind::Heartbeat => {
                let ack = Frame::control(MessageKind::HeartbeatAck, frame.id);
                let window = self.config.liveness_window();
                if let Some(reason) = send_within(transport, ack, window).await {
                    return Some(format!("heartbeat ack {reason}"));
                }
            }
            MessageKind::HeartbeatAck => trace!(id = frame.id, "Heartbeat acknowledged"),
            MessageKind::Reject => {
                let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                return Some(format!("device rejected session: {reason}"));
            }
            MessageKind::Hello | MessageKind::HelloAck | MessageKind::ParameterRequest => {
                debug!(kind = ?frame.kind, "Ignoring unexpected frame");
            }
        }
        None
    }

    fn on_parameter_response(&self, response: ParameterResponse) {
        if response.is_unsolicited() {
            match response.body {
                ResponseBody::Update(descriptor) => {
                    debug!(
                        id = %descriptor.uid,
                        value = %descriptor.current,
                        "Device pushed parameter update"
                    );
                    self.cache.apply_update(descriptor, self.session.generation());
                }
                other => debug!(body = ?other, "Ignoring unsolicited response"),
            }
            return;
        }
        self.pending.resolve(response.request_id, response.body);
    }

    /// Discard everything tied to the lost link.
    async fn on_link_lost(&mut self, transport: Arc<dyn Transport>, reason: &str) {
        warn!(peer = %transport.peer(), reason, "Device link lost");
        self.session.degrade();
        transport.close().await;
        self.assembler.reset();
        self.responses.reset();
        self.receiver.record_assembler(self.assembler.stats());
        self.receiver.new_generation();
        self.pending.fail_all(reason);
        self.cache.invalidate();
    }

    /// Bounded reconnect with exponential backoff. Returns true once live again.
    async fn reconnect(&mut self) -> bool {
        let attempts = self.config.max_reconnect_attempts;
        for attempt in 0..attempts {
            let delay = self.config.reconnect_backoff(attempt);
            debug!(attempt = attempt + 1, attempts, ?delay, "Reconnecting");
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                opened = open_and_handshake(self.connector.as_ref(), &self.config) => opened,
            };
            match opened {
                Ok((transport, version)) => {
                    if !self.session.go_live(transport.clone(), version) {
                        transport.close().await;
                        return false;
                    }
                    info!(
                        peer = %transport.peer(),
                        attempt = attempt + 1,
                        generation = self.session.generation(),
                        "Device session re-established"
                    );
                    return true;
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, attempts, error = %err, "Reconnect failed")
                }
            }
        }
        error!(attempts, "Giving up on device after reconnect attempts");
        false
    }

    async fn shutdown(&mut self) {
        if let Some(transport) = self.session.close() {
            transport.close().await;
        }
        self.pending.fail_all("session closed");
        self.cache.invalidate();
        self.receiver.close();
    }
}

/// Send one frame on the serving transport.
///
/// Returns a reason when the link must be treated as lost: the send failed
/// at the link level or did not finish within `window`, as happens when the
/// peer stops reading.
async fn send_within(
    transport: &dyn Transport,
    frame: Frame,
    window: Duration,
) -> Option<String> {
    match tokio::time::timeout(window, transport.send(frame)).await {
        Ok(Ok(())) => None,
        Ok(Err(err)) if is_link_failure(&err) => Some(format!("send failed: {err}")),
        Ok(Err(err)) => {
            debug!(error = %err, "Frame not sent");
            None
        }
        Err(_) => Some(format!("send stalled for {window:?}")),
    }
}

/// Open a transport and run the Hello handshake on it.
async fn open_and_handshake(
    connector: &dyn Connector,
    config: &TransferConfig,
) -> Result<(Arc<dyn Transport>, u8)> {
    let transport = connector.open().await.map_err(|err| match err {
        err @ TransferError::Connection { .. } => err,
        other => {
            TransferError::connection_failed_with_source("cannot open transport", Box::new(other))
        }
    })?;
    match handshake(transport.as_ref(), config).await {
        Ok(version) => Ok((transport, version)),
        Err(err) => {
            transport.close().await;
            Err(err)
        }
    }
}

async fn handshake(transport: &dyn Transport, config: &TransferConfig) -> Result<u8> {
    transport.send(Frame::hello(PROTOCOL_VERSION)).await.map_err(|err| {
        TransferError::connection_failed_with_source("hello not sent", Box::new(err))
    })?;

    let timeout = config.connect_timeout();
    let deadline = Instant::now() + timeout;
    loop {
        let frame = match tokio::time::timeout_at(deadline, transport.recv()).await {
            Err(_) => {
                return Err(TransferError::connection_failed(format!(
                    "no hello ack from {} within {timeout:?}",
                    transport.peer()
                )));
            }
            Ok(Err(err)) if is_link_failure(&err) => {
                return Err(TransferError::connection_failed_with_source(
                    "handshake interrupted",
                    Box::new(err),
                ));
            }
            Ok(Err(err)) => {
                debug!(error = %err, "Ignoring malformed frame during handshake");
                continue;
            }
            Ok(Ok(frame)) => frame,
        };

        match frame.kind {
            MessageKind::HelloAck => {
                let version = frame.protocol_version().ok_or_else(|| {
                    TransferError::connection_failed("hello ack without protocol version")
                })?;
                if version == 0 || version > PROTOCOL_VERSION {
                    return Err(TransferError::connection_failed(format!(
                        "device speaks protocol {version}, this library supports up to {PROTOCOL_VERSION}"
                    )));
                }
                return Ok(version);
            }
            MessageKind::Reject => {
                let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                return Err(TransferError::connection_failed(format!(
                    "device rejected connection: {reason}"
                )));
            }
            other => trace!(kind = ?other, "Ignoring frame before hello ack"),
        }
    }
}
