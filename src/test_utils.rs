//! Simulated device and fixtures for tests and benchmarks.
//!
//! [`MockDevice`] speaks the real wire protocol over [`MemoryTransport`] pairs:
//! it answers the handshake, heartbeats and parameter requests from an
//! in-memory parameter table and can push image sets and updates on demand.
//! It also implements [`Connector`], so the connection manager reconnects to
//! it exactly as it would to a network device. For end-to-end tests it can
//! additionally accept TCP connections and answer discovery probes on
//! loopback.

#![cfg(any(test, feature = "test-utils"))]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, trace, warn};

use crate::config::TransferConfig;
use crate::connection::DeviceConnection;
use crate::params::ids;
use crate::protocol::{
    Frame, MAX_PAYLOAD_SIZE, MessageKind, PROTOCOL_VERSION, ParameterOp, ParameterRequest,
    ParameterResponse, RemoteErrorKind, ResponseBody, UNSOLICITED_REQUEST_ID, fragment_image_set,
};
use crate::discovery::DISCOVERY_PROBE;
use crate::transport::{Connector, MemoryTransport, TcpTransport, Transport};
use crate::types::{
    Channel, ImageSet, ImageType, ParameterDescriptor, ParameterType, ParameterValue, PixelFormat,
    Timestamp,
};
use crate::{Result, TransferError};

/// Parameter id of the read-only model name exposed by [`MockDevice`].
pub const MODEL_NAME: &str = "model_name";

/// Order in which [`MockDevice::publish_image_set`] sends fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOrder {
    InOrder,
    Reversed,
    /// Odd indices first, then even ones
    Interleaved,
    /// Every fragment twice
    Duplicated,
}

impl FragmentOrder {
    fn arrange(self, frames: Vec<Frame>) -> Vec<Frame> {
        match self {
            FragmentOrder::InOrder => frames,
            FragmentOrder::Reversed => frames.into_iter().rev().collect(),
            FragmentOrder::Interleaved => {
                let (odd, even): (Vec<_>, Vec<_>) =
                    frames.into_iter().partition(|f| f.fragment_index % 2 == 1);
                odd.into_iter().chain(even).collect()
            }
            FragmentOrder::Duplicated => frames.into_iter().flat_map(|f| [f.clone(), f]).collect(),
        }
    }
}

struct MockState {
    parameters: BTreeMap<String, ParameterDescriptor>,
    fragment_payload: usize,
    refuse: bool,
    reject: Option<String>,
    silent: bool,
    delays: HashMap<String, Duration>,
    requests: usize,
    connections: usize,
    persisted: BTreeSet<String>,
    reboots: usize,
    link: Option<Arc<dyn Transport>>,
}

/// In-process stand-in for a stereo device.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        let parameters = default_parameters().into_iter().map(|d| (d.uid.clone(), d)).collect();
        let state = MockState {
            parameters,
            fragment_payload: 256,
            refuse: false,
            reject: None,
            silent: false,
            delays: HashMap::new(),
            requests: 0,
            connections: 0,
            persisted: BTreeSet::new(),
            reboots: 0,
            link: None,
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Connect a [`DeviceConnection`] to this device.
    pub async fn connect(&self, config: TransferConfig) -> Result<DeviceConnection> {
        DeviceConnection::connect_with(Arc::new(self.clone()), config).await
    }

    /// Add or replace a parameter in the device table.
    pub fn insert_parameter(&self, descriptor: ParameterDescriptor) {
        self.state.lock().parameters.insert(descriptor.uid.clone(), descriptor);
    }

    /// Current device-side descriptor.
    pub fn parameter(&self, id: &str) -> Option<ParameterDescriptor> {
        self.state.lock().parameters.get(id).cloned()
    }

    /// Parameter requests received over all links.
    pub fn request_count(&self) -> usize {
        self.state.lock().requests
    }

    /// Transports opened so far, including refused ones.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections
    }

    /// Ids persisted through the parameter channel.
    pub fn persisted(&self) -> BTreeSet<String> {
        self.state.lock().persisted.clone()
    }

    /// Reboot commands received.
    pub fn reboot_count(&self) -> usize {
        self.state.lock().reboots
    }

    pub fn set_fragment_payload(&self, bytes: usize) {
        self.state.lock().fragment_payload = bytes;
    }

    /// Fail every following connection attempt.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Answer every following Hello with a Reject carrying `reason`.
    pub fn reject_with(&self, reason: Option<&str>) {
        self.state.lock().reject = reason.map(str::to_string);
    }

    /// Stop answering anything, including handshakes.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Delay responses to requests for `id`.
    pub fn delay_responses(&self, id: &str, delay: Duration) {
        self.state.lock().delays.insert(id.to_string(), delay);
    }

    /// Drop the active link, as a cable pull would.
    pub async fn sever(&self) {
        let link = self.state.lock().link.take();
        if let Some(link) = link {
            debug!(peer = %link.peer(), "Severing mock link");
            link.close().await;
        }
    }

    /// Fragment `set` and send it on the active link.
    pub async fn publish_image_set(&self, set: &ImageSet, order: FragmentOrder) -> Result<()> {
        let payload = self.state.lock().fragment_payload;
        let frames = order.arrange(fragment_image_set(set, payload)?);
        self.send_frames(frames).await
    }

    /// Send frames verbatim on the active link.
    pub async fn send_frames(&self, frames: Vec<Frame>) -> Result<()> {
        let link = self.link()?;
        for frame in frames {
            link.send(frame).await?;
        }
        Ok(())
    }

    /// Change a value on the device and push the update to the client.
    pub async fn push_update(&self, id: &str, value: ParameterValue) -> Result<()> {
        let descriptor = {
            let mut state = self.state.lock();
            let descriptor = state
                .parameters
                .get_mut(id)
                .ok_or_else(|| TransferError::UnknownParameter { id: id.to_string() })?;
            descriptor.current = value;
            descriptor.clone()
        };
        let response = ParameterResponse {
            request_id: UNSOLICITED_REQUEST_ID,
            body: ResponseBody::Update(descriptor),
        };
        self.link()?.send(response.to_frame()?).await
    }

    fn link(&self) -> Result<Arc<dyn Transport>> {
        self.state
            .lock()
            .link
            .clone()
            .ok_or_else(|| TransferError::connection_lost("no active mock link"))
    }

    /// Accept TCP connections on an ephemeral loopback port.
    ///
    /// Every accepted stream becomes the active link, like [`Connector::open`]
    /// does for in-memory links.
    pub async fn listen_tcp(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let device = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let refused = {
                    let mut state = device.state.lock();
                    state.connections += 1;
                    state.refuse
                };
                if refused {
                    debug!(%peer, "Mock device refusing TCP connection");
                    continue;
                }
                let transport: Arc<dyn Transport> = match TcpTransport::from_stream(stream) {
                    Ok(transport) => Arc::new(transport),
                    Err(err) => {
                        warn!(%peer, error = %err, "Mock device cannot use TCP stream");
                        continue;
                    }
                };
                device.state.lock().link = Some(transport.clone());
                tokio::spawn(device.clone().serve(transport));
            }
        });
        Ok(address)
    }

    /// Answer discovery probes on an ephemeral loopback port, advertising a
    /// TCP device whose image port is configured on the client side.
    pub async fn answer_discovery(&self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let address = socket.local_addr()?;
        let reply = discovery_reply();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((len, client)) = socket.recv_from(&mut buf).await {
                if &buf[..len] != DISCOVERY_PROBE {
                    continue;
                }
                if let Err(err) = socket.send_to(&reply, client).await {
                    warn!(%client, error = %err, "Mock discovery reply not sent");
                }
            }
        });
        Ok(address)
    }

    async fn serve(self, link: Arc<dyn Transport>) {
        loop {
            let frame = match link.recv().await {
                Ok(frame) => frame,
                Err(TransferError::MalformedFrame { .. }) => continue,
                Err(_) => break,
            };
            if self.state.lock().silent {
                trace!(kind = ?frame.kind, "Mock device ignoring frame");
                continue;
            }
            let reply = match frame.kind {
                MessageKind::Hello => {
                    let reject = self.state.lock().reject.clone();
                    match reject {
                        Some(reason) => Frame::reject(&reason),
                        None => Frame::new(MessageKind::HelloAck, 0, vec![PROTOCOL_VERSION]),
                    }
                }
                MessageKind::Heartbeat => Frame::control(MessageKind::HeartbeatAck, frame.id),
                MessageKind::ParameterRequest => {
                    let Ok(request) = ParameterRequest::from_frame(&frame) else {
                        continue;
                    };
                    self.answer(request, link.clone());
                    continue;
                }
                _ => continue,
            };
            if link.send(reply).await.is_err() {
                break;
            }
        }
        trace!(peer = %link.peer(), "Mock device link finished");
    }

    fn answer(&self, request: ParameterRequest, link: Arc<dyn Transport>) {
        let (body, delay) = {
            let mut state = self.state.lock();
            state.requests += 1;
            let delay = match &request.op {
                ParameterOp::Get { id } | ParameterOp::Set { id, .. } => {
                    state.delays.get(id).copied()
                }
                _ => None,
            };
            (state.apply(request.op), delay)
        };
        let request_id = request.request_id;
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let frames = ParameterResponse { request_id, body }
                .to_frames(MAX_PAYLOAD_SIZE)
                .or_else(|err| {
                    warn!(request_id, error = %err, "Mock device cannot encode response");
                    let body = ResponseBody::Error {
                        kind: RemoteErrorKind::Other,
                        id: String::new(),
                        message: format!("response not encodable: {err}"),
                    };
                    ParameterResponse { request_id, body }.to_frames(MAX_PAYLOAD_SIZE)
                });
            let frames = match frames {
                Ok(frames) => frames,
                Err(err) => {
                    warn!(request_id, error = %err, "Mock device dropped response");
                    return;
                }
            };
            for frame in frames {
                if let Err(err) = link.send(frame).await {
                    warn!(request_id, error = %err, "Mock device response not sent");
                    return;
                }
            }
        });
    }
}

impl MockState {
    fn apply(&mut self, op: ParameterOp) -> ResponseBody {
        match op {
            ParameterOp::List => ResponseBody::Listing(self.parameters.values().cloned().collect()),
            ParameterOp::Get { id } => match self.parameters.get(&id) {
                Some(descriptor) => ResponseBody::Descriptor(descriptor.clone()),
                None => unknown(id),
            },
            ParameterOp::Set { id, value } => match self.write(&id, value) {
                Ok(descriptor) => ResponseBody::Ack(descriptor),
                Err(body) => body,
            },
            ParameterOp::Batch { writes } => {
                let before = self.parameters.clone();
                let reboots = self.reboots;
                let mut applied = Vec::with_capacity(writes.len());
                for (id, value) in writes {
                    match self.write(&id, value) {
                        Ok(descriptor) => applied.push(descriptor),
                        Err(body) => {
                            self.parameters = before;
                            self.reboots = reboots;
                            return body;
                        }
                    }
                }
                ResponseBody::BatchAck(applied)
            }
            ParameterOp::Persist { ids } => {
                if let Some(missing) = ids.iter().find(|id| !self.parameters.contains_key(*id)) {
                    return unknown(missing.clone());
                }
                self.persisted.extend(ids.iter().cloned());
                ResponseBody::Persisted(ids)
            }
        }
    }

    fn write(
        &mut self,
        id: &str,
        value: ParameterValue,
    ) -> std::result::Result<ParameterDescriptor, ResponseBody> {
        let Some(descriptor) = self.parameters.get_mut(id) else {
            return Err(unknown(id.to_string()));
        };
        match descriptor.validate(value) {
            Ok(value) => {
                descriptor.current = value;
                if id == ids::REBOOT {
                    self.reboots += 1;
                }
                Ok(descriptor.clone())
            }
            Err(err) => Err(ResponseBody::Error {
                kind: RemoteErrorKind::from_error(&err),
                id: id.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

fn unknown(id: String) -> ResponseBody {
    ResponseBody::Error {
        kind: RemoteErrorKind::UnknownParameter,
        id,
        message: "no such parameter".to_string(),
    }
}

#[async_trait::async_trait]
impl Connector for MockDevice {
    async fn open(&self) -> Result<Arc<dyn Transport>> {
        let (client, device) = MemoryTransport::pair("mock");
        let device: Arc<dyn Transport> = Arc::new(device);
        {
            let mut state = self.state.lock();
            state.connections += 1;
            if state.refuse {
                return Err(TransferError::connection_failed("mock device refused connection"));
            }
            state.link = Some(device.clone());
        }
        tokio::spawn(self.clone().serve(device));
        Ok(Arc::new(client))
    }
}

/// Extensible v1 discovery reply: SceneScan Pro over TCP with status and
/// serial number.
fn discovery_reply() -> Vec<u8> {
    fn fixed(text: &str, width: usize) -> Vec<u8> {
        let mut field = text.as_bytes().to_vec();
        field.resize(width, 0);
        field
    }

    let mut reply = Vec::with_capacity(70);
    reply.put_u8(PROTOCOL_VERSION);
    reply.put_u8(1);
    reply.put_u8(1);
    reply.extend(fixed("mock-1.0", 14));
    reply.put_f64_le(25.0);
    reply.put_u32_le(0);
    reply.extend(fixed("sim", 8));
    reply.put_u8(1);
    reply.extend(fixed("MOCK-0001", 32));
    reply
}

/// Parameter table the mock device starts with.
pub fn default_parameters() -> Vec<ParameterDescriptor> {
    let mut trigger =
        ParameterDescriptor::new(ids::TRIGGER_FREQUENCY, ParameterType::Double, 10.0f64.into())
            .with_range(1.0, 60.0)
            .with_increment(0.5);
    trigger.unit = "Hz".to_string();

    let operation_mode =
        ParameterDescriptor::new(ids::OPERATION_MODE, ParameterType::Int, 2i64.into())
            .with_option(0i64.into(), "Pass through")
            .with_option(1i64.into(), "Rectify")
            .with_option(2i64.into(), "Stereo matching");

    let auto_exposure =
        ParameterDescriptor::new(ids::AUTO_EXPOSURE_MODE, ParameterType::Int, 0i64.into())
            .with_option(0i64.into(), "Auto exposure and gain")
            .with_option(1i64.into(), "Auto exposure, manual gain")
            .with_option(2i64.into(), "Manual exposure, auto gain")
            .with_option(3i64.into(), "Manual exposure and gain");

    let mut exposure = ParameterDescriptor::new(
        ids::MANUAL_EXPOSURE_TIME,
        ParameterType::Double,
        2000.0f64.into(),
    )
    .with_range(10.0, 50_000.0);
    exposure.unit = "us".to_string();

    let model = "SceneScan Pro (simulated)";
    vec![
        trigger,
        operation_mode,
        auto_exposure,
        exposure,
        ParameterDescriptor::new(ids::DISPARITY_OFFSET, ParameterType::Int, 0i64.into())
            .with_range(0.0, 64.0),
        ParameterDescriptor::new(ids::CONSISTENCY_CHECK_ENABLED, ParameterType::Bool, true.into()),
        ParameterDescriptor::new(ids::REBOOT, ParameterType::Command, false.into()),
        ParameterDescriptor::new(MODEL_NAME, ParameterType::String, model.into()).read_only(),
    ]
}

/// Left image plus 12-bit disparity map filled with a pattern derived from
/// `sequence`, so every set is distinguishable.
pub fn test_image_set(sequence: u32, width: u32, height: u32) -> ImageSet {
    let pixels = (width * height) as usize;
    let left: Vec<u8> = (0..pixels).map(|i| (i as u32 ^ sequence) as u8).collect();
    let disparity: Vec<u8> = (0..pixels)
        .flat_map(|i| (((i as u32 + sequence) & 0x0fff) as u16).to_le_bytes())
        .collect();
    let channel = |image_type, format: PixelFormat, data| Channel {
        image_type,
        format,
        width,
        height,
        row_stride: width * format.bytes_per_pixel(),
        data,
    };
    ImageSet {
        sequence_number: sequence,
        timestamp: Timestamp::new(1_700_000_000, sequence % 1_000_000),
        exposure_us: 1000,
        channels: vec![
            channel(ImageType::Left, PixelFormat::Mono8, left),
            channel(ImageType::Disparity, PixelFormat::Mono12, disparity),
        ],
    }
}

/// Short timings so reconnect and timeout paths finish quickly in tests.
pub fn fast_config() -> TransferConfig {
    TransferConfig {
        connect_timeout_ms: 200,
        request_timeout_ms: 300,
        heartbeat_interval_ms: 20,
        liveness_window_ms: 200,
        max_reconnect_attempts: 3,
        reconnect_backoff_ms: 10,
        max_reconnect_backoff_ms: 40,
        ..TransferConfig::default()
    }
}
