//! Device enumeration over UDP broadcast.
//!
//! A probe is broadcast on every non-loopback IPv4 interface (plus any
//! configured targets) and replies are collected until the timeout expires.
//! Replies come in four layouts, distinguished by length:
//!
//! | Layout          | Bytes | Adds                                       |
//! |-----------------|-------|--------------------------------------------|
//! | basic           | 17    | version, model, use-TCP flag, firmware     |
//! | with status     | 37    | last fps, jumbo MTU, capture source        |
//! | extensible v0   | 38    | extension version                          |
//! | extensible v1   | 70    | serial number                              |
//!
//! All multi-byte fields are little-endian.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Buf;
use if_addrs::{IfAddr, get_if_addrs};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::config::TransferConfig;
use crate::protocol::PROTOCOL_VERSION;
use crate::types::{DeviceDescriptor, DeviceModel, DeviceStatus, NetworkProtocol};
use crate::{Result, TransferError};

/// Probe payload a device answers to.
pub const DISCOVERY_PROBE: &[u8] = b"STEREOLINK-DISCOVER";

const BASIC_LEN: usize = 17;
const WITH_STATUS_LEN: usize = BASIC_LEN + 8 + 4 + 8;
const EXTENSIBLE_V0_LEN: usize = WITH_STATUS_LEN + 1;
const EXTENSIBLE_V1_LEN: usize = EXTENSIBLE_V0_LEN + 32;

/// Highest reply extension version this library parses.
pub const DISCOVERY_EXTENSION_VERSION: u8 = 1;

const REPLY_BUFFER: usize = 512;

/// Finds devices on the local network.
#[derive(Debug, Clone)]
pub struct DeviceEnumeration {
    config: TransferConfig,
    broadcast: bool,
}

impl DeviceEnumeration {
    pub fn new(config: TransferConfig) -> Self {
        Self { config, broadcast: true }
    }

    /// Only probe the configured `discovery_targets`, skip interface broadcasts.
    pub fn targets_only(mut self) -> Self {
        self.broadcast = false;
        self
    }

    /// Probe and collect replies for `timeout`.
    ///
    /// Devices are deduplicated by address and returned in the order their
    /// first reply arrived. No replies is not an error.
    pub async fn discover_devices(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let socket = UdpSocket::bind(bind).await.map_err(|e| TransferError::io(bind, e))?;
        socket.set_broadcast(true).map_err(|e| TransferError::io(bind, e))?;

        let targets = self.targets()?;
        let mut sent = 0usize;
        for target in &targets {
            match socket.send_to(DISCOVERY_PROBE, target).await {
                Ok(_) => {
                    trace!(%target, "Discovery probe sent");
                    sent += 1;
                }
                Err(err) => warn!(%target, error = %err, "Discovery probe not sent"),
            }
        }
        if sent == 0 && !targets.is_empty() {
            return Err(TransferError::connection_failed(
                "discovery probe could not be sent to any target",
            ));
        }
        debug!(targets = targets.len(), sent, ?timeout, "Collecting discovery replies");

        let mut devices = Vec::new();
        let mut seen = HashSet::new();
        let mut buffer = vec![0u8; REPLY_BUFFER];
        let timer = tokio::time::sleep(timeout);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => break,
                received = socket.recv_from(&mut buffer) => {
                    let (len, source) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            // ICMP unreachable from a probed target surfaces here on some platforms
                            debug!(error = %err, "Discovery receive failed");
                            continue;
                        }
                    };
                    let reply = parse_reply(&buffer[..len], source, self.config.image_port);
                    let Some(device) = reply else {
                        debug!(%source, len, "Ignoring malformed discovery reply");
                        continue;
                    };
                    if seen.insert(device.address) {
                        info!(%device, "Discovered device");
                        devices.push(device);
                    }
                }
            }
        }
        Ok(devices)
    }

    /// Like [`discover_devices`](Self::discover_devices), but no reply is a
    /// [`TransferError::DiscoveryTimeout`].
    pub async fn require_devices(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.discover_devices(timeout).await?;
        if devices.is_empty() {
            return Err(TransferError::DiscoveryTimeout { timeout });
        }
        Ok(devices)
    }

    fn targets(&self) -> Result<Vec<SocketAddr>> {
        let mut targets = Vec::new();
        if self.broadcast {
            let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
            for iface in get_if_addrs().map_err(|e| TransferError::io(unspecified, e))? {
                let IfAddr::V4(v4) = iface.addr else {
                    continue;
                };
                if v4.ip.is_loopback() {
                    continue;
                }
                let broadcast = v4.broadcast.unwrap_or(Ipv4Addr::BROADCAST);
                trace!(interface = %iface.name, %broadcast, "Broadcast target");
                targets.push(SocketAddr::new(IpAddr::V4(broadcast), self.config.discovery_port));
            }
        }
        for target in &self.config.discovery_targets {
            if !targets.contains(target) {
                targets.push(*target);
            }
        }
        Ok(targets)
    }
}

/// Probe with a default enumeration built from `config`.
pub async fn discover_devices(
    timeout: Duration,
    config: &TransferConfig,
) -> Result<Vec<DeviceDescriptor>> {
    DeviceEnumeration::new(config.clone()).discover_devices(timeout).await
}

/// Parse one reply; `None` when it is truncated relative to its layout.
fn parse_reply(reply: &[u8], source: SocketAddr, image_port: u16) -> Option<DeviceDescriptor> {
    let len = reply.len();
    let legacy = len == BASIC_LEN;
    let legacy_with_status = len == WITH_STATUS_LEN;
    if !(legacy || legacy_with_status) {
        if len < EXTENSIBLE_V0_LEN {
            return None;
        }
        if reply[WITH_STATUS_LEN] >= 1 && len < EXTENSIBLE_V1_LEN {
            return None;
        }
    }

    let mut buf = reply;
    let protocol_version = buf.get_u8();
    let model = DeviceModel::from_code(buf.get_u8());
    let protocol = if buf.get_u8() != 0 { NetworkProtocol::Tcp } else { NetworkProtocol::Udp };
    let firmware_version = fixed_str(&buf[..14]);
    buf.advance(14);

    let mut descriptor = DeviceDescriptor {
        address: SocketAddr::new(source.ip(), image_port),
        protocol,
        firmware_version,
        model,
        compatible: (1..=PROTOCOL_VERSION).contains(&protocol_version),
        serial_number: String::new(),
        status: None,
    };
    if legacy {
        return Some(descriptor);
    }

    let last_fps = buf.get_f64_le();
    let jumbo_mtu = buf.get_u32_le();
    let capture_source = fixed_str(&buf[..8]);
    buf.advance(8);
    descriptor.status = Some(DeviceStatus { last_fps, jumbo_mtu, capture_source });
    if legacy_with_status {
        return Some(descriptor);
    }

    let extension = buf.get_u8();
    if extension >= 1 {
        descriptor.serial_number = fixed_str(&buf[..32]);
    }
    if extension > DISCOVERY_EXTENSION_VERSION {
        debug!(extension, address = %descriptor.address, "Device reports newer discovery fields");
    }
    Some(descriptor)
}

/// NUL-padded fixed-width string field.
fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn fixed(text: &str, width: usize) -> Vec<u8> {
        let mut field = text.as_bytes().to_vec();
        field.resize(width, 0);
        field
    }

    fn reply(extension: Option<u8>, with_status: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(1);
        buf.put_u8(1);
        buf.extend(fixed("10.2.1", 14));
        if with_status {
            buf.put_f64_le(29.5);
            buf.put_u32_le(9000);
            buf.extend(fixed("camera", 8));
        }
        if let Some(extension) = extension {
            buf.put_u8(extension);
            if extension >= 1 {
                buf.extend(fixed("SN-4711", 32));
            }
        }
        buf
    }

    fn source() -> SocketAddr {
        "192.168.10.10:7680".parse().unwrap()
    }

    #[test]
    fn basic_reply() {
        let device = parse_reply(&reply(None, false), source(), 7681).unwrap();
        assert_eq!(device.address, "192.168.10.10:7681".parse::<SocketAddr>().unwrap());
        assert_eq!(device.protocol, NetworkProtocol::Tcp);
        assert_eq!(device.model, DeviceModel::SceneScanPro);
        assert_eq!(device.firmware_version, "10.2.1");
        assert!(device.compatible);
        assert!(device.status.is_none());
        assert!(device.serial_number.is_empty());
    }

    #[test]
    fn reply_with_status_and_serial() {
        let device = parse_reply(&reply(Some(1), true), source(), 7681).unwrap();
        let status = device.status.unwrap();
        assert_eq!(status.last_fps, 29.5);
        assert!(status.jumbo_frames_enabled());
        assert_eq!(status.capture_source, "camera");
        assert_eq!(device.serial_number, "SN-4711");
    }

    #[test]
    fn extension_v0_has_no_serial() {
        let device = parse_reply(&reply(Some(0), true), source(), 7681).unwrap();
        assert!(device.status.is_some());
        assert!(device.serial_number.is_empty());
    }

    #[test]
    fn truncated_replies_are_skipped() {
        let mut truncated = reply(Some(1), true);
        truncated.truncate(EXTENSIBLE_V1_LEN - 5);
        assert!(parse_reply(&truncated, source(), 7681).is_none());
        assert!(parse_reply(&reply(None, false)[..10], source(), 7681).is_none());
        assert!(parse_reply(&reply(Some(0), true)[..30], source(), 7681).is_none());
    }

    #[test]
    fn newer_protocol_is_incompatible() {
        let mut newer = reply(None, false);
        newer[0] = PROTOCOL_VERSION + 1;
        assert!(!parse_reply(&newer, source(), 7681).unwrap().compatible);
    }

    #[tokio::test]
    async fn discovers_loopback_responder_once() {
        let _ = tracing_subscriber::fmt::try_init();
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, client) = responder.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], DISCOVERY_PROBE);
            let valid = reply(Some(1), true);
            responder.send_to(&valid, client).await.unwrap();
            responder.send_to(&valid, client).await.unwrap();
            responder.send_to(&valid[..EXTENSIBLE_V1_LEN - 1], client).await.unwrap();
        });

        let config = TransferConfig {
            discovery_targets: vec![responder_addr],
            ..TransferConfig::default()
        };
        let enumeration = DeviceEnumeration::new(config).targets_only();
        let devices = enumeration.discover_devices(Duration::from_millis(200)).await.unwrap();
        task.await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address.ip(), responder_addr.ip());
        assert_eq!(devices[0].address.port(), crate::config::DEFAULT_IMAGE_PORT);
        assert_eq!(devices[0].serial_number, "SN-4711");
    }

    #[tokio::test]
    async fn require_devices_times_out_without_replies() {
        let enumeration = DeviceEnumeration::new(TransferConfig::default()).targets_only();
        let err = enumeration.require_devices(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, TransferError::DiscoveryTimeout { .. }));
    }
}
