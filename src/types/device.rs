//! Device descriptors produced by discovery

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Transport used for image and parameter traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkProtocol::Tcp => f.write_str("TCP"),
            NetworkProtocol::Udp => f.write_str("UDP"),
        }
    }
}

/// Hardware model reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceModel {
    SceneScan,
    SceneScanPro,
    Ruby,
    /// Model code not known to this library version
    Unknown(u8),
}

impl DeviceModel {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => DeviceModel::SceneScan,
            1 => DeviceModel::SceneScanPro,
            2 => DeviceModel::Ruby,
            other => DeviceModel::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DeviceModel::SceneScan => 0,
            DeviceModel::SceneScanPro => 1,
            DeviceModel::Ruby => 2,
            DeviceModel::Unknown(code) => code,
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceModel::SceneScan => f.write_str("SceneScan"),
            DeviceModel::SceneScanPro => f.write_str("SceneScan Pro"),
            DeviceModel::Ruby => f.write_str("Ruby"),
            DeviceModel::Unknown(code) => write!(f, "unknown model {code}"),
        }
    }
}

/// Live status block some firmware versions append to discovery replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Frame rate of the last processed second
    pub last_fps: f64,
    /// Jumbo frame MTU, 0 when disabled
    pub jumbo_mtu: u32,
    /// Current capture source, e.g. "camera" or "file"
    pub capture_source: String,
}

impl DeviceStatus {
    pub fn jumbo_frames_enabled(&self) -> bool {
        self.jumbo_mtu > 0
    }
}

/// A device found on the network.
///
/// Descriptors are immutable once returned by discovery and may be passed to
/// [`crate::Stereolink::connect`] as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub address: SocketAddr,
    pub protocol: NetworkProtocol,
    pub firmware_version: String,
    pub model: DeviceModel,
    /// Whether the device speaks a protocol version this library supports
    pub compatible: bool,
    /// Empty when the device does not report one
    pub serial_number: String,
    pub status: Option<DeviceStatus>,
}

impl DeviceDescriptor {
    /// Descriptor for a device at a known address, bypassing discovery.
    pub fn at(address: SocketAddr, protocol: NetworkProtocol) -> Self {
        Self {
            address,
            protocol,
            firmware_version: String::new(),
            model: DeviceModel::Unknown(u8::MAX),
            compatible: true,
            serial_number: String::new(),
            status: None,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) {}", self.address, self.protocol, self.model)?;
        if !self.firmware_version.is_empty() {
            write!(f, " fw {}", self.firmware_version)?;
        }
        if !self.serial_number.is_empty() {
            write!(f, " s/n {}", self.serial_number)?;
        }
        if let Some(status) = &self.status {
            write!(f, " [{:.1} fps, {}]", status.last_fps, status.capture_source)?;
        }
        if !self.compatible {
            f.write_str(" INCOMPATIBLE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_codes_round_trip() {
        for code in 0..=5u8 {
            assert_eq!(DeviceModel::from_code(code).code(), code);
        }
        assert_eq!(DeviceModel::from_code(9), DeviceModel::Unknown(9));
    }

    #[test]
    fn display_includes_optional_fields() {
        let address = "192.168.10.10:7681".parse().unwrap();
        let mut device = DeviceDescriptor::at(address, NetworkProtocol::Udp);
        device.model = DeviceModel::SceneScanPro;
        device.firmware_version = "10.2.0".into();
        device.serial_number = "SN1234".into();
        device.status = Some(DeviceStatus {
            last_fps: 29.97,
            jumbo_mtu: 9000,
            capture_source: "camera".into(),
        });

        let line = device.to_string();
        assert!(line.contains("192.168.10.10:7681"));
        assert!(line.contains("SceneScan Pro"));
        assert!(line.contains("fw 10.2.0"));
        assert!(line.contains("s/n SN1234"));
        assert!(line.contains("30.0 fps"));
        assert!(!line.contains("INCOMPATIBLE"));
    }
}
