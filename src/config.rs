//! Transfer configuration
//!
//! All fields have defaults, so a YAML file only needs to list what differs:
//!
//! ```yaml
//! heartbeat_interval_ms: 250
//! max_reconnect_attempts: 10
//! stale_policy: report
//! discovery_targets: ["10.0.0.255:7680"]
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, TransferError};

/// Default UDP port devices answer discovery probes on.
pub const DEFAULT_DISCOVERY_PORT: u16 = 7680;

/// Default port of the data channel carrying image and parameter traffic.
pub const DEFAULT_IMAGE_PORT: u16 = 7681;

/// What to do with image fragments older than the assembler watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalePolicy {
    /// Drop silently and count them
    #[default]
    Drop,
    /// Report them as malformed frames
    Report,
}

/// Tunables for discovery, sessions, reassembly and parameter requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub discovery_port: u16,
    pub image_port: u16,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Session is degraded when nothing arrives for this long
    pub liveness_window_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Base delay, doubled per attempt
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
    /// Largest image fragment payload in bytes
    pub max_fragment_payload: usize,
    pub stale_policy: StalePolicy,
    /// Extra probe destinations, e.g. directed broadcasts on routed networks
    pub discovery_targets: Vec<SocketAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            image_port: DEFAULT_IMAGE_PORT,
            connect_timeout_ms: 2000,
            request_timeout_ms: 1000,
            heartbeat_interval_ms: 200,
            liveness_window_ms: 1000,
            max_reconnect_attempts: 5,
            reconnect_backoff_ms: 50,
            max_reconnect_backoff_ms: 2000,
            max_fragment_payload: 1452,
            stale_policy: StalePolicy::Drop,
            discovery_targets: Vec::new(),
        }
    }
}

impl TransferConfig {
    /// Parse a YAML document, filling absent fields with defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: TransferConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| TransferError::config(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| TransferError::Config {
            details: format!("cannot read file: {e}"),
            path: Some(path.to_path_buf()),
        })?;
        Self::from_yaml_str(&yaml).map_err(|err| match err {
            TransferError::Config { details, .. } => {
                TransferError::Config { details, path: Some(path.to_path_buf()) }
            }
            other => other,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(TransferError::config("heartbeat_interval_ms must be positive"));
        }
        if self.liveness_window_ms <= self.heartbeat_interval_ms {
            return Err(TransferError::config(format!(
                "liveness_window_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.liveness_window_ms, self.heartbeat_interval_ms
            )));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(TransferError::config("timeouts must be positive"));
        }
        let max_payload = crate::protocol::MAX_PAYLOAD_SIZE;
        if self.max_fragment_payload < 64 || self.max_fragment_payload > max_payload {
            return Err(TransferError::config(format!(
                "max_fragment_payload must lie in 64..={max_payload}"
            )));
        }
        if self.max_reconnect_backoff_ms < self.reconnect_backoff_ms {
            return Err(TransferError::config(
                "max_reconnect_backoff_ms must not be below reconnect_backoff_ms",
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    /// Delay before reconnect attempt `attempt` (0-based): base * 2^attempt, capped.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        let millis = self.reconnect_backoff_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_reconnect_backoff_ms))
    }
}
