//! Error types for image transfer and parameter synchronization.
//!
//! All errors implement the `std::error::Error` trait and carry enough context
//! to decide whether an operation can be retried.
//!
//! ## Error Categories
//!
//! - **Discovery**: no device answered the broadcast probe
//! - **Transport**: connection setup failures and lost sessions
//! - **Protocol**: corrupt or inconsistent frames on the wire
//! - **Parameter validation**: unknown ids, read-only parameters, bad values
//! - **Timeouts**: requests that received no response before their deadline
//!
//! ## Recovery and Retry
//!
//! Transport faults are retried inside the connection manager up to a bounded
//! count. Protocol and validation faults always reach the caller:
//!
//! ```rust
//! use stereolink::TransferError;
//!
//! let error = TransferError::connection_failed("device did not answer hello");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for transfer operations.
pub type Result<T, E = TransferError> = std::result::Result<T, E>;

/// Main error type for transfer operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransferError {
    #[error("No devices answered discovery within {timeout:?}")]
    DiscoveryTimeout { timeout: Duration },

    #[error("Failed to connect to device: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Connection to device lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("Unknown parameter '{id}'")]
    UnknownParameter { id: String },

    #[error("Parameter '{id}' is not writable")]
    NotWritable { id: String },

    #[error("Value for parameter '{id}' out of range: {details}")]
    ValueOutOfRange { id: String, details: String },

    #[error("Type mismatch for parameter '{id}': expected {expected}, found {found}")]
    TypeMismatch { id: String, expected: String, found: String },

    #[error("Request {request_id} timed out after {duration:?}")]
    RequestTimeout { request_id: u32, duration: Duration },

    #[error("Device rejected request for '{id}': {reason}")]
    Remote { id: String, reason: String },

    #[error("I/O error on {address}")]
    Io {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {details}")]
    Serialization { details: String },

    #[error("Invalid configuration: {details}")]
    Config { details: String, path: Option<PathBuf> },
}

impl TransferError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::DiscoveryTimeout { .. } => true,
            TransferError::Connection { .. } => true,
            TransferError::ConnectionLost { .. } => true,
            TransferError::RequestTimeout { .. } => true,
            TransferError::Io { .. } => true,
            TransferError::MalformedFrame { .. } => false,
            TransferError::UnknownParameter { .. } => false,
            TransferError::NotWritable { .. } => false,
            TransferError::ValueOutOfRange { .. } => false,
            TransferError::TypeMismatch { .. } => false,
            TransferError::Remote { .. } => false,
            TransferError::Serialization { .. } => false,
            TransferError::Config { .. } => false,
        }
    }

    /// Returns true for errors caused by the caller's request rather than the link.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            TransferError::UnknownParameter { .. }
                | TransferError::NotWritable { .. }
                | TransferError::ValueOutOfRange { .. }
                | TransferError::TypeMismatch { .. }
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            TransferError::DiscoveryTimeout { .. } => vec![
                "Check that the device is powered and on the same subnet",
                "Allow UDP broadcast traffic on the discovery port",
                "Connect by explicit address instead of discovery",
            ],
            TransferError::Connection { .. } => vec![
                "Verify the device address and port",
                "Check the firmware protocol version is compatible",
                "Ensure no firewall blocks the image data port",
            ],
            TransferError::ConnectionLost { .. } => vec![
                "Check network cabling and switch configuration",
                "Increase the liveness window for congested links",
                "Reconnect once the device is reachable again",
            ],
            TransferError::MalformedFrame { .. } => vec![
                "Check for packet corruption on the link",
                "Lower the fragment size if jumbo frames are unsupported",
            ],
            TransferError::UnknownParameter { .. } => vec![
                "Check the parameter id spelling",
                "List available parameters with get_parameter_set()",
            ],
            TransferError::NotWritable { .. } => vec![
                "Parameter is read-only for API clients",
                "Check the descriptor access mode before writing",
            ],
            TransferError::ValueOutOfRange { .. } => vec![
                "Consult the descriptor range and increment",
                "Pick one of the listed enum options",
            ],
            TransferError::TypeMismatch { .. } => vec![
                "Send a value matching the parameter type",
                "Use the descriptor type to build the value",
            ],
            TransferError::RequestTimeout { .. } => vec![
                "Increase the request timeout",
                "Check device load and link latency",
            ],
            TransferError::Remote { .. } => vec![
                "Inspect the device-side reason",
                "Check device state allows the change",
            ],
            TransferError::Io { .. } => vec![
                "Check the socket is not already bound",
                "Verify network interface configuration",
            ],
            TransferError::Serialization { .. } => vec![
                "Check blob was produced by a compatible library version",
                "Verify the data was not truncated",
            ],
            TransferError::Config { .. } => vec![
                "Check configuration file syntax",
                "Compare against TransferConfig::default()",
            ],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        TransferError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TransferError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for lost connections.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        TransferError::ConnectionLost { reason: reason.into() }
    }

    /// Helper constructor for malformed frames.
    pub fn malformed(reason: impl Into<String>) -> Self {
        TransferError::MalformedFrame { reason: reason.into() }
    }

    /// Helper constructor for socket errors bound to an address.
    pub fn io(address: SocketAddr, source: std::io::Error) -> Self {
        TransferError::Io { address, source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        TransferError::Config { details: details.into(), path: None }
    }
}

impl From<bincode::Error> for TransferError {
    fn from(err: bincode::Error) -> Self {
        TransferError::Serialization { details: err.to_string() }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io { address: SocketAddr::from(([0, 0, 0, 0], 0)), source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_contain_their_context(
                id in "[a-z_]{1,24}",
                reason in ".*",
                request_id in any::<u32>(),
                duration_ms in 1u64..60_000u64
            ) {
                let unknown = TransferError::UnknownParameter { id: id.clone() };
                let read_only = TransferError::NotWritable { id: id.clone() };
                let lost = TransferError::connection_lost(reason.clone());
                let timeout = TransferError::RequestTimeout {
                    request_id,
                    duration: Duration::from_millis(duration_ms),
                };

                prop_assert!(unknown.to_string().contains(&id));
                prop_assert!(read_only.to_string().contains(&id));
                prop_assert!(lost.to_string().contains(&reason));
                prop_assert!(timeout.to_string().contains(&request_id.to_string()));
            }

            #[test]
            fn validation_errors_are_never_retryable(id in "[a-z_]{1,24}", details in ".*") {
                let errors = [
                    TransferError::UnknownParameter { id: id.clone() },
                    TransferError::NotWritable { id: id.clone() },
                    TransferError::ValueOutOfRange { id: id.clone(), details: details.clone() },
                    TransferError::TypeMismatch {
                        id: id.clone(),
                        expected: "int".into(),
                        found: details.clone(),
                    },
                ];
                for error in errors {
                    prop_assert!(error.is_validation_error());
                    prop_assert!(!error.is_retryable());
                }
            }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<TransferError>();

        let error = TransferError::connection_failed("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn transport_errors_are_retryable() {
        assert!(TransferError::connection_failed("x").is_retryable());
        assert!(TransferError::connection_lost("x").is_retryable());
        assert!(!TransferError::malformed("crc").is_retryable());
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = vec![
            TransferError::DiscoveryTimeout { timeout: Duration::from_millis(50) },
            TransferError::connection_failed("x"),
            TransferError::connection_lost("x"),
            TransferError::malformed("x"),
            TransferError::UnknownParameter { id: "a".into() },
            TransferError::NotWritable { id: "a".into() },
            TransferError::ValueOutOfRange { id: "a".into(), details: "b".into() },
            TransferError::TypeMismatch { id: "a".into(), expected: "b".into(), found: "c".into() },
            TransferError::RequestTimeout { request_id: 1, duration: Duration::from_secs(1) },
            TransferError::Remote { id: "a".into(), reason: "b".into() },
            TransferError::Serialization { details: "x".into() },
            TransferError::config("x"),
        ];
        for error in errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty(), "no suggestions for {error}");
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn connection_error_preserves_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = TransferError::connection_failed_with_source("hello failed", Box::new(io));
        let source = std::error::Error::source(&error).expect("source should be kept");
        assert!(source.to_string().contains("refused"));
    }
}
