use thiserror::Error;
use uuid::Uuid;

use crate::types::ProtocolGeneration;

/// Failures reported by the GATT transport layer
///
/// These come from the BLE stack and never leave the session boundary as-is:
/// the session translates them into [`BedjetError`] values.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Error raised by the platform Bluetooth stack
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The peripheral does not expose the requested characteristic
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// Operation attempted on a link that is no longer up
    #[error("Link is not connected")]
    NotConnected,

    /// Link-layer operation did not complete in time
    #[error("Link operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Any other link-layer failure
    #[error("Link error: {0}")]
    Link(String),
}

impl TransportError {
    /// Check if this failure is worth retrying at the connect layer
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::NotConnected | Self::Timeout { .. } | Self::Link(_)
        )
    }
}

/// Errors that can occur when driving a BedJet
#[derive(Error, Debug)]
pub enum BedjetError {
    /// Could not establish or negotiate the BLE session
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected while an operation was in flight
    #[error("Device disconnected")]
    Disconnected,

    /// A read or write on an established session failed
    #[error("Communication error: {0}")]
    Communication(String),

    /// A frame had the wrong length or carried an unknown value
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Caller supplied an out-of-range argument
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// The connected device generation cannot perform the operation
    #[error("{operation} is not supported by {generation}")]
    Unsupported {
        /// Operation that was requested
        operation: &'static str,
        /// Generation of the connected device
        generation: ProtocolGeneration,
    },
}

/// Result type for BedJet operations
pub type Result<T> = std::result::Result<T, BedjetError>;

impl BedjetError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Disconnected | Self::Communication(_)
        )
    }

    /// Check if a later `update()` or retry can be expected to succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::Communication(_)
                | Self::MalformedFrame(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = BedjetError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(connection_error.is_recoverable());

        let validation_error = BedjetError::InvalidParameters("hour 24".to_string());
        assert!(!validation_error.is_connection_error());
        assert!(!validation_error.is_recoverable());

        let unsupported = BedjetError::Unsupported {
            operation: "set_operating_mode(DRY)",
            generation: ProtocolGeneration::Gen2,
        };
        assert!(!unsupported.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = BedjetError::InvalidParameters("minute out of range".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid command parameters"));
        assert!(error_string.contains("minute out of range"));

        let unsupported = BedjetError::Unsupported {
            operation: "set_runtime_remaining",
            generation: ProtocolGeneration::Gen2,
        };
        assert_eq!(
            unsupported.to_string(),
            "set_runtime_remaining is not supported by BedJet V2"
        );
    }

    #[test]
    fn test_transport_error_transience() {
        assert!(TransportError::Timeout { timeout_ms: 10 }.is_transient());
        assert!(TransportError::NotConnected.is_transient());
        assert!(!TransportError::CharacteristicNotFound(Uuid::nil()).is_transient());
    }
}
