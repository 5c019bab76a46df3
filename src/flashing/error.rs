//! Error types for Bluetooth flashing.

use thiserror::Error;

use crate::hex::HexError;

/// Result type alias for flashing operations.
pub type FlashOpResult<T> = Result<T, FlashError>;

/// Errors that can occur while talking to a micro:bit or packaging firmware.
#[derive(Debug, Error)]
pub enum FlashError {
    /// The BLE stack reported a failure.
    #[error("Bluetooth transport error: {0}")]
    Transport(String),

    /// A suspension point exceeded its deadline.
    #[error("Timeout during {operation}")]
    Timeout { operation: String },

    /// The link dropped while an operation was waiting on it.
    #[error("Device disconnected during {operation}")]
    Disconnected { operation: String },

    /// An operation needed a live connection.
    #[error("Device is not connected")]
    NotConnected,

    /// A notification wait was attempted without an active subscription.
    #[error("Notifications are not enabled for characteristic {characteristic}")]
    NotSubscribed { characteristic: String },

    /// The device does not expose a required service or characteristic.
    #[error("Missing GATT characteristic {characteristic}")]
    CharacteristicMissing { characteristic: String },

    /// The user or OS declined the bond request.
    #[error("Bond request rejected")]
    BondRejected,

    /// The device answered with something the protocol does not allow.
    #[error("Unexpected response: {reason}")]
    UnexpectedResponse { reason: String },

    /// Firmware hex could not be decoded.
    #[error("Invalid hex: {0}")]
    Hex(#[from] HexError),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON error for the DFU manifest or options.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The vendor DFU service refused to start.
    #[error("DFU failed to start: {reason}")]
    DfuStart { reason: String },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

impl FlashError {
    pub(crate) fn timeout(operation: impl Into<String>) -> Self {
        FlashError::Timeout {
            operation: operation.into(),
        }
    }

    pub(crate) fn disconnected(operation: impl Into<String>) -> Self {
        FlashError::Disconnected {
            operation: operation.into(),
        }
    }

    /// Check if this error is transient (the enclosing step may succeed on retry).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FlashError::Timeout { .. } | FlashError::Transport(_) | FlashError::Disconnected { .. }
        )
    }

    /// Get a stable error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            FlashError::Transport(_) => "PF-001",
            FlashError::Io(_) => "PF-002",
            FlashError::Zip(_) => "PF-003",
            FlashError::Json(_) => "PF-004",
            FlashError::Hex(_) => "PF-010",
            FlashError::Timeout { .. } => "PF-020",
            FlashError::Disconnected { .. } => "PF-021",
            FlashError::NotConnected => "PF-022",
            FlashError::NotSubscribed { .. } => "PF-030",
            FlashError::CharacteristicMissing { .. } => "PF-031",
            FlashError::UnexpectedResponse { .. } => "PF-032",
            FlashError::BondRejected => "PF-040",
            FlashError::DfuStart { .. } => "PF-050",
            FlashError::Cancelled => "PF-099",
        }
    }
}
