use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletError {
    // Lookup errors
    NotFound(String),

    // Authorization errors
    Unauthorized(String),
    PermissionDenied(String),

    // Cryptographic errors
    DecryptionFailed,
    CryptoError(String),

    // Invariant errors
    LimitExceeded(String),
    InvariantViolation(String),
    IntegrityWarning(String),

    // Storage errors
    StorageFailure(String),

    // Validation errors
    ValidationError(String),

    // Application errors
    NotInitialized,
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WalletError::NotFound(msg) => write!(f, "Not found: {}", msg),

            WalletError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            WalletError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),

            WalletError::DecryptionFailed => write!(f, "Decryption failed"),
            WalletError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),

            WalletError::LimitExceeded(msg) => write!(f, "Limit exceeded: {}", msg),
            WalletError::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
            WalletError::IntegrityWarning(msg) => write!(f, "Integrity warning: {}", msg),

            WalletError::StorageFailure(msg) => write!(f, "Storage failure: {}", msg),

            WalletError::ValidationError(msg) => write!(f, "Validation error: {}", msg),

            WalletError::NotInitialized => write!(f, "Key store not initialized"),
        }
    }
}

impl std::error::Error for WalletError {}

pub type WalletResult<T> = Result<T, WalletError>;

// Conversion helpers
impl From<std::io::Error> for WalletError {
    fn from(error: std::io::Error) -> Self {
        WalletError::StorageFailure(error.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(error: serde_json::Error) -> Self {
        WalletError::ValidationError(format!("JSON error: {}", error))
    }
}
