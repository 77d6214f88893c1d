use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of remote-store failures. `ResourceExhausted` is the only
/// class eligible for automatic retry and resubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreErrorCode {
    ResourceExhausted,
    Unavailable,
    PermissionDenied,
    FailedPrecondition,
    NotFound,
    Internal,
}

impl StoreErrorCode {
    /// Maps an HTTP status to a store error class. Timeouts and transport
    /// failures are classified separately as `Unavailable` by the callers.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => StoreErrorCode::ResourceExhausted,
            503 => StoreErrorCode::Unavailable,
            401 | 403 => StoreErrorCode::PermissionDenied,
            412 => StoreErrorCode::FailedPrecondition,
            404 => StoreErrorCode::NotFound,
            _ => StoreErrorCode::Internal,
        }
    }

    /// User-facing message, one distinguishable line per code.
    pub fn user_message(&self) -> &'static str {
        match self {
            StoreErrorCode::ResourceExhausted => {
                "The cloud store is throttling requests; the operation will be retried automatically."
            }
            StoreErrorCode::Unavailable => {
                "The cloud store is temporarily unavailable. Try again shortly."
            }
            StoreErrorCode::PermissionDenied => "The cloud store rejected the request: permission denied.",
            StoreErrorCode::FailedPrecondition => {
                "The cloud store rejected the request: failed precondition."
            }
            StoreErrorCode::NotFound => "The requested document was not found in the cloud store.",
            StoreErrorCode::Internal => "The cloud store request failed.",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct StoreError {
    pub code: StoreErrorCode,
    pub message: String,
}

impl StoreError {
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_resource_exhausted(&self) -> bool {
        self.code == StoreErrorCode::ResourceExhausted
    }

    /// Presentation-layer sanitization. Redaction replaces the message with
    /// the per-code text but always preserves the classification, so retry
    /// decisions survive a hardened deployment.
    pub fn sanitized(&self, redact_details: bool) -> Self {
        if redact_details {
            Self {
                code: self.code,
                message: self.code.user_message().to_string(),
            }
        } else {
            self.clone()
        }
    }
}
