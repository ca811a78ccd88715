use serde::{Deserialize, Serialize};

use crate::kind::RequestKind;
use crate::provider::Provider;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Status codes a worker is allowed to retry.
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request is malformed; never enqueued, retried or failed over.
    Validation,
    /// Caller cancellation; terminates the attempt and the fallback chain.
    Cancelled,
    /// Queue full while the drop policy is on.
    QueueDropped,
    /// No credential can serve the (provider, model) pair.
    KeySelection,
    /// Returned by a provider adapter.
    Provider,
    /// A pre-hook finalised the request with an error.
    ShortCircuit,
    /// A streaming error replaced by a synthetic response after post-hooks.
    StreamRecovered,
    Mcp,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::QueueDropped => "queue_dropped",
            ErrorKind::KeySelection => "key_selection",
            ErrorKind::Provider => "provider",
            ErrorKind::ShortCircuit => "short_circuit",
            ErrorKind::StreamRecovered => "stream_recovered",
            ErrorKind::Mcp => "mcp",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request metadata attached to every caller-visible error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorOrigin {
    pub provider: Provider,
    pub model: String,
    pub request_kind: RequestKind,
}

/// The one error shape that crosses the gateway boundary.
///
/// `is_gateway_error` discriminates errors minted by the gateway itself from
/// errors translated out of an upstream response; only the latter are
/// candidates for retry.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub is_gateway_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_fallbacks: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<ErrorOrigin>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            error_type: None,
            is_gateway_error: true,
            allow_fallbacks: None,
            origin: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled")
    }

    pub fn queue_dropped(provider: &Provider) -> Self {
        Self::new(
            ErrorKind::QueueDropped,
            format!("provider {provider} queue is full and the drop policy is on"),
        )
    }

    pub fn key_selection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::KeySelection, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn mcp(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Mcp, message)
    }

    pub fn unsupported(provider: &Provider, operation: &str) -> Self {
        Self::new(
            ErrorKind::Provider,
            format!("provider {provider} does not support {operation}"),
        )
    }

    /// An error translated from an upstream provider response.
    pub fn upstream(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Provider,
            message: message.into(),
            status_code: Some(status_code),
            error_type: None,
            is_gateway_error: false,
            allow_fallbacks: None,
            origin: None,
        }
    }

    pub fn with_origin(mut self, provider: Provider, model: &str, kind: RequestKind) -> Self {
        self.origin = Some(ErrorOrigin {
            provider,
            model: model.to_string(),
            request_kind: kind,
        });
        self
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_allow_fallbacks(mut self, allow: bool) -> Self {
        self.allow_fallbacks = Some(allow);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Retry iff the error came from upstream with a transient status code.
    pub fn is_retryable(&self) -> bool {
        if self.is_gateway_error || self.is_cancelled() {
            return false;
        }
        match self.status_code {
            Some(code) => RETRYABLE_STATUS_CODES.contains(&code),
            None => false,
        }
    }

    /// Absent `allow_fallbacks` means the fallback chain may proceed.
    pub fn allows_fallbacks(&self) -> bool {
        self.allow_fallbacks.unwrap_or(true)
    }
}
