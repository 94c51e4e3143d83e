// MIT License
// Copyright 2023--present exttool developers

//! Error taxonomy and process exit statuses.
//!
//! This module provides three components that work together so that every
//! entry point (standalone runner, client, server) reports failures the same
//! way to the host program:
//!
//! 1. **[`Status`]**: the integer exit code of a process. `Success` (0) means
//!    a well-formed result file was written; any other value identifies the
//!    error category, with a diagnostic printed on stderr.
//!
//! 2. **[`BridgeError`] / [`BackendError`]**: typed errors carried through
//!    the library. Each maps onto exactly one [`Status`].
//!
//! 3. **[`catch_unwind`]**: a wrapper used at the single-request boundary
//!    inside the server. A panic raised by a model becomes
//!    [`BridgeError::Internal`] with the panic message, so one faulty request
//!    never takes the session (and its loaded model) down with it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit codes reported by the `exttool` binaries.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// A complete result file was written.
    Success = 0,
    /// The descriptor, geometry or point-charge file is invalid.
    MalformedRequest = 1,
    /// The model could not produce a result for this input.
    BackendError = 2,
    /// No server is listening at the configured endpoint.
    ServerUnreachable = 3,
    /// The server could not claim its endpoint.
    BindError = 4,
    /// I/O failure or a caught panic.
    InternalError = 5,
    /// The peer sent something that is not a valid protocol message.
    ProtocolError = 6,
    /// Command-line usage error.
    Usage = 64,
}

impl Status {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Failures raised by a model capability or the adapter around it.
///
/// These are surfaced verbatim to the caller and never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("element {symbol} is not supported by backend {backend}")]
    UnsupportedElement { backend: String, symbol: String },
    #[error("device {device} is not available: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },
    #[error("invalid backend configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("backend execution failed: {0}")]
    Execution(String),
    #[error("backend returned an invalid result: {0}")]
    InvalidOutput(String),
    /// A backend failure reported by a calculation server.
    #[error("{0}")]
    Remote(String),
}

/// Error type shared by the parser, writer, runner, server and client.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("server unreachable at {addr}: {reason}")]
    ServerUnreachable { addr: String, reason: String },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::MalformedRequest(_) => Status::MalformedRequest,
            Self::Backend(_) => Status::BackendError,
            Self::ServerUnreachable { .. } => Status::ServerUnreachable,
            Self::Bind { .. } => Status::BindError,
            Self::Io { .. } | Self::Internal(_) => Status::InternalError,
            Self::Protocol(_) => Status::ProtocolError,
        }
    }
}

/// Error category carried over the wire in an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedRequest,
    Backend,
    Internal,
}

impl ErrorKind {
    pub fn of(error: &BridgeError) -> Self {
        match error {
            BridgeError::MalformedRequest(_) => Self::MalformedRequest,
            BridgeError::Backend(_) => Self::Backend,
            _ => Self::Internal,
        }
    }
}

/// Execute a closure, catching any panic and converting it to
/// [`BridgeError::Internal`].
pub fn catch_unwind<F, T>(f: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> Result<T, BridgeError> + std::panic::UnwindSafe,
{
    match std::panic::catch_unwind(f) {
        Ok(result) => result,
        Err(e) => {
            let msg = if let Some(s) = e.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = e.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(BridgeError::Internal(format!("panic during calculation: {msg}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(Status::Success.code(), 0);
        assert_eq!(Status::MalformedRequest.code(), 1);
        assert_eq!(Status::BackendError.code(), 2);
        assert_eq!(Status::ServerUnreachable.code(), 3);
        assert_eq!(Status::BindError.code(), 4);
        assert!(Status::Success.is_success());
        assert!(!Status::BindError.is_success());
    }

    #[test]
    fn errors_map_to_their_status() {
        assert_eq!(
            BridgeError::malformed("x").status(),
            Status::MalformedRequest
        );
        let backend: BridgeError = BackendError::Execution("boom".into()).into();
        assert_eq!(backend.status(), Status::BackendError);
        let unreachable = BridgeError::ServerUnreachable {
            addr: "127.0.0.1:1".into(),
            reason: "refused".into(),
        };
        assert_eq!(unreachable.status(), Status::ServerUnreachable);
        assert_eq!(ErrorKind::of(&unreachable), ErrorKind::Internal);
    }

    #[test]
    fn backend_error_message_is_passed_through() {
        let err: BridgeError = BackendError::UnsupportedElement {
            backend: "pairwise".into(),
            symbol: "U".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "element U is not supported by backend pairwise"
        );
    }

    #[test]
    fn test_catch_unwind_success() {
        let value = catch_unwind(|| Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_catch_unwind_panic() {
        let result: Result<(), _> = catch_unwind(|| panic!("boom"));
        match result {
            Err(BridgeError::Internal(msg)) => assert!(msg.ends_with("boom")),
            other => panic!("expected internal error, got {other:?}"),
        }
    }

    #[test]
    fn test_catch_unwind_formatted_panic() {
        let n = 3;
        let result: Result<(), _> = catch_unwind(move || panic!("bad atom {n}"));
        assert!(matches!(result, Err(BridgeError::Internal(m)) if m.contains("bad atom 3")));
    }
}
