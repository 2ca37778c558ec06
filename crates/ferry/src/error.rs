//! Transfer error taxonomy and low-level fault classification.

use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

/// Enumerated failure kinds surfaced to callers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferErrorKind {
    #[error("file not found")]
    FileNotFound,

    #[error("invalid URL")]
    InvalidUrl,

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("TLS validation failed")]
    TlsValidationFailed,

    #[error("aborted by user")]
    AbortedByUser,

    #[error("unexpected HTTP status")]
    UnexpectedHttpStatus,

    #[error("filesystem write error")]
    WriteError,

    #[error("unknown transfer error")]
    Unknown,
}

/// Structured terminal error for one transfer session.
///
/// Constructed once at failure time; `source` and `target` are the locators
/// involved (file path and URL, direction depending on the role), with
/// HTTP status and response body attached when a response was received.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub source: Option<String>,
    pub target: Option<String>,
    pub http_status: Option<u16>,
    pub body: Option<String>,
    pub cause: Option<String>,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind) -> Self {
        Self {
            kind,
            source: None,
            target: None,
            http_status: None,
            body: None,
            cause: None,
        }
    }

    pub fn with_locators(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self.target = Some(target.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(status) = self.http_status {
            write!(f, " (http {status})")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TransferError {}

/// Maps a network-layer fault onto exactly one error kind.
pub(crate) fn classify_reqwest(error: &reqwest::Error) -> TransferErrorKind {
    if error.is_timeout() {
        TransferErrorKind::ConnectionTimeout
    } else if is_certificate_error(error) {
        TransferErrorKind::TlsValidationFailed
    } else if error.is_builder() {
        TransferErrorKind::InvalidUrl
    } else if error.is_connect() || error.is_request() || error.is_body() || error.is_decode() {
        TransferErrorKind::ConnectionLost
    } else {
        TransferErrorKind::Unknown
    }
}

// reqwest exposes no TLS predicate, so walk the source chain for
// certificate wording. Best-effort; anything missed falls through to
// ConnectionLost.
fn is_certificate_error(error: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("self signed") || text.contains("self-signed") {
            return true;
        }
        source = cause.source();
    }
    false
}

pub(crate) fn classify_io(error: &io::Error) -> TransferErrorKind {
    match error.kind() {
        io::ErrorKind::NotFound => TransferErrorKind::FileNotFound,
        io::ErrorKind::TimedOut => TransferErrorKind::ConnectionTimeout,
        _ => TransferErrorKind::WriteError,
    }
}
