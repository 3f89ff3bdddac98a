//! Error types for the scanner.

use crate::scanner::ScannerState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classified reason a check attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ProxyError,
    Timeout,
    ConnectionError,
    MalformedResponse,
    CriticalDestinationFailure,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProxyError => "proxy-error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionError => "connection-error",
            ErrorKind::MalformedResponse => "malformed-response",
            ErrorKind::CriticalDestinationFailure => "critical-destination-failure",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed probe through a proxy
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct ProbeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if is_proxy_failure(&err) {
            ErrorKind::ProxyError
        } else if err.is_connect() || err.is_request() {
            ErrorKind::ConnectionError
        } else if err.is_decode() || err.is_body() || err.is_status() {
            ErrorKind::MalformedResponse
        } else {
            ErrorKind::Unknown
        };
        Self::new(kind, err.to_string())
    }
}

/// Best effort: reqwest reports tunnel and SOCKS handshake failures as
/// connect errors and only names the proxy in the cause chain. The top-level
/// message carries the request URL, so it is not inspected.
fn is_proxy_failure(err: &reqwest::Error) -> bool {
    err.is_connect() && cause_names_proxy(std::error::Error::source(err))
}

fn cause_names_proxy(mut source: Option<&(dyn std::error::Error + 'static)>) -> bool {
    while let Some(e) = source {
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("proxy") || text.contains("socks") || text.contains("tunnel") {
            return true;
        }
        source = e.source();
    }
    false
}

/// Rejected scanner settings update
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("num_scan_threads must be between 1 and {max}, got {value}")]
    ThreadCount { value: usize, max: usize },

    #[error("{field} must be at least 1 minute")]
    Interval { field: &'static str },

    #[error("blacklist_refresh_hours must be between 1 and {max}, got {value}")]
    RefreshHours { value: u64, max: u64 },

    #[error("scan_check_timeout_seconds must be between 1 and {max}, got {value}")]
    Timeout { value: u64, max: u64 },

    #[error("invalid blacklist name: {0:?}")]
    BlacklistName(String),

    #[error("invalid website check {url:?}: {reason}")]
    Website { url: String, reason: String },
}

/// Scanner lifecycle and startup errors
#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("cannot {action} while scanner is {state}")]
    InvalidState {
        action: &'static str,
        state: ScannerState,
    },

    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("could not detect public IP: {0}")]
    PublicIp(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
