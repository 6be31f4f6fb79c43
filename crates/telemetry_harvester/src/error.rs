//! Error types for harvester operations.
//!
//! None of these escape the harvester as a fault: attribute and metric errors
//! are returned to recorders as an informational list, and everything that
//! happens during a harvest is reported through the error hook.

use thiserror::Error;

/// Why an attribute value was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeErrorKind {
    /// The value was JSON `null`.
    Nil,
    /// The value had a type outside bool/number/string.
    Unsupported(&'static str),
}

/// A single attribute dropped during validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid attribute {key:?}: {kind}")]
pub struct AttributeError {
    /// Attribute key that was dropped.
    pub key: String,
    /// Reason for the rejection.
    pub kind: AttributeErrorKind,
}

impl std::fmt::Display for AttributeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nil => f.write_str("attribute value is nil"),
            Self::Unsupported(ty) => write!(f, "unsupported attribute type {ty}"),
        }
    }
}

/// Errors produced while recording a metric.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    /// A numeric field was NaN or infinite and has no JSON encoding.
    #[error("metric {name:?} has a non-finite value")]
    NonFinite { name: String },
    /// The metric could not be encoded.
    #[error("unable to encode metric {name:?}: {reason}")]
    Encode { name: String, reason: String },
}

/// Errors produced while turning a batch into outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// The destination URL did not parse.
    #[error("invalid destination url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    /// A configured value is not a legal header value.
    #[error("invalid value for header {name}")]
    InvalidHeader { name: &'static str },
    /// JSON serialization failed.
    #[error("unable to encode payload: {0}")]
    Encode(String),
    /// gzip compression failed.
    #[error("unable to compress payload: {0}")]
    Compress(String),
}

/// Errors returned by a [`Transport`](crate::transport::Transport) when no
/// HTTP response was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The harvest context was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,
    /// The request timed out.
    #[error("request timed out")]
    Timeout,
    /// Connection or protocol failure.
    #[error("http error: {0}")]
    Http(String),
}

impl TransportError {
    /// Returns `true` if the failure was caused by cancellation.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors raised while loading configuration from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable was set but could not be parsed.
    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidVar { var: &'static str, value: String },
}
