//! Retry/backoff decisions for a single send attempt.
//!
//! Every request gets at most one retry per harvest cycle. Only 429 and 5xx
//! responses are retried; the wait is the configured backoff, lengthened (never
//! shortened) by an integer `Retry-After` header.

use std::time::Duration;

/// Status codes that end an attempt without a retry.
const TERMINAL_STATUSES: [u16; 8] = [200, 202, 400, 403, 404, 405, 411, 413];

/// The parts of an HTTP response the harvester acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestResponse {
    pub status: u16,
    /// Raw `Retry-After` header, if present.
    pub retry_after: Option<String>,
}

/// Coarse classification of a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 200 or 202
    Success,
    /// 400, 403, 404, 405, 411, 413: data is discarded
    Rejected,
    /// 429 or 5xx
    Retryable,
    /// Any other status: not retried, reported as a failure
    Unexpected,
}

impl HarvestResponse {
    pub fn new(status: u16, retry_after: Option<String>) -> Self {
        Self { status, retry_after }
    }

    /// Classifies the status code.
    pub fn class(&self) -> ResponseClass {
        match self.status {
            200 | 202 => ResponseClass::Success,
            s if TERMINAL_STATUSES.contains(&s) => ResponseClass::Rejected,
            429 | 500..=599 => ResponseClass::Retryable,
            _ => ResponseClass::Unexpected,
        }
    }

    /// Whether the payload was accepted.
    pub fn is_success(&self) -> bool {
        self.class() == ResponseClass::Success
    }

    /// `Retry-After` as whole seconds, if it parses as a non-negative integer.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.as_deref()?.trim().parse::<u64>().ok()
    }

    /// Decides whether to retry and how long to wait first.
    ///
    /// Returns `(false, Duration::ZERO)` for anything but 429/5xx.
    pub fn needs_retry(&self, base_backoff: Duration) -> (bool, Duration) {
        if self.class() != ResponseClass::Retryable {
            return (false, Duration::ZERO);
        }

        let backoff = match self.retry_after_secs().map(Duration::from_secs) {
            Some(header) if header > base_backoff => header,
            _ => base_backoff,
        };
        (true, backoff)
    }
}
