// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Error taxonomy for the sampling, enrichment and delivery paths

use std::time::Duration;
use thiserror::Error;

/// Failure reading from the sound level meter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Busy device, short I/O error, unplugged cable. Retried with backoff.
    #[error("transient device error: {0}")]
    Transient(String),

    /// Device permanently gone. Stops the sampling pipeline.
    #[error("fatal device error: {0}")]
    Fatal(String),
}

impl DeviceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Fatal(_))
    }
}

/// Failure refreshing an enrichment source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("enrichment request failed: {0}")]
    Network(String),

    #[error("enrichment source returned HTTP {0}")]
    Status(u16),

    #[error("could not parse enrichment response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for EnrichmentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            EnrichmentError::Parse(e.to_string())
        } else {
            EnrichmentError::Network(e.to_string())
        }
    }
}

/// Failure delivering to a single sink
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("sink unreachable: {0}")]
    Unreachable(String),

    #[error("request rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("could not encode payload: {0}")]
    Encode(String),
}

impl SinkError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SinkError::Timeout(_) | SinkError::RateLimited { .. } | SinkError::Unreachable(_)
        )
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: reqwest::StatusCode, retry_after: Option<Duration>, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => SinkError::Auth(body),
            429 => SinkError::RateLimited { retry_after },
            408 | 500..=599 => SinkError::Unreachable(format!("HTTP {}: {}", status.as_u16(), body)),
            code => SinkError::Rejected { status: code, body },
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SinkError::Timeout(Duration::ZERO)
        } else if let Some(status) = e.status() {
            SinkError::from_status(status, None, e.to_string())
        } else {
            SinkError::Unreachable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        SinkError::Encode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            SinkError::from_status(StatusCode::UNAUTHORIZED, None, String::new()),
            SinkError::Auth(_)
        ));
        assert!(matches!(
            SinkError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(2)), String::new()),
            SinkError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(2)
        ));
        assert!(SinkError::from_status(StatusCode::BAD_GATEWAY, None, String::new()).is_retryable());
        assert!(!SinkError::from_status(StatusCode::BAD_REQUEST, None, String::new()).is_retryable());
    }

    #[test]
    fn test_auth_is_terminal() {
        assert!(!SinkError::Auth("bad token".into()).is_retryable());
        assert!(SinkError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
