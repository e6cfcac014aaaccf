//! Error types for the courier engine.
//!
//! # Design
//! One enum covers every failure the pipeline, the streaming sessions and the
//! load-test harness can report. Messages are carried as owned strings so the
//! error is `Clone`: hooks, handlers and harness workers all observe the same
//! value the caller finally receives.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by [`crate::Engine`] and the sessions built on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// No negotiation strategy accepted the value (or the response shape) and
    /// no pre-built wire body was available.
    #[error("unsupported content{}: {reason}", content_type_suffix(.content_type))]
    UnsupportedContent {
        content_type: Option<String>,
        reason: String,
    },

    /// A pooled or transient client could not be created.
    #[error("could not acquire client '{key}': {reason}")]
    ConnectionAcquisition { key: String, reason: String },

    /// The request could not be sent or the response could not be read.
    #[error("transport error: {0}")]
    Transport(String),

    /// The descriptor's timeout elapsed before the call completed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The cooperative cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// "Ensure success" was requested and the final status was not 2xx.
    #[error("HTTP {status}: {reason}")]
    NonSuccessStatus { status: u16, reason: String },

    /// The response body could not be converted into the requested type.
    #[error("could not materialize response as {target}: {reason}")]
    Materialization { target: String, reason: String },

    /// The descriptor could not be turned into a wire request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A processor failed to serialize the outbound value.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl CallError {
    /// `true` for the cancellation class of errors.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CallError::Cancelled)
    }

    pub(crate) fn unsupported(content_type: Option<&str>, reason: impl Into<String>) -> Self {
        CallError::UnsupportedContent {
            content_type: content_type.map(str::to_string),
            reason: reason.into(),
        }
    }
}

fn content_type_suffix(content_type: &Option<String>) -> String {
    match content_type {
        Some(content_type) => format!(" '{content_type}'"),
        None => String::new(),
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest's top-level message hides the cause, e.g. "connection refused".
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        CallError::Transport(message)
    }
}
