//! Value objects handed back to callers.

use std::time::Duration;

use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::http::SetCookie;

/// The outcome of one typed call.
#[derive(Debug, Clone)]
pub struct ExecutionResult<T> {
    pub status_code: u16,
    pub is_success: bool,
    pub headers: HeaderMap,
    /// Media type without parameters, e.g. `application/json`.
    pub content_type: Option<String>,
    /// The `charset` parameter of the response content type, as sent.
    pub char_set: Option<String>,
    pub content_length: Option<u64>,
    pub raw_set_cookies: Vec<String>,
    pub cookies: Vec<SetCookie>,
    pub value: T,
    /// Time spent sending the request and reading the response.
    pub duration: Duration,
}

impl<T> ExecutionResult<T> {
    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }

    /// Keep the metadata, replace the value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExecutionResult<U> {
        ExecutionResult {
            status_code: self.status_code,
            is_success: self.is_success,
            headers: self.headers,
            content_type: self.content_type,
            char_set: self.char_set,
            content_length: self.content_length,
            raw_set_cookies: self.raw_set_cookies,
            cookies: self.cookies,
            value: f(self.value),
            duration: self.duration,
        }
    }
}

/// Aggregate of one load-test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadTestRun {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub elapsed_ms: u64,
    pub queries_per_second: f64,
}

impl LoadTestRun {
    /// Finalize a run from its tallies.
    pub fn from_tallies(successful: u64, failed: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let queries_per_second = if secs > 0.0 { successful as f64 / secs } else { 0.0 };
        Self {
            total_requests: successful + failed,
            successful_requests: successful,
            failed_requests: failed,
            elapsed_ms: elapsed.as_millis() as u64,
            queries_per_second,
        }
    }
}
