//! Long-polling session.
//!
//! Every iteration is an independent full-body call through the [`Engine`],
//! so hooks fire once per iteration, the terminating one included. The loop
//! ends when a response carries [`END_OF_STREAM_HEADER`]; its body is not
//! dispatched.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::CallError;
use crate::http::Completion;
use crate::pipeline::Engine;
use crate::request::RequestDescriptor;

/// Response header whose presence ends a long-poll session.
pub const END_OF_STREAM_HEADER: &str = "x-end-of-stream";

/// Receives the payloads of a long-poll session, in arrival order.
pub trait LongPollHandler: Send + Sync {
    fn on_data_received(&self, body: Bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPollState {
    Idle,
    Polling,
    Completed,
    Cancelled,
    Faulted,
}

pub struct LongPollSession {
    handler: Arc<dyn LongPollHandler>,
    state: LongPollState,
    iteration_count: u64,
}

impl LongPollSession {
    pub fn new(handler: Arc<dyn LongPollHandler>) -> Self {
        Self {
            handler,
            state: LongPollState::Idle,
            iteration_count: 0,
        }
    }

    pub fn state(&self) -> LongPollState {
        self.state
    }

    /// Calls issued so far, including the terminating one.
    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    /// Poll until the end-of-stream header arrives. Returns the number of
    /// dispatched payloads.
    ///
    /// Cancellation, whether between iterations or during a call, returns
    /// [`CallError::Cancelled`]; a failed call ends the session with that
    /// call's error. Neither is retried.
    pub async fn run(
        &mut self,
        engine: &Engine,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<u64, CallError> {
        self.state = LongPollState::Polling;
        let mut dispatched = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(self.stop(CallError::Cancelled));
            }
            self.iteration_count += 1;
            let message = match engine.send(descriptor, Completion::ContentRead, cancel).await {
                Ok(message) => message,
                Err(err) => return Err(self.stop(err)),
            };
            if message.headers.contains_key(END_OF_STREAM_HEADER) {
                tracing::debug!(iterations = self.iteration_count, dispatched, "long poll finished");
                self.state = LongPollState::Completed;
                return Ok(dispatched);
            }
            let body = message.body().cloned().unwrap_or_default();
            self.handler.on_data_received(body);
            dispatched += 1;
        }
    }

    fn stop(&mut self, err: CallError) -> CallError {
        if err.is_cancellation() {
            tracing::debug!(iterations = self.iteration_count, "long poll cancelled");
            self.state = LongPollState::Cancelled;
        } else {
            tracing::warn!(iterations = self.iteration_count, error = %err, "long poll failed");
            self.state = LongPollState::Faulted;
        }
        err
    }
}
