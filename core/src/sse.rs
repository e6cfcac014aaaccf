//! Server-Sent Events session.
//!
//! # Design
//! A session issues one headers-only call through the [`Engine`] and then
//! reads the body chunk by chunk. Chunks are split into lines on raw bytes, so
//! a multi-byte character cut by a chunk boundary is decoded whole. Lines feed
//! an [`EventParser`]; each completed event is dispatched to the handler
//! before the next chunk is read, so callbacks never overlap or reorder.
//!
//! Cancellation closes the session quietly. Connection and read failures fault
//! it and are reported to the handler once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::CallError;
use crate::http::Completion;
use crate::pipeline::Engine;
use crate::request::RequestDescriptor;

pub const EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseState {
    Idle,
    Connecting,
    Open,
    Receiving,
    Closed,
    Faulted,
}

/// One dispatched event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    /// The last event id seen on the stream, including this event's.
    pub id: Option<String>,
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Receives the callbacks of an SSE session.
pub trait EventSourceHandler: Send + Sync {
    fn on_open(&self) {}

    fn on_message(&self, message: &SseMessage);

    fn on_error(&self, _error: &CallError) {}
}

/// Splits a byte stream into lines. `\r\n` and `\n` both end a line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and drain every complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let mut line = &self.pending[start..start + offset];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start += offset + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Bytes of an unterminated trailing line.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Accumulates field lines into events.
#[derive(Debug, Default)]
pub struct EventParser {
    event: Option<String>,
    data: Vec<String>,
    last_event_id: Option<String>,
}

impl EventParser {
    /// Feed one line; returns the event a blank line completes, if any.
    pub fn feed_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.last_event_id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseMessage {
            id: self.last_event_id.clone(),
            event,
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// An SSE session: `Idle -> Connecting -> Open -> Receiving -> Closed`, or
/// `Faulted` from anywhere.
pub struct SseSession {
    handler: Arc<dyn EventSourceHandler>,
    state: SseState,
    lines: LineBuffer,
    parser: EventParser,
}

impl SseSession {
    pub fn new(handler: Arc<dyn EventSourceHandler>) -> Self {
        Self {
            handler,
            state: SseState::Idle,
            lines: LineBuffer::default(),
            parser: EventParser::default(),
        }
    }

    pub fn state(&self) -> SseState {
        self.state
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.parser.last_event_id()
    }

    /// Connect and dispatch events until the stream ends, the token fires or
    /// the session faults. Only a fault returns an error.
    pub async fn run(
        &mut self,
        engine: &Engine,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), CallError> {
        self.transition(SseState::Connecting);
        let mut descriptor = descriptor.clone();
        if !descriptor.headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("accept")) {
            descriptor.headers.push(("accept".to_string(), EVENT_STREAM.to_string()));
        }

        let mut message = match engine.send(&descriptor, Completion::HeadersRead, cancel).await {
            Ok(message) => message,
            Err(CallError::Cancelled) => {
                self.transition(SseState::Closed);
                return Ok(());
            }
            Err(err) => return Err(self.fault(err)),
        };
        if !message.is_success() {
            let status = message.status;
            return Err(self.fault(CallError::NonSuccessStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown status").to_string(),
            }));
        }

        self.transition(SseState::Open);
        self.handler.on_open();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = message.chunk() => Some(chunk),
            };
            let bytes = match chunk {
                None | Some(Ok(None)) => break,
                Some(Ok(Some(bytes))) => bytes,
                Some(Err(err)) => return Err(self.fault(err)),
            };
            self.transition(SseState::Receiving);
            for line in self.lines.push(&bytes) {
                if cancel.is_cancelled() {
                    break;
                }
                if let Some(event) = self.parser.feed_line(&line) {
                    self.handler.on_message(&event);
                }
            }
        }

        if self.lines.pending() > 0 {
            tracing::debug!(bytes = self.lines.pending(), "discarding unterminated event");
        }
        self.transition(SseState::Closed);
        Ok(())
    }

    fn transition(&mut self, next: SseState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "sse state");
            self.state = next;
        }
    }

    fn fault(&mut self, err: CallError) -> CallError {
        self.transition(SseState::Faulted);
        tracing::warn!(error = %err, "sse session faulted");
        self.handler.on_error(&err);
        err
    }
}
