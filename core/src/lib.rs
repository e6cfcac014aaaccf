//! HTTP client engine.
//!
//! # Overview
//! A [`RequestDescriptor`] describes one call. The [`Engine`] turns it into a
//! wire request: the [`NegotiationRegistry`] encodes the content, the
//! [`ConnectionPool`] hands out a reusable client, lifecycle hooks run around
//! the send, and the response is materialized into a typed
//! [`ExecutionResult`]. SSE and long-poll sessions and the load-test harness
//! are built on the same single-call primitive.
//!
//! # Design
//! - Every async operation takes a `CancellationToken`; cancellation is a
//!   distinct error class that never triggers failure callbacks.
//! - Negotiation strategies are ordered predicate/transform pairs. Caller
//!   strategies are tried before the built-ins and the first match wins.
//! - Per-call resources are released on every exit path by drop.

pub mod client;
pub mod config;
pub mod content;
pub mod error;
pub mod http;
pub mod long_poll;
pub mod negotiation;
pub mod pipeline;
pub mod pool;
pub mod request;
pub mod sse;
pub mod types;

pub use client::{ClientFactory, ClientSource, DefaultClientFactory, ProvidedClient};
pub use config::{EngineConfig, PoolConfig};
pub use content::{ContentDescriptor, ContentValue, MediaType, MultipartBody, TextEncoding, WireBody};
pub use error::CallError;
pub use http::{Completion, HttpMethod, ResponseMessage, SetCookie};
pub use load_test::LoadTest;
pub use long_poll::{LongPollHandler, LongPollSession};
pub use negotiation::{Converter, FromBody, Json, NegotiationRegistry, Processor};
pub use pipeline::{Engine, EngineBuilder};
pub use pool::ConnectionPool;
pub use request::{Authentication, RequestDescriptor};
pub use sse::{EventSourceHandler, SseMessage, SseSession, SseState};
pub use types::{ExecutionResult, LoadTestRun};
pub use tokio_util::sync::CancellationToken;
