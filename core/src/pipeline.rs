//! The execution pipeline: one descriptor in, one response out.
//!
//! # Design
//! [`Engine`] owns the negotiation registry, the client factories and the
//! connection pool. A call runs its hooks in a fixed order:
//!
//! 1. `pre_set_content` on a per-call copy of the content
//! 2. body negotiation
//! 3. URL, header, cookie and authentication materialisation
//! 4. client acquisition (pooled or transient)
//! 5. `pre_send`
//! 6. send, under the completion policy, the timeout and the cancellation token
//! 7. status handlers, then the optional success check
//! 8. `post_send`
//!
//! Any failure other than cancellation runs `send_failed` once and is returned
//! unchanged. Per-call resources live in a [`CallScope`] that is dropped on
//! every exit path; a headers-only response carries its scope with it so the
//! client stays leased while the body is streamed.
//!
//! The blocking forms drive the async primitive on a process-wide runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE, COOKIE};
use reqwest::multipart::{Form, Part};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::client::{ClientFactory, ClientSource, DefaultClientFactory, Disposer, DEFAULT_FACTORY};
use crate::config::EngineConfig;
use crate::content::{parse_content_type, MediaType, MultipartBody, PartData, WireBody};
use crate::error::CallError;
use crate::http::{Completion, ResponseMessage, SetCookie};
use crate::long_poll::{LongPollHandler, LongPollSession};
use crate::negotiation::{Converter, FromBody, NegotiationRegistry, Processor};
use crate::pool::{ConnectionPool, Lease};
use crate::request::{Authentication, RequestDescriptor};
use crate::sse::{EventSourceHandler, SseSession};
use crate::types::ExecutionResult;

/// Header carrying the descriptor's trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Resources owned by one call: the leased or transient client.
pub(crate) struct CallScope {
    client: reqwest::Client,
    _lease: Option<Lease>,
    disposer: Option<Disposer>,
}

impl CallScope {
    fn pooled(lease: Lease) -> Self {
        Self {
            client: lease.handle().client().clone(),
            _lease: Some(lease),
            disposer: None,
        }
    }

    fn transient(client: reqwest::Client, disposer: Option<Disposer>) -> Self {
        Self {
            client,
            _lease: None,
            disposer,
        }
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            tracing::trace!("disposing transient client");
            disposer();
        }
    }
}

#[derive(Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

/// Await `fut` unless the token fires or the deadline passes first.
async fn guarded<T>(
    cancel: &CancellationToken,
    deadline: Option<Deadline>,
    fut: impl Future<Output = Result<T, CallError>>,
) -> Result<T, CallError> {
    let bounded = async {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.at, fut)
                .await
                .unwrap_or(Err(CallError::Timeout(deadline.timeout))),
            None => fut.await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        result = bounded => result,
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: NegotiationRegistry,
    pool: Arc<ConnectionPool>,
    factories: HashMap<String, Arc<dyn ClientFactory>>,
    sse_handlers: HashMap<String, Arc<dyn EventSourceHandler>>,
    poll_handlers: HashMap<String, Arc<dyn LongPollHandler>>,
}

/// The HTTP execution engine. Clones share the same pool and registries.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Assembles an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    processors: Vec<Processor>,
    converters: Vec<Converter>,
    factories: HashMap<String, Arc<dyn ClientFactory>>,
    pool: Option<Arc<ConnectionPool>>,
    sse_handlers: HashMap<String, Arc<dyn EventSourceHandler>>,
    poll_handlers: HashMap<String, Arc<dyn LongPollHandler>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            processors: Vec::new(),
            converters: Vec::new(),
            factories: HashMap::new(),
            pool: None,
            sse_handlers: HashMap::new(),
            poll_handlers: HashMap::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a processor. Registered processors are tried in order, all
    /// before the built-ins.
    pub fn processor(mut self, processor: Processor) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn converter(mut self, converter: Converter) -> Self {
        self.converters.push(converter);
        self
    }

    /// Register a named client factory. Registering `"default"` replaces the
    /// factory built from the configuration.
    pub fn factory(mut self, name: &str, factory: impl ClientFactory + 'static) -> Self {
        self.factories.insert(name.to_string(), Arc::new(factory));
        self
    }

    /// Share an existing pool instead of creating one from the configuration.
    pub fn pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn sse_handler(mut self, name: &str, handler: Arc<dyn EventSourceHandler>) -> Self {
        self.sse_handlers.insert(name.to_string(), handler);
        self
    }

    pub fn long_poll_handler(mut self, name: &str, handler: Arc<dyn LongPollHandler>) -> Self {
        self.poll_handlers.insert(name.to_string(), handler);
        self
    }

    pub fn build(self) -> Engine {
        let mut factories = self.factories;
        if !factories.contains_key(DEFAULT_FACTORY) {
            let default: Arc<dyn ClientFactory> = Arc::new(DefaultClientFactory {
                user_agent: self.config.user_agent.clone(),
                connect_timeout: self.config.connect_timeout(),
            });
            factories.insert(DEFAULT_FACTORY.to_string(), default);
        }
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(ConnectionPool::new(self.config.pool.clone())));

        Engine {
            inner: Arc::new(EngineInner {
                registry: NegotiationRegistry::new(self.processors, self.converters),
                config: self.config,
                pool,
                factories,
                sse_handlers: self.sse_handlers,
                poll_handlers: self.poll_handlers,
            }),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Engine {
    fn default() -> Self {
        EngineBuilder::new().build()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder::new().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &NegotiationRegistry {
        &self.inner.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    /// Sweep idle pool entries at the configured interval until `cancel`
    /// fires.
    pub fn spawn_pool_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.inner
            .pool
            .spawn_sweeper(self.inner.config.pool.sweep_interval(), cancel)
    }

    /// Dispose every pooled client.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }

    /// Send one request and return the raw response.
    ///
    /// With [`Completion::HeadersRead`] the body is left on the connection and
    /// the returned message keeps its client leased until it is dropped.
    pub async fn send(
        &self,
        descriptor: &RequestDescriptor,
        completion: Completion,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, CallError> {
        let trace_id = descriptor
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = tracing::debug_span!(
            "http_call",
            method = %descriptor.method,
            url = %descriptor.url,
            trace_id = %trace_id
        );
        async {
            let result = self.send_inner(descriptor, completion, cancel).await;
            if let Err(err) = &result {
                self.report_failure(err, descriptor);
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Send one request, read the whole body and materialise it as `T`.
    pub async fn execute<T: FromBody>(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult<T>, CallError> {
        let message = self.send(descriptor, Completion::ContentRead, cancel).await?;
        self.materialize(message).inspect_err(|err| self.report_failure(err, descriptor))
    }

    /// Blocking form of [`Engine::send`].
    ///
    /// Must not be called from inside an async runtime.
    pub fn send_blocking(
        &self,
        descriptor: &RequestDescriptor,
        completion: Completion,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, CallError> {
        blocking_runtime()?.block_on(self.send(descriptor, completion, cancel))
    }

    /// Blocking form of [`Engine::execute`].
    pub fn execute_blocking<T: FromBody>(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult<T>, CallError> {
        blocking_runtime()?.block_on(self.execute(descriptor, cancel))
    }

    /// Run an SSE session with the handler named by the descriptor's
    /// `event_handler`.
    pub async fn stream_events(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), CallError> {
        let name = handler_name(descriptor)?;
        let handler = self
            .inner
            .sse_handlers
            .get(name)
            .cloned()
            .ok_or_else(|| CallError::InvalidRequest(format!("no event handler named '{name}'")))?;
        SseSession::new(handler).run(self, descriptor, cancel).await
    }

    /// Run a long-poll session with the handler named by the descriptor's
    /// `event_handler`. Returns the number of dispatched payloads.
    pub async fn long_poll(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<u64, CallError> {
        let name = handler_name(descriptor)?;
        let handler = self
            .inner
            .poll_handlers
            .get(name)
            .cloned()
            .ok_or_else(|| CallError::InvalidRequest(format!("no long-poll handler named '{name}'")))?;
        LongPollSession::new(handler).run(self, descriptor, cancel).await
    }

    async fn send_inner(
        &self,
        descriptor: &RequestDescriptor,
        completion: Completion,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, CallError> {
        if cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let mut content = descriptor.content.clone();
        if let Some(hook) = &descriptor.hooks.pre_set_content {
            hook(&mut content);
        }
        let body = self
            .inner
            .registry
            .build_body(&content, Some(self.inner.config.default_encoding()))?;
        let url = descriptor.resolve_url()?;

        let deadline = descriptor
            .timeout
            .or_else(|| self.inner.config.default_timeout())
            .map(|timeout| Deadline {
                at: Instant::now() + timeout,
                timeout,
            });

        let scope = self.acquire_client(descriptor, cancel, deadline).await?;
        let mut request = build_request(&scope.client, descriptor, url, body).await?;
        if let Some(hook) = &descriptor.hooks.pre_send {
            hook(&mut request);
        }

        let started = std::time::Instant::now();
        let client = scope.client.clone();
        let response = guarded(cancel, deadline, async move {
            client.execute(request).await.map_err(CallError::from)
        })
        .await?;
        let mut message = ResponseMessage::streaming(response, started.elapsed());
        if completion == Completion::ContentRead {
            guarded(cancel, deadline, message.buffer()).await?;
            message.elapsed = started.elapsed();
        }
        tracing::debug!(
            status = message.status.as_u16(),
            elapsed_ms = message.elapsed.as_millis() as u64,
            "response received"
        );

        let status = message.status.as_u16();
        for handler in descriptor.status_handlers.iter().filter(|h| h.matches(status)) {
            (handler.handler)(&message);
        }
        if descriptor.ensure_success && !message.is_success() {
            return Err(CallError::NonSuccessStatus {
                status,
                reason: message.status.canonical_reason().unwrap_or("unknown status").to_string(),
            });
        }
        if let Some(hook) = &descriptor.hooks.post_send {
            hook(&message);
        }

        if completion == Completion::HeadersRead {
            message.hold(scope);
        }
        Ok(message)
    }

    async fn acquire_client(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
        deadline: Option<Deadline>,
    ) -> Result<CallScope, CallError> {
        let key = descriptor.client.pool_key();
        let factory = match &descriptor.client {
            ClientSource::Named(name) => self.inner.factories.get(name).cloned().ok_or_else(|| {
                CallError::ConnectionAcquisition {
                    key: key.clone(),
                    reason: format!("no client factory named '{name}'"),
                }
            })?,
            ClientSource::Custom { factory, .. } => factory.clone(),
        };

        if descriptor.pooling {
            let lease = guarded(cancel, deadline, self.inner.pool.acquire(&key, || factory.create_client())).await?;
            tracing::trace!(key = %key, handle_id = lease.handle().id(), "leased pooled client");
            return Ok(CallScope::pooled(lease));
        }

        // Opting out of pooling drops whatever is cached for this source.
        if self.inner.pool.force_release(&key) {
            tracing::debug!(key = %key, "pooled client released for unpooled call");
        }
        let provided = factory.create_client().map_err(|err| match err {
            CallError::ConnectionAcquisition { reason, .. } => CallError::ConnectionAcquisition { key: key.clone(), reason },
            other => CallError::ConnectionAcquisition {
                key: key.clone(),
                reason: other.to_string(),
            },
        })?;
        Ok(CallScope::transient(provided.client, provided.disposer))
    }

    fn materialize<T: FromBody>(&self, message: ResponseMessage) -> Result<ExecutionResult<T>, CallError> {
        let media = message
            .content_type()
            .map(|raw| parse_content_type(raw, None))
            .unwrap_or_else(MediaType::unknown);
        let encoding = media.encoding.unwrap_or_else(|| self.inner.config.default_encoding());
        let body = message.body().cloned().unwrap_or_default();
        let value = self.inner.registry.materialize::<T>(&body, &media, encoding)?;

        let raw_set_cookies = message.raw_set_cookies();
        let cookies = raw_set_cookies
            .iter()
            .filter_map(|raw| SetCookie::parse(raw))
            .collect();
        Ok(ExecutionResult {
            status_code: message.status.as_u16(),
            is_success: message.is_success(),
            content_type: message.content_type().map(|_| media.essence.clone()),
            char_set: media.charset.clone(),
            content_length: message.content_length(),
            raw_set_cookies,
            cookies,
            value,
            duration: message.elapsed,
            headers: message.headers,
        })
    }

    fn report_failure(&self, err: &CallError, descriptor: &RequestDescriptor) {
        if err.is_cancellation() {
            tracing::debug!("call cancelled");
            return;
        }
        tracing::warn!(error = %err, "call failed");
        if let Some(hook) = &descriptor.hooks.send_failed {
            hook(err, descriptor);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("factories", &self.inner.factories.keys().collect::<Vec<_>>())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

fn handler_name(descriptor: &RequestDescriptor) -> Result<&str, CallError> {
    descriptor
        .event_handler
        .as_deref()
        .ok_or_else(|| CallError::InvalidRequest("descriptor names no event handler".to_string()))
}

fn invalid(what: &str, err: impl std::fmt::Display) -> CallError {
    CallError::InvalidRequest(format!("{what}: {err}"))
}

async fn build_request(
    client: &reqwest::Client,
    descriptor: &RequestDescriptor,
    url: url::Url,
    body: WireBody,
) -> Result<reqwest::Request, CallError> {
    let mut builder = client.request(descriptor.method.into(), url);
    let mut body_headers: Vec<(HeaderName, String)> = Vec::new();

    match body {
        WireBody::Empty => {}
        WireBody::Bytes { data, content_type } => {
            builder = builder.body(data);
            if let Some(content_type) = content_type {
                body_headers.push((CONTENT_TYPE, content_type));
            }
        }
        WireBody::File {
            path,
            content_type,
            file_name,
        } => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| invalid(&format!("cannot open {}", path.display()), e))?;
            builder = builder.body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
            if let Some(content_type) = content_type {
                body_headers.push((CONTENT_TYPE, content_type));
            }
            if let Some(file_name) = file_name {
                body_headers.push((CONTENT_DISPOSITION, format!("attachment; filename=\"{file_name}\"")));
            }
        }
        WireBody::Multipart(body) => {
            builder = builder.multipart(multipart_form(&body).await?);
        }
    }

    match &descriptor.auth {
        Some(Authentication::Basic { username, password }) => {
            builder = builder.basic_auth(username, password.as_ref());
        }
        Some(Authentication::Bearer(token)) => {
            builder = builder.bearer_auth(token);
        }
        Some(Authentication::Custom { scheme, parameter }) => {
            builder = builder.header(http::header::AUTHORIZATION, format!("{scheme} {parameter}"));
        }
        None => {}
    }

    let mut request = builder.build().map_err(|e| invalid("request", e))?;
    let headers = request.headers_mut();
    for (name, value) in body_headers {
        headers.insert(name, HeaderValue::from_str(&value).map_err(|e| invalid("content header", e))?);
    }
    for (name, value) in &descriptor.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid("header name", e))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid("header value", e))?;
        headers.insert(name, value);
    }
    if let Some(cookies) = descriptor.cookie_header() {
        headers.insert(COOKIE, HeaderValue::from_str(&cookies).map_err(|e| invalid("cookie", e))?);
    }
    if let Some(trace_id) = &descriptor.trace_id {
        headers.insert(
            HeaderName::from_static(TRACE_ID_HEADER),
            HeaderValue::from_str(trace_id).map_err(|e| invalid("trace id", e))?,
        );
    }
    for name in &descriptor.removed_headers {
        headers.remove(name.as_str());
    }
    Ok(request)
}

async fn multipart_form(body: &MultipartBody) -> Result<Form, CallError> {
    let mut form = Form::new();
    for part in &body.parts {
        let mut built = match &part.data {
            PartData::Bytes(bytes) => Part::bytes(bytes.to_vec()),
            PartData::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| invalid(&format!("cannot open {}", path.display()), e))?;
                let length = match part.file_size {
                    Some(size) => Some(size),
                    None => file.metadata().await.ok().map(|m| m.len()),
                };
                let stream = reqwest::Body::wrap_stream(ReaderStream::new(file));
                match length {
                    Some(length) => Part::stream_with_length(stream, length),
                    None => Part::stream(stream),
                }
            }
        };
        if let Some(file_name) = &part.file_name {
            built = built.file_name(file_name.clone());
        }
        if let Some(content_type) = &part.content_type {
            let declared = match part.encoding {
                Some(encoding) => format!("{content_type}; charset={}", encoding.label()),
                None => content_type.clone(),
            };
            built = built.mime_str(&declared).map_err(|e| invalid("multipart content type", e))?;
        }
        form = form.part(part.name.clone(), built);
    }
    Ok(form)
}

fn blocking_runtime() -> Result<&'static Runtime, CallError> {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();

    if Handle::try_current().is_ok() {
        return Err(CallError::InvalidRequest(
            "blocking call made from inside an async runtime".to_string(),
        ));
    }
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("courier-blocking")
        .enable_all()
        .build()
        .map_err(|e| CallError::Transport(format!("cannot start blocking runtime: {e}")))?;
    Ok(RUNTIME.get_or_init(|| runtime))
}
