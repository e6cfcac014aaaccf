//! Request descriptors: everything the pipeline needs to perform one call.
//!
//! # Design
//! A descriptor is plain data plus shared hook closures. It is cheap to clone,
//! which is how the load-test harness fans one template out to many workers
//! and how streaming sessions issue one call per iteration. The pipeline never
//! mutates the caller's descriptor; hooks that rewrite content work on a
//! per-call copy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::client::ClientSource;
use crate::content::ContentDescriptor;
use crate::error::CallError;
use crate::http::{HttpMethod, ResponseMessage};

pub type PreSetContentHook = Arc<dyn Fn(&mut ContentDescriptor) + Send + Sync>;
pub type PreSendHook = Arc<dyn Fn(&mut reqwest::Request) + Send + Sync>;
pub type PostSendHook = Arc<dyn Fn(&ResponseMessage) + Send + Sync>;
pub type SendFailedHook = Arc<dyn Fn(&CallError, &RequestDescriptor) + Send + Sync>;

/// Lifecycle hooks, run by the pipeline in a fixed order.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Last chance to change the content before it is negotiated.
    pub pre_set_content: Option<PreSetContentHook>,
    /// Sees the fully built wire request right before it is sent.
    pub pre_send: Option<PreSendHook>,
    /// Runs after status handlers once the call has succeeded.
    pub post_send: Option<PostSendHook>,
    /// Runs once for every failure except cancellation.
    pub send_failed: Option<SendFailedHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_set_content", &self.pre_set_content.is_some())
            .field("pre_send", &self.pre_send.is_some())
            .field("post_send", &self.post_send.is_some())
            .field("send_failed", &self.send_failed.is_some())
            .finish()
    }
}

/// A callback for a set of status codes.
#[derive(Clone)]
pub struct StatusHandler {
    pub codes: Vec<u16>,
    pub handler: Arc<dyn Fn(&ResponseMessage) + Send + Sync>,
}

impl StatusHandler {
    pub fn matches(&self, status: u16) -> bool {
        self.codes.contains(&status)
    }
}

impl fmt::Debug for StatusHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusHandler").field("codes", &self.codes).finish()
    }
}

/// Credentials for the `Authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    Basic {
        username: String,
        password: Option<String>,
    },
    Bearer(String),
    /// Any other scheme, sent as `<scheme> <parameter>`.
    Custom { scheme: String, parameter: String },
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::Basic { username, .. } => {
                f.debug_struct("Basic").field("username", username).finish_non_exhaustive()
            }
            Authentication::Bearer(_) => f.write_str("Bearer(..)"),
            Authentication::Custom { scheme, .. } => {
                f.debug_struct("Custom").field("scheme", scheme).finish_non_exhaustive()
            }
        }
    }
}

/// One HTTP call, fully described.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: HttpMethod,
    /// Absolute URL; path segments of the form `{name}` are bound from
    /// `path_params`.
    pub url: String,
    pub path_params: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    /// Merged over the client's defaults; later entries replace earlier ones
    /// with the same name.
    pub headers: Vec<(String, String)>,
    /// Removed after every other header has been applied.
    pub removed_headers: Vec<String>,
    pub cookies: Vec<(String, String)>,
    pub auth: Option<Authentication>,
    pub content: ContentDescriptor,
    /// Overrides the engine's default timeout.
    pub timeout: Option<Duration>,
    /// Use the connection pool; when off the client is created for this call
    /// and disposed when it ends.
    pub pooling: bool,
    /// Fail with [`CallError::NonSuccessStatus`] on a non-2xx status.
    pub ensure_success: bool,
    pub trace_id: Option<String>,
    pub client: ClientSource,
    pub hooks: Hooks,
    pub status_handlers: Vec<StatusHandler>,
    /// Name of a handler registered on the engine for streaming calls.
    pub event_handler: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: HttpMethod, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            path_params: Vec::new(),
            query: Vec::new(),
            headers: Vec::new(),
            removed_headers: Vec::new(),
            cookies: Vec::new(),
            auth: None,
            content: ContentDescriptor::default(),
            timeout: None,
            pooling: true,
            ensure_success: false,
            trace_id: None,
            client: ClientSource::default(),
            hooks: Hooks::default(),
            status_handlers: Vec::new(),
            event_handler: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn path_param(mut self, name: &str, value: impl ToString) -> Self {
        self.path_params.push((name.to_string(), value.to_string()));
        self
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        self.removed_headers.push(name.to_string());
        self
    }

    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_string(), value.to_string()));
        self
    }

    pub fn auth(mut self, auth: Authentication) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn content(mut self, content: ContentDescriptor) -> Self {
        self.content = content;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn pooling(mut self, pooling: bool) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn ensure_success(mut self, ensure: bool) -> Self {
        self.ensure_success = ensure;
        self
    }

    pub fn trace_id(mut self, trace_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self
    }

    /// Use the client factory registered on the engine under `name`.
    pub fn factory(mut self, name: &str) -> Self {
        self.client = ClientSource::Named(name.to_string());
        self
    }

    pub fn client(mut self, source: ClientSource) -> Self {
        self.client = source;
        self
    }

    pub fn event_handler(mut self, name: &str) -> Self {
        self.event_handler = Some(name.to_string());
        self
    }

    pub fn on_pre_set_content(mut self, hook: impl Fn(&mut ContentDescriptor) + Send + Sync + 'static) -> Self {
        self.hooks.pre_set_content = Some(Arc::new(hook));
        self
    }

    pub fn on_pre_send(mut self, hook: impl Fn(&mut reqwest::Request) + Send + Sync + 'static) -> Self {
        self.hooks.pre_send = Some(Arc::new(hook));
        self
    }

    pub fn on_post_send(mut self, hook: impl Fn(&ResponseMessage) + Send + Sync + 'static) -> Self {
        self.hooks.post_send = Some(Arc::new(hook));
        self
    }

    pub fn on_send_failed(
        mut self,
        hook: impl Fn(&CallError, &RequestDescriptor) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.send_failed = Some(Arc::new(hook));
        self
    }

    /// Run `handler` whenever the response status is one of `codes`.
    /// Handlers for overlapping codes all run, in registration order.
    pub fn on_status(mut self, codes: &[u16], handler: impl Fn(&ResponseMessage) + Send + Sync + 'static) -> Self {
        self.status_handlers.push(StatusHandler {
            codes: codes.to_vec(),
            handler: Arc::new(handler),
        });
        self
    }

    /// The final URL with path parameters bound and query pairs appended.
    pub fn resolve_url(&self) -> Result<Url, CallError> {
        let mut raw = self.url.clone();
        for (name, value) in &self.path_params {
            let placeholder = format!("{{{name}}}");
            if !raw.contains(&placeholder) {
                return Err(CallError::InvalidRequest(format!(
                    "path parameter '{name}' has no placeholder in {}",
                    self.url
                )));
            }
            raw = raw.replace(&placeholder, &encode_segment(value));
        }

        // Bound values are percent-encoded, so any `{name}` left is unbound.
        if let Some(name) = first_placeholder(&raw) {
            return Err(CallError::InvalidRequest(format!(
                "path parameter '{name}' is not bound in {}",
                self.url
            )));
        }

        let mut url = Url::parse(&raw).map_err(|e| CallError::InvalidRequest(format!("{raw}: {e}")))?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &self.query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    /// The `Cookie` header value, if any cookies are set.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self.cookies.iter().map(|(name, value)| format!("{name}={value}")).collect();
        Some(pairs.join("; "))
    }
}

fn first_placeholder(raw: &str) -> Option<&str> {
    let mut rest = raw;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after.find('}')?;
        let name = &after[..close];
        if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Some(name);
        }
        rest = after;
    }
    None
}

/// Percent-encode one path segment. `byte_serialize` is form encoding, which
/// writes spaces as `+`; a literal `+` is always emitted as `%2B`.
fn encode_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
