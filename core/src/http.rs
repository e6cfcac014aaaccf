//! HTTP message types shared by the pipeline, the streaming sessions and the
//! callers' hooks.
//!
//! # Design
//! A [`ResponseMessage`] is created as soon as the response headers arrive.
//! Its body is either already buffered (full-body reads) or still attached to
//! the connection (headers-only reads, used by streaming sessions). A
//! headers-only message also keeps the call's scoped resources alive, so the
//! pooled client is released when the stream is dropped, not before.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderMap, StatusCode, Version};
use url::Url;

use crate::error::CallError;
use crate::pipeline::CallScope;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// When a send is considered complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    /// As soon as the response headers are read; the body stays on the wire.
    HeadersRead,
    /// After the whole body is buffered.
    #[default]
    ContentRead,
}

enum ResponseBody {
    Buffered(Bytes),
    Streaming(reqwest::Response),
    Consumed,
}

/// A received response.
pub struct ResponseMessage {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub url: Url,
    /// Time from handing the request to the transport until the message was
    /// complete under the call's completion policy.
    pub elapsed: Duration,
    body: ResponseBody,
    _scope: Option<CallScope>,
}

impl ResponseMessage {
    pub(crate) fn streaming(response: reqwest::Response, elapsed: Duration) -> Self {
        Self {
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
            url: response.url().clone(),
            elapsed,
            body: ResponseBody::Streaming(response),
            _scope: None,
        }
    }

    /// Read the remaining body into memory.
    pub(crate) async fn buffer(&mut self) -> Result<(), CallError> {
        self.body = match std::mem::replace(&mut self.body, ResponseBody::Consumed) {
            ResponseBody::Streaming(response) => ResponseBody::Buffered(response.bytes().await?),
            other => other,
        };
        Ok(())
    }

    /// Keep the call's resources alive for as long as this message lives.
    pub(crate) fn hold(&mut self, scope: CallScope) {
        self._scope = Some(scope);
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// `true` while the body is still being received from the network.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Streaming(_))
    }

    /// The buffered body, if the message was read to completion.
    pub fn body(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Next chunk of the body; `None` at the end of the stream.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, CallError> {
        if let ResponseBody::Streaming(response) = &mut self.body {
            return Ok(response.chunk().await?);
        }
        match std::mem::replace(&mut self.body, ResponseBody::Consumed) {
            ResponseBody::Buffered(bytes) if !bytes.is_empty() => Ok(Some(bytes)),
            _ => Ok(None),
        }
    }

    /// The whole remaining body.
    pub async fn bytes(mut self) -> Result<Bytes, CallError> {
        self.buffer().await?;
        match std::mem::replace(&mut self.body, ResponseBody::Consumed) {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            _ => Ok(Bytes::new()),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
            .or_else(|| self.body().map(|b| b.len() as u64))
    }

    /// Raw `Set-Cookie` header values, in order.
    pub fn raw_set_cookies(&self) -> Vec<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Debug for ResponseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseMessage")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

/// A parsed `Set-Cookie` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<String>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

impl SetCookie {
    /// Parse one `Set-Cookie` value. Returns `None` when the leading
    /// `name=value` pair is missing or the name is empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut attributes = raw.split(';');
        let (name, value) = attributes.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = SetCookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            ..SetCookie::default()
        };
        for attribute in attributes {
            let (key, value) = match attribute.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (attribute.trim(), None),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = value.map(|v| v.trim_start_matches('.').to_string()),
                "path" => cookie.path = value.map(str::to_string),
                "expires" => cookie.expires = value.map(str::to_string),
                "max-age" => cookie.max_age = value.and_then(|v| v.parse().ok()),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => cookie.same_site = value.map(str::to_string),
                _ => {}
            }
        }
        Some(cookie)
    }
}
