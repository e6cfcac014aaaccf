//! Content negotiation: ordered strategies that turn values into wire bodies
//! ([`Processor`]) and response bodies into typed values ([`Converter`]).
//!
//! # Design
//! A strategy is a `{predicate, transform}` pair. The registry keeps one
//! ordered list per direction and evaluates predicates linearly; the first
//! match wins. [`NegotiationRegistry::new`] appends the built-in strategies
//! after the caller's, so a caller-supplied strategy always shadows a
//! built-in one for the same content type.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::content::{
    parse_content_type, ContentDescriptor, ContentValue, MediaType, TextEncoding, WireBody,
};
use crate::error::CallError;

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";
pub const APPLICATION_JSON: &str = "application/json";
pub const APPLICATION_XML: &str = "application/xml";
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";

type ProcessorPredicate = dyn Fn(&ContentValue, &MediaType) -> bool + Send + Sync;
type ProcessorTransform =
    dyn Fn(&ContentValue, &MediaType, Option<TextEncoding>) -> Result<WireBody, CallError> + Send + Sync;
type ConverterPredicate = dyn Fn(&MediaType, TargetKind) -> bool + Send + Sync;
type ConverterTransform =
    dyn Fn(&Bytes, &MediaType, TextEncoding, TargetKind) -> Result<Materialized, CallError> + Send + Sync;

/// Outbound strategy: converts a value into a wire body.
#[derive(Clone)]
pub struct Processor {
    name: Cow<'static, str>,
    predicate: Arc<ProcessorPredicate>,
    transform: Arc<ProcessorTransform>,
}

impl Processor {
    /// `transform` receives the value, the parsed content type, and the
    /// descriptor's explicit encoding (if any).
    pub fn new<P, T>(name: impl Into<Cow<'static, str>>, predicate: P, transform: T) -> Self
    where
        P: Fn(&ContentValue, &MediaType) -> bool + Send + Sync + 'static,
        T: Fn(&ContentValue, &MediaType, Option<TextEncoding>) -> Result<WireBody, CallError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            transform: Arc::new(transform),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn can_handle(&self, value: &ContentValue, media: &MediaType) -> bool {
        (self.predicate)(value, media)
    }

    pub fn process(
        &self,
        value: &ContentValue,
        media: &MediaType,
        encoding: Option<TextEncoding>,
    ) -> Result<WireBody, CallError> {
        (self.transform)(value, media, encoding)
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor").field("name", &self.name).finish()
    }
}

/// The shape a response body is materialized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Bytes,
    Text,
    Structured,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetKind::Bytes => "bytes",
            TargetKind::Text => "text",
            TargetKind::Structured => "structured value",
        })
    }
}

/// A converter's output, before it is narrowed to the caller's type.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    Bytes(Bytes),
    Text(String),
    Structured(serde_json::Value),
}

/// Inbound strategy: converts a response body into a [`Materialized`] value.
#[derive(Clone)]
pub struct Converter {
    name: Cow<'static, str>,
    predicate: Arc<ConverterPredicate>,
    transform: Arc<ConverterTransform>,
}

impl Converter {
    pub fn new<P, T>(name: impl Into<Cow<'static, str>>, predicate: P, transform: T) -> Self
    where
        P: Fn(&MediaType, TargetKind) -> bool + Send + Sync + 'static,
        T: Fn(&Bytes, &MediaType, TextEncoding, TargetKind) -> Result<Materialized, CallError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            transform: Arc::new(transform),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn can_convert(&self, media: &MediaType, target: TargetKind) -> bool {
        (self.predicate)(media, target)
    }

    pub fn convert(
        &self,
        body: &Bytes,
        media: &MediaType,
        encoding: TextEncoding,
        target: TargetKind,
    ) -> Result<Materialized, CallError> {
        (self.transform)(body, media, encoding, target)
    }
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter").field("name", &self.name).finish()
    }
}

/// Types a response body can be materialized into.
pub trait FromBody: Sized {
    fn target() -> TargetKind;
    fn from_materialized(value: Materialized) -> Result<Self, CallError>;
}

fn shape_mismatch(target: TargetKind, got: &Materialized) -> CallError {
    CallError::Materialization {
        target: target.to_string(),
        reason: format!("converter produced {got:?}"),
    }
}

impl FromBody for String {
    fn target() -> TargetKind {
        TargetKind::Text
    }

    fn from_materialized(value: Materialized) -> Result<Self, CallError> {
        match value {
            Materialized::Text(text) => Ok(text),
            other => Err(shape_mismatch(TargetKind::Text, &other)),
        }
    }
}

impl FromBody for Bytes {
    fn target() -> TargetKind {
        TargetKind::Bytes
    }

    fn from_materialized(value: Materialized) -> Result<Self, CallError> {
        match value {
            Materialized::Bytes(bytes) => Ok(bytes),
            other => Err(shape_mismatch(TargetKind::Bytes, &other)),
        }
    }
}

impl FromBody for Vec<u8> {
    fn target() -> TargetKind {
        TargetKind::Bytes
    }

    fn from_materialized(value: Materialized) -> Result<Self, CallError> {
        Bytes::from_materialized(value).map(|bytes| bytes.to_vec())
    }
}

impl FromBody for serde_json::Value {
    fn target() -> TargetKind {
        TargetKind::Structured
    }

    fn from_materialized(value: Materialized) -> Result<Self, CallError> {
        match value {
            Materialized::Structured(value) => Ok(value),
            other => Err(shape_mismatch(TargetKind::Structured, &other)),
        }
    }
}

/// Materializes a structured body into any deserializable type.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromBody for Json<T> {
    fn target() -> TargetKind {
        TargetKind::Structured
    }

    fn from_materialized(value: Materialized) -> Result<Self, CallError> {
        let value = serde_json::Value::from_materialized(value)?;
        serde_json::from_value(value)
            .map(Json)
            .map_err(|e| CallError::Materialization {
                target: std::any::type_name::<T>().to_string(),
                reason: e.to_string(),
            })
    }
}

/// Ordered processor and converter lists.
#[derive(Debug, Clone)]
pub struct NegotiationRegistry {
    processors: Vec<Processor>,
    converters: Vec<Converter>,
}

impl Default for NegotiationRegistry {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl NegotiationRegistry {
    /// Caller strategies first, built-ins after.
    pub fn new(processors: Vec<Processor>, converters: Vec<Converter>) -> Self {
        let mut registry = Self {
            processors,
            converters,
        };
        registry.processors.extend(builtin_processors());
        registry.converters.extend(builtin_converters());
        registry
    }

    /// A registry holding exactly the given strategies.
    pub fn without_builtins(processors: Vec<Processor>, converters: Vec<Converter>) -> Self {
        Self {
            processors,
            converters,
        }
    }

    pub fn processors(&self) -> &[Processor] {
        &self.processors
    }

    pub fn converters(&self) -> &[Converter] {
        &self.converters
    }

    pub fn select_processor(&self, value: &ContentValue, media: &MediaType) -> Option<&Processor> {
        self.processors.iter().find(|p| p.can_handle(value, media))
    }

    pub fn select_converter(&self, media: &MediaType, target: TargetKind) -> Option<&Converter> {
        self.converters.iter().find(|c| c.can_convert(media, target))
    }

    /// Turn the content descriptor into a wire body.
    ///
    /// `default_encoding` applies when neither the descriptor nor the
    /// content-type string names one.
    pub fn build_body(
        &self,
        content: &ContentDescriptor,
        default_encoding: Option<TextEncoding>,
    ) -> Result<WireBody, CallError> {
        let Some(value) = &content.value else {
            return Ok(WireBody::Empty);
        };
        let Some(raw_type) = content.content_type.as_deref() else {
            return prebuilt_body(value, content, None).ok_or_else(|| {
                CallError::unsupported(None, format!("{} value has no content type", value.kind()))
            });
        };

        let media = parse_content_type(raw_type, content.encoding.or(default_encoding));
        if let Some(processor) = self.select_processor(value, &media) {
            tracing::trace!(processor = processor.name(), content_type = raw_type, "processing body");
            // The descriptor's explicit encoding is what the header advertises.
            return processor.process(value, &media, content.encoding);
        }
        prebuilt_body(value, content, Some(raw_type)).ok_or_else(|| {
            CallError::unsupported(
                Some(raw_type),
                format!("no processor accepts a {} value", value.kind()),
            )
        })
    }

    /// Convert a response body into `T`.
    pub fn materialize<T: FromBody>(
        &self,
        body: &Bytes,
        media: &MediaType,
        encoding: TextEncoding,
    ) -> Result<T, CallError> {
        let target = T::target();
        let converter = self.select_converter(media, target).ok_or_else(|| {
            CallError::unsupported(
                Some(media.essence.as_str()),
                format!("no converter produces {target}"),
            )
        })?;
        tracing::trace!(converter = converter.name(), %target, "materializing body");
        T::from_materialized(converter.convert(body, media, encoding, target)?)
    }
}

fn prebuilt_body(
    value: &ContentValue,
    content: &ContentDescriptor,
    content_type: Option<&str>,
) -> Option<WireBody> {
    let content_type = content_type.map(str::to_string);
    match value {
        ContentValue::Bytes(data) => Some(WireBody::Bytes {
            data: data.clone(),
            content_type,
        }),
        ContentValue::File(path) => Some(WireBody::File {
            path: path.clone(),
            content_type,
            file_name: content.file_name.clone(),
        }),
        ContentValue::Multipart(body) => Some(WireBody::Multipart(body.clone())),
        _ => None,
    }
}

/// Header value for a processed body: the essence plus the charset it was
/// encoded with, when the caller named one. A charset the engine cannot
/// encode is replaced by the one actually used.
fn declared_type(media: &MediaType, used: TextEncoding, explicit: Option<TextEncoding>) -> String {
    match (&media.charset, media.encoding, explicit) {
        (Some(charset), Some(_), _) => format!("{}; charset={charset}", media.essence),
        (Some(charset), None, _) => {
            tracing::debug!(charset = %charset, used = used.label(), "unknown charset, encoding with fallback");
            format!("{}; charset={}", media.essence, used.label())
        }
        (None, _, Some(encoding)) => format!("{}; charset={}", media.essence, encoding.label()),
        (None, _, None) => media.essence.clone(),
    }
}

fn encoded(text: &str, media: &MediaType, explicit: Option<TextEncoding>) -> WireBody {
    let encoding = media.encoding.unwrap_or_default();
    WireBody::Bytes {
        data: Bytes::from(encoding.encode(text)),
        content_type: Some(declared_type(media, encoding, explicit)),
    }
}

/// Built-in processors, in evaluation order.
pub fn builtin_processors() -> Vec<Processor> {
    vec![
        Processor::new(
            "multipart",
            |_, media| media.is(MULTIPART_FORM_DATA),
            |value, media, _| match value {
                ContentValue::Multipart(body) => Ok(WireBody::Multipart(body.clone())),
                other => Err(CallError::unsupported(
                    Some(media.essence.as_str()),
                    format!(
                        "multipart bodies are assembled upstream; a {} value cannot be encoded here",
                        other.kind()
                    ),
                )),
            },
        ),
        Processor::new(
            "text",
            |value, media| {
                matches!(value, ContentValue::Text(_))
                    && [TEXT_PLAIN, TEXT_HTML, APPLICATION_XML].iter().any(|t| media.is(t))
            },
            |value, media, explicit| match value {
                ContentValue::Text(text) => Ok(encoded(text, media, explicit)),
                other => Err(CallError::unsupported(Some(media.essence.as_str()), other.kind())),
            },
        ),
        Processor::new(
            "json",
            |value, media| {
                media.is_json()
                    && matches!(
                        value,
                        ContentValue::Json(_) | ContentValue::Text(_) | ContentValue::Form(_)
                    )
            },
            |value, media, explicit| {
                let text = match value {
                    ContentValue::Json(json) => serde_json::to_string(json)
                        .map_err(|e| CallError::Serialization(e.to_string()))?,
                    // Already serialized by the caller.
                    ContentValue::Text(text) => text.clone(),
                    ContentValue::Form(pairs) => {
                        let object: serde_json::Map<String, serde_json::Value> = pairs
                            .iter()
                            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                            .collect();
                        serde_json::Value::Object(object).to_string()
                    }
                    other => return Err(CallError::unsupported(Some(media.essence.as_str()), other.kind())),
                };
                Ok(encoded(&text, media, explicit))
            },
        ),
        Processor::new(
            "form",
            |value, media| {
                media.is(FORM_URLENCODED)
                    && match value {
                        ContentValue::Form(_) | ContentValue::Text(_) => true,
                        ContentValue::Json(json) => json.is_object(),
                        _ => false,
                    }
            },
            |value, media, explicit| {
                let text = match value {
                    ContentValue::Form(pairs) => url::form_urlencoded::Serializer::new(String::new())
                        .extend_pairs(pairs)
                        .finish(),
                    ContentValue::Text(text) => text.clone(),
                    ContentValue::Json(serde_json::Value::Object(object)) => {
                        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                        for (key, value) in object {
                            match value {
                                serde_json::Value::String(s) => serializer.append_pair(key, s),
                                serde_json::Value::Null => serializer.append_pair(key, ""),
                                other => serializer.append_pair(key, &other.to_string()),
                            };
                        }
                        serializer.finish()
                    }
                    other => return Err(CallError::unsupported(Some(media.essence.as_str()), other.kind())),
                };
                Ok(encoded(&text, media, explicit))
            },
        ),
    ]
}

/// Built-in converters, in evaluation order.
pub fn builtin_converters() -> Vec<Converter> {
    vec![
        Converter::new(
            "bytes",
            |_, target| target == TargetKind::Bytes,
            |body, _, _, _| Ok(Materialized::Bytes(body.clone())),
        ),
        Converter::new(
            "text",
            |_, target| target == TargetKind::Text,
            |body, _, encoding, _| Ok(Materialized::Text(encoding.decode(body))),
        ),
        Converter::new(
            "json",
            |media, target| target == TargetKind::Structured && media.is_json(),
            |body, _, encoding, target| {
                let parsed = match encoding {
                    TextEncoding::Utf8 => serde_json::from_slice(body),
                    other => serde_json::from_str(&other.decode(body)),
                };
                parsed
                    .map(Materialized::Structured)
                    .map_err(|e| CallError::Materialization {
                        target: target.to_string(),
                        reason: e.to_string(),
                    })
            },
        ),
        Converter::new(
            "form",
            |media, target| target == TargetKind::Structured && media.is(FORM_URLENCODED),
            |body, _, _, _| {
                let object: serde_json::Map<String, serde_json::Value> =
                    url::form_urlencoded::parse(body)
                        .map(|(k, v)| (k.into_owned(), serde_json::Value::String(v.into_owned())))
                        .collect();
                Ok(Materialized::Structured(serde_json::Value::Object(object)))
            },
        ),
    ]
}
