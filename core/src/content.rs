//! Request content: the value a caller wants to send, how it is declared, and
//! the wire body the negotiation registry turns it into.
//!
//! # Design
//! A content-type string is parsed exactly once into a [`MediaType`]: the
//! lower-cased essence (`type/subtype`) plus the `charset` parameter, if any.
//! Strategies match on the essence and read the encoding from the parsed value,
//! never from the raw string.
//!
//! Multipart bodies are assembled upstream (see [`MultipartBody`]) and travel
//! through negotiation untouched.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

/// Text encodings the engine can encode request text with and decode
/// response text from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
    Ascii,
    Latin1,
}

impl TextEncoding {
    /// Look up an encoding by its charset label, ignoring case and
    /// surrounding quotes or whitespace.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().trim_matches('"').to_ascii_lowercase();
        match label.as_str() {
            "utf-8" | "utf8" => Some(TextEncoding::Utf8),
            "utf-16" | "utf-16le" | "unicode" => Some(TextEncoding::Utf16Le),
            "utf-16be" => Some(TextEncoding::Utf16Be),
            "us-ascii" | "ascii" => Some(TextEncoding::Ascii),
            "iso-8859-1" | "latin1" | "latin-1" => Some(TextEncoding::Latin1),
            _ => None,
        }
    }

    /// Canonical charset label, as written into `Content-Type` headers.
    pub fn label(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Utf16Be => "utf-16be",
            TextEncoding::Ascii => "us-ascii",
            TextEncoding::Latin1 => "iso-8859-1",
        }
    }

    /// Encode `text`. Characters the encoding cannot represent become `?`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            TextEncoding::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            TextEncoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    /// Decode `bytes`, replacing malformed sequences with U+FFFD.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Utf16Le => decode_utf16(bytes, u16::from_le_bytes),
            TextEncoding::Utf16Be => decode_utf16(bytes, u16::from_be_bytes),
            TextEncoding::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
                .collect(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks(2).map(|pair| match pair {
        [a, b] => unit([*a, *b]),
        // Odd trailing byte.
        _ => 0xFFFD,
    });
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// A parsed content-type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    /// `type/subtype`, trimmed and lower-cased.
    pub essence: String,
    /// The `charset` parameter exactly as declared (unquoted, lower-cased).
    pub charset: Option<String>,
    /// The encoding for `charset`, or the caller's default when the string
    /// carries no `charset` parameter.
    pub encoding: Option<TextEncoding>,
}

impl MediaType {
    pub const OCTET_STREAM: &'static str = "application/octet-stream";

    /// `true` when the essence equals `essence`, ignoring case.
    pub fn is(&self, essence: &str) -> bool {
        self.essence.eq_ignore_ascii_case(essence)
    }

    /// `true` for `application/json` and `+json` structured-syntax suffixes.
    pub fn is_json(&self) -> bool {
        self.essence == "application/json" || self.essence.ends_with("+json")
    }

    /// Stand-in for responses that declare no content type.
    pub fn unknown() -> Self {
        MediaType {
            essence: Self::OCTET_STREAM.to_string(),
            charset: None,
            encoding: None,
        }
    }
}

/// Parse a content-type string into its essence and encoding.
///
/// `default_encoding` is used only when the string has no `charset`
/// parameter. A `charset` naming an unknown encoding yields no encoding.
pub fn parse_content_type(raw: &str, default_encoding: Option<TextEncoding>) -> MediaType {
    let mut pieces = raw.split(';');
    let essence = pieces.next().unwrap_or_default().trim().to_ascii_lowercase();
    let charset = pieces.find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
    });
    let encoding = match &charset {
        Some(label) => TextEncoding::from_label(label),
        None => default_encoding,
    };
    MediaType {
        essence,
        charset,
        encoding,
    }
}

/// The raw value a request carries, before negotiation.
#[derive(Clone)]
pub enum ContentValue {
    Text(String),
    Json(serde_json::Value),
    /// Ordered key/value pairs, e.g. for `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    /// Pre-built body bytes, sent as-is.
    Bytes(Bytes),
    /// Pre-built body streamed from a file on disk.
    File(PathBuf),
    /// Pre-built multipart body from the multipart assembler.
    Multipart(MultipartBody),
    /// Caller-defined value for user-registered processors.
    Custom(Arc<dyn Any + Send + Sync>),
}

impl ContentValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ContentValue::Text(_) => "text",
            ContentValue::Json(_) => "json",
            ContentValue::Form(_) => "form",
            ContentValue::Bytes(_) => "bytes",
            ContentValue::File(_) => "file",
            ContentValue::Multipart(_) => "multipart",
            ContentValue::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for ContentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentValue::Text(text) => f.debug_tuple("Text").field(text).finish(),
            ContentValue::Json(value) => f.debug_tuple("Json").field(value).finish(),
            ContentValue::Form(pairs) => f.debug_tuple("Form").field(pairs).finish(),
            ContentValue::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ContentValue::File(path) => f.debug_tuple("File").field(path).finish(),
            ContentValue::Multipart(body) => f.debug_tuple("Multipart").field(body).finish(),
            ContentValue::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// What a request sends and how it is declared.
///
/// `content_type` must be set whenever `value` is set, except for pre-built
/// byte or file bodies, which may go out undeclared.
#[derive(Debug, Clone, Default)]
pub struct ContentDescriptor {
    pub value: Option<ContentValue>,
    pub content_type: Option<String>,
    pub encoding: Option<TextEncoding>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

impl ContentDescriptor {
    pub fn new(value: ContentValue, content_type: &str) -> Self {
        Self {
            value: Some(value),
            content_type: Some(content_type.to_string()),
            ..Self::default()
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(ContentValue::Text(text.to_string()), "text/plain")
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::new(ContentValue::Json(value), "application/json")
    }

    pub fn form(pairs: Vec<(String, String)>) -> Self {
        Self::new(ContentValue::Form(pairs), "application/x-www-form-urlencoded")
    }

    pub fn multipart(body: MultipartBody) -> Self {
        Self::new(ContentValue::Multipart(body), "multipart/form-data")
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }
}

/// The body handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireBody {
    Empty,
    Bytes {
        data: Bytes,
        content_type: Option<String>,
    },
    File {
        path: PathBuf,
        content_type: Option<String>,
        file_name: Option<String>,
    },
    Multipart(MultipartBody),
}

/// A multipart body as produced by the multipart assembler: an ordered list
/// of named parts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartBody {
    pub parts: Vec<MultipartPart>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipartPart {
    pub name: String,
    pub content_type: Option<String>,
    pub encoding: Option<TextEncoding>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub data: PartData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PartData {
    Bytes(Bytes),
    File(PathBuf),
}

impl MultipartBody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text field encoded with `encoding` (UTF-8 when `None`).
    pub fn text(mut self, name: &str, value: &str, encoding: Option<TextEncoding>) -> Self {
        let data = encoding.unwrap_or_default().encode(value);
        self.parts.push(MultipartPart {
            name: name.to_string(),
            content_type: Some("text/plain".to_string()),
            encoding,
            file_name: None,
            file_size: Some(data.len() as u64),
            data: PartData::Bytes(Bytes::from(data)),
        });
        self
    }

    pub fn bytes(mut self, name: &str, data: Bytes, content_type: &str, file_name: Option<&str>) -> Self {
        self.parts.push(MultipartPart {
            name: name.to_string(),
            content_type: Some(content_type.to_string()),
            encoding: None,
            file_name: file_name.map(str::to_string),
            file_size: Some(data.len() as u64),
            data: PartData::Bytes(data),
        });
        self
    }

    /// Append a file part. The file is opened when the request is sent.
    pub fn file(mut self, name: &str, path: impl Into<PathBuf>, content_type: &str) -> Self {
        let path = path.into();
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        self.parts.push(MultipartPart {
            name: name.to_string(),
            content_type: Some(content_type.to_string()),
            encoding: None,
            file_name,
            file_size: None,
            data: PartData::File(path),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_type_is_lowercased_and_trimmed() {
        let media = parse_content_type("  Application/JSON ", None);
        assert_eq!(media.essence, "application/json");
        assert_eq!(media.charset, None);
        assert_eq!(media.encoding, None);
    }

    #[test]
    fn parse_charset_parameter() {
        let media = parse_content_type("text/plain; charset=ISO-8859-1", Some(TextEncoding::Utf8));
        assert_eq!(media.essence, "text/plain");
        assert_eq!(media.charset.as_deref(), Some("iso-8859-1"));
        assert_eq!(media.encoding, Some(TextEncoding::Latin1));
    }

    #[test]
    fn parse_quoted_charset_without_space() {
        let media = parse_content_type("text/html;charset=\"utf-16be\"", None);
        assert_eq!(media.essence, "text/html");
        assert_eq!(media.encoding, Some(TextEncoding::Utf16Be));
    }

    #[test]
    fn default_encoding_applies_only_without_charset() {
        let media = parse_content_type("text/plain", Some(TextEncoding::Latin1));
        assert_eq!(media.encoding, Some(TextEncoding::Latin1));

        let media = parse_content_type("text/plain; charset=utf-8", Some(TextEncoding::Latin1));
        assert_eq!(media.encoding, Some(TextEncoding::Utf8));
    }

    #[test]
    fn unknown_charset_keeps_label_but_no_encoding() {
        let media = parse_content_type("text/plain; charset=koi8-r", Some(TextEncoding::Utf8));
        assert_eq!(media.charset.as_deref(), Some("koi8-r"));
        assert_eq!(media.encoding, None);
    }

    #[test]
    fn other_parameters_are_ignored() {
        let media = parse_content_type("multipart/form-data; boundary=xyz", None);
        assert!(media.is("multipart/form-data"));
        assert_eq!(media.charset, None);
    }

    #[test]
    fn json_suffix_is_json() {
        assert!(parse_content_type("application/problem+json", None).is_json());
        assert!(!parse_content_type("application/xml", None).is_json());
    }

    #[test]
    fn latin1_encodes_and_decodes() {
        let bytes = TextEncoding::Latin1.encode("café€");
        assert_eq!(bytes, vec![b'c', b'a', b'f', 0xE9, b'?']);
        assert_eq!(TextEncoding::Latin1.decode(&bytes), "café?");
    }

    #[test]
    fn utf16_both_endians() {
        let le = TextEncoding::Utf16Le.encode("hé");
        assert_eq!(le, vec![b'h', 0, 0xE9, 0]);
        assert_eq!(TextEncoding::Utf16Le.decode(&le), "hé");

        let be = TextEncoding::Utf16Be.encode("hé");
        assert_eq!(be, vec![0, b'h', 0, 0xE9]);
        assert_eq!(TextEncoding::Utf16Be.decode(&be), "hé");
    }

    #[test]
    fn ascii_replaces_non_ascii() {
        assert_eq!(TextEncoding::Ascii.encode("naïve"), b"na?ve".to_vec());
        assert_eq!(TextEncoding::Ascii.decode(&[b'o', 0xFF, b'k']), "o\u{FFFD}k");
    }

    #[test]
    fn labels_resolve_aliases() {
        assert_eq!(TextEncoding::from_label("UTF8"), Some(TextEncoding::Utf8));
        assert_eq!(TextEncoding::from_label("latin1"), Some(TextEncoding::Latin1));
        assert_eq!(TextEncoding::from_label("unicode"), Some(TextEncoding::Utf16Le));
        assert_eq!(TextEncoding::from_label("ebcdic"), None);
    }

    #[test]
    fn multipart_builder_keeps_part_order() {
        let body = MultipartBody::new()
            .text("title", "hello", None)
            .bytes("blob", Bytes::from_static(b"\x00\x01"), "application/octet-stream", Some("a.bin"))
            .file("report", "/tmp/report.csv", "text/csv");

        let names: Vec<_> = body.parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["title", "blob", "report"]);
        assert_eq!(body.parts[1].file_size, Some(2));
        assert_eq!(body.parts[2].file_name.as_deref(), Some("report.csv"));
    }
}
