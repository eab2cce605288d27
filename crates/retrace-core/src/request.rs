use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::format::{Format, RequestDocument};
use crate::redact::Redactor;

/// Previous-request hash carried by the first request of every chain.
pub const HEAD_SHA: &str = "b4d6e60a9b97e7b98c63df9308728c5c88c0b40c398046772c63447b94608b4d";

/// Header a test harness sets to group its interactions under one file.
pub const TEST_NAME_HEADER: &str = "Test-Name";

/// Canonically named headers, sorted by name, values in arrival order.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Normalizes a header name the way HTTP/1 canonical MIME keys are written:
/// `x-goog-api-key` becomes `X-Goog-Api-Key`.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Builds a [`Headers`] map from raw name/value pairs, keeping repeated
/// names as multiple values.
pub fn collect_headers<'a, I>(pairs: I) -> Headers
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut headers = Headers::new();
    for (name, value) in pairs {
        headers
            .entry(canonical_header_name(name))
            .or_default()
            .push(String::from_utf8_lossy(value).into_owned());
    }
    headers
}

/// Request or response body as persisted.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Decoded JSON documents; more than one for streamed bodies.
    Segments(Vec<Value>),
    /// Bytes kept verbatim, either because the format is byte oriented or
    /// because they are not JSON.
    Raw(Vec<u8>),
}

impl Body {
    /// Decodes a single JSON document, falling back to raw bytes.
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Body::Empty;
        }
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Body::Segments(vec![value]),
            Err(_) => Body::Raw(bytes.to_vec()),
        }
    }

    /// Splits a `text/event-stream` payload into one segment per `data:`
    /// line. Anything that does not parse keeps the payload raw.
    pub fn decode_event_stream(bytes: &[u8]) -> Self {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return Body::Raw(bytes.to_vec());
        };
        let mut segments = Vec::new();
        for line in text.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            match serde_json::from_str::<Value>(data.trim()) {
                Ok(value) => segments.push(value),
                Err(_) => return Body::Raw(bytes.to_vec()),
            }
        }
        if segments.is_empty() {
            Body::decode(bytes)
        } else {
            Body::Segments(segments)
        }
    }

    pub fn raw(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Raw(bytes.to_vec())
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Segments(s) => s.is_empty(),
            Body::Raw(b) => b.is_empty(),
        }
    }

    pub fn redacted(&self, redactor: &Redactor) -> Self {
        match self {
            Body::Empty => Body::Empty,
            Body::Segments(segments) => {
                Body::Segments(segments.iter().map(|s| redactor.redact_value(s)).collect())
            }
            Body::Raw(bytes) => Body::Raw(
                redactor
                    .redact_bytes(Some(bytes.as_slice()))
                    .map(|b| b.into_owned())
                    .unwrap_or_default(),
            ),
        }
    }

    /// Bytes written back to a client.
    ///
    /// With `event_stream` every segment becomes its own `data: <json>\n\n`
    /// frame; otherwise only the first segment is written.
    pub fn render(&self, event_stream: bool) -> Result<Vec<u8>, StoreError> {
        match self {
            Body::Empty => Ok(Vec::new()),
            Body::Raw(bytes) => Ok(bytes.clone()),
            Body::Segments(segments) if event_stream => {
                let mut out = Vec::new();
                for segment in segments {
                    out.extend_from_slice(b"data: ");
                    serde_json::to_writer(&mut out, segment)
                        .map_err(|e| StoreError::json("encoding body segment", e))?;
                    out.extend_from_slice(b"\n\n");
                }
                Ok(out)
            }
            Body::Segments(segments) => match segments.first() {
                Some(first) => serde_json::to_vec(first)
                    .map_err(|e| StoreError::json("encoding body segment", e)),
                None => Ok(Vec::new()),
            },
        }
    }
}

/// Canonical snapshot of one inbound request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(into = "RequestDocument", try_from = "RequestDocument")]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    /// `"{METHOD} {URL} {PROTOCOL}"`.
    pub request: String,
    pub headers: Headers,
    pub body: Body,
    /// Hash of the preceding request in the same chain, or [`HEAD_SHA`].
    pub previous_request: String,
    pub server_address: String,
    pub port: u16,
    pub protocol: String,
}

impl RecordedRequest {
    /// Drops the named headers outright. Names match case-insensitively.
    pub fn redact_header_names<S: AsRef<str>>(&mut self, names: &[S]) {
        for name in names {
            self.headers.remove(&canonical_header_name(name.as_ref()));
        }
    }

    /// Replaces secrets in the header values, request line, URL and body.
    pub fn redact_secrets(&mut self, redactor: &Redactor) {
        if !redactor.is_active() {
            return;
        }
        redactor.redact_headers(&mut self.headers);
        self.request = redactor.redact_str(&self.request).into_owned();
        self.url = redactor.redact_str(&self.url).into_owned();
        self.body = self.body.redacted(redactor);
    }

    /// Sanitized value of the [`TEST_NAME_HEADER`], if one was sent.
    ///
    /// Spaces become underscores; names that could escape the recording
    /// directory are rejected.
    pub fn test_name(&self) -> Result<Option<String>, StoreError> {
        let Some(name) = self
            .headers
            .get(TEST_NAME_HEADER)
            .and_then(|values| values.first())
        else {
            return Ok(None);
        };
        if name.contains("../") || name.contains("..\\") || name.starts_with('/') {
            return Err(StoreError::InvalidTestName(name.clone()));
        }
        if name.is_empty() {
            return Ok(None);
        }
        Ok(Some(name.replace(' ', "_")))
    }

    /// Content hash under `format`.
    pub fn compute_sum(&self, format: Format) -> Result<String, StoreError> {
        format.compute_sum(self)
    }

    /// Name of the file this request is recorded in: the sanitized test name
    /// when present, otherwise the content hash.
    pub fn recording_file_name(&self, format: Format) -> Result<String, StoreError> {
        match self.test_name()? {
            Some(name) => Ok(name),
            None => self.compute_sum(format),
        }
    }
}
