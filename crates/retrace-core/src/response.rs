use flate2::read::GzDecoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;

use crate::error::StoreError;
use crate::format::{body_fields, body_from_fields, expand_headers, flatten_headers};
use crate::redact::Redactor;
use crate::request::{Body, Headers};

/// Headers never copied from a recording onto a replayed response; the
/// server frames whatever body it actually writes.
pub const FRAMING_HEADERS: [&str; 2] = ["Content-Length", "Content-Encoding"];

/// True when any `Content-Encoding` value mentions gzip.
pub fn is_gzip(headers: &Headers) -> bool {
    headers
        .get("Content-Encoding")
        .map(|values| values.iter().any(|v| v.to_ascii_lowercase().contains("gzip")))
        .unwrap_or(false)
}

/// True when the `Content-Type` is `text/event-stream`.
pub fn is_event_stream(headers: &Headers) -> bool {
    headers
        .get("Content-Type")
        .map(|values| {
            values
                .iter()
                .any(|v| v.to_ascii_lowercase().starts_with("text/event-stream"))
        })
        .unwrap_or(false)
}

pub fn gunzip(compressed: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoded = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut decoded)
        .map_err(StoreError::Gzip)?;
    Ok(decoded)
}

/// Rewrites a response header value with a regex before it is persisted or
/// relayed, e.g. to pin a volatile `Date`.
#[derive(Debug, Clone)]
pub struct HeaderReplacement {
    pub header: String,
    pub pattern: Regex,
    /// Replacement template; `$1` style group references are expanded.
    pub replace: String,
}

impl HeaderReplacement {
    pub fn apply(&self, headers: &mut Headers) {
        let name = crate::request::canonical_header_name(&self.header);
        if let Some(values) = headers.get_mut(&name) {
            for value in values.iter_mut() {
                *value = self
                    .pattern
                    .replace_all(value, self.replace.as_str())
                    .into_owned();
            }
        }
    }
}

/// Canonical snapshot of one upstream reply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(into = "ResponseDocument", try_from = "ResponseDocument")]
pub struct RecordedResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Body,
}

impl RecordedResponse {
    /// Builds the canonical response from what the upstream sent.
    ///
    /// Gzip bodies are decoded first; event streams are split per `data:`
    /// line; anything else is decoded as a single JSON document.
    pub fn from_upstream(status_code: u16, headers: Headers, raw: &[u8]) -> Result<Self, StoreError> {
        let decoded;
        let bytes = if is_gzip(&headers) {
            decoded = gunzip(raw)?;
            decoded.as_slice()
        } else {
            raw
        };
        let body = if is_event_stream(&headers) {
            Body::decode_event_stream(bytes)
        } else {
            Body::decode(bytes)
        };
        Ok(Self {
            status_code,
            headers,
            body,
        })
    }

    /// Keeps the body bytes exactly as received.
    pub fn undecoded(status_code: u16, headers: Headers, raw: &[u8]) -> Self {
        Self {
            status_code,
            headers,
            body: Body::raw(raw),
        }
    }

    pub fn redact(&mut self, redactor: &Redactor) {
        if !redactor.is_active() {
            return;
        }
        redactor.redact_headers(&mut self.headers);
        self.body = self.body.redacted(redactor);
    }

    /// Headers to write on a replayed response, minus [`FRAMING_HEADERS`].
    pub fn replay_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(name, _)| {
                !FRAMING_HEADERS
                    .iter()
                    .any(|framing| framing.eq_ignore_ascii_case(name))
            })
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
    }
}

/// JSON shape of a [`RecordedResponse`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDocument {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body_segments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl From<RecordedResponse> for ResponseDocument {
    fn from(resp: RecordedResponse) -> Self {
        let (body_segments, raw_body) = body_fields(&resp.body);
        Self {
            status_code: resp.status_code,
            headers: flatten_headers(&resp.headers),
            body_segments,
            raw_body,
        }
    }
}

impl TryFrom<ResponseDocument> for RecordedResponse {
    type Error = StoreError;

    fn try_from(doc: ResponseDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            status_code: doc.status_code,
            headers: expand_headers(doc.headers),
            body: body_from_fields(doc.body_segments, doc.raw_body)?,
        })
    }
}
