//! On-disk serializations of a [`RecordedRequest`].
//!
//! Two generations coexist:
//!
//! ```text
//! Text (per-hash .req files)            Json (grouped record files)
//! ──────────────────────────            ───────────────────────────
//! <previous hash>                       {
//! Server Address: <host>                  "method": "POST",
//! Port: <port>                            "url": "/v1/x?alt=sse",
//! Protocol: <type>                        "request": "POST /v1/x?alt=sse HTTP/1.1",
//! ********************  (80)              "headers": { "Accept": "a, b" },
//! <request line>                          "bodySegments": [ {...} ],
//! Header: value         (one per value)   "previousRequest": "<hash>",
//!                                         "serverAddress": "...", "port": 443,
//!                                         "protocol": "https"
//! <body bytes>                          }
//! ```
//!
//! The content hash is the SHA-256 of whichever serialization the layout
//! uses, so record and replay must agree on the format.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::request::{Body, Headers, RecordedRequest};

/// Separator between the endpoint block and the request in the text format.
pub const SEPARATOR: &str =
    "********************************************************************************";

const SERVER_ADDRESS_PREFIX: &str = "Server Address: ";
const PORT_PREFIX: &str = "Port: ";
const PROTOCOL_PREFIX: &str = "Protocol: ";

/// Serialization generation of a recorded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Line oriented text, one request per `.req` file.
    Text,
    /// Sparse JSON object, grouped into record files.
    Json,
}

impl Format {
    pub fn serialize_request(&self, req: &RecordedRequest) -> Result<Vec<u8>, StoreError> {
        match self {
            Format::Text => Ok(serialize_text(req)),
            Format::Json => serde_json::to_vec_pretty(&RequestDocument::from(req))
                .map_err(|e| StoreError::json("serializing request", e)),
        }
    }

    pub fn deserialize_request(&self, data: &[u8]) -> Result<RecordedRequest, StoreError> {
        match self {
            Format::Text => deserialize_text(data),
            Format::Json => {
                let doc: RequestDocument = serde_json::from_slice(data)
                    .map_err(|e| StoreError::json("deserializing request", e))?;
                RecordedRequest::try_from(doc)
            }
        }
    }

    /// Hex SHA-256 of the serialized request.
    pub fn compute_sum(&self, req: &RecordedRequest) -> Result<String, StoreError> {
        let serialized = self.serialize_request(req)?;
        Ok(hex::encode(Sha256::digest(&serialized)))
    }

    /// Body representation for freshly captured bytes. The text format keeps
    /// bytes verbatim so the hash covers exactly what was sent.
    pub fn capture_body(&self, bytes: &[u8]) -> Body {
        match self {
            Format::Text => Body::raw(bytes),
            Format::Json => Body::decode(bytes),
        }
    }
}

fn serialize_text(req: &RecordedRequest) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&req.previous_request);
    out.push('\n');
    out.push_str(SERVER_ADDRESS_PREFIX);
    out.push_str(&req.server_address);
    out.push('\n');
    out.push_str(PORT_PREFIX);
    out.push_str(&req.port.to_string());
    out.push('\n');
    out.push_str(PROTOCOL_PREFIX);
    out.push_str(&req.protocol);
    out.push('\n');
    out.push_str(SEPARATOR);
    out.push('\n');
    out.push_str(&req.request);
    out.push('\n');
    for (name, values) in &req.headers {
        for value in values {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
    }
    out.push_str("\n\n");

    let mut bytes = out.into_bytes();
    match &req.body {
        Body::Empty => {}
        Body::Raw(raw) => bytes.extend_from_slice(raw),
        Body::Segments(segments) => {
            for (i, segment) in segments.iter().enumerate() {
                if i > 0 {
                    bytes.push(b'\n');
                }
                bytes.extend_from_slice(segment.to_string().as_bytes());
            }
        }
    }
    bytes
}

fn deserialize_text(data: &[u8]) -> Result<RecordedRequest, StoreError> {
    // (start offset, line without the trailing '\n')
    let mut lines: Vec<(usize, &[u8])> = Vec::new();
    let mut start = 0;
    for (i, b) in data.iter().enumerate() {
        if *b == b'\n' {
            lines.push((start, &data[start..i]));
            start = i + 1;
        }
    }
    lines.push((start, &data[start..]));

    if lines.len() < 6 {
        return Err(StoreError::Malformed(format!(
            "expected at least 6 lines, found {}",
            lines.len()
        )));
    }

    let text = |i: usize| -> Result<&str, StoreError> {
        std::str::from_utf8(lines[i].1)
            .map_err(|_| StoreError::Malformed(format!("line {} is not valid UTF-8", i + 1)))
    };
    let field = |i: usize, prefix: &str| -> Result<String, StoreError> {
        text(i)?
            .strip_prefix(prefix)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Malformed(format!("line {} must start with {:?}", i + 1, prefix)))
    };

    let previous_request = text(0)?.to_string();
    let server_address = field(1, SERVER_ADDRESS_PREFIX)?;
    let port_text = field(2, PORT_PREFIX)?;
    let port = port_text
        .parse::<u16>()
        .map_err(|_| StoreError::InvalidPort(port_text.clone()))?;
    let protocol = field(3, PROTOCOL_PREFIX)?;
    if text(4)? != SEPARATOR {
        return Err(StoreError::Malformed("missing separator line".into()));
    }
    let request = text(5)?.to_string();

    // The header block has no fixed length; the body starts after the first
    // pair of empty lines.
    let blank_pair = (6..lines.len().saturating_sub(1))
        .find(|&i| lines[i].1.is_empty() && lines[i + 1].1.is_empty())
        .ok_or_else(|| StoreError::Malformed("missing blank lines before body".into()))?;

    let mut headers = Headers::new();
    for i in 6..blank_pair {
        let line = text(i)?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StoreError::Malformed(format!("invalid header line {:?}", line)))?;
        headers
            .entry(name.to_string())
            .or_default()
            .push(value.strip_prefix(' ').unwrap_or(value).to_string());
    }

    let body_start = lines
        .get(blank_pair + 2)
        .map(|(offset, _)| *offset)
        .unwrap_or(data.len());

    let (method, url) = split_request_line(&request);
    Ok(RecordedRequest {
        method,
        url,
        request,
        headers,
        body: Body::raw(&data[body_start..]),
        previous_request,
        server_address,
        port,
        protocol,
    })
}

/// Method and URL from a `"{METHOD} {URL} {PROTOCOL}"` line.
fn split_request_line(line: &str) -> (String, String) {
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().unwrap_or_default().to_string();
    let url = parts.next().unwrap_or_default().to_string();
    (method, url)
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

pub(crate) fn flatten_headers(headers: &Headers) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, values)| (name.clone(), values.join(", ")))
        .collect()
}

pub(crate) fn expand_headers(headers: BTreeMap<String, String>) -> Headers {
    headers
        .into_iter()
        .map(|(name, value)| (name, vec![value]))
        .collect()
}

/// Splits a [`Body`] into the sparse `bodySegments` / `rawBody` pair.
pub(crate) fn body_fields(body: &Body) -> (Vec<Value>, Option<String>) {
    match body {
        Body::Empty => (Vec::new(), None),
        Body::Segments(segments) => (segments.clone(), None),
        Body::Raw(raw) => (Vec::new(), Some(BASE64.encode(raw))),
    }
}

pub(crate) fn body_from_fields(
    segments: Vec<Value>,
    raw: Option<String>,
) -> Result<Body, StoreError> {
    if let Some(raw) = raw {
        let bytes = BASE64
            .decode(raw.as_bytes())
            .map_err(|e| StoreError::Malformed(format!("rawBody is not base64: {}", e)))?;
        return Ok(Body::raw(&bytes));
    }
    if segments.is_empty() {
        Ok(Body::Empty)
    } else {
        Ok(Body::Segments(segments))
    }
}

/// JSON shape of a [`RecordedRequest`]. Empty fields are omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDocument {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body_segments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub previous_request: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_address: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl From<&RecordedRequest> for RequestDocument {
    fn from(req: &RecordedRequest) -> Self {
        let (body_segments, raw_body) = body_fields(&req.body);
        Self {
            method: req.method.clone(),
            url: req.url.clone(),
            request: req.request.clone(),
            headers: flatten_headers(&req.headers),
            body_segments,
            raw_body,
            previous_request: req.previous_request.clone(),
            server_address: req.server_address.clone(),
            port: req.port,
            protocol: req.protocol.clone(),
        }
    }
}

impl From<RecordedRequest> for RequestDocument {
    fn from(req: RecordedRequest) -> Self {
        Self::from(&req)
    }
}

impl TryFrom<RequestDocument> for RecordedRequest {
    type Error = StoreError;

    fn try_from(doc: RequestDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            method: doc.method,
            url: doc.url,
            request: doc.request,
            headers: expand_headers(doc.headers),
            body: body_from_fields(doc.body_segments, doc.raw_body)?,
            previous_request: doc.previous_request,
            server_address: doc.server_address,
            port: doc.port,
            protocol: doc.protocol,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HEAD_SHA;
    use serde_json::json;

    const PREV: &str = "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20";

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for (k, v) in pairs {
            h.entry(k.to_string()).or_default().push(v.to_string());
        }
        h
    }

    fn prefix(prev: &str) -> String {
        format!("{prev}\nServer Address: \nPort: 0\nProtocol: \n{SEPARATOR}\n")
    }

    #[test]
    fn text_serialization() {
        let cases = vec![
            (
                RecordedRequest {
                    previous_request: HEAD_SHA.into(),
                    ..Default::default()
                },
                format!("{}\n\n\n", prefix(HEAD_SHA)),
            ),
            (
                RecordedRequest {
                    request: "GET / HTTP/1.1".into(),
                    headers: headers(&[
                        ("Content-Type", "application/json"),
                        ("Accept", "application/xml"),
                    ]),
                    previous_request: HEAD_SHA.into(),
                    ..Default::default()
                },
                format!(
                    "{}GET / HTTP/1.1\nAccept: application/xml\nContent-Type: application/json\n\n\n",
                    prefix(HEAD_SHA)
                ),
            ),
            (
                RecordedRequest {
                    request: "POST /data HTTP/1.1".into(),
                    body: Body::Raw(b"{\"key\": \"value\"}".to_vec()),
                    previous_request: HEAD_SHA.into(),
                    ..Default::default()
                },
                format!("{}POST /data HTTP/1.1\n\n\n{{\"key\": \"value\"}}", prefix(HEAD_SHA)),
            ),
            (
                RecordedRequest {
                    request: "GET / HTTP/1.1".into(),
                    previous_request: PREV.into(),
                    ..Default::default()
                },
                format!("{}GET / HTTP/1.1\n\n\n", prefix(PREV)),
            ),
        ];
        for (req, expected) in cases {
            let actual = Format::Text.serialize_request(&req).unwrap();
            assert_eq!(String::from_utf8(actual).unwrap(), expected);
        }
    }

    #[test]
    fn text_deserialization() {
        let input = format!(
            "{PREV}\nServer Address: example.com\nPort: 8080\nProtocol: http\n{SEPARATOR}\nGET / HTTP/1.1\nAccept: application/xml\nContent-Type: application/json\n\n\n{{\"key\": \"value\"}}"
        );
        let req = Format::Text.deserialize_request(input.as_bytes()).unwrap();
        assert_eq!(req.request, "GET / HTTP/1.1");
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/");
        assert_eq!(
            req.headers,
            headers(&[
                ("Accept", "application/xml"),
                ("Content-Type", "application/json"),
            ])
        );
        assert_eq!(req.body, Body::Raw(b"{\"key\": \"value\"}".to_vec()));
        assert_eq!(req.previous_request, PREV);
        assert_eq!(req.server_address, "example.com");
        assert_eq!(req.port, 8080);
        assert_eq!(req.protocol, "http");
    }

    #[test]
    fn text_deserialization_errors() {
        let bad_port = format!(
            "{PREV}\nServer Address: example.com\nPort: invalid\nProtocol: http\n{SEPARATOR}\nGET / HTTP/1.1\n\n\n"
        );
        assert!(matches!(
            Format::Text.deserialize_request(bad_port.as_bytes()),
            Err(StoreError::InvalidPort(p)) if p == "invalid"
        ));
        assert!(Format::Text
            .deserialize_request(b"GET / HTTP/1.1\nAccept: application/xml")
            .is_err());
        assert!(Format::Text.deserialize_request(b"").is_err());

        let no_blank = format!("{}GET / HTTP/1.1\nAccept: a", prefix(PREV));
        assert!(matches!(
            Format::Text.deserialize_request(no_blank.as_bytes()),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn text_round_trip_keeps_body_blank_lines_and_multi_values() {
        let req = RecordedRequest {
            method: "PUT".into(),
            url: "/a?b=c".into(),
            request: "PUT /a?b=c HTTP/1.1".into(),
            headers: headers(&[("Set-Cookie", "a=1"), ("Set-Cookie", "b=2"), ("X-Empty", "")]),
            body: Body::Raw(b"line one\n\n\nline four\n".to_vec()),
            previous_request: PREV.into(),
            server_address: "api.example.com".into(),
            port: 443,
            protocol: "https".into(),
        };
        let bytes = Format::Text.serialize_request(&req).unwrap();
        assert_eq!(Format::Text.deserialize_request(&bytes).unwrap(), req);
    }

    #[test]
    fn json_is_sparse() {
        let req = RecordedRequest {
            previous_request: HEAD_SHA.into(),
            ..Default::default()
        };
        let bytes = Format::Json.serialize_request(&req).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({ "previousRequest": HEAD_SHA }));
        assert_eq!(Format::Json.deserialize_request(&bytes).unwrap(), req);
    }

    #[test]
    fn json_round_trip() {
        let req = RecordedRequest {
            method: "POST".into(),
            url: "/v1/generate?alt=sse".into(),
            request: "POST /v1/generate?alt=sse HTTP/1.1".into(),
            headers: headers(&[("Content-Type", "application/json")]),
            body: Body::Segments(vec![json!({"contents": [{"text": "hi"}]}), json!({"n": 2})]),
            previous_request: PREV.into(),
            server_address: "api.example.com".into(),
            port: 443,
            protocol: "https".into(),
        };
        let bytes = Format::Json.serialize_request(&req).unwrap();
        assert_eq!(Format::Json.deserialize_request(&bytes).unwrap(), req);

        let raw = RecordedRequest {
            body: Body::Raw(vec![0, 159, 146, 150]),
            ..req
        };
        let bytes = Format::Json.serialize_request(&raw).unwrap();
        assert_eq!(Format::Json.deserialize_request(&bytes).unwrap(), raw);
    }

    #[test]
    fn json_flattens_multi_value_headers() {
        let req = RecordedRequest {
            headers: headers(&[("Accept", "a"), ("Accept", "b")]),
            ..Default::default()
        };
        let bytes = Format::Json.serialize_request(&req).unwrap();
        let back = Format::Json.deserialize_request(&bytes).unwrap();
        assert_eq!(back.headers["Accept"], vec!["a, b"]);
    }

    #[test]
    fn hash_is_deterministic_and_sensitive() {
        let base = RecordedRequest {
            request: "POST / HTTP/1.1".into(),
            headers: headers(&[("A", "B")]),
            body: Body::Raw(b"C".to_vec()),
            previous_request: HEAD_SHA.into(),
            ..Default::default()
        };
        for format in [Format::Text, Format::Json] {
            let h1 = format.compute_sum(&base).unwrap();
            assert_eq!(h1, format.compute_sum(&base).unwrap());
            assert_eq!(h1.len(), 64);

            let mut header_changed = base.clone();
            header_changed.headers = headers(&[("A", "B2")]);
            let mut body_changed = base.clone();
            body_changed.body = Body::Raw(b"D".to_vec());
            let mut prev_changed = base.clone();
            prev_changed.previous_request = h1.clone();
            // "A: B" + "C" must not collide with "A: " + "B:C".
            let mut shifted = base.clone();
            shifted.headers = headers(&[("A", "")]);
            shifted.body = Body::Raw(b"B:C".to_vec());

            for other in [header_changed, body_changed, prev_changed, shifted] {
                assert_ne!(h1, format.compute_sum(&other).unwrap());
            }
        }
    }

    #[test]
    fn formats_hash_differently() {
        let req = RecordedRequest {
            previous_request: HEAD_SHA.into(),
            ..Default::default()
        };
        assert_ne!(
            Format::Text.compute_sum(&req).unwrap(),
            Format::Json.compute_sum(&req).unwrap()
        );
    }
}
