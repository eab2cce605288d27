//! Raw HTTP/1.1 response dumps used by the per-hash layout (`<hash>.resp`).

use crate::error::StoreError;
use crate::request::{collect_headers, Body};
use crate::response::{is_event_stream, RecordedResponse};

impl RecordedResponse {
    /// Serializes the response as it would appear on the wire:
    /// `HTTP/1.1 <code> <reason>\r\n<headers>\r\n\r\n<body>`.
    pub fn to_dump(&self, reason: &str) -> Result<Vec<u8>, StoreError> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status_code, reason).into_bytes();
        for (name, values) in &self.headers {
            for value in values {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"\r\n");
        out.extend(self.body.render(is_event_stream(&self.headers))?);
        Ok(out)
    }

    /// Parses a dump written by [`RecordedResponse::to_dump`] or by other
    /// tools. Bare `\n` line endings are accepted.
    pub fn from_dump(data: &[u8]) -> Result<Self, StoreError> {
        let (head, body) = split_head(data);
        let head = std::str::from_utf8(head)
            .map_err(|_| StoreError::Malformed("response head is not valid UTF-8".into()))?;
        let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));

        let status_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| StoreError::Malformed("missing status line".into()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(StoreError::Malformed(format!(
                "invalid status line {:?}",
                status_line
            )));
        }
        let code = parts.next().unwrap_or_default();
        let status_code = code
            .parse::<u16>()
            .ok()
            .filter(|c| (100..1000).contains(c))
            .ok_or_else(|| StoreError::Malformed(format!("invalid status code {:?}", code)))?;

        let mut pairs = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| StoreError::Malformed(format!("invalid header line {:?}", line)))?;
            pairs.push((name.trim(), value.trim().as_bytes()));
        }
        let headers = collect_headers(pairs);

        let body = if is_event_stream(&headers) {
            Body::decode_event_stream(body)
        } else {
            Body::decode(body)
        };
        Ok(Self {
            status_code,
            headers,
            body,
        })
    }
}

/// Splits at the first blank line, `\r\n\r\n` or `\n\n`.
fn split_head(data: &[u8]) -> (&[u8], &[u8]) {
    let crlf = find(data, b"\r\n\r\n").map(|i| (i, 4));
    let lf = find(data, b"\n\n").map(|i| (i, 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((at, len)) => (&data[..at], &data[at + len..]),
        None => (data, &data[data.len()..]),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
