//! Turns a live request into its canonical, redacted form.

use hyper::body::Bytes;
use hyper::http::request::Parts;
use hyper::{Body, Request};
use retrace_core::request::collect_headers;
use retrace_core::{Format, RecordedRequest, Redactor, Store};
use std::sync::Arc;

use crate::config::Endpoint;
use crate::error::ProxyError;

/// Headers hyper keeps in the map that never take part in the canonical
/// request. `Host` changes with the listening port.
const SKIPPED_HEADERS: [&str; 2] = ["host", "transfer-encoding"];

/// What every engine needs to canonicalize requests for one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointContext {
    pub endpoint: Arc<Endpoint>,
    pub store: Store,
    pub redactor: Arc<Redactor>,
}

impl EndpointContext {
    pub fn format(&self) -> Format {
        self.store.format()
    }

    /// Buffers the body and builds the redacted canonical request. The
    /// returned parts and bytes are untouched, ready to be forwarded.
    pub async fn capture(
        &self,
        req: Request<Body>,
    ) -> Result<(Parts, Bytes, RecordedRequest), ProxyError> {
        let (parts, body) = req.into_parts();
        let bytes = hyper::body::to_bytes(body)
            .await
            .map_err(ProxyError::RequestBody)?;
        let recorded = self.canonicalize(&parts, &bytes);
        Ok((parts, bytes, recorded))
    }

    pub fn canonicalize(&self, parts: &Parts, body: &[u8]) -> RecordedRequest {
        let mut recorded = canonical_request(parts, body, &self.endpoint, self.format());
        recorded.redact_header_names(&self.endpoint.config.redact_request_headers);
        recorded.redact_secrets(&self.redactor);
        recorded
    }
}

/// Path and query as the client sent them.
pub fn path_and_query(parts: &Parts) -> &str {
    parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
}

/// Canonical request before redaction. The previous-request hash is left
/// for the chain to fill in.
pub fn canonical_request(
    parts: &Parts,
    body: &[u8],
    endpoint: &Endpoint,
    format: Format,
) -> RecordedRequest {
    let method = parts.method.as_str().to_string();
    let url = path_and_query(parts).to_string();
    let request = format!("{} {} {:?}", method, url, parts.version);
    let headers = collect_headers(
        parts
            .headers
            .iter()
            .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| (name.as_str(), value.as_bytes())),
    );

    RecordedRequest {
        method,
        url,
        request,
        headers,
        body: format.capture_body(body),
        previous_request: String::new(),
        server_address: endpoint.config.target_host.clone(),
        port: endpoint.config.target_port,
        protocol: endpoint.config.target_type.clone(),
    }
}
