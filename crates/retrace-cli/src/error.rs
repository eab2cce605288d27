use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use retrace_core::{StoreError, TranscriptError};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Anything that stops a proxied request from being answered normally.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid websocket transcript: {0}")]
    Transcript(#[from] TranscriptError),

    #[error("failed to read request body: {0}")]
    RequestBody(#[source] hyper::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),

    #[error("failed to read upstream response: {0}")]
    UpstreamBody(#[source] reqwest::Error),

    #[error("upstream websocket dial failed: {0}")]
    UpstreamWebSocket(#[source] tungstenite::Error),

    #[error("invalid websocket upgrade request: {0}")]
    Upgrade(String),

    #[error("failed to build response: {0}")]
    Response(#[from] hyper::http::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Store(StoreError::InvalidTestName(_)) => StatusCode::BAD_REQUEST,
            ProxyError::Store(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ProxyError::Upgrade(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_)
            | ProxyError::UpstreamBody(_)
            | ProxyError::UpstreamWebSocket(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text error response carrying the message.
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(format!("{}\n", self)));
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
