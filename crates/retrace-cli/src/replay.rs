use hyper::header::{HeaderName, HeaderValue, CONTENT_ENCODING};
use hyper::{Body, Request, Response, StatusCode};
use retrace_core::response::is_event_stream;
use retrace_core::ChainState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::capture::EndpointContext;
use crate::error::ProxyError;
use crate::websocket;

/// Query marker of streamed (server-sent event) requests.
const SSE_MARKER: &str = "alt=sse";

/// Answers requests from the recording directory without contacting any
/// upstream.
pub struct Replayer {
    pub(crate) ctx: EndpointContext,
    chain: Mutex<ChainState>,
}

impl Replayer {
    pub fn new(ctx: EndpointContext) -> Self {
        Self {
            ctx,
            chain: Mutex::new(ChainState::new()),
        }
    }

    pub async fn handle(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        if self.ctx.endpoint.is_health_check(req.uri().path()) {
            return Response::new(Body::empty());
        }

        let method = req.method().clone();
        let uri = req.uri().clone();
        let result = if websocket::is_upgrade(&req) {
            websocket::replay(self.clone(), req).await
        } else {
            self.replay_http(req).await
        };
        result.unwrap_or_else(|e| {
            warn!(endpoint = %self.ctx.endpoint.name(), %method, %uri, error = %e, "replay failed");
            e.into_response()
        })
    }

    async fn replay_http(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let format = self.ctx.format();
        let (_parts, _body, mut recorded) = self.ctx.capture(req).await?;

        // Lookup happens under the lock so the head moves in request order.
        let mut chain = self.chain.lock().await;
        let resolved = chain.link(&mut recorded, format)?;
        let stored = self.ctx.store.load_response(&resolved)?;
        chain.advance(&resolved);
        drop(chain);

        info!(
            endpoint = %self.ctx.endpoint.name(),
            request = %recorded.request,
            status = stored.response.status_code,
            hash = %resolved.hash,
            file = %resolved.file_name,
            "replayed"
        );

        let status = StatusCode::from_u16(stored.response.status_code).map_err(|e| {
            retrace_core::StoreError::Malformed(format!("recorded status code: {}", e))
        })?;
        let mut builder = Response::builder().status(status);
        for (name, value) in stored.response.replay_headers() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            builder = builder.header(name, value);
        }

        let body = match stored.gzip {
            Some(gzip) => {
                builder = builder.header(CONTENT_ENCODING, "gzip");
                gzip
            }
            None => {
                let streamed =
                    recorded.url.contains(SSE_MARKER) || is_event_stream(&stored.response.headers);
                stored.response.body.render(streamed)?
            }
        };
        Ok(builder.body(Body::from(body))?)
    }
}
