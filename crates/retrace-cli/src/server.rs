use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

use crate::config::Endpoint;
use crate::record::Recorder;
use crate::replay::Replayer;

/// The request handler behind one listening endpoint.
#[derive(Clone)]
pub enum Engine {
    Record(Arc<Recorder>),
    Replay(Arc<Replayer>),
}

impl Engine {
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match self {
            Engine::Record(recorder) => recorder.clone().handle(req).await,
            Engine::Replay(replayer) => replayer.clone().handle(req).await,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Engine::Record(_) => "record",
            Engine::Replay(_) => "replay",
        }
    }
}

/// Binds the endpoint's listening port on the loopback interface.
pub fn bind(endpoint: &Endpoint) -> anyhow::Result<std::net::TcpListener> {
    let addr = endpoint.listen_addr();
    let listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("failed to listen on {}", addr))?;
    listener
        .set_nonblocking(true)
        .with_context(|| format!("failed to configure listener on {}", addr))?;
    Ok(listener)
}

/// Serves `engine` on `listener` until Ctrl+C.
pub async fn serve(listener: std::net::TcpListener, engine: Engine) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let mode = engine.mode();
    let make_svc = make_service_fn(move |_| {
        let engine = engine.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let engine = engine.clone();
                async move { Ok::<_, Infallible>(engine.handle(req).await) }
            }))
        }
    });

    let server = Server::from_tcp(listener)?.serve(make_svc);
    info!(%addr, mode, "listening");
    server
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    info!(%addr, "stopped");
    Ok(())
}
