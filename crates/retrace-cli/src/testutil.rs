//! Listeners and clients shared by the engine tests.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use retrace_core::{Layout, Redactor, Store};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::capture::EndpointContext;
use crate::config::EndpointConfig;
use crate::server::{self, Engine};

pub fn endpoint_config(target_port: u16) -> EndpointConfig {
    EndpointConfig {
        source_type: "http".into(),
        source_port: 0,
        target_type: "http".into(),
        target_host: "127.0.0.1".into(),
        target_port,
        health: None,
        redact_request_headers: Vec::new(),
        response_header_replacements: Vec::new(),
    }
}

pub fn context(config: EndpointConfig, dir: &Path, layout: Layout) -> EndpointContext {
    EndpointContext {
        endpoint: Arc::new(config.compile().unwrap()),
        store: Store::new(dir, layout),
        redactor: Arc::new(Redactor::default()),
    }
}

/// Serves `handler` on an ephemeral port until the test ends.
pub fn spawn_stub<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let make_svc = make_service_fn(move |_| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let fut = handler(req);
                async move { Ok::<_, Infallible>(fut.await) }
            }))
        }
    });
    let server = Server::from_tcp(listener).unwrap().serve(make_svc);
    tokio::spawn(server);
    addr
}

/// Runs a proxy engine on an ephemeral port.
pub fn spawn_engine(engine: Engine) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, engine));
    addr
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
