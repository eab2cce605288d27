use hyper::header::HeaderName;
use hyper::http::request::Parts;
use hyper::{Body, Request, Response};
use retrace_core::request::collect_headers;
use retrace_core::response::is_gzip;
use retrace_core::{ChainState, RecordedRequest, RecordedResponse, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::capture::{path_and_query, EndpointContext};
use crate::error::ProxyError;
use crate::websocket;

/// Request headers not copied onto the upstream request.
const HOP_REQUEST_HEADERS: [&str; 3] = ["host", "connection", "transfer-encoding"];
/// Upstream response headers not relayed to the client.
const HOP_RESPONSE_HEADERS: [&str; 2] = ["transfer-encoding", "connection"];

/// Forwards requests to the real target and writes every exchange to the
/// recording directory.
pub struct Recorder {
    pub(crate) ctx: EndpointContext,
    client: reqwest::Client,
    chain: Mutex<ChainState>,
    /// One lock per test name, held from link to advance.
    sequences: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Recorder {
    pub fn new(ctx: EndpointContext) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            ctx,
            client,
            chain: Mutex::new(ChainState::new()),
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// Serializes the requests of one sequence; unnamed requests run freely.
    async fn lock_sequence(
        &self,
        recorded: &RecordedRequest,
    ) -> Result<Option<OwnedMutexGuard<()>>, StoreError> {
        let Some(name) = recorded.test_name()? else {
            return Ok(None);
        };
        let lock = self.sequences.lock().await.entry(name).or_default().clone();
        Ok(Some(lock.lock_owned().await))
    }

    pub async fn handle(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let result = if websocket::is_upgrade(&req) {
            websocket::record(self.clone(), req).await
        } else {
            self.record_http(req).await
        };
        result.unwrap_or_else(|e| {
            warn!(endpoint = %self.ctx.endpoint.name(), %method, %uri, error = %e, "record failed");
            e.into_response()
        })
    }

    async fn record_http(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let format = self.ctx.format();
        let (parts, body, mut recorded) = self.ctx.capture(req).await?;
        let _sequence = self.lock_sequence(&recorded).await?;
        let resolved = self.chain.lock().await.link(&mut recorded, format)?;
        debug!(hash = %resolved.hash, file = %resolved.file_name, "request linked");

        let upstream = self.forward(&parts, body.to_vec()).await?;
        let status = upstream.status();
        let mut headers = collect_headers(
            upstream
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_bytes())),
        );
        let raw = upstream.bytes().await.map_err(ProxyError::UpstreamBody)?;

        for replacement in &self.ctx.endpoint.replacements {
            replacement.apply(&mut headers);
        }

        let mut response = match RecordedResponse::from_upstream(status.as_u16(), headers.clone(), &raw) {
            Ok(response) => response,
            Err(StoreError::Gzip(e)) => {
                warn!(hash = %resolved.hash, error = %e, "gzip body did not decode, keeping raw bytes");
                RecordedResponse::undecoded(status.as_u16(), headers.clone(), &raw)
            }
            Err(e) => return Err(e.into()),
        };
        response.redact(&self.ctx.redactor);

        let gzip = if is_gzip(&headers) { Some(raw.as_ref()) } else { None };
        let path = self.ctx.store.save_interaction(
            &resolved,
            &recorded,
            &response,
            status.canonical_reason().unwrap_or(""),
            gzip,
        )?;
        self.chain.lock().await.advance(&resolved);

        info!(
            endpoint = %self.ctx.endpoint.name(),
            request = %recorded.request,
            status = status.as_u16(),
            hash = %resolved.hash,
            file = %path.display(),
            "recorded"
        );

        let mut builder = Response::builder().status(status);
        for (name, values) in &headers {
            let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            if HOP_RESPONSE_HEADERS.contains(&header.as_str()) {
                continue;
            }
            for value in values {
                builder = builder.header(header.clone(), value.as_str());
            }
        }
        Ok(builder.body(Body::from(raw))?)
    }

    /// Sends the original, unredacted request to the target.
    async fn forward(&self, parts: &Parts, body: Vec<u8>) -> Result<reqwest::Response, ProxyError> {
        let url = format!(
            "{}{}",
            self.ctx.endpoint.target_base_url(),
            path_and_query(parts)
        );
        let mut builder = self.client.request(parts.method.clone(), &url);
        for (name, value) in parts.headers.iter() {
            if HOP_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name.clone(), value.clone());
        }
        builder
            .body(body)
            .send()
            .await
            .map_err(ProxyError::Upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Engine;
    use crate::testutil;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use retrace_core::{Body as RecordedBody, Layout, RecordFile, Store, HEAD_SHA};
    use serde_json::json;
    use std::io::Write;

    fn recorder(target_port: u16, dir: &std::path::Path, layout: Layout) -> Arc<Recorder> {
        let mut config = testutil::endpoint_config(target_port);
        config.response_header_replacements = vec![crate::config::ReplacementConfig {
            header: "Date".into(),
            regex: ".*".into(),
            replace: "REPLACED".into(),
        }];
        Arc::new(Recorder::new(testutil::context(config, dir, layout)).unwrap())
    }

    #[tokio::test]
    async fn records_get_in_per_hash_layout() {
        let upstream = testutil::spawn_stub(|_req| async {
            Response::builder()
                .status(200)
                .header("X-Test", "1")
                .body(Body::empty())
                .unwrap()
        });
        let dir = tempfile::tempdir().unwrap();
        let proxy = testutil::spawn_engine(Engine::Record(recorder(
            upstream.port(),
            dir.path(),
            Layout::PerHash,
        )));

        let resp = testutil::client()
            .get(format!("http://{}/", proxy))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["x-test"], "1");

        let store = Store::new(dir.path(), Layout::PerHash);
        let mut reqs = Vec::new();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().map(|e| e == "req").unwrap_or(false) {
                reqs.push(path);
            }
        }
        assert_eq!(reqs.len(), 1);
        let text = std::fs::read_to_string(&reqs[0]).unwrap();
        assert_eq!(text.lines().next(), Some(HEAD_SHA));

        let hash = reqs[0].file_stem().unwrap().to_string_lossy().into_owned();
        let dump = std::fs::read(store.response_path(&hash)).unwrap();
        let response = RecordedResponse::from_dump(&dump).unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.headers["X-Test"], vec!["1"]);
        assert_eq!(response.headers["Date"], vec!["REPLACED"]);
    }

    #[tokio::test]
    async fn records_sequence_into_one_file() {
        let upstream = testutil::spawn_stub(|req: Request<Body>| async move {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
            Response::builder()
                .status(201)
                .header("Content-Type", "application/json")
                .body(Body::from(format!(r#"{{"echo":{}}}"#, String::from_utf8_lossy(&body))))
                .unwrap()
        });
        let dir = tempfile::tempdir().unwrap();
        let proxy = testutil::spawn_engine(Engine::Record(recorder(
            upstream.port(),
            dir.path(),
            Layout::Grouped,
        )));

        let client = testutil::client();
        for n in 0..2 {
            let resp = client
                .post(format!("http://{}/items?x=1", proxy))
                .header("Test-Name", "seq test")
                .header("Content-Type", "application/json")
                .body(r#"{"n":0}"#)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 201, "request {}", n);
            assert_eq!(resp.text().await.unwrap(), r#"{"echo":{"n":0}}"#);
        }

        let file = RecordFile::open(dir.path().join("seq_test.json")).unwrap();
        assert_eq!(file.record_id, "seq_test");
        assert_eq!(file.len(), 2);
        let first = &file.interactions[0];
        let second = &file.interactions[1];
        assert_ne!(first.sha_sum, second.sha_sum);
        assert_eq!(first.request.as_ref().unwrap().previous_request, HEAD_SHA);
        assert_eq!(
            second.request.as_ref().unwrap().previous_request,
            first.sha_sum
        );
        assert_eq!(
            first.response.as_ref().unwrap().body,
            RecordedBody::Segments(vec![json!({"echo": {"n": 0}})])
        );
        assert_eq!(first.request.as_ref().unwrap().url, "/items?x=1");
    }

    #[tokio::test]
    async fn concurrent_requests_in_one_sequence_chain_in_turn() {
        let upstream = testutil::spawn_stub(|_req| async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Response::new(Body::from(r#"{"ok":true}"#))
        });
        let dir = tempfile::tempdir().unwrap();
        let proxy = testutil::spawn_engine(Engine::Record(recorder(
            upstream.port(),
            dir.path(),
            Layout::Grouped,
        )));

        let client = testutil::client();
        let send = || {
            client
                .get(format!("http://{}/poll", proxy))
                .header("Test-Name", "race")
                .send()
        };
        let (a, b) = tokio::join!(send(), send());
        assert_eq!(a.unwrap().status(), 200);
        assert_eq!(b.unwrap().status(), 200);

        let file = RecordFile::open(dir.path().join("race.json")).unwrap();
        assert_eq!(file.len(), 2);
        let first = &file.interactions[0];
        let second = &file.interactions[1];
        assert_ne!(first.sha_sum, second.sha_sum);
        assert_eq!(first.request.as_ref().unwrap().previous_request, HEAD_SHA);
        assert_eq!(
            second.request.as_ref().unwrap().previous_request,
            first.sha_sum
        );
    }

    #[tokio::test]
    async fn gzip_is_decoded_on_disk_but_relayed_compressed() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(br#"{"zipped":true}"#).unwrap();
        let compressed = enc.finish().unwrap();
        let served = compressed.clone();
        let upstream = testutil::spawn_stub(move |_req| {
            let served = served.clone();
            async move {
                Response::builder()
                    .status(200)
                    .header("Content-Encoding", "gzip")
                    .header("Content-Type", "application/json")
                    .body(Body::from(served))
                    .unwrap()
            }
        });
        let dir = tempfile::tempdir().unwrap();
        let proxy = testutil::spawn_engine(Engine::Record(recorder(
            upstream.port(),
            dir.path(),
            Layout::Grouped,
        )));

        let resp = testutil::client()
            .get(format!("http://{}/zip", proxy))
            .header("Test-Name", "zip")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.headers()["content-encoding"], "gzip");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), compressed.as_slice());

        let file = RecordFile::open(dir.path().join("zip.json")).unwrap();
        assert_eq!(
            file.interactions[0].response.as_ref().unwrap().body,
            RecordedBody::Segments(vec![json!({"zipped": true})])
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let dir = tempfile::tempdir().unwrap();
        let proxy = testutil::spawn_engine(Engine::Record(recorder(port, dir.path(), Layout::Grouped)));
        let resp = testutil::client()
            .get(format!("http://{}/", proxy))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        assert!(resp.text().await.unwrap().contains("upstream request failed"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn traversal_test_name_is_rejected() {
        let upstream = testutil::spawn_stub(|_req| async { Response::new(Body::empty()) });
        let dir = tempfile::tempdir().unwrap();
        let proxy = testutil::spawn_engine(Engine::Record(recorder(
            upstream.port(),
            dir.path(),
            Layout::Grouped,
        )));
        let resp = testutil::client()
            .get(format!("http://{}/", proxy))
            .header("Test-Name", "../escape")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
