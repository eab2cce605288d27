//! WebSocket upgrades: relayed and transcribed in record mode, played back
//! from the transcript in replay mode.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use hyper::{Body, Request, Response, StatusCode};
use retrace_core::{parse_transcript, Direction, Redactor, TranscriptEntry, HEAD_SHA};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::{HeaderName as WsHeaderName, HeaderValue as WsHeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::capture::EndpointContext;
use crate::error::ProxyError;
use crate::record::Recorder;
use crate::replay::Replayer;

/// Close reason sent when a client frame differs from the transcript.
pub const MISMATCH_REASON: &str = "input chunk mismatch";

/// How long the second direction of a relay may take to close.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Handshake headers the upstream dial negotiates on its own.
const DIAL_SKIPPED_HEADERS: [&str; 6] = [
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn is_upgrade(req: &Request<Body>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Transcript stem for an upgrade request: its test name, or the hash of
/// the unchained request minus its random handshake key.
fn transcript_name(
    ctx: &EndpointContext,
    req: Request<Body>,
) -> Result<(Request<Body>, String), ProxyError> {
    let (parts, body) = req.into_parts();
    let mut recorded = ctx.canonicalize(&parts, &[]);
    recorded.redact_header_names(&["Sec-WebSocket-Key"]);
    recorded.previous_request = HEAD_SHA.to_string();
    let name = recorded.recording_file_name(ctx.format())?;
    Ok((Request::from_parts(parts, body), name))
}

/// `101 Switching Protocols` answering `req`.
fn accept(req: &Request<Body>, protocol: Option<&[u8]>) -> Result<Response<Body>, ProxyError> {
    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| ProxyError::Upgrade("missing Sec-WebSocket-Key".into()))?;
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()));
    if let Some(protocol) = protocol {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    Ok(builder.body(Body::empty())?)
}

async fn dial(
    ctx: &EndpointContext,
    req: &Request<Body>,
) -> Result<(UpstreamSocket, Option<Vec<u8>>), ProxyError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = ctx.endpoint.websocket_url(path);
    let mut upstream_req = url
        .as_str()
        .into_client_request()
        .map_err(ProxyError::UpstreamWebSocket)?;
    for (name, value) in req.headers() {
        if DIAL_SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        // The tungstenite request uses its own http crate version.
        let (Ok(name), Ok(value)) = (
            WsHeaderName::from_bytes(name.as_str().as_bytes()),
            WsHeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        upstream_req.headers_mut().append(name, value);
    }

    let (socket, response) = connect_async(upstream_req)
        .await
        .map_err(ProxyError::UpstreamWebSocket)?;
    let protocol = response
        .headers()
        .get("sec-websocket-protocol")
        .map(|v| v.as_bytes().to_vec());
    debug!(%url, "upstream websocket connected");
    Ok((socket, protocol))
}

/// Record mode: dial the target, upgrade the client, then relay both ways
/// while writing every data frame to the transcript.
pub async fn record(recorder: Arc<Recorder>, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
    let ctx = &recorder.ctx;
    let (mut req, name) = transcript_name(ctx, req)?;
    let (upstream, protocol) = dial(ctx, &req).await?;
    let (path, file) = ctx.store.create_transcript(&name)?;
    let response = accept(&req, protocol.as_deref())?;

    let on_upgrade = hyper::upgrade::on(&mut req);
    let redactor = ctx.redactor.clone();
    let endpoint = ctx.endpoint.name();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(%endpoint, error = %e, "client upgrade failed");
                return;
            }
        };
        let client = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
        let transcript = tokio::fs::File::from_std(file);
        match relay(client, upstream, transcript, redactor).await {
            Ok(frames) => info!(%endpoint, frames, file = %path.display(), "websocket recorded"),
            Err(e) => warn!(%endpoint, error = %e, file = %path.display(), "websocket transcript failed"),
        }
    });
    Ok(response)
}

/// Pumps both directions until each has seen its close, returning the
/// number of transcript entries written.
///
/// Once one direction ends, the other gets [`CLOSE_GRACE`] to finish the
/// closing handshake before it is cancelled.
pub(crate) async fn relay<C, U>(
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    mut transcript: tokio::fs::File,
    redactor: Arc<Redactor>,
) -> std::io::Result<usize>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_tx, client_rx) = client.split();
    let (upstream_tx, upstream_rx) = upstream.split();
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<TranscriptEntry>();

    let writer = tokio::spawn(async move {
        let mut written = 0;
        while let Some(entry) = log_rx.recv().await {
            transcript.write_all(&entry.encode()).await?;
            written += 1;
        }
        transcript.flush().await?;
        Ok::<_, std::io::Error>(written)
    });

    let mut inbound = tokio::spawn(pump(
        client_rx,
        upstream_tx,
        Direction::Inbound,
        log_tx.clone(),
        redactor.clone(),
    ));
    let mut outbound = tokio::spawn(pump(
        upstream_rx,
        client_tx,
        Direction::Outbound,
        log_tx,
        redactor,
    ));

    let (finished, result) = tokio::select! {
        result = &mut inbound => (Direction::Inbound, result),
        result = &mut outbound => (Direction::Outbound, result),
    };
    report_pump(finished, result);

    let (direction, mut remaining) = match finished {
        Direction::Inbound => (Direction::Outbound, outbound),
        Direction::Outbound => (Direction::Inbound, inbound),
    };
    let result = match tokio::time::timeout(CLOSE_GRACE, &mut remaining).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%direction, "peer did not close in time, dropping connection");
            remaining.abort();
            remaining.await
        }
    };
    report_pump(direction, result);

    match writer.await {
        Ok(written) => written,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

fn report_pump(direction: Direction, result: Result<Result<(), WsError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%direction, error = %e, "websocket pump stopped"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!(%direction, error = %e, "websocket pump panicked"),
    }
}

/// Forwards `source` into `sink`, logging each data frame before it is
/// forwarded. A close frame is passed on and ends the pump; so does an
/// error on either side. The sink is closed in every case so the peer
/// learns the relay is over.
async fn pump<S, K>(
    mut source: S,
    mut sink: K,
    direction: Direction,
    log: mpsc::UnboundedSender<TranscriptEntry>,
    redactor: Arc<Redactor>,
) -> Result<(), WsError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    let result = loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        };
        if matches!(message, Message::Close(_)) {
            if let Err(e) = sink.send(message).await {
                debug!(%direction, error = %e, "close frame not forwarded");
            }
            break Ok(());
        }
        let payload = match &message {
            Message::Text(text) => Some(redactor.redact_str(text.as_str()).into_owned().into_bytes()),
            Message::Binary(data) => redactor.redact_bytes(Some(data.as_ref())).map(Cow::into_owned),
            _ => None,
        };
        if let Some(payload) = payload {
            if log.send(TranscriptEntry::new(direction, payload)).is_err() {
                debug!(%direction, "transcript writer gone, frame not logged");
            }
        }
        if let Err(e) = sink.send(message).await {
            break Err(e);
        }
    };
    if let Err(e) = sink.close().await {
        debug!(%direction, error = %e, "sink already closed");
    }
    result
}

/// Replay mode: upgrade the client and walk the transcript.
pub async fn replay(replayer: Arc<Replayer>, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
    let ctx = &replayer.ctx;
    let (mut req, name) = transcript_name(ctx, req)?;
    let entries = parse_transcript(&ctx.store.read_transcript(&name)?)?;

    let offered = req
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|p| p.trim().as_bytes().to_vec());
    let response = accept(&req, offered.as_deref())?;

    let on_upgrade = hyper::upgrade::on(&mut req);
    let redactor = ctx.redactor.clone();
    let endpoint = ctx.endpoint.name();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(%endpoint, error = %e, "client upgrade failed");
                return;
            }
        };
        let socket = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
        match play(socket, &entries, &redactor).await {
            Ok(Playback::Completed) => info!(%endpoint, %name, "websocket replayed"),
            Ok(Playback::Mismatch { position }) => {
                warn!(%endpoint, %name, position, "websocket input mismatch")
            }
            Ok(Playback::ClientClosed { position }) => {
                warn!(%endpoint, %name, position, "client closed before transcript ended")
            }
            Err(e) => warn!(%endpoint, %name, error = %e, "websocket replay aborted"),
        }
    });
    Ok(response)
}

/// How a transcript replay ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Playback {
    Completed,
    Mismatch { position: usize },
    ClientClosed { position: usize },
}

/// Plays `entries` against a client: inbound entries must arrive from the
/// client as recorded, outbound entries are sent as binary frames.
pub(crate) async fn play<S>(
    mut socket: WebSocketStream<S>,
    entries: &[TranscriptEntry],
    redactor: &Redactor,
) -> Result<Playback, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for (position, entry) in entries.iter().enumerate() {
        match entry.direction {
            Direction::Inbound => {
                let Some(received) = next_payload(&mut socket).await? else {
                    return Ok(Playback::ClientClosed { position });
                };
                let received = redactor
                    .redact_bytes(Some(received.as_slice()))
                    .map(Cow::into_owned)
                    .unwrap_or_default();
                if received != entry.payload {
                    debug!(
                        position,
                        received = %String::from_utf8_lossy(&received),
                        recorded = %String::from_utf8_lossy(&entry.payload),
                        "inbound frame differs"
                    );
                    socket
                        .close(Some(CloseFrame {
                            code: CloseCode::Error,
                            reason: MISMATCH_REASON.into(),
                        }))
                        .await?;
                    return Ok(Playback::Mismatch { position });
                }
            }
            Direction::Outbound => {
                socket
                    .send(Message::Binary(entry.payload.clone().into()))
                    .await?;
            }
        }
    }
    socket.close(None).await?;
    Ok(Playback::Completed)
}

/// Next data frame from the client; `None` once it closes.
async fn next_payload<S>(socket: &mut WebSocketStream<S>) -> Result<Option<Vec<u8>>, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(text.as_str().as_bytes().to_vec())),
            Message::Binary(data) => return Ok(Some(data.to_vec())),
            Message::Close(_) => return Ok(None),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(None)
}
