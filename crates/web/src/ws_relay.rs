//! WebSocket relay
//!
//! Admission runs before any upstream I/O: token, then identity, then the
//! instance. A rejected session is still upgraded so the browser receives a
//! close code it can act on; it is closed straight away and never dialled
//! through. An admitted session is bridged frame-for-frame to the
//! container.

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    http::{HeaderMap, Uri},
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header::ORIGIN, HeaderValue},
};
use tracing::{debug, info, trace, warn};

use crate::auth::credentials::{self, CredentialContext, WS_CHAIN};
use crate::error::{ProxyError, CLOSE_CANNOT_RELAY, CLOSE_MISSING_TOKEN};
use crate::http_relay::{upstream_path, upstream_url};
use crate::server::AppState;

/// Outcome of the pre-accept checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted { port: u16 },
    Rejected { code: u16, reason: String },
}

impl Admission {
    fn rejected(err: &ProxyError) -> Self {
        Admission::Rejected {
            code: err.close_code(),
            reason: err.public_message(),
        }
    }
}

/// Run the credential chain and the access gate for a handshake.
pub async fn admit(state: &AppState, instance_id: &str, headers: &HeaderMap, query: Option<&str>) -> Admission {
    let ctx = CredentialContext {
        instance_id,
        headers,
        query,
    };
    let Some(credential) = credentials::resolve(WS_CHAIN, &ctx) else {
        return Admission::Rejected {
            code: CLOSE_MISSING_TOKEN,
            reason: "Missing token".to_string(),
        };
    };

    let principal = match state.gate.authenticate(&credential.token).await {
        Ok(principal) => principal,
        Err(e) => {
            return Admission::Rejected {
                code: ProxyError::from(e).close_code(),
                reason: "Unauthorized".to_string(),
            }
        }
    };

    match state.gate.resolve_port(instance_id, &principal).await {
        Ok(port) => Admission::Granted { port },
        Err(e) => Admission::rejected(&ProxyError::from(e)),
    }
}

/// Upgrade handler for `/api/instances/{id}/ui/...`.
pub async fn handle(
    state: AppState,
    instance_id: String,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let admission = admit(&state, &instance_id, &headers, uri.query()).await;

    match admission {
        Admission::Rejected { code, reason } => {
            debug!(instance_id = %instance_id, code, "Rejecting WebSocket session: {}", reason);
            ws.on_upgrade(move |socket| reject(socket, code, reason))
        }
        Admission::Granted { port } => {
            let host = &state.config.upstream_host;
            let relay = WsRelay {
                instance_id,
                url: upstream_url("ws", host, port, upstream_path(uri.path()), uri.query()),
                origin: format!("http://{host}:{port}"),
                connect_timeout: state.config.upstream.connect_timeout(),
            };
            ws.on_upgrade(move |socket| relay.bridge(socket))
        }
    }
}

async fn reject(mut socket: WebSocket, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Client went away before the close frame: {}", e);
    }
}

/// One admitted session's upstream target.
pub struct WsRelay {
    instance_id: String,
    url: String,
    origin: String,
    connect_timeout: Duration,
}

impl WsRelay {
    /// Dial the container and relay until either side finishes.
    pub async fn bridge(self, socket: WebSocket) {
        let upstream = match self.connect().await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(instance_id = %self.instance_id, "WebSocket upstream unavailable: {}", e);
                reject(socket, CLOSE_CANNOT_RELAY, e.public_message()).await;
                return;
            }
        };
        info!(instance_id = %self.instance_id, "WebSocket session relaying");

        let (mut client_tx, mut client_rx) = socket.split();
        let (mut upstream_tx, mut upstream_rx) = upstream.split();

        // The losing direction is dropped here, before either socket closes.
        let (direction, result) = tokio::select! {
            r = pump(&mut client_rx, &mut upstream_tx) => ("client->upstream", r),
            r = pump(&mut upstream_rx, &mut client_tx) => ("upstream->client", r),
        };
        match result {
            Ok(()) => debug!(instance_id = %self.instance_id, direction, "WebSocket peer finished"),
            Err(e) => warn!(instance_id = %self.instance_id, direction, "WebSocket relay error: {}", e),
        }

        let _ = upstream_tx.close().await;
        let _ = client_tx.close().await;
        info!(instance_id = %self.instance_id, "WebSocket session closed");
    }

    async fn connect(
        &self,
    ) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, ProxyError>
    {
        let request = upstream_request(&self.url, &self.origin)?;
        let (stream, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)?
            .map_err(|e| match e {
                tungstenite::Error::Io(_) => ProxyError::UpstreamUnreachable,
                other => ProxyError::UpstreamProtocol(other.to_string()),
            })?;
        Ok(stream)
    }
}

/// Handshake request for the container with an explicit same-host `Origin`.
/// No extensions are offered, so frames are never compressed.
pub fn upstream_request(url: &str, origin: &str) -> Result<tungstenite::handshake::client::Request, ProxyError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ProxyError::UpstreamProtocol(format!("invalid upstream url: {e}")))?;
    let origin = HeaderValue::from_str(origin)
        .map_err(|e| ProxyError::UpstreamProtocol(format!("invalid origin: {e}")))?;
    request.headers_mut().insert(ORIGIN, origin);
    Ok(request)
}

/// A data frame as it crosses the relay. Control frames stay on their hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl RelayFrame {
    fn kind(&self) -> &'static str {
        match self {
            RelayFrame::Text(_) => "text",
            RelayFrame::Binary(_) => "binary",
        }
    }

    fn len(&self) -> usize {
        match self {
            RelayFrame::Text(text) => text.len(),
            RelayFrame::Binary(data) => data.len(),
        }
    }
}

/// What a received message means to the relay.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Data(RelayFrame),
    Control,
    Close,
}

/// Conversion between a socket library's message type and [`RelayFrame`].
pub trait WsFrame: Sized {
    fn inbound(self) -> Inbound;
    fn from_relay(frame: RelayFrame) -> Self;
}

impl WsFrame for Message {
    fn inbound(self) -> Inbound {
        match self {
            Message::Text(text) => Inbound::Data(RelayFrame::Text(text)),
            Message::Binary(data) => Inbound::Data(RelayFrame::Binary(data)),
            Message::Ping(_) | Message::Pong(_) => Inbound::Control,
            Message::Close(_) => Inbound::Close,
        }
    }

    fn from_relay(frame: RelayFrame) -> Self {
        match frame {
            RelayFrame::Text(text) => Message::Text(text),
            RelayFrame::Binary(data) => Message::Binary(data),
        }
    }
}

impl WsFrame for tungstenite::Message {
    fn inbound(self) -> Inbound {
        match self {
            tungstenite::Message::Text(text) => Inbound::Data(RelayFrame::Text(text)),
            tungstenite::Message::Binary(data) => Inbound::Data(RelayFrame::Binary(data)),
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => Inbound::Control,
            tungstenite::Message::Frame(_) => Inbound::Control,
            tungstenite::Message::Close(_) => Inbound::Close,
        }
    }

    fn from_relay(frame: RelayFrame) -> Self {
        match frame {
            RelayFrame::Text(text) => tungstenite::Message::Text(text),
            RelayFrame::Binary(data) => tungstenite::Message::Binary(data),
        }
    }
}

/// Forward data frames from `source` to `sink` in order until the source
/// closes or ends. Transport errors on either side end the pump with `Err`.
pub async fn pump<S, K, In, Out, ER, EW>(mut source: S, mut sink: K) -> anyhow::Result<()>
where
    S: Stream<Item = Result<In, ER>> + Unpin,
    K: Sink<Out, Error = EW> + Unpin,
    In: WsFrame,
    Out: WsFrame,
    ER: std::error::Error + Send + Sync + 'static,
    EW: std::error::Error + Send + Sync + 'static,
{
    while let Some(message) = source.next().await {
        match message?.inbound() {
            Inbound::Data(frame) => {
                trace!(kind = frame.kind(), len = frame.len(), "Relaying frame");
                sink.send(Out::from_relay(frame)).await?;
            }
            Inbound::Control => {}
            Inbound::Close => break,
        }
    }
    Ok(())
}
