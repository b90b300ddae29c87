//! Reverse proxy to the dev server.
//!
//! Installed as the router fallback: anything the API routes did not
//! claim is forwarded to the dev server's loopback origin, provided the
//! path is not reserved and the request is a GET, HEAD or WebSocket
//! upgrade.  Everything else gets a plain 404.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct DevServerProxy {
    /// `http://host:port`
    origin: String,
    /// `ws://host:port`
    ws_origin: String,
    reserved_prefixes: Vec<String>,
    client: reqwest::Client,
}

impl DevServerProxy {
    pub fn new(host: &str, port: u16, reserved_prefixes: Vec<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            origin: format!("http://{host}:{port}"),
            ws_origin: format!("ws://{host}:{port}"),
            reserved_prefixes,
            client,
        })
    }

    pub fn is_reserved(&self, path: &str) -> bool {
        self.reserved_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    async fn forward_http(&self, req: Request) -> Response {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{path}", self.origin);

        let mut upstream = self.client.request(req.method().clone(), &url);
        for (name, value) in req.headers() {
            if name == header::HOST || is_hop_by_hop(name) {
                continue;
            }
            upstream = upstream.header(name, value);
        }

        let resp = match upstream.send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(url = %url, error = %e, "dev server request failed");
                return proxy_error();
            }
        };

        let mut builder = Response::builder().status(resp.status());
        if let Some(headers) = builder.headers_mut() {
            copy_end_to_end(resp.headers(), headers);
        }
        builder
            .body(Body::from_stream(resp.bytes_stream()))
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build proxied response");
                proxy_error()
            })
    }

    async fn forward_websocket(&self, ws: WebSocketUpgrade, parts: &Parts) -> Response {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{path}", self.ws_origin);

        let mut request = match url.as_str().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %url, error = %e, "invalid upstream websocket url");
                return proxy_error();
            }
        };
        if let Some(protocols) = parts.headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
            request
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
        }

        let (upstream, response) = match tokio_tungstenite::connect_async(request).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(url = %url, error = %e, "dev server websocket connect failed");
                return proxy_error();
            }
        };

        let selected = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let ws = match selected {
            Some(protocol) => ws.protocols([protocol]),
            None => ws,
        };
        ws.on_upgrade(move |socket| pump(socket, upstream))
    }
}

/// Router fallback.
pub async fn proxy_fallback(State(proxy): State<Arc<DevServerProxy>>, req: Request) -> Response {
    let method = req.method();
    if proxy.is_reserved(req.uri().path()) || (method != Method::GET && method != Method::HEAD) {
        return StatusCode::NOT_FOUND.into_response();
    }

    if is_websocket_upgrade(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };
        return proxy.forward_websocket(ws, &parts).await;
    }

    proxy.forward_http(req).await
}

fn proxy_error() -> Response {
    (StatusCode::BAD_GATEWAY, "Proxy Error").into_response()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn copy_end_to_end(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !is_hop_by_hop(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

/// Shuttle frames both ways until either side closes or errors, then
/// close both.
async fn pump(client: WebSocket, upstream: Upstream) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, Message::Close(_));
            if let Some(msg) = to_upstream(msg) {
                if upstream_tx.send(msg).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let closing = matches!(msg, UpstreamMessage::Close(_));
            if let Some(msg) = to_client(msg) {
                if client_tx.send(msg).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => debug!("client websocket closed"),
        _ = upstream_to_client => debug!("dev server websocket closed"),
    }

    let _ = upstream_tx.close().await;
    let _ = client_tx.close().await;
}

/// Ping/pong stay local to each connection.
fn to_upstream(msg: Message) -> Option<UpstreamMessage> {
    match msg {
        Message::Text(t) => Some(UpstreamMessage::Text(t)),
        Message::Binary(b) => Some(UpstreamMessage::Binary(b)),
        Message::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_client(msg: UpstreamMessage) -> Option<Message> {
    match msg {
        UpstreamMessage::Text(t) => Some(Message::Text(t)),
        UpstreamMessage::Binary(b) => Some(Message::Binary(b)),
        UpstreamMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason,
        }))),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}
