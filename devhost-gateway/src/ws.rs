use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use devhost_core::target::Upstream;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, Role};
use tracing::{debug, warn};

use crate::proxy::{json_response, strip_hop_by_hop};
use crate::server::Gateway;

/// Headers owned by the WebSocket handshake itself; the upstream handshake
/// regenerates them, and extension negotiation is never relayed.
const HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-accept",
];

/// Wildcard WebSocket proxy: accept the client upgrade, open an upstream
/// socket to the resolved target, and relay frames both ways until either
/// side closes, the deadline fires, or the gateway drains.
pub async fn relay(
    gw: Arc<Gateway>,
    upstream: Upstream,
    mut req: Request,
    request_id: String,
    peer: SocketAddr,
    deadline: Instant,
) -> Response {
    let Some(key) = req.headers().get("sec-websocket-key").cloned() else {
        return json_response(
            400,
            json!({"error": "missing sec-websocket-key", "request_id": request_id}),
        );
    };
    let accept = derive_accept_key(key.as_bytes());

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        return json_response(
            400,
            json!({"error": "connection is not upgradeable", "request_id": request_id}),
        );
    };

    // Upstream handshake request: original path/query/subprotocols, minus
    // handshake-owned and hop-by-hop headers.
    let scheme = if upstream.is_tls() { "wss" } else { "ws" };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{scheme}://{}{}", upstream.authority(), path_and_query);

    let mut ws_req = match url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            return json_response(
                502,
                json!({"error": format!("upstream url: {e}"), "reason": "upstream", "request_id": request_id}),
            );
        }
    };
    let mut carried = req.headers().clone();
    strip_hop_by_hop(&mut carried);
    for name in HANDSHAKE_HEADERS {
        carried.remove(*name);
    }
    if let Ok(v) = http::HeaderValue::from_str(&peer.ip().to_string()) {
        carried.insert("x-forwarded-for", v);
    }
    if let Ok(v) = http::HeaderValue::from_str(&request_id) {
        carried.insert("x-request-id", v);
    }
    ws_req.headers_mut().extend(carried);

    let (upstream_ws, upstream_resp) = match tokio_tungstenite::connect_async(ws_req).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(request_id = %request_id, upstream = %upstream.authority(), error = %e, "Upstream WebSocket failed");
            gw.metrics.record_request(502, 0.0);
            return json_response(
                502,
                json!({"error": "upstream websocket failed", "reason": "upstream", "request_id": request_id}),
            );
        }
    };
    let subprotocol = upstream_resp.headers().get("sec-websocket-protocol").cloned();

    let task_gw = gw.clone();
    let task_id = request_id.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let client_ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                let _ws = task_gw.metrics.ws_guard();
                let shutdown = task_gw.shutdown.subscribe();
                pump(client_ws, upstream_ws, deadline, shutdown).await;
                debug!(request_id = %task_id, "WebSocket relay finished");
            }
            Err(e) => {
                warn!(request_id = %task_id, error = %e, "Client upgrade failed");
            }
        }
    });

    gw.metrics.record_request(101, 0.0);
    let mut builder = Response::builder()
        .status(http::StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::UPGRADE, "websocket")
        .header(http::header::CONNECTION, "Upgrade")
        .header("sec-websocket-accept", accept);
    if let Some(proto) = subprotocol {
        builder = builder.header("sec-websocket-protocol", proto);
    }
    builder.body(Body::empty()).expect("static response")
}

fn going_away() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "".into(),
    }))
}

/// Two concurrent forwarders collapsed into one select loop: frame order
/// is preserved per direction, and either side's close or error (or the
/// deadline / drain signal) terminates both.
async fn pump<C, U>(
    client_ws: WebSocketStream<C>,
    upstream_ws: WebSocketStream<U>,
    deadline: Instant,
    mut shutdown: broadcast::Receiver<()>,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client_ws.split();
    let (mut upstream_tx, mut upstream_rx) = upstream_ws.split();
    let expiry = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            frame = client_rx.next() => match frame {
                Some(Ok(msg)) => {
                    let closing = matches!(msg, Message::Close(_));
                    if upstream_tx.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                _ => {
                    let _ = upstream_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = upstream_rx.next() => match frame {
                Some(Ok(msg)) => {
                    let closing = matches!(msg, Message::Close(_));
                    if client_tx.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                _ => {
                    let _ = client_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = &mut expiry => {
                let _ = client_tx.send(going_away()).await;
                let _ = upstream_tx.send(going_away()).await;
                break;
            }
            _ = shutdown.recv() => {
                let _ = client_tx.send(going_away()).await;
                let _ = upstream_tx.send(going_away()).await;
                break;
            }
        }
    }

    let _ = client_tx.close().await;
    let _ = upstream_tx.close().await;
}
