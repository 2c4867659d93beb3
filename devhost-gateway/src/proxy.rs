use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use devhost_core::DevhostError;
use devhost_core::target::Upstream;
use devhost_guard::classify_invalid_target;
use devhost_store::Resolved;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::BodyStream;
use crate::metrics::InFlightGuard;
use crate::server::Gateway;
use crate::ws;

/// Hop-by-hop headers stripped in both directions (RFC 7230 §6.1).
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by Connection are hop-by-hop too
    if let Some(tokens) = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    {
        for token in tokens.split(',') {
            let name = token.trim().to_ascii_lowercase();
            if !name.is_empty() {
                headers.remove(name.as_str());
            }
        }
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Split a `Host` header into `(route_name, base_domain)`: the leftmost
/// label is the name; a host without a dot is all name with an empty base.
pub(crate) fn parse_host(host: &str) -> (String, String) {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.split(':').next().unwrap_or(host)
    };
    let lowered = without_port.to_ascii_lowercase();
    match lowered.split_once('.') {
        Some((name, base)) => (name.to_string(), base.to_string()),
        None => (lowered, String::new()),
    }
}

/// WebSocket detection is by the `Upgrade: websocket` request header, not
/// by URL prefix.
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Wildcard handler: everything that is not a reserved endpoint lands here.
pub async fn handle(
    State(gw): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let started = Instant::now();
    let deadline = started + gw.settings.deadline();
    // The slot travels with the response body; it frees only once the
    // last chunk has been streamed back (or the request failed early).
    let slot = gw.metrics.in_flight_guard();

    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));
    let Some(host) = host else {
        gw.metrics.record_request(400, elapsed_ms(started));
        return json_response(
            400,
            json!({"error": "missing host header", "request_id": request_id}),
        );
    };

    let (name, _base) = parse_host(&host);

    let upstream = match gw.cache.lookup(&name) {
        None => {
            debug!(request_id = %request_id, route = %name, "Unknown route");
            gw.metrics.record_request(404, elapsed_ms(started));
            return json_response(404, json!({"error": "unknown route", "name": name}));
        }
        Some(Resolved::Invalid { raw, reason }) => {
            let code = classify_invalid_target(&raw).code();
            warn!(
                request_id = %request_id,
                route = %name,
                reason = code,
                detail = %gw.redactor.redact(&reason),
                "Route target rejected"
            );
            gw.metrics.record_ssrf_block(code);
            gw.metrics.record_request(403, elapsed_ms(started));
            return json_response(403, json!({"error": "blocked", "reason": code}));
        }
        Some(Resolved::Found(upstream)) => match gw.guard.check(&upstream).await {
            Ok(()) => upstream,
            Err(block) => {
                let code = block.code();
                warn!(
                    request_id = %request_id,
                    route = %name,
                    upstream = %upstream.authority(),
                    reason = code,
                    "Upstream blocked"
                );
                gw.metrics.record_ssrf_block(code);
                gw.metrics.record_request(403, elapsed_ms(started));
                return json_response(403, json!({"error": "blocked", "reason": code}));
            }
        },
    };

    if is_websocket_upgrade(req.headers()) {
        return ws::relay(gw.clone(), upstream, req, request_id, peer, deadline).await;
    }

    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    match forward(&gw, &upstream, &host, req, &request_id, peer, deadline, slot).await {
        Ok(response) => {
            let status = response.status().as_u16();
            let latency = elapsed_ms(started);
            gw.metrics.record_request(status, latency);
            if gw.settings.log_requests {
                info!(
                    request_id = %request_id,
                    route = %name,
                    method = %method,
                    path = %gw.redactor.redact(&path),
                    status,
                    latency_ms = latency,
                    upstream = %upstream.authority(),
                    "Proxied"
                );
            }
            response
        }
        Err(err) => {
            let status = err.status_code();
            gw.metrics.record_request(status, elapsed_ms(started));
            warn!(
                request_id = %request_id,
                route = %name,
                method = %method,
                path = %gw.redactor.redact(&path),
                status,
                error = %gw.redactor.redact(&err.to_string()),
                "Proxy error"
            );
            json_response(
                status,
                json!({
                    "error": err.to_string(),
                    "reason": err.reason(),
                    "request_id": request_id,
                }),
            )
        }
    }
}

/// Build and dispatch the upstream request, streaming both bodies.
#[allow(clippy::too_many_arguments)]
async fn forward(
    gw: &Gateway,
    upstream: &Upstream,
    original_host: &str,
    req: Request,
    request_id: &str,
    peer: SocketAddr,
    deadline: Instant,
    slot: InFlightGuard,
) -> Result<Response, DevhostError> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", upstream.url(), path_and_query);

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    // The client sets the upstream Host from the URL authority
    headers.remove(http::header::HOST);

    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {}", peer.ip()),
        None => peer.ip().to_string(),
    };
    insert_header(&mut headers, "x-forwarded-for", &forwarded_for);
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    insert_header(&mut headers, "x-forwarded-host", original_host);
    insert_header(&mut headers, "x-request-id", request_id);

    let builder = gw.client.request(parts.method, &url).headers(headers);
    let builder = if request_body_is_empty(&body) {
        // No body: the request stays cloneable, so it is retry-eligible
        builder
    } else {
        builder.body(reqwest::Body::wrap_stream(body.into_data_stream()))
    };
    let request = builder
        .build()
        .map_err(|e| DevhostError::Upstream(format!("request build: {e}")))?;

    let dispatched = gw
        .client
        .dispatch(request, deadline)
        .await
        .map_err(DevhostError::from)?;

    let status = dispatched.response.status();
    let mut resp_headers = dispatched.response.headers().clone();
    strip_hop_by_hop(&mut resp_headers);
    for (name, value) in &gw.security_headers {
        resp_headers.insert(name.clone(), value.clone());
    }
    insert_header(&mut resp_headers, "x-request-id", request_id);

    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = resp_headers;
    }
    let body = Body::from_stream(TrackedStream {
        inner: dispatched.into_body_stream(),
        _slot: slot,
    });
    builder
        .body(body)
        .map_err(|e| DevhostError::Upstream(format!("response build: {e}")))
}

/// Response body stream that keeps its in-flight slot until dropped.
struct TrackedStream {
    inner: BodyStream,
    _slot: InFlightGuard,
}

impl futures_util::Stream for TrackedStream {
    type Item = reqwest::Result<bytes::Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

fn request_body_is_empty(body: &Body) -> bool {
    http_body::Body::size_hint(body).exact() == Some(0)
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

pub(crate) fn json_response(status: u16, body: serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response")
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
