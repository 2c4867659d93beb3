//! End-to-end tests: a real gateway listener in front of real upstreams.

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::response::IntoResponse;
use devhost_core::Settings;
use devhost_gateway::server::{self, Gateway};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

/// Serve an axum app on an ephemeral port.
async fn spawn_app(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Start a gateway whose route file lives in `dir` and contains `routes`.
async fn spawn_gateway(dir: &TempDir, routes: &str, tweak: impl FnOnce(&mut Settings)) -> (SocketAddr, Arc<Gateway>) {
    let route_file = dir.path().join("devhost.json");
    std::fs::write(&route_file, routes).unwrap();

    let mut settings = Settings::default();
    settings.state_dir = dir.path().to_path_buf();
    tweak(&mut settings);

    let gw = Gateway::new(settings).unwrap();
    gw.mark_running();
    let addr = spawn_app(server::router(gw.clone())).await;
    (addr, gw)
}

/// A client whose DNS pins `<name>.localhost` to the gateway address.
fn client_for(host: &str, gateway: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .resolve(host, gateway)
        .build()
        .unwrap()
}

// ── Scenario: add & resolve ──────────────────────────────────────

#[tokio::test]
async fn add_and_resolve() {
    let upstream = spawn_app(Router::new().fallback(|| async { "hello" })).await;

    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) = spawn_gateway(
        &dir,
        &format!(r#"{{"api": {}}}"#, upstream.port()),
        |_| {},
    )
    .await;

    let client = client_for("api.localhost", gw_addr);
    let resp = client
        .get(format!("http://api.localhost:{}/ping", gw_addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-request-id"));
    assert_eq!(resp.text().await.unwrap(), "hello");

    let metrics: serde_json::Value = reqwest::get(format!("http://{gw_addr}/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(metrics["requests"]["total"].as_u64().unwrap() >= 1);
    assert_eq!(metrics["requests"]["errors"].as_u64().unwrap(), 0);
}

// ── Scenario: unknown route ──────────────────────────────────────

#[tokio::test]
async fn unknown_route_is_404_with_name() {
    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) = spawn_gateway(&dir, "{}", |_| {}).await;

    let client = client_for("nope.localhost", gw_addr);
    let resp = client
        .get(format!("http://nope.localhost:{}/", gw_addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unknown route");
    assert_eq!(body["name"], "nope");

    let metrics: serde_json::Value = reqwest::get(format!("http://{gw_addr}/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(metrics["requests"]["errors"].as_u64().unwrap() >= 1);
}

// ── Scenario: SSRF block ─────────────────────────────────────────

#[tokio::test]
async fn metadata_endpoint_is_blocked() {
    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) =
        spawn_gateway(&dir, r#"{"aws": "169.254.169.254:80"}"#, |_| {}).await;

    let client = client_for("aws.localhost", gw_addr);
    let resp = client
        .get(format!("http://aws.localhost:{}/", gw_addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "blocked");
    assert_eq!(body["reason"], "metadata_endpoint");

    let metrics: serde_json::Value = reqwest::get(format!("http://{gw_addr}/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(metrics["ssrf_blocks"]["metadata_endpoint"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn private_override_does_not_unlock_metadata() {
    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) = spawn_gateway(&dir, r#"{"aws": "169.254.169.254:80"}"#, |s| {
        s.allow_private_networks = true;
    })
    .await;

    let client = client_for("aws.localhost", gw_addr);
    let resp = client
        .get(format!("http://aws.localhost:{}/", gw_addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "metadata_endpoint");
}

#[tokio::test]
async fn non_http_scheme_in_route_file_is_blocked() {
    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) =
        spawn_gateway(&dir, r#"{"evil": "file:///etc/passwd"}"#, |_| {}).await;

    let client = client_for("evil.localhost", gw_addr);
    let resp = client
        .get(format!("http://evil.localhost:{}/", gw_addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "scheme");
}

// ── Scenario: WebSocket echo ─────────────────────────────────────

#[tokio::test]
async fn websocket_echo_round_trip() {
    // Frame-echoing upstream
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_port = ws_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (stream, _) = ws_listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                    if msg.is_text() || msg.is_binary() {
                        ws.send(msg).await.unwrap();
                    }
                }
            });
        }
    });

    let dir = TempDir::new().unwrap();
    let (gw_addr, gw) =
        spawn_gateway(&dir, &format!(r#"{{"ws": {ws_port}}}"#), |_| {}).await;

    // Dial the gateway over TCP; the URI supplies the routed Host header
    let tcp = TcpStream::connect(gw_addr).await.unwrap();
    let (mut ws, _resp) =
        tokio_tungstenite::client_async("ws://ws.localhost/anything", tcp)
            .await
            .unwrap();

    ws.send(Message::Text("abc".into())).await.unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Text("abc".into()));

    let snap = gw.metrics.snapshot();
    assert_eq!(snap.websockets.active, 1);

    ws.close(None).await.unwrap();
    // Give the relay a moment to observe the close
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let snap = gw.metrics.snapshot();
    assert_eq!(snap.websockets.active, 0);
    assert_eq!(snap.websockets.total, 1);
}

// ── Scenario: streamed upload ────────────────────────────────────

#[tokio::test]
async fn large_upload_streams_through() {
    // Upstream reports how many bytes it received
    let upstream = spawn_app(Router::new().fallback(|req: Request| async move {
        let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .unwrap();
        bytes.len().to_string().into_response()
    }))
    .await;

    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) = spawn_gateway(
        &dir,
        &format!(r#"{{"up": {}}}"#, upstream.port()),
        |_| {},
    )
    .await;

    // 8 MiB in 64 KiB chunks, never materialized as one buffer
    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 128;
    let stream = futures_util::stream::iter(
        (0..CHUNKS).map(|_| Ok::<_, std::io::Error>(bytes::Bytes::from(vec![0u8; CHUNK]))),
    );

    let client = client_for("up.localhost", gw_addr);
    let resp = client
        .post(format!("http://up.localhost:{}/ingest", gw_addr.port()))
        .body(reqwest::Body::wrap_stream(stream))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), (CHUNK * CHUNKS).to_string());
}

// ── Timeouts ─────────────────────────────────────────────────────

#[tokio::test]
async fn stalled_upstream_times_out_with_504() {
    // Accepts connections but never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                drop(stream);
            });
        }
    });

    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) = spawn_gateway(&dir, &format!(r#"{{"slow": {port}}}"#), |s| {
        s.timeout = 0.5;
    })
    .await;

    let client = client_for("slow.localhost", gw_addr);
    let resp = client
        .get(format!("http://slow.localhost:{}/", gw_addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "timeout");
    assert!(body["request_id"].is_string());
}

// ── Cache consistency ────────────────────────────────────────────

#[tokio::test]
async fn routes_view_follows_file_rewrites() {
    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) = spawn_gateway(&dir, r#"{"api": 8000}"#, |_| {}).await;

    let view: serde_json::Value = reqwest::get(format!("http://{gw_addr}/routes"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["api"], "http://127.0.0.1:8000");

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    std::fs::write(
        dir.path().join("devhost.json"),
        r#"{"api": 9000, "extra": 9001}"#,
    )
    .unwrap();

    let view: serde_json::Value = reqwest::get(format!("http://{gw_addr}/routes"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["api"], "http://127.0.0.1:9000");
    assert_eq!(view["extra"], "http://127.0.0.1:9001");
}

#[tokio::test]
async fn mappings_bypass_the_cache() {
    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) = spawn_gateway(&dir, r#"{"api": 8000}"#, |_| {}).await;

    let mappings: serde_json::Value = reqwest::get(format!("http://{gw_addr}/mappings"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // The file view keeps the raw short form
    assert_eq!(mappings["api"], 8000);
}

// ── Reserved paths ───────────────────────────────────────────────

#[tokio::test]
async fn reserved_paths_are_never_proxied() {
    // Even a hand-edited route file naming a reserved endpoint cannot
    // shadow it: /metrics stays the metrics document.
    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) = spawn_gateway(&dir, r#"{"metrics": 9}"#, |_| {}).await;

    let resp = reqwest::get(format!("http://{gw_addr}/metrics"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["requests"].is_object(), "got proxied output: {body}");

    let resp = reqwest::get(format!("http://{gw_addr}/health"))
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["status"].is_string());
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

// ── Forwarded headers ────────────────────────────────────────────

#[tokio::test]
async fn forwarded_headers_reach_the_upstream() {
    let upstream = spawn_app(Router::new().fallback(|req: Request| async move {
        let h = req.headers();
        serde_json::json!({
            "xff": h.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
            "xfh": h.get("x-forwarded-host").and_then(|v| v.to_str().ok()),
            "xfp": h.get("x-forwarded-proto").and_then(|v| v.to_str().ok()),
            "rid": h.get("x-request-id").and_then(|v| v.to_str().ok()),
            "te": h.get("transfer-encoding").and_then(|v| v.to_str().ok()),
        })
        .to_string()
        .into_response()
    }))
    .await;

    let dir = TempDir::new().unwrap();
    let (gw_addr, _gw) = spawn_gateway(
        &dir,
        &format!(r#"{{"hdr": {}}}"#, upstream.port()),
        |_| {},
    )
    .await;

    let client = client_for("hdr.localhost", gw_addr);
    let resp = client
        .get(format!("http://hdr.localhost:{}/", gw_addr.port()))
        .header("x-request-id", "fixed-id-123")
        .send()
        .await
        .unwrap();
    let body: serde_json::Value =
        serde_json::from_str(&resp.text().await.unwrap()).unwrap();

    assert_eq!(body["xff"], "127.0.0.1");
    assert!(
        body["xfh"].as_str().unwrap().starts_with("hdr.localhost"),
        "X-Forwarded-Host must carry the original host"
    );
    assert_eq!(body["xfp"], "http");
    assert_eq!(body["rid"], "fixed-id-123", "request IDs propagate");
    assert_eq!(body["te"], serde_json::Value::Null);
}
