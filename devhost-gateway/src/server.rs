use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use devhost_core::{DevhostError, Settings};
use devhost_guard::{Redactor, UpstreamGuard, headers};
use devhost_store::{RouteCache, RouteStore};
use http::header::{HeaderName, HeaderValue};
use serde_json::json;
use std::fmt;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tracing::{info, warn};

use crate::client::UpstreamClient;
use crate::metrics::GatewayMetrics;
use crate::proxy;

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

const LIFECYCLE_STOPPED: u8 = 0;
const LIFECYCLE_STARTING: u8 = 1;
const LIFECYCLE_RUNNING: u8 = 2;
const LIFECYCLE_DRAINING: u8 = 3;

/// Observable router states. `Healthy ↔ Degraded` is driven by the pool
/// success rate; `Draining` is terminal unless the process is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Stopped,
    Starting,
    Healthy,
    Degraded,
    Draining,
}

impl GatewayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayState::Stopped => "stopped",
            GatewayState::Starting => "starting",
            GatewayState::Healthy => "healthy",
            GatewayState::Degraded => "degraded",
            GatewayState::Draining => "draining",
        }
    }
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a request handler needs, owned in one place and shared via
/// `Arc`. Tests construct this directly with fake settings.
pub struct Gateway {
    pub settings: Settings,
    pub cache: RouteCache,
    pub routes: RouteStore,
    pub guard: UpstreamGuard,
    pub client: UpstreamClient,
    pub metrics: Arc<GatewayMetrics>,
    pub redactor: Redactor,
    pub security_headers: Vec<(HeaderName, HeaderValue)>,
    pub shutdown: broadcast::Sender<()>,
    lifecycle: AtomicU8,
    startup_ok: AtomicBool,
    drain_started: Notify,
}

impl Gateway {
    pub fn new(settings: Settings) -> Result<Arc<Self>, DevhostError> {
        let route_file = settings.route_file();
        let routes = RouteStore::new(&route_file);

        // Startup check: an unreadable route file keeps the router up but
        // reported degraded until the operator fixes it.
        let startup_ok = match routes.load() {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Startup check failed: route file unreadable");
                false
            }
        };

        let security_headers = headers::build_headers(&settings)
            .into_iter()
            .filter_map(|(name, value)| {
                Some((
                    HeaderName::from_bytes(name.as_bytes()).ok()?,
                    HeaderValue::from_str(&value).ok()?,
                ))
            })
            .collect();

        let (shutdown, _) = broadcast::channel(4);
        Ok(Arc::new(Self {
            cache: RouteCache::new(&route_file),
            routes,
            guard: UpstreamGuard::new(settings.allow_private_networks),
            client: UpstreamClient::new(&settings)?,
            metrics: Arc::new(GatewayMetrics::new()),
            redactor: Redactor::new(&settings.redact_patterns),
            security_headers,
            shutdown,
            lifecycle: AtomicU8::new(LIFECYCLE_STOPPED),
            startup_ok: AtomicBool::new(startup_ok),
            drain_started: Notify::new(),
            settings,
        }))
    }

    pub fn state(&self) -> GatewayState {
        match self.lifecycle.load(Ordering::Relaxed) {
            LIFECYCLE_STARTING => GatewayState::Starting,
            LIFECYCLE_DRAINING => GatewayState::Draining,
            LIFECYCLE_RUNNING => {
                if self.client.stats().healthy && self.startup_ok.load(Ordering::Relaxed) {
                    GatewayState::Healthy
                } else {
                    GatewayState::Degraded
                }
            }
            _ => GatewayState::Stopped,
        }
    }

    fn set_lifecycle(&self, phase: u8) {
        self.lifecycle.store(phase, Ordering::Relaxed);
    }

    /// Flip to the serving state. `run` does this after binding; tests and
    /// embedders that serve [`router`] themselves call it directly.
    pub fn mark_running(&self) {
        self.set_lifecycle(LIFECYCLE_RUNNING);
    }

    /// Stop-the-world for new work: state flips to draining and every open
    /// WebSocket gets a 1001 close.
    pub fn begin_drain(&self) {
        self.set_lifecycle(LIFECYCLE_DRAINING);
        let _ = self.shutdown.send(());
        self.drain_started.notify_one();
    }
}

/// The full gateway surface: four reserved endpoints, everything else
/// proxied. Embedders and tests serve this router themselves.
pub fn router(gw: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/routes", get(routes_endpoint))
        .route("/mappings", get(mappings_endpoint))
        .fallback(proxy::handle)
        .with_state(gw)
}

/// Run the gateway until SIGTERM/SIGINT, then drain for up to 30 s.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let gw = Gateway::new(settings)?;
    gw.set_lifecycle(LIFECYCLE_STARTING);

    let app = router(gw.clone());
    let listener = tokio::net::TcpListener::bind(gw.settings.listen).await?;
    info!(
        addr = %gw.settings.listen,
        domain = %gw.settings.domain,
        routes = %gw.routes.path().display(),
        "Gateway listening"
    );
    gw.set_lifecycle(LIFECYCLE_RUNNING);

    let drain_gw = gw.clone();
    let graceful = async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining");
        drain_gw.begin_drain();
    };

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful)
    .into_future();

    let cap_gw = gw.clone();
    let drain_cap = async move {
        cap_gw.drain_started.notified().await;
        tokio::time::sleep(DRAIN_DEADLINE).await;
    };

    tokio::select! {
        res = server => res?,
        _ = drain_cap => {
            warn!(
                in_flight = gw.metrics.in_flight(),
                "Drain deadline reached, closing remaining connections"
            );
        }
    }

    gw.set_lifecycle(LIFECYCLE_STOPPED);
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ── Reserved endpoints ───────────────────────────────────────────

async fn health(State(gw): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    let pool = gw.client.stats();
    let status = match gw.state() {
        GatewayState::Healthy => "ok",
        GatewayState::Degraded => "degraded",
        GatewayState::Draining => "draining",
        other => other.as_str(),
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": gw.metrics.uptime_seconds(),
        "routes": gw.cache.view().len(),
        "in_flight_requests": gw.metrics.in_flight(),
        "connection_pool": {
            "healthy": pool.healthy,
            "success_rate": pool.success_rate,
        },
        "memory_mb": resident_memory_mb(),
    }))
}

async fn metrics_endpoint(State(gw): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    let mut snapshot = serde_json::to_value(gw.metrics.snapshot()).unwrap_or_default();
    snapshot["cache"] = serde_json::to_value(gw.cache.stats()).unwrap_or_default();
    snapshot["connection_pool"] = serde_json::to_value(gw.client.stats()).unwrap_or_default();
    Json(snapshot)
}

async fn routes_endpoint(State(gw): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(gw.cache.view()).unwrap_or_default())
}

/// The file view: re-reads the route file, bypassing both cache levels.
async fn mappings_endpoint(State(gw): State<Arc<Gateway>>) -> Response {
    match gw.routes.load() {
        Ok(map) => proxy::json_response(200, serde_json::to_value(map).unwrap_or_default()),
        Err(e) => proxy::json_response(
            500,
            json!({"error": e.to_string(), "reason": e.reason()}),
        ),
    }
}

/// Resident set size in MiB, where the platform makes it cheap to read.
fn resident_memory_mb() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        return Some(resident_pages * 4096.0 / (1024.0 * 1024.0));
    }
    #[cfg(not(target_os = "linux"))]
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use devhost_core::target::Target;
    use tempfile::tempdir;

    fn gateway_in(dir: &tempfile::TempDir) -> Arc<Gateway> {
        let mut settings = Settings::default();
        settings.state_dir = dir.path().to_path_buf();
        Gateway::new(settings).unwrap()
    }

    #[test]
    fn lifecycle_starts_stopped() {
        let dir = tempdir().unwrap();
        let gw = gateway_in(&dir);
        assert_eq!(gw.state(), GatewayState::Stopped);
    }

    #[test]
    fn running_with_healthy_pool_is_healthy() {
        let dir = tempdir().unwrap();
        let gw = gateway_in(&dir);
        gw.set_lifecycle(LIFECYCLE_RUNNING);
        assert_eq!(gw.state(), GatewayState::Healthy);
    }

    #[test]
    fn failed_startup_check_degrades() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("devhost.json"), "broken {{").unwrap();
        let gw = gateway_in(&dir);
        gw.set_lifecycle(LIFECYCLE_RUNNING);
        assert_eq!(gw.state(), GatewayState::Degraded);
    }

    #[test]
    fn drain_is_terminal_and_signals_websockets() {
        let dir = tempdir().unwrap();
        let gw = gateway_in(&dir);
        gw.set_lifecycle(LIFECYCLE_RUNNING);
        let mut rx = gw.shutdown.subscribe();
        gw.begin_drain();
        assert_eq!(gw.state(), GatewayState::Draining);
        assert!(rx.try_recv().is_ok(), "drain must broadcast to websockets");
    }

    #[tokio::test]
    async fn health_reports_route_count_and_pool() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.state_dir = dir.path().to_path_buf();
        let store = RouteStore::new(settings.route_file());
        store.set("api", Target::Port(8000)).unwrap();
        store.set("web", Target::Port(3000)).unwrap();

        let gw = Gateway::new(settings).unwrap();
        gw.set_lifecycle(LIFECYCLE_RUNNING);
        let Json(body) = health(State(gw)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["routes"], 2);
        assert_eq!(body["in_flight_requests"], 0);
        assert_eq!(body["connection_pool"]["healthy"], true);
    }

    #[tokio::test]
    async fn metrics_include_cache_and_pool_blocks() {
        let dir = tempdir().unwrap();
        let gw = gateway_in(&dir);
        gw.metrics.record_request(200, 1.0);
        let Json(body) = metrics_endpoint(State(gw)).await;
        assert_eq!(body["requests"]["total"], 1);
        assert!(body["cache"].is_object());
        assert!(body["connection_pool"].is_object());
        assert!(body["latency_ms"]["p50"].is_number());
    }
}
