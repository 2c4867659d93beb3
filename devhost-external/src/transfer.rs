use devhost_core::DevhostError;
use devhost_store::RouteMap;
use devhost_store::state::{Mode, ProxyDriver, ReloadPolicy};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::attach::Integrator;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Where the external proxy's HTTP listener answers probes.
    pub probe_addr: SocketAddr,
    /// Operator confirmation to stop the owned proxy after the flip.
    pub stop_owned_proxy: bool,
    /// Forward drift overrides to attach.
    pub force: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            probe_addr: "127.0.0.1:80".parse().unwrap(),
            stop_owned_proxy: false,
            force: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub hostname: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct TransferReport {
    pub probes: Vec<ProbeResult>,
    pub proxy_stopped: bool,
}

/// Verified `system → external` migration: render, attach, reload, probe
/// every route through the external listener, and only flip the mode on a
/// 100% pass. Any failure rolls everything back — config, hashes, mode —
/// and leaves system mode running.
pub async fn transfer(
    integrator: &Integrator,
    driver: ProxyDriver,
    config: &Path,
    routes: &RouteMap,
    domain: &str,
    reload: ReloadPolicy,
    opts: TransferOptions,
) -> Result<TransferReport, DevhostError> {
    if routes.is_empty() {
        return Err(DevhostError::Validation(
            "no routes to transfer; add one first".into(),
        ));
    }

    // Rollback point: hashes and mode must be byte-identical on failure
    let snapshot = integrator.state().read()?;

    integrator
        .attach(driver, config, routes, reload, opts.force)
        .await?;

    let probes = probe_routes(routes, domain, opts.probe_addr).await;
    let failed = probes.iter().filter(|p| !p.passed).count();

    if failed > 0 {
        warn!(failed, total = probes.len(), "Transfer verification failed, rolling back");
        if let Err(e) = integrator.detach(true).await {
            warn!(error = %e, "Rollback detach failed; backup remains in the backups directory");
        }
        integrator.state().write(&snapshot)?;
        return Err(DevhostError::ExternalTool(format!(
            "transfer verification failed for {failed} of {} routes",
            probes.len()
        )));
    }

    integrator.state().set_mode(Mode::External)?;
    info!(driver = %driver, routes = probes.len(), "Transfer verified, mode is now external");

    let proxy_stopped = if opts.stop_owned_proxy {
        stop_owned_proxy(integrator)?
    } else {
        false
    };

    Ok(TransferReport {
        probes,
        proxy_stopped,
    })
}

/// `GET /` with the route's public Host against the external listener.
/// Pass = TCP connect succeeded and the response is not a 5xx.
pub async fn probe_routes(
    routes: &RouteMap,
    domain: &str,
    probe_addr: SocketAddr,
) -> Vec<ProbeResult> {
    let mut builder = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none());
    for name in routes.keys() {
        builder = builder.resolve(&format!("{name}.{domain}"), probe_addr);
    }
    let client = match builder.build() {
        Ok(c) => c,
        Err(e) => {
            return routes
                .keys()
                .map(|name| ProbeResult {
                    name: name.clone(),
                    hostname: format!("{name}.{domain}"),
                    passed: false,
                    detail: format!("probe client: {e}"),
                })
                .collect();
        }
    };

    let mut results = Vec::with_capacity(routes.len());
    for name in routes.keys() {
        let hostname = format!("{name}.{domain}");
        let url = format!("http://{hostname}:{}/", probe_addr.port());
        let result = match client.get(&url).send().await {
            Ok(resp) if resp.status().as_u16() < 500 => ProbeResult {
                name: name.clone(),
                hostname,
                passed: true,
                detail: format!("HTTP {}", resp.status().as_u16()),
            },
            Ok(resp) => ProbeResult {
                name: name.clone(),
                hostname,
                passed: false,
                detail: format!("HTTP {}", resp.status().as_u16()),
            },
            Err(e) => ProbeResult {
                name: name.clone(),
                hostname,
                passed: false,
                detail: e.to_string(),
            },
        };
        results.push(result);
    }
    results
}

/// SIGTERM the owned system proxy, if one is recorded.
fn stop_owned_proxy(integrator: &Integrator) -> Result<bool, DevhostError> {
    let state_doc = integrator.state().read()?;
    let Some(pid) = state_doc.proxy.system.pid else {
        return Ok(false);
    };
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc != 0 {
            warn!(pid, "Owned proxy was not running");
        }
    }
    integrator.state().update(|s| {
        s.proxy.system.pid = None;
    })?;
    info!(pid, "Owned proxy stopped");
    Ok(true)
}
