use devhost_core::{DevhostError, Settings};
use devhost_external::{Integrator, TransferOptions};
use devhost_store::state::{ProxyDriver, ReloadMode, ReloadPolicy};
use std::net::SocketAddr;
use std::path::Path;

use super::route_store;

fn parse_driver(raw: &str) -> Result<ProxyDriver, DevhostError> {
    ProxyDriver::parse(raw).ok_or_else(|| {
        DevhostError::Validation(format!(
            "unknown driver {raw:?} (expected caddy, nginx, or traefik)"
        ))
    })
}

fn reload_policy(command: Option<String>) -> ReloadPolicy {
    match command {
        Some(command) => ReloadPolicy {
            mode: ReloadMode::Command,
            command: Some(command),
        },
        None => ReloadPolicy::default(),
    }
}

/// `devhost external snippet <driver>`
pub fn snippet(settings: &Settings, driver: &str) -> Result<(), DevhostError> {
    let driver = parse_driver(driver)?;
    let routes = route_store(settings).load()?;
    let path = Integrator::new(settings).write_snippet(driver, &routes)?;
    println!("{}", path.display());
    Ok(())
}

/// `devhost external attach <driver> --config <path>`
pub async fn attach(
    settings: &Settings,
    driver: &str,
    config: &Path,
    reload_command: Option<String>,
    force: bool,
) -> Result<(), DevhostError> {
    let driver = parse_driver(driver)?;
    let routes = route_store(settings).load()?;
    let report = Integrator::new(settings)
        .attach(driver, config, &routes, reload_policy(reload_command), force)
        .await?;
    println!("attached {driver} via {}", report.snippet.display());
    println!("backup: {}", report.backup.display());
    Ok(())
}

/// `devhost external detach`
pub async fn detach(settings: &Settings, force: bool) -> Result<(), DevhostError> {
    let backup = Integrator::new(settings).detach(force).await?;
    println!("detached (backup: {})", backup.display());
    Ok(())
}

/// `devhost external transfer <driver> --config <path>`
#[allow(clippy::too_many_arguments)]
pub async fn transfer(
    settings: &Settings,
    driver: &str,
    config: &Path,
    probe: SocketAddr,
    reload_command: Option<String>,
    yes: bool,
    force: bool,
) -> Result<(), DevhostError> {
    let driver = parse_driver(driver)?;
    let routes = route_store(settings).load()?;
    let integrator = Integrator::new(settings);

    let report = devhost_external::transfer(
        &integrator,
        driver,
        config,
        &routes,
        &settings.domain,
        reload_policy(reload_command),
        TransferOptions {
            probe_addr: probe,
            stop_owned_proxy: yes,
            force,
        },
    )
    .await?;

    for probe in &report.probes {
        println!("ok  {:<30} {}", probe.hostname, probe.detail);
    }
    println!("mode is now external");
    if report.proxy_stopped {
        println!("owned proxy stopped");
    }
    Ok(())
}
