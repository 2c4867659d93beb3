use devhost_core::{DevhostError, Settings};
use devhost_store::state::{ExternalProxy, ProxyDriver, ReloadMode, ReloadPolicy};
use devhost_store::{RouteMap, StateStore, state};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::driver::{DriverExt, MARKER_BEGIN, MARKER_END, snippet_routes};
use crate::exec::{TimeoutBucket, run_command, run_shell};

/// Attach/detach orchestration against a user-owned proxy config.
///
/// Every mutation follows the same shape: back up, edit only the marked
/// region, run the driver's validator, roll back on any failure, and keep
/// the integrity map in sync with what Devhost now owns or touches.
pub struct Integrator {
    state: StateStore,
    state_dir: PathBuf,
    domain: String,
    validator_override: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct AttachReport {
    pub backup: PathBuf,
    pub snippet: PathBuf,
}

impl Integrator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            state: StateStore::new(settings.state_file(), settings.backups_dir()),
            state_dir: settings.state_dir.clone(),
            domain: settings.domain.clone(),
            validator_override: None,
        }
    }

    /// Replace the driver validator invocation. The seam tests use to
    /// substitute a stub for the real `caddy`/`nginx` binary.
    pub fn with_validator_override(mut self, argv: Vec<String>) -> Self {
        self.validator_override = Some(argv);
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// The Devhost-owned snippet location for a driver, always absolute.
    pub fn snippet_path(&self, driver: ProxyDriver) -> Result<PathBuf, DevhostError> {
        let path = self
            .state_dir
            .join("proxy")
            .join(driver.as_str())
            .join(driver.snippet_filename());
        Ok(std::path::absolute(path)?)
    }

    /// Render and write the owned snippet, recording its hash.
    pub fn write_snippet(
        &self,
        driver: ProxyDriver,
        routes: &RouteMap,
    ) -> Result<PathBuf, DevhostError> {
        let snippet = self.snippet_path(driver)?;
        if let Some(parent) = snippet.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = driver.render_snippet(&snippet_routes(routes, &self.domain));
        fs::write(&snippet, rendered)?;
        self.state.record_hash(&snippet)?;
        info!(driver = %driver, snippet = %snippet.display(), "Snippet written");
        Ok(snippet)
    }

    /// Attach the marker block (or traefik file-provider entry) to a
    /// user-owned config. On validator or reload failure the backup is
    /// restored and the error propagates.
    pub async fn attach(
        &self,
        driver: ProxyDriver,
        config: &Path,
        routes: &RouteMap,
        reload: ReloadPolicy,
        force: bool,
    ) -> Result<AttachReport, DevhostError> {
        if !config.exists() {
            return Err(DevhostError::Validation(format!(
                "config file {} does not exist",
                config.display()
            )));
        }
        let content = fs::read_to_string(config)?;
        let backup = self.state.backup_file(config)?;

        // Drift guard: an existing devhost block we cannot match to a
        // recorded hash means someone else edited our region.
        if has_marker_block(&content) {
            let recorded = self
                .state
                .read()?
                .integrity
                .hashes
                .get(&absolute_key(config)?)
                .cloned();
            let current = state::hash_file(config)?;
            if recorded.as_deref() != Some(current.as_str()) && !force {
                return Err(DevhostError::IntegrityDrift(format!(
                    "{} already carries a devhost block that does not match the recorded state",
                    config.display()
                )));
            }
        }
        let snippet = self.write_snippet(driver, routes)?;

        let new_content = match driver {
            ProxyDriver::Traefik => attach_traefik(&content, &snippet)?,
            _ => {
                let block = format!(
                    "{MARKER_BEGIN}\n{}\n{MARKER_END}\n",
                    driver.include_line(&snippet)
                );
                let mut out = remove_marker_block(&content).unwrap_or(content);
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&block);
                out
            }
        };
        fs::write(config, &new_content)?;

        if let Err(e) = self.validate(driver, config).await {
            warn!(config = %config.display(), "Validator rejected attach, restoring backup");
            fs::copy(&backup, config)?;
            return Err(e);
        }
        if let Err(e) = self.run_reload(&reload).await {
            warn!(config = %config.display(), "Reload failed after attach, restoring backup");
            fs::copy(&backup, config)?;
            return Err(e);
        }

        self.state.record_hash(config)?;
        self.state.update(|s| {
            s.proxy.external = Some(ExternalProxy {
                driver,
                config_path: config.to_path_buf(),
                snippet_path: snippet.clone(),
                reload,
            });
        })?;

        info!(driver = %driver, config = %config.display(), "Attached");
        Ok(AttachReport { backup, snippet })
    }

    /// Remove only the marked region. Missing block or hash mismatch is
    /// drift: refused unless forced. A validator failure after removal
    /// restores the backup, which re-attaches the block.
    pub async fn detach(&self, force: bool) -> Result<PathBuf, DevhostError> {
        let state_doc = self.state.read()?;
        let Some(external) = state_doc.proxy.external.clone() else {
            return Err(DevhostError::NotFound("no external proxy attached".into()));
        };
        let config = external.config_path.clone();
        if !config.exists() {
            return Err(DevhostError::NotFound(format!(
                "attached config {} is gone",
                config.display()
            )));
        }
        let content = fs::read_to_string(&config)?;

        let recorded = state_doc.integrity.hashes.get(&absolute_key(&config)?).cloned();
        let current = state::hash_file(&config)?;
        let block_present = match external.driver {
            ProxyDriver::Traefik => traefik_is_attached(&content, &external.snippet_path),
            _ => has_marker_block(&content),
        };
        if (recorded.as_deref() != Some(current.as_str()) || !block_present) && !force {
            return Err(DevhostError::IntegrityDrift(format!(
                "{} drifted since attach (use --force to remove the devhost block anyway)",
                config.display()
            )));
        }

        let backup = self.state.backup_file(&config)?;
        let new_content = match external.driver {
            ProxyDriver::Traefik => detach_traefik(&content)?,
            _ => remove_marker_block(&content).unwrap_or(content),
        };
        fs::write(&config, &new_content)?;

        if let Err(e) = self.validate(external.driver, &config).await {
            warn!(config = %config.display(), "Validator rejected detach, restoring backup");
            fs::copy(&backup, &config)?;
            return Err(e);
        }
        if let Err(e) = self.run_reload(&external.reload).await {
            fs::copy(&backup, &config)?;
            return Err(e);
        }

        self.state.remove_hash(&config)?;
        self.state.update(|s| {
            s.proxy.external = None;
        })?;

        info!(config = %config.display(), "Detached");
        Ok(backup)
    }

    /// Reset Devhost-owned artifacts: default state, owned snippets, and
    /// backups. User files are never touched.
    pub fn reset(&self) -> Result<(), DevhostError> {
        self.state.write(&state::State::default())?;
        let proxy_dir = self.state_dir.join("proxy");
        if proxy_dir.exists() {
            fs::remove_dir_all(&proxy_dir)?;
        }
        let backups = self.state.backups_dir().to_path_buf();
        if backups.exists() {
            fs::remove_dir_all(&backups)?;
        }
        info!("State reset");
        Ok(())
    }

    async fn validate(&self, driver: ProxyDriver, config: &Path) -> Result<(), DevhostError> {
        let argv = self
            .validator_override
            .clone()
            .unwrap_or_else(|| driver.validate_argv(config));
        let outcome = run_command(&argv, TimeoutBucket::Validate).await?;
        if !outcome.success() {
            return Err(DevhostError::ExternalTool(format!(
                "{driver} validator failed: {}",
                outcome.failure_detail()
            )));
        }
        Ok(())
    }

    async fn run_reload(&self, policy: &ReloadPolicy) -> Result<(), DevhostError> {
        if policy.mode == ReloadMode::Command
            && let Some(command) = &policy.command
        {
            let outcome = run_shell(command, TimeoutBucket::Standard).await?;
            if !outcome.success() {
                return Err(DevhostError::ExternalTool(format!(
                    "reload command failed: {}",
                    outcome.failure_detail()
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn absolute_key(path: &Path) -> Result<String, DevhostError> {
    Ok(std::path::absolute(path)?.to_string_lossy().into_owned())
}

pub(crate) fn has_marker_block(content: &str) -> bool {
    content
        .lines()
        .any(|line| line.trim() == MARKER_BEGIN)
}

/// Remove the marker block lines, leaving every other byte untouched.
/// Returns `None` when no block is present.
pub(crate) fn remove_marker_block(content: &str) -> Option<String> {
    if !has_marker_block(content) {
        return None;
    }
    let mut out = String::with_capacity(content.len());
    let mut in_block = false;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']).trim();
        if !in_block && trimmed == MARKER_BEGIN {
            in_block = true;
            continue;
        }
        if in_block {
            if trimmed == MARKER_END {
                in_block = false;
            }
            continue;
        }
        out.push_str(line);
    }
    Some(out)
}

// Traefik's file provider takes a filename key instead of an include
// directive, so attach/detach edit the YAML document itself.

fn ensure_mapping<'a>(
    map: &'a mut serde_yaml::Mapping,
    key: &str,
) -> Result<&'a mut serde_yaml::Mapping, DevhostError> {
    let k = serde_yaml::Value::String(key.to_string());
    if !map.contains_key(&k) {
        map.insert(k.clone(), serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    }
    map.get_mut(&k)
        .and_then(|v| v.as_mapping_mut())
        .ok_or_else(|| {
            DevhostError::Validation(format!("traefik config: `{key}` is not a mapping"))
        })
}

fn attach_traefik(content: &str, snippet: &Path) -> Result<String, DevhostError> {
    let mut doc: serde_yaml::Value = if content.trim().is_empty() {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    } else {
        serde_yaml::from_str(content)
            .map_err(|e| DevhostError::Config(format!("traefik config is not valid YAML: {e}")))?
    };
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| DevhostError::Validation("traefik config is not a mapping".into()))?;
    let providers = ensure_mapping(root, "providers")?;
    let file = ensure_mapping(providers, "file")?;
    file.insert(
        serde_yaml::Value::String("filename".into()),
        serde_yaml::Value::String(snippet.display().to_string()),
    );
    serde_yaml::to_string(&doc).map_err(DevhostError::from)
}

fn detach_traefik(content: &str) -> Result<String, DevhostError> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(content)
        .map_err(|e| DevhostError::Config(format!("traefik config is not valid YAML: {e}")))?;
    if let Some(root) = doc.as_mapping_mut() {
        let providers_key = serde_yaml::Value::String("providers".into());
        let mut drop_providers = false;
        if let Some(providers) = root.get_mut(&providers_key).and_then(|v| v.as_mapping_mut()) {
            let file_key = serde_yaml::Value::String("file".into());
            if let Some(file) = providers.get_mut(&file_key).and_then(|v| v.as_mapping_mut()) {
                file.remove(&serde_yaml::Value::String("filename".into()));
                if file.is_empty() {
                    providers.remove(&file_key);
                }
            }
            drop_providers = providers.is_empty();
        }
        if drop_providers {
            root.remove(&providers_key);
        }
    }
    serde_yaml::to_string(&doc).map_err(DevhostError::from)
}

fn traefik_is_attached(content: &str, snippet: &Path) -> bool {
    serde_yaml::from_str::<serde_yaml::Value>(content)
        .ok()
        .and_then(|doc| {
            doc.get("providers")?
                .get("file")?
                .get("filename")
                .map(|v| v == &serde_yaml::Value::String(snippet.display().to_string()))
        })
        .unwrap_or(false)
}
