use devhost_core::{DevhostError, RouteRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::lock::FileLock;

/// Current state-file schema version.
pub const STATE_VERSION: u32 = 3;

/// The v3 state document. Unknown top-level keys written by newer versions
/// are preserved across read/write via the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub version: u32,

    #[serde(default)]
    pub proxy: ProxySection,

    #[serde(default)]
    pub integrity: IntegritySection,

    #[serde(default)]
    pub tunnels: BTreeMap<String, TunnelInfo>,

    /// Advisory mirror of the route store with v3 metadata. The route file
    /// always wins; this map is reconciled after route-file commits.
    #[serde(default)]
    pub routes: BTreeMap<String, RouteRecord>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            proxy: ProxySection::default(),
            integrity: IntegritySection::default(),
            tunnels: BTreeMap::new(),
            routes: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default)]
    pub mode: Mode,

    #[serde(default)]
    pub gateway: GatewayProxy,

    #[serde(default)]
    pub system: SystemProxy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalProxy>,
}

/// Exactly one mode is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Off,
    Gateway,
    System,
    External,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::Gateway => "gateway",
            Mode::System => "system",
            Mode::External => "external",
        }
    }

    pub fn parse(s: &str) -> Option<Mode> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Some(Mode::Off),
            "gateway" => Some(Mode::Gateway),
            "system" => Some(Mode::System),
            "external" => Some(Mode::External),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Unknown mode values fail closed: a state file written by a newer Devhost
// must never leave an unexpected proxy running.
impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Mode::parse(&s).unwrap_or_else(|| {
            warn!(mode = %s, "Unknown proxy mode in state file, treating as off");
            Mode::Off
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayProxy {
    #[serde(default = "default_gateway_listen")]
    pub listen: String,
}

impl Default for GatewayProxy {
    fn default() -> Self {
        Self {
            listen: default_gateway_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemProxy {
    #[serde(default = "default_listen_http")]
    pub listen_http: String,

    #[serde(default = "default_listen_https")]
    pub listen_https: String,

    /// PID of the owned proxy process, if one is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl Default for SystemProxy {
    fn default() -> Self {
        Self {
            listen_http: default_listen_http(),
            listen_https: default_listen_https(),
            pid: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalProxy {
    pub driver: ProxyDriver,
    pub config_path: PathBuf,
    pub snippet_path: PathBuf,

    #[serde(default)]
    pub reload: ReloadPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyDriver {
    Caddy,
    Nginx,
    Traefik,
}

impl ProxyDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyDriver::Caddy => "caddy",
            ProxyDriver::Nginx => "nginx",
            ProxyDriver::Traefik => "traefik",
        }
    }

    pub fn parse(s: &str) -> Option<ProxyDriver> {
        match s.to_ascii_lowercase().as_str() {
            "caddy" => Some(ProxyDriver::Caddy),
            "nginx" => Some(ProxyDriver::Nginx),
            "traefik" => Some(ProxyDriver::Traefik),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReloadPolicy {
    #[serde(default)]
    pub mode: ReloadMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    #[default]
    Manual,
    Command,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegritySection {
    /// Absolute path → `sha256:<hex>` of every file Devhost owns or has
    /// attached to. Detach removes the entry.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub provider: String,
    pub public_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Outcome of comparing a tracked file against its recorded hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStatus {
    Match,
    Missing,
    Mismatch,
}

impl fmt::Display for HashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashStatus::Match => "match",
            HashStatus::Missing => "missing",
            HashStatus::Mismatch => "mismatch",
        })
    }
}

/// SHA-256 of a file in the `sha256:<hex>` notation used by the state file.
pub fn hash_file(path: &Path) -> Result<String, DevhostError> {
    let data = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// YAML state store. Writes are atomic and chmod 0600 (best-effort off
/// POSIX); mutators are read-modify-write cycles under the advisory lock.
pub struct StateStore {
    path: PathBuf,
    backups_dir: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backups_dir: backups_dir.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Read the state document; a missing file is a fresh default.
    pub fn read(&self) -> Result<State, DevhostError> {
        if !self.path.exists() {
            return Ok(State::default());
        }
        let data = fs::read_to_string(&self.path)?;
        serde_yaml::from_str(&data).map_err(|e| {
            DevhostError::Config(format!(
                "state file {} is malformed: {e}",
                self.path.display()
            ))
        })
    }

    /// Atomically write the state document with owner-only permissions.
    pub fn write(&self, state: &State) -> Result<(), DevhostError> {
        let _lock = FileLock::acquire(&self.path)?;
        self.write_locked(state)
    }

    pub fn set_mode(&self, mode: Mode) -> Result<State, DevhostError> {
        self.update(|state| {
            state.proxy.mode = mode;
        })
    }

    /// Hash `path` and record it in the integrity map. Returns the hash.
    pub fn record_hash(&self, path: &Path) -> Result<String, DevhostError> {
        let key = absolute_key(path)?;
        let hash = hash_file(path)?;
        let recorded = hash.clone();
        self.update(move |state| {
            state.integrity.hashes.insert(key, recorded);
        })?;
        Ok(hash)
    }

    pub fn remove_hash(&self, path: &Path) -> Result<(), DevhostError> {
        let key = absolute_key(path)?;
        self.update(move |state| {
            state.integrity.hashes.remove(&key);
        })?;
        Ok(())
    }

    /// Compare one tracked file against its recorded hash.
    pub fn verify_hash(state: &State, path: &str) -> Result<HashStatus, DevhostError> {
        let recorded = state
            .integrity
            .hashes
            .get(path)
            .ok_or_else(|| DevhostError::NotFound(format!("no hash recorded for {path}")))?;
        let p = Path::new(path);
        if !p.exists() {
            return Ok(HashStatus::Missing);
        }
        if &hash_file(p)? == recorded {
            Ok(HashStatus::Match)
        } else {
            Ok(HashStatus::Mismatch)
        }
    }

    /// Recompute every tracked hash and report per-file status.
    pub fn verify_all(&self) -> Result<Vec<(String, HashStatus)>, DevhostError> {
        let state = self.read()?;
        let mut report = Vec::with_capacity(state.integrity.hashes.len());
        for path in state.integrity.hashes.keys() {
            report.push((path.clone(), Self::verify_hash(&state, path)?));
        }
        Ok(report)
    }

    /// Rewrite every tracked hash to the file's current contents — the
    /// operator-acknowledged new baseline. Entries whose file is gone are
    /// dropped.
    pub fn accept_all(&self) -> Result<(), DevhostError> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut state = self.read()?;
        let paths: Vec<String> = state.integrity.hashes.keys().cloned().collect();
        for path in paths {
            let p = Path::new(&path);
            if p.exists() {
                let hash = hash_file(p)?;
                state.integrity.hashes.insert(path, hash);
            } else {
                warn!(path = %path, "Tracked file is gone, dropping integrity entry");
                state.integrity.hashes.remove(&path);
            }
        }
        self.write_locked(&state)
    }

    /// Copy `path` into the backups directory as `<basename>.<ts>.bak` and
    /// return the backup path.
    pub fn backup_file(&self, path: &Path) -> Result<PathBuf, DevhostError> {
        if !path.exists() {
            return Err(DevhostError::NotFound(format!(
                "cannot back up missing file {}",
                path.display()
            )));
        }
        fs::create_dir_all(&self.backups_dir)?;

        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let ts = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let mut backup = self.backups_dir.join(format!("{base}.{ts}.bak"));
        let mut n = 1u32;
        while backup.exists() {
            backup = self.backups_dir.join(format!("{base}.{ts}-{n}.bak"));
            n += 1;
        }
        fs::copy(path, &backup)?;
        debug!(src = %path.display(), backup = %backup.display(), "File backed up");
        Ok(backup)
    }

    pub fn set_route_mirror(&self, record: RouteRecord) -> Result<(), DevhostError> {
        self.update(move |state| {
            state.routes.insert(record.name.clone(), record);
        })?;
        Ok(())
    }

    pub fn remove_route_mirror(&self, name: &str) -> Result<(), DevhostError> {
        let name = name.to_string();
        self.update(move |state| {
            state.routes.remove(&name);
        })?;
        Ok(())
    }

    pub fn set_tunnel(&self, name: &str, info: TunnelInfo) -> Result<(), DevhostError> {
        let name = name.to_string();
        self.update(move |state| {
            state.tunnels.insert(name, info);
        })?;
        Ok(())
    }

    pub fn remove_tunnel(&self, name: &str) -> Result<(), DevhostError> {
        let name = name.to_string();
        self.update(move |state| {
            state.tunnels.remove(&name);
        })?;
        Ok(())
    }

    /// Locked read-modify-write cycle.
    pub fn update<F>(&self, mutate: F) -> Result<State, DevhostError>
    where
        F: FnOnce(&mut State),
    {
        let _lock = FileLock::acquire(&self.path)?;
        let mut state = self.read()?;
        mutate(&mut state);
        self.write_locked(&state)?;
        Ok(state)
    }

    fn write_locked(&self, state: &State) -> Result<(), DevhostError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(state)?;

        let tmp = {
            let mut os = self.path.as_os_str().to_os_string();
            os.push(".tmp");
            PathBuf::from(os)
        };
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(yaml.as_bytes())?;
            f.sync_all()?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn absolute_key(path: &Path) -> Result<String, DevhostError> {
    let abs = std::path::absolute(path)?;
    Ok(abs.to_string_lossy().into_owned())
}

fn default_gateway_listen() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_listen_http() -> String {
    "127.0.0.1:80".to_string()
}

fn default_listen_https() -> String {
    "127.0.0.1:443".to_string()
}
