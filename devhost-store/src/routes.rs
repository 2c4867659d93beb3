use devhost_core::target::Target;
use devhost_core::{DevhostError, validate};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::lock::FileLock;

/// The on-disk route map: name → target. Keys are the sole identifier;
/// values are integers (ports) or strings (`host:port` / URL).
pub type RouteMap = BTreeMap<String, Target>;

/// File-backed route store — the source of truth for the gateway.
///
/// Writes are atomic (sibling tmp + fsync + rename) and serialized across
/// processes by an advisory lock, so `set`/`remove` behave as
/// compare-and-swap against the on-disk snapshot.
pub struct RouteStore {
    path: PathBuf,
}

impl RouteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full map. A missing file is an empty map (first run); a
    /// malformed file is a `Config` error, never a silent wipe.
    pub fn load(&self) -> Result<RouteMap, DevhostError> {
        if !self.path.exists() {
            return Ok(RouteMap::new());
        }
        let data = fs::read_to_string(&self.path)?;
        serde_json::from_str(&data).map_err(|e| {
            DevhostError::Config(format!(
                "route file {} is malformed: {e}",
                self.path.display()
            ))
        })
    }

    /// Atomically replace the whole map.
    pub fn save(&self, map: &RouteMap) -> Result<(), DevhostError> {
        let _lock = FileLock::acquire(&self.path)?;
        self.save_locked(map)
    }

    /// Look up one target by name.
    pub fn get(&self, name: &str) -> Result<Option<Target>, DevhostError> {
        Ok(self.load()?.get(name).cloned())
    }

    /// Insert or replace a route. Validation happens before any side
    /// effect; an invalid name or target never touches the file.
    pub fn set(&self, name: &str, target: Target) -> Result<(), DevhostError> {
        validate::validate_route_name(name)?;
        let _lock = FileLock::acquire(&self.path)?;
        let mut map = self.load()?;
        map.insert(name.to_string(), target);
        self.save_locked(&map)?;
        debug!(route = name, "Route saved");
        Ok(())
    }

    /// Remove a route. Unknown names are a `NotFound` error so the CLI can
    /// report them distinctly.
    pub fn remove(&self, name: &str) -> Result<Target, DevhostError> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut map = self.load()?;
        let removed = map
            .remove(name)
            .ok_or_else(|| DevhostError::NotFound(name.to_string()))?;
        self.save_locked(&map)?;
        debug!(route = name, "Route removed");
        Ok(removed)
    }

    /// Atomic write: serialize to a sibling tmp file in the same directory,
    /// fsync, then rename over the target. A reader at any instant sees
    /// either the old or the new file, never a torn one.
    fn save_locked(&self, map: &RouteMap) -> Result<(), DevhostError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(map)?;

        let tmp = tmp_sibling(&self.path);
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(json.as_bytes())?;
            f.write_all(b"\n")?;
            f.sync_all()?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    os.into()
}
