use arc_swap::ArcSwap;
use dashmap::DashMap;
use devhost_core::target::{Target, Upstream};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// File-level cache TTL. Within this window the route file is not even
/// stat'ed again unless a writer calls [`RouteCache::invalidate_now`].
pub const FILE_TTL: Duration = Duration::from_secs(30);

/// Per-route cache TTL; entries are additionally discarded whenever the
/// file view reloads.
pub const ROUTE_TTL: Duration = Duration::from_secs(60);

/// Outcome of resolving a name through the cache.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// A valid route with its normalized upstream.
    Found(Upstream),
    /// The name exists in the file but its value does not parse; the raw
    /// value is kept so the caller can classify the rejection.
    Invalid { raw: String, reason: String },
}

struct FileView {
    entries: BTreeMap<String, serde_json::Value>,
    loaded_at: Instant,
    mtime: Option<SystemTime>,
    generation: u64,
}

struct RouteEntry {
    resolved: Resolved,
    at: Instant,
    generation: u64,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub reloads: u64,
}

/// Two-level route cache feeding the gateway's dispatch path.
///
/// Level (a) caches the parsed route file, invalidated by TTL or an
/// observed modification-time change. Level (b) caches per-name resolution
/// (target parse + normalization) and is cleared on every (a) reload.
/// Concurrent misses coalesce behind one reload.
pub struct RouteCache {
    path: PathBuf,
    file_ttl: Duration,
    route_ttl: Duration,
    view: ArcSwap<FileView>,
    routes: DashMap<String, RouteEntry>,
    reload_gate: Mutex<()>,
    force_reload: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    reloads: AtomicU64,
}

impl RouteCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_ttls(path, FILE_TTL, ROUTE_TTL)
    }

    pub fn with_ttls(path: impl Into<PathBuf>, file_ttl: Duration, route_ttl: Duration) -> Self {
        Self {
            path: path.into(),
            file_ttl,
            route_ttl,
            view: ArcSwap::new(Arc::new(FileView {
                entries: BTreeMap::new(),
                loaded_at: Instant::now(),
                mtime: None,
                generation: 0,
            })),
            routes: DashMap::new(),
            reload_gate: Mutex::new(()),
            force_reload: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a route name. `None` means the name is not in the file.
    pub fn lookup(&self, name: &str) -> Option<Resolved> {
        let current_gen = self.view.load().generation;
        if let Some(entry) = self.routes.get(name)
            && entry.generation == current_gen
            && entry.at.elapsed() < self.route_ttl
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.resolved.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.refresh_if_stale();

        let view = self.view.load();
        let value = view.entries.get(name)?;
        let resolved = resolve_value(value);
        self.routes.insert(
            name.to_string(),
            RouteEntry {
                resolved: resolved.clone(),
                at: Instant::now(),
                generation: view.generation,
            },
        );
        Some(resolved)
    }

    /// The current cached route view, as served by `GET /routes`. Valid
    /// entries show their normalized URL; invalid ones their raw value.
    pub fn view(&self) -> BTreeMap<String, serde_json::Value> {
        self.refresh_if_stale();
        let view = self.view.load();
        view.entries
            .iter()
            .map(|(name, value)| {
                let rendered = match resolve_value(value) {
                    Resolved::Found(up) => serde_json::Value::String(up.url()),
                    Resolved::Invalid { .. } => value.clone(),
                };
                (name.clone(), rendered)
            })
            .collect()
    }

    /// Number of names currently in the cached file view.
    pub fn route_count(&self) -> usize {
        self.view.load().entries.len()
    }

    /// In-process writers call this right after committing the route file
    /// so the next lookup reloads without waiting for a TTL or stat.
    pub fn invalidate_now(&self) {
        self.force_reload.store(true, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                1.0
            } else {
                hits as f64 / total as f64
            },
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }

    fn is_stale(&self, view: &FileView) -> bool {
        if self.force_reload.load(Ordering::Relaxed) {
            return true;
        }
        if view.loaded_at.elapsed() >= self.file_ttl {
            return true;
        }
        // An observed mtime change invalidates immediately.
        current_mtime(&self.path) != view.mtime
    }

    fn refresh_if_stale(&self) {
        if !self.is_stale(&self.view.load()) {
            return;
        }
        // Coalesce: concurrent misses wait here while one thread reloads,
        // then observe the fresh view on the double-check.
        let _gate = self.reload_gate.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_stale(&self.view.load()) {
            return;
        }
        self.reload();
    }

    fn reload(&self) {
        self.force_reload.store(false, Ordering::Relaxed);
        let old = self.view.load();
        let mtime = current_mtime(&self.path);

        let entries = match std::fs::read_to_string(&self.path) {
            Ok(data) => match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&data) {
                Ok(map) => map,
                Err(e) => {
                    // Keep serving the previous view rather than dropping
                    // every route over a transient editing mistake.
                    warn!(path = %self.path.display(), error = %e, "Route file malformed, keeping previous view");
                    old.entries.clone()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Route file unreadable, keeping previous view");
                old.entries.clone()
            }
        };

        let generation = old.generation + 1;
        self.view.store(Arc::new(FileView {
            entries,
            loaded_at: Instant::now(),
            mtime,
            generation,
        }));
        self.routes.clear();
        self.reloads.fetch_add(1, Ordering::Relaxed);
        debug!(path = %self.path.display(), generation, "Route file reloaded");
    }
}

fn current_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn resolve_value(value: &serde_json::Value) -> Resolved {
    let parsed = match value {
        serde_json::Value::Number(_) | serde_json::Value::String(_) => {
            serde_json::from_value::<Target>(value.clone())
        }
        _ => {
            return Resolved::Invalid {
                raw: value.to_string(),
                reason: "route values must be a port number or string".into(),
            };
        }
    };
    match parsed {
        Ok(target) => Resolved::Found(target.normalize()),
        Err(e) => Resolved::Invalid {
            raw: value.as_str().map(String::from).unwrap_or_else(|| value.to_string()),
            reason: e.to_string(),
        },
    }
}
