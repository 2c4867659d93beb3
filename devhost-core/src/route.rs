use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::target::Target;

/// A route record as mirrored into the v3 state file.
///
/// The route file itself stays a flat `name → target` map (the source of
/// truth for the gateway); this record carries the extra metadata the
/// control plane tracks per route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    /// Route name — the leftmost DNS label of the public hostname.
    pub name: String,

    /// Upstream target.
    pub target: Target,

    /// Base host the name is served under.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Disabled routes are kept in the file but never dispatched to.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Free-form labels.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    /// Ordered upstream alternatives, used only by external-proxy snippet
    /// rendering. The gateway always dispatches to the primary target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<UpstreamRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One upstream alternative for external-proxy rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRef {
    pub kind: UpstreamKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Tcp,
    Lan,
    Docker,
    Unix,
}

impl RouteRecord {
    pub fn new(name: impl Into<String>, target: Target) -> Self {
        let now = chrono::Utc::now();
        Self {
            name: name.into(),
            target,
            domain: default_domain(),
            enabled: true,
            tags: BTreeSet::new(),
            upstreams: Vec::new(),
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Public hostname this route answers on.
    pub fn hostname(&self) -> String {
        format!("{}.{}", self.name, self.domain)
    }
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_joins_name_and_domain() {
        let r = RouteRecord::new("api", Target::Port(8000));
        assert_eq!(r.hostname(), "api.localhost");
    }

    #[test]
    fn deserializes_with_defaults() {
        let r: RouteRecord =
            serde_yaml::from_str("name: api\ntarget: 8000\n").unwrap();
        assert_eq!(r.domain, "localhost");
        assert!(r.enabled);
        assert!(r.tags.is_empty());
        assert!(r.upstreams.is_empty());
    }

    #[test]
    fn upstream_kind_round_trips_lowercase() {
        let u = UpstreamRef {
            kind: UpstreamKind::Docker,
            value: "app:3000".into(),
        };
        let yaml = serde_yaml::to_string(&u).unwrap();
        assert!(yaml.contains("docker"));
        let back: UpstreamRef = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, u);
    }
}
