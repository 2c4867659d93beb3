use dashmap::DashMap;
use devhost_core::target::Upstream;
use devhost_core::validate;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why an upstream was refused. `code()` is the string surfaced in the
/// 403 body and in the `ssrf_blocks` metric breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Scheme,
    Hostname,
    Port,
    MetadataEndpoint,
    PrivateNetwork,
}

impl BlockReason {
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::Scheme => "scheme",
            BlockReason::Hostname => "hostname",
            BlockReason::Port => "port",
            BlockReason::MetadataEndpoint => "metadata_endpoint",
            BlockReason::PrivateNetwork => "private_network",
        }
    }
}

/// Classify a route-file value that failed target parsing.
///
/// Non-http schemes are rejected before a target ever reaches
/// [`UpstreamGuard::check`] (the parse boundary refuses them), but the
/// policy language — which rejection code a client sees — stays here with
/// the rest of the guard. A URL with a scheme outside http/https reports
/// `scheme`; anything else is a hostname problem.
pub fn classify_invalid_target(raw: &str) -> BlockReason {
    match raw.split_once("://") {
        Some((scheme, _)) if !matches!(scheme, "http" | "https") => BlockReason::Scheme,
        _ => BlockReason::Hostname,
    }
}

/// Cloud metadata addresses. Blocked unconditionally, even when the
/// private-network override is on.
static METADATA_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    ["169.254.169.254/32", "169.254.169.253/32"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect()
});

/// Hostnames that are metadata endpoints regardless of what they resolve to.
const METADATA_HOSTS: &[&str] = &["metadata.google.internal"];

/// RFC 1918 + link-local + ULA ranges, blocked unless the operator opts in.
static PRIVATE_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|s| s.parse().unwrap())
    .collect()
});

const DECISION_TTL: Duration = Duration::from_secs(30);

struct CachedDecision {
    verdict: Result<(), BlockReason>,
    at: Instant,
}

/// Validates upstream addresses before every forwarded request.
///
/// Decisions are cached by `(host, port)`; the policy (private-network
/// override) is fixed per guard instance, so it is not part of the key.
pub struct UpstreamGuard {
    allow_private: bool,
    cache: DashMap<(String, u16), CachedDecision>,
}

impl UpstreamGuard {
    pub fn new(allow_private: bool) -> Self {
        Self {
            allow_private,
            cache: DashMap::new(),
        }
    }

    pub fn allows_private_networks(&self) -> bool {
        self.allow_private
    }

    /// Check a normalized upstream. Loopback is always allowed; metadata
    /// endpoints never are.
    pub async fn check(&self, upstream: &Upstream) -> Result<(), BlockReason> {
        let key = (upstream.host.clone(), upstream.port);
        if let Some(hit) = self.cache.get(&key)
            && hit.at.elapsed() < DECISION_TTL
        {
            return hit.verdict;
        }

        let verdict = self.evaluate(upstream).await;
        if let Err(reason) = verdict {
            warn!(
                host = %upstream.host,
                port = upstream.port,
                reason = reason.code(),
                "Upstream blocked"
            );
        }
        self.cache.insert(
            key,
            CachedDecision {
                verdict,
                at: Instant::now(),
            },
        );
        verdict
    }

    async fn evaluate(&self, upstream: &Upstream) -> Result<(), BlockReason> {
        if upstream.port == 0 {
            return Err(BlockReason::Port);
        }
        if validate::validate_hostname(&upstream.host).is_err() {
            return Err(BlockReason::Hostname);
        }
        if METADATA_HOSTS
            .iter()
            .any(|h| upstream.host.eq_ignore_ascii_case(h))
        {
            return Err(BlockReason::MetadataEndpoint);
        }

        for ip in self.resolve(upstream).await {
            if ip.is_loopback() {
                continue;
            }
            if METADATA_NETS.iter().any(|net| net.contains(&ip)) {
                return Err(BlockReason::MetadataEndpoint);
            }
            if !self.allow_private && PRIVATE_NETS.iter().any(|net| net.contains(&ip)) {
                return Err(BlockReason::PrivateNetwork);
            }
        }
        Ok(())
    }

    /// Resolve the upstream host to candidate addresses. IP literals skip
    /// DNS entirely. Resolution failure yields no addresses; the dispatch
    /// path will surface the connect error as a 502.
    async fn resolve(&self, upstream: &Upstream) -> Vec<IpAddr> {
        if let Ok(ip) = upstream.host.parse::<IpAddr>() {
            return vec![ip];
        }
        match tokio::net::lookup_host((upstream.host.as_str(), upstream.port)).await {
            Ok(addrs) => addrs.map(|sa| sa.ip()).collect(),
            Err(e) => {
                debug!(host = %upstream.host, error = %e, "Upstream resolve failed");
                Vec::new()
            }
        }
    }
}
