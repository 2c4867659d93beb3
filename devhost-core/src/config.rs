use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::DevhostError;

/// Runtime settings, sourced from `DEVHOST_*` environment variables
/// merged over serde defaults.
///
/// Boolean variables accept `1|true|yes|on` (case-insensitive); anything
/// else is treated as off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the route file (`DEVHOST_CONFIG`); defaults to
    /// `<state_dir>/devhost.json` when unset.
    #[serde(default)]
    pub config: Option<PathBuf>,

    /// State directory (`DEVHOST_STATE_DIR`), default `$HOME/.devhost`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Base domain appended to route names.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Gateway listener address. The default port (7777) is part of the
    /// documented interface and stays above 1024.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Disable the private-network SSRF block (metadata endpoints stay
    /// blocked regardless).
    #[serde(default, deserialize_with = "de_flag")]
    pub allow_private_networks: bool,

    /// Total per-request deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    /// Upper bound on concurrent upstream connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle keepalive connections retained per upstream.
    #[serde(default = "default_keepalive_connections")]
    pub keepalive_connections: usize,

    /// Retry attempts for idempotent-safe upstream dispatch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry spacing in seconds (doubles per attempt).
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,

    /// Log level: DEBUG, INFO, WARNING, ERROR.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit one structured log line per proxied request.
    #[serde(default, deserialize_with = "de_flag")]
    pub log_requests: bool,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Verify upstream TLS certificates.
    #[serde(default = "default_true", deserialize_with = "de_flag")]
    pub verify_certs: bool,

    /// Inject security response headers on proxied responses.
    #[serde(default, deserialize_with = "de_flag")]
    pub security_headers: bool,

    /// Override for the injected `X-Frame-Options` value (empty = omit).
    #[serde(default)]
    pub security_x_frame_options: Option<String>,

    /// Override for the injected `Referrer-Policy` value (empty = omit).
    #[serde(default)]
    pub security_referrer_policy: Option<String>,

    /// Additional redaction patterns, comma-separated in the environment.
    /// These extend the built-in set and can never shrink it.
    #[serde(default, deserialize_with = "de_list")]
    pub redact_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Settings {
    /// Load settings from the environment (`DEVHOST_*`).
    pub fn load() -> Result<Self, DevhostError> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed("DEVHOST_"))
            .extract()
            .map_err(|e| DevhostError::Config(e.to_string()))
    }

    /// Resolved route-file path.
    pub fn route_file(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.state_dir.join("devhost.json"))
    }

    /// Resolved state-file path.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.yaml")
    }

    /// Directory holding timestamped backups of touched files.
    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    /// Total per-request deadline.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.0))
    }

    /// Initial retry spacing.
    pub fn retry_spacing(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay.max(0.0))
    }

    /// Translate `DEVHOST_LOG_LEVEL` into a tracing directive.
    /// `WARNING` is accepted as an alias for `warn`.
    pub fn log_directive(&self) -> String {
        match self.log_level.to_ascii_lowercase().as_str() {
            "debug" => "debug".to_string(),
            "warning" | "warn" => "warn".to_string(),
            "error" => "error".to_string(),
            _ => "info".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config: None,
            state_dir: default_state_dir(),
            domain: default_domain(),
            listen: default_listen(),
            allow_private_networks: false,
            timeout: default_timeout(),
            max_connections: default_max_connections(),
            keepalive_connections: default_keepalive_connections(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            log_level: default_log_level(),
            log_requests: false,
            log_format: LogFormat::Text,
            verify_certs: true,
            security_headers: false,
            security_x_frame_options: None,
            security_referrer_policy: None,
            redact_patterns: vec![],
        }
    }
}

// Serde default functions

fn default_state_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    PathBuf::from(home).join(".devhost")
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:7777".parse().unwrap()
}

fn default_timeout() -> f64 {
    60.0
}

fn default_max_connections() -> usize {
    100
}

fn default_keepalive_connections() -> usize {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_true() -> bool {
    true
}

/// Accept `1|true|yes|on` (any case) as well as native booleans.
fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct FlagVisitor;

    impl serde::de::Visitor<'_> for FlagVisitor {
        type Value = bool;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a boolean flag (1|true|yes|on)")
        }

        fn visit_bool<E>(self, v: bool) -> Result<bool, E> {
            Ok(v)
        }

        fn visit_u64<E>(self, v: u64) -> Result<bool, E> {
            Ok(v != 0)
        }

        fn visit_i64<E>(self, v: i64) -> Result<bool, E> {
            Ok(v != 0)
        }

        fn visit_str<E>(self, v: &str) -> Result<bool, E> {
            Ok(matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ))
        }
    }

    deserializer.deserialize_any(FlagVisitor)
}

/// Accept either a sequence or a comma-separated string.
fn de_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> serde::de::Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a list or comma-separated string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Vec<String>, E> {
            Ok(v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Vec<String>, A::Error>
        where
            A: serde::de::SeqAccess<'de>,
        {
            let mut out = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                out.push(item);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}
