use thiserror::Error;

/// Unified error type for Devhost.
#[derive(Error, Debug)]
pub enum DevhostError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown route: {0}")]
    NotFound(String),

    #[error("Blocked by security policy: {0}")]
    SecurityBlock(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Deadline exceeded")]
    Timeout,

    #[error("Integrity drift: {0}")]
    IntegrityDrift(String),

    #[error("Elevated privileges required: {0}")]
    PrivilegeRequired(String),

    #[error("External tool failed: {0}")]
    ExternalTool(String),

    #[error("Concurrent modification: {0}")]
    StateConflict(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("State file error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DevhostError {
    /// Map to the HTTP status code the router answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            DevhostError::NotFound(_) => 404,
            DevhostError::SecurityBlock(_) => 403,
            DevhostError::Validation(_) => 400,
            DevhostError::Timeout => 504,
            DevhostError::Upstream(_) => 502,
            _ => 500,
        }
    }

    /// Map to the control-plane process exit code.
    ///
    /// `0` success, `1` user error, `2` validation, `3` external-tool
    /// failure, `4` integrity drift, `5` privilege required.
    pub fn exit_code(&self) -> i32 {
        match self {
            DevhostError::Validation(_) => 2,
            DevhostError::ExternalTool(_) => 3,
            DevhostError::IntegrityDrift(_) => 4,
            DevhostError::PrivilegeRequired(_) => 5,
            _ => 1,
        }
    }

    /// Short machine-readable reason used in JSON error bodies.
    pub fn reason(&self) -> &'static str {
        match self {
            DevhostError::Validation(_) => "validation",
            DevhostError::NotFound(_) => "not_found",
            DevhostError::SecurityBlock(_) => "blocked",
            DevhostError::Upstream(_) => "upstream",
            DevhostError::Timeout => "timeout",
            DevhostError::IntegrityDrift(_) => "drift",
            DevhostError::PrivilegeRequired(_) => "privilege",
            DevhostError::ExternalTool(_) => "external_tool",
            DevhostError::StateConflict(_) => "conflict",
            DevhostError::Config(_) => "config",
            DevhostError::Io(_) => "io",
            DevhostError::Serde(_) | DevhostError::Yaml(_) => "serde",
        }
    }
}
