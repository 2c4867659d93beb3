use crate::error::DevhostError;

/// Route names that collide with the router's own endpoints and can never
/// be registered.
pub const RESERVED_NAMES: &[&str] = &["health", "metrics", "routes", "mappings"];

/// Validate a route name: 1..=63 chars of `[a-z0-9-]`, no leading or
/// trailing hyphen, not a reserved name.
pub fn validate_route_name(name: &str) -> Result<(), DevhostError> {
    if name.is_empty() || name.len() > 63 {
        return Err(DevhostError::Validation(format!(
            "route name must be 1-63 characters, got {}",
            name.len()
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(DevhostError::Validation(format!(
            "route name {name:?} may only contain [a-z0-9-]"
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(DevhostError::Validation(format!(
            "route name {name:?} must not start or end with a hyphen"
        )));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(DevhostError::Validation(format!(
            "route name {name:?} is reserved"
        )));
    }
    Ok(())
}

/// Validate a hostname against the RFC 1123 subset the router accepts.
///
/// IP literals (v4 and v6) pass. Otherwise: total length ≤ 253, labels
/// 1..=63 chars of `[A-Za-z0-9-]` with no leading/trailing hyphen. Control
/// bytes (`\r`, `\n`, `\0`) and empty labels (`..`) are rejected outright.
pub fn validate_hostname(host: &str) -> Result<(), DevhostError> {
    if host.is_empty() {
        return Err(DevhostError::Validation("hostname is empty".into()));
    }
    if host.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(DevhostError::Validation(
            "hostname contains control bytes".into(),
        ));
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    if host.len() > 253 {
        return Err(DevhostError::Validation(format!(
            "hostname exceeds 253 characters ({})",
            host.len()
        )));
    }
    if host.contains("..") {
        return Err(DevhostError::Validation(
            "hostname contains an empty label".into(),
        ));
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(DevhostError::Validation(format!(
                "hostname label {label:?} must be 1-63 characters"
            )));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(DevhostError::Validation(format!(
                "hostname label {label:?} may only contain [A-Za-z0-9-]"
            )));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(DevhostError::Validation(format!(
                "hostname label {label:?} must not start or end with a hyphen"
            )));
        }
    }
    Ok(())
}

pub fn is_valid_hostname(host: &str) -> bool {
    validate_hostname(host).is_ok()
}
