use devhost_core::Settings;

/// Build the opt-in security response headers.
///
/// Returns an empty list unless `DEVHOST_SECURITY_HEADERS` is on. The list
/// is computed once at startup and injected into every proxied response,
/// with per-header overrides from the environment. An empty override value
/// omits that header.
pub fn build_headers(settings: &Settings) -> Vec<(String, String)> {
    if !settings.security_headers {
        return Vec::new();
    }

    let mut h: Vec<(String, String)> = Vec::with_capacity(4);

    let frame_options = settings
        .security_x_frame_options
        .clone()
        .unwrap_or_else(|| "DENY".to_string());
    if !frame_options.is_empty() {
        h.push(("x-frame-options".into(), frame_options));
    }

    h.push(("x-content-type-options".into(), "nosniff".into()));

    let referrer = settings
        .security_referrer_policy
        .clone()
        .unwrap_or_else(|| "no-referrer".to_string());
    if !referrer.is_empty() {
        h.push(("referrer-policy".into(), referrer));
    }

    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let settings = Settings::default();
        assert!(build_headers(&settings).is_empty());
    }

    #[test]
    fn enabled_injects_defaults() {
        let mut settings = Settings::default();
        settings.security_headers = true;
        let hdrs = build_headers(&settings);
        let get = |k: &str| hdrs.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("x-frame-options"), Some("DENY"));
        assert_eq!(get("x-content-type-options"), Some("nosniff"));
        assert_eq!(get("referrer-policy"), Some("no-referrer"));
    }

    #[test]
    fn per_header_override_and_omission() {
        let mut settings = Settings::default();
        settings.security_headers = true;
        settings.security_x_frame_options = Some("SAMEORIGIN".into());
        settings.security_referrer_policy = Some("".into());
        let hdrs = build_headers(&settings);
        let get = |k: &str| hdrs.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("x-frame-options"), Some("SAMEORIGIN"));
        assert_eq!(get("referrer-policy"), None);
    }
}
