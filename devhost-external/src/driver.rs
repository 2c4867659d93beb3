use devhost_core::target::Upstream;
use devhost_store::RouteMap;
use devhost_store::state::ProxyDriver;
use std::path::Path;

/// Header every owned snippet starts with. Deterministic on purpose: the
/// same route list always renders to the same bytes.
const SNIPPET_HEADER: &str =
    "# Managed by devhost. Regenerated from the route map; edits are overwritten.\n";

pub const MARKER_BEGIN: &str = "# devhost: begin";
pub const MARKER_END: &str = "# devhost: end";

/// One route as the snippet renderers see it.
#[derive(Debug, Clone)]
pub struct SnippetRoute {
    pub name: String,
    pub hostname: String,
    pub upstream: Upstream,
}

/// Flatten a route map for rendering. `BTreeMap` iteration gives the
/// sorted order the determinism contract requires.
pub fn snippet_routes(routes: &RouteMap, domain: &str) -> Vec<SnippetRoute> {
    routes
        .iter()
        .map(|(name, target)| SnippetRoute {
            name: name.clone(),
            hostname: format!("{name}.{domain}"),
            upstream: target.normalize(),
        })
        .collect()
}

/// Per-driver rendering and tooling knowledge.
pub trait DriverExt {
    fn snippet_filename(&self) -> &'static str;
    fn include_line(&self, snippet: &Path) -> String;
    fn render_snippet(&self, routes: &[SnippetRoute]) -> String;
    fn validate_argv(&self, config: &Path) -> Vec<String>;
}

impl DriverExt for ProxyDriver {
    fn snippet_filename(&self) -> &'static str {
        match self {
            ProxyDriver::Caddy => "devhost.caddy",
            ProxyDriver::Nginx => "devhost.conf",
            ProxyDriver::Traefik => "devhost.yml",
        }
    }

    /// The single directive inside the marker block. Always an absolute
    /// path; never `~` expansion. Traefik attaches through its file
    /// provider instead of an include directive.
    fn include_line(&self, snippet: &Path) -> String {
        match self {
            ProxyDriver::Caddy => format!("import {}", snippet.display()),
            ProxyDriver::Nginx => format!("include {};", snippet.display()),
            ProxyDriver::Traefik => String::new(),
        }
    }

    fn render_snippet(&self, routes: &[SnippetRoute]) -> String {
        match self {
            ProxyDriver::Caddy => render_caddy(routes),
            ProxyDriver::Nginx => render_nginx(routes),
            ProxyDriver::Traefik => render_traefik(routes),
        }
    }

    fn validate_argv(&self, config: &Path) -> Vec<String> {
        let config = config.display().to_string();
        match self {
            ProxyDriver::Caddy => vec![
                "caddy".into(),
                "validate".into(),
                "--config".into(),
                config,
            ],
            ProxyDriver::Nginx => vec!["nginx".into(), "-t".into(), "-c".into(), config],
            // Traefik has no offline validator; a version probe at least
            // catches a missing or broken binary before reload.
            ProxyDriver::Traefik => vec!["traefik".into(), "version".into()],
        }
    }
}

fn upstream_address(up: &Upstream) -> String {
    if up.is_tls() {
        up.url()
    } else {
        up.authority()
    }
}

fn render_caddy(routes: &[SnippetRoute]) -> String {
    let mut out = String::from(SNIPPET_HEADER);
    for route in routes {
        out.push('\n');
        out.push_str(&format!(
            "http://{} {{\n\treverse_proxy {}\n}}\n",
            route.hostname,
            upstream_address(&route.upstream)
        ));
    }
    out
}

fn render_nginx(routes: &[SnippetRoute]) -> String {
    let mut out = String::from(SNIPPET_HEADER);
    for route in routes {
        out.push('\n');
        out.push_str(&format!(
            "server {{\n    listen 80;\n    server_name {};\n\n    location / {{\n        proxy_pass {}://{};\n        proxy_http_version 1.1;\n        proxy_set_header Host $host;\n        proxy_set_header Upgrade $http_upgrade;\n        proxy_set_header Connection \"upgrade\";\n        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n    }}\n}}\n",
            route.hostname,
            route.upstream.scheme.as_str(),
            route.upstream.authority(),
        ));
    }
    out
}

fn render_traefik(routes: &[SnippetRoute]) -> String {
    let mut out = String::from(SNIPPET_HEADER);
    if routes.is_empty() {
        out.push_str("http: {}\n");
        return out;
    }
    out.push_str("http:\n  routers:\n");
    for route in routes {
        out.push_str(&format!(
            "    devhost-{}:\n      rule: Host(`{}`)\n      service: devhost-{}\n",
            route.name, route.hostname, route.name
        ));
    }
    out.push_str("  services:\n");
    for route in routes {
        out.push_str(&format!(
            "    devhost-{}:\n      loadBalancer:\n        servers:\n          - url: {}\n",
            route.name,
            route.upstream.url()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use devhost_core::target::Target;

    fn sample_routes() -> Vec<SnippetRoute> {
        let mut map = RouteMap::new();
        map.insert("web".into(), Target::Port(3000));
        map.insert("api".into(), Target::Port(8000));
        map.insert("db".into(), Target::parse("https://db.test:8443").unwrap());
        snippet_routes(&map, "localhost")
    }

    #[test]
    fn routes_come_out_sorted() {
        let routes = sample_routes();
        let names: Vec<&str> = routes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["api", "db", "web"]);
    }

    #[test]
    fn rendering_is_deterministic() {
        let routes = sample_routes();
        for driver in [ProxyDriver::Caddy, ProxyDriver::Nginx, ProxyDriver::Traefik] {
            let a = driver.render_snippet(&routes);
            let b = driver.render_snippet(&routes);
            assert_eq!(a, b, "{driver} snippet must be byte-stable");
        }
    }

    #[test]
    fn caddy_snippet_shape() {
        let text = ProxyDriver::Caddy.render_snippet(&sample_routes());
        assert!(text.contains("http://api.localhost {"));
        assert!(text.contains("reverse_proxy 127.0.0.1:8000"));
        assert!(text.contains("reverse_proxy https://db.test:8443"));
        assert!(!text.contains('~'), "no tilde expansion anywhere");
    }

    #[test]
    fn nginx_snippet_shape() {
        let text = ProxyDriver::Nginx.render_snippet(&sample_routes());
        assert!(text.contains("server_name api.localhost;"));
        assert!(text.contains("proxy_pass http://127.0.0.1:8000;"));
        assert!(text.contains("proxy_pass https://db.test:8443;"));
        assert!(text.contains("proxy_set_header Upgrade $http_upgrade;"));
    }

    #[test]
    fn traefik_snippet_is_valid_yaml() {
        let text = ProxyDriver::Traefik.render_snippet(&sample_routes());
        let parsed: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(
            parsed["http"]["routers"]["devhost-api"]["rule"],
            serde_yaml::Value::String("Host(`api.localhost`)".into())
        );
        assert_eq!(
            parsed["http"]["services"]["devhost-api"]["loadBalancer"]["servers"][0]["url"],
            serde_yaml::Value::String("http://127.0.0.1:8000".into())
        );
    }

    #[test]
    fn include_lines_use_absolute_paths_verbatim() {
        let snippet = Path::new("/var/lib/devhost/proxy/caddy/devhost.caddy");
        assert_eq!(
            ProxyDriver::Caddy.include_line(snippet),
            "import /var/lib/devhost/proxy/caddy/devhost.caddy"
        );
        assert_eq!(
            ProxyDriver::Nginx.include_line(Path::new("/etc/devhost/devhost.conf")),
            "include /etc/devhost/devhost.conf;"
        );
    }

    #[test]
    fn validator_argv_per_driver() {
        let cfg = Path::new("/etc/caddy/Caddyfile");
        assert_eq!(
            ProxyDriver::Caddy.validate_argv(cfg),
            vec!["caddy", "validate", "--config", "/etc/caddy/Caddyfile"]
        );
        assert_eq!(
            ProxyDriver::Nginx.validate_argv(Path::new("/etc/nginx/nginx.conf")),
            vec!["nginx", "-t", "-c", "/etc/nginx/nginx.conf"]
        );
        assert_eq!(
            ProxyDriver::Traefik.validate_argv(Path::new("/etc/traefik/traefik.yml")),
            vec!["traefik", "version"]
        );
    }

    #[test]
    fn empty_route_list_still_renders_header() {
        for driver in [ProxyDriver::Caddy, ProxyDriver::Nginx, ProxyDriver::Traefik] {
            let text = driver.render_snippet(&[]);
            assert!(text.starts_with(SNIPPET_HEADER));
        }
    }
}
