use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::DevhostError;
use crate::validate;

/// An upstream target as written in the route file.
///
/// Three spellings are accepted: a bare port, `host:port`, or an absolute
/// `http`/`https` URL. The polymorphism is resolved once at the parse
/// boundary; everything downstream works with the normalized [`Upstream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Port(u16),
    HostPort { host: String, port: u16 },
    Url { scheme: Scheme, host: String, port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A fully-normalized upstream address: scheme + host + port.
///
/// `localhost` has already been rewritten to `127.0.0.1` here; an operator
/// who wants IPv6 loopback writes `[::1]` explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Upstream {
    /// `host:port`, with IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Full base URL, e.g. `http://127.0.0.1:8000`.
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

impl Target {
    /// Parse a route-file value. Fails with a `Validation` error before any
    /// side effect; the route file is never touched with an invalid target.
    pub fn parse(input: &str) -> Result<Self, DevhostError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(DevhostError::Validation("target is empty".into()));
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Target::Port(parse_port(s)?));
        }

        if s.contains("://") {
            return Self::parse_url(s);
        }

        let (host, port) = split_host_port(s)?;
        validate::validate_hostname(&host)?;
        Ok(Target::HostPort { host, port })
    }

    fn parse_url(s: &str) -> Result<Self, DevhostError> {
        let uri: http::Uri = s
            .parse()
            .map_err(|e| DevhostError::Validation(format!("invalid target URL {s:?}: {e}")))?;

        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => {
                return Err(DevhostError::Validation(format!(
                    "unsupported scheme {other:?} (only http and https)"
                )));
            }
            None => {
                return Err(DevhostError::Validation(format!(
                    "target URL {s:?} has no scheme"
                )));
            }
        };

        let authority = uri
            .authority()
            .ok_or_else(|| DevhostError::Validation(format!("target URL {s:?} has no host")))?;
        if authority.as_str().contains('@') {
            return Err(DevhostError::Validation(
                "target URL must not carry credentials".into(),
            ));
        }

        let host = authority.host().trim_matches(['[', ']']).to_string();
        validate::validate_hostname(&host)?;
        let port = match authority.port_u16() {
            Some(0) => {
                return Err(DevhostError::Validation("port must be 1-65535".into()));
            }
            Some(p) => p,
            None => scheme.default_port(),
        };

        Ok(Target::Url { scheme, host, port })
    }

    /// Normalize per the route-store contract: bare ports bind to IPv4
    /// loopback, `host:port` implies `http`, and `localhost` becomes
    /// `127.0.0.1` to avoid IPv6-first resolution surprises.
    pub fn normalize(&self) -> Upstream {
        match self {
            Target::Port(p) => Upstream {
                scheme: Scheme::Http,
                host: "127.0.0.1".to_string(),
                port: *p,
            },
            Target::HostPort { host, port } => Upstream {
                scheme: Scheme::Http,
                host: rewrite_localhost(host),
                port: *port,
            },
            Target::Url { scheme, host, port } => Upstream {
                scheme: *scheme,
                host: rewrite_localhost(host),
                port: *port,
            },
        }
    }
}

fn rewrite_localhost(host: &str) -> String {
    if host.eq_ignore_ascii_case("localhost") {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

fn parse_port(s: &str) -> Result<u16, DevhostError> {
    let port: u32 = s
        .parse()
        .map_err(|_| DevhostError::Validation(format!("invalid port {s:?}")))?;
    if port == 0 || port > 65535 {
        return Err(DevhostError::Validation(format!(
            "port {port} out of range 1-65535"
        )));
    }
    Ok(port as u16)
}

fn split_host_port(s: &str) -> Result<(String, u16), DevhostError> {
    if let Some(rest) = s.strip_prefix('[') {
        // Bracketed IPv6 literal: [::1]:8080
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            DevhostError::Validation(format!("unterminated IPv6 literal in {s:?}"))
        })?;
        let port_str = tail.strip_prefix(':').ok_or_else(|| {
            DevhostError::Validation(format!("missing port in target {s:?}"))
        })?;
        return Ok((host.to_string(), parse_port(port_str)?));
    }

    let (host, port_str) = s
        .rsplit_once(':')
        .ok_or_else(|| DevhostError::Validation(format!("target {s:?} is not a port, host:port, or URL")))?;
    if host.is_empty() {
        return Err(DevhostError::Validation(format!("missing host in {s:?}")));
    }
    Ok((host.to_string(), parse_port(port_str)?))
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Port(p) => write!(f, "{p}"),
            Target::HostPort { host, port } => {
                if host.contains(':') {
                    write!(f, "[{host}]:{port}")
                } else {
                    write!(f, "{host}:{port}")
                }
            }
            Target::Url { scheme, host, port } => {
                if host.contains(':') {
                    write!(f, "{}://[{host}]:{port}", scheme.as_str())
                } else {
                    write!(f, "{}://{host}:{port}", scheme.as_str())
                }
            }
        }
    }
}

// Route-file representation: integers stay integers, everything else is a
// string. This keeps the file hand-editable.

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Target::Port(p) => serializer.serialize_u16(*p),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TargetVisitor;

        impl Visitor<'_> for TargetVisitor {
            type Value = Target;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a port number, \"host:port\", or an http(s) URL")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Target, E> {
                if v == 0 || v > 65535 {
                    return Err(E::custom(format!("port {v} out of range 1-65535")));
                }
                Ok(Target::Port(v as u16))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Target, E> {
                if v <= 0 || v > 65535 {
                    return Err(E::custom(format!("port {v} out of range 1-65535")));
                }
                Ok(Target::Port(v as u16))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Target, E> {
                Target::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(TargetVisitor)
    }
}
