//! Outbound URL policy.
//!
//! Every base URL the server contacts goes through [`validate`] first. The result is a
//! [`ValidatedUrl`] rebuilt from owned components; the raw input string is never kept.
//! The address check is literal only: hostnames are not resolved, so a permitted name
//! that later resolves to a private address (DNS rebinding) is not caught here.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::Url;

const ALLOWED_PREFIXES: [&str; 2] = ["http://", "https://"];

const BLOCKED_IPV4_RANGES: [(u32, u32); 6] = [
    (ipv4(10, 0, 0, 0), ipv4(10, 255, 255, 255)),
    (ipv4(172, 16, 0, 0), ipv4(172, 31, 255, 255)),
    (ipv4(192, 168, 0, 0), ipv4(192, 168, 255, 255)),
    (ipv4(127, 0, 0, 0), ipv4(127, 255, 255, 255)),
    (ipv4(169, 254, 0, 0), ipv4(169, 254, 255, 255)),
    (ipv4(0, 0, 0, 0), ipv4(0, 255, 255, 255)),
];

const BLOCKED_HOSTNAMES: [&str; 5] = ["localhost", "127.0.0.1", "0.0.0.0", "::", "::1"];

const fn ipv4(a: u8, b: u8, c: u8, d: u8) -> u32 {
    u32::from_be_bytes([a, b, c, d])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPolicy {
    /// Operator-configured services on the local network.
    AllowPrivate,
    /// Anything derived from end-user or third-party input.
    DenyPrivate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlRejection {
    #[error("malformed url: {0}")]
    Malformed(String),
    #[error("scheme not allowed: only http and https are permitted")]
    SchemeNotAllowed,
    #[error("access to private, loopback or unspecified address {host} is not allowed")]
    BlockedAddress { host: String },
}

impl UrlRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::SchemeNotAllowed => "scheme-not-allowed",
            Self::BlockedAddress { .. } => "blocked-address",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn websocket(self) -> &'static str {
        match self {
            Self::Http => "ws",
            Self::Https => "wss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlHost {
    Domain(String),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl fmt::Display for UrlHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(name) => f.write_str(name),
            Self::Ipv4(addr) => write!(f, "{addr}"),
            Self::Ipv6(addr) => write!(f, "[{addr}]"),
        }
    }
}

/// A URL that passed [`validate`], held as independent owned components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    scheme: Scheme,
    host: UrlHost,
    port: Option<u16>,
    path: String,
    query: Option<String>,
}

impl ValidatedUrl {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &UrlHost {
        &self.host
    }

    /// `None` when the scheme's default port is in use.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// `scheme://host[:port]`
    pub fn origin(&self) -> String {
        self.authority_with(self.scheme.as_str())
    }

    /// Origin plus path with trailing slashes removed, ready for appending `/...` paths.
    /// The query component is deliberately not part of the base.
    pub fn base(&self) -> String {
        format!("{}{}", self.origin(), self.path.trim_end_matches('/'))
    }

    /// Same as [`Self::base`] but with the `ws`/`wss` scheme.
    pub fn websocket_base(&self) -> String {
        format!(
            "{}{}",
            self.authority_with(self.scheme.websocket()),
            self.path.trim_end_matches('/')
        )
    }

    fn authority_with(&self, scheme: &str) -> String {
        match self.port {
            Some(port) => format!("{scheme}://{}:{port}", self.host),
            None => format!("{scheme}://{}", self.host),
        }
    }
}

impl fmt::Display for ValidatedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.origin(), self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

pub fn validate(raw: &str, policy: AddressPolicy) -> Result<ValidatedUrl, UrlRejection> {
    if !ALLOWED_PREFIXES.iter().any(|prefix| has_prefix_ignore_case(raw, prefix)) {
        return Err(UrlRejection::SchemeNotAllowed);
    }

    let parsed = Url::parse(raw).map_err(|err| UrlRejection::Malformed(err.to_string()))?;
    let scheme = match parsed.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        _ => return Err(UrlRejection::SchemeNotAllowed),
    };

    let host = match parsed.host() {
        Some(url::Host::Domain(name)) => UrlHost::Domain(name.to_ascii_lowercase()),
        Some(url::Host::Ipv4(addr)) => UrlHost::Ipv4(addr),
        Some(url::Host::Ipv6(addr)) => UrlHost::Ipv6(addr),
        None => return Err(UrlRejection::Malformed("missing host".to_string())),
    };

    if policy == AddressPolicy::DenyPrivate && is_blocked_host(&host) {
        return Err(UrlRejection::BlockedAddress {
            host: host.to_string(),
        });
    }

    Ok(ValidatedUrl {
        scheme,
        host,
        port: parsed.port(),
        path: parsed.path().to_string(),
        query: parsed.query().map(str::to_string),
    })
}

pub fn validate_service_url(raw: &str) -> Result<ValidatedUrl, UrlRejection> {
    validate(raw, AddressPolicy::AllowPrivate)
}

pub fn validate_external_url(raw: &str) -> Result<ValidatedUrl, UrlRejection> {
    validate(raw, AddressPolicy::DenyPrivate)
}

fn has_prefix_ignore_case(raw: &str, prefix: &str) -> bool {
    raw.get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

fn is_blocked_host(host: &UrlHost) -> bool {
    match host {
        UrlHost::Ipv4(addr) => is_blocked_ipv4(*addr),
        UrlHost::Domain(name) => is_blocked_domain(name),
        UrlHost::Ipv6(addr) => {
            let literal = addr.to_string();
            BLOCKED_HOSTNAMES.iter().any(|blocked| literal == *blocked)
        }
    }
}

/// Loopback names, including the fully-qualified `localhost.` form, the reserved
/// `.localhost` zone and wildcard-DNS names that embed a loopback literal.
fn is_blocked_domain(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase();
    BLOCKED_HOSTNAMES.iter().any(|blocked| name == *blocked)
        || name.ends_with(".localhost")
        || name.contains("127.0.0.1")
        || name.contains("0.0.0.0")
}

fn is_blocked_ipv4(addr: Ipv4Addr) -> bool {
    let value = u32::from(addr);
    BLOCKED_IPV4_RANGES
        .iter()
        .any(|(start, end)| value >= *start && value <= *end)
}
