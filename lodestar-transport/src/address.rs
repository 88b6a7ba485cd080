//! Publish-address parsing for sniffed node records
//!
//! Clusters publish their HTTP address as either `ip:port` or
//! `fqdn/ip:port`, where `ip` may be a dotted-quad IPv4 address or a
//! bracketed IPv6 literal.

use regex::Regex;
use std::sync::OnceLock;

/// Structured form of a node's published HTTP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAddress {
    pub fqdn: Option<String>,
    pub ip: String,
    pub port: u16,
}

impl PublishAddress {
    /// Host to dial: the fqdn when the cluster published one, else the ip.
    pub fn host(&self) -> &str {
        self.fqdn.as_deref().unwrap_or(&self.ip)
    }
}

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?P<fqdn>[^/]+)/)?(?P<ip>\[[0-9A-Fa-f:.]+\]|\d{1,3}(?:\.\d{1,3}){3}):(?P<port>\d+)$",
        )
        .expect("publish address pattern is valid")
    })
}

/// Parse `ip:port` or `fqdn/ip:port`. Returns `None` for anything else.
pub fn parse_publish_address(address: &str) -> Option<PublishAddress> {
    let caps = address_regex().captures(address.trim())?;
    let port: u16 = caps.name("port")?.as_str().parse().ok()?;
    Some(PublishAddress {
        fqdn: caps.name("fqdn").map(|m| m.as_str().to_string()),
        ip: caps.name("ip")?.as_str().to_string(),
        port,
    })
}
