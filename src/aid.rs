//! Actor addresses: `name@[proto://]ip:port`

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, ToSocketAddrs};

pub const BUS_TCP: &str = "tcp";
pub const BUS_UDP: &str = "udp";

const URL_PROTOCOL_SEPARATOR: &str = "://";

/// Address of an actor: a logical name plus the url of the bus hosting it.
///
/// The url normalizes to `ip:port` for TCP and keeps an explicit
/// `proto://ip:port` form for every other protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aid {
    name: String,
    url: String,
}

impl Aid {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut aid = Self {
            name: name.into(),
            url: url.into(),
        };
        aid.unfix_protocol();
        aid
    }

    /// Parses `name@url`. Input without a `@` is taken as a bare name.
    pub fn parse(s: &str) -> Self {
        match s.split_once('@') {
            Some((name, url)) => Self::new(name, url),
            None => Self {
                name: s.to_string(),
                url: String::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
        self.unfix_protocol();
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Protocol prefix of the url; absent means TCP.
    pub fn protocol(&self) -> &str {
        match self.url.find(URL_PROTOCOL_SEPARATOR) {
            Some(index) => &self.url[..index],
            None => BUS_TCP,
        }
    }

    /// Host component of the url. Bracketed IPv6 literals keep their brackets.
    pub fn ip(&self) -> &str {
        let start = self
            .url
            .find(URL_PROTOCOL_SEPARATOR)
            .map(|i| i + URL_PROTOCOL_SEPARATOR.len())
            .unwrap_or(0);
        match self.url.rfind(':') {
            Some(end) if end >= start => &self.url[start..end],
            _ => &self.url[start..],
        }
    }

    /// Port component of the url; 0 when absent or unparseable.
    pub fn port(&self) -> u16 {
        self.url
            .rfind(':')
            .and_then(|i| self.url[i + 1..].parse().ok())
            .unwrap_or(0)
    }

    /// `ip:port` with any protocol prefix stripped.
    pub fn unfix_url(&self) -> String {
        format!("{}:{}", self.ip(), self.port())
    }

    /// Canonical `name@ip:port` form, the total order used for map keys.
    pub fn hash_string(&self) -> String {
        format!("{}@{}", self.name, self.unfix_url())
    }

    /// Validates the address: non-empty name, known protocol, port in
    /// (0, 65535), and a host that is an IP literal or resolves.
    pub fn ok(&self) -> bool {
        let proto_ok = matches!(self.protocol(), BUS_TCP | BUS_UDP);
        let port = self.port();
        let port_ok = port > 0 && port < u16::MAX;
        if !proto_ok || !port_ok || self.name.is_empty() {
            return false;
        }
        let host = self.ip();
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<IpAddr>().is_ok() {
            return true;
        }
        // Fall back to resolution for DNS names.
        match (bare, 0u16).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(_) => false,
        }
    }

    fn unfix_protocol(&mut self) {
        if let Some(index) = self.url.find(URL_PROTOCOL_SEPARATOR) {
            if &self.url[..index] == BUS_TCP {
                self.url = self.url[index + URL_PROTOCOL_SEPARATOR.len()..].to_string();
            }
        }
    }
}

impl fmt::Display for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.url)
    }
}

impl From<&str> for Aid {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Aid {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl PartialEq for Aid {
    fn eq(&self, other: &Self) -> bool {
        if self.protocol() == BUS_TCP && other.protocol() == BUS_TCP {
            // http-style urls carry no protocol field, so compare normalized
            self.name == other.name && self.unfix_url() == other.unfix_url()
        } else {
            self.name == other.name && self.url == other.url
        }
    }
}

impl Eq for Aid {}

impl Hash for Aid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_string().hash(state);
    }
}

impl PartialOrd for Aid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Aid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash_string().cmp(&other.hash_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_name_and_url() {
        let aid = Aid::parse("worker@tcp://127.0.0.1:2223");
        assert_eq!(aid.name(), "worker");
        assert_eq!(aid.url(), "127.0.0.1:2223");
        assert_eq!(aid.protocol(), "tcp");
        assert_eq!(aid.ip(), "127.0.0.1");
        assert_eq!(aid.port(), 2223);
        assert!(aid.ok());
    }

    #[test]
    fn parse_bare_name() {
        let aid = Aid::parse("worker");
        assert_eq!(aid.name(), "worker");
        assert_eq!(aid.url(), "");
        assert!(!aid.ok());
    }

    #[test]
    fn udp_url_keeps_protocol() {
        let aid = Aid::parse("worker@udp://10.0.0.1:80");
        assert_eq!(aid.url(), "udp://10.0.0.1:80");
        assert_eq!(aid.protocol(), "udp");
        assert_eq!(aid.ip(), "10.0.0.1");
        assert_eq!(aid.port(), 80);
        assert!(aid.ok());
    }

    #[test]
    fn ipv6_bracketed() {
        let aid = Aid::parse("worker@[::1]:9000");
        assert_eq!(aid.ip(), "[::1]");
        assert_eq!(aid.port(), 9000);
        assert!(aid.ok());
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(!Aid::parse("worker@127.0.0.1:0").ok());
        assert!(!Aid::parse("worker@127.0.0.1:65535").ok());
        assert!(!Aid::parse("@127.0.0.1:80").ok());
        assert!(!Aid::parse("worker@ftp://127.0.0.1:80").ok());
        assert!(!Aid::parse("worker@no-such-host.invalid:80").ok());
    }

    #[test]
    fn tcp_equality_normalizes() {
        let a = Aid::parse("worker@tcp://127.0.0.1:80");
        let b = Aid::parse("worker@127.0.0.1:80");
        assert_eq!(a, b);
        assert_eq!(a.hash_string(), b.hash_string());
        assert_ne!(a, Aid::parse("other@127.0.0.1:80"));
        assert_ne!(a, Aid::parse("worker@127.0.0.1:81"));
    }

    #[test]
    fn hash_string_orders() {
        let a = Aid::parse("a@1.1.1.1:1");
        let b = Aid::parse("b@1.1.1.1:1");
        assert!(a < b);
        assert_eq!(a.hash_string(), "a@1.1.1.1:1");
    }
}
