//! Network addresses, as carried by registry entries and handed to
//! connectors. Deliberately a plain value type (host string + port) rather
//! than `std::net::SocketAddr` since registry entries are exchanged as JSON
//! `"host:port"` strings over the wire (spec §3).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NetAddr {
    pub host: String,
    pub port: u16,
}

impl NetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NetAddr { host: host.into(), port }
    }

    pub fn is_valid(&self) -> bool {
        self.port > 0 && !self.host.is_empty() && self.host.parse::<std::net::Ipv4Addr>().is_ok()
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct AddrParseError(String);

impl FromStr for NetAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError(s.to_owned()))?;
        let port: u16 = port.parse().map_err(|_| AddrParseError(s.to_owned()))?;
        if host.is_empty() {
            return Err(AddrParseError(s.to_owned()));
        }
        Ok(NetAddr { host: host.to_owned(), port })
    }
}

impl From<NetAddr> for String {
    fn from(addr: NetAddr) -> String {
        addr.to_string()
    }
}

impl TryFrom<String> for NetAddr {
    type Error = AddrParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let addr: NetAddr = "127.0.0.1:10101".parse().unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 10101);
        assert!(addr.is_valid());
    }

    #[test]
    fn rejects_missing_port() {
        assert!("127.0.0.1".parse::<NetAddr>().is_err());
    }

    #[test]
    fn rejects_non_ipv4_host_as_invalid() {
        let addr = NetAddr::new("not-an-ip", 80);
        assert!(!addr.is_valid());
    }

    #[test]
    fn round_trips_through_display_and_parse() {
        let addr = NetAddr::new("10.0.0.5", 9000);
        let again: NetAddr = addr.to_string().parse().unwrap();
        assert_eq!(addr, again);
    }
}
