use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConnError, Result};

/// Maximum length of the textual IP address, enough for IPv6 with a scope id.
pub const MAX_IP_LEN: usize = 46;

/// Maximum length of the textual port number ("65535" plus terminator room).
pub const MAX_PORT_LEN: usize = 6;

/// A data-plane address as supplied by the control plane: textual IP and
/// port, bounded to the wire-format field sizes.
///
/// The strings are kept verbatim (the control plane round-trips them); use
/// [`ConnAddr::validate`] before handing the address to a fabric provider
/// and [`ConnAddr::to_socket_addr`] to resolve it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnAddr {
    pub ip: String,
    pub port: String,
}

impl ConnAddr {
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: port.into(),
        }
    }

    /// Check field lengths and that both fields parse.
    pub fn validate(&self) -> Result<()> {
        if self.ip.is_empty() || self.ip.len() > MAX_IP_LEN {
            return Err(ConnError::BadArgument(format!(
                "ip length {} out of range [1, {}]",
                self.ip.len(),
                MAX_IP_LEN
            )));
        }
        if self.port.is_empty() || self.port.len() > MAX_PORT_LEN {
            return Err(ConnError::BadArgument(format!(
                "port length {} out of range [1, {}]",
                self.port.len(),
                MAX_PORT_LEN
            )));
        }
        self.ip
            .parse::<IpAddr>()
            .map_err(|_| ConnError::BadArgument(format!("malformed ip {:?}", self.ip)))?;
        self.port
            .parse::<u16>()
            .map_err(|_| ConnError::BadArgument(format!("malformed port {:?}", self.port)))?;
        Ok(())
    }

    /// Resolve to a socket address. Fails with `BadArgument` on malformed
    /// fields, same as `validate`.
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        self.validate()?;
        let ip: IpAddr = self.ip.parse().expect("validated above");
        let port: u16 = self.port.parse().expect("validated above");
        Ok(SocketAddr::new(ip, port))
    }
}

impl fmt::Display for ConnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for ConnAddr {
    type Err = ConnError;

    /// Parse `"ip:port"`. The last colon splits ip from port so plain IPv6
    /// text (no brackets) keeps working.
    fn from_str(s: &str) -> Result<Self> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConnError::BadArgument(format!("missing port in {:?}", s)))?;
        let addr = ConnAddr::new(ip, port);
        addr.validate()?;
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ok() {
        let addr = ConnAddr::new("192.168.1.10", "8001");
        assert!(addr.validate().is_ok());
    }

    #[test]
    fn test_validate_ipv6() {
        let addr = ConnAddr::new("fd00::1", "9000");
        assert!(addr.validate().is_ok());
    }

    #[test]
    fn test_validate_bad_ip() {
        let addr = ConnAddr::new("300.1.1.1", "8001");
        assert!(matches!(
            addr.validate().unwrap_err(),
            ConnError::BadArgument(_)
        ));
    }

    #[test]
    fn test_validate_bad_port() {
        let addr = ConnAddr::new("10.0.0.1", "70000");
        assert!(addr.validate().is_err());

        let addr = ConnAddr::new("10.0.0.1", "");
        assert!(addr.validate().is_err());
    }

    #[test]
    fn test_validate_overlong_ip() {
        let addr = ConnAddr::new("a".repeat(MAX_IP_LEN + 1), "8001");
        assert!(addr.validate().is_err());
    }

    #[test]
    fn test_to_socket_addr() {
        let addr = ConnAddr::new("127.0.0.1", "8002");
        let sa = addr.to_socket_addr().unwrap();
        assert_eq!(sa.port(), 8002);
        assert!(sa.ip().is_loopback());
    }

    #[test]
    fn test_from_str_roundtrip() {
        let addr: ConnAddr = "192.168.96.1:8002".parse().unwrap();
        assert_eq!(addr.ip, "192.168.96.1");
        assert_eq!(addr.port, "8002");
        assert_eq!(addr.to_string(), "192.168.96.1:8002");
    }

    #[test]
    fn test_from_str_no_port() {
        assert!("192.168.96.1".parse::<ConnAddr>().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let addr = ConnAddr::new("10.0.0.2", "8100");
        let json = serde_json::to_string(&addr).unwrap();
        let back: ConnAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
