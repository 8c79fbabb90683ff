use std::fmt;
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::address::ConnAddr;
use crate::error::{ConnError, Result};

/// Upper bound on a single RDMA transfer (1 GiB).
pub const MAX_TRANSFER_SIZE: usize = 1 << 30;

/// Upper bound on the number of buffer slots per connection.
pub const MAX_QUEUE_SIZE: usize = 1024;

/// Direction of a connection endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Transmitter = 0,
    Receiver = 1,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Transmitter => write!(f, "transmitter"),
            Kind::Receiver => write!(f, "receiver"),
        }
    }
}

/// Control-plane transport protocol requested for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Auto,
    Memif,
    Udp,
    Tcp,
    Http,
    Grpc,
}

impl FromStr for Protocol {
    type Err = ConnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" | "" => Ok(Protocol::Auto),
            "memif" => Ok(Protocol::Memif),
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "http" => Ok(Protocol::Http),
            "grpc" => Ok(Protocol::Grpc),
            other => Err(ConnError::BadArgument(format!(
                "unknown protocol {:?}",
                other
            ))),
        }
    }
}

/// Media payload carried over the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayloadType {
    #[default]
    St20Video,
    St22Video,
    St30Audio,
    St40Ancillary,
    RtspVideo,
}

impl FromStr for PayloadType {
    type Err = ConnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "st20" => Ok(PayloadType::St20Video),
            "st22" => Ok(PayloadType::St22Video),
            "st30" => Ok(PayloadType::St30Audio),
            "st40" => Ok(PayloadType::St40Ancillary),
            "rtsp" => Ok(PayloadType::RtspVideo),
            other => Err(ConnError::BadArgument(format!(
                "unknown payload type {:?}",
                other
            ))),
        }
    }
}

/// RDMA-specific sizing arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaArgs {
    /// Bytes moved per RDMA operation; fixed for the connection lifetime.
    pub transfer_size: usize,

    /// Number of preallocated buffer slots.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_queue_size() -> usize {
    32
}

/// Full parameter block handed to `configure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParam {
    pub kind: Kind,
    pub local_addr: ConnAddr,
    pub remote_addr: ConnAddr,
    pub rdma: RdmaArgs,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub payload_type: PayloadType,
}

impl ConnParam {
    /// Validate every field against the documented bounds.
    ///
    /// Returns `BadArgument` naming the first offending field; the caller's
    /// state must not change on failure.
    pub fn validate(&self) -> Result<()> {
        if self.rdma.transfer_size == 0 || self.rdma.transfer_size > MAX_TRANSFER_SIZE {
            return Err(ConnError::BadArgument(format!(
                "transfer_size {} out of range [1, {}]",
                self.rdma.transfer_size, MAX_TRANSFER_SIZE
            )));
        }
        if self.rdma.queue_size == 0 || self.rdma.queue_size > MAX_QUEUE_SIZE {
            return Err(ConnError::BadArgument(format!(
                "queue_size {} out of range [1, {}]",
                self.rdma.queue_size, MAX_QUEUE_SIZE
            )));
        }
        self.local_addr.validate()?;
        self.remote_addr.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(transfer_size: usize, queue_size: usize) -> ConnParam {
        ConnParam {
            kind: Kind::Receiver,
            local_addr: ConnAddr::new("192.168.1.10", "8001"),
            remote_addr: ConnAddr::new("192.168.1.20", "8002"),
            rdma: RdmaArgs {
                transfer_size,
                queue_size,
            },
            protocol: Protocol::Auto,
            payload_type: PayloadType::St20Video,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(param(1024, 32).validate().is_ok());
        assert!(param(MAX_TRANSFER_SIZE, 1).validate().is_ok());
        assert!(param(1, MAX_QUEUE_SIZE).validate().is_ok());
    }

    #[test]
    fn test_validate_transfer_size_bounds() {
        assert!(param(0, 32).validate().is_err());
        assert!(param(MAX_TRANSFER_SIZE + 1, 32).validate().is_err());
    }

    #[test]
    fn test_validate_queue_size_bounds() {
        assert!(param(1024, 0).validate().is_err());
        assert!(param(1024, MAX_QUEUE_SIZE + 1).validate().is_err());
    }

    #[test]
    fn test_validate_bad_address() {
        let mut p = param(1024, 32);
        p.remote_addr = ConnAddr::new("not-an-ip", "8002");
        assert!(matches!(
            p.validate().unwrap_err(),
            ConnError::BadArgument(_)
        ));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(Kind::Transmitter.to_string(), "transmitter");
        assert_eq!(Kind::Receiver.to_string(), "receiver");
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("memif".parse::<Protocol>().unwrap(), Protocol::Memif);
        assert_eq!("grpc".parse::<Protocol>().unwrap(), Protocol::Grpc);
        assert_eq!("".parse::<Protocol>().unwrap(), Protocol::Auto);
        assert!("quic".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_payload_type_parse() {
        assert_eq!("st20".parse::<PayloadType>().unwrap(), PayloadType::St20Video);
        assert_eq!("st40".parse::<PayloadType>().unwrap(), PayloadType::St40Ancillary);
        assert!("h264".parse::<PayloadType>().is_err());
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{
            "kind": "receiver",
            "local_addr": {"ip": "192.168.1.10", "port": "8001"},
            "remote_addr": {"ip": "192.168.1.20", "port": "8002"},
            "rdma": {"transfer_size": 1048576}
        }"#;
        let p: ConnParam = serde_json::from_str(json).unwrap();
        assert_eq!(p.rdma.queue_size, 32);
        assert_eq!(p.protocol, Protocol::Auto);
        assert_eq!(p.payload_type, PayloadType::St20Video);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_serde_roundtrip() {
        let p = param(4 << 20, 8);
        let json = serde_json::to_string(&p).unwrap();
        let back: ConnParam = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
