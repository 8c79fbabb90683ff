use std::time::Duration;

use serde::{Deserialize, Serialize};

use mcm_types::ConnAddr;

/// Maximum completions drained from a CQ per poll iteration.
pub const CQ_BATCH_SIZE: usize = 64;

/// Default CQ poll timeout. Short so workers re-check cancellation promptly.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Alignment of the buffer block; registration wants page-aligned memory.
pub const PAGE_SIZE: usize = 4096;

/// Which way an endpoint moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Transmit,
    Receive,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Transmit => write!(f, "tx"),
            Direction::Receive => write!(f, "rx"),
        }
    }
}

/// Everything a device needs to create one endpoint: the direction decides
/// the CQ binding, the address pair names both ends of the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub dir: Direction,
    pub local_addr: ConnAddr,
    pub remote_addr: ConnAddr,
}
