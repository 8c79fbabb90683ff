//! Shared types for the media-proxy data plane.
//!
//! Everything a connection and its collaborators exchange lives here: the
//! error taxonomy, bounded textual addresses, and the parameter block the
//! control plane hands to `configure`.

pub mod address;
pub mod error;
pub mod param;

// Re-export commonly used items at the crate root.
pub use address::{ConnAddr, MAX_IP_LEN, MAX_PORT_LEN};
pub use error::{ConnError, Result};
pub use param::{
    ConnParam, Kind, PayloadType, Protocol, RdmaArgs, MAX_QUEUE_SIZE, MAX_TRANSFER_SIZE,
};
