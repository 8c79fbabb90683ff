use std::time::Duration;

use mcm_types::{ConnError, Result};

/// One reaped completion: the slot it belongs to and the byte count moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub slot: u32,
    pub len: u32,
}

/// Descriptor of the single memory region a connection registers: the whole
/// buffer block, carved into equal slots addressed by index.
///
/// The address is carried as an integer so the descriptor stays `Send`;
/// only the provider that accepted the registration turns it back into a
/// pointer, and only while the region is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDesc {
    /// Base address of the block.
    pub addr: u64,
    /// Total length in bytes (`slot_count * slot_size`).
    pub len: usize,
    /// Size of each slot in bytes.
    pub slot_size: usize,
}

impl RegionDesc {
    pub fn slot_count(&self) -> usize {
        if self.slot_size == 0 {
            return 0;
        }
        self.len / self.slot_size
    }

    /// Bounds-check a slot index against this region.
    pub fn check_slot(&self, slot: u32) -> Result<()> {
        if (slot as usize) < self.slot_count() {
            Ok(())
        } else {
            Err(ConnError::BadArgument(format!(
                "slot {} out of range [0, {})",
                slot,
                self.slot_count()
            )))
        }
    }

    /// Raw pointer to the start of `slot`.
    ///
    /// Caller must have bounds-checked the index and must only touch the
    /// slot while it is in the NIC role (posted and not yet completed).
    pub fn slot_ptr(&self, slot: u32) -> *mut u8 {
        (self.addr as usize + slot as usize * self.slot_size) as *mut u8
    }
}

/// A directional fabric endpoint bound to a device and an address pair.
///
/// Implementations are thread-safe: the CQ reaper polls while callers post.
/// Work is addressed by slot index into the one registered region; a slot is
/// owned by the provider from post until the matching completion is reaped.
pub trait Endpoint: Send + Sync {
    /// Register the buffer block as a single region and return its remote
    /// key. At most one region may be registered per endpoint.
    fn register_region(&self, region: RegionDesc) -> Result<u64>;

    /// Post one receive work request for `slot`.
    fn post_recv(&self, slot: u32) -> Result<()>;

    /// Post one send work request for the first `len` bytes of `slot`.
    fn post_send(&self, slot: u32, len: u32) -> Result<()>;

    /// Reap up to `entries.len()` completions, blocking at most `timeout`.
    ///
    /// Returns the number of entries written. Zero means the timeout
    /// expired with nothing to reap; that is not an error.
    fn read_cq(&self, entries: &mut [CqEntry], timeout: Duration) -> Result<usize>;

    /// Cancel outstanding work, deregister the region, and release the
    /// endpoint. Idempotent. Posts after `close` fail; `read_cq` after
    /// `close` returns zero.
    fn close(&self) -> Result<()>;
}
