use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use mcm_concurrency::Context;
use mcm_fabric::{RegionDesc, PAGE_SIZE};
use mcm_types::{ConnError, Result};

/// One contiguous, page-aligned allocation of `slot_count * slot_size`
/// bytes, registered with the fabric as a single region and carved into
/// equal slots.
///
/// The block itself is inert storage. At any instant each slot is in exactly
/// one role: free in the pool, posted to the fabric, or held by a caller;
/// the posting rules in the connection enforce that, which is what makes the
/// raw accessors below sound.
pub struct BufferBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    slot_size: usize,
    slot_count: usize,
}

// Slots are handed across threads by index; access is serialized per slot
// by the role rules above.
unsafe impl Send for BufferBlock {}
unsafe impl Sync for BufferBlock {}

impl BufferBlock {
    /// Allocate a zeroed block. The fabric provider pins the pages when the
    /// region is registered.
    pub fn allocate(slot_count: usize, slot_size: usize) -> Result<Self> {
        if slot_count == 0 || slot_size == 0 {
            return Err(ConnError::BadArgument(
                "buffer block dimensions must be non-zero".into(),
            ));
        }
        let len = slot_count
            .checked_mul(slot_size)
            .ok_or(ConnError::OutOfMemory)?;
        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|e| ConnError::BadArgument(format!("bad block layout: {}", e)))?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(ConnError::OutOfMemory)?;
        Ok(BufferBlock {
            ptr,
            layout,
            slot_size,
            slot_count,
        })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Descriptor handed to `Endpoint::register_region`.
    pub fn region(&self) -> RegionDesc {
        RegionDesc {
            addr: self.ptr.as_ptr() as u64,
            len: self.len(),
            slot_size: self.slot_size,
        }
    }

    fn slot_ptr(&self, slot: u32) -> *mut u8 {
        assert!((slot as usize) < self.slot_count, "slot {} out of range", slot);
        unsafe { self.ptr.as_ptr().add(slot as usize * self.slot_size) }
    }

    /// Copy `data` into the start of `slot`.
    ///
    /// Caller must hold the slot exclusively (acquired from the pool and not
    /// yet posted).
    pub fn write_slot(&self, slot: u32, data: &[u8]) {
        assert!(data.len() <= self.slot_size, "payload exceeds slot size");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.slot_ptr(slot), data.len());
        }
    }

    /// View the first `len` bytes of `slot`.
    ///
    /// Caller must hold the slot exclusively (a reaped completion whose slot
    /// has not been reposted or released).
    pub fn read_slot(&self, slot: u32, len: usize) -> &[u8] {
        assert!(len <= self.slot_size, "read exceeds slot size");
        unsafe { std::slice::from_raw_parts(self.slot_ptr(slot), len) }
    }
}

impl Drop for BufferBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct PoolState {
    free: VecDeque<u32>,
    closed: bool,
}

/// The free-slot queue: fixed capacity, blocking acquire, broadcast release.
///
/// Ordering is whatever the fabric completes; no fairness between waiters.
pub struct BufferPool {
    capacity: usize,
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl BufferPool {
    /// Create a pool seeded with every slot `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        BufferPool {
            capacity,
            state: Mutex::new(PoolState {
                free: (0..capacity as u32).collect(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn free_len(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Take one slot, blocking while the pool is empty.
    ///
    /// Re-checks `ctx` at least every `poll_timeout`, so cancellation is
    /// observed within one poll interval. Returns `Cancelled` on context
    /// cancellation or pool closure.
    pub fn acquire(&self, ctx: &Context, poll_timeout: Duration) -> Result<u32> {
        let mut state = self.state.lock();
        loop {
            if state.closed || ctx.is_cancelled() {
                return Err(ConnError::Cancelled);
            }
            if let Some(slot) = state.free.pop_front() {
                return Ok(slot);
            }
            self.cond.wait_for(&mut state, poll_timeout);
        }
    }

    /// Take one slot without blocking.
    pub fn try_acquire(&self) -> Option<u32> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.free.pop_front()
    }

    /// Return a slot and wake every waiter.
    pub fn release(&self, slot: u32) {
        let mut state = self.state.lock();
        debug_assert!((slot as usize) < self.capacity, "foreign slot released");
        debug_assert!(
            !state.free.contains(&slot),
            "slot {} released while already free",
            slot
        );
        state.free.push_back(slot);
        drop(state);
        self.cond.notify_all();
    }

    /// Refuse further acquires and wake blocked waiters; releases still
    /// land so in-flight completions can drain.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Drop every queued slot. Only called after the workers have joined,
    /// so there is nobody left to wake.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.free.clear();
    }
}
