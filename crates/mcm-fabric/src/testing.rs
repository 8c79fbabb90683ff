//! Scriptable fabric doubles.
//!
//! `MockFabric` implements the provider traits entirely in memory with
//! injectable failures and call counters, so connection logic can be tested
//! without hardware or sockets. Shared by unit tests across the workspace.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use mcm_types::{ConnError, Result};

use crate::config::{Direction, EndpointConfig};
use crate::device::{Device, Fabric};
use crate::endpoint::{CqEntry, Endpoint, RegionDesc};

struct MockFabricInner {
    fail_open_device: AtomicBool,
    fail_create_endpoint: AtomicBool,
    fail_register_region: AtomicBool,
    fail_post_send: AtomicBool,
    auto_complete_sends: AtomicBool,
    devices_opened: AtomicUsize,
    live_devices: AtomicUsize,
    next_rkey: AtomicU64,
    endpoints: Mutex<Vec<Arc<MockEndpoint>>>,
}

/// An in-memory fabric with failure injection.
///
/// Clones share state; keep one clone in the test to script and inspect
/// while the code under test holds the other.
#[derive(Clone)]
pub struct MockFabric {
    inner: Arc<MockFabricInner>,
}

impl MockFabric {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        MockFabric {
            inner: Arc::new(MockFabricInner {
                fail_open_device: AtomicBool::new(false),
                fail_create_endpoint: AtomicBool::new(false),
                fail_register_region: AtomicBool::new(false),
                fail_post_send: AtomicBool::new(false),
                auto_complete_sends: AtomicBool::new(true),
                devices_opened: AtomicUsize::new(0),
                live_devices: AtomicUsize::new(0),
                next_rkey: AtomicU64::new(1),
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Type-erase into the provider handle the code under test expects.
    pub fn provider(&self) -> Arc<dyn Fabric> {
        Arc::new(self.clone())
    }

    pub fn fail_open_device(&self, fail: bool) {
        self.inner.fail_open_device.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create_endpoint(&self, fail: bool) {
        self.inner.fail_create_endpoint.store(fail, Ordering::SeqCst);
    }

    pub fn fail_register_region(&self, fail: bool) {
        self.inner.fail_register_region.store(fail, Ordering::SeqCst);
    }

    pub fn fail_post_send(&self, fail: bool) {
        self.inner.fail_post_send.store(fail, Ordering::SeqCst);
    }

    /// When set (the default), every `post_send` immediately queues its
    /// completion, emulating a fabric that keeps up with the sender.
    pub fn auto_complete_sends(&self, on: bool) {
        self.inner.auto_complete_sends.store(on, Ordering::SeqCst);
    }

    /// Total devices ever opened.
    pub fn devices_opened(&self) -> usize {
        self.inner.devices_opened.load(Ordering::SeqCst)
    }

    /// Devices currently held by at least one `Arc`.
    pub fn live_devices(&self) -> usize {
        self.inner.live_devices.load(Ordering::SeqCst)
    }

    /// Every endpoint ever created, in creation order.
    pub fn endpoints(&self) -> Vec<Arc<MockEndpoint>> {
        self.inner.endpoints.lock().clone()
    }

    /// The single endpoint, when the test created exactly one.
    pub fn endpoint(&self) -> Arc<MockEndpoint> {
        let endpoints = self.inner.endpoints.lock();
        assert_eq!(endpoints.len(), 1, "expected exactly one endpoint");
        endpoints[0].clone()
    }
}

impl Fabric for MockFabric {
    fn open_device(&self, dev_port: &str) -> Result<Arc<dyn Device>> {
        if self.inner.fail_open_device.load(Ordering::SeqCst) {
            return Err(ConnError::InitializationFailed(
                "injected device failure".into(),
            ));
        }
        self.inner.devices_opened.fetch_add(1, Ordering::SeqCst);
        self.inner.live_devices.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockDevice {
            dev_port: dev_port.to_string(),
            fabric: Arc::clone(&self.inner),
        }))
    }
}

struct MockDevice {
    dev_port: String,
    fabric: Arc<MockFabricInner>,
}

impl Device for MockDevice {
    fn dev_port(&self) -> &str {
        &self.dev_port
    }

    fn create_endpoint(&self, cfg: &EndpointConfig) -> Result<Arc<dyn Endpoint>> {
        if self.fabric.fail_create_endpoint.load(Ordering::SeqCst) {
            return Err(ConnError::InitializationFailed(
                "injected endpoint failure".into(),
            ));
        }
        let endpoint = Arc::new(MockEndpoint {
            dir: cfg.dir,
            fabric: Arc::clone(&self.fabric),
            closed: AtomicBool::new(false),
            state: Mutex::new(MockEpState {
                region: None,
                deregistered: false,
                outstanding_recv: VecDeque::new(),
                recv_posts: 0,
                sends: Vec::new(),
                completions: VecDeque::new(),
            }),
            cq_cond: Condvar::new(),
        });
        self.fabric.endpoints.lock().push(Arc::clone(&endpoint));
        Ok(endpoint)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.fabric.live_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockEpState {
    region: Option<RegionDesc>,
    deregistered: bool,
    outstanding_recv: VecDeque<u32>,
    recv_posts: usize,
    sends: Vec<(u32, u32)>,
    completions: VecDeque<CqEntry>,
}

/// One endpoint created by a [`MockFabric`] device.
pub struct MockEndpoint {
    dir: Direction,
    fabric: Arc<MockFabricInner>,
    closed: AtomicBool,
    state: Mutex<MockEpState>,
    cq_cond: Condvar,
}

impl MockEndpoint {
    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a region was registered and later deregistered by `close`.
    pub fn region_deregistered(&self) -> bool {
        self.state.lock().deregistered
    }

    /// Total receive posts ever made.
    pub fn recv_post_count(&self) -> usize {
        self.state.lock().recv_posts
    }

    /// Receive posts not yet completed.
    pub fn outstanding_recv(&self) -> usize {
        self.state.lock().outstanding_recv.len()
    }

    /// Every send post ever made, as (slot, len).
    pub fn sends(&self) -> Vec<(u32, u32)> {
        self.state.lock().sends.clone()
    }

    /// Inject an arbitrary completion and wake the reaper.
    pub fn push_completion(&self, entry: CqEntry) {
        let mut state = self.state.lock();
        state.completions.push_back(entry);
        drop(state);
        self.cq_cond.notify_all();
    }

    /// Complete the oldest outstanding receive post with `data`, writing it
    /// into the slot's memory. Returns the slot index, or `None` when no
    /// receive is outstanding.
    pub fn complete_next_recv(&self, data: &[u8]) -> Option<u32> {
        let mut state = self.state.lock();
        let region = state.region?;
        let slot = state.outstanding_recv.pop_front()?;
        assert!(
            data.len() <= region.slot_size,
            "test data exceeds slot size"
        );
        // Acting as the DMA engine for a slot in the NIC role.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), region.slot_ptr(slot), data.len());
        }
        state.completions.push_back(CqEntry {
            slot,
            len: data.len() as u32,
        });
        drop(state);
        self.cq_cond.notify_all();
        Some(slot)
    }
}

impl Endpoint for MockEndpoint {
    fn register_region(&self, region: RegionDesc) -> Result<u64> {
        if self.fabric.fail_register_region.load(Ordering::SeqCst) {
            return Err(ConnError::MemoryRegistrationFailed(
                "injected registration failure".into(),
            ));
        }
        let mut state = self.state.lock();
        if state.region.is_some() {
            return Err(ConnError::AlreadyInitialized);
        }
        state.region = Some(region);
        Ok(self.fabric.next_rkey.fetch_add(1, Ordering::Relaxed))
    }

    fn post_recv(&self, slot: u32) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnError::ReceiveFailed("endpoint closed".into()));
        }
        let mut state = self.state.lock();
        let region = state
            .region
            .ok_or_else(|| ConnError::ReceiveFailed("no region registered".into()))?;
        region.check_slot(slot)?;
        state.outstanding_recv.push_back(slot);
        state.recv_posts += 1;
        Ok(())
    }

    fn post_send(&self, slot: u32, len: u32) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnError::SendFailed("endpoint closed".into()));
        }
        if self.fabric.fail_post_send.load(Ordering::SeqCst) {
            return Err(ConnError::SendFailed("injected post failure".into()));
        }
        let mut state = self.state.lock();
        let region = state
            .region
            .ok_or_else(|| ConnError::SendFailed("no region registered".into()))?;
        region.check_slot(slot)?;
        state.sends.push((slot, len));
        if self.fabric.auto_complete_sends.load(Ordering::SeqCst) {
            state.completions.push_back(CqEntry { slot, len });
            drop(state);
            self.cq_cond.notify_all();
        }
        Ok(())
    }

    fn read_cq(&self, entries: &mut [CqEntry], timeout: Duration) -> Result<usize> {
        if entries.is_empty() || self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let mut n = 0;
            while n < entries.len() {
                match state.completions.pop_front() {
                    Some(entry) => {
                        entries[n] = entry;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n > 0 {
                return Ok(n);
            }
            if self.closed.load(Ordering::SeqCst)
                || self.cq_cond.wait_until(&mut state, deadline).timed_out()
            {
                return Ok(0);
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.region.take().is_some() {
            state.deregistered = true;
        }
        state.outstanding_recv.clear();
        state.completions.clear();
        drop(state);
        self.cq_cond.notify_all();
        Ok(())
    }
}
