//! UDP-backed software provider.
//!
//! A userspace stand-in for an RDMA fabric, for hosts without RDMA hardware:
//! memory registration hands out synthetic rkeys, sends travel as UDP
//! datagrams, and the completion queue is emulated in process. Frames larger
//! than one datagram are fragmented with a 12-byte little-endian header
//! `[seq:u32][offset:u32][total:u32]` and reassembled into the posted slot.
//!
//! Simplifications versus real hardware, acceptable for a software path:
//! fragments of one frame are reassembled by sequence number only (a lost
//! tail stalls until the next frame's first fragment arrives), duplicate
//! fragments are not detected, and source-address filtering is left to the
//! control plane.

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use mcm_types::{ConnError, Result};

use crate::config::{Direction, EndpointConfig};
use crate::device::{Device, Fabric};
use crate::endpoint::{CqEntry, Endpoint, RegionDesc};

const FRAG_HEADER_SIZE: usize = 12;

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM: usize = 65507;

const MAX_FRAG_PAYLOAD: usize = MAX_DATAGRAM - FRAG_HEADER_SIZE;

/// Synthetic rkey source, shared across all endpoints in the process.
static NEXT_RKEY: AtomicU64 = AtomicU64::new(1);

/// The UDP software fabric.
pub struct UdpFabric;

impl UdpFabric {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        UdpFabric
    }
}

impl Fabric for UdpFabric {
    fn open_device(&self, dev_port: &str) -> Result<Arc<dyn Device>> {
        // No hardware behind this provider; the port string is carried for
        // registry keying and logging only.
        Ok(Arc::new(UdpDevice {
            dev_port: dev_port.to_string(),
        }))
    }
}

struct UdpDevice {
    dev_port: String,
}

impl Device for UdpDevice {
    fn dev_port(&self) -> &str {
        &self.dev_port
    }

    fn create_endpoint(&self, cfg: &EndpointConfig) -> Result<Arc<dyn Endpoint>> {
        let remote = cfg.remote_addr.to_socket_addr()?;
        let socket = match cfg.dir {
            Direction::Receive => {
                let local = cfg.local_addr.to_socket_addr()?;
                UdpSocket::bind(local).map_err(|e| {
                    ConnError::InitializationFailed(format!("bind {}: {}", local, e))
                })?
            }
            Direction::Transmit => {
                let any: SocketAddr = if remote.is_ipv4() {
                    "0.0.0.0:0".parse().expect("static addr")
                } else {
                    "[::]:0".parse().expect("static addr")
                };
                let socket = UdpSocket::bind(any).map_err(|e| {
                    ConnError::InitializationFailed(format!("bind ephemeral: {}", e))
                })?;
                socket.connect(remote).map_err(|e| {
                    ConnError::InitializationFailed(format!("connect {}: {}", remote, e))
                })?;
                socket
            }
        };
        tracing::debug!(dev_port = %self.dev_port, dir = %cfg.dir, "created udp endpoint");
        Ok(Arc::new(UdpEndpoint {
            dir: cfg.dir,
            socket,
            next_seq: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            state: Mutex::new(EpState {
                region: None,
                posted_rx: VecDeque::new(),
                completions: VecDeque::new(),
                assembly: None,
            }),
            cq_cond: Condvar::new(),
        }))
    }
}

struct Assembly {
    seq: u32,
    slot: u32,
    received: usize,
    total: usize,
}

struct EpState {
    region: Option<RegionDesc>,
    posted_rx: VecDeque<u32>,
    completions: VecDeque<CqEntry>,
    assembly: Option<Assembly>,
}

struct UdpEndpoint {
    dir: Direction,
    socket: UdpSocket,
    next_seq: AtomicU32,
    closed: AtomicBool,
    state: Mutex<EpState>,
    cq_cond: Condvar,
}

impl UdpEndpoint {
    fn drain(&self, state: &mut EpState, entries: &mut [CqEntry]) -> usize {
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
        n
    }

    /// Feed one received datagram into the reassembly state.
    fn ingest(&self, state: &mut EpState, datagram: &[u8]) {
        if datagram.len() < FRAG_HEADER_SIZE {
            tracing::trace!(len = datagram.len(), "runt datagram dropped");
            return;
        }
        let seq = u32::from_le_bytes(datagram[0..4].try_into().expect("sized"));
        let offset = u32::from_le_bytes(datagram[4..8].try_into().expect("sized")) as usize;
        let total = u32::from_le_bytes(datagram[8..12].try_into().expect("sized")) as usize;
        let payload = &datagram[FRAG_HEADER_SIZE..];

        let Some(region) = state.region else {
            return;
        };
        if total > region.slot_size || offset + payload.len() > total {
            tracing::trace!(seq, offset, total, "inconsistent fragment dropped");
            return;
        }

        match &mut state.assembly {
            None => {
                let Some(&slot) = state.posted_rx.front() else {
                    tracing::warn!(seq, "frame dropped: no receive buffer posted");
                    return;
                };
                state.assembly = Some(Assembly {
                    seq,
                    slot,
                    received: 0,
                    total,
                });
            }
            Some(assembly) if assembly.seq != seq => {
                // The tail of the previous frame was lost; restart on the
                // new frame, reusing the same posted slot.
                tracing::trace!(
                    abandoned = assembly.seq,
                    seq,
                    "incomplete frame superseded"
                );
                assembly.seq = seq;
                assembly.received = 0;
                assembly.total = total;
            }
            Some(_) => {}
        }

        let assembly = state.assembly.as_mut().expect("installed above");
        // The slot is in the NIC role until its completion is reaped; this
        // provider is the DMA engine for that role.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                region.slot_ptr(assembly.slot).add(offset),
                payload.len(),
            );
        }
        assembly.received += payload.len();

        if assembly.received >= assembly.total {
            let done = state.assembly.take().expect("checked above");
            state.posted_rx.pop_front();
            state.completions.push_back(CqEntry {
                slot: done.slot,
                len: done.total as u32,
            });
        }
    }
}

impl Endpoint for UdpEndpoint {
    fn register_region(&self, region: RegionDesc) -> Result<u64> {
        if region.addr == 0 || region.len == 0 || region.slot_size == 0 {
            return Err(ConnError::BadArgument("empty region".into()));
        }
        if region.len % region.slot_size != 0 {
            return Err(ConnError::BadArgument(format!(
                "region length {} not a multiple of slot size {}",
                region.len, region.slot_size
            )));
        }
        let mut state = self.state.lock();
        if state.region.is_some() {
            return Err(ConnError::AlreadyInitialized);
        }
        state.region = Some(region);
        Ok(NEXT_RKEY.fetch_add(1, Ordering::Relaxed))
    }

    fn post_recv(&self, slot: u32) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnError::ReceiveFailed("endpoint closed".into()));
        }
        if self.dir != Direction::Receive {
            return Err(ConnError::BadArgument(
                "receive post on transmit endpoint".into(),
            ));
        }
        let mut state = self.state.lock();
        let region = state
            .region
            .ok_or_else(|| ConnError::ReceiveFailed("no region registered".into()))?;
        region.check_slot(slot)?;
        state.posted_rx.push_back(slot);
        Ok(())
    }

    fn post_send(&self, slot: u32, len: u32) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnError::SendFailed("endpoint closed".into()));
        }
        if self.dir != Direction::Transmit {
            return Err(ConnError::BadArgument(
                "send post on receive endpoint".into(),
            ));
        }
        let mut state = self.state.lock();
        let region = state
            .region
            .ok_or_else(|| ConnError::SendFailed("no region registered".into()))?;
        region.check_slot(slot)?;
        if len as usize > region.slot_size {
            return Err(ConnError::BadArgument(format!(
                "send length {} exceeds slot size {}",
                len, region.slot_size
            )));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let total = len as usize;
        // Slot contents are stable while the slot is in the NIC role.
        let data = unsafe { std::slice::from_raw_parts(region.slot_ptr(slot), total) };

        let mut datagram = Vec::with_capacity(FRAG_HEADER_SIZE + total.min(MAX_FRAG_PAYLOAD));
        let mut offset = 0usize;
        loop {
            let chunk = &data[offset..(offset + MAX_FRAG_PAYLOAD).min(total)];
            datagram.clear();
            datagram.extend_from_slice(&seq.to_le_bytes());
            datagram.extend_from_slice(&(offset as u32).to_le_bytes());
            datagram.extend_from_slice(&(total as u32).to_le_bytes());
            datagram.extend_from_slice(chunk);
            self.socket
                .send(&datagram)
                .map_err(|e| ConnError::SendFailed(format!("udp send: {}", e)))?;
            offset += chunk.len();
            if offset >= total {
                break;
            }
        }

        state.completions.push_back(CqEntry { slot, len });
        self.cq_cond.notify_all();
        Ok(())
    }

    fn read_cq(&self, entries: &mut [CqEntry], timeout: Duration) -> Result<usize> {
        if entries.is_empty() || self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        match self.dir {
            Direction::Transmit => {
                let mut state = self.state.lock();
                loop {
                    let n = self.drain(&mut state, entries);
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
            Direction::Receive => {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    {
                        let mut state = self.state.lock();
                        let n = self.drain(&mut state, entries);
                        if n > 0 {
                            return Ok(n);
                        }
                    }
                    let now = Instant::now();
                    if now >= deadline || self.closed.load(Ordering::SeqCst) {
                        return Ok(0);
                    }
                    self.socket
                        .set_read_timeout(Some(deadline - now))
                        .map_err(|e| ConnError::ReceiveFailed(format!("set timeout: {}", e)))?;
                    match self.socket.recv(&mut buf) {
                        Ok(n) => {
                            let mut state = self.state.lock();
                            self.ingest(&mut state, &buf[..n]);
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            return Ok(0);
                        }
                        Err(e) => {
                            return Err(ConnError::ReceiveFailed(format!("udp recv: {}", e)));
                        }
                    }
                }
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.posted_rx.clear();
        state.completions.clear();
        state.assembly = None;
        state.region = None;
        self.cq_cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_POLL_TIMEOUT;
    use mcm_types::ConnAddr;

    fn bind_free_port() -> (UdpSocket, u16) {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        (probe, port)
    }

    struct Block {
        data: Vec<u8>,
        slot_size: usize,
    }

    impl Block {
        fn new(slots: usize, slot_size: usize) -> Self {
            Self {
                data: vec![0u8; slots * slot_size],
                slot_size,
            }
        }

        fn region(&self) -> RegionDesc {
            RegionDesc {
                addr: self.data.as_ptr() as u64,
                len: self.data.len(),
                slot_size: self.slot_size,
            }
        }

        fn slot(&self, idx: usize) -> &[u8] {
            &self.data[idx * self.slot_size..(idx + 1) * self.slot_size]
        }

        fn slot_mut(&mut self, idx: usize) -> &mut [u8] {
            &mut self.data[idx * self.slot_size..(idx + 1) * self.slot_size]
        }
    }

    fn endpoint_pair() -> (Arc<dyn Endpoint>, Arc<dyn Endpoint>, u16) {
        let fabric = UdpFabric::new();
        let device = fabric.open_device("0000:31:00.0").unwrap();

        let (probe, port) = bind_free_port();
        drop(probe);

        let rx = device
            .create_endpoint(&EndpointConfig {
                dir: Direction::Receive,
                local_addr: ConnAddr::new("127.0.0.1", port.to_string()),
                remote_addr: ConnAddr::new("127.0.0.1", "1"),
            })
            .unwrap();
        let tx = device
            .create_endpoint(&EndpointConfig {
                dir: Direction::Transmit,
                local_addr: ConnAddr::new("127.0.0.1", "0"),
                remote_addr: ConnAddr::new("127.0.0.1", port.to_string()),
            })
            .unwrap();
        (tx, rx, port)
    }

    #[test]
    fn test_register_region_once() {
        let (tx, _rx, _port) = endpoint_pair();
        let block = Block::new(4, 1024);

        let rkey = tx.register_region(block.region()).unwrap();
        assert_ne!(rkey, 0);
        assert!(matches!(
            tx.register_region(block.region()),
            Err(ConnError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_register_region_rejects_misaligned() {
        let (tx, _rx, _port) = endpoint_pair();
        let region = RegionDesc {
            addr: 0x1000,
            len: 1500,
            slot_size: 1024,
        };
        assert!(tx.register_region(region).is_err());
    }

    #[test]
    fn test_post_send_wrong_direction() {
        let (tx, rx, _port) = endpoint_pair();
        let block = Block::new(4, 1024);
        rx.register_region(block.region()).unwrap();
        let tx_block = Block::new(4, 1024);
        tx.register_region(tx_block.region()).unwrap();

        assert!(rx.post_send(0, 10).is_err());
        assert!(tx.post_recv(0).is_err());
    }

    #[test]
    fn test_small_frame_roundtrip() {
        let (tx, rx, _port) = endpoint_pair();
        let mut tx_block = Block::new(4, 1024);
        let rx_block = Block::new(4, 1024);
        tx.register_region(tx_block.region()).unwrap();
        rx.register_region(rx_block.region()).unwrap();

        for slot in 0..4 {
            rx.post_recv(slot).unwrap();
        }

        tx_block.slot_mut(2)[..17].copy_from_slice(b"Hello RDMA World!");
        tx.post_send(2, 17).unwrap();

        // Send completion is immediate.
        let mut entries = [CqEntry { slot: 0, len: 0 }; CQ_BATCH];
        let n = tx.read_cq(&mut entries, DEFAULT_POLL_TIMEOUT).unwrap();
        assert_eq!(n, 1);
        assert_eq!(entries[0], CqEntry { slot: 2, len: 17 });

        // Receive completion lands in the first posted slot.
        let n = poll_until(&rx, &mut entries, Duration::from_secs(2));
        assert_eq!(n, 1);
        assert_eq!(entries[0].slot, 0);
        assert_eq!(entries[0].len, 17);
        assert_eq!(&rx_block.slot(0)[..17], b"Hello RDMA World!");
    }

    #[test]
    fn test_fragmented_frame_roundtrip() {
        let slot_size = 200 * 1024; // forces several fragments
        let (tx, rx, _port) = endpoint_pair();
        let mut tx_block = Block::new(2, slot_size);
        let rx_block = Block::new(2, slot_size);
        tx.register_region(tx_block.region()).unwrap();
        rx.register_region(rx_block.region()).unwrap();

        rx.post_recv(0).unwrap();
        rx.post_recv(1).unwrap();

        for (i, byte) in tx_block.slot_mut(1).iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        tx.post_send(1, slot_size as u32).unwrap();

        let mut entries = [CqEntry { slot: 0, len: 0 }; CQ_BATCH];
        let n = poll_until(&rx, &mut entries, Duration::from_secs(5));
        assert_eq!(n, 1);
        assert_eq!(entries[0].len as usize, slot_size);
        for (i, byte) in rx_block.slot(0).iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8, "mismatch at byte {}", i);
        }
    }

    #[test]
    fn test_read_cq_timeout_empty() {
        let (_tx, rx, _port) = endpoint_pair();
        let block = Block::new(4, 1024);
        rx.register_region(block.region()).unwrap();

        let mut entries = [CqEntry { slot: 0, len: 0 }; CQ_BATCH];
        let n = rx.read_cq(&mut entries, Duration::from_millis(5)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_close_idempotent_and_rejects_posts() {
        let (tx, rx, _port) = endpoint_pair();
        let block = Block::new(4, 1024);
        tx.register_region(block.region()).unwrap();

        tx.close().unwrap();
        tx.close().unwrap();
        assert!(tx.post_send(0, 1).is_err());

        rx.close().unwrap();
        assert!(rx.post_recv(0).is_err());
        let mut entries = [CqEntry { slot: 0, len: 0 }; CQ_BATCH];
        assert_eq!(rx.read_cq(&mut entries, DEFAULT_POLL_TIMEOUT).unwrap(), 0);
    }

    const CQ_BATCH: usize = 8;

    fn poll_until(
        ep: &Arc<dyn Endpoint>,
        entries: &mut [CqEntry; CQ_BATCH],
        budget: Duration,
    ) -> usize {
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline {
            let n = ep
                .read_cq(&mut entries[..], Duration::from_millis(20))
                .unwrap();
            if n > 0 {
                return n;
            }
        }
        0
    }
}
