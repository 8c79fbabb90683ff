//! The RDMA connection subsystem of the media-proxy data plane.
//!
//! A connection pair moves fixed-size media frames between application
//! buffers and a fabric provider. Each direction is its own type sharing a
//! common base: a strict lifecycle state machine, a preallocated pinned
//! buffer block carved into slots, a blocking slot pool, and worker threads
//! that drain the completion queue.
//!
//! - [`RdmaTx`]: `transmit` copies a frame into a free slot and posts it;
//!   the CQ reaper returns completed slots to the pool.
//! - [`RdmaRx`]: every slot stays posted for receive; the CQ reaper hands
//!   completions to the buffer processor, which delivers each frame to the
//!   linked [`FrameSink`] and reposts the slot.
//!
//! Lifecycle: `configure` → `establish` → (`suspend` ⇄ `resume`) →
//! `shutdown`. Every operation consults the shared transition predicate in
//! [`state`]; illegal calls fail with `WrongState` and change nothing.
//! `shutdown` cancels the connection's child context, joins the workers,
//! and releases resources in reverse acquisition order.

pub mod buffer;
pub mod connection;
pub mod rx;
pub mod state;
pub mod tx;

pub use buffer::{BufferBlock, BufferPool};
pub use connection::FrameSink;
pub use rx::RdmaRx;
pub use state::{next_state, Op, State};
pub use tx::RdmaTx;

#[cfg(test)]
mod tests {
    //! End-to-end pairing of a transmitter and a receiver over the UDP
    //! software fabric on loopback.

    use std::net::UdpSocket;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use mcm_concurrency::Context;
    use mcm_fabric::{DeviceRegistry, UdpFabric};
    use mcm_types::{ConnAddr, ConnParam, Kind, RdmaArgs, Result};

    use crate::{FrameSink, RdmaRx, RdmaTx, State};

    struct CollectingSink {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(CollectingSink {
                frames: Mutex::new(Vec::new()),
            })
        }
    }

    impl FrameSink for CollectingSink {
        fn on_receive(&self, _ctx: &Context, frame: &[u8]) -> Result<u32> {
            self.frames.lock().push(frame.to_vec());
            Ok(frame.len() as u32)
        }
    }

    fn free_port() -> u16 {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    }

    fn param(kind: Kind, local_port: u16, remote_port: u16, transfer_size: usize) -> ConnParam {
        ConnParam {
            kind,
            local_addr: ConnAddr::new("127.0.0.1", local_port.to_string()),
            remote_addr: ConnAddr::new("127.0.0.1", remote_port.to_string()),
            rdma: RdmaArgs {
                transfer_size,
                queue_size: 8,
            },
            protocol: Default::default(),
            payload_type: Default::default(),
        }
    }

    #[test]
    fn test_udp_loopback_frame_flow() {
        // Full wiring, the way an embedding process would: subscriber
        // first, then the connection pair. The guard flushes on drop.
        let _log_guard = mcm_logging::init(&mcm_logging::LogConfig::default());

        let registry = Arc::new(DeviceRegistry::new(Arc::new(UdpFabric::new())));
        let ctx = Context::background();

        let rx_port = free_port();
        let transfer_size = 64 * 1024;

        let rx = RdmaRx::new(Arc::clone(&registry));
        rx.configure(
            &ctx,
            &param(Kind::Receiver, rx_port, 1, transfer_size),
            "0000:31:00.0",
        )
        .unwrap();

        let sink = CollectingSink::new();
        let sink_dyn: Arc<dyn FrameSink> = sink.clone();
        rx.set_link(&ctx, &sink_dyn);
        rx.establish(&ctx).unwrap();

        let tx = RdmaTx::new(Arc::clone(&registry));
        tx.configure(
            &ctx,
            &param(Kind::Transmitter, 0, rx_port, transfer_size),
            "0000:31:00.0",
        )
        .unwrap();
        tx.establish(&ctx).unwrap();

        // Both connections share the one device for the port.
        assert_eq!(registry.live_devices(), 1);

        let mut frame = vec![0u8; transfer_size];
        frame[..17].copy_from_slice(b"Hello RDMA World!");
        for round in 0..3u8 {
            frame[17] = round;
            tx.transmit(&ctx, &frame).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while sink.frames.lock().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let frames = sink.frames.lock().clone();
        assert_eq!(frames.len(), 3, "expected all frames delivered");
        for (round, frame) in frames.iter().enumerate() {
            assert_eq!(frame.len(), transfer_size);
            assert_eq!(&frame[..17], b"Hello RDMA World!");
            assert_eq!(frame[17], round as u8, "delivery order equals completion order");
        }

        // Quiescence: every Tx slot back in the pool, every Rx slot posted.
        let deadline = Instant::now() + Duration::from_secs(2);
        while tx.free_slots() != Some(8) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(tx.free_slots(), Some(8));
        assert_eq!(rx.free_slots(), Some(0));

        tx.shutdown(&ctx).unwrap();
        rx.shutdown(&ctx).unwrap();
        assert_eq!(tx.state(), State::Closed);
        assert_eq!(rx.state(), State::Closed);
        assert_eq!(registry.live_devices(), 0);
    }
}
