use std::sync::Arc;
use std::thread;

use mcm_concurrency::Context;
use mcm_fabric::{DeviceRegistry, DEFAULT_POLL_TIMEOUT};
use mcm_types::{ConnError, ConnParam, Kind, Result};

use crate::connection::{run_cq_reaper, Core, FrameSink};
use crate::state::State;

/// A transmitting RDMA connection.
///
/// `establish` seeds the pool and starts the CQ reaper; there is no buffer
/// processor, a send completion simply releases the slot. [`RdmaTx::transmit`]
/// is synchronous from the caller's view: it returns once the fabric has
/// accepted the work request, not when it completes.
pub struct RdmaTx {
    core: Core,
}

impl RdmaTx {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        RdmaTx {
            core: Core::new(Kind::Transmitter, registry),
        }
    }

    /// Accept and validate parameters. Legal only once, from
    /// `not_configured`.
    pub fn configure(&self, ctx: &Context, param: &ConnParam, dev_port: &str) -> Result<()> {
        self.core.configure(ctx, param, dev_port)
    }

    /// Bring the connection up: open the device, register the buffer block,
    /// start the CQ reaper. On any failure the connection ends up `closed`
    /// with all partial acquisitions undone.
    pub fn establish(&self, ctx: &Context) -> Result<()> {
        self.core.establish(ctx, false, |env| {
            let reaper = {
                let env = env.clone();
                thread::Builder::new()
                    .name("mcm-tx-cq".into())
                    .spawn(move || {
                        let pool = Arc::clone(&env.pool);
                        run_cq_reaper(&env, |entry| pool.release(entry.slot));
                    })
                    .map_err(|e| ConnError::InitializationFailed(format!("spawn reaper: {}", e)))?
            };
            Ok(vec![reaper])
        })
    }

    /// Copy `data` into a free slot and post it for send.
    ///
    /// Blocks while the pool is empty; cancellation of `ctx` (or shutdown)
    /// is observed within one poll timeout and returns `Cancelled`. A post
    /// failure releases the slot and leaves the connection `active`.
    pub fn transmit(&self, ctx: &Context, data: &[u8]) -> Result<()> {
        if self.core.shared.state() != State::Active {
            return Err(self.core.shared.record_err(ConnError::WrongState));
        }

        let (pool, block, endpoint) = {
            let runtime = self.core.runtime.lock();
            // A concurrent shutdown may have taken the runtime between the
            // state check and here.
            let Some(runtime) = runtime.as_ref() else {
                return Err(self.core.shared.record_err(ConnError::WrongState));
            };
            (
                Arc::clone(&runtime.pool),
                Arc::clone(&runtime.block),
                Arc::clone(&runtime.endpoint),
            )
        };

        if data.len() > block.slot_size() {
            return Err(self.core.shared.record_err(ConnError::BadArgument(format!(
                "payload of {} bytes exceeds transfer size {}",
                data.len(),
                block.slot_size()
            ))));
        }

        let slot = match pool.acquire(ctx, DEFAULT_POLL_TIMEOUT) {
            Ok(slot) => slot,
            Err(err) => return Err(self.core.shared.record_err(err)),
        };

        block.write_slot(slot, data);

        if let Err(err) = endpoint.post_send(slot, data.len() as u32) {
            pool.release(slot);
            let err = match err {
                ConnError::SendFailed(_) => err,
                other => ConnError::SendFailed(other.to_string()),
            };
            return Err(self.core.shared.record_err(err));
        }

        self.core.shared.record_ok();
        Ok(())
    }

    /// Halt transmission while keeping all resources; in-flight posts stay
    /// posted and their completions return slots to the pool.
    pub fn suspend(&self, ctx: &Context) -> Result<()> {
        self.core.suspend(ctx)
    }

    pub fn resume(&self, ctx: &Context) -> Result<()> {
        self.core.resume(ctx)
    }

    /// Cancel the reaper, join it, and release every resource. Idempotent.
    pub fn shutdown(&self, ctx: &Context) -> Result<()> {
        self.core.shutdown(ctx)
    }

    /// Set the upstream producer. The reference is weak; the peer's
    /// lifetime stays its owner's business.
    pub fn set_link(&self, ctx: &Context, peer: &Arc<dyn FrameSink>) {
        self.core.set_link(ctx, peer)
    }

    pub fn kind(&self) -> Kind {
        self.core.shared.kind()
    }

    pub fn state(&self) -> State {
        self.core.shared.state()
    }

    /// Result of the most recent operation.
    pub fn last_result(&self) -> Result<()> {
        self.core.shared.last_result()
    }

    /// Free slots in the pool, once established.
    pub fn free_slots(&self) -> Option<usize> {
        self.core.free_slots()
    }

    pub fn transfer_size(&self) -> Option<usize> {
        self.core.transfer_size()
    }

    pub fn queue_size(&self) -> Option<usize> {
        self.core.queue_size()
    }
}
