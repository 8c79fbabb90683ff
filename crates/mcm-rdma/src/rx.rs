use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use mcm_concurrency::Context;
use mcm_fabric::{CqEntry, DeviceRegistry, DEFAULT_POLL_TIMEOUT};
use mcm_types::{ConnError, ConnParam, Kind, Result};

use crate::connection::{run_cq_reaper, Core, FrameSink, WorkerEnv};
use crate::state::State;

/// The reaper-to-processor handoff: a FIFO of reaped completions, bounded
/// in practice by the slot count (a slot has at most one outstanding
/// completion).
struct CompletionFifo {
    queue: Mutex<VecDeque<CqEntry>>,
    cond: Condvar,
}

impl CompletionFifo {
    fn new() -> Self {
        CompletionFifo {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, entry: CqEntry) {
        let mut queue = self.queue.lock();
        queue.push_back(entry);
        drop(queue);
        self.cond.notify_all();
    }

    /// Pop one entry, waiting at most `timeout`. Returning `None` lets the
    /// caller re-check cancellation.
    fn pop(&self, timeout: Duration) -> Option<CqEntry> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.cond.wait_for(&mut queue, timeout);
        }
        queue.pop_front()
    }
}

/// A receiving RDMA connection.
///
/// `establish` posts every pool slot for receive and starts two workers:
/// the CQ reaper, which drains completions into the handoff FIFO, and the
/// buffer processor, which delivers each completed frame to the linked
/// [`FrameSink`] and reposts the slot. Delivery order equals completion
/// order.
pub struct RdmaRx {
    core: Core,
}

impl RdmaRx {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        RdmaRx {
            core: Core::new(Kind::Receiver, registry),
        }
    }

    /// Accept and validate parameters. Legal only once, from
    /// `not_configured`.
    pub fn configure(&self, ctx: &Context, param: &ConnParam, dev_port: &str) -> Result<()> {
        self.core.configure(ctx, param, dev_port)
    }

    /// Bring the connection up: open the device, register the buffer block,
    /// post every slot for receive, start the workers. On any failure the
    /// connection ends up `closed` with all partial acquisitions undone.
    pub fn establish(&self, ctx: &Context) -> Result<()> {
        self.core.establish(ctx, true, |env| {
            let fifo = Arc::new(CompletionFifo::new());

            let reaper = {
                let env = env.clone();
                let fifo = Arc::clone(&fifo);
                thread::Builder::new()
                    .name("mcm-rx-cq".into())
                    .spawn(move || run_cq_reaper(&env, |entry| fifo.push(entry)))
                    .map_err(|e| ConnError::InitializationFailed(format!("spawn reaper: {}", e)))?
            };

            let processor = {
                let env = env.clone();
                let fifo = Arc::clone(&fifo);
                thread::Builder::new()
                    .name("mcm-rx-buffers".into())
                    .spawn(move || process_buffers(&env, &fifo))
                    .map_err(|e| {
                        ConnError::InitializationFailed(format!("spawn processor: {}", e))
                    })?
            };

            Ok(vec![reaper, processor])
        })
    }

    /// Halt frame delivery while keeping all resources. Completions keep
    /// draining and their slots are reposted, so the fabric is never
    /// starved of receive buffers.
    pub fn suspend(&self, ctx: &Context) -> Result<()> {
        self.core.suspend(ctx)
    }

    pub fn resume(&self, ctx: &Context) -> Result<()> {
        self.core.resume(ctx)
    }

    /// Cancel the workers, join them, and release every resource.
    /// Idempotent.
    pub fn shutdown(&self, ctx: &Context) -> Result<()> {
        self.core.shutdown(ctx)
    }

    /// Set the downstream consumer. The reference is weak; the sink's
    /// lifetime stays its owner's business.
    pub fn set_link(&self, ctx: &Context, sink: &Arc<dyn FrameSink>) {
        self.core.set_link(ctx, sink)
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

/// The buffer-processor loop: deliver each completed frame, then repost its
/// slot. While the connection is suspended the slot is reposted without
/// delivery. Entries left in the FIFO at cancellation are discarded.
fn process_buffers(env: &WorkerEnv, fifo: &CompletionFifo) {
    while !env.ctx.is_cancelled() {
        let Some(entry) = fifo.pop(DEFAULT_POLL_TIMEOUT) else {
            continue;
        };

        if env.shared.state() == State::Active {
            if let Some(sink) = env.shared.link() {
                let len = (entry.len as usize).min(env.block.slot_size());
                let frame = env.block.read_slot(entry.slot, len);
                match sink.on_receive(&env.ctx, frame) {
                    Ok(consumed) => {
                        tracing::trace!(slot = entry.slot, len, consumed, "frame delivered");
                    }
                    Err(err) => {
                        tracing::warn!(slot = entry.slot, error = %err, "link rejected frame");
                    }
                }
            }
        }

        if let Err(err) = env.endpoint.post_recv(entry.slot) {
            env.fail(err);
            break;
        }
    }
}
