use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use mcm_concurrency::Context;
use mcm_fabric::{
    CqEntry, Device, DeviceRegistry, Direction, Endpoint, EndpointConfig, CQ_BATCH_SIZE,
    DEFAULT_POLL_TIMEOUT,
};
use mcm_types::{ConnError, ConnParam, Kind, Result};

use crate::buffer::{BufferBlock, BufferPool};
use crate::state::{next_state, Op, State};

/// The linked peer: whoever consumes the frames an `RdmaRx` reaps.
///
/// The frame slice points into a pool slot and is valid only for the
/// duration of the call; implementations either consume it synchronously or
/// copy it out. The return value is the number of bytes the peer accepted.
pub trait FrameSink: Send + Sync {
    fn on_receive(&self, ctx: &Context, frame: &[u8]) -> Result<u32>;
}

/// State shared between the connection object and its worker threads.
pub(crate) struct ConnShared {
    kind: Kind,
    state: Mutex<State>,
    last_result: Mutex<Result<()>>,
    link: Mutex<Option<Weak<dyn FrameSink>>>,
}

impl ConnShared {
    fn new(kind: Kind) -> Arc<Self> {
        Arc::new(ConnShared {
            kind,
            state: Mutex::new(State::NotConfigured),
            last_result: Mutex::new(Ok(())),
            link: Mutex::new(None),
        })
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    pub(crate) fn state(&self) -> State {
        *self.state.lock()
    }

    pub(crate) fn last_result(&self) -> Result<()> {
        self.last_result.lock().clone()
    }

    pub(crate) fn link(&self) -> Option<Arc<dyn FrameSink>> {
        self.link.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn record_ok(&self) {
        *self.last_result.lock() = Ok(());
    }

    /// Record a failure and hand it back, so error paths read as
    /// `return Err(shared.record_err(e))`.
    pub(crate) fn record_err(&self, err: ConnError) -> ConnError {
        *self.last_result.lock() = Err(err.clone());
        err
    }
}

/// Everything `establish` acquires; released in reverse order by teardown.
pub(crate) struct Runtime {
    pub(crate) device: Arc<dyn Device>,
    pub(crate) endpoint: Arc<dyn Endpoint>,
    pub(crate) block: Arc<BufferBlock>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) ctx: Context,
    pub(crate) workers: Vec<JoinHandle<()>>,
}

/// Handles a worker thread needs; cheap to clone into the thread closure.
#[derive(Clone)]
pub(crate) struct WorkerEnv {
    pub(crate) ctx: Context,
    pub(crate) shared: Arc<ConnShared>,
    pub(crate) endpoint: Arc<dyn Endpoint>,
    pub(crate) block: Arc<BufferBlock>,
    pub(crate) pool: Arc<BufferPool>,
}

impl WorkerEnv {
    /// Connection-fatal failure observed on a worker: record it, close the
    /// connection, and cancel the sibling workers. Resources are reclaimed
    /// by the next `shutdown` call.
    pub(crate) fn fail(&self, err: ConnError) {
        tracing::error!(kind = %self.shared.kind(), error = %err, "connection failed");
        let _ = self.shared.record_err(err);
        *self.shared.state.lock() = State::Closed;
        self.ctx.cancel();
    }
}

#[derive(Clone)]
struct Configured {
    param: ConnParam,
    dev_port: String,
}

/// The direction-neutral connection base: owns the state machine, the
/// configuration, and the established runtime. `RdmaRx`/`RdmaTx` wrap this
/// and inject their worker topology into `establish`.
pub(crate) struct Core {
    pub(crate) shared: Arc<ConnShared>,
    registry: Arc<DeviceRegistry>,
    config: Mutex<Option<Configured>>,
    pub(crate) runtime: Mutex<Option<Runtime>>,
}

impl Core {
    pub(crate) fn new(kind: Kind, registry: Arc<DeviceRegistry>) -> Self {
        Core {
            shared: ConnShared::new(kind),
            registry,
            config: Mutex::new(None),
            runtime: Mutex::new(None),
        }
    }

    pub(crate) fn configure(
        &self,
        _ctx: &Context,
        param: &ConnParam,
        dev_port: &str,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        let Some(target) = next_state(*state, Op::Configure) else {
            return Err(self.shared.record_err(ConnError::AlreadyInitialized));
        };
        if param.kind != self.shared.kind() {
            return Err(self.shared.record_err(ConnError::BadArgument(format!(
                "{} parameters on a {} connection",
                param.kind,
                self.shared.kind()
            ))));
        }
        if dev_port.is_empty() {
            return Err(self
                .shared
                .record_err(ConnError::BadArgument("empty device port".into())));
        }
        if let Err(err) = param.validate() {
            return Err(self.shared.record_err(err));
        }

        *self.config.lock() = Some(Configured {
            param: param.clone(),
            dev_port: dev_port.to_string(),
        });
        *state = target;
        self.shared.record_ok();
        tracing::info!(
            kind = %param.kind,
            transfer_size = param.rdma.transfer_size,
            queue_size = param.rdma.queue_size,
            dev_port,
            "connection configured"
        );
        Ok(())
    }

    /// Shared establish plumbing. `post_initial_recvs` hands every slot to
    /// the fabric before the workers start (the Rx pattern); `spawn` builds
    /// the direction-specific worker set.
    pub(crate) fn establish<F>(
        &self,
        ctx: &Context,
        post_initial_recvs: bool,
        spawn: F,
    ) -> Result<()>
    where
        F: FnOnce(&WorkerEnv) -> Result<Vec<JoinHandle<()>>>,
    {
        let mut state = self.shared.state.lock();
        let Some(target) = next_state(*state, Op::Establish) else {
            return Err(self.shared.record_err(ConnError::WrongState));
        };
        let cfg = self
            .config
            .lock()
            .clone()
            .expect("configured state implies stored parameters");

        match self.bring_up(ctx, &cfg, post_initial_recvs, spawn) {
            Ok(runtime) => {
                *self.runtime.lock() = Some(runtime);
                *state = target;
                self.shared.record_ok();
                tracing::info!(kind = %self.shared.kind(), "connection established");
                Ok(())
            }
            Err(err) => {
                *state = State::Closed;
                tracing::error!(kind = %self.shared.kind(), error = %err, "establish failed");
                Err(self.shared.record_err(err))
            }
        }
    }

    fn bring_up<F>(
        &self,
        ctx: &Context,
        cfg: &Configured,
        post_initial_recvs: bool,
        spawn: F,
    ) -> Result<Runtime>
    where
        F: FnOnce(&WorkerEnv) -> Result<Vec<JoinHandle<()>>>,
    {
        let device = self
            .registry
            .open(&cfg.dev_port)
            .map_err(coerce_init_error)?;

        let dir = match self.shared.kind() {
            Kind::Transmitter => Direction::Transmit,
            Kind::Receiver => Direction::Receive,
        };
        let endpoint = device
            .create_endpoint(&EndpointConfig {
                dir,
                local_addr: cfg.param.local_addr.clone(),
                remote_addr: cfg.param.remote_addr.clone(),
            })
            .map_err(coerce_init_error)?;

        // From here on the endpoint must be closed on every failure path.
        let block = match BufferBlock::allocate(
            cfg.param.rdma.queue_size,
            cfg.param.rdma.transfer_size,
        ) {
            Ok(block) => Arc::new(block),
            Err(err) => {
                let _ = endpoint.close();
                return Err(err);
            }
        };

        if let Err(err) = endpoint.register_region(block.region()) {
            let _ = endpoint.close();
            return Err(coerce_mr_error(err));
        }

        let pool = Arc::new(BufferPool::new(cfg.param.rdma.queue_size));
        let child = ctx.child();
        let env = WorkerEnv {
            ctx: child.clone(),
            shared: Arc::clone(&self.shared),
            endpoint: Arc::clone(&endpoint),
            block: Arc::clone(&block),
            pool: Arc::clone(&pool),
        };

        if post_initial_recvs {
            for _ in 0..pool.capacity() {
                let slot = pool.try_acquire().expect("freshly seeded pool");
                if let Err(err) = endpoint.post_recv(slot) {
                    child.cancel();
                    let _ = endpoint.close();
                    return Err(coerce_recv_error(err));
                }
            }
        }

        let workers = match spawn(&env) {
            Ok(workers) => workers,
            Err(err) => {
                child.cancel();
                let _ = endpoint.close();
                return Err(err);
            }
        };

        Ok(Runtime {
            device,
            endpoint,
            block,
            pool,
            ctx: child,
            workers,
        })
    }

    pub(crate) fn suspend(&self, _ctx: &Context) -> Result<()> {
        let mut state = self.shared.state.lock();
        let Some(target) = next_state(*state, Op::Suspend) else {
            return Err(self.shared.record_err(ConnError::WrongState));
        };
        *state = target;
        self.shared.record_ok();
        tracing::info!(kind = %self.shared.kind(), "connection suspended");
        Ok(())
    }

    pub(crate) fn resume(&self, _ctx: &Context) -> Result<()> {
        let mut state = self.shared.state.lock();
        let Some(target) = next_state(*state, Op::Resume) else {
            return Err(self.shared.record_err(ConnError::WrongState));
        };
        *state = target;
        self.shared.record_ok();
        tracing::info!(kind = %self.shared.kind(), "connection resumed");
        Ok(())
    }

    /// Close the connection and release everything. Idempotent; safe to
    /// call from any state, including after a worker-declared failure.
    pub(crate) fn shutdown(&self, _ctx: &Context) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != State::Closed {
                let target = next_state(*state, Op::Shutdown)
                    .expect("shutdown is legal from every non-closed state");
                *state = target;
            }
        }

        // Teardown happens outside the state lock: the buffer processor may
        // be in a link callback and must be free to observe state and exit.
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.pool.close();
            runtime.ctx.cancel();
            for worker in runtime.workers {
                let _ = worker.join();
            }
            runtime.pool.cleanup();
            let _ = runtime.endpoint.close();
            // Dropping `runtime` releases the block and the device
            // reference; the registry forgets the device with its last
            // holder.
            drop(runtime.device);
        }

        *self.shared.link.lock() = None;
        self.shared.record_ok();
        tracing::info!(kind = %self.shared.kind(), "connection closed");
        Ok(())
    }

    pub(crate) fn set_link(&self, _ctx: &Context, sink: &Arc<dyn FrameSink>) {
        *self.shared.link.lock() = Some(Arc::downgrade(sink));
    }

    pub(crate) fn transfer_size(&self) -> Option<usize> {
        self.config
            .lock()
            .as_ref()
            .map(|cfg| cfg.param.rdma.transfer_size)
    }

    pub(crate) fn queue_size(&self) -> Option<usize> {
        self.config
            .lock()
            .as_ref()
            .map(|cfg| cfg.param.rdma.queue_size)
    }

    pub(crate) fn free_slots(&self) -> Option<usize> {
        self.runtime.lock().as_ref().map(|rt| rt.pool.free_len())
    }
}

/// The CQ-reaper loop shared by both directions: drain completions in
/// batches until cancelled, handing each entry to `on_entry`. A poll error
/// is connection-fatal.
pub(crate) fn run_cq_reaper(env: &WorkerEnv, mut on_entry: impl FnMut(CqEntry)) {
    let mut entries = [CqEntry { slot: 0, len: 0 }; CQ_BATCH_SIZE];
    while !env.ctx.is_cancelled() {
        match env.endpoint.read_cq(&mut entries, DEFAULT_POLL_TIMEOUT) {
            Ok(0) => {}
            Ok(n) => {
                for entry in &entries[..n] {
                    on_entry(*entry);
                }
            }
            Err(err) => {
                env.fail(err);
                break;
            }
        }
    }
}

fn coerce_init_error(err: ConnError) -> ConnError {
    match err {
        ConnError::InitializationFailed(_) | ConnError::OutOfMemory => err,
        other => ConnError::InitializationFailed(other.to_string()),
    }
}

fn coerce_mr_error(err: ConnError) -> ConnError {
    match err {
        ConnError::MemoryRegistrationFailed(_) => err,
        other => ConnError::MemoryRegistrationFailed(other.to_string()),
    }
}

fn coerce_recv_error(err: ConnError) -> ConnError {
    match err {
        ConnError::ReceiveFailed(_) => err,
        other => ConnError::ReceiveFailed(other.to_string()),
    }
}
