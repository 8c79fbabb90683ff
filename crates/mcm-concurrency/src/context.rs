use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new() -> Arc<Self> {
        Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            // Pairs with the waiters' guard so a waiter cannot re-check the
            // flag and block between our store and the broadcast.
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// A handle to a node in the cancellation tree.
///
/// Clones share the same node. [`Context::child`] creates a subordinate node
/// that is cancelled when its parent is; cancelling a child never affects
/// the parent.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// The root context; never cancelled unless `cancel` is called on it.
    pub fn background() -> Self {
        Context { inner: Inner::new() }
    }

    /// Create a child that observes this context's cancellation.
    ///
    /// If this context is already cancelled the child is born cancelled.
    pub fn child(&self) -> Context {
        let child = Inner::new();
        if self.inner.cancelled.load(Ordering::SeqCst) {
            child.cancelled.store(true, Ordering::SeqCst);
            return Context { inner: child };
        }
        let mut children = self.inner.children.lock();
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child));
        drop(children);
        // The parent may have been cancelled between the check and the
        // registration; re-check so the child can never miss the signal.
        if self.inner.cancelled.load(Ordering::SeqCst) {
            child.cancel();
        }
        Context { inner: child }
    }

    /// Cancel this context and every descendant.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block until cancelled or until `timeout` elapses.
    ///
    /// Returns whether the context is cancelled at return.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_cancelled()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Sleep for `dur` unless `ctx` is cancelled first.
///
/// Returns `true` if the full duration elapsed, `false` on cancellation.
pub fn sleep(ctx: &Context, dur: Duration) -> bool {
    !ctx.wait_cancelled(dur)
}
