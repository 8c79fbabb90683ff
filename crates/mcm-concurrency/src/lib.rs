//! Cancellation primitives for the media-proxy data plane.
//!
//! The data plane runs on plain OS threads, so cancellation is a condvar
//! broadcast rather than a future: a [`Context`] is a cheaply clonable handle
//! to a cancel flag, contexts form a tree, and cancelling a node cancels its
//! whole subtree. Workers observe cancellation at their next timed wait.

mod context;

pub use context::{sleep, Context};
