//! Task spawning seam.
//!
//! The connection core never owns an executor. Long-lived tasks (connection
//! setup and the per-connection pump) are handed to a [`Spawn`]
//! implementation supplied by the application; the lab executor provides one
//! for tests.

use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable unit of work.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Something that can run detached futures to completion.
pub trait Spawn: Send + Sync {
    /// Starts `future`; `name` is used for diagnostics only.
    fn spawn_boxed(&self, name: &'static str, future: BoxFuture);
}

impl<F> Spawn for F
where
    F: Fn(&'static str, BoxFuture) + Send + Sync,
{
    fn spawn_boxed(&self, name: &'static str, future: BoxFuture) {
        self(name, future);
    }
}
