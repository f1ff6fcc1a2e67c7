//! Task synchronization primitives.
//!
//! - [`TaskSignal`] / [`TaskCtl`] / [`Condition`]: per-task wake-up protocol
//! - [`ConnectionMutex`]: cooperative hand-off mutex for one connection
//! - [`AdoptLock`]: scope guard over an already held connection lock

pub mod connection_mutex;
pub mod signal;

pub use connection_mutex::{AdoptLock, ConnectionMutex, Lock};
pub use signal::{Condition, TaskCtl, TaskSignal, Wait};
