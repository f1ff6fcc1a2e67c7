//! Runtime seams: readiness reactor, I/O driver and task spawning.

pub mod io_driver;
pub mod reactor;
pub mod spawn;

pub use io_driver::{IoDriver, ReadyHandler};
pub use reactor::{Event, Events, Interest, Reactor, Source, Token};
pub use spawn::{BoxFuture, Spawn};
