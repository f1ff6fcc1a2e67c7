//! dbus-task: a task-oriented asynchronous D-Bus client/server core.
//!
//! # Overview
//!
//! Every bus connection is owned by exactly one [`ConnectionPumpTask`] that
//! waits for socket readiness, takes the connection lock and drains the bus.
//! Request tasks ([`MethodCall`], [`MatchSignal`], [`ObjectExport`]) share the
//! connection through a cooperative [`ConnectionMutex`]: they hold it only
//! long enough to register with the bus, then suspend on their own signal
//! until a bus callback wakes them. A [`Broker`] sets up at most one
//! connection per [`BrokerKey`] and hands it to every request with that key.
//!
//! # Core Guarantees
//!
//! - **One pump per connection**: only the pump drains the bus
//! - **Hand-off locking**: a released connection lock passes directly to the
//!   next waiter, and a callback may release it mid-drain
//! - **Abort is drop**: dropping a request disarms and releases its bus slot,
//!   deferred to the next lock holder if the lock is busy
//! - **Shared setup**: concurrent requests for one key observe one setup and
//!   one outcome
//!
//! # Module Structure
//!
//! - [`broker`]: connection sharing keyed by [`BrokerKey`]
//! - [`bus`]: the bus seam ([`Bus`], [`BusFactory`]) and an in-process loopback bus
//! - [`config`]: [`BusConfig`] and optional TOML loading
//! - [`connection`]: connection state, pump and setup tasks
//! - [`error`](mod@error): the crate [`Error`] type
//! - [`errors`]: remote errors and numeric error-code domains
//! - [`lab`]: deterministic executor for tests
//! - [`message`]: message construction and reading
//! - [`runtime`]: reactor, I/O driver and spawning seams
//! - [`sync`]: task signals and the connection mutex
//! - [`task`]: request tasks
//! - [`types`]: identifiers, destinations and broker keys
//! - [`tracing_compat`]: optional tracing integration (requires `tracing-integration` feature)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(dead_code)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod broker;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod errors;
pub mod lab;
pub mod message;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod tracing_compat;
pub mod types;
pub mod util;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use broker::Broker;
pub use bus::{Bus, BusFactory, Disposition, MatchRule, ObjectHandler, Slot};
pub use config::{BusConfig, DriverConfig};
pub use connection::{
    BusLock, Connection, ConnectionHandle, ConnectionPumpTask, ConnectionSetupTask, DrainOutcome,
    PumpHandle, PumpState,
};
pub use error::{Error, Result};
pub use errors::{BusError, EnumDomain, Errno, ErrorCode, ErrorDomain, ErrorDomainRegistry};
pub use message::{Message, MessageRead, MessageType, Value};
pub use runtime::{IoDriver, Spawn};
pub use sync::{Condition, ConnectionMutex, TaskCtl, TaskSignal};
pub use task::{AbortHandle, Abortable, MatchSignal, MethodCall, ObjectExport, StopHandle, abortable};
pub use types::{BrokerKey, BusKind, ConnectionId, Destination, Interface, NameFlags, TaskId};
