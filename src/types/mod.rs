//! Core value types.
//!
//! - [`id`]: Identifier types (`TaskId`, `ConnectionId`)
//! - [`destination`]: Addressing (`Interface`, `Destination`)
//! - [`broker_key`]: Connection configuration keys (`BrokerKey`, `NameFlags`, `BusKind`)

pub mod broker_key;
pub mod destination;
pub mod id;

pub use broker_key::{BrokerKey, BusKind, NameFlags};
pub use destination::{Destination, Interface};
pub use id::{ConnectionId, TaskId};
