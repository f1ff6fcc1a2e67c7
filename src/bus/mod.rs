//! The bus primitive seam.
//!
//! A [`Bus`] is one native connection to a message bus: it exposes a pollable
//! descriptor, the readiness it currently wants, a `process()` step that does
//! one unit of work (flush one outgoing message or dispatch one incoming
//! message), and asynchronous registrations that invoke handlers from inside
//! `process()`.
//!
//! Every method except `fd`, `events` and `bus_id` must only be called while
//! the connection lock is held. Handlers run inside `process()`, i.e. while
//! the pump task holds the lock; they may use the `&mut dyn Bus` they are
//! given but must not block.
//!
//! A registration is identified by a [`Slot`]. One-shot registrations (method
//! replies, name requests, and match/object handlers that return
//! [`Disposition::Release`]) are dropped by the bus after they fire;
//! releasing such a slot afterwards is a no-op.

pub mod loopback;
#[cfg(any(test, feature = "test-internals"))]
pub mod scripted;

use crate::errors::{BusError, Errno};
use crate::message::{Message, MessageRead};
use crate::runtime::Interest;
use crate::types::{Destination, NameFlags};
use std::os::fd::RawFd;

/// Handler for a method reply (success or error).
pub type ReplyHandler = Box<dyn FnOnce(&mut dyn Bus, MessageRead) + Send>;

/// Handler for a matched signal.
pub type MatchHandler = Box<dyn FnMut(&mut dyn Bus, &MessageRead) -> Disposition + Send>;

/// What a handler wants done with its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The message was not for this handler.
    NotHandled,
    /// Handled; keep the registration.
    Keep,
    /// Handled; drop the registration now.
    Release,
}

/// Handler for method calls on an exported object path.
pub trait ObjectHandler: Send {
    /// Handles one incoming call.
    ///
    /// `NotHandled` makes the bus answer `UnknownMethod`; an `Err` is sent
    /// back to the caller as an error reply.
    fn handle(&mut self, bus: &mut dyn Bus, call: &MessageRead) -> Result<Disposition, BusError>;
}

impl<F> ObjectHandler for F
where
    F: FnMut(&mut dyn Bus, &MessageRead) -> Result<Disposition, BusError> + Send,
{
    fn handle(&mut self, bus: &mut dyn Bus, call: &MessageRead) -> Result<Disposition, BusError> {
        self(bus, call)
    }
}

/// Registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "a slot must be released under the connection lock"]
pub struct Slot {
    bus_id: u64,
    id: u64,
}

impl Slot {
    /// Creates a slot; used by bus implementations.
    pub const fn new(bus_id: u64, id: u64) -> Self {
        Self { bus_id, id }
    }

    /// The bus this slot belongs to.
    #[must_use]
    pub const fn bus_id(self) -> u64 {
        self.bus_id
    }

    /// Bus-local registration id.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.id
    }
}

/// Filter for signal subscriptions. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    /// Sender bus name (unique or well-known).
    pub sender: Option<String>,
    /// Object path.
    pub path: Option<String>,
    /// Interface name.
    pub interface: Option<String>,
    /// Signal name.
    pub member: Option<String>,
}

impl MatchRule {
    /// Checks the rule against a signal. `sender_owner` resolves the rule's
    /// well-known sender name to its current unique owner.
    #[must_use]
    pub fn matches(&self, message: &MessageRead, sender_owner: Option<&str>) -> bool {
        let field = |want: &Option<String>, have: Option<&str>| {
            want.as_deref().is_none_or(|w| have == Some(w))
        };
        let sender_ok = match self.sender.as_deref() {
            None => true,
            Some(sender) => {
                message.sender() == Some(sender)
                    || (sender_owner.is_some() && message.sender() == sender_owner)
            }
        };
        message.is_signal(None, None)
            && sender_ok
            && field(&self.path, message.path())
            && field(&self.interface, message.interface())
            && field(&self.member, message.member())
    }
}

impl From<&Destination> for MatchRule {
    fn from(destination: &Destination) -> Self {
        Self {
            sender: Some(destination.service_name().to_owned()),
            path: Some(destination.object_path().to_owned()),
            interface: Some(destination.interface_name().to_owned()),
            member: Some(destination.member_name().to_owned()),
        }
    }
}

/// One native bus connection.
pub trait Bus: Send {
    /// Process-unique identifier of this connection.
    fn bus_id(&self) -> u64;

    /// Connection description given at open time.
    fn description(&self) -> &str;

    /// Does one unit of work. `Ok(true)` means work was done and more may be
    /// pending; `Ok(false)` means nothing is left.
    fn process(&mut self) -> Result<bool, Errno>;

    /// Descriptor to poll for readiness.
    fn fd(&self) -> RawFd;

    /// Readiness the connection currently needs.
    fn events(&self) -> Interest;

    /// Unique bus name assigned to this connection.
    fn unique_name(&self) -> Result<String, Errno>;

    /// Queues a message; returns its serial.
    fn send(&mut self, message: Message) -> Result<u64, Errno>;

    /// Sends a method call and registers `handler` for its reply.
    fn call_async(&mut self, message: Message, handler: ReplyHandler) -> Result<Slot, Errno>;

    /// Subscribes to signals matching `rule`.
    fn match_signal_async(&mut self, rule: MatchRule, handler: MatchHandler)
    -> Result<Slot, Errno>;

    /// Exports an object at `path`.
    fn add_object(&mut self, path: &str, handler: Box<dyn ObjectHandler>) -> Result<Slot, Errno>;

    /// Requests ownership of a well-known name; `handler` receives the reply.
    fn request_name_async(
        &mut self,
        name: &str,
        flags: NameFlags,
        handler: ReplyHandler,
    ) -> Result<Slot, Errno>;

    /// Drops a registration. Unknown or already consumed slots are ignored.
    fn release_slot(&mut self, slot: Slot);

    /// Closes the connection; later calls fail with `ENOTCONN`.
    fn close(&mut self);

    /// Returns true until closed.
    fn is_open(&self) -> bool;
}

impl dyn Bus + '_ {
    /// Sends a successful reply to `call`, letting `build` fill the body.
    pub fn reply_method_return(
        &mut self,
        call: &MessageRead,
        build: impl FnOnce(&mut Message),
    ) -> Result<u64, Errno> {
        let mut reply = Message::method_return(call);
        build(&mut reply);
        self.send(reply)
    }

    /// Sends an error reply to `call`.
    pub fn reply_method_error(&mut self, call: &MessageRead, error: &BusError) -> Result<u64, Errno> {
        self.send(Message::method_error(call, error))
    }

    /// Emits a signal, letting `build` fill the body.
    pub fn emit_signal(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        build: impl FnOnce(&mut Message),
    ) -> Result<u64, Errno> {
        let mut signal = Message::signal(path, interface, member);
        build(&mut signal);
        self.send(signal)
    }
}

/// Opens native bus connections.
pub trait BusFactory: Send + Sync {
    /// Opens a connection to the user bus.
    fn open_user(&self, description: &str) -> Result<Box<dyn Bus>, Errno>;

    /// Opens a connection to the system bus.
    fn open_system(&self, description: &str) -> Result<Box<dyn Bus>, Errno>;
}
