//! In-process message bus.
//!
//! A [`LoopbackHub`] plays the role of the bus daemon: it assigns unique names
//! (`:1.N`), tracks well-known name ownership and routes messages between the
//! [`LoopbackBus`] peers connected to it. Each peer owns one end of a socket
//! pair; the hub writes a byte to the other end whenever it delivers a
//! message, so the peer descriptor becomes readable exactly like a real bus
//! socket and can be driven by the native reactor.
//!
//! Method calls addressed to `org.freedesktop.DBus` are answered by the hub:
//! `Hello`, `RequestName`, `ReleaseName` and `GetNameOwner`.

use super::{Bus, BusFactory, Disposition, MatchHandler, MatchRule, ObjectHandler, ReplyHandler, Slot};
use crate::errors::{BusError, Errno, freedesktop};
use crate::message::{Message, MessageRead, MessageType};
use crate::runtime::Interest;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{Destination, NameFlags};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bus name of the daemon itself.
pub const DAEMON_NAME: &str = "org.freedesktop.DBus";
const DAEMON_PATH: &str = "/org/freedesktop/DBus";

/// `RequestName` reply: the caller now owns the name.
pub const REQUEST_NAME_PRIMARY_OWNER: u32 = 1;
/// `RequestName` reply: the caller was queued behind the owner.
pub const REQUEST_NAME_IN_QUEUE: u32 = 2;
/// `RequestName` reply: the caller already owned the name.
pub const REQUEST_NAME_ALREADY_OWNER: u32 = 4;

/// `ReleaseName` reply: the name was released.
pub const RELEASE_NAME_RELEASED: u32 = 1;
/// `ReleaseName` reply: nobody owned the name.
pub const RELEASE_NAME_NON_EXISTENT: u32 = 2;
/// `ReleaseName` reply: the caller did not own the name.
pub const RELEASE_NAME_NOT_OWNER: u32 = 3;

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

struct Peer {
    unique_name: String,
    inbox: VecDeque<MessageRead>,
    notify: UnixStream,
}

struct NameOwner {
    owner: u64,
    allow_replacement: bool,
    queue: VecDeque<(u64, NameFlags)>,
}

#[derive(Default)]
struct HubState {
    next_peer: u64,
    serial: u64,
    peers: HashMap<u64, Peer>,
    names: HashMap<String, NameOwner>,
}

impl HubState {
    fn resolve(&self, name: &str) -> Option<u64> {
        if name.starts_with(':') {
            self.peers
                .iter()
                .find(|(_, peer)| peer.unique_name == name)
                .map(|(id, _)| *id)
        } else {
            self.names.get(name).map(|entry| entry.owner)
        }
    }

    fn unique_name_of(&self, peer: u64) -> Option<&str> {
        self.peers.get(&peer).map(|p| p.unique_name.as_str())
    }

    fn deliver(&mut self, peer: u64, message: MessageRead) {
        let Some(target) = self.peers.get_mut(&peer) else {
            trace!(peer, "dropping message for a departed peer");
            return;
        };
        target.inbox.push_back(message);
        match target.notify.write(&[1]) {
            Ok(_) => {}
            // A full socket is still readable; the peer will drain the inbox.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(peer, error = %err, "failed to notify peer"),
        }
    }

    fn seal_from_daemon(&mut self, message: Message) -> MessageRead {
        self.serial += 1;
        message.seal(self.serial, Some(DAEMON_NAME), 0)
    }

    fn reply_error(&mut self, call: &MessageRead, error: &BusError) {
        if !call.expect_reply() {
            return;
        }
        let Some(sender) = call.sender().and_then(|s| self.resolve(s)) else {
            return;
        };
        let reply = self.seal_from_daemon(Message::method_error(call, error));
        self.deliver(sender, reply);
    }

    fn reply_with(&mut self, call: &MessageRead, build: impl FnOnce(&mut Message)) {
        if !call.expect_reply() {
            return;
        }
        let Some(sender) = call.sender().and_then(|s| self.resolve(s)) else {
            return;
        };
        let mut reply = Message::method_return(call);
        build(&mut reply);
        let reply = self.seal_from_daemon(reply);
        self.deliver(sender, reply);
    }

    fn daemon_call(&mut self, peer: u64, call: &MessageRead) {
        let mut args = call.clone();
        args.rewind();
        match call.member().unwrap_or_default() {
            "Hello" => {
                let name = self.unique_name_of(peer).unwrap_or_default().to_owned();
                self.reply_with(call, |reply| {
                    reply.append(name);
                });
            }
            "RequestName" => {
                let parsed = args
                    .read::<String>()
                    .and_then(|name| Ok((name, args.read::<u32>()?)));
                match parsed {
                    Ok((name, flags)) => {
                        let result =
                            self.request_name(peer, &name, NameFlags::from_bits_truncate(flags));
                        match result {
                            Ok(code) => self.reply_with(call, |reply| {
                                reply.append(code);
                            }),
                            Err(error) => self.reply_error(call, &error),
                        }
                    }
                    Err(err) => self.reply_error(
                        call,
                        &BusError::new(freedesktop::error_name("InvalidArgs"), err.to_string()),
                    ),
                }
            }
            "ReleaseName" => match args.read::<String>() {
                Ok(name) => {
                    let code = self.release_name(peer, &name);
                    self.reply_with(call, |reply| {
                        reply.append(code);
                    });
                }
                Err(err) => self.reply_error(
                    call,
                    &BusError::new(freedesktop::error_name("InvalidArgs"), err.to_string()),
                ),
            },
            "GetNameOwner" => match args.read::<String>() {
                Ok(name) => {
                    let owner = self
                        .resolve(&name)
                        .and_then(|id| self.unique_name_of(id))
                        .map(str::to_owned);
                    match owner {
                        Some(owner) => self.reply_with(call, |reply| {
                            reply.append(owner);
                        }),
                        None => self.reply_error(
                            call,
                            &BusError::new(
                                freedesktop::error_name("NameHasNoOwner"),
                                format!("Could not get owner of name '{name}'"),
                            ),
                        ),
                    }
                }
                Err(err) => self.reply_error(
                    call,
                    &BusError::new(freedesktop::error_name("InvalidArgs"), err.to_string()),
                ),
            },
            other => {
                let error = BusError::new(
                    freedesktop::error_name("UnknownMethod"),
                    format!("Unknown method '{other}' on the bus daemon"),
                );
                self.reply_error(call, &error);
            }
        }
    }

    fn request_name(&mut self, peer: u64, name: &str, flags: NameFlags) -> Result<u32, BusError> {
        if name.starts_with(':') || !name.contains('.') {
            return Err(BusError::new(
                freedesktop::error_name("InvalidArgs"),
                format!("'{name}' is not a valid well-known name"),
            ));
        }
        let allow_replacement = flags.contains(NameFlags::ALLOW_REPLACEMENT);
        let Some(entry) = self.names.get_mut(name) else {
            self.names.insert(
                name.to_owned(),
                NameOwner {
                    owner: peer,
                    allow_replacement,
                    queue: VecDeque::new(),
                },
            );
            debug!(peer, name, "name acquired");
            return Ok(REQUEST_NAME_PRIMARY_OWNER);
        };
        if entry.owner == peer {
            entry.allow_replacement = allow_replacement;
            return Ok(REQUEST_NAME_ALREADY_OWNER);
        }
        if entry.allow_replacement && flags.contains(NameFlags::REPLACE_EXISTING) {
            entry.queue.retain(|(queued, _)| *queued != peer);
            entry.owner = peer;
            entry.allow_replacement = allow_replacement;
            debug!(peer, name, "name taken over");
            return Ok(REQUEST_NAME_PRIMARY_OWNER);
        }
        if flags.contains(NameFlags::QUEUE) {
            if !entry.queue.iter().any(|(queued, _)| *queued == peer) {
                entry.queue.push_back((peer, flags));
            }
            return Ok(REQUEST_NAME_IN_QUEUE);
        }
        Err(BusError::from_errno(Errno::EEXIST))
    }

    fn release_name(&mut self, peer: u64, name: &str) -> u32 {
        let Some(entry) = self.names.get_mut(name) else {
            return RELEASE_NAME_NON_EXISTENT;
        };
        if entry.owner != peer {
            let before = entry.queue.len();
            entry.queue.retain(|(queued, _)| *queued != peer);
            return if entry.queue.len() == before {
                RELEASE_NAME_NOT_OWNER
            } else {
                RELEASE_NAME_RELEASED
            };
        }
        match entry.queue.pop_front() {
            Some((next, flags)) => {
                entry.owner = next;
                entry.allow_replacement = flags.contains(NameFlags::ALLOW_REPLACEMENT);
            }
            None => {
                self.names.remove(name);
            }
        }
        RELEASE_NAME_RELEASED
    }

    fn route(&mut self, from: u64, message: MessageRead) {
        if message.destination() == Some(DAEMON_NAME)
            && message.message_type() == MessageType::MethodCall
        {
            self.daemon_call(from, &message);
            return;
        }
        match (message.message_type(), message.destination()) {
            (MessageType::Signal, None) => {
                let mut peers: Vec<u64> = self.peers.keys().copied().collect();
                peers.sort_unstable();
                for peer in peers {
                    self.deliver(peer, message.clone());
                }
            }
            (_, Some(destination)) => match self.resolve(destination) {
                Some(peer) => self.deliver(peer, message),
                None if message.message_type() == MessageType::MethodCall => {
                    let error = BusError::new(
                        freedesktop::error_name("ServiceUnknown"),
                        format!("The name {destination} was not provided by any service"),
                    );
                    self.reply_error(&message, &error);
                }
                None => trace!(destination, "dropping reply for an unknown peer"),
            },
            (_, None) => trace!(?message, "dropping message without destination"),
        }
    }

    fn disconnect(&mut self, peer: u64) {
        if self.peers.remove(&peer).is_none() {
            return;
        }
        let owned: Vec<String> = self
            .names
            .iter()
            .filter(|(_, entry)| entry.owner == peer)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.release_name(peer, &name);
        }
        for entry in self.names.values_mut() {
            entry.queue.retain(|(queued, _)| *queued != peer);
        }
    }
}

/// Shared routing state of one loopback bus.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl std::fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackHub")
            .field("peers", &state.peers.len())
            .field("names", &state.names.len())
            .finish()
    }
}

impl LoopbackHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new peer.
    pub fn connect(&self, description: &str) -> io::Result<LoopbackBus> {
        let (wake, notify) = UnixStream::pair()?;
        wake.set_nonblocking(true)?;
        notify.set_nonblocking(true)?;
        let mut state = self.state.lock();
        state.next_peer += 1;
        let peer = state.next_peer;
        let unique_name = format!(":1.{peer}");
        state.peers.insert(
            peer,
            Peer {
                unique_name: unique_name.clone(),
                inbox: VecDeque::new(),
                notify,
            },
        );
        debug!(peer, %unique_name, description, "peer connected");
        Ok(LoopbackBus {
            hub: self.clone(),
            peer,
            bus_id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            unique_name,
            description: description.to_owned(),
            wake,
            outgoing: VecDeque::new(),
            serial: 0,
            next_slot: 0,
            slots: BTreeMap::new(),
            reply_slots: HashMap::new(),
            open: true,
        })
    }

    /// Unique name of the current owner of `name`.
    #[must_use]
    pub fn owner_of(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .resolve(name)
            .and_then(|peer| state.unique_name_of(peer))
            .map(str::to_owned)
    }

    /// Number of connected peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    fn route(&self, from: u64, message: MessageRead) {
        self.state.lock().route(from, message);
    }

    fn take(&self, peer: u64) -> Option<MessageRead> {
        self.state
            .lock()
            .peers
            .get_mut(&peer)
            .and_then(|p| p.inbox.pop_front())
    }

    fn disconnect(&self, peer: u64) {
        self.state.lock().disconnect(peer);
    }
}

/// Opens loopback connections; the user and system buses are separate hubs.
#[derive(Debug, Clone, Default)]
pub struct LoopbackFactory {
    user: LoopbackHub,
    system: LoopbackHub,
}

impl LoopbackFactory {
    /// Creates a factory with two empty hubs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The user bus.
    #[must_use]
    pub fn user_hub(&self) -> &LoopbackHub {
        &self.user
    }

    /// The system bus.
    #[must_use]
    pub fn system_hub(&self) -> &LoopbackHub {
        &self.system
    }
}

fn open_on(hub: &LoopbackHub, description: &str) -> Result<Box<dyn Bus>, Errno> {
    hub.connect(description)
        .map(|bus| Box::new(bus) as Box<dyn Bus>)
        .map_err(|err| Errno::new(err.raw_os_error().unwrap_or(libc::EIO)))
}

impl BusFactory for LoopbackFactory {
    fn open_user(&self, description: &str) -> Result<Box<dyn Bus>, Errno> {
        open_on(&self.user, description)
    }

    fn open_system(&self, description: &str) -> Result<Box<dyn Bus>, Errno> {
        open_on(&self.system, description)
    }
}

enum Registration {
    Reply(Option<ReplyHandler>),
    Match {
        rule: MatchRule,
        handler: Option<MatchHandler>,
    },
    Object {
        path: String,
        handler: Option<Box<dyn ObjectHandler>>,
    },
}

/// One peer connection on a [`LoopbackHub`].
pub struct LoopbackBus {
    hub: LoopbackHub,
    peer: u64,
    bus_id: u64,
    unique_name: String,
    description: String,
    wake: UnixStream,
    outgoing: VecDeque<MessageRead>,
    serial: u64,
    next_slot: u64,
    slots: BTreeMap<u64, Registration>,
    reply_slots: HashMap<u64, u64>,
    open: bool,
}

impl std::fmt::Debug for LoopbackBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBus")
            .field("unique_name", &self.unique_name)
            .field("description", &self.description)
            .field("outgoing", &self.outgoing.len())
            .field("slots", &self.slots.len())
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl LoopbackBus {
    fn check_open(&self) -> Result<(), Errno> {
        if self.open {
            Ok(())
        } else {
            Err(Errno::ENOTCONN)
        }
    }

    fn register(&mut self, registration: Registration) -> Slot {
        self.next_slot += 1;
        self.slots.insert(self.next_slot, registration);
        Slot::new(self.bus_id, self.next_slot)
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wake.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }

    fn dispatch(&mut self, message: MessageRead) {
        match message.message_type() {
            MessageType::MethodReturn | MessageType::MethodError => self.dispatch_reply(message),
            MessageType::Signal => self.dispatch_signal(&message),
            MessageType::MethodCall => self.dispatch_call(&message),
        }
    }

    fn dispatch_reply(&mut self, reply: MessageRead) {
        let Some(slot) = reply
            .reply_cookie()
            .and_then(|cookie| self.reply_slots.remove(&cookie))
        else {
            trace!(?reply, "unsolicited reply");
            return;
        };
        if let Some(Registration::Reply(Some(handler))) = self.slots.remove(&slot) {
            handler(self, reply);
        }
    }

    fn dispatch_signal(&mut self, signal: &MessageRead) {
        let ids: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, r)| matches!(r, Registration::Match { .. }))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let (matched, handler) = match self.slots.get_mut(&id) {
                Some(Registration::Match { rule, handler }) => {
                    let owner = rule
                        .sender
                        .as_deref()
                        .filter(|s| !s.starts_with(':'))
                        .and_then(|s| self.hub.owner_of(s));
                    (rule.matches(signal, owner.as_deref()), handler)
                }
                _ => continue,
            };
            if !matched {
                continue;
            }
            let Some(mut callback) = handler.take() else {
                continue;
            };
            let disposition = callback(self, signal);
            if disposition == Disposition::Release {
                self.slots.remove(&id);
            } else if let Some(Registration::Match { handler, .. }) = self.slots.get_mut(&id) {
                *handler = Some(callback);
            }
        }
    }

    fn dispatch_call(&mut self, call: &MessageRead) {
        let path = call.path().unwrap_or_default();
        let found = self.slots.iter_mut().find_map(|(id, r)| match r {
            Registration::Object { path: p, handler } if p == path => {
                handler.take().map(|h| (*id, h))
            }
            _ => None,
        });
        let Some((id, mut handler)) = found else {
            let error = BusError::new(
                freedesktop::error_name("UnknownObject"),
                format!("Unknown object '{path}'"),
            );
            self.send_error_reply(call, &error);
            return;
        };

        let result = handler.handle(self, call);
        match self.slots.get_mut(&id) {
            Some(Registration::Object { handler: slot, .. }) => *slot = Some(handler),
            _ => drop(handler),
        }
        match result {
            Ok(Disposition::Keep) => {}
            Ok(Disposition::Release) => {
                self.slots.remove(&id);
            }
            Ok(Disposition::NotHandled) => {
                let error = BusError::new(
                    freedesktop::error_name("UnknownMethod"),
                    format!(
                        "Unknown method '{}' or interface '{}'",
                        call.member().unwrap_or_default(),
                        call.interface().unwrap_or_default()
                    ),
                );
                self.send_error_reply(call, &error);
            }
            Err(error) => self.send_error_reply(call, &error),
        }
    }

    fn send_error_reply(&mut self, call: &MessageRead, error: &BusError) {
        if !call.expect_reply() {
            return;
        }
        if let Err(errno) = self.send(Message::method_error(call, error)) {
            warn!(%errno, "failed to queue error reply");
        }
    }
}

impl Bus for LoopbackBus {
    fn bus_id(&self) -> u64 {
        self.bus_id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn process(&mut self) -> Result<bool, Errno> {
        self.check_open()?;
        if let Some(message) = self.outgoing.pop_front() {
            self.hub.route(self.peer, message);
            return Ok(true);
        }
        self.drain_wake();
        match self.hub.take(self.peer) {
            Some(message) => {
                self.dispatch(message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }

    fn events(&self) -> Interest {
        if !self.open {
            return Interest::NONE;
        }
        if self.outgoing.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    fn unique_name(&self) -> Result<String, Errno> {
        self.check_open()?;
        Ok(self.unique_name.clone())
    }

    fn send(&mut self, message: Message) -> Result<u64, Errno> {
        self.check_open()?;
        self.serial += 1;
        let sealed = message.seal(self.serial, Some(&self.unique_name), self.bus_id);
        self.outgoing.push_back(sealed);
        Ok(self.serial)
    }

    fn call_async(&mut self, mut message: Message, handler: ReplyHandler) -> Result<Slot, Errno> {
        if message.message_type() != MessageType::MethodCall {
            return Err(Errno::EINVAL);
        }
        message.set_expect_reply(true);
        let serial = self.send(message)?;
        let slot = self.register(Registration::Reply(Some(handler)));
        self.reply_slots.insert(serial, slot.id());
        Ok(slot)
    }

    fn match_signal_async(
        &mut self,
        rule: MatchRule,
        handler: MatchHandler,
    ) -> Result<Slot, Errno> {
        self.check_open()?;
        Ok(self.register(Registration::Match {
            rule,
            handler: Some(handler),
        }))
    }

    fn add_object(&mut self, path: &str, handler: Box<dyn ObjectHandler>) -> Result<Slot, Errno> {
        self.check_open()?;
        let taken = self
            .slots
            .values()
            .any(|r| matches!(r, Registration::Object { path: p, .. } if p == path));
        if taken {
            return Err(Errno::EEXIST);
        }
        Ok(self.register(Registration::Object {
            path: path.to_owned(),
            handler: Some(handler),
        }))
    }

    fn request_name_async(
        &mut self,
        name: &str,
        flags: NameFlags,
        handler: ReplyHandler,
    ) -> Result<Slot, Errno> {
        let daemon = Destination::new(DAEMON_NAME, DAEMON_PATH, DAEMON_NAME, "RequestName");
        let mut call = Message::method_call(&daemon);
        call.append(name).append(flags.bits());
        self.call_async(call, handler)
    }

    fn release_slot(&mut self, slot: Slot) {
        if slot.bus_id() != self.bus_id {
            warn!(slot = slot.id(), "releasing a slot of another bus");
            return;
        }
        if let Some(Registration::Reply(_)) = self.slots.remove(&slot.id()) {
            self.reply_slots.retain(|_, id| *id != slot.id());
        }
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.outgoing.clear();
        self.slots.clear();
        self.reply_slots.clear();
        self.hub.disconnect(self.peer);
        debug!(unique_name = %self.unique_name, "loopback bus closed");
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for LoopbackBus {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pump(buses: &mut [&mut LoopbackBus]) {
        loop {
            let mut worked = false;
            for bus in buses.iter_mut() {
                worked |= bus.process().expect("process");
            }
            if !worked {
                break;
            }
        }
    }

    fn request_name(bus: &mut LoopbackBus, name: &str, flags: NameFlags) -> Arc<Mutex<Option<MessageRead>>> {
        let result = Arc::new(Mutex::new(None));
        let out = result.clone();
        let _slot = bus
            .request_name_async(name, flags, Box::new(move |_, reply| *out.lock() = Some(reply)))
            .expect("request");
        result
    }

    #[test]
    fn unique_names_are_sequential() {
        let hub = LoopbackHub::new();
        let a = hub.connect("a").expect("connect");
        let b = hub.connect("b").expect("connect");
        assert_eq!(a.unique_name().expect("name"), ":1.1");
        assert_eq!(b.unique_name().expect("name"), ":1.2");
        assert_eq!(hub.peer_count(), 2);
        drop(a);
        assert_eq!(hub.peer_count(), 1);
    }

    #[test]
    fn request_name_outcomes() {
        let hub = LoopbackHub::new();
        let mut a = hub.connect("a").expect("connect");
        let mut b = hub.connect("b").expect("connect");

        let first = request_name(&mut a, "org.example.Svc", NameFlags::NONE);
        pump(&mut [&mut a]);
        let mut reply = first.lock().take().expect("reply");
        assert_eq!(reply.read::<u32>().expect("u32"), REQUEST_NAME_PRIMARY_OWNER);
        assert_eq!(hub.owner_of("org.example.Svc").as_deref(), Some(":1.1"));

        let again = request_name(&mut a, "org.example.Svc", NameFlags::NONE);
        pump(&mut [&mut a]);
        let mut reply = again.lock().take().expect("reply");
        assert_eq!(reply.read::<u32>().expect("u32"), REQUEST_NAME_ALREADY_OWNER);

        let taken = request_name(&mut b, "org.example.Svc", NameFlags::NONE);
        pump(&mut [&mut b]);
        let reply = taken.lock().take().expect("reply");
        let error = reply.error().expect("error reply");
        assert_eq!(error.name(), "System.Error.EEXIST");

        let queued = request_name(&mut b, "org.example.Svc", NameFlags::QUEUE);
        pump(&mut [&mut b]);
        let mut reply = queued.lock().take().expect("reply");
        assert_eq!(reply.read::<u32>().expect("u32"), REQUEST_NAME_IN_QUEUE);

        drop(a);
        assert_eq!(hub.owner_of("org.example.Svc").as_deref(), Some(":1.2"));
    }

    #[test]
    fn call_to_missing_service_gets_service_unknown() {
        let hub = LoopbackHub::new();
        let mut a = hub.connect("a").expect("connect");
        let got = Arc::new(Mutex::new(None));
        let out = got.clone();
        let call = Message::method_call(&Destination::new("org.nobody", "/", "org.nobody", "Ping"));
        let _slot = a
            .call_async(call, Box::new(move |_, reply| *out.lock() = reply.error()))
            .expect("call");
        pump(&mut [&mut a]);
        let error = got.lock().take().expect("error");
        assert!(error.is_standard("ServiceUnknown"));
    }

    #[test]
    fn object_call_and_signal_round_trip() {
        let hub = LoopbackHub::new();
        let mut server = hub.connect("server").expect("connect");
        let mut client = hub.connect("client").expect("connect");

        let _obj = server
            .add_object(
                "/obj",
                Box::new(|bus: &mut dyn Bus, call: &MessageRead| -> Result<Disposition, BusError> {
                    bus.reply_method_return(call, |reply| {
                        reply.append("pong");
                    })
                    .map_err(BusError::from)?;
                    bus.emit_signal("/obj", "org.example.Obj", "Pinged", |_| {})
                        .map_err(BusError::from)?;
                    Ok(Disposition::Keep)
                }),
            )
            .expect("export");

        let signals = Arc::new(AtomicUsize::new(0));
        let seen = signals.clone();
        let _match = client
            .match_signal_async(
                MatchRule {
                    member: Some("Pinged".into()),
                    ..MatchRule::default()
                },
                Box::new(move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Disposition::Release
                }),
            )
            .expect("match");

        let reply = Arc::new(Mutex::new(None));
        let out = reply.clone();
        let dest = Destination::new(":1.1", "/obj", "org.example.Obj", "Ping");
        let _call = client
            .call_async(
                Message::method_call(&dest),
                Box::new(move |_, r| *out.lock() = Some(r)),
            )
            .expect("call");

        pump(&mut [&mut client, &mut server]);
        let mut reply = reply.lock().take().expect("reply");
        assert_eq!(reply.read::<String>().expect("s"), "pong");
        assert_eq!(signals.load(Ordering::SeqCst), 1);
        // The match released itself; no second delivery.
        assert_eq!(client.slots.len(), 0);
    }

    #[test]
    fn closed_bus_rejects_work() {
        let hub = LoopbackHub::new();
        let mut bus = hub.connect("a").expect("connect");
        bus.close();
        assert_eq!(bus.process(), Err(Errno::ENOTCONN));
        assert_eq!(bus.events(), Interest::NONE);
        assert_eq!(hub.peer_count(), 0);
    }
}
