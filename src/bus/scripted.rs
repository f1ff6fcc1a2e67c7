//! Scripted bus for deterministic connection tests.
//!
//! A [`Script`] is a queue of steps consumed one per `process()` call; an
//! empty queue means the bus is idle. Hooks run inside `process()` exactly
//! like bus callbacks, so a test can release the connection lock from inside
//! a drain and observe how the pump reacts.

use super::{Bus, MatchHandler, MatchRule, ObjectHandler, ReplyHandler, Slot};
use crate::errors::Errno;
use crate::message::Message;
use crate::runtime::Interest;
use crate::types::NameFlags;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCRIPTED_ID: AtomicU64 = AtomicU64::new(1 << 32);

/// One scripted `process()` result.
pub enum Step {
    /// Report that work was done.
    Work,
    /// Run a callback, then report work.
    Hook(Box<dyn FnOnce() + Send>),
    /// Run a callback, then report that the bus is idle.
    HookIdle(Box<dyn FnOnce() + Send>),
    /// Fail with the given errno.
    Fail(Errno),
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Work => f.write_str("Work"),
            Self::Hook(_) => f.write_str("Hook"),
            Self::HookIdle(_) => f.write_str("HookIdle"),
            Self::Fail(errno) => write!(f, "Fail({errno})"),
        }
    }
}

#[derive(Debug)]
struct ScriptState {
    steps: VecDeque<Step>,
    events: Interest,
    process_calls: usize,
    sent: usize,
    released: Vec<Slot>,
    closed: bool,
}

/// Shared control of a [`ScriptedBus`].
#[derive(Debug, Clone)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

impl Script {
    /// An idle script that wants to read.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                steps: VecDeque::new(),
                events: Interest::READABLE,
                process_calls: 0,
                sent: 0,
                released: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Queues `count` units of work.
    pub fn push_work(&self, count: usize) {
        let mut state = self.state.lock();
        state.steps.extend((0..count).map(|_| Step::Work));
    }

    /// Queues a hook.
    pub fn push_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().steps.push_back(Step::Hook(Box::new(hook)));
    }

    /// Queues a hook that is the last work before the bus goes idle.
    pub fn push_hook_idle(&self, hook: impl FnOnce() + Send + 'static) {
        self.state
            .lock()
            .steps
            .push_back(Step::HookIdle(Box::new(hook)));
    }

    /// Queues a failure.
    pub fn push_failure(&self, errno: Errno) {
        self.state.lock().steps.push_back(Step::Fail(errno));
    }

    /// Sets the readiness reported by `events()`.
    pub fn set_events(&self, events: Interest) {
        self.state.lock().events = events;
    }

    /// Number of `process()` calls so far.
    #[must_use]
    pub fn process_calls(&self) -> usize {
        self.state.lock().process_calls
    }

    /// Number of steps not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.state.lock().steps.len()
    }

    /// Messages sent through the bus.
    #[must_use]
    pub fn sent(&self) -> usize {
        self.state.lock().sent
    }

    /// Slots released so far, in order.
    #[must_use]
    pub fn released_slots(&self) -> Vec<Slot> {
        self.state.lock().released.clone()
    }

    /// Returns true once the bus was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Creates the bus driven by this script.
    pub fn bus(&self) -> std::io::Result<ScriptedBus> {
        let (socket, _peer) = UnixStream::pair()?;
        Ok(ScriptedBus {
            script: self.clone(),
            socket,
            bus_id: NEXT_SCRIPTED_ID.fetch_add(1, Ordering::Relaxed),
            next_slot: 0,
        })
    }
}

/// A bus whose `process()` results come from a [`Script`].
#[derive(Debug)]
pub struct ScriptedBus {
    script: Script,
    socket: UnixStream,
    bus_id: u64,
    next_slot: u64,
}

impl ScriptedBus {
    fn slot(&mut self) -> Result<Slot, Errno> {
        if self.script.is_closed() {
            return Err(Errno::ENOTCONN);
        }
        self.next_slot += 1;
        Ok(Slot::new(self.bus_id, self.next_slot))
    }
}

impl Bus for ScriptedBus {
    fn bus_id(&self) -> u64 {
        self.bus_id
    }

    fn description(&self) -> &str {
        "scripted"
    }

    fn process(&mut self) -> Result<bool, Errno> {
        let step = {
            let mut state = self.script.state.lock();
            if state.closed {
                return Err(Errno::ENOTCONN);
            }
            state.process_calls += 1;
            state.steps.pop_front()
        };
        match step {
            None => Ok(false),
            Some(Step::Work) => Ok(true),
            Some(Step::Hook(hook)) => {
                hook();
                Ok(true)
            }
            Some(Step::HookIdle(hook)) => {
                hook();
                Ok(false)
            }
            Some(Step::Fail(errno)) => Err(errno),
        }
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn events(&self) -> Interest {
        let state = self.script.state.lock();
        if state.closed { Interest::NONE } else { state.events }
    }

    fn unique_name(&self) -> Result<String, Errno> {
        if self.script.is_closed() {
            return Err(Errno::ENOTCONN);
        }
        Ok(format!(":scripted.{}", self.bus_id))
    }

    fn send(&mut self, _message: Message) -> Result<u64, Errno> {
        let mut state = self.script.state.lock();
        if state.closed {
            return Err(Errno::ENOTCONN);
        }
        state.sent += 1;
        Ok(state.sent as u64)
    }

    fn call_async(&mut self, message: Message, _handler: ReplyHandler) -> Result<Slot, Errno> {
        self.send(message)?;
        self.slot()
    }

    fn match_signal_async(
        &mut self,
        _rule: MatchRule,
        _handler: MatchHandler,
    ) -> Result<Slot, Errno> {
        self.slot()
    }

    fn add_object(&mut self, _path: &str, _handler: Box<dyn ObjectHandler>) -> Result<Slot, Errno> {
        self.slot()
    }

    fn request_name_async(
        &mut self,
        _name: &str,
        _flags: NameFlags,
        _handler: ReplyHandler,
    ) -> Result<Slot, Errno> {
        self.slot()
    }

    fn release_slot(&mut self, slot: Slot) {
        self.script.state.lock().released.push(slot);
    }

    fn close(&mut self) {
        self.script.state.lock().closed = true;
    }

    fn is_open(&self) -> bool {
        !self.script.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_consumed_in_order() {
        let script = Script::new();
        let mut bus = script.bus().expect("bus");
        let hit = Arc::new(Mutex::new(false));
        let flag = hit.clone();
        script.push_work(1);
        script.push_hook(move || *flag.lock() = true);
        script.push_failure(Errno::ECONNRESET);

        assert_eq!(bus.process(), Ok(true));
        assert_eq!(bus.process(), Ok(true));
        assert!(*hit.lock());
        assert_eq!(bus.process(), Err(Errno::ECONNRESET));
        assert_eq!(bus.process(), Ok(false));
        assert_eq!(script.process_calls(), 4);
    }
}
