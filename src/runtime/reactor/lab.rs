//! Deterministic lab reactor for testing.
//!
//! The [`LabReactor`] never touches the OS. Time is virtual and advances only
//! through `poll()` timeouts; events are injected by test code. Every
//! register/modify/deregister call is recorded so tests can assert exactly how
//! often a connection re-armed its registration.
//!
//! ```ignore
//! let reactor = LabReactor::new();
//! reactor.register(&source, token, Interest::READABLE)?;
//! reactor.inject_event(token, Event::readable(token), Duration::from_millis(10));
//! let mut events = Events::with_capacity(10);
//! reactor.poll(&mut events, Some(Duration::from_millis(15)))?;
//! assert_eq!(events.len(), 1);
//! ```

use super::{Event, Events, Interest, Reactor, Source, Token};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A recorded reactor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorCall {
    /// `register(token, interest)`
    Register(Token, Interest),
    /// `modify(token, interest)`
    Modify(Token, Interest),
    /// `deregister(token)`
    Deregister(Token),
}

#[derive(Debug, PartialEq, Eq)]
struct TimedEvent {
    time: Duration,
    seq: u64,
    event: Event,
}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap on (time, injection order).
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A deterministic reactor for testing.
#[derive(Debug, Default)]
pub struct LabReactor {
    inner: Mutex<LabInner>,
    woken: AtomicBool,
}

#[derive(Debug, Default)]
struct LabInner {
    sockets: HashMap<Token, Interest>,
    pending: BinaryHeap<TimedEvent>,
    time: Duration,
    seq: u64,
    calls: Vec<ReactorCall>,
}

impl LabReactor {
    /// Creates a new lab reactor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects an event to be delivered once virtual time passes `delay` from now.
    pub fn inject_event(&self, token: Token, mut event: Event, delay: Duration) {
        let mut inner = self.inner.lock();
        let time = inner.time.saturating_add(delay);
        inner.seq += 1;
        let seq = inner.seq;
        event.token = token;
        inner.pending.push(TimedEvent { time, seq, event });
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.inner.lock().time
    }

    /// Advances virtual time.
    pub fn advance_time(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.time = inner.time.saturating_add(duration);
    }

    /// Current interest of a registration.
    #[must_use]
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.inner.lock().sockets.get(&token).copied()
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ReactorCall> {
        self.inner.lock().calls.clone()
    }

    /// Number of `modify` calls made for `token`.
    #[must_use]
    pub fn modify_count(&self, token: Token) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, ReactorCall::Modify(t, _) if *t == token))
            .count()
    }

    /// Clears the wake flag and returns its previous value.
    pub fn check_and_clear_wake(&self) -> bool {
        self.woken.swap(false, Ordering::SeqCst)
    }
}

impl Reactor for LabReactor {
    fn register(&self, _source: &dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.sockets.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        inner.sockets.insert(token, interest);
        inner.calls.push(ReactorCall::Register(token, interest));
        Ok(())
    }

    fn modify(&self, token: Token, interest: Interest) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.sockets.get_mut(&token) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "token not registered",
            ));
        };
        *current = interest;
        inner.calls.push(ReactorCall::Modify(token, interest));
        Ok(())
    }

    fn deregister(&self, token: Token) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.sockets.remove(&token).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "token not registered",
            ));
        }
        inner.calls.push(ReactorCall::Deregister(token));
        Ok(())
    }

    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        self.woken.store(false, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if let Some(d) = timeout {
            inner.time = inner.time.saturating_add(d);
        }

        let mut count = 0;
        while inner.pending.peek().is_some_and(|te| te.time <= inner.time) {
            let Some(te) = inner.pending.pop() else { break };
            if inner.sockets.contains_key(&te.event.token) && events.push(te.event) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn wake(&self) -> io::Result<()> {
        self.woken.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn registration_count(&self) -> usize {
        self.inner.lock().sockets.len()
    }
}
