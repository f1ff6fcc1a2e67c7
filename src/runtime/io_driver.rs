//! I/O driver that runs the reactor.
//!
//! The driver owns a [`Reactor`] and a slab of weakly held
//! [`ReadyHandler`]s. The slab key doubles as the reactor [`Token`], so one
//! `turn()` maps every event straight to its handler. Handlers are held
//! weakly; a handler that has been dropped simply stops receiving events.

use crate::runtime::reactor::{Events, Interest, Reactor, Source, Token};
use crate::tracing_compat::trace;
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Receives readiness callbacks for one registration.
///
/// Callbacks run on the thread calling [`IoDriver::turn`] and must not block.
pub trait ReadyHandler: Send + Sync {
    /// The descriptor became readable.
    fn on_readable(&self);

    /// The descriptor became writable.
    fn on_writable(&self);

    /// The peer hung up.
    fn on_hangup(&self) {}

    /// The descriptor reported an error.
    fn on_error(&self) {}
}

/// Driver for the I/O event loop.
pub struct IoDriver {
    reactor: Arc<dyn Reactor>,
    registrations: Mutex<Slab<Weak<dyn ReadyHandler>>>,
    events_capacity: usize,
}

impl std::fmt::Debug for IoDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoDriver")
            .field("registrations", &self.registrations.lock().len())
            .field("events_capacity", &self.events_capacity)
            .finish_non_exhaustive()
    }
}

impl IoDriver {
    /// Default number of events handled per turn.
    pub const DEFAULT_EVENTS_CAPACITY: usize = 64;

    /// Creates a driver over `reactor`.
    #[must_use]
    pub fn new(reactor: Arc<dyn Reactor>) -> Self {
        Self::with_capacity(reactor, Self::DEFAULT_EVENTS_CAPACITY)
    }

    /// Creates a driver that handles up to `events_capacity` events per turn.
    #[must_use]
    pub fn with_capacity(reactor: Arc<dyn Reactor>, events_capacity: usize) -> Self {
        Self {
            reactor,
            registrations: Mutex::new(Slab::new()),
            events_capacity: events_capacity.max(1),
        }
    }

    /// The underlying reactor.
    #[must_use]
    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.reactor
    }

    /// Registers `source` and routes its events to `handler`.
    pub fn register(
        &self,
        source: &dyn Source,
        interest: Interest,
        handler: Weak<dyn ReadyHandler>,
    ) -> io::Result<Token> {
        let mut registrations = self.registrations.lock();
        let key = registrations.insert(handler);
        let token = Token::new(key);
        if let Err(err) = self.reactor.register(source, token, interest) {
            registrations.remove(key);
            return Err(err);
        }
        Ok(token)
    }

    /// Replaces the interest of a registration.
    pub fn modify(&self, token: Token, interest: Interest) -> io::Result<()> {
        self.reactor.modify(token, interest)
    }

    /// Removes a registration.
    pub fn deregister(&self, token: Token) -> io::Result<()> {
        let removed = {
            let mut registrations = self.registrations.lock();
            registrations.try_remove(token.0).is_some()
        };
        if removed {
            self.reactor.deregister(token)
        } else {
            Ok(())
        }
    }

    /// Number of live registrations.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Runs one turn of the reactor and dispatches the events.
    ///
    /// Returns the number of events received.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = Events::with_capacity(self.events_capacity);
        let n = self.reactor.poll(&mut events, timeout)?;

        for event in events {
            let handler = self
                .registrations
                .lock()
                .get(event.token.0)
                .and_then(Weak::upgrade);
            let Some(handler) = handler else {
                trace!(token = event.token.0, "event for a dropped handler");
                continue;
            };
            if event.is_error() {
                handler.on_error();
                continue;
            }
            if event.is_hup() {
                handler.on_hangup();
            }
            if event.is_writable() {
                handler.on_writable();
            }
            if event.is_readable() {
                handler.on_readable();
            }
        }

        Ok(n)
    }
}
