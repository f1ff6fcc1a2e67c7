//! Native reactor over the `polling` crate.
//!
//! Registrations use level-triggered mode: a readable socket keeps reporting
//! readiness until drained, which is what a bus connection expects from its
//! descriptor.

// Registering a raw descriptor with the poller is unsafe: the caller must
// keep it open until deregistration.
#![allow(unsafe_code)]

use super::{Event, Events, Interest, Reactor, Source, Token};
use hashbrown::HashMap;
use parking_lot::Mutex;
use polling::{PollMode, Poller};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

fn to_polling(token: Token, interest: Interest) -> polling::Event {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => polling::Event::all(token.0),
        (true, false) => polling::Event::readable(token.0),
        (false, true) => polling::Event::writable(token.0),
        (false, false) => polling::Event::none(token.0),
    }
}

/// Level-triggered reactor backed by the platform poller.
#[derive(Debug)]
pub struct PollReactor {
    poller: Poller,
    sources: Mutex<HashMap<Token, RawFd>>,
    buffer: Mutex<polling::Events>,
}

impl PollReactor {
    /// Creates the reactor.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            sources: Mutex::new(HashMap::new()),
            buffer: Mutex::new(polling::Events::new()),
        })
    }

    fn fd_of(&self, token: Token) -> io::Result<RawFd> {
        self.sources
            .lock()
            .get(&token)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))
    }
}

impl Reactor for PollReactor {
    fn register(&self, source: &dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        let fd = source.as_raw_fd();
        let mut sources = self.sources.lock();
        if sources.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        // SAFETY: the descriptor stays open until `deregister`; connections
        // deregister before closing their bus.
        unsafe {
            self.poller
                .add_with_mode(fd, to_polling(token, interest), PollMode::Level)?;
        }
        sources.insert(token, fd);
        Ok(())
    }

    fn modify(&self, token: Token, interest: Interest) -> io::Result<()> {
        let fd = self.fd_of(token)?;
        // SAFETY: registered descriptors are open (see `register`).
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller
            .modify_with_mode(borrowed, to_polling(token, interest), PollMode::Level)
    }

    fn deregister(&self, token: Token) -> io::Result<()> {
        let fd = self
            .sources
            .lock()
            .remove(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        // SAFETY: registered descriptors are open (see `register`).
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.delete(borrowed)
    }

    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let mut buffer = self.buffer.lock();
        buffer.clear();
        self.poller.wait(&mut buffer, timeout)?;
        let mut count = 0;
        for ev in buffer.iter() {
            let mut ready = Interest::NONE;
            if ev.readable {
                ready = ready.add(Interest::READABLE);
            }
            if ev.writable {
                ready = ready.add(Interest::WRITABLE);
            }
            if events.push(Event::new(Token(ev.key), ready)) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn wake(&self) -> io::Result<()> {
        self.poller.notify()
    }

    fn registration_count(&self) -> usize {
        self.sources.lock().len()
    }
}
