//! Readiness reactor abstraction.
//!
//! A [`Reactor`] watches file descriptors for readiness and reports
//! [`Event`]s tagged with the [`Token`] given at registration. The
//! [`IoDriver`](crate::runtime::IoDriver) turns those events into handler
//! callbacks.
//!
//! Implementations:
//!
//! - [`PollReactor`]: native, level-triggered, over the `polling` crate
//! - [`LabReactor`]: virtual, for deterministic tests; records every call

pub mod lab;
#[cfg(unix)]
pub mod poll;

pub use lab::LabReactor;
#[cfg(unix)]
pub use poll::PollReactor;

use core::fmt;
use smallvec::SmallVec;
use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Something that can be registered with a reactor.
pub trait Source: AsRawFd + Send + Sync {}

impl<T: AsRawFd + Send + Sync> Source for T {}

/// Readiness interest (and readiness) bit set.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    /// No interest.
    pub const NONE: Self = Self(0);
    /// Readable.
    pub const READABLE: Self = Self(1 << 0);
    /// Writable.
    pub const WRITABLE: Self = Self(1 << 1);
    /// Error condition (readiness only).
    pub const ERROR: Self = Self(1 << 2);
    /// Hang-up (readiness only).
    pub const HUP: Self = Self(1 << 3);

    /// Readable interest.
    #[must_use]
    pub const fn readable() -> Self {
        Self::READABLE
    }

    /// Writable interest.
    #[must_use]
    pub const fn writable() -> Self {
        Self::WRITABLE
    }

    /// Union of both sets.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// This set without `other`.
    #[must_use]
    pub const fn remove(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if the readable bit is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    /// Returns true if the writable bit is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    /// Returns true if no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.add(rhs)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "R"),
            (Self::WRITABLE, "W"),
            (Self::ERROR, "E"),
            (Self::HUP, "H"),
        ];
        f.write_str("Interest(")?;
        for (bit, name) in names {
            if self.contains(bit) {
                f.write_str(name)?;
            }
        }
        f.write_str(")")
    }
}

/// Registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Token {
    /// Creates a token.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }
}

/// A readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Token of the registration.
    pub token: Token,
    /// Readiness reported.
    pub ready: Interest,
}

impl Event {
    /// Creates an event.
    #[must_use]
    pub const fn new(token: Token, ready: Interest) -> Self {
        Self { token, ready }
    }

    /// A readable event.
    #[must_use]
    pub const fn readable(token: Token) -> Self {
        Self::new(token, Interest::READABLE)
    }

    /// A writable event.
    #[must_use]
    pub const fn writable(token: Token) -> Self {
        Self::new(token, Interest::WRITABLE)
    }

    /// Returns true if readable.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.ready.is_readable()
    }

    /// Returns true if writable.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.ready.is_writable()
    }

    /// Returns true if an error was reported.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.ready.contains(Interest::ERROR)
    }

    /// Returns true if a hang-up was reported.
    #[must_use]
    pub const fn is_hup(&self) -> bool {
        self.ready.contains(Interest::HUP)
    }
}

/// Event buffer filled by [`Reactor::poll`].
#[derive(Debug, Default)]
pub struct Events {
    inner: SmallVec<[Event; 16]>,
    capacity: usize,
}

impl Events {
    /// Creates a buffer that accepts up to `capacity` events per poll.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: SmallVec::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Maximum number of events accepted per poll.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds an event; returns false when the buffer is full.
    pub fn push(&mut self, event: Event) -> bool {
        if self.inner.len() >= self.capacity {
            return false;
        }
        self.inner.push(event);
        true
    }

    /// Removes all events.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over the events.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }
}

impl IntoIterator for Events {
    type Item = Event;
    type IntoIter = smallvec::IntoIter<[Event; 16]>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

/// Readiness notification backend.
pub trait Reactor: Send + Sync {
    /// Starts watching `source` with `interest` under `token`.
    fn register(&self, source: &dyn Source, token: Token, interest: Interest) -> io::Result<()>;

    /// Replaces the interest of a registration.
    fn modify(&self, token: Token, interest: Interest) -> io::Result<()>;

    /// Stops watching a registration.
    fn deregister(&self, token: Token) -> io::Result<()>;

    /// Waits up to `timeout` for events and appends them to `events`.
    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize>;

    /// Interrupts a blocking [`poll`](Self::poll).
    fn wake(&self) -> io::Result<()>;

    /// Number of live registrations.
    fn registration_count(&self) -> usize;

    /// Returns true if nothing is registered.
    fn is_empty(&self) -> bool {
        self.registration_count() == 0
    }
}
