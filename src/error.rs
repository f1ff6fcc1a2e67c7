//! Crate error type.
//!
//! Transport-fatal failures (a negative status from the bus primitive while
//! draining) end the pump task of one connection. Everything else is local to
//! the request that observed it and never disturbs sibling requests on the
//! same connection.

use crate::errors::{BusError, Errno};
use crate::message::CodecError;
use std::sync::Arc;

/// Errors produced by the connection core and its request tasks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A bus primitive returned a negative status.
    #[error("{call} failed: {errno}")]
    Bus {
        /// Name of the failing primitive.
        call: &'static str,
        /// The reported errno.
        errno: Errno,
    },
    /// The peer answered with a method-error reply.
    #[error("remote error {0}")]
    Remote(BusError),
    /// A typed read did not match the message contents.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Connection setup failed; shared by every requester of the same key.
    #[error("connection setup failed: {0}")]
    Setup(Arc<Error>),
    /// The connection was closed.
    #[error("connection closed")]
    Closed,
    /// The task was halted while waiting.
    #[error("task aborted")]
    Aborted,
    /// Reactor or socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// An error domain was registered twice.
    #[error("error domain {0} is already registered")]
    DuplicateDomain(String),
}

impl Error {
    /// Creates a [`Error::Bus`] for a failed primitive call.
    #[must_use]
    pub const fn bus(call: &'static str, errno: Errno) -> Self {
        Self::Bus { call, errno }
    }

    /// Returns true if the connection that produced this error is unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Bus { .. } | Self::Closed | Self::Io(_) => true,
            Self::Setup(inner) => inner.is_fatal(),
            _ => false,
        }
    }

    /// The structured remote error, if this error carries one.
    #[must_use]
    pub fn remote(&self) -> Option<&BusError> {
        match self {
            Self::Remote(err) => Some(err),
            Self::Setup(inner) => inner.remote(),
            _ => None,
        }
    }

    /// The errno behind a primitive failure, if any.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Bus { errno, .. } => Some(*errno),
            Self::Setup(inner) => inner.errno(),
            _ => None,
        }
    }
}

impl From<BusError> for Error {
    fn from(err: BusError) -> Self {
        Self::Remote(err)
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
