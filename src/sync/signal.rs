//! Task wake-up signals.
//!
//! Every cooperative task owns one [`TaskSignal`]. Other parties (reactor
//! callbacks, bus callbacks, the connection mutex) deliver a [`Condition`] to
//! it; the task suspends on one condition at a time with
//! [`TaskSignal::wait`].
//!
//! Conditions are sticky bits: a condition delivered before the task starts
//! waiting stays pending and completes the next wait on it immediately, so no
//! wake-up is ever lost. Once the task is halted, deliveries fail and report
//! `false`.

use crate::error::{Error, Result};
use crate::types::TaskId;
use core::fmt;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// A wake-up reason.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition(u32);

impl Condition {
    /// The bus has pending I/O.
    pub const HAVE_DBUS_IO: Self = Self(1 << 0);
    /// The connection mutex was handed to the task.
    pub const CONNECTION_LOCKED: Self = Self(1 << 1);
    /// A brokered connection finished setting up.
    pub const CONNECTION_SET_UP: Self = Self(1 << 2);
    /// A method reply arrived.
    pub const HAVE_REPLY: Self = Self(1 << 3);
    /// A signal match fired.
    pub const HAVE_MATCH_CALLBACK: Self = Self(1 << 4);
    /// An exported object was asked to stop.
    pub const STOP_CALLED: Self = Self(1 << 5);
    /// A well-known name request was answered.
    pub const HAVE_REQUEST_NAME_RESULT: Self = Self(1 << 6);

    /// A custom condition.
    ///
    /// # Panics
    ///
    /// Panics if `bit` is 32 or more.
    #[must_use]
    pub const fn custom(bit: u32) -> Self {
        assert!(bit < 32, "condition bit out of range");
        Self(1 << bit)
    }

    /// Raw bit mask.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::HAVE_DBUS_IO => "have_dbus_io",
            Self::CONNECTION_LOCKED => "connection_locked",
            Self::CONNECTION_SET_UP => "connection_set_up",
            Self::HAVE_REPLY => "have_reply",
            Self::HAVE_MATCH_CALLBACK => "have_match_callback",
            Self::STOP_CALLED => "stop_called",
            Self::HAVE_REQUEST_NAME_RESULT => "have_request_name_result",
            _ => return write!(f, "Condition({:#x})", self.0),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct SignalState {
    pending: u32,
    waker: Option<Waker>,
    halted: bool,
}

/// Wake-up target of one task.
pub struct TaskSignal {
    id: TaskId,
    name: &'static str,
    state: Mutex<SignalState>,
}

impl fmt::Debug for TaskSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskSignal")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pending", &format_args!("{:#x}", state.pending))
            .field("halted", &state.halted)
            .finish()
    }
}

impl TaskSignal {
    /// Creates a signal for a new task.
    #[must_use]
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            name,
            state: Mutex::new(SignalState::default()),
        })
    }

    /// The task identity.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The diagnostic task name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Delivers `condition`. Returns false if the task has been halted.
    pub fn signal(&self, condition: Condition) -> bool {
        let waker = {
            let mut state = self.state.lock();
            if state.halted {
                return false;
            }
            state.pending |= condition.0;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Consumes a pending `condition` without waiting.
    pub fn take(&self, condition: Condition) -> bool {
        let mut state = self.state.lock();
        let was_pending = state.pending & condition.0 != 0;
        state.pending &= !condition.0;
        was_pending
    }

    /// Returns true if `condition` is pending.
    #[must_use]
    pub fn is_pending(&self, condition: Condition) -> bool {
        self.state.lock().pending & condition.0 != 0
    }

    /// Halts the task: pending and future waits fail, deliveries report false.
    pub fn halt(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.halted = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Returns true once halted.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.state.lock().halted
    }

    /// Polls for `condition`, consuming it when pending.
    pub fn poll_wait(&self, cx: &mut Context<'_>, condition: Condition) -> Poll<Result<()>> {
        let mut state = self.state.lock();
        if state.pending & condition.0 != 0 {
            state.pending &= !condition.0;
            return Poll::Ready(Ok(()));
        }
        if state.halted {
            return Poll::Ready(Err(Error::Aborted));
        }
        if state
            .waker
            .as_ref()
            .is_none_or(|waker| !waker.will_wake(cx.waker()))
        {
            state.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Suspends until `condition` is delivered.
    pub fn wait(&self, condition: Condition) -> Wait<'_> {
        Wait {
            signal: self,
            condition,
        }
    }
}

/// Future returned by [`TaskSignal::wait`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Wait<'a> {
    signal: &'a TaskSignal,
    condition: Condition,
}

impl Future for Wait<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.signal.poll_wait(cx, self.condition)
    }
}

/// Owning handle of a task's signal. Dropping it halts the signal.
#[derive(Debug)]
pub struct TaskCtl {
    signal: Arc<TaskSignal>,
}

impl TaskCtl {
    /// Creates a control handle for a new task.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            signal: TaskSignal::new(name),
        }
    }

    /// Shared signal, for callbacks that deliver conditions.
    #[must_use]
    pub fn signal(&self) -> &Arc<TaskSignal> {
        &self.signal
    }
}

impl std::ops::Deref for TaskCtl {
    type Target = TaskSignal;

    fn deref(&self) -> &TaskSignal {
        &self.signal
    }
}

impl Drop for TaskCtl {
    fn drop(&mut self) {
        self.signal.halt();
    }
}
