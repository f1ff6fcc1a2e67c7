//! The task that drains one connection.
//!
//! ```text
//!  Start ──io_ready──▶ WaitForLock ──lock──▶ Locked ──drain──┐
//!                          ▲                                 │
//!                          ├──────── NeedsRelock ────────────┤
//!                          └─ wait HAVE_DBUS_IO ◀─ IoHandled ┘
//!                                                 UnlockedAndIoHandled
//! ```
//!
//! Halting the pump's signal (or dropping the future) ends it in `Done`,
//! which abandons any lock claim and closes the connection. A drain failure
//! closes the connection too; the error is the task's output.

use super::{Connection, DrainOutcome};
use crate::error::{Error, Result};
use crate::sync::{AdoptLock, Condition, TaskSignal};
use crate::tracing_compat::{debug, error, trace};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Pump task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Not yet polled.
    Start,
    /// Waiting for the connection lock (or for I/O before requesting it).
    WaitForLock,
    /// Holds the lock; the next poll drains.
    Locked,
    /// Finished.
    Done,
}

/// Aborts a pump from outside.
#[derive(Debug, Clone)]
pub struct PumpHandle {
    signal: Arc<TaskSignal>,
}

impl PumpHandle {
    /// Halts the pump; it finishes on its next poll.
    pub fn abort(&self) {
        self.signal.halt();
    }

    /// Returns true once aborted (or finished after a close).
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.signal.is_halted()
    }
}

/// Drains a connection whenever it has I/O, under the connection lock.
#[must_use = "futures do nothing unless polled"]
pub struct ConnectionPumpTask {
    connection: Arc<Connection>,
    state: PumpState,
    waiting: Option<Condition>,
    last_outcome: Option<DrainOutcome>,
    drains: u64,
}

impl std::fmt::Debug for ConnectionPumpTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPumpTask")
            .field("connection", &self.connection.id())
            .field("state", &self.state)
            .field("waiting", &self.waiting)
            .field("drains", &self.drains)
            .finish()
    }
}

impl ConnectionPumpTask {
    /// Creates the pump of `connection`; it answers to
    /// [`Connection::handle_io`].
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            state: PumpState::Start,
            waiting: None,
            last_outcome: None,
            drains: 0,
        }
    }

    /// Abort handle.
    #[must_use]
    pub fn handle(&self) -> PumpHandle {
        PumpHandle {
            signal: self.connection.handle_io().clone(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PumpState {
        self.state
    }

    /// Outcome of the most recent drain.
    #[must_use]
    pub fn last_outcome(&self) -> Option<DrainOutcome> {
        self.last_outcome
    }

    /// Number of drains run.
    #[must_use]
    pub fn drains(&self) -> u64 {
        self.drains
    }

    /// Runs the pump to completion, logging how it ended.
    pub async fn run(self) {
        let id = self.connection.id();
        match self.await {
            Ok(()) => debug!(connection = %id, "pump finished"),
            Err(err) => error!(connection = %id, error = %err, "pump failed"),
        }
    }

    fn finish(&mut self) {
        if self.state == PumpState::Done {
            return;
        }
        trace!(connection = %self.connection.id(), from = ?self.state, "pump done");
        self.state = PumpState::Done;
        self.waiting = None;
        let signal = self.connection.handle_io();
        self.connection.mutex().abandon(signal.id());
        self.connection.close();
    }

    fn step(&mut self) -> Result<()> {
        let connection = self.connection.clone();
        let signal = connection.handle_io();
        match self.state {
            PumpState::Start => {
                connection.io_ready()?;
                self.state = PumpState::WaitForLock;
                self.waiting = Some(Condition::HAVE_DBUS_IO);
            }
            PumpState::WaitForLock => {
                self.state = PumpState::Locked;
                if !connection
                    .mutex()
                    .try_lock(signal, Condition::CONNECTION_LOCKED)
                {
                    trace!(connection = %connection.id(), "pump queued for the lock");
                    self.waiting = Some(Condition::CONNECTION_LOCKED);
                }
            }
            PumpState::Locked => {
                let mutex = connection.mutex();
                if !mutex.is_owner(signal.id()) {
                    self.state = PumpState::WaitForLock;
                    return Ok(());
                }
                mutex.obtained_lock();
                let scoped = AdoptLock::new(mutex);
                let outcome = connection.drain()?;
                self.drains += 1;
                self.last_outcome = Some(outcome);
                self.state = PumpState::WaitForLock;
                trace!(connection = %connection.id(), ?outcome, "drained");
                match outcome {
                    DrainOutcome::NeedsRelock => scoped.skip_unlock(),
                    DrainOutcome::UnlockedAndIoHandled => {
                        scoped.skip_unlock();
                        self.waiting = Some(Condition::HAVE_DBUS_IO);
                    }
                    DrainOutcome::IoHandled => {
                        scoped.unlock();
                        self.waiting = Some(Condition::HAVE_DBUS_IO);
                    }
                }
            }
            PumpState::Done => {}
        }
        Ok(())
    }
}

impl Future for ConnectionPumpTask {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if this.state == PumpState::Done {
                return Poll::Ready(Ok(()));
            }
            if let Some(condition) = this.waiting {
                match this.connection.handle_io().poll_wait(cx, condition) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(())) => this.waiting = None,
                    Poll::Ready(Err(Error::Aborted)) => {
                        this.finish();
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready(Err(err)) => {
                        this.finish();
                        return Poll::Ready(Err(err));
                    }
                }
            }
            if this.connection.handle_io().is_halted() {
                this.finish();
                return Poll::Ready(Ok(()));
            }
            if let Err(err) = this.step() {
                this.finish();
                return Poll::Ready(Err(err));
            }
        }
    }
}

impl Drop for ConnectionPumpTask {
    fn drop(&mut self) {
        self.finish();
    }
}
