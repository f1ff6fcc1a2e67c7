//! One bus connection shared by many tasks.
//!
//! A [`Connection`] couples a native [`Bus`] with its reactor registration
//! (the I/O device), the [`ConnectionMutex`] that serializes access to the
//! bus, and the signal of the pump task that drains it.
//!
//! Lock discipline: every bus operation happens while the connection mutex is
//! held. The inner `parking_lot` mutex around the bus only guards the memory;
//! it is held for the duration of one bus call and never across an await.
//!
//! The I/O device translates reactor readiness into `HAVE_DBUS_IO` deliveries
//! to the pump. After every drain the device is re-armed from the bus's
//! wanted readiness, with write interest taking precedence over read
//! interest, and the reactor is only touched when the armed interest actually
//! changes.

mod handle;
mod pump;
mod setup;
pub(crate) mod slot;

pub use handle::ConnectionHandle;
pub use pump::{ConnectionPumpTask, PumpHandle, PumpState};
pub use setup::{ConnectionSetupTask, DEFAULT_DESCRIPTION};

use crate::bus::{Bus, Slot};
use crate::error::{Error, Result};
use crate::runtime::{Interest, IoDriver, ReadyHandler, Token};
use crate::sync::{ConnectionMutex, TaskSignal, Condition};
use crate::tracing_compat::{debug, error, trace, warn};
use crate::types::{ConnectionId, TaskId};
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Result of one drain of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A callback released the lock while work may remain; re-acquire and
    /// drain again without waiting for I/O.
    NeedsRelock,
    /// The bus is idle and a callback released the lock during the drain.
    UnlockedAndIoHandled,
    /// The bus is idle and the caller still owns the lock.
    IoHandled,
}

struct BusFd(RawFd);

impl AsRawFd for BusFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct IoDevice {
    driver: Arc<IoDriver>,
    token: Mutex<Option<Token>>,
    armed: Mutex<Interest>,
}

impl IoDevice {
    fn update(&self, change: impl FnOnce(Interest) -> Interest) -> io::Result<()> {
        let mut armed = self.armed.lock();
        let next = change(*armed);
        if next == *armed {
            return Ok(());
        }
        let Some(token) = *self.token.lock() else {
            return Ok(());
        };
        self.driver.modify(token, next)?;
        *armed = next;
        Ok(())
    }

    fn arm(&self, interest: Interest) -> io::Result<()> {
        self.update(|_| interest)
    }

    fn stop_input(&self) -> io::Result<()> {
        self.update(|i| i.remove(Interest::READABLE))
    }

    fn start_output(&self) -> io::Result<()> {
        self.update(|i| i.add(Interest::WRITABLE))
    }

    fn stop_output(&self) -> io::Result<()> {
        self.update(|i| i.remove(Interest::WRITABLE))
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A bus connection with its I/O device and lock.
pub struct Connection {
    id: ConnectionId,
    bus: Mutex<Box<dyn Bus>>,
    device: IoDevice,
    mutex: ConnectionMutex,
    handle_io: Arc<TaskSignal>,
    draining: AtomicBool,
    closed: AtomicBool,
    deferred: Mutex<Vec<Slot>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("armed", &*self.device.armed.lock())
            .field("mutex", &self.mutex)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wraps `bus` and registers its descriptor with `driver`.
    ///
    /// Readiness is delivered to `handle_io` as [`Condition::HAVE_DBUS_IO`].
    /// Nothing is armed until [`io_ready`](Self::io_ready).
    pub fn open(
        bus: Box<dyn Bus>,
        driver: &Arc<IoDriver>,
        handle_io: Arc<TaskSignal>,
    ) -> Result<Arc<Self>> {
        let fd = bus.fd();
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            bus: Mutex::new(bus),
            device: IoDevice {
                driver: driver.clone(),
                token: Mutex::new(None),
                armed: Mutex::new(Interest::NONE),
            },
            mutex: ConnectionMutex::new(),
            handle_io,
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
        });
        let handler = Arc::downgrade(&connection);
        let token = driver.register(&BusFd(fd), Interest::NONE, handler)?;
        *connection.device.token.lock() = Some(token);
        debug!(connection = %connection.id, fd, "connection opened");
        Ok(connection)
    }

    /// Connection identity.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The lock guarding the bus.
    #[must_use]
    pub fn mutex(&self) -> &ConnectionMutex {
        &self.mutex
    }

    /// Signal of the pump task.
    #[must_use]
    pub fn handle_io(&self) -> &Arc<TaskSignal> {
        &self.handle_io
    }

    /// Reactor token of the I/O device, until closed.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        *self.device.token.lock()
    }

    /// Interest currently armed on the reactor.
    #[must_use]
    pub fn armed_interest(&self) -> Interest {
        *self.device.armed.lock()
    }

    /// Arms write interest so the first drain runs as soon as the descriptor
    /// is writable.
    pub fn io_ready(&self) -> Result<()> {
        self.device.start_output()?;
        Ok(())
    }

    /// Processes the bus until it is idle or a callback releases the lock.
    ///
    /// Must be called by the lock owner, after
    /// [`ConnectionMutex::obtained_lock`]. At most one drain runs at a time.
    pub fn drain(&self) -> Result<DrainOutcome> {
        let was_draining = self.draining.swap(true, Ordering::AcqRel);
        debug_assert!(!was_draining, "concurrent drain of {}", self.id);
        let _guard = DrainGuard(&self.draining);

        let wanted = {
            let mut bus = self.bus.lock();
            self.flush_deferred(&mut **bus);
            loop {
                let worked = bus
                    .process()
                    .map_err(|errno| Error::bus("process", errno))?;
                if !worked {
                    break;
                }
                if self.mutex.unlocked_in_callback() {
                    trace!(connection = %self.id, "lock released by a callback mid-drain");
                    return Ok(DrainOutcome::NeedsRelock);
                }
            }
            bus.events()
        };

        self.rearm(wanted)?;
        if self.mutex.unlocked_in_callback() {
            Ok(DrainOutcome::UnlockedAndIoHandled)
        } else {
            Ok(DrainOutcome::IoHandled)
        }
    }

    /// Moves the device to exactly one of write or read interest.
    ///
    /// Input stays monitored whenever the bus has nothing to write, so
    /// unsolicited messages are still observed.
    fn rearm(&self, wanted: Interest) -> io::Result<()> {
        if wanted.is_writable() {
            self.device.arm(Interest::WRITABLE)
        } else {
            self.device.arm(Interest::READABLE)
        }
    }

    fn flush_deferred(&self, bus: &mut dyn Bus) {
        let slots = std::mem::take(&mut *self.deferred.lock());
        for slot in slots {
            trace!(connection = %self.id, slot = slot.id(), "releasing deferred slot");
            bus.release_slot(slot);
        }
    }

    /// Releases `slot` now if the lock is free, otherwise hands it to the
    /// next lock holder.
    ///
    /// Used from destructors, which cannot wait for the lock.
    pub fn release_slot_deferred(&self, slot: Slot) {
        if self.is_closed() {
            return;
        }
        if self.mutex.try_lock_now(TaskId::next()) {
            {
                let mut bus = self.bus.lock();
                bus.release_slot(slot);
                self.flush_deferred(&mut **bus);
            }
            self.mutex.unlock(false);
        } else {
            self.deferred.lock().push(slot);
        }
    }

    /// Number of slots waiting for the next lock holder.
    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Releases the connection lock held by the caller.
    ///
    /// `from_callback` must be true when called from a bus callback.
    pub fn unlock(&self, from_callback: bool) {
        self.mutex.unlock(from_callback);
    }

    /// Acquires the connection lock for `holder`.
    ///
    /// Fails with [`Error::Closed`] once the connection is closed, and with
    /// [`Error::Aborted`] if `holder` is halted while queued.
    pub async fn lock(&self, holder: &Arc<TaskSignal>) -> Result<BusLock<'_>> {
        self.mutex.lock(holder).await?;
        let lock = BusLock::adopt(self);
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(lock)
    }

    /// Wraps a lock the caller already holds.
    pub fn adopt_lock(&self) -> BusLock<'_> {
        BusLock::adopt(self)
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deregisters the I/O device, closes the bus and halts the pump.
    /// Idempotent.
    ///
    /// Must not be called while the bus is being drained on the same thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(token) = self.device.token.lock().take()
            && let Err(err) = self.device.driver.deregister(token)
        {
            warn!(connection = %self.id, error = %err, "failed to deregister bus descriptor");
        }
        *self.device.armed.lock() = Interest::NONE;
        self.deferred.lock().clear();
        self.bus.lock().close();
        self.handle_io.halt();
        debug!(connection = %self.id, "connection closed");
    }
}

impl ReadyHandler for Connection {
    fn on_readable(&self) {
        if self.handle_io.signal(Condition::HAVE_DBUS_IO) {
            return;
        }
        // Nobody is left to drain the bus; stop reporting.
        if let Err(err) = self.device.stop_input() {
            warn!(connection = %self.id, error = %err, "failed to stop input");
        }
    }

    fn on_writable(&self) {
        if let Err(err) = self.device.stop_output() {
            warn!(connection = %self.id, error = %err, "failed to stop output");
        }
        self.handle_io.signal(Condition::HAVE_DBUS_IO);
    }

    fn on_hangup(&self) {
        debug!(connection = %self.id, "bus descriptor hung up");
    }

    fn on_error(&self) {
        error!(connection = %self.id, "bus descriptor reported an error; stopping the pump");
        self.handle_io.halt();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scoped access to the bus while holding the connection lock.
///
/// Dropping the guard releases pending deferred slots, re-arms the I/O device
/// from the bus's wanted readiness (so work queued under the lock gets
/// flushed by the pump) and then releases the lock.
#[must_use = "dropping the guard releases the connection lock"]
pub struct BusLock<'a> {
    connection: &'a Connection,
    armed: bool,
}

impl std::fmt::Debug for BusLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusLock")
            .field("connection", &self.connection.id)
            .field("armed", &self.armed)
            .finish()
    }
}

impl<'a> BusLock<'a> {
    fn adopt(connection: &'a Connection) -> Self {
        debug_assert!(connection.mutex.is_locked(), "adopting an unlocked connection");
        Self {
            connection,
            armed: true,
        }
    }

    /// The bus. Do not hold the returned guard across an await.
    pub fn bus(&self) -> MutexGuard<'_, Box<dyn Bus>> {
        self.connection.bus.lock()
    }

    /// The connection this guard belongs to.
    #[must_use]
    pub fn connection(&self) -> &'a Connection {
        self.connection
    }

    /// Gives up the guard without releasing the lock, e.g. after a callback
    /// already released it.
    pub fn forget(mut self) {
        self.armed = false;
    }
}

impl Drop for BusLock<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let connection = self.connection;
        if !connection.is_closed() {
            let wanted = {
                let mut bus = connection.bus.lock();
                connection.flush_deferred(&mut **bus);
                bus.events()
            };
            if let Err(err) = connection.rearm(wanted) {
                warn!(connection = %connection.id, error = %err, "failed to re-arm bus descriptor");
            }
        }
        connection.mutex.unlock(false);
    }
}
