//! Registration bookkeeping shared by the request tasks.

use super::Connection;
use crate::bus::{ReplyHandler, Slot};
use crate::error::Result;
use crate::message::MessageRead;
use crate::sync::{Condition, TaskSignal};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Owns one bus registration on behalf of a task.
///
/// While armed, callbacks built with [`armed`](Self::armed) run normally.
/// Dropping the registration disarms those callbacks first and then releases
/// the slot, deferred to the next lock holder if the lock is busy.
pub(crate) struct Registration {
    connection: Arc<Connection>,
    slot: Option<Slot>,
    armed: Arc<AtomicBool>,
}

impl Registration {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            slot: None,
            armed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag checked by callbacks before touching task state.
    pub(crate) fn armed(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub(crate) fn set_slot(&mut self, slot: Slot) {
        debug_assert!(self.slot.is_none(), "registration already holds a slot");
        self.slot = Some(slot);
    }

    /// The bus already dropped the registration (it fired and was one-shot).
    pub(crate) fn consumed(&mut self) {
        self.armed.store(false, Ordering::Release);
        self.slot = None;
    }

    /// Releases the slot under the connection lock.
    pub(crate) async fn release(&mut self, holder: &Arc<TaskSignal>) -> Result<()> {
        self.armed.store(false, Ordering::Release);
        let Some(slot) = self.slot.take() else {
            return Ok(());
        };
        let connection = self.connection.clone();
        match connection.lock(holder).await {
            Ok(lock) => {
                lock.bus().release_slot(slot);
                Ok(())
            }
            Err(err) => {
                self.slot = Some(slot);
                Err(err)
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.armed.store(false, Ordering::Release);
        if let Some(slot) = self.slot.take() {
            self.connection.release_slot_deferred(slot);
        }
    }
}

/// One-shot mailbox filled by a bus callback.
pub(crate) struct ReplyCell {
    signal: Arc<TaskSignal>,
    condition: Condition,
    value: Mutex<Option<MessageRead>>,
}

impl ReplyCell {
    pub(crate) fn new(signal: Arc<TaskSignal>, condition: Condition) -> Arc<Self> {
        Arc::new(Self {
            signal,
            condition,
            value: Mutex::new(None),
        })
    }

    /// Stores `message` and wakes the task. Returns false when the task is
    /// gone.
    pub(crate) fn complete(&self, message: MessageRead) -> bool {
        *self.value.lock() = Some(message);
        self.signal.signal(self.condition)
    }

    pub(crate) fn take(&self) -> Option<MessageRead> {
        self.value.lock().take()
    }

    /// Reply handler feeding this cell while `armed` holds.
    ///
    /// With `yield_lock` set, the handler also releases the connection lock
    /// (as a callback release), letting the woken task run before the pump
    /// drains further.
    pub(crate) fn reply_handler(
        self: &Arc<Self>,
        armed: Arc<AtomicBool>,
        yield_lock: Option<Weak<Connection>>,
    ) -> ReplyHandler {
        let cell = self.clone();
        Box::new(move |_bus, reply| {
            if !armed.load(Ordering::Acquire) || !cell.complete(reply) {
                return;
            }
            if let Some(connection) = yield_lock.and_then(|weak| weak.upgrade()) {
                connection.unlock(true);
            }
        })
    }
}
