//! Shared handle to a set-up connection.

use super::{BusLock, Connection, PumpHandle};
use crate::error::Result;
use crate::sync::{Condition, TaskSignal};
use crate::tracing_compat::debug;
use crate::types::{BrokerKey, ConnectionId, TaskId};
use std::sync::Arc;

/// A connected bus, its pump, and the identity it was set up with.
///
/// Cloned freely (as `Arc<ConnectionHandle>`) by every task using the
/// connection. Operations on the bus require the connection lock.
#[derive(Debug)]
pub struct ConnectionHandle {
    key: BrokerKey,
    connection: Arc<Connection>,
    pump: PumpHandle,
    unique_name: String,
}

impl ConnectionHandle {
    pub(crate) fn new(
        key: BrokerKey,
        connection: Arc<Connection>,
        pump: PumpHandle,
        unique_name: String,
    ) -> Self {
        Self {
            key,
            connection,
            pump,
            unique_name,
        }
    }

    /// Key the connection was set up for.
    #[must_use]
    pub fn key(&self) -> &BrokerKey {
        &self.key
    }

    /// Unique bus name.
    #[must_use]
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Requested well-known name, if any.
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        self.key.service_name()
    }

    /// Connection identity.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Acquires the connection lock for `holder`.
    pub async fn lock(&self, holder: &Arc<TaskSignal>) -> Result<BusLock<'_>> {
        self.connection.lock(holder).await
    }

    /// Takes the lock if free, otherwise queues `holder` to receive
    /// `condition` when it is handed over.
    pub fn try_lock(&self, holder: &Arc<TaskSignal>, condition: Condition) -> bool {
        self.connection.mutex().try_lock(holder, condition)
    }

    /// Scoped guard over a lock the caller already holds.
    pub fn adopt_lock(&self) -> BusLock<'_> {
        self.connection.adopt_lock()
    }

    /// Parks the thread until `holder` owns the lock. Teardown only.
    pub fn lock_blocking(&self, holder: TaskId) {
        self.connection.mutex().lock_blocking(holder);
    }

    /// Releases the lock from task code.
    pub fn unlock(&self) {
        self.connection.unlock(false);
    }

    /// Releases the lock from inside a bus callback.
    pub fn unlock_in_callback(&self) {
        self.connection.unlock(true);
    }

    /// Returns true once the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Stops the pump and closes the connection, waiting for the lock first.
    ///
    /// Blocks the calling thread; must not run on a thread that also runs the
    /// current lock owner.
    pub fn close_blocking(&self) {
        if self.is_closed() {
            return;
        }
        let holder = TaskId::next();
        self.lock_blocking(holder);
        self.pump.abort();
        self.connection.close();
        self.connection.unlock(false);
        debug!(connection = %self.id(), key = %self.key, "connection shut down");
    }
}
