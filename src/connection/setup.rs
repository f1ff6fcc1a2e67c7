//! Opening and configuring a new connection.

use super::slot::{Registration, ReplyCell};
use super::{Connection, ConnectionHandle, ConnectionPumpTask, PumpHandle};
use crate::bus::BusFactory;
use crate::error::{Error, Result};
use crate::runtime::{IoDriver, Spawn};
use crate::sync::{Condition, TaskCtl};
use crate::tracing_compat::{debug, info, warn};
use crate::types::{BrokerKey, BusKind, NameFlags};
use std::sync::Arc;

/// Default connection description.
pub const DEFAULT_DESCRIPTION: &str = "DBusConnection";

/// Aborts the pump unless setup completes.
struct PumpGuard {
    pump: PumpHandle,
    armed: bool,
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pump.abort();
        }
    }
}

/// Opens a bus connection, starts its pump and optionally acquires a
/// well-known name.
pub struct ConnectionSetupTask {
    factory: Arc<dyn BusFactory>,
    driver: Arc<IoDriver>,
    spawner: Arc<dyn Spawn>,
    description: String,
    bus: BusKind,
    service: Option<(String, NameFlags)>,
}

impl std::fmt::Debug for ConnectionSetupTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSetupTask")
            .field("description", &self.description)
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

impl ConnectionSetupTask {
    /// Creates an anonymous user-bus setup.
    pub fn new(
        factory: Arc<dyn BusFactory>,
        driver: Arc<IoDriver>,
        spawner: Arc<dyn Spawn>,
    ) -> Self {
        Self {
            factory,
            driver,
            spawner,
            description: DEFAULT_DESCRIPTION.to_owned(),
            bus: BusKind::User,
            service: None,
        }
    }

    /// Sets the connection description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    /// Selects the bus.
    pub fn set_bus(&mut self, bus: BusKind) {
        self.bus = bus;
    }

    /// Requests `service_name` once connected.
    pub fn request_service_name(&mut self, service_name: impl Into<String>, flags: NameFlags) {
        self.service = Some((service_name.into(), flags));
    }

    /// Configuration this setup will produce.
    #[must_use]
    pub fn key(&self) -> BrokerKey {
        let key = match self.bus {
            BusKind::User => BrokerKey::user(),
            BusKind::System => BrokerKey::system(),
        };
        match &self.service {
            Some((name, flags)) => key.with_service_name(name.clone(), *flags),
            None => key,
        }
    }

    /// Runs the setup.
    ///
    /// On failure the pump is stopped and the connection closed; dropping
    /// the future has the same effect.
    pub async fn run(self) -> Result<Arc<ConnectionHandle>> {
        let key = self.key();
        let bus = match self.bus {
            BusKind::User => self
                .factory
                .open_user(&self.description)
                .map_err(|errno| Error::bus("open_user_bus", errno))?,
            BusKind::System => self
                .factory
                .open_system(&self.description)
                .map_err(|errno| Error::bus("open_system_bus", errno))?,
        };

        let pump_ctl = crate::sync::TaskSignal::new("ConnectionPump");
        let connection = Connection::open(bus, &self.driver, pump_ctl)?;
        let pump = ConnectionPumpTask::new(connection.clone());
        let mut guard = PumpGuard {
            pump: pump.handle(),
            armed: true,
        };
        self.spawner.spawn_boxed("ConnectionPump", Box::pin(pump.run()));

        let ctl = TaskCtl::new("ConnectionSetup");
        let unique_name = {
            let lock = connection.lock(ctl.signal()).await?;
            lock.bus()
                .unique_name()
                .map_err(|errno| Error::bus("get_unique_name", errno))?
        };

        if let Some((service_name, flags)) = &self.service {
            let cell = ReplyCell::new(ctl.signal().clone(), Condition::HAVE_REQUEST_NAME_RESULT);
            let mut registration = Registration::new(connection.clone());
            {
                let lock = connection.lock(ctl.signal()).await?;
                let handler = cell.reply_handler(registration.armed(), None);
                let slot = lock
                    .bus()
                    .request_name_async(service_name, *flags, handler)
                    .map_err(|errno| Error::bus("request_name_async", errno))?;
                registration.set_slot(slot);
            }
            ctl.wait(Condition::HAVE_REQUEST_NAME_RESULT).await?;
            registration.consumed();
            let reply = cell.take().ok_or(Error::Aborted)?;
            if let Some(error) = reply.error() {
                warn!(service = %service_name, %error, "name request refused");
                return Err(Error::Remote(error));
            }
            debug!(service = %service_name, unique_name = %unique_name, "name acquired");
        }

        info!(
            connection = %connection.id(),
            key = %key,
            unique_name = %unique_name,
            "connection set up"
        );
        guard.armed = false;
        Ok(Arc::new(ConnectionHandle::new(
            key,
            connection,
            guard.pump.clone(),
            unique_name,
        )))
    }
}
