//! Exported objects.

use crate::broker::Broker;
use crate::bus::{Bus, Disposition, ObjectHandler};
use crate::connection::slot::Registration;
use crate::error::{Error, Result};
use crate::errors::BusError;
use crate::message::MessageRead;
use crate::sync::{Condition, TaskCtl, TaskSignal};
use crate::tracing_compat::{debug, trace};
use crate::types::{BrokerKey, Interface};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct StopState {
    stopped: bool,
    signal: Option<Arc<TaskSignal>>,
}

/// Requests an [`ObjectExport`] to stop.
///
/// Usable before the export starts running; a stop requested early takes
/// effect as soon as the export is installed.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    state: Arc<Mutex<StopState>>,
}

impl StopHandle {
    /// Stops the export.
    pub fn stop(&self) {
        let signal = {
            let mut state = self.state.lock();
            state.stopped = true;
            state.signal.clone()
        };
        if let Some(signal) = signal {
            signal.signal(Condition::STOP_CALLED);
        }
    }

    /// Returns true once stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    fn attach(&self, signal: &Arc<TaskSignal>) {
        let mut state = self.state.lock();
        state.signal = Some(signal.clone());
        if state.stopped {
            signal.signal(Condition::STOP_CALLED);
        }
    }
}

struct ExportAdapter {
    inner: Box<dyn ObjectHandler>,
    interface: String,
    armed: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    signal: Arc<TaskSignal>,
}

impl ObjectHandler for ExportAdapter {
    fn handle(&mut self, bus: &mut dyn Bus, call: &MessageRead) -> Result<Disposition, BusError> {
        if !self.armed.load(Ordering::Acquire) {
            return Ok(Disposition::NotHandled);
        }
        if call.interface() != Some(self.interface.as_str()) {
            return Ok(Disposition::NotHandled);
        }
        let result = self.inner.handle(bus, call);
        if let Ok(Disposition::Release) = result {
            self.released.store(true, Ordering::Release);
            self.signal.signal(Condition::STOP_CALLED);
        }
        result
    }
}

/// Serves one interface at an object path until stopped.
///
/// Calls for other interfaces on the same path are answered with
/// `UnknownMethod`. The export ends when [`StopHandle::stop`] is called or
/// when the handler returns [`Disposition::Release`].
#[must_use = "an object export does nothing until run"]
pub struct ObjectExport {
    broker: Broker,
    key: BrokerKey,
    interface: Interface,
    handler: Box<dyn ObjectHandler>,
    stop: StopHandle,
}

impl std::fmt::Debug for ObjectExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectExport")
            .field("key", &self.key)
            .field("interface", &self.interface)
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

impl ObjectExport {
    /// Exports `handler` for `interface` over the connection for `key`.
    pub fn new(
        broker: &Broker,
        key: BrokerKey,
        interface: Interface,
        handler: impl ObjectHandler + 'static,
    ) -> Self {
        Self {
            broker: broker.clone(),
            key,
            interface,
            handler: Box::new(handler),
            stop: StopHandle::default(),
        }
    }

    /// Handle that stops this export.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Installs the object and serves it until stopped.
    pub async fn run(self) -> Result<()> {
        let Self {
            broker,
            key,
            interface,
            handler,
            stop,
        } = self;
        let ctl = TaskCtl::new("ObjectExport");
        stop.attach(ctl.signal());
        let connection_handle = broker.request(&key, &ctl).await?;
        let connection = connection_handle.connection();

        let released = Arc::new(AtomicBool::new(false));
        let mut registration = Registration::new(connection.clone());
        {
            let lock = connection.lock(ctl.signal()).await?;
            let adapter = ExportAdapter {
                inner: handler,
                interface: interface.interface_name().to_owned(),
                armed: registration.armed(),
                released: released.clone(),
                signal: ctl.signal().clone(),
            };
            let slot = lock
                .bus()
                .add_object(interface.object_path(), Box::new(adapter))
                .map_err(|errno| Error::bus("add_object", errno))?;
            registration.set_slot(slot);
            debug!(%interface, task = %ctl.id(), "object exported");
        }

        ctl.wait(Condition::STOP_CALLED).await?;
        if released.load(Ordering::Acquire) {
            registration.consumed();
        } else {
            registration.release(ctl.signal()).await?;
        }
        trace!(%interface, "object export stopped");
        Ok(())
    }
}
