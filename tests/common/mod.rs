//! Shared fixtures for integration tests.

#![allow(dead_code)]

pub use dbus_task::test_utils::init_test_logging;
pub use dbus_task::{test_complete, test_phase, test_section};

use dbus_task::bus::loopback::LoopbackFactory;
use dbus_task::bus::{Bus, BusFactory, Disposition, ObjectHandler};
use dbus_task::config::BusConfig;
use dbus_task::errors::{BusError, EnumDomain, ErrorDomainRegistry, freedesktop};
use dbus_task::lab::{self, JoinHandle, LabExecutor};
use dbus_task::message::MessageRead;
use dbus_task::runtime::IoDriver;
use dbus_task::runtime::reactor::PollReactor;
use dbus_task::types::{BrokerKey, Destination, Interface, NameFlags};
use dbus_task::{Broker, ObjectExport, StopHandle};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

/// Rounds allowed for one scenario step.
pub const MAX_ROUNDS: usize = 400;

pub const SERVICE: &str = "org.sdbuscpp.concatenator";
pub const OBJECT_PATH: &str = "/org/sdbuscpp/concatenator";
pub const INTERFACE: &str = "org.sdbuscpp.Concatenator";
pub const ERROR_DOMAIN_NAME: &str = "org.sdbuscpp.Concatenator.Error";

pub const CONCATENATOR_ERRORS: EnumDomain = EnumDomain::new(ERROR_DOMAIN_NAME, &["NoNumbers"]);

/// Registers the concatenator error domain once per process.
pub fn register_concatenator_errors() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        ErrorDomainRegistry::global()
            .register(Arc::new(CONCATENATOR_ERRORS))
            .expect("domain registered twice");
    });
}

/// Executor, native reactor, loopback buses and a broker.
pub struct Fixture {
    pub executor: LabExecutor,
    pub driver: Arc<IoDriver>,
    pub factory: Arc<LoopbackFactory>,
    pub broker: Broker,
}

impl Fixture {
    pub fn new() -> Self {
        let executor = LabExecutor::new();
        let config = BusConfig::default();
        let reactor = Arc::new(PollReactor::new().expect("poll reactor"));
        let driver = Arc::new(config.driver.build(reactor));
        let factory = Arc::new(LoopbackFactory::new());
        let bus_factory: Arc<dyn BusFactory> = factory.clone();
        let broker = Broker::new(config, bus_factory, driver.clone(), executor.spawner());
        Self {
            executor,
            driver,
            factory,
            broker,
        }
    }

    pub fn spawn<F, T>(&self, name: &'static str, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.executor.spawn(name, future)
    }

    /// Runs executor and driver until `done` holds.
    pub fn run_until(&self, done: impl FnMut() -> bool) -> bool {
        lab::run_until(&self.executor, &self.driver, done, MAX_ROUNDS)
    }

    /// Runs until `handle` finishes and returns its output.
    pub fn finish<T>(&self, handle: &JoinHandle<T>) -> T {
        assert!(
            self.run_until(|| handle.is_finished()),
            "task {} did not finish",
            handle.id()
        );
        handle.try_take().expect("output")
    }

    /// Runs a few rounds without a completion condition.
    pub fn settle(&self, rounds: usize) {
        lab::run_until(&self.executor, &self.driver, || false, rounds);
    }

    /// Exports the concatenator service and waits until it is reachable.
    pub fn start_concatenator(&self) -> Concatenator {
        register_concatenator_errors();
        let key = server_key();
        let calls = Arc::new(AtomicUsize::new(0));
        let export = ObjectExport::new(
            &self.broker,
            key.clone(),
            Interface::new(SERVICE, OBJECT_PATH, INTERFACE),
            concatenator(calls.clone()),
        );
        let stop = export.stop_handle();
        let task = self.spawn("concatenator", export.run());
        assert!(
            self.run_until(|| self.broker.cached(&key).is_some()),
            "service connection was not set up"
        );
        self.executor.run_until_quiescent();
        assert_eq!(
            self.factory.user_hub().owner_of(SERVICE),
            self.broker.cached(&key).map(|h| h.unique_name().to_owned())
        );
        Concatenator { task, stop, calls }
    }
}

/// A running concatenator export.
pub struct Concatenator {
    pub task: JoinHandle<dbus_task::Result<()>>,
    pub stop: StopHandle,
    pub calls: Arc<AtomicUsize>,
}

impl Concatenator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Key of the connection that owns the service name.
pub fn server_key() -> BrokerKey {
    BrokerKey::user().with_service_name(SERVICE, NameFlags::NONE)
}

pub fn method(member: &str) -> Destination {
    Destination::new(SERVICE, OBJECT_PATH, INTERFACE, member)
}

pub fn signal(member: &str) -> Destination {
    Destination::new(SERVICE, OBJECT_PATH, INTERFACE, member)
}

fn invalid_args(err: impl std::fmt::Display) -> BusError {
    BusError::new(freedesktop::error_name("InvalidArgs"), err.to_string())
}

/// `concatenate(ai numbers, s separator) -> s`; also emits `concatenated(s)`.
///
/// `hold(ai)` is counted but never answered.
pub fn concatenator(calls: Arc<AtomicUsize>) -> impl ObjectHandler + 'static {
    move |bus: &mut dyn Bus, call: &MessageRead| -> Result<Disposition, BusError> {
        calls.fetch_add(1, Ordering::SeqCst);
        if call.is_method_call(Some(INTERFACE), Some("hold")) {
            return Ok(Disposition::Keep);
        }
        if !call.is_method_call(Some(INTERFACE), Some("concatenate")) {
            return Ok(Disposition::NotHandled);
        }
        let mut args = call.clone();
        let numbers = args.read_array::<i32>().map_err(invalid_args)?;
        let separator = args.read::<String>().map_err(invalid_args)?;
        if numbers.is_empty() {
            return Err(BusError::new(
                format!("{ERROR_DOMAIN_NAME}.NoNumbers"),
                "No numbers provided",
            ));
        }
        let result = numbers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(&separator);
        let body = result.clone();
        bus.reply_method_return(call, move |reply| {
            reply.append(body);
        })
        .map_err(BusError::from)?;
        bus.emit_signal(OBJECT_PATH, INTERFACE, "concatenated", move |signal| {
            signal.append(result);
        })
        .map_err(BusError::from)?;
        Ok(Disposition::Keep)
    }
}
