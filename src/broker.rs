//! Connection broker.
//!
//! The broker hands out shared connections keyed by [`BrokerKey`]. The first
//! request for a key starts one [`ConnectionSetupTask`]; requests that arrive
//! while it runs are queued behind it, and every queued requester receives
//! the same outcome. A finished connection is cached and handed out directly
//! until it closes, after which the next request sets up a fresh one.

use crate::bus::BusFactory;
use crate::config::BusConfig;
use crate::connection::{ConnectionHandle, ConnectionSetupTask};
use crate::error::{Error, Result};
use crate::runtime::{IoDriver, Spawn};
use crate::sync::{Condition, TaskCtl};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::BrokerKey;
use crate::util::DetHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

type Completion = Box<dyn FnOnce(Result<Arc<ConnectionHandle>>) + Send>;

enum Entry {
    Pending(Vec<Completion>),
    Ready(Arc<ConnectionHandle>),
}

struct BrokerInner {
    config: BusConfig,
    factory: Arc<dyn BusFactory>,
    driver: Arc<IoDriver>,
    spawner: Arc<dyn Spawn>,
    entries: Mutex<DetHashMap<BrokerKey, Entry>>,
    setups: AtomicUsize,
}

/// Delivers the outcome of one setup; a setup task dropped before it
/// finishes fails its waiters with [`Error::Aborted`].
struct SetupCompletion {
    broker: Broker,
    key: Option<BrokerKey>,
}

impl SetupCompletion {
    fn finish(&mut self, result: Result<Arc<ConnectionHandle>>) {
        if let Some(key) = self.key.take() {
            self.broker.complete(&key, result);
        }
    }
}

impl Drop for SetupCompletion {
    fn drop(&mut self) {
        if self.key.is_some() {
            debug!(key = ?self.key, "connection setup dropped before finishing");
            self.finish(Err(Error::Aborted));
        }
    }
}

/// Shares connections between requests with equal keys.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("entries", &self.inner.entries.lock().len())
            .field("setups", &self.setup_count())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Creates a broker.
    pub fn new(
        config: BusConfig,
        factory: Arc<dyn BusFactory>,
        driver: Arc<IoDriver>,
        spawner: Arc<dyn Spawn>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                factory,
                driver,
                spawner,
                entries: Mutex::new(DetHashMap::default()),
                setups: AtomicUsize::new(0),
            }),
        }
    }

    /// The driver connections register with.
    #[must_use]
    pub fn driver(&self) -> &Arc<IoDriver> {
        &self.inner.driver
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Requests the connection for `key`; `on_finished` receives it (or the
    /// setup error) exactly once.
    ///
    /// A cached, open connection is delivered before `run` returns.
    pub fn run(
        &self,
        key: &BrokerKey,
        on_finished: impl FnOnce(Result<Arc<ConnectionHandle>>) + Send + 'static,
    ) {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(key) {
            Some(Entry::Ready(handle)) if !handle.is_closed() => {
                let handle = handle.clone();
                drop(entries);
                trace!(%key, "broker cache hit");
                on_finished(Ok(handle));
                return;
            }
            Some(Entry::Pending(waiters)) => {
                trace!(%key, waiters = waiters.len() + 1, "joining pending setup");
                waiters.push(Box::new(on_finished));
                return;
            }
            Some(Entry::Ready(_)) => debug!(%key, "cached connection closed; setting up again"),
            None => {}
        }
        entries.insert(key.clone(), Entry::Pending(vec![Box::new(on_finished)]));
        drop(entries);
        self.start_setup(key.clone());
    }

    fn start_setup(&self, key: BrokerKey) {
        let inner = &self.inner;
        inner.setups.fetch_add(1, Ordering::Relaxed);
        let mut setup = ConnectionSetupTask::new(
            inner.factory.clone(),
            inner.driver.clone(),
            inner.spawner.clone(),
        );
        setup.set_description(inner.config.description.clone());
        key.initialize(&mut setup);
        debug!(%key, "starting connection setup");

        let mut completion = SetupCompletion {
            broker: self.clone(),
            key: Some(key),
        };
        inner.spawner.spawn_boxed(
            "ConnectionSetup",
            Box::pin(async move {
                let result = setup.run().await;
                completion.finish(result);
            }),
        );
    }

    fn complete(&self, key: &BrokerKey, result: Result<Arc<ConnectionHandle>>) {
        let waiters = {
            let mut entries = self.inner.entries.lock();
            let previous = match &result {
                Ok(handle) => entries.insert(key.clone(), Entry::Ready(handle.clone())),
                Err(_) => entries.remove(key),
            };
            match previous {
                Some(Entry::Pending(waiters)) => waiters,
                _ => Vec::new(),
            }
        };
        match result {
            Ok(handle) => {
                debug!(%key, waiters = waiters.len(), "connection ready");
                for waiter in waiters {
                    waiter(Ok(handle.clone()));
                }
            }
            Err(err) => {
                warn!(%key, error = %err, waiters = waiters.len(), "connection setup failed");
                let shared = Arc::new(err);
                for waiter in waiters {
                    waiter(Err(Error::Setup(shared.clone())));
                }
            }
        }
    }

    /// Waits for the connection for `key`.
    pub async fn connection(&self, key: &BrokerKey) -> Result<Arc<ConnectionHandle>> {
        let ctl = TaskCtl::new("BrokerRequest");
        self.request(key, &ctl).await
    }

    /// Waits for the connection for `key` on behalf of the task owning `ctl`.
    pub(crate) async fn request(
        &self,
        key: &BrokerKey,
        ctl: &TaskCtl,
    ) -> Result<Arc<ConnectionHandle>> {
        let mailbox: Arc<Mutex<Option<Result<Arc<ConnectionHandle>>>>> = Arc::default();
        let out = mailbox.clone();
        let signal = ctl.signal().clone();
        self.run(key, move |result| {
            *out.lock() = Some(result);
            signal.signal(Condition::CONNECTION_SET_UP);
        });
        ctl.wait(Condition::CONNECTION_SET_UP).await?;
        let result = mailbox.lock().take();
        result.unwrap_or(Err(Error::Aborted))
    }

    /// The cached connection for `key`, if set up and open.
    #[must_use]
    pub fn cached(&self, key: &BrokerKey) -> Option<Arc<ConnectionHandle>> {
        match self.inner.entries.lock().get(key) {
            Some(Entry::Ready(handle)) if !handle.is_closed() => Some(handle.clone()),
            _ => None,
        }
    }

    /// Number of setups started so far.
    #[must_use]
    pub fn setup_count(&self) -> usize {
        self.inner.setups.load(Ordering::Relaxed)
    }

    /// Closes every cached connection. Blocks on each connection lock.
    pub fn shutdown(&self) {
        let handles: Vec<Arc<ConnectionHandle>> = {
            let mut entries = self.inner.entries.lock();
            let mut handles = Vec::new();
            entries.retain(|_, entry| match entry {
                Entry::Ready(handle) => {
                    handles.push(handle.clone());
                    false
                }
                Entry::Pending(_) => true,
            });
            handles
        };
        for handle in handles {
            handle.close_blocking();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::loopback::LoopbackFactory;
    use crate::runtime::BoxFuture;
    use crate::runtime::reactor::LabReactor;

    type Parked = Arc<Mutex<Vec<BoxFuture>>>;
    type Outcomes = Arc<Mutex<Vec<Result<Arc<ConnectionHandle>>>>>;

    fn broker_parking_setups() -> (Broker, Parked) {
        let parked: Parked = Arc::default();
        let store = parked.clone();
        let spawner = move |_name: &'static str, future: BoxFuture| store.lock().push(future);
        let driver = Arc::new(IoDriver::new(Arc::new(LabReactor::new())));
        let broker = Broker::new(
            BusConfig::default(),
            Arc::new(LoopbackFactory::new()),
            driver,
            Arc::new(spawner),
        );
        (broker, parked)
    }

    fn request(broker: &Broker, key: &BrokerKey, outcomes: &Outcomes) {
        let out = outcomes.clone();
        broker.run(key, move |result| out.lock().push(result));
    }

    #[test]
    fn dropped_setup_fails_waiters_and_is_not_cached() {
        let (broker, parked) = broker_parking_setups();
        let key = BrokerKey::user();
        let outcomes: Outcomes = Arc::default();

        request(&broker, &key, &outcomes);
        request(&broker, &key, &outcomes);
        assert_eq!(broker.setup_count(), 1);
        assert!(outcomes.lock().is_empty());

        let setups = std::mem::take(&mut *parked.lock());
        drop(setups);
        {
            let outcomes = outcomes.lock();
            assert_eq!(outcomes.len(), 2);
            for outcome in outcomes.iter() {
                match outcome {
                    Err(Error::Setup(cause)) => assert!(matches!(**cause, Error::Aborted)),
                    other => panic!("expected an aborted setup, got {other:?}"),
                }
            }
        }
        assert!(broker.cached(&key).is_none());

        request(&broker, &key, &outcomes);
        assert_eq!(broker.setup_count(), 2);
        assert_eq!(parked.lock().len(), 1);
    }
}
