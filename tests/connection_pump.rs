//! Pump and connection-lock behavior under the deterministic lab.
//!
//! A scripted bus stands in for the native connection and the lab reactor
//! delivers readiness only when a test injects it, so every drain and every
//! lock hand-off happens at a known point.

#[macro_use]
mod common;

use common::*;
use dbus_task::bus::scripted::Script;
use dbus_task::connection::{Connection, ConnectionPumpTask};
use dbus_task::errors::Errno;
use dbus_task::lab::LabExecutor;
use dbus_task::runtime::reactor::{Event, LabReactor};
use dbus_task::runtime::{Interest, IoDriver, Reactor};
use dbus_task::sync::{Condition, ConnectionMutex, TaskCtl, TaskSignal};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

struct Rig {
    executor: LabExecutor,
    reactor: Arc<LabReactor>,
    driver: Arc<IoDriver>,
    script: Script,
    connection: Arc<Connection>,
}

impl Rig {
    fn new() -> Self {
        let reactor = Arc::new(LabReactor::new());
        let driver = Arc::new(IoDriver::new(reactor.clone()));
        let script = Script::new();
        let bus = Box::new(script.bus().expect("scripted bus"));
        let connection =
            Connection::open(bus, &driver, TaskSignal::new("pump")).expect("open connection");
        Self {
            executor: LabExecutor::new(),
            reactor,
            driver,
            script,
            connection,
        }
    }

    fn inject(&self, event: fn(dbus_task::runtime::Token) -> Event) {
        let token = self.connection.token().expect("registered");
        self.reactor.inject_event(token, event(token), Duration::ZERO);
        self.driver.turn(Some(Duration::ZERO)).expect("turn");
        self.executor.run_until_quiescent();
    }

    fn armed(&self) -> Option<Interest> {
        self.reactor
            .interest(self.connection.token().expect("registered"))
    }
}

type Journal = Arc<Mutex<Vec<&'static str>>>;

fn note(journal: &Journal, entry: &'static str) {
    journal.lock().push(entry);
}

#[test]
fn pump_follows_reactor_readiness() {
    init_test("pump_follows_reactor_readiness");
    let rig = Rig::new();
    let pump = ConnectionPumpTask::new(rig.connection.clone());
    let abort = pump.handle();
    let task = rig.executor.spawn("pump", pump);
    rig.executor.run_until_quiescent();

    test_section!("first drain on writability");
    assert_eq!(rig.armed(), Some(Interest::WRITABLE));
    assert_eq!(rig.script.process_calls(), 0);
    rig.inject(Event::writable);
    assert_eq!(rig.script.process_calls(), 1);
    assert_eq!(rig.armed(), Some(Interest::READABLE));

    test_section!("readable drains until idle");
    rig.script.push_work(3);
    rig.inject(Event::readable);
    assert_eq!(rig.script.process_calls(), 5);
    assert_eq!(rig.script.remaining(), 0);
    assert!(!rig.connection.mutex().is_locked());

    test_section!("abort");
    abort.abort();
    rig.executor.run_until_quiescent();
    assert!(matches!(task.try_take(), Some(Ok(()))));
    assert!(rig.script.is_closed());
    assert_eq!(rig.reactor.registration_count(), 0);
    test_complete!("pump_follows_reactor_readiness");
}

#[test]
fn pump_waits_its_turn_for_the_lock() {
    init_test("pump_waits_its_turn_for_the_lock");
    let rig = Rig::new();
    let journal: Journal = Arc::default();
    let _pump = rig
        .executor
        .spawn("pump", ConnectionPumpTask::new(rig.connection.clone()));
    rig.executor.run_until_quiescent();

    test_section!("a task holds the lock");
    let holder = TaskCtl::new("holder");
    let release = holder.signal().clone();
    let connection = rig.connection.clone();
    let log = journal.clone();
    let first = rig.executor.spawn("holder", async move {
        let lock = connection.lock(holder.signal()).await?;
        note(&log, "a-locked");
        holder.wait(Condition::STOP_CALLED).await?;
        drop(lock);
        note(&log, "a-unlocked");
        Ok::<_, dbus_task::Error>(())
    });
    rig.executor.run_until_quiescent();
    assert!(rig.connection.mutex().is_locked());

    test_section!("pump and a second task queue behind it");
    let log = journal.clone();
    rig.script.push_hook(move || note(&log, "drain"));
    rig.inject(Event::writable);
    assert_eq!(rig.script.process_calls(), 0);

    let connection = rig.connection.clone();
    let log = journal.clone();
    let second = rig.executor.spawn("second", async move {
        let ctl = TaskCtl::new("second");
        let _lock = connection.lock(ctl.signal()).await?;
        note(&log, "b-locked");
        Ok::<_, dbus_task::Error>(())
    });
    rig.executor.run_until_quiescent();
    assert_eq!(rig.connection.mutex().waiter_count(), 2);

    test_section!("release hands over in FIFO order");
    release.signal(Condition::STOP_CALLED);
    rig.executor.run_until_quiescent();
    assert!(matches!(first.try_take(), Some(Ok(()))));
    assert!(matches!(second.try_take(), Some(Ok(()))));
    assert_eq!(
        *journal.lock(),
        vec!["a-locked", "a-unlocked", "drain", "b-locked"]
    );
    assert!(!rig.connection.mutex().is_locked());
    test_complete!("pump_waits_its_turn_for_the_lock");
}

#[test]
fn callback_unlock_lets_a_waiter_run_mid_drain() {
    init_test("callback_unlock_lets_a_waiter_run_mid_drain");
    let rig = Rig::new();
    let journal: Journal = Arc::default();
    let _pump = rig
        .executor
        .spawn("pump", ConnectionPumpTask::new(rig.connection.clone()));
    rig.executor.run_until_quiescent();

    let holder = TaskCtl::new("holder");
    let release = holder.signal().clone();
    let connection = rig.connection.clone();
    let _first = rig.executor.spawn("holder", async move {
        let lock = connection.lock(holder.signal()).await?;
        holder.wait(Condition::STOP_CALLED).await?;
        drop(lock);
        Ok::<_, dbus_task::Error>(())
    });
    rig.executor.run_until_quiescent();

    let weak = Arc::downgrade(&rig.connection);
    let log = journal.clone();
    rig.script.push_hook(move || {
        note(&log, "reply");
        if let Some(connection) = weak.upgrade() {
            connection.unlock(true);
        }
    });
    let log = journal.clone();
    rig.script.push_hook(move || note(&log, "rest"));
    rig.inject(Event::writable);

    let connection = rig.connection.clone();
    let log = journal.clone();
    let waiter = rig.executor.spawn("waiter", async move {
        let ctl = TaskCtl::new("waiter");
        let _lock = connection.lock(ctl.signal()).await?;
        note(&log, "waiter");
        Ok::<_, dbus_task::Error>(())
    });
    rig.executor.run_until_quiescent();

    release.signal(Condition::STOP_CALLED);
    rig.executor.run_until_quiescent();
    assert!(matches!(waiter.try_take(), Some(Ok(()))));
    assert_eq!(*journal.lock(), vec!["reply", "waiter", "rest"]);
    assert_eq!(rig.script.remaining(), 0);
    assert!(!rig.connection.mutex().is_locked());
    test_complete!("callback_unlock_lets_a_waiter_run_mid_drain");
}

#[test]
fn drain_failure_closes_the_connection() {
    init_test("drain_failure_closes_the_connection");
    let rig = Rig::new();
    let pump = rig
        .executor
        .spawn("pump", ConnectionPumpTask::new(rig.connection.clone()));
    rig.executor.run_until_quiescent();

    rig.script.push_failure(Errno::ECONNRESET);
    rig.inject(Event::writable);
    let err = pump
        .try_take()
        .expect("pump finished")
        .expect_err("drain failed");
    assert_eq!(err.errno(), Some(Errno::ECONNRESET));
    assert!(rig.connection.is_closed());

    let connection = rig.connection.clone();
    let late = rig.executor.spawn("late", async move {
        let ctl = TaskCtl::new("late");
        connection.lock(ctl.signal()).await.map(|_| ())
    });
    rig.executor.run_until_quiescent();
    assert!(matches!(late.try_take(), Some(Err(dbus_task::Error::Closed))));
    test_complete!("drain_failure_closes_the_connection");
}

#[test]
fn deferred_release_is_flushed_by_the_next_drain() {
    init_test("deferred_release_is_flushed_by_the_next_drain");
    let rig = Rig::new();
    let _pump = rig
        .executor
        .spawn("pump", ConnectionPumpTask::new(rig.connection.clone()));
    rig.executor.run_until_quiescent();

    // Hold the lock from inside a drain so the release has to be deferred.
    let released = Arc::new(Mutex::new(false));
    let connection = Arc::downgrade(&rig.connection);
    let seen = released.clone();
    rig.script.push_hook(move || {
        if let Some(connection) = connection.upgrade() {
            connection.release_slot_deferred(dbus_task::Slot::new(1, 42));
            *seen.lock() = connection.deferred_count() == 1;
        }
    });
    rig.inject(Event::writable);
    assert!(*released.lock(), "release was not deferred");
    assert!(rig.script.released_slots().is_empty());

    rig.inject(Event::readable);
    assert_eq!(rig.script.released_slots(), vec![dbus_task::Slot::new(1, 42)]);
    assert_eq!(rig.connection.deferred_count(), 0);
    test_complete!("deferred_release_is_flushed_by_the_next_drain");
}

// Helper to force a yield
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

async fn yield_now() {
    YieldNow { yielded: false }.await;
}

#[test]
fn seeded_interleavings_grant_every_request_once() {
    init_test("seeded_interleavings_grant_every_request_once");
    const TASKS: usize = 6;
    const ROUNDS: usize = 3;

    for seed in 0..16u64 {
        let rig = Rig::new();
        let _pump = rig
            .executor
            .spawn("pump", ConnectionPumpTask::new(rig.connection.clone()));
        let inside = Arc::new(AtomicUsize::new(0));
        let granted = Arc::new(AtomicUsize::new(0));
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut order: Vec<usize> = (0..TASKS).collect();
        rng.shuffle(&mut order);

        let handles: Vec<_> = order
            .iter()
            .map(|&task| {
                let connection = rig.connection.clone();
                let inside = inside.clone();
                let granted = granted.clone();
                let pauses: Vec<usize> = (0..ROUNDS).map(|_| rng.usize(0..3)).collect();
                rig.executor.spawn("locker", async move {
                    let ctl = TaskCtl::new("locker");
                    for pause in pauses {
                        let lock = connection.lock(ctl.signal()).await?;
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "task {task}");
                        for _ in 0..pause {
                            yield_now().await;
                        }
                        inside.fetch_sub(1, Ordering::SeqCst);
                        granted.fetch_add(1, Ordering::SeqCst);
                        drop(lock);
                        yield_now().await;
                    }
                    Ok::<_, dbus_task::Error>(())
                })
            })
            .collect();

        // Readiness arrives while the tasks contend.
        rig.script.push_work(rng.usize(0..4));
        rig.inject(Event::writable);
        rig.executor.run_until_quiescent();

        for handle in &handles {
            assert!(matches!(handle.try_take(), Some(Ok(()))), "seed {seed}");
        }
        assert_eq!(granted.load(Ordering::SeqCst), TASKS * ROUNDS, "seed {seed}");
        assert_eq!(rig.script.remaining(), 0, "seed {seed}");
        assert!(!rig.connection.mutex().is_locked(), "seed {seed}");
        assert_eq!(rig.connection.mutex().waiter_count(), 0, "seed {seed}");
    }
    test_complete!("seeded_interleavings_grant_every_request_once", seeds = 16);
}

#[derive(Debug, Clone, Copy)]
enum Op {
    TryLock(usize),
    Unlock,
    Abandon(usize),
    Halt(usize),
}

const HOLDERS: usize = 4;

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..HOLDERS).prop_map(Op::TryLock),
        3 => Just(Op::Unlock),
        1 => (0..HOLDERS).prop_map(Op::Abandon),
        1 => (0..HOLDERS).prop_map(Op::Halt),
    ]
}

#[derive(Debug, Default)]
struct Model {
    owner: Option<usize>,
    queue: VecDeque<usize>,
    halted: [bool; HOLDERS],
}

impl Model {
    /// Returns the holder the lock was handed to, if any.
    fn hand_off(&mut self) -> Option<usize> {
        while let Some(next) = self.queue.pop_front() {
            if !self.halted[next] {
                self.owner = Some(next);
                return Some(next);
            }
        }
        None
    }
}

proptest! {
    #[test]
    fn mutex_hands_off_in_fifo_order(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mutex = ConnectionMutex::new();
        let signals: Vec<Arc<TaskSignal>> =
            (0..HOLDERS).map(|_| TaskSignal::new("holder")).collect();
        let mut model = Model::default();

        for op in ops {
            let handed = match op {
                Op::TryLock(i) => {
                    let expected = match model.owner {
                        None => {
                            model.owner = Some(i);
                            true
                        }
                        Some(owner) if owner == i => true,
                        Some(_) => {
                            if !model.queue.contains(&i) {
                                model.queue.push_back(i);
                            }
                            false
                        }
                    };
                    prop_assert_eq!(
                        mutex.try_lock(&signals[i], Condition::CONNECTION_LOCKED),
                        expected
                    );
                    None
                }
                Op::Unlock => match model.owner.take() {
                    Some(_) => {
                        mutex.unlock(false);
                        model.hand_off()
                    }
                    None => None,
                },
                Op::Abandon(i) => {
                    mutex.abandon(signals[i].id());
                    model.queue.retain(|q| *q != i);
                    if model.owner == Some(i) {
                        model.owner = None;
                        model.hand_off()
                    } else {
                        None
                    }
                }
                Op::Halt(i) => {
                    signals[i].halt();
                    model.halted[i] = true;
                    None
                }
            };

            if let Some(next) = handed {
                prop_assert!(signals[next].take(Condition::CONNECTION_LOCKED));
            }
            prop_assert_eq!(mutex.owner(), model.owner.map(|i| signals[i].id()));
            prop_assert_eq!(mutex.waiter_count(), model.queue.len());
        }
    }
}
