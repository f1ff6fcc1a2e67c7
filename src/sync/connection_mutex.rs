//! Cooperative mutex guarding one bus connection.
//!
//! Holders are tasks, not threads. A task that cannot take the lock is queued
//! and suspends; `unlock` hands ownership directly to the first queued waiter
//! and delivers that waiter's wake-up condition, so every requester is
//! granted exactly once and in arrival order. A waiter that can no longer be
//! woken (its task was halted) is skipped.
//!
//! Two release flavours exist. A regular release happens from task code. A
//! release from inside a bus callback (the callback runs while the pump task
//! is draining under the lock) additionally raises the
//! `unlocked_in_callback` flag, which tells the pump that it no longer owns
//! the lock and must re-acquire it before touching the bus again.
//!
//! [`ConnectionMutex::lock_blocking`] parks the calling thread. It exists for
//! teardown paths only; using it from a task that shares a thread with the
//! current owner deadlocks.

use super::signal::{Condition, TaskSignal};
use crate::error::Result;
use crate::tracing_compat::trace;
use crate::types::TaskId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

enum Waiter {
    Task {
        signal: Arc<TaskSignal>,
        condition: Condition,
    },
    Blocking(TaskId),
}

impl Waiter {
    fn id(&self) -> TaskId {
        match self {
            Self::Task { signal, .. } => signal.id(),
            Self::Blocking(id) => *id,
        }
    }
}

#[derive(Default)]
struct MutexState {
    owner: Option<TaskId>,
    waiters: VecDeque<Waiter>,
}

/// A cooperative, hand-off mutex keyed to one connection.
#[derive(Default)]
pub struct ConnectionMutex {
    state: Mutex<MutexState>,
    released: Condvar,
    unlocked_in_callback: AtomicBool,
}

impl std::fmt::Debug for ConnectionMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionMutex")
            .field("owner", &state.owner)
            .field("waiters", &state.waiters.len())
            .field(
                "unlocked_in_callback",
                &self.unlocked_in_callback.load(Ordering::Acquire),
            )
            .finish()
    }
}

impl ConnectionMutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to take the lock for `holder`.
    ///
    /// Returns true if `holder` now owns the lock, either immediately or
    /// because ownership was handed to it by an earlier `unlock`. Otherwise
    /// `holder` is queued (once) and `condition` will be delivered to it when
    /// ownership is handed over.
    pub fn try_lock(&self, holder: &Arc<TaskSignal>, condition: Condition) -> bool {
        let id = holder.id();
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(id);
                trace!(holder = %id, "connection locked");
                true
            }
            Some(owner) if owner == id => true,
            Some(owner) => {
                if !state.waiters.iter().any(|w| w.id() == id) {
                    trace!(holder = %id, owner = %owner, "connection busy, queued");
                    state.waiters.push_back(Waiter::Task {
                        signal: holder.clone(),
                        condition,
                    });
                }
                false
            }
        }
    }

    /// Takes the lock only if it is free. Never queues.
    pub fn try_lock_now(&self, holder: TaskId) -> bool {
        let mut state = self.state.lock();
        if state.owner.is_none() {
            state.owner = Some(holder);
            true
        } else {
            false
        }
    }

    /// Acquires the lock for `holder`, async.
    pub fn lock<'a>(&'a self, holder: &'a Arc<TaskSignal>) -> Lock<'a> {
        Lock {
            mutex: self,
            holder,
            state: LockState::Init,
        }
    }

    /// Parks the calling thread until `holder` owns the lock.
    ///
    /// Teardown only; see the module documentation.
    pub fn lock_blocking(&self, holder: TaskId) {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(holder);
                return;
            }
            Some(owner) if owner == holder => {
                debug_assert!(false, "{holder} locked the connection twice");
                return;
            }
            Some(_) => {}
        }
        state.waiters.push_back(Waiter::Blocking(holder));
        while state.owner != Some(holder) {
            self.released.wait(&mut state);
        }
    }

    /// Releases the lock and hands it to the next waiter.
    ///
    /// `from_callback` must be true when called from inside a bus callback
    /// during a drain.
    pub fn unlock(&self, from_callback: bool) {
        let mut state = self.state.lock();
        let Some(owner) = state.owner.take() else {
            debug_assert!(false, "unlock of an unlocked connection mutex");
            return;
        };
        if from_callback {
            self.unlocked_in_callback.store(true, Ordering::Release);
        }
        trace!(holder = %owner, from_callback, "connection unlocked");
        self.hand_off(state);
    }

    /// Drops every claim `holder` has: its queue entry, or the lock itself.
    pub fn abandon(&self, holder: TaskId) {
        let mut state = self.state.lock();
        state.waiters.retain(|w| w.id() != holder);
        if state.owner == Some(holder) {
            state.owner = None;
            trace!(holder = %holder, "lock abandoned");
            self.hand_off(state);
        }
    }

    fn hand_off<'a>(&'a self, mut state: MutexGuard<'a, MutexState>) {
        loop {
            let Some(next) = state.waiters.pop_front() else {
                return;
            };
            match next {
                Waiter::Blocking(id) => {
                    state.owner = Some(id);
                    drop(state);
                    self.released.notify_all();
                    return;
                }
                Waiter::Task { signal, condition } => {
                    let id = signal.id();
                    state.owner = Some(id);
                    drop(state);
                    if signal.signal(condition) {
                        trace!(holder = %id, "lock handed over");
                        return;
                    }
                    state = self.state.lock();
                    if state.owner != Some(id) {
                        return;
                    }
                    trace!(holder = %id, "skipping halted waiter");
                    state.owner = None;
                }
            }
        }
    }

    /// Marks the start of a new ownership period for the pump: clears the
    /// `unlocked_in_callback` flag.
    pub fn obtained_lock(&self) {
        self.unlocked_in_callback.store(false, Ordering::Release);
    }

    /// Returns true if a callback released the lock since the last
    /// [`obtained_lock`](Self::obtained_lock).
    #[must_use]
    pub fn unlocked_in_callback(&self) -> bool {
        self.unlocked_in_callback.load(Ordering::Acquire)
    }

    /// Current owner.
    #[must_use]
    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock().owner
    }

    /// Returns true if `holder` owns the lock.
    #[must_use]
    pub fn is_owner(&self, holder: TaskId) -> bool {
        self.owner() == Some(holder)
    }

    /// Returns true if anyone owns the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Init,
    Queued,
    Done,
}

/// Future returned by [`ConnectionMutex::lock`].
///
/// Dropping it before completion withdraws the request.
#[must_use = "futures do nothing unless polled"]
pub struct Lock<'a> {
    mutex: &'a ConnectionMutex,
    holder: &'a Arc<TaskSignal>,
    state: LockState,
}

impl Future for Lock<'_> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.holder.id();
        if self.state == LockState::Init {
            // A grant from an abandoned earlier request must not count.
            self.holder.take(Condition::CONNECTION_LOCKED);
            if self.mutex.try_lock(self.holder, Condition::CONNECTION_LOCKED) {
                self.state = LockState::Done;
                return Poll::Ready(Ok(()));
            }
            self.state = LockState::Queued;
        }
        loop {
            match self.holder.poll_wait(cx, Condition::CONNECTION_LOCKED) {
                Poll::Ready(Ok(())) if self.mutex.is_owner(id) => {
                    self.state = LockState::Done;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(err)) => {
                    self.mutex.abandon(id);
                    self.state = LockState::Done;
                    return Poll::Ready(Err(err));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        if self.state == LockState::Queued {
            self.mutex.abandon(self.holder.id());
        }
    }
}

/// Scope guard for a lock that is already held.
///
/// Releases the lock when dropped unless [`skip_unlock`](Self::skip_unlock)
/// was called (ownership already released elsewhere).
#[derive(Debug)]
#[must_use = "dropping the guard releases the lock"]
pub struct AdoptLock<'a> {
    mutex: &'a ConnectionMutex,
    armed: bool,
}

impl<'a> AdoptLock<'a> {
    /// Adopts the currently held lock.
    pub fn new(mutex: &'a ConnectionMutex) -> Self {
        debug_assert!(mutex.is_locked(), "adopting an unlocked connection mutex");
        Self { mutex, armed: true }
    }

    /// Leaves the lock as it is.
    pub fn skip_unlock(mut self) {
        self.armed = false;
    }

    /// Releases the lock now.
    pub fn unlock(mut self) {
        self.armed = false;
        self.mutex.unlock(false);
    }

    /// Returns true while the guard will release on drop.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for AdoptLock<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mutex.unlock(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Waker;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn uncontended_lock_is_immediate() {
        let mutex = ConnectionMutex::new();
        let a = TaskSignal::new("a");
        assert!(mutex.try_lock(&a, Condition::CONNECTION_LOCKED));
        assert!(mutex.is_owner(a.id()));
        mutex.unlock(false);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn unlock_hands_off_in_fifo_order() {
        let mutex = ConnectionMutex::new();
        let a = TaskSignal::new("a");
        let b = TaskSignal::new("b");
        let c = TaskSignal::new("c");

        assert!(mutex.try_lock(&a, Condition::CONNECTION_LOCKED));
        assert!(!mutex.try_lock(&b, Condition::CONNECTION_LOCKED));
        assert!(!mutex.try_lock(&c, Condition::CONNECTION_LOCKED));
        // Retrying does not queue twice.
        assert!(!mutex.try_lock(&b, Condition::CONNECTION_LOCKED));
        assert_eq!(mutex.waiter_count(), 2);

        mutex.unlock(false);
        assert!(mutex.is_owner(b.id()));
        assert!(b.take(Condition::CONNECTION_LOCKED));
        assert!(!c.is_pending(Condition::CONNECTION_LOCKED));
        assert!(mutex.try_lock(&b, Condition::CONNECTION_LOCKED));

        mutex.unlock(false);
        assert!(mutex.is_owner(c.id()));
        assert!(c.take(Condition::CONNECTION_LOCKED));
        mutex.unlock(false);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn halted_waiter_is_skipped() {
        let mutex = ConnectionMutex::new();
        let a = TaskSignal::new("a");
        let b = TaskSignal::new("b");
        let c = TaskSignal::new("c");
        assert!(mutex.try_lock(&a, Condition::CONNECTION_LOCKED));
        assert!(!mutex.try_lock(&b, Condition::CONNECTION_LOCKED));
        assert!(!mutex.try_lock(&c, Condition::CONNECTION_LOCKED));

        b.halt();
        mutex.unlock(false);
        assert!(mutex.is_owner(c.id()));
    }

    #[test]
    fn abandon_releases_a_handed_over_lock() {
        let mutex = ConnectionMutex::new();
        let a = TaskSignal::new("a");
        let b = TaskSignal::new("b");
        let c = TaskSignal::new("c");
        assert!(mutex.try_lock(&a, Condition::CONNECTION_LOCKED));
        assert!(!mutex.try_lock(&b, Condition::CONNECTION_LOCKED));
        assert!(!mutex.try_lock(&c, Condition::CONNECTION_LOCKED));

        mutex.unlock(false);
        assert!(mutex.is_owner(b.id()));
        mutex.abandon(b.id());
        assert!(mutex.is_owner(c.id()));

        mutex.abandon(TaskId::new_for_test(u64::MAX));
        assert!(mutex.is_owner(c.id()));
    }

    #[test]
    fn callback_release_sets_flag_until_obtained() {
        let mutex = ConnectionMutex::new();
        let pump = TaskSignal::new("pump");
        assert!(mutex.try_lock(&pump, Condition::CONNECTION_LOCKED));
        mutex.unlock(true);
        assert!(mutex.unlocked_in_callback());

        assert!(mutex.try_lock(&pump, Condition::CONNECTION_LOCKED));
        mutex.obtained_lock();
        assert!(!mutex.unlocked_in_callback());
        mutex.unlock(false);
        assert!(!mutex.unlocked_in_callback());
    }

    #[test]
    fn try_lock_now_never_queues() {
        let mutex = ConnectionMutex::new();
        let a = TaskSignal::new("a");
        assert!(mutex.try_lock(&a, Condition::CONNECTION_LOCKED));
        assert!(!mutex.try_lock_now(TaskId::next()));
        assert_eq!(mutex.waiter_count(), 0);
    }

    #[test]
    fn lock_future_waits_for_hand_off() {
        let mutex = ConnectionMutex::new();
        let a = TaskSignal::new("a");
        let b = TaskSignal::new("b");
        assert!(mutex.try_lock(&a, Condition::CONNECTION_LOCKED));

        let mut lock = Box::pin(mutex.lock(&b));
        let mut cx = Context::from_waker(Waker::noop());
        assert!(lock.as_mut().poll(&mut cx).is_pending());
        mutex.unlock(false);
        assert!(matches!(lock.as_mut().poll(&mut cx), Poll::Ready(Ok(()))));
        assert!(mutex.is_owner(b.id()));
    }

    #[test]
    fn dropped_lock_future_withdraws() {
        let mutex = ConnectionMutex::new();
        let a = TaskSignal::new("a");
        let b = TaskSignal::new("b");
        assert!(mutex.try_lock(&a, Condition::CONNECTION_LOCKED));
        {
            let mut lock = Box::pin(mutex.lock(&b));
            let mut cx = Context::from_waker(Waker::noop());
            assert!(lock.as_mut().poll(&mut cx).is_pending());
        }
        assert_eq!(mutex.waiter_count(), 0);
        mutex.unlock(false);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn blocking_lock_waits_for_release() {
        let mutex = Arc::new(ConnectionMutex::new());
        let owner = TaskSignal::new("owner");
        assert!(mutex.try_lock(&owner, Condition::CONNECTION_LOCKED));

        let blocker = TaskId::next();
        let m = mutex.clone();
        let handle = thread::spawn(move || {
            m.lock_blocking(blocker);
            let owned = m.is_owner(blocker);
            m.unlock(false);
            owned
        });

        while mutex.waiter_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        mutex.unlock(false);
        assert!(handle.join().expect("blocking thread"));
        assert!(!mutex.is_locked());
    }

    #[test]
    fn adopt_lock_releases_unless_skipped() {
        let mutex = ConnectionMutex::new();
        let a = TaskSignal::new("a");
        assert!(mutex.try_lock(&a, Condition::CONNECTION_LOCKED));
        AdoptLock::new(&mutex).skip_unlock();
        assert!(mutex.is_locked());
        drop(AdoptLock::new(&mutex));
        assert!(!mutex.is_locked());
    }
}
