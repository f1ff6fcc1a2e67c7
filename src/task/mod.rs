//! Request tasks.
//!
//! Each request obtains its connection from the [`Broker`](crate::broker::Broker),
//! takes the connection lock only long enough to register with the bus, and
//! then suspends on its own signal until the bus callback fires.
//!
//! - [`MethodCall`]: call a method and wait for the reply
//! - [`MatchSignal`]: wait for one matching signal
//! - [`ObjectExport`]: serve an interface until stopped
//!
//! Aborting a request means dropping its future: the registration it holds is
//! disarmed and released, deferred to the next lock holder if the lock is
//! busy. [`abortable`] wraps a request so that it can be aborted from
//! elsewhere.

mod match_signal;
mod method_call;
mod object;

pub use match_signal::MatchSignal;
pub use method_call::MethodCall;
pub use object::{ObjectExport, StopHandle};

use crate::error::{Error, Result};
use parking_lot::Mutex;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Aborts the paired [`Abortable`].
#[derive(Debug, Clone)]
pub struct AbortHandle {
    state: Arc<AbortState>,
}

impl AbortHandle {
    /// Aborts the request. Its cleanup runs on the next poll.
    pub fn abort(&self) {
        self.state.aborted.store(true, Ordering::Release);
        if let Some(waker) = self.state.waker.lock().take() {
            waker.wake();
        }
    }

    /// Returns true once aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }
}

/// A request that can be aborted through an [`AbortHandle`].
///
/// On abort the inner future is dropped in place (running its cleanup) and
/// the wrapper resolves to [`Error::Aborted`].
#[pin_project]
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Abortable<F> {
    #[pin]
    inner: Option<F>,
    state: Arc<AbortState>,
}

/// Wraps `future` so it can be aborted.
pub fn abortable<F>(future: F) -> (Abortable<F>, AbortHandle) {
    let state = Arc::new(AbortState::default());
    (
        Abortable {
            inner: Some(future),
            state: state.clone(),
        },
        AbortHandle { state },
    )
}

impl<F, T> Future for Abortable<F>
where
    F: Future<Output = Result<T>>,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        if this.state.aborted.load(Ordering::Acquire) {
            this.inner.set(None);
            return Poll::Ready(Err(Error::Aborted));
        }
        *this.state.waker.lock() = Some(cx.waker().clone());
        // Re-check: an abort between the load and the store has no waker.
        if this.state.aborted.load(Ordering::Acquire) {
            this.inner.set(None);
            return Poll::Ready(Err(Error::Aborted));
        }
        let Some(inner) = this.inner.as_mut().as_pin_mut() else {
            return Poll::Ready(Err(Error::Aborted));
        };
        let output = std::task::ready!(inner.poll(cx));
        this.inner.set(None);
        Poll::Ready(output)
    }
}
