//! Deterministic lab runtime for testing.
//!
//! The lab pairs a single-threaded [`LabExecutor`] with an
//! [`IoDriver`](crate::runtime::IoDriver): tasks run until quiescent, then one
//! driver turn delivers readiness, and so on. With the
//! [`LabReactor`](crate::runtime::reactor::LabReactor) the whole loop is
//! deterministic; with the native reactor it drives real sockets.
//!
//! ```ignore
//! let executor = LabExecutor::new();
//! let driver = Arc::new(IoDriver::new(Arc::new(PollReactor::new()?)));
//! let reply = executor.spawn("call", call.run());
//! assert!(run_until(&executor, &driver, || reply.is_finished(), 200));
//! ```

mod executor;

pub use executor::{JoinHandle, LabExecutor};

use crate::runtime::IoDriver;
use crate::tracing_compat::warn;
use std::time::Duration;

/// Driver timeout for one lab round.
pub const ROUND_TIMEOUT: Duration = Duration::from_millis(5);

/// Alternates executor runs and driver turns until `done` holds.
///
/// Returns false if `done` still fails after `max_rounds` rounds.
pub fn run_until(
    executor: &LabExecutor,
    driver: &IoDriver,
    mut done: impl FnMut() -> bool,
    max_rounds: usize,
) -> bool {
    for _ in 0..max_rounds {
        executor.run_until_quiescent();
        if done() {
            return true;
        }
        if let Err(err) = driver.turn(Some(ROUND_TIMEOUT)) {
            warn!(error = %err, "lab driver turn failed");
        }
    }
    executor.run_until_quiescent();
    done()
}
