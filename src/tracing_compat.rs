//! Optional tracing integration.
//!
//! With the `tracing-integration` feature enabled the logging macros below are
//! re-exports of the [`tracing`](https://docs.rs/tracing) macros and accept the
//! full structured-field syntax. Without it they expand to nothing, so the
//! connection core pays no logging cost.
//!
//! ```ignore
//! use crate::tracing_compat::{debug, trace};
//!
//! trace!(task = %id, state = "wait_for_lock", "pump transition");
//! debug!(service = name, "connection established");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }
    macro_rules! info {
        ($($arg:tt)*) => {};
    }
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub(crate) use {debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
#[allow(unused_imports)]
pub(crate) use noop::{debug, error, info, trace, warn};
