//! Test helpers: logging initialization and phase markers.
//!
//! ```ignore
//! use dbus_task::test_utils::init_test_logging;
//!
//! #[test]
//! fn pump_relocks() {
//!     init_test_logging();
//!     dbus_task::test_phase!("pump_relocks");
//!     // ...
//!     dbus_task::test_complete!("pump_relocks");
//! }
//! ```
//!
//! The filter honours `RUST_LOG`; it defaults to `dbus_task=debug`.

use std::sync::Once;

static INIT: Once = Once::new();

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_TEST_FILTER: &str = "dbus_task=debug";

/// Installs a test-writer subscriber once per process.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_TEST_FILTER));
        // Another harness may have installed a global subscriber already.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Logs the start of a test.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::tracing_compat::info!(test = $name, "==== test start ====")
    };
}

/// Logs a named section inside a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        $crate::tracing_compat::info!(section = $name, "---- section ----")
    };
}

/// Logs the end of a test, with optional fields.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::tracing_compat::info!(test = $name, "==== test complete ====")
    };
    ($name:expr, $($field:tt)+) => {
        $crate::tracing_compat::info!(test = $name, $($field)+, "==== test complete ====")
    };
}
