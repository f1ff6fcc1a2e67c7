//! Connection core configuration.
//!
//! ```toml
//! description = "my-app"
//!
//! [driver]
//! events_capacity = 128
//! poll_timeout_ms = 50
//! ```

use crate::connection::DEFAULT_DESCRIPTION;
use crate::error::{Error, Result};
use crate::runtime::{IoDriver, Reactor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Settings applied to every brokered connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Description passed when opening a bus.
    pub description: String,
    /// Event loop settings.
    pub driver: DriverConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            description: DEFAULT_DESCRIPTION.to_owned(),
            driver: DriverConfig::default(),
        }
    }
}

/// I/O driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Events handled per driver turn.
    pub events_capacity: usize,
    /// Upper bound for one driver turn; `None` blocks until an event.
    pub poll_timeout_ms: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            events_capacity: IoDriver::DEFAULT_EVENTS_CAPACITY,
            poll_timeout_ms: None,
        }
    }
}

impl DriverConfig {
    /// Timeout for one turn.
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_ms.map(Duration::from_millis)
    }

    /// Builds a driver over `reactor`.
    #[must_use]
    pub fn build(&self, reactor: Arc<dyn Reactor>) -> IoDriver {
        IoDriver::with_capacity(reactor, self.events_capacity)
    }
}

impl BusConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.description.is_empty() {
            return Err(Error::Config("description must not be empty".into()));
        }
        if self.driver.events_capacity == 0 {
            return Err(Error::Config("driver.events_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Parses and validates a TOML document.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file.
    #[cfg(feature = "config-file")]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BusConfig::default();
        assert_eq!(config.description, "DBusConnection");
        assert_eq!(config.driver.events_capacity, 64);
        assert_eq!(config.driver.poll_timeout(), None);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: BusConfig = toml::from_str("[driver]\npoll_timeout_ms = 25\n").expect("parse");
        assert_eq!(config.description, "DBusConnection");
        assert_eq!(config.driver.poll_timeout(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = BusConfig::default();
        config.driver.events_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
