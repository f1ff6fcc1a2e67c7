//! Connection configuration keys.
//!
//! A [`BrokerKey`] describes everything that makes two connections
//! interchangeable: which bus, and which well-known name (with which
//! ownership flags) the connection should request. Two requests with equal
//! keys share one connection through the [`Broker`](crate::broker::Broker).

use crate::connection::ConnectionSetupTask;
use crate::util::DetHasher;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Which message bus to connect to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// The per-user session bus.
    #[default]
    User,
    /// The system-wide bus.
    System,
}

impl BusKind {
    /// Seed for the stable key hash.
    const fn hash_seed(self) -> u64 {
        match self {
            Self::User => 0x9ae1_6a3b_2f90_404f,
            Self::System => 0xa38b_092e_e91a_871f,
        }
    }
}

/// Ownership flags for a well-known name request.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NameFlags(u32);

impl NameFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Take the name over from its current owner if that owner allows it.
    pub const REPLACE_EXISTING: Self = Self(1 << 0);
    /// Let a later requester take the name over.
    pub const ALLOW_REPLACEMENT: Self = Self(1 << 1);
    /// Wait in the owner queue instead of failing when the name is taken.
    pub const QUEUE: Self = Self(1 << 2);

    const NAMES: [(Self, &'static str); 3] = [
        (Self::ALLOW_REPLACEMENT, "ALLOW_REPLACEMENT"),
        (Self::REPLACE_EXISTING, "REPLACE_EXISTING"),
        (Self::QUEUE, "QUEUE"),
    ];

    /// Creates flags from raw bits; unknown bits are dropped.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0b111)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for NameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for NameFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for NameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("0")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NameFlags({self})")
    }
}

/// Identity of a shareable connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerKey {
    service_name: Option<String>,
    #[serde(default)]
    flags: NameFlags,
    #[serde(default)]
    bus: BusKind,
}

impl BrokerKey {
    /// Key for an anonymous connection to the user bus.
    #[must_use]
    pub fn user() -> Self {
        Self::default()
    }

    /// Key for an anonymous connection to the system bus.
    #[must_use]
    pub fn system() -> Self {
        Self {
            bus: BusKind::System,
            ..Self::default()
        }
    }

    /// Requests a well-known service name once the connection is up.
    pub fn request_service_name(&mut self, service_name: impl Into<String>, flags: NameFlags) {
        self.service_name = Some(service_name.into());
        self.flags = flags;
    }

    /// Builder form of [`request_service_name`](Self::request_service_name).
    #[must_use]
    pub fn with_service_name(mut self, service_name: impl Into<String>, flags: NameFlags) -> Self {
        self.request_service_name(service_name, flags);
        self
    }

    /// The requested well-known name, if any.
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Flags for the name request.
    #[must_use]
    pub const fn flags(&self) -> NameFlags {
        self.flags
    }

    /// Which bus this key connects to.
    #[must_use]
    pub const fn bus(&self) -> BusKind {
        self.bus
    }

    /// Returns true for the system bus.
    #[must_use]
    pub fn is_system_bus(&self) -> bool {
        self.bus == BusKind::System
    }

    /// Applies this configuration to a fresh setup task.
    ///
    /// Equal keys always produce identically configured setups.
    pub fn initialize(&self, setup: &mut ConnectionSetupTask) {
        setup.set_bus(self.bus);
        if let Some(name) = &self.service_name {
            setup.request_service_name(name.clone(), self.flags);
        }
    }

    /// Seeded hash that is identical across processes and runs.
    #[must_use]
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = DetHasher::with_seed(self.bus.hash_seed());
        self.hash_fields(&mut hasher);
        hasher.finish()
    }

    fn hash_fields<H: Hasher>(&self, state: &mut H) {
        match &self.service_name {
            Some(name) => {
                state.write_u8(1);
                state.write(name.as_bytes());
            }
            None => state.write_u8(0),
        }
        state.write_u32(self.flags.bits());
    }
}

impl Hash for BrokerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.bus as u8);
        self.hash_fields(state);
    }
}

impl fmt::Display for BrokerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system_bus() {
            f.write_str("system:")?;
        }
        match &self.service_name {
            Some(name) => write!(f, "{{service_name:\"{name}\", flags:{}}}", self.flags),
            None => f.write_str("{}"),
        }
    }
}
