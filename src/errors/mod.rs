//! Remote error values and their mapping to numeric codes.
//!
//! - [`BusError`]: a structured remote error (`name`, optional `message`)
//! - [`ErrorCode`]: numeric code within a registered domain
//! - [`ErrorDomainRegistry`]: the process-wide domain table
//! - [`freedesktop`] / [`system`]: the pre-registered standard domains

mod code;
pub mod domain;
pub mod freedesktop;
pub mod system;

pub use code::{Errno, ErrorCode, SYSTEM_CATEGORY};
pub use domain::{EnumDomain, ErrorDomain, ErrorDomainRegistry};

use core::fmt;

/// A structured error as carried by a method-error reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusError {
    name: String,
    message: Option<String>,
}

impl BusError {
    /// Creates an error with a name such as `org.example.Error.Member`.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: Some(message.into()),
        }
    }

    /// Creates an error without a message.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: None,
        }
    }

    /// Builds a `System.Error.<ERRNO>` error, or `org.freedesktop.DBus.Error.Failed`
    /// for errno values without a symbolic name.
    #[must_use]
    pub fn from_errno(errno: Errno) -> Self {
        let name = errno.name().map_or_else(
            || freedesktop::error_name("Failed"),
            |name| format!("{}.{name}", system::SystemDomain::NAME),
        );
        Self::new(name, errno.description())
    }

    /// The full error name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human readable message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Maps the name to a code through the global registry.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        ErrorDomainRegistry::global().error_code(&self.name)
    }

    /// Returns true if this is the standard error `org.freedesktop.DBus.Error.<member>`.
    #[must_use]
    pub fn is_standard(&self, member: &str) -> bool {
        self.name
            .strip_prefix(freedesktop::DOMAIN)
            .and_then(|rest| rest.strip_prefix('.'))
            == Some(member)
    }
}

impl From<Errno> for BusError {
    fn from(errno: Errno) -> Self {
        Self::from_errno(errno)
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{{ \"{}\" [{message}] }}", self.name),
            None => write!(f, "{{ \"{}\" }}", self.name),
        }
    }
}

impl std::error::Error for BusError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_maps_into_standard_domain() {
        let err = BusError::new("org.freedesktop.DBus.Error.Disconnected", "gone");
        let code = err.code();
        assert_eq!(code.category(), "DBus:org.freedesktop.DBus.Error");
        assert_eq!(code.value(), 17);
        assert_eq!(code.message(), "Disconnected");
        assert!(err.is_standard("Disconnected"));
    }

    #[test]
    fn unknown_domain_maps_to_sentinel() {
        let code = BusError::named("flup.wop.Haha").code();
        assert!(code.is_unknown_domain());
        assert_eq!(code.value(), libc::EBADR);
    }

    #[test]
    fn unknown_member_maps_to_sentinel() {
        let code = BusError::named("org.freedesktop.DBus.Error.Haha").code();
        assert!(code.is_unknown_member());
        assert_eq!(code.value(), libc::EBADRQC);
    }

    #[test]
    fn errno_round_trips_through_system_domain() {
        let err = BusError::from_errno(Errno::new(libc::ENOTSUP));
        assert_eq!(err.name(), "System.Error.ENOTSUP");
        let code = err.code();
        assert_eq!(code.category(), "DBus:System.Error");
        assert_eq!(code.value(), libc::ENOTSUP);
        assert_eq!(code.to_string(), "DBus:System.Error:95 [ENOTSUP]");
    }

    #[test]
    fn display_quotes_name() {
        let err = BusError::new("org.example.Error.Bad", "it broke");
        assert_eq!(err.to_string(), "{ \"org.example.Error.Bad\" [it broke] }");
        assert_eq!(BusError::named("a.b").to_string(), "{ \"a.b\" }");
    }
}
