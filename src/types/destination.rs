//! Addressing value types.

use core::fmt;

/// An interface on a remote object: service name, object path and interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interface {
    service_name: String,
    object_path: String,
    interface_name: String,
}

impl Interface {
    /// Creates a new interface address.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        object_path: impl Into<String>,
        interface_name: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            object_path: object_path.into(),
            interface_name: interface_name.into(),
        }
    }

    /// The well-known or unique bus name of the service.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The object path, e.g. `/org/example/Object`.
    #[must_use]
    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// The interface name, e.g. `org.example.Interface`.
    #[must_use]
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    /// Extends this interface with a member name.
    #[must_use]
    pub fn member(&self, member_name: impl Into<String>) -> Destination {
        Destination {
            interface: self.clone(),
            member_name: member_name.into(),
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.service_name, self.object_path, self.interface_name
        )
    }
}

/// An [`Interface`] plus a method or signal member name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    interface: Interface,
    member_name: String,
}

impl Destination {
    /// Creates a new destination.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        object_path: impl Into<String>,
        interface_name: impl Into<String>,
        member_name: impl Into<String>,
    ) -> Self {
        Interface::new(service_name, object_path, interface_name).member(member_name)
    }

    /// The interface part.
    #[must_use]
    pub const fn interface(&self) -> &Interface {
        &self.interface
    }

    /// The service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.interface.service_name()
    }

    /// The object path.
    #[must_use]
    pub fn object_path(&self) -> &str {
        self.interface.object_path()
    }

    /// The interface name.
    #[must_use]
    pub fn interface_name(&self) -> &str {
        self.interface.interface_name()
    }

    /// The method or signal name.
    #[must_use]
    pub fn member_name(&self) -> &str {
        &self.member_name
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface, self.member_name)
    }
}
