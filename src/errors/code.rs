//! Numeric error codes and errno values.

use super::system::errno_name;
use core::fmt;

/// Category of the sentinel codes produced for unresolvable error names.
pub const SYSTEM_CATEGORY: &str = "system";

/// A numeric error code within a category, in the style of `std::error_code`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    category: String,
    value: i32,
    message: String,
}

impl ErrorCode {
    pub(crate) fn in_domain(domain: &str, value: i32, member: &str) -> Self {
        Self {
            category: format!("DBus:{domain}"),
            value,
            message: member.to_owned(),
        }
    }

    /// A code in the `system` category carrying a plain errno.
    #[must_use]
    pub fn system(errno: Errno) -> Self {
        Self {
            category: SYSTEM_CATEGORY.to_owned(),
            value: errno.code(),
            message: errno.description(),
        }
    }

    /// Sentinel for an error name whose domain is not registered.
    #[must_use]
    pub fn unknown_domain() -> Self {
        Self::system(Errno::EBADR)
    }

    /// Sentinel for an unknown member of a registered domain.
    #[must_use]
    pub fn unknown_member() -> Self {
        Self::system(Errno::EBADRQC)
    }

    /// Category name, e.g. `DBus:org.freedesktop.DBus.Error`.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Numeric value within the category.
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.value
    }

    /// Human readable message: the member name, or the errno description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true for the unknown-domain sentinel.
    #[must_use]
    pub fn is_unknown_domain(&self) -> bool {
        self.category == SYSTEM_CATEGORY && self.value == Errno::EBADR.code()
    }

    /// Returns true for the unknown-member sentinel.
    #[must_use]
    pub fn is_unknown_member(&self) -> bool {
        self.category == SYSTEM_CATEGORY && self.value == Errno::EBADRQC.code()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} [{}]", self.category, self.value, self.message)
    }
}

/// A positive errno value reported by a bus primitive.
///
/// Bus primitives report failure as a negative status; [`Errno::from_status`]
/// converts such a status.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    /// Invalid request descriptor.
    pub const EBADR: Self = Self(libc::EBADR);
    /// Invalid request code.
    pub const EBADRQC: Self = Self(libc::EBADRQC);
    /// Transport endpoint is not connected.
    pub const ENOTCONN: Self = Self(libc::ENOTCONN);
    /// Invalid argument.
    pub const EINVAL: Self = Self(libc::EINVAL);
    /// File exists.
    pub const EEXIST: Self = Self(libc::EEXIST);
    /// Input/output error.
    pub const EIO: Self = Self(libc::EIO);
    /// Connection reset by peer.
    pub const ECONNRESET: Self = Self(libc::ECONNRESET);

    /// Wraps an errno value; the sign is ignored.
    #[must_use]
    pub const fn new(code: i32) -> Self {
        Self(code.wrapping_abs())
    }

    /// Converts a negative primitive status into an errno.
    #[must_use]
    pub const fn from_status(status: i32) -> Option<Self> {
        if status < 0 {
            Some(Self::new(status))
        } else {
            None
        }
    }

    /// The positive errno value.
    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Symbolic name such as `ENOTCONN`, if known.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        errno_name(self.0)
    }

    /// Operating system description of the errno.
    #[must_use]
    pub fn description(self) -> String {
        let text = std::io::Error::from_raw_os_error(self.0).to_string();
        match text.rfind(" (os error") {
            Some(at) => text[..at].to_owned(),
            None => text,
        }
    }
}

impl From<Errno> for std::io::Error {
    fn from(errno: Errno) -> Self {
        Self::from_raw_os_error(errno.0)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Errno({name})"),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}: {}", self.description()),
            None => write!(f, "errno {}: {}", self.0, self.description()),
        }
    }
}
