//! The standard `org.freedesktop.DBus.Error` domain.

use super::domain::EnumDomain;

/// Domain name of the standard bus errors.
pub const DOMAIN: &str = "org.freedesktop.DBus.Error";

/// The standard bus errors, numbered from `Failed = 1`.
pub const FREEDESKTOP: EnumDomain = EnumDomain::new(
    DOMAIN,
    &[
        "Failed",
        "NoMemory",
        "ServiceUnknown",
        "NameHasNoOwner",
        "NoReply",
        "IOError",
        "BadAddress",
        "NotSupported",
        "LimitsExceeded",
        "AccessDenied",
        "AuthFailed",
        "InteractiveAuthorizationRequired",
        "NoServer",
        "Timeout",
        "NoNetwork",
        "AddressInUse",
        "Disconnected",
        "InvalidArgs",
        "FileNotFound",
        "FileExists",
        "UnknownMethod",
        "UnknownObject",
        "UnknownInterface",
        "UnknownProperty",
        "PropertyReadOnly",
        "UnixProcessIdUnknown",
        "InvalidSignature",
        "InconsistentMessage",
        "TimedOut",
        "MatchRuleInvalid",
        "InvalidFileContent",
        "MatchRuleNotFound",
        "SELinuxSecurityContextUnknown",
        "ObjectPathInUse",
    ],
);

/// Full error name of a standard member, e.g. `org.freedesktop.DBus.Error.Failed`.
#[must_use]
pub fn error_name(member: &str) -> String {
    format!("{DOMAIN}.{member}")
}
