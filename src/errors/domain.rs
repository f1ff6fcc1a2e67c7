//! Error domains and the process-wide domain registry.
//!
//! A remote error name such as `org.freedesktop.DBus.Error.Disconnected` is
//! split at its last dot into a domain (`org.freedesktop.DBus.Error`) and a
//! member (`Disconnected`). The domain is looked up in the
//! [`ErrorDomainRegistry`]; the member is mapped to a numeric code within it.

use super::code::ErrorCode;
use super::freedesktop::FREEDESKTOP;
use super::system::SystemDomain;
use crate::error::{Error, Result};
use crate::tracing_compat::warn;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};

/// A named family of error members with numeric codes.
pub trait ErrorDomain: Send + Sync {
    /// Domain name as it appears on the bus, without the member part.
    fn name(&self) -> &str;

    /// Numeric code of a member, if the member belongs to the domain.
    fn value_of(&self, member: &str) -> Option<i32>;

    /// Member name of a numeric code.
    fn member_of(&self, value: i32) -> Option<&str>;
}

/// A domain whose members are numbered from 1 in declaration order.
#[derive(Debug, Clone, Copy)]
pub struct EnumDomain {
    name: &'static str,
    members: &'static [&'static str],
}

impl EnumDomain {
    /// Creates a domain; `members[0]` gets code 1.
    #[must_use]
    pub const fn new(name: &'static str, members: &'static [&'static str]) -> Self {
        Self { name, members }
    }
}

impl ErrorDomain for EnumDomain {
    fn name(&self) -> &str {
        self.name
    }

    fn value_of(&self, member: &str) -> Option<i32> {
        self.members
            .iter()
            .position(|m| *m == member)
            .and_then(|i| i32::try_from(i + 1).ok())
    }

    fn member_of(&self, value: i32) -> Option<&str> {
        let index = usize::try_from(value).ok()?.checked_sub(1)?;
        self.members.get(index).copied()
    }
}

/// Registry of known error domains.
pub struct ErrorDomainRegistry {
    domains: RwLock<HashMap<String, Arc<dyn ErrorDomain>>>,
}

impl std::fmt::Debug for ErrorDomainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let domains = self.domains.read();
        f.debug_struct("ErrorDomainRegistry")
            .field("domains", &domains.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ErrorDomainRegistry {
    /// Creates a registry holding the standard bus and system domains.
    #[must_use]
    pub fn with_standard_domains() -> Self {
        let mut domains: HashMap<String, Arc<dyn ErrorDomain>> = HashMap::new();
        domains.insert(FREEDESKTOP.name().to_owned(), Arc::new(FREEDESKTOP));
        domains.insert(SystemDomain::NAME.to_owned(), Arc::new(SystemDomain));
        Self {
            domains: RwLock::new(domains),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<ErrorDomainRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::with_standard_domains)
    }

    /// Adds a domain. A domain name can be registered only once.
    pub fn register(&self, domain: Arc<dyn ErrorDomain>) -> Result<()> {
        let mut domains = self.domains.write();
        let name = domain.name().to_owned();
        if domains.contains_key(&name) {
            return Err(Error::DuplicateDomain(name));
        }
        domains.insert(name, domain);
        Ok(())
    }

    /// Returns true if `name` is a registered domain.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.domains.read().contains_key(name)
    }

    /// Maps a full error name to a code.
    ///
    /// Unknown domains map to [`ErrorCode::unknown_domain`], unknown members
    /// of a known domain to [`ErrorCode::unknown_member`].
    #[must_use]
    pub fn error_code(&self, error_name: &str) -> ErrorCode {
        let Some((domain_name, member)) = error_name.rsplit_once('.') else {
            warn!(error_name, "error name has no domain");
            return ErrorCode::unknown_domain();
        };
        let domains = self.domains.read();
        let Some(domain) = domains.get(domain_name) else {
            warn!(domain = domain_name, "unknown error domain");
            return ErrorCode::unknown_domain();
        };
        match domain.value_of(member) {
            Some(value) => ErrorCode::in_domain(domain.name(), value, member),
            None => ErrorCode::unknown_member(),
        }
    }

    /// Maps a code of a registered domain back to the full error name.
    #[must_use]
    pub fn error_name(&self, domain_name: &str, value: i32) -> Option<String> {
        let domains = self.domains.read();
        let domain = domains.get(domain_name)?;
        domain
            .member_of(value)
            .map(|member| format!("{domain_name}.{member}"))
    }
}
