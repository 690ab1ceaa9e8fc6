//! Recipient domain newtype
//!
//! Wraps a normalized domain so that throttle keys, ISP lookups and metric
//! labels never disagree about case or a trailing root dot. Cloning is a
//! reference-count bump.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A lower-cased domain name without surrounding whitespace or trailing dot.
///
/// # Examples
///
/// ```
/// use herald_common::Domain;
///
/// let domain = Domain::new(" Example.COM. ");
/// assert_eq!(domain.as_str(), "example.com");
///
/// let domain = Domain::from_address("Jane@Hotmail.com").unwrap();
/// assert_eq!(domain.as_str(), "hotmail.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Domain(Arc<str>);

impl Domain {
    /// Create a `Domain`, normalizing case, whitespace and a trailing dot.
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        let trimmed = s.as_ref().trim().trim_end_matches('.');
        Self(Arc::from(trimmed.to_ascii_lowercase()))
    }

    /// Extract the domain part of an email address.
    ///
    /// Returns `None` when the address has no `@` or an empty domain part.
    #[must_use]
    pub fn from_address(address: &str) -> Option<Self> {
        let (_, domain) = address.trim().rsplit_once('@')?;
        let domain = Self::new(domain);
        (!domain.is_empty()).then_some(domain)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> Arc<str> {
        self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.0.to_string()
    }
}
