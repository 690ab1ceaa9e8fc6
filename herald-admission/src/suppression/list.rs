//! Suppression lists and recipient digests

use std::fmt;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

/// 128-bit digest of a normalized recipient address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 16]);

impl Digest {
    /// Digest an address after normalizing it.
    ///
    /// Returns `None` for malformed addresses, see [`normalize`].
    #[must_use]
    pub fn of_address(address: &str) -> Option<Self> {
        normalize(address).map(|normalized| Self(md5::compute(normalized.as_bytes()).0))
    }

    /// Parse a 32 character hex digest.
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        let mut bytes = [0_u8; 16];
        hex::decode_to_slice(hex.trim(), &mut bytes).ok()?;
        Some(Self(bytes))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Trim and lower-case an address, rejecting anything that is not a plain
/// `local@domain` pair.
///
/// ```
/// use herald_admission::suppression::normalize;
///
/// assert_eq!(normalize("  Jane.Doe@Example.COM ").as_deref(), Some("jane.doe@example.com"));
/// assert_eq!(normalize("no-at-sign"), None);
/// assert_eq!(normalize("two@@example.com"), None);
/// ```
#[must_use]
pub fn normalize(address: &str) -> Option<String> {
    let trimmed = address.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return None;
    }

    let (local, domain) = trimmed.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }

    Some(trimmed.to_lowercase())
}

/// Whether a list applies to every query or only when named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    #[default]
    List,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::List => f.write_str("list"),
        }
    }
}

/// Counts reported by a bulk load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// An immutable, fully loaded suppression list.
#[derive(Debug)]
pub struct SuppressionList {
    id: String,
    name: String,
    scope: Scope,
    entries: AHashSet<Digest>,
}

impl SuppressionList {
    pub(crate) fn build(
        id: String,
        name: String,
        scope: Scope,
        digests: impl IntoIterator<Item = Option<Digest>>,
    ) -> (Self, LoadReport) {
        let mut entries = AHashSet::new();
        let mut report = LoadReport::default();

        for digest in digests {
            match digest {
                Some(digest) if entries.insert(digest) => report.accepted += 1,
                Some(_) => report.duplicates += 1,
                None => report.rejected += 1,
            }
        }

        entries.shrink_to_fit();
        (
            Self {
                id,
                name,
                scope,
                entries,
            },
            report,
        )
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn scope(&self) -> Scope {
        self.scope
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries.contains(digest)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_equal_addresses_share_digest() {
        let a = Digest::of_address("User@Example.com").unwrap();
        let b = Digest::of_address("  user@example.COM\t").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_is_md5_of_normalized_address() {
        let digest = Digest::of_address("Test@Example.com").unwrap();
        assert_eq!(digest.to_hex(), format!("{:x}", md5::compute("test@example.com")));
    }

    #[test]
    fn test_malformed_addresses() {
        for address in ["", "   ", "plain", "@example.com", "user@", "a b@example.com", "a@b@c"] {
            assert!(normalize(address).is_none(), "{address:?} should be rejected");
        }
    }

    #[test]
    fn test_hex_round_trip() {
        let digest = Digest::of_address("someone@example.org").unwrap();
        assert_eq!(Digest::from_hex(&digest.to_hex()), Some(digest));
        assert_eq!(Digest::from_hex(&digest.to_hex().to_uppercase()), Some(digest));
        assert!(Digest::from_hex("abc").is_none());
        assert!(Digest::from_hex(&"zz".repeat(16)).is_none());
    }

    #[test]
    fn test_build_counts_duplicates_and_rejects() {
        let entries = ["a@x.com", "A@X.com", "bad", "b@x.com"].map(Digest::of_address);
        let (list, report) =
            SuppressionList::build("l1".into(), "List 1".into(), Scope::List, entries);

        assert_eq!(
            report,
            LoadReport {
                accepted: 2,
                duplicates: 1,
                rejected: 1
            }
        );
        assert_eq!(list.len(), 2);
    }
}
