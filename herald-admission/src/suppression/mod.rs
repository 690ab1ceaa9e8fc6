//! Content-addressed suppression
//!
//! Recipients are represented only by the MD5 digest of their normalized
//! address. One global list applies to every query; any number of named lists
//! apply only when a query names them.
//!
//! The whole index lives behind an [`ArcSwap`]: a reload builds the new list
//! off to the side and swaps it in, so a concurrent reader sees either the
//! complete old list or the complete new one.

mod list;
mod source;

use std::sync::Arc;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use herald_common::internal;
use parking_lot::Mutex;
use serde::Serialize;

pub use self::{
    list::{Digest, LoadReport, Scope, SuppressionList, normalize},
    source::{SourceFormat, SuppressionConfig, SuppressionSource},
};
use crate::error::ConfigError;

#[derive(Debug, Default, Clone)]
struct Index {
    global: Option<Arc<SuppressionList>>,
    lists: AHashMap<String, Arc<SuppressionList>>,
}

/// Operator-facing summary of a loaded list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListSummary {
    pub id: String,
    pub name: String,
    pub scope: Scope,
    pub count: usize,
}

/// List ids are compared without surrounding whitespace.
fn list_id(id: &str) -> &str {
    id.trim()
}

#[derive(Debug, Default)]
pub struct SuppressionEngine {
    index: ArcSwap<Index>,
    /// Serializes writers so that two loads never lose each other's update
    writer: Mutex<()>,
}

impl SuppressionEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or fully replace) a list from raw addresses.
    ///
    /// Addresses are normalized and hashed; the raw values are not kept.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyListId`] if `id` is empty.
    pub fn load_list<I, S>(
        &self,
        id: &str,
        name: &str,
        scope: Scope,
        emails: I,
    ) -> Result<LoadReport, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.install(
            id,
            name,
            scope,
            emails
                .into_iter()
                .map(|email| Digest::of_address(email.as_ref())),
        )
    }

    /// Load (or fully replace) a list from pre-computed hex digests.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyListId`] if `id` is empty.
    pub fn load_digests<I, S>(
        &self,
        id: &str,
        name: &str,
        scope: Scope,
        digests: I,
    ) -> Result<LoadReport, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.install(
            id,
            name,
            scope,
            digests
                .into_iter()
                .map(|digest| Digest::from_hex(digest.as_ref())),
        )
    }

    fn install(
        &self,
        id: &str,
        name: &str,
        scope: Scope,
        digests: impl IntoIterator<Item = Option<Digest>>,
    ) -> Result<LoadReport, ConfigError> {
        let id = checked_id(id)?;
        let (list, report) =
            SuppressionList::build(id.to_string(), name.to_string(), scope, digests);
        self.publish(list, report);
        Ok(report)
    }

    /// Swap a fully built list into the index.
    fn publish(&self, list: SuppressionList, report: LoadReport) {
        let scope = list.scope();
        let owned_id = list.id().to_string();
        let id = owned_id.as_str();
        let list = Arc::new(list);

        if report.rejected > 0 {
            tracing::warn!(
                list = id,
                rejected = report.rejected,
                "Skipped malformed suppression entries"
            );
        }

        let _guard = self.writer.lock();
        let mut index = Index::clone(&self.index.load());

        // An id names exactly one list, whichever scope it had before
        index.lists.remove(id);
        if index.global.as_ref().is_some_and(|global| global.id() == id) {
            index.global = None;
        }

        match scope {
            Scope::Global => {
                if let Some(previous) = index.global.replace(list) {
                    internal!(
                        level = INFO,
                        "Global suppression list {} replaced by {}",
                        previous.id(),
                        id
                    );
                }
            }
            Scope::List => {
                index.lists.insert(owned_id.clone(), list);
            }
        }

        self.index.store(Arc::new(index));

        tracing::info!(
            list = id,
            scope = %scope,
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Suppression list loaded"
        );
    }

    /// Whether `email` is in the global list or any of `list_ids`.
    ///
    /// Unknown ids are ignored and malformed addresses are never suppressed.
    #[must_use]
    pub fn is_suppressed<S: AsRef<str>>(&self, email: &str, list_ids: &[S]) -> bool {
        let Some(digest) = Digest::of_address(email) else {
            return false;
        };

        let index = self.index.load();
        let suppressed = index
            .global
            .as_ref()
            .is_some_and(|global| global.contains(&digest))
            || list_ids.iter().any(|id| {
                index
                    .lists
                    .get(list_id(id.as_ref()))
                    .is_some_and(|list| list.contains(&digest))
            });

        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.admission.record_suppression_check(suppressed);
        }

        suppressed
    }

    /// Deduplicated size of a list, `None` if no list has that id.
    #[must_use]
    pub fn count(&self, id: &str) -> Option<usize> {
        self.find(id).map(|list| list.len())
    }

    /// Drop a list. Returns `false` if no list has that id.
    pub fn remove_list(&self, id: &str) -> bool {
        let id = list_id(id);
        let _guard = self.writer.lock();
        let mut index = Index::clone(&self.index.load());

        let removed = index.lists.remove(id).is_some()
            || index
                .global
                .take_if(|global| global.id() == id)
                .is_some();

        if removed {
            self.index.store(Arc::new(index));
            internal!(level = INFO, "Suppression list {} removed", id);
        }
        removed
    }

    /// Summaries of every loaded list, global first, then by id.
    #[must_use]
    pub fn lists(&self) -> Vec<ListSummary> {
        let index = self.index.load();
        let summary = |list: &SuppressionList| ListSummary {
            id: list.id().to_string(),
            name: list.name().to_string(),
            scope: list.scope(),
            count: list.len(),
        };

        let mut named: Vec<_> = index.lists.values().map(|list| summary(list.as_ref())).collect();
        named.sort_by(|a, b| a.id.cmp(&b.id));

        index
            .global
            .as_deref()
            .map(summary)
            .into_iter()
            .chain(named)
            .collect()
    }

    fn find(&self, id: &str) -> Option<Arc<SuppressionList>> {
        let id = list_id(id);
        let index = self.index.load();
        index.lists.get(id).cloned().or_else(|| {
            index
                .global
                .as_ref()
                .filter(|global| global.id() == id)
                .cloned()
        })
    }
}

/// The trimmed form of `id`, rejecting ids that are only whitespace.
fn checked_id(id: &str) -> Result<&str, ConfigError> {
    match list_id(id) {
        "" => Err(ConfigError::EmptyListId),
        id => Ok(id),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_padded_ids_name_the_same_list() {
        let engine = SuppressionEngine::new();
        engine
            .load_list(" newsletter ", "Newsletter", Scope::List, ["member@example.com"])
            .unwrap();

        assert!(engine.is_suppressed("member@example.com", &[" newsletter"]));
        assert_eq!(engine.count("newsletter "), Some(1));
        assert!(engine.remove_list("\tnewsletter"));
        assert_eq!(engine.count("newsletter"), None);
    }

    #[test]
    fn test_global_list_applies_to_every_query() {
        let engine = SuppressionEngine::new();
        engine
            .load_list("global", "Global", Scope::Global, ["blocked@example.com"])
            .unwrap();

        assert!(engine.is_suppressed::<&str>("Blocked@Example.com", &[]));
        assert!(engine.is_suppressed("blocked@example.com", &["anything"]));
        assert!(!engine.is_suppressed::<&str>("fine@example.com", &[]));
    }

    #[test]
    fn test_named_list_only_when_requested() {
        let engine = SuppressionEngine::new();
        engine
            .load_list("L1", "List 1", Scope::List, ["member@example.com"])
            .unwrap();

        assert!(engine.is_suppressed("member@example.com", &["L1"]));
        assert!(!engine.is_suppressed("member@example.com", &["other"]));
        assert!(!engine.is_suppressed::<&str>("member@example.com", &[]));
    }

    #[test]
    fn test_reload_replaces_list() {
        let engine = SuppressionEngine::new();
        engine
            .load_list("L1", "List 1", Scope::List, ["old@example.com"])
            .unwrap();
        engine
            .load_list("L1", "List 1", Scope::List, ["new@example.com"])
            .unwrap();

        assert!(!engine.is_suppressed("old@example.com", &["L1"]));
        assert!(engine.is_suppressed("new@example.com", &["L1"]));
        assert_eq!(engine.count("L1"), Some(1));
    }

    #[test]
    fn test_second_global_list_replaces_first() {
        let engine = SuppressionEngine::new();
        engine
            .load_list("g1", "First", Scope::Global, ["one@example.com"])
            .unwrap();
        engine
            .load_list("g2", "Second", Scope::Global, ["two@example.com"])
            .unwrap();

        assert!(!engine.is_suppressed::<&str>("one@example.com", &[]));
        assert!(engine.is_suppressed::<&str>("two@example.com", &[]));
        assert_eq!(engine.count("g1"), None);
        assert_eq!(engine.count("g2"), Some(1));
    }

    #[test]
    fn test_rescoping_an_id() {
        let engine = SuppressionEngine::new();
        engine
            .load_list("vip", "VIP", Scope::Global, ["x@example.com"])
            .unwrap();
        engine
            .load_list("vip", "VIP", Scope::List, ["x@example.com"])
            .unwrap();

        assert!(!engine.is_suppressed::<&str>("x@example.com", &[]));
        assert!(engine.is_suppressed("x@example.com", &["vip"]));
        assert_eq!(engine.lists().len(), 1);
    }

    #[test]
    fn test_load_report_and_count() {
        let engine = SuppressionEngine::new();
        let report = engine
            .load_list(
                "L1",
                "List 1",
                Scope::List,
                ["a@x.com", " A@X.COM ", "not-an-address", "b@x.com"],
            )
            .unwrap();

        assert_eq!(
            report,
            LoadReport {
                accepted: 2,
                duplicates: 1,
                rejected: 1
            }
        );
        assert_eq!(engine.count("L1"), Some(2));
        assert_eq!(engine.count("unknown"), None);
    }

    #[test]
    fn test_load_digests() {
        let engine = SuppressionEngine::new();
        let digest = Digest::of_address("hashed@example.com").unwrap();

        let report = engine
            .load_digests("pre", "Pre-hashed", Scope::List, [digest.to_hex().as_str(), "nothex"])
            .unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 1);
        assert!(engine.is_suppressed("Hashed@Example.com", &["pre"]));
    }

    #[test]
    fn test_empty_id_rejected() {
        let engine = SuppressionEngine::new();
        let err = engine
            .load_list(" ", "blank", Scope::List, ["a@x.com"])
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyListId));
    }

    #[test]
    fn test_remove_and_list_summaries() {
        let engine = SuppressionEngine::new();
        engine
            .load_list("g", "Global", Scope::Global, ["a@x.com"])
            .unwrap();
        engine
            .load_list("b", "B", Scope::List, ["a@x.com", "b@x.com"])
            .unwrap();
        engine.load_list("a", "A", Scope::List, ["c@x.com"]).unwrap();

        let ids: Vec<_> = engine.lists().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["g", "a", "b"]);

        assert!(engine.remove_list("g"));
        assert!(engine.remove_list("a"));
        assert!(!engine.remove_list("a"));
        assert!(!engine.is_suppressed::<&str>("a@x.com", &[]));

        assert_eq!(
            engine.lists(),
            vec![ListSummary {
                id: "b".into(),
                name: "B".into(),
                scope: Scope::List,
                count: 2
            }]
        );
    }

    #[test]
    fn test_malformed_query_is_not_suppressed() {
        let engine = SuppressionEngine::new();
        engine
            .load_list("g", "Global", Scope::Global, ["a@x.com"])
            .unwrap();
        assert!(!engine.is_suppressed::<&str>("not an address", &[]));
    }
}
