//! Conflict resolution strategies.
//!
//! A resolver only decides; the engine applies the outcome, records the
//! conflict row and keeps the sync base current.

use serde_json::Value;

use tally_core::merge::merge_fields;
use tally_core::ConflictStrategy;

/// What to do with a record whose local and remote versions diverged.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Leave the local record as it is.
    KeepLocal,
    /// Overwrite local with the remote record.
    TakeRemote,
    /// Write this record in place of both.
    Write(Value),
    /// Leave the conflict open for a person to decide.
    Defer,
}

/// Decides how a diverged record is reconciled.
pub trait ConflictResolver: Send + Sync {
    fn strategy(&self) -> ConflictStrategy;

    fn resolve(&self, base: Option<&Value>, local: &Value, remote: &Value) -> Resolution;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl ConflictResolver for LocalWins {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::LocalWins
    }

    fn resolve(&self, _base: Option<&Value>, _local: &Value, _remote: &Value) -> Resolution {
        Resolution::KeepLocal
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl ConflictResolver for RemoteWins {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::RemoteWins
    }

    fn resolve(&self, _base: Option<&Value>, _local: &Value, _remote: &Value) -> Resolution {
        Resolution::TakeRemote
    }
}

/// Field-level three-way merge; see [`merge_fields`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerge;

impl ConflictResolver for FieldMerge {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::Merge
    }

    fn resolve(&self, base: Option<&Value>, local: &Value, remote: &Value) -> Resolution {
        Resolution::Write(merge_fields(base, local, remote))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Manual;

impl ConflictResolver for Manual {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::Manual
    }

    fn resolve(&self, _base: Option<&Value>, _local: &Value, _remote: &Value) -> Resolution {
        Resolution::Defer
    }
}

/// Built-in resolver for a configured strategy.
pub fn resolver_for(strategy: ConflictStrategy) -> Box<dyn ConflictResolver> {
    match strategy {
        ConflictStrategy::LocalWins => Box::new(LocalWins),
        ConflictStrategy::RemoteWins => Box::new(RemoteWins),
        ConflictStrategy::Merge => Box::new(FieldMerge),
        ConflictStrategy::Manual => Box::new(Manual),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolver_for_matches_strategy() {
        for strategy in [
            ConflictStrategy::LocalWins,
            ConflictStrategy::RemoteWins,
            ConflictStrategy::Merge,
            ConflictStrategy::Manual,
        ] {
            assert_eq!(resolver_for(strategy).strategy(), strategy);
        }
    }

    #[test]
    fn test_field_merge_combines_disjoint_edits() {
        let base = json!({"sku": "A", "name": "Apple", "price_cents": 100, "sync_version": 1});
        let local = json!({"sku": "A", "name": "Green Apple", "price_cents": 100, "sync_version": 2});
        let remote = json!({"sku": "A", "name": "Apple", "price_cents": 120, "sync_version": 2});

        let Resolution::Write(merged) = FieldMerge.resolve(Some(&base), &local, &remote) else {
            panic!("merge must produce a record");
        };
        assert_eq!(merged["name"], json!("Green Apple"));
        assert_eq!(merged["price_cents"], json!(120));
        assert_eq!(merged["sync_version"], json!(3));
    }

    #[test]
    fn test_manual_defers() {
        let record = json!({"sku": "A"});
        assert_eq!(Manual.resolve(None, &record, &record), Resolution::Defer);
        assert_eq!(LocalWins.resolve(None, &record, &record), Resolution::KeepLocal);
        assert_eq!(RemoteWins.resolve(None, &record, &record), Resolution::TakeRemote);
    }
}
