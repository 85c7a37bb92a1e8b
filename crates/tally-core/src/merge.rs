//! # Merge Primitives
//!
//! Pure functions used by the sync engine's merge phase: natural-key
//! extraction, content comparison, three-way classification and field-level
//! reconciliation.
//!
//! ## Three-Way Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   local     remote    base (last common sync point)     decision        │
//! │   ─────     ──────    ─────────────────────────────     ────────        │
//! │   absent    R         -                                  Insert         │
//! │   L         L         -                                  Unchanged      │
//! │   B         R         B     (remote version newer)       FastForward    │
//! │   L         B         B                                  KeepLocal      │
//! │   L         R         B / absent                         Conflict       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Content comparison ignores per-device bookkeeping fields
//! ([`VOLATILE_FIELDS`]): two devices holding the same product under
//! different surrogate ids still compare equal.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::types::EntityKind;

/// Fields that never participate in content comparison.
pub const VOLATILE_FIELDS: [&str; 4] = ["id", "created_at", "updated_at", "sync_version"];

/// Outcome of comparing a remote record with local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No local record shares the natural key.
    Insert,
    /// Same content on both sides.
    Unchanged,
    /// Only the remote side moved since the last common sync point.
    FastForward,
    /// Only the local side moved; the remote still carries the base.
    KeepLocal,
    /// Both sides moved independently.
    Conflict,
}

/// Extracts the natural key of a record.
pub fn natural_key(kind: EntityKind, record: &Value) -> CoreResult<String> {
    let field = kind.natural_key_field();
    let key = match record.get(field) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    if key.is_empty() {
        return Err(CoreError::InvalidRecord {
            table: kind.table_name().to_string(),
            reason: format!("missing natural key '{}'", field),
        });
    }
    Ok(key)
}

/// Returns the record's `sync_version`, or 0 when absent.
pub fn record_version(record: &Value) -> i64 {
    record
        .get("sync_version")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Record with volatile fields removed.
pub fn comparable(record: &Value) -> Value {
    match record {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !VOLATILE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn same_content(a: &Value, b: &Value) -> bool {
    comparable(a) == comparable(b)
}

/// Classifies a remote record against the local record and the sync base.
pub fn classify(local: Option<&Value>, remote: &Value, base: Option<&Value>) -> MergeDecision {
    let Some(local) = local else {
        return MergeDecision::Insert;
    };

    if same_content(local, remote) {
        return MergeDecision::Unchanged;
    }

    match base {
        Some(base) if same_content(local, base) => {
            // Equal versions with different content means both sides bumped
            // from the same ancestor.
            if record_version(remote) > record_version(local) {
                MergeDecision::FastForward
            } else {
                MergeDecision::Conflict
            }
        }
        Some(base) if same_content(remote, base) => MergeDecision::KeepLocal,
        _ => MergeDecision::Conflict,
    }
}

/// True when `remote` is a state this device already held: same content and
/// same `sync_version` as one of its journaled snapshots, older than `local`.
///
/// Local history is linear, so such a record is an ancestor of the local
/// one and carries no change of its own.
pub fn is_past_local_state<'a>(
    local: &Value,
    remote: &Value,
    history: impl IntoIterator<Item = &'a Value>,
) -> bool {
    let version = record_version(remote);
    if version >= record_version(local) {
        return false;
    }
    history
        .into_iter()
        .any(|past| record_version(past) == version && same_content(past, remote))
}

fn updated_at(record: &Value) -> Option<DateTime<Utc>> {
    record
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Field-level three-way merge.
///
/// Per field: a side that still equals the base yields to the other side;
/// when both changed (or there is no base) the side with the newer
/// `updated_at` wins. Local identity fields (`id`, `created_at`) are kept and
/// `sync_version` becomes one past the larger of both sides.
pub fn merge_fields(base: Option<&Value>, local: &Value, remote: &Value) -> Value {
    let (Value::Object(local_map), Value::Object(remote_map)) = (local, remote) else {
        return local.clone();
    };
    let empty = Map::new();
    let base_map = match base {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    };

    let remote_newer = match (updated_at(remote), updated_at(local)) {
        (Some(r), Some(l)) => r > l,
        (Some(_), None) => true,
        _ => false,
    };

    let mut merged = local_map.clone();
    for (key, remote_value) in remote_map {
        if VOLATILE_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let local_value = local_map.get(key);
        if local_value == Some(remote_value) {
            continue;
        }

        let base_value = base_map.unwrap_or(&empty).get(key);
        let take_remote = match base_map {
            Some(_) if local_value == base_value => true,
            Some(_) if Some(remote_value) == base_value => false,
            _ => remote_newer,
        };

        if take_remote {
            merged.insert(key.clone(), remote_value.clone());
        }
    }

    if remote_newer {
        if let Some(ts) = remote_map.get("updated_at") {
            merged.insert("updated_at".into(), ts.clone());
        }
    }
    let version = record_version(local).max(record_version(remote)) + 1;
    merged.insert("sync_version".into(), Value::from(version));

    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_natural_key() {
        let record = json!({"sku": " COKE-330 ", "name": "Coke"});
        assert_eq!(natural_key(EntityKind::Products, &record).unwrap(), "COKE-330");
        assert!(natural_key(EntityKind::Sales, &record).is_err());
    }

    #[test]
    fn test_comparison_ignores_volatile_fields() {
        let a = json!({"id": "1", "sku": "A", "name": "Apple", "sync_version": 1});
        let b = json!({"id": "2", "sku": "A", "name": "Apple", "sync_version": 4});
        assert!(same_content(&a, &b));
    }

    #[test]
    fn test_classify() {
        let base = json!({"sku": "A", "price_cents": 100, "sync_version": 2});
        let local_changed = json!({"sku": "A", "price_cents": 120, "sync_version": 3});
        let remote_changed = json!({"sku": "A", "price_cents": 90, "sync_version": 3});
        let remote_newer = json!({"sku": "A", "price_cents": 90, "sync_version": 3});

        assert_eq!(classify(None, &remote_changed, None), MergeDecision::Insert);
        assert_eq!(
            classify(Some(&base), &base, Some(&base)),
            MergeDecision::Unchanged
        );
        assert_eq!(
            classify(Some(&base), &remote_newer, Some(&base)),
            MergeDecision::FastForward
        );
        assert_eq!(
            classify(Some(&local_changed), &base, Some(&base)),
            MergeDecision::KeepLocal
        );
        assert_eq!(
            classify(Some(&local_changed), &remote_changed, Some(&base)),
            MergeDecision::Conflict
        );
        assert_eq!(
            classify(Some(&local_changed), &remote_changed, None),
            MergeDecision::Conflict
        );
    }

    #[test]
    fn test_same_version_divergence_is_conflict() {
        let base = json!({"sku": "A", "name": "Apple", "sync_version": 3});
        let remote = json!({"sku": "A", "name": "Green Apple", "sync_version": 3});
        assert_eq!(
            classify(Some(&base), &remote, Some(&base)),
            MergeDecision::Conflict
        );
    }

    #[test]
    fn test_past_local_state() {
        let v1 = json!({"sku": "A", "price_cents": 100, "sync_version": 1});
        let v2 = json!({"sku": "A", "price_cents": 110, "sync_version": 2});
        let v3 = json!({"sku": "A", "price_cents": 120, "sync_version": 3});
        let history = [v1.clone(), v2.clone(), v3.clone()];

        assert!(is_past_local_state(&v3, &v2, &history));
        assert!(is_past_local_state(&v3, &v1, &history));

        // A peer that edited back to old content bumped the version.
        let reverted = json!({"sku": "A", "price_cents": 100, "sync_version": 4});
        assert!(!is_past_local_state(&v3, &reverted, &history));

        let foreign = json!({"sku": "A", "price_cents": 90, "sync_version": 2});
        assert!(!is_past_local_state(&v3, &foreign, &history));
        assert!(!is_past_local_state(&v2, &v2, &history));
    }

    #[test]
    fn test_merge_fields_three_way() {
        let base = json!({
            "id": "b", "sku": "A", "name": "Apple", "price_cents": 100,
            "updated_at": "2026-01-01T00:00:00Z", "sync_version": 2
        });
        let local = json!({
            "id": "local", "sku": "A", "name": "Apple Gala", "price_cents": 100,
            "updated_at": "2026-01-02T00:00:00Z", "sync_version": 3
        });
        let remote = json!({
            "id": "remote", "sku": "A", "name": "Apple", "price_cents": 150,
            "updated_at": "2026-01-03T00:00:00Z", "sync_version": 3
        });

        let merged = merge_fields(Some(&base), &local, &remote);

        assert_eq!(merged["id"], json!("local"));
        assert_eq!(merged["name"], json!("Apple Gala"));
        assert_eq!(merged["price_cents"], json!(150));
        assert_eq!(merged["updated_at"], json!("2026-01-03T00:00:00Z"));
        assert_eq!(merged["sync_version"], json!(4));
    }

    #[test]
    fn test_merge_fields_without_base_prefers_newer() {
        let local = json!({
            "sku": "A", "name": "Local", "updated_at": "2026-01-05T00:00:00Z", "sync_version": 1
        });
        let remote = json!({
            "sku": "A", "name": "Remote", "updated_at": "2026-01-04T00:00:00Z", "sync_version": 1
        });

        let merged = merge_fields(None, &local, &remote);
        assert_eq!(merged["name"], json!("Local"));
        assert_eq!(merged["sync_version"], json!(2));
    }
}
