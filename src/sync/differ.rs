// ABOUTME: Batch differ - classifies stage rows as insert/update/unchanged
// ABOUTME: Pure logic over snapshots; deletions are detected later by SQL

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// One row as read from the stage or main table: its business key in text
/// form, its tie-breaker timestamp, and the full row snapshot.
#[derive(Debug, Clone)]
pub struct RowSnapshot {
    pub key: String,
    /// `None` when the timestamp column is NULL; orders before any `Some`,
    /// so a NULL-stamped stage row never replaces an existing row.
    pub ts: Option<DateTime<Utc>>,
    pub data: Value,
}

/// A classified change, consumed by the audit writer and then discarded.
#[derive(Debug, Clone)]
pub enum ChangeRecord {
    Insert { new: Value },
    Update { old: Value, new: Value },
    Delete { old: Value },
}

impl ChangeRecord {
    pub fn operation_type(&self) -> &'static str {
        match self {
            ChangeRecord::Insert { .. } => "INSERT",
            ChangeRecord::Update { .. } => "UPDATE",
            ChangeRecord::Delete { .. } => "DELETE",
        }
    }

    pub fn old_data(&self) -> Option<&Value> {
        match self {
            ChangeRecord::Insert { .. } => None,
            ChangeRecord::Update { old, .. } => Some(old),
            ChangeRecord::Delete { old } => Some(old),
        }
    }

    pub fn new_data(&self) -> Option<&Value> {
        match self {
            ChangeRecord::Insert { new } => Some(new),
            ChangeRecord::Update { new, .. } => Some(new),
            ChangeRecord::Delete { .. } => None,
        }
    }
}

/// Result of diffing one page of stage rows against the existing main rows.
#[derive(Debug, Default)]
pub struct BatchDiff {
    /// Row payloads to INSERT, in stage order.
    pub inserts: Vec<Value>,
    /// Row payloads to UPDATE, in stage order.
    pub updates: Vec<Value>,
    /// One record per classified row (inserts then updates, stage order).
    /// Delete records are appended by the driver after the delete-diff query.
    pub records: Vec<ChangeRecord>,
}

impl BatchDiff {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Classify each stage row against the existing main rows for its key.
///
/// - key absent from `existing` -> Insert
/// - key present and stage timestamp strictly newer -> Update
/// - key present and stage timestamp older or equal -> silent skip
///
/// The silent skip on ties is deliberate, documented behavior: with no
/// secondary tie-break defined, an equal timestamp means the main row stands.
pub fn diff(batch: &[RowSnapshot], existing: &HashMap<String, RowSnapshot>) -> BatchDiff {
    let mut out = BatchDiff::default();
    let mut inserts = Vec::new();
    let mut updates = Vec::new();

    for stage_row in batch {
        match existing.get(&stage_row.key) {
            None => {
                out.inserts.push(stage_row.data.clone());
                inserts.push(ChangeRecord::Insert {
                    new: stage_row.data.clone(),
                });
            }
            Some(main_row) if stage_row.ts > main_row.ts => {
                out.updates.push(stage_row.data.clone());
                updates.push(ChangeRecord::Update {
                    old: main_row.data.clone(),
                    new: stage_row.data.clone(),
                });
            }
            Some(_) => {}
        }
    }

    out.records = inserts;
    out.records.extend(updates);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn snap(key: &str, ts: Option<DateTime<Utc>>, data: Value) -> RowSnapshot {
        RowSnapshot {
            key: key.to_string(),
            ts,
            data,
        }
    }

    fn existing_of(rows: Vec<RowSnapshot>) -> HashMap<String, RowSnapshot> {
        rows.into_iter().map(|r| (r.key.clone(), r)).collect()
    }

    #[test]
    fn test_new_key_is_insert() {
        // Stage has b.png, main has no b.png row.
        let batch = vec![snap("b.png", ts(100), json!({"filenames": "b.png"}))];
        let diff = diff(&batch, &HashMap::new());

        assert_eq!(diff.inserts.len(), 1);
        assert!(diff.updates.is_empty());
        assert_eq!(diff.records.len(), 1);
        assert_eq!(diff.records[0].operation_type(), "INSERT");
        assert!(diff.records[0].old_data().is_none());
        assert_eq!(
            diff.records[0].new_data().unwrap()["filenames"],
            json!("b.png")
        );
    }

    #[test]
    fn test_newer_stage_row_is_update() {
        // a.png exists in both; stage timestamp T2 > main T1.
        let batch = vec![snap(
            "a.png",
            ts(200),
            json!({"filenames": "a.png", "size": 10}),
        )];
        let existing = existing_of(vec![snap(
            "a.png",
            ts(100),
            json!({"filenames": "a.png", "size": 5}),
        )]);
        let diff = diff(&batch, &existing);

        assert!(diff.inserts.is_empty());
        assert_eq!(diff.updates.len(), 1);
        assert_eq!(diff.records.len(), 1);
        assert_eq!(diff.records[0].operation_type(), "UPDATE");
        assert_eq!(diff.records[0].old_data().unwrap()["size"], json!(5));
        assert_eq!(diff.records[0].new_data().unwrap()["size"], json!(10));
    }

    #[test]
    fn test_older_or_equal_timestamp_is_silent_skip() {
        let existing = existing_of(vec![snap("a.png", ts(100), json!({"size": 5}))]);

        // Equal timestamp: no record emitted, main stands.
        let tie = vec![snap("a.png", ts(100), json!({"size": 9}))];
        assert!(diff(&tie, &existing).is_empty());

        // Older timestamp: same.
        let stale = vec![snap("a.png", ts(50), json!({"size": 9}))];
        assert!(diff(&stale, &existing).is_empty());
    }

    #[test]
    fn test_null_stage_timestamp_never_wins() {
        let existing = existing_of(vec![snap("a.png", ts(100), json!({"size": 5}))]);
        let batch = vec![snap("a.png", None, json!({"size": 9}))];
        assert!(diff(&batch, &existing).is_empty());
    }

    #[test]
    fn test_stage_timestamp_beats_null_main() {
        let existing = existing_of(vec![snap("a.png", None, json!({"size": 5}))]);
        let batch = vec![snap("a.png", ts(1), json!({"size": 9}))];
        let diff = diff(&batch, &existing);
        assert_eq!(diff.updates.len(), 1);
    }

    #[test]
    fn test_every_classified_row_yields_one_record() {
        let existing = existing_of(vec![
            snap("a.png", ts(100), json!({"k": "a.png"})),
            snap("b.png", ts(100), json!({"k": "b.png"})),
        ]);
        let batch = vec![
            snap("a.png", ts(200), json!({"k": "a.png"})), // update
            snap("b.png", ts(100), json!({"k": "b.png"})), // skip
            snap("c.png", ts(100), json!({"k": "c.png"})), // insert
        ];
        let diff = diff(&batch, &existing);
        assert_eq!(diff.records.len(), diff.inserts.len() + diff.updates.len());
        assert_eq!(diff.records.len(), 2);
    }

    #[test]
    fn test_delete_record_snapshots() {
        // The driver appends these from the delete-diff query: old holds the
        // full deleted row, new is absent.
        let record = ChangeRecord::Delete {
            old: json!({"filenames": "c.png", "size": 7}),
        };
        assert_eq!(record.operation_type(), "DELETE");
        assert_eq!(record.old_data().unwrap()["filenames"], json!("c.png"));
        assert!(record.new_data().is_none());
    }

    #[test]
    fn test_second_diff_is_idempotent() {
        // After applying the first diff, re-diffing the same stage page against
        // the resulting main state classifies nothing.
        let batch = vec![snap("a.png", ts(200), json!({"k": "a.png", "v": 2}))];
        let first = diff(&batch, &HashMap::new());
        assert_eq!(first.inserts.len(), 1);

        let converged = existing_of(batch.clone());
        assert!(diff(&batch, &converged).is_empty());
    }
}
