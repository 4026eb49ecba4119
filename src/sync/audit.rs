// ABOUTME: Audit writer - appends one history row per applied change
// ABOUTME: Batched parameterized inserts inside the page transaction

use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::Transaction;

use crate::error::SyncError;
use crate::sync::differ::ChangeRecord;
use crate::utils::quote_qualified;

/// 4 parameters per record; stay well under the protocol's 65535 limit.
const RECORDS_PER_STATEMENT: usize = 1000;

/// Append one history row per change record, inside the caller's transaction.
///
/// Rows are `(operation_type, old_data, new_data, performed_by)`; the
/// `written_at` column is filled by its default. A write failure propagates
/// and the caller rolls the page back, so history never disagrees with the
/// data writes it describes.
pub async fn record(
    txn: &Transaction<'_>,
    schema: &str,
    history_table: &str,
    changes: &[ChangeRecord],
    actor: &str,
) -> Result<u64, SyncError> {
    if changes.is_empty() {
        return Ok(0);
    }

    let mut written = 0u64;
    for chunk in changes.chunks(RECORDS_PER_STATEMENT) {
        let query = build_history_insert(schema, history_table, chunk.len());

        let ops: Vec<&str> = chunk.iter().map(|c| c.operation_type()).collect();
        let old: Vec<Option<&Value>> = chunk.iter().map(|c| c.old_data()).collect();
        let new: Vec<Option<&Value>> = chunk.iter().map(|c| c.new_data()).collect();

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 4);
        for i in 0..chunk.len() {
            params.push(&ops[i]);
            params.push(&old[i]);
            params.push(&new[i]);
            params.push(&actor);
        }

        written += txn
            .execute(&query, &params)
            .await
            .map_err(SyncError::from)?;
    }

    Ok(written)
}

/// Build the multi-row history INSERT:
/// `INSERT INTO "s"."h" (operation_type, old_data, new_data, performed_by)
///  VALUES ($1, $2, $3, $4), ($5, $6, $7, $8), ...`
fn build_history_insert(schema: &str, history_table: &str, num_records: usize) -> String {
    let value_rows: Vec<String> = (0..num_records)
        .map(|row| {
            let base = row * 4;
            format!(
                "(${}, ${}, ${}, ${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4
            )
        })
        .collect();

    format!(
        "INSERT INTO {} (operation_type, old_data, new_data, performed_by) VALUES {}",
        quote_qualified(schema, history_table),
        value_rows.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_history_insert_single_record() {
        let query = build_history_insert("cxr", "reports_history", 1);
        assert_eq!(
            query,
            "INSERT INTO \"cxr\".\"reports_history\" \
             (operation_type, old_data, new_data, performed_by) \
             VALUES ($1, $2, $3, $4)"
        );
    }

    #[test]
    fn test_build_history_insert_multiple_records() {
        let query = build_history_insert("cxr", "reports_history", 3);
        assert!(query.contains("($1, $2, $3, $4), ($5, $6, $7, $8), ($9, $10, $11, $12)"));
    }
}
