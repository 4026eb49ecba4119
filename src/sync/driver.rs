// ABOUTME: Sync driver - keyset-paginated scan of stage, one transaction per page
// ABOUTME: Retries transient errors per page; reports totals plus an outcome

use indicatif::ProgressBar;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres::Client;

use crate::catalog::table_columns_required;
use crate::config::{DatabaseConfig, SchemaConfig, SyncConfig};
use crate::error::SyncError;
use crate::postgres;
use crate::sync::audit;
use crate::sync::differ::{diff, ChangeRecord, RowSnapshot};
use crate::sync::reconciler::reconcile;
use crate::sync::{SyncOutcome, SyncReport, SyncTotals};
use crate::utils::{quote_ident, quote_qualified};

/// Attempts per page before the run gives up on a transient error.
const PAGE_ATTEMPTS: u32 = 3;
/// Fixed sleep between page attempts. No jitter.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Orchestrates one sync run: reconcile the schema once, then walk the stage
/// table in ascending business-key order, diffing and applying one page per
/// transaction.
pub struct SyncDriver<'a> {
    client: &'a mut Client,
    db: &'a DatabaseConfig,
    schema: &'a SchemaConfig,
    sync: &'a SyncConfig,
}

/// What one committed page contributed.
struct PageResult {
    scanned: u64,
    inserted: u64,
    updated: u64,
    deleted: u64,
    last_key: String,
}

impl<'a> SyncDriver<'a> {
    pub fn new(
        client: &'a mut Client,
        db: &'a DatabaseConfig,
        schema: &'a SchemaConfig,
        sync: &'a SyncConfig,
    ) -> Self {
        Self {
            client,
            db,
            schema,
            sync,
        }
    }

    /// Run the sync to completion or first fatal error.
    ///
    /// Never discards state: the report always carries the totals of every
    /// committed page. `Fatal` means nothing was committed; `PartialFailure`
    /// means the run stopped after at least one committed page.
    pub async fn run(&mut self) -> SyncReport {
        let start = std::time::Instant::now();
        let mut totals = SyncTotals::default();
        let mut pages = 0u64;

        let outcome = match self.run_inner(&mut totals, &mut pages).await {
            Ok(()) => SyncOutcome::Success,
            Err(e) if pages == 0 => SyncOutcome::Fatal(e),
            Err(e) => SyncOutcome::PartialFailure(e),
        };

        SyncReport {
            totals,
            outcome,
            pages,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn run_inner(
        &mut self,
        totals: &mut SyncTotals,
        pages: &mut u64,
    ) -> Result<(), SyncError> {
        let schema = &self.schema.schema_name;

        // Schema first: the differ and the set-based writes assume main and
        // stage expose the same column set.
        reconcile(
            self.client,
            schema,
            &self.schema.main_table,
            &self.schema.stage_table,
        )
        .await?;

        // One catalog fetch per run; every page reuses the column list.
        let columns = table_columns_required(self.client, schema, &self.schema.main_table).await?;
        let column_names: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();
        require_column(
            &column_names,
            &self.sync.key_column,
            schema,
            &self.schema.main_table,
        )?;
        require_column(
            &column_names,
            &self.sync.timestamp_column,
            schema,
            &self.schema.main_table,
        )?;

        let actor: String = self
            .client
            .query_one("SELECT current_user", &[])
            .await
            .map_err(SyncError::from)?
            .get(0);

        // Advisory only: sizes the progress bar, does not bound the loop.
        // Rows with a NULL business key have no identity to sync on; the page
        // scan excludes them, so their count is surfaced here instead.
        let stage = quote_qualified(schema, &self.schema.stage_table);
        let count_query = format!(
            "SELECT COUNT(*) FILTER (WHERE {key} IS NOT NULL), \
             COUNT(*) FILTER (WHERE {key} IS NULL) FROM {stage}",
            key = quote_ident(&self.sync.key_column),
            stage = stage
        );
        let count_row = self
            .client
            .query_one(&count_query, &[])
            .await
            .map_err(SyncError::from)?;
        let total: i64 = count_row.get(0);
        let null_keys: i64 = count_row.get(1);
        if null_keys > 0 {
            tracing::warn!(
                "Skipping {} stage row(s) with a NULL {} value",
                null_keys,
                self.sync.key_column
            );
        }

        tracing::info!(
            "Syncing {} -> {} ({} stage rows, pages of {})",
            stage,
            quote_qualified(schema, &self.schema.main_table),
            total,
            self.sync.batch_size
        );
        let progress = ProgressBar::new(total.max(0) as u64);

        let mut after: Option<String> = None;
        loop {
            let page = self
                .process_page_with_retry(after.as_deref(), &column_names, &actor)
                .await?;
            let Some(page) = page else {
                break;
            };

            *pages += 1;
            totals.scanned += page.scanned;
            totals.inserted += page.inserted;
            totals.updated += page.updated;
            totals.deleted += page.deleted;
            progress.inc(page.scanned);
            after = Some(page.last_key);
        }

        progress.finish_and_clear();
        Ok(())
    }

    /// Retry loop around one page. Only transient errors re-attempt; the
    /// transaction was rolled back, so a retry restarts from FETCH_PAGE with
    /// the same continuation key.
    ///
    /// A dead client never recovers on its own (the spawned I/O task has
    /// exited), so a retry after a dropped connection replaces the client
    /// with a fresh one before re-attempting.
    async fn process_page_with_retry(
        &mut self,
        after: Option<&str>,
        column_names: &[String],
        actor: &str,
    ) -> Result<Option<PageResult>, SyncError> {
        let mut attempt = 1;
        loop {
            match self.process_page(after, column_names, actor).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < PAGE_ATTEMPTS => {
                    tracing::warn!(
                        "Transient error on page after key {:?} (attempt {}/{}): {}. \
                         Retrying in {:?}...",
                        after,
                        attempt,
                        PAGE_ATTEMPTS,
                        e,
                        RETRY_DELAY
                    );
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                    if self.client.is_closed() {
                        match postgres::connect(self.db).await {
                            Ok(client) => {
                                tracing::info!("Reconnected to {}:{}", self.db.host, self.db.port);
                                *self.client = client;
                            }
                            // A failed reconnect burns the attempt; the next
                            // process_page call fails fast on the dead client.
                            Err(err) => tracing::warn!("Reconnect failed: {:#}", err),
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to process page after key {:?}: {}", after, e);
                    return Err(e);
                }
            }
        }
    }

    /// One page: FETCH -> LOOKUP -> DIFF -> INSERT -> UPDATE -> DELETE-DIFF
    /// -> AUDIT -> COMMIT, all inside a single transaction.
    ///
    /// Returns `None` when the stage scan is exhausted.
    async fn process_page(
        &mut self,
        after: Option<&str>,
        column_names: &[String],
        actor: &str,
    ) -> Result<Option<PageResult>, SyncError> {
        let schema = self.schema;
        let sync = self.sync;
        let txn = self.client.transaction().await.map_err(SyncError::from)?;

        let page_query = build_page_query(
            &schema.schema_name,
            &schema.stage_table,
            &sync.key_column,
            &sync.timestamp_column,
            sync.batch_size,
        );
        let rows = txn
            .query(&page_query, &[&after])
            .await
            .map_err(SyncError::from)?;
        if rows.is_empty() {
            return Ok(None);
        }

        let batch: Vec<RowSnapshot> = rows
            .iter()
            .map(|row| RowSnapshot {
                key: row.get("_key"),
                ts: row.get("_ts"),
                data: row.get("_data"),
            })
            .collect();
        let keys: Vec<String> = batch.iter().map(|r| r.key.clone()).collect();
        let last_key = keys.last().cloned().unwrap_or_default();

        // Existing main rows for this page's key set only.
        let lookup_query = build_lookup_query(
            &schema.schema_name,
            &schema.main_table,
            &sync.key_column,
            &sync.timestamp_column,
        );
        let existing: HashMap<String, RowSnapshot> = txn
            .query(&lookup_query, &[&keys])
            .await
            .map_err(SyncError::from)?
            .iter()
            .map(|row| {
                let snapshot = RowSnapshot {
                    key: row.get("_key"),
                    ts: row.get("_ts"),
                    data: row.get("_data"),
                };
                (snapshot.key.clone(), snapshot)
            })
            .collect();

        let mut page_diff = diff(&batch, &existing);

        // Inserts before updates, per-page ordering contract.
        let inserted = if page_diff.inserts.is_empty() {
            0
        } else {
            let query = build_insert_query(&schema.schema_name, &schema.main_table, column_names);
            let payload = Value::Array(page_diff.inserts.clone());
            txn.execute(&query, &[&payload])
                .await
                .map_err(SyncError::from)?
        };

        let updated = if page_diff.updates.is_empty() {
            0
        } else {
            let query = build_update_query(
                &schema.schema_name,
                &schema.main_table,
                column_names,
                &sync.key_column,
            );
            let payload = Value::Array(page_diff.updates.clone());
            txn.execute(&query, &[&payload])
                .await
                .map_err(SyncError::from)?
        };

        // Deletion detection is bounded to keys seen in this page: a main row
        // whose key is in the page key set but no longer in stage goes away.
        let delete_query = build_delete_query(
            &schema.schema_name,
            &schema.main_table,
            &schema.stage_table,
            &sync.key_column,
        );
        let deleted_rows = txn
            .query(&delete_query, &[&keys])
            .await
            .map_err(SyncError::from)?;
        for row in &deleted_rows {
            page_diff.records.push(ChangeRecord::Delete {
                old: row.get::<_, Value>(0),
            });
        }
        let deleted = deleted_rows.len() as u64;

        // One history row per applied change, committed atomically with them.
        let history_rows = audit::record(
            &txn,
            &schema.schema_name,
            &schema.history_table,
            &page_diff.records,
            actor,
        )
        .await?;
        if history_rows != inserted + updated + deleted {
            tracing::warn!(
                "History rows ({}) do not match applied changes ({} + {} + {})",
                history_rows,
                inserted,
                updated,
                deleted
            );
        }

        txn.commit().await.map_err(SyncError::from)?;

        tracing::debug!(
            "Committed page ending at key '{}': {} scanned, {} inserted, {} updated, {} deleted",
            last_key,
            batch.len(),
            inserted,
            updated,
            deleted
        );

        Ok(Some(PageResult {
            scanned: batch.len() as u64,
            inserted,
            updated,
            deleted,
            last_key,
        }))
    }
}

/// Fail with a `Schema` error when a configured column is absent from the
/// catalog, instead of letting the first page query surface a raw database
/// error.
fn require_column(
    columns: &[String],
    column: &str,
    schema: &str,
    table: &str,
) -> Result<(), SyncError> {
    if columns.iter().any(|c| c == column) {
        Ok(())
    } else {
        Err(SyncError::schema(
            schema,
            table,
            format!("column '{}' not present", column),
        ))
    }
}

/// Keyset page fetch over the stage table, ordered by the key's text form.
///
/// `$1` is the last key of the previous page (NULL for the first page), so a
/// retry or a concurrent stage writer can never make the scan revisit or skip
/// a committed page. NULL keys are excluded: they sort after every real key,
/// cannot be continued past (`> $1` is never true for NULL), and have no
/// identity to match against main.
fn build_page_query(
    schema: &str,
    stage_table: &str,
    key_column: &str,
    timestamp_column: &str,
    batch_size: usize,
) -> String {
    format!(
        "SELECT t.{key}::text AS _key, t.{ts}::timestamptz AS _ts, to_jsonb(t) AS _data \
         FROM {stage} t \
         WHERE t.{key} IS NOT NULL AND ($1::text IS NULL OR t.{key}::text > $1) \
         ORDER BY t.{key}::text \
         LIMIT {limit}",
        key = quote_ident(key_column),
        ts = quote_ident(timestamp_column),
        stage = quote_qualified(schema, stage_table),
        limit = batch_size
    )
}

/// Fetch the main rows matching a page's key set.
fn build_lookup_query(
    schema: &str,
    main_table: &str,
    key_column: &str,
    timestamp_column: &str,
) -> String {
    format!(
        "SELECT t.{key}::text AS _key, t.{ts}::timestamptz AS _ts, to_jsonb(t) AS _data \
         FROM {main} t \
         WHERE t.{key}::text = ANY($1)",
        key = quote_ident(key_column),
        ts = quote_ident(timestamp_column),
        main = quote_qualified(schema, main_table)
    )
}

/// Set-based insert: `$1` is a JSON array of row objects, expanded server-side
/// against the main table's row type.
fn build_insert_query(schema: &str, main_table: &str, columns: &[String]) -> String {
    let main = quote_qualified(schema, main_table);
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "INSERT INTO {main} ({cols}) \
         SELECT {cols} FROM jsonb_populate_recordset(NULL::{main}, $1) r",
        main = main,
        cols = column_list.join(", ")
    )
}

/// Set-based update joining the JSON payload to main on the business key.
fn build_update_query(
    schema: &str,
    main_table: &str,
    columns: &[String],
    key_column: &str,
) -> String {
    let main = quote_qualified(schema, main_table);
    let assignments: Vec<String> = columns
        .iter()
        .filter(|c| *c != key_column)
        .map(|c| format!("{col} = r.{col}", col = quote_ident(c)))
        .collect();
    format!(
        "UPDATE {main} m SET {assignments} \
         FROM jsonb_populate_recordset(NULL::{main}, $1) r \
         WHERE m.{key} = r.{key}",
        main = main,
        assignments = assignments.join(", "),
        key = quote_ident(key_column)
    )
}

/// Delete main rows whose key is in the page key set (`$1`) but absent from
/// stage, returning full snapshots for the audit trail.
fn build_delete_query(
    schema: &str,
    main_table: &str,
    stage_table: &str,
    key_column: &str,
) -> String {
    format!(
        "DELETE FROM {main} m \
         WHERE m.{key}::text = ANY($1) \
         AND NOT EXISTS (SELECT 1 FROM {stage} s WHERE s.{key} = m.{key}) \
         RETURNING to_jsonb(m)",
        main = quote_qualified(schema, main_table),
        stage = quote_qualified(schema, stage_table),
        key = quote_ident(key_column)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_query_is_keyset_not_offset() {
        let query = build_page_query("cxr", "reports_stage", "filenames", "timestamp", 500);

        assert!(query.contains("FROM \"cxr\".\"reports_stage\" t"));
        assert!(query.contains("t.\"filenames\"::text > $1"));
        assert!(query.contains("ORDER BY t.\"filenames\"::text"));
        assert!(query.contains("LIMIT 500"));
        assert!(!query.contains("OFFSET"));
    }

    #[test]
    fn test_page_query_excludes_null_keys() {
        // A NULL key row would sort last on the first page, then be invisible
        // to every continuation; it must never reach the row decoder.
        let query = build_page_query("cxr", "reports_stage", "filenames", "timestamp", 500);
        assert!(query.contains("t.\"filenames\" IS NOT NULL AND"));
    }

    #[test]
    fn test_require_column_present_and_missing() {
        let columns = vec!["filenames".to_string(), "timestamp".to_string()];

        assert!(require_column(&columns, "filenames", "cxr", "reports").is_ok());

        let err = require_column(&columns, "modified_at", "cxr", "reports").unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("'modified_at' not present"));
    }

    #[test]
    fn test_lookup_query_binds_page_keys() {
        let query = build_lookup_query("cxr", "reports", "filenames", "timestamp");
        assert!(query.contains("FROM \"cxr\".\"reports\" t"));
        assert!(query.contains("t.\"filenames\"::text = ANY($1)"));
        assert!(query.contains("to_jsonb(t) AS _data"));
    }

    #[test]
    fn test_insert_query_expands_recordset() {
        let columns = vec![
            "filenames".to_string(),
            "timestamp".to_string(),
            "size".to_string(),
        ];
        let query = build_insert_query("cxr", "reports", &columns);

        assert!(query.contains("INSERT INTO \"cxr\".\"reports\""));
        assert!(query.contains("(\"filenames\", \"timestamp\", \"size\")"));
        assert!(query.contains("jsonb_populate_recordset(NULL::\"cxr\".\"reports\", $1)"));
    }

    #[test]
    fn test_update_query_skips_key_column() {
        let columns = vec![
            "filenames".to_string(),
            "timestamp".to_string(),
            "size".to_string(),
        ];
        let query = build_update_query("cxr", "reports", &columns, "filenames");

        assert!(query.contains("SET \"timestamp\" = r.\"timestamp\", \"size\" = r.\"size\""));
        assert!(!query.contains("\"filenames\" = r.\"filenames\","));
        assert!(query.contains("WHERE m.\"filenames\" = r.\"filenames\""));
    }

    #[test]
    fn test_delete_query_is_bounded_to_page_keys() {
        let query = build_delete_query("cxr", "reports", "reports_stage", "filenames");

        assert!(query.contains("DELETE FROM \"cxr\".\"reports\" m"));
        assert!(query.contains("m.\"filenames\"::text = ANY($1)"));
        assert!(query.contains("NOT EXISTS (SELECT 1 FROM \"cxr\".\"reports_stage\" s"));
        assert!(query.contains("RETURNING to_jsonb(m)"));
    }
}
