// ABOUTME: Column catalog reader - name/type pairs from information_schema
// ABOUTME: Read-only; callers decide how long to hold on to the result

use tokio_postgres::Client;

use crate::error::SyncError;

/// Fetch `(column_name, data_type)` pairs for a table, in ordinal order.
///
/// The driver fetches this once per run after reconciliation and reuses the
/// list for every page; the reconciler fetches it for both tables up front.
pub async fn table_columns(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<(String, String)>, SyncError> {
    let rows = client
        .query(
            "SELECT column_name, data_type
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
            &[&schema, &table],
        )
        .await
        .map_err(SyncError::from)?;

    Ok(rows
        .iter()
        .map(|row| (row.get(0), row.get(1)))
        .collect())
}

/// Like [`table_columns`], but an empty column set is a schema error.
///
/// Used for the main table, where no columns means the table does not exist
/// (or the configured schema is wrong) and the run cannot proceed.
pub async fn table_columns_required(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<(String, String)>, SyncError> {
    let columns = table_columns(client, schema, table).await?;
    if columns.is_empty() {
        return Err(SyncError::schema(schema, table, "no columns found"));
    }
    Ok(columns)
}
