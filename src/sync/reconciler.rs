// ABOUTME: Schema reconciler - aligns the main table's columns with stage
// ABOUTME: Adds stage-only columns, drops main-only columns, one transaction

use std::collections::HashSet;
use tokio_postgres::Client;

use crate::catalog::table_columns;
use crate::error::SyncError;
use crate::utils::{quote_ident, quote_qualified};

/// Column changes needed to make main's column set equal stage's.
#[derive(Debug, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Columns present in stage but absent from main: `(name, data_type)`.
    pub add: Vec<(String, String)>,
    /// Columns present in main but absent from stage.
    pub drop: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.drop.is_empty()
    }

    /// ALTER TABLE statements realizing this plan, adds before drops.
    ///
    /// Drops use IF EXISTS so replaying a partially applied plan stays
    /// idempotent.
    pub fn statements(&self, schema: &str, main_table: &str) -> Vec<String> {
        let target = quote_qualified(schema, main_table);
        let mut statements = Vec::with_capacity(self.add.len() + self.drop.len());
        for (column, data_type) in &self.add {
            statements.push(format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                target,
                quote_ident(column),
                data_type
            ));
        }
        for column in &self.drop {
            statements.push(format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                target,
                quote_ident(column)
            ));
        }
        statements
    }
}

/// Compute the plan from the two column catalogs. Pure; order follows the
/// stage catalog for adds and the main catalog for drops.
pub fn plan_columns(
    main_columns: &[(String, String)],
    stage_columns: &[(String, String)],
) -> ReconcilePlan {
    let main_names: HashSet<&str> = main_columns.iter().map(|(n, _)| n.as_str()).collect();
    let stage_names: HashSet<&str> = stage_columns.iter().map(|(n, _)| n.as_str()).collect();

    ReconcilePlan {
        add: stage_columns
            .iter()
            .filter(|(name, _)| !main_names.contains(name.as_str()))
            .cloned()
            .collect(),
        drop: main_columns
            .iter()
            .filter(|(name, _)| !stage_names.contains(name.as_str()))
            .map(|(name, _)| name.clone())
            .collect(),
    }
}

/// Align the main table's column set with the stage table's.
///
/// Runs the whole plan inside one transaction; any failure rolls back every
/// ALTER and surfaces the error. Must complete before the data diff starts,
/// since the differ and the set-based writes assume equal column sets.
pub async fn reconcile(
    client: &mut Client,
    schema: &str,
    main_table: &str,
    stage_table: &str,
) -> Result<(), SyncError> {
    let main_columns = table_columns(client, schema, main_table).await?;
    let stage_columns = table_columns(client, schema, stage_table).await?;
    if stage_columns.is_empty() {
        return Err(SyncError::schema(schema, stage_table, "no columns found"));
    }

    let plan = plan_columns(&main_columns, &stage_columns);
    if plan.is_empty() {
        tracing::debug!("Schema of {}.{} already matches stage", schema, main_table);
        return Ok(());
    }

    tracing::info!(
        "Reconciling schema of {}.{}: {} column(s) to add, {} to drop",
        schema,
        main_table,
        plan.add.len(),
        plan.drop.len()
    );

    let txn = client.transaction().await.map_err(SyncError::from)?;
    for statement in plan.statements(schema, main_table) {
        tracing::debug!("Executing: {}", statement);
        txn.execute(&statement, &[]).await.map_err(|e| {
            // Transaction rolls back on drop; report this as a schema error.
            SyncError::schema(
                schema,
                main_table,
                format!("failed to alter column set: {}", e),
            )
        })?;
    }
    txn.commit().await.map_err(SyncError::from)?;

    Ok(())
}
