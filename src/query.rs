// ABOUTME: Auxiliary operations - view (re)creation and SELECT-to-CSV export
// ABOUTME: Pass-through executors; each fails independently of the sync path

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use tokio_postgres::{Client, Row};

use crate::utils::quote_qualified;

/// Drop and recreate a view from the configured SELECT, in one transaction.
///
/// CASCADE matches the original deployment: dependent views are rebuilt by
/// re-running this operation for each of them.
pub async fn create_view(
    client: &mut Client,
    schema: &str,
    view_name: &str,
    select_query: &str,
) -> Result<()> {
    let view = quote_qualified(schema, view_name);
    let txn = client
        .transaction()
        .await
        .context("Failed to open transaction for view creation")?;

    txn.execute(&format!("DROP VIEW IF EXISTS {} CASCADE", view), &[])
        .await
        .with_context(|| format!("Failed to drop existing view {}", view))?;
    txn.execute(&format!("CREATE VIEW {} AS {}", view, select_query), &[])
        .await
        .with_context(|| format!("Failed to create view {}", view))?;
    txn.commit()
        .await
        .with_context(|| format!("Failed to commit view {}", view))?;

    tracing::info!("View {} created", view);
    Ok(())
}

/// Result set of an ad-hoc SELECT, with every cell rendered to text.
#[derive(Debug, Default)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Execute a configured SELECT and stringify the result set.
pub async fn execute_select(client: &Client, sql: &str) -> Result<QueryOutput> {
    let rows = client
        .query(sql, &[])
        .await
        .context("Failed to execute SELECT query")?;

    let columns = match rows.first() {
        Some(row) => row
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
        None => Vec::new(),
    };

    let rendered = rows
        .iter()
        .map(|row| {
            (0..row.columns().len())
                .map(|idx| cell_to_string(row, idx))
                .collect()
        })
        .collect();

    tracing::info!("Query returned {} row(s)", rows.len());
    Ok(QueryOutput {
        columns,
        rows: rendered,
    })
}

/// Render one cell to text by column type. NULL becomes the empty string.
fn cell_to_string(row: &Row, idx: usize) -> String {
    fn opt<T: ToString>(value: Option<T>) -> String {
        value.map(|v| v.to_string()).unwrap_or_default()
    }

    match row.columns()[idx].type_().name() {
        "int2" => opt(row.get::<_, Option<i16>>(idx)),
        "int4" => opt(row.get::<_, Option<i32>>(idx)),
        "int8" => opt(row.get::<_, Option<i64>>(idx)),
        "float4" => opt(row.get::<_, Option<f32>>(idx)),
        "float8" => opt(row.get::<_, Option<f64>>(idx)),
        "bool" => opt(row.get::<_, Option<bool>>(idx)),
        "text" | "varchar" | "bpchar" | "name" => opt(row.get::<_, Option<String>>(idx)),
        "timestamp" => row
            .get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|v| v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            .unwrap_or_default(),
        "timestamptz" => row
            .get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|v| v.to_rfc3339())
            .unwrap_or_default(),
        "date" => opt(row.get::<_, Option<chrono::NaiveDate>>(idx)),
        "json" | "jsonb" => row
            .get::<_, Option<serde_json::Value>>(idx)
            .map(|v| v.to_string())
            .unwrap_or_default(),
        // Unknown types: take the server's text form if it converts, else blank.
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .unwrap_or_default(),
    }
}

/// Write the result set as CSV (RFC 4180 quoting) to `path`.
pub fn write_csv(output: &QueryOutput, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create CSV file {}", path.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    write_csv_to(output, &mut writer)?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush CSV file {}", path.display()))?;
    tracing::info!("Wrote {} row(s) to {}", output.rows.len(), path.display());
    Ok(())
}

fn write_csv_to(output: &QueryOutput, writer: &mut impl Write) -> Result<()> {
    let header: Vec<String> = output.columns.iter().map(|c| csv_field(c)).collect();
    writeln!(writer, "{}", header.join(","))?;
    for row in &output.rows {
        let fields: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
        writeln!(writer, "{}", fields.join(","))?;
    }
    Ok(())
}

/// Quote a CSV field when it contains a delimiter, quote, or line break.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        let mut quoted = String::with_capacity(value.len() + 2);
        quoted.push('"');
        for ch in value.chars() {
            if ch == '"' {
                quoted.push('"');
            }
            quoted.push(ch);
        }
        quoted.push('"');
        quoted
    } else {
        value.to_string()
    }
}

/// Plain-text table for stdout when no CSV path was given.
pub fn render_table(output: &QueryOutput) -> String {
    if output.columns.is_empty() {
        return "(no rows)".to_string();
    }

    let mut widths: Vec<usize> = output.columns.iter().map(|c| c.len()).collect();
    for row in &output.rows {
        for (i, field) in row.iter().enumerate() {
            if i < widths.len() && field.len() > widths[i] {
                widths[i] = field.len();
            }
        }
    }

    let render_row = |fields: &[String]| -> String {
        fields
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{:<width$}", f, width = widths.get(i).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = Vec::with_capacity(output.rows.len() + 2);
    lines.push(render_row(&output.columns));
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("  "),
    );
    for row in &output.rows {
        lines.push(render_row(row));
    }
    lines.join("\n")
}
