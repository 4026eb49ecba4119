// ABOUTME: CLI entry point for table-sync
// ABOUTME: Loads config, sets up logging, and runs the requested operations

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use table_sync::config::{self, Config};
use table_sync::postgres;
use table_sync::query;
use table_sync::sync::{SyncDriver, SyncOutcome};

#[derive(Parser)]
#[command(name = "table-sync")]
#[command(about = "Synchronize PostgreSQL tables, create views, or run queries", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file (TOML)
    config: PathBuf,

    /// Synchronize the main table with the stage table
    #[arg(long)]
    sync: bool,

    /// (Re)create the view defined in the [view] config section
    #[arg(long = "create-view")]
    create_view: bool,

    /// Run the SELECT defined in the [query] config section
    #[arg(long = "select-query")]
    select_query: bool,

    /// Write query results to this CSV file instead of stdout
    #[arg(long = "output-csv")]
    output_csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load(&cli.config)?;
    init_logging(&config);

    if !cli.sync && !cli.create_view && !cli.select_query {
        tracing::warn!("No operation requested; pass --sync, --create-view, or --select-query");
        return Ok(());
    }

    let mut client = postgres::connect_with_retry(&config.database).await?;

    // Operations run in order and fail independently; any failure makes the
    // process exit non-zero at the end.
    let mut failures: Vec<String> = Vec::new();

    if cli.sync {
        let report = SyncDriver::new(&mut client, &config.database, &config.schema, &config.sync)
            .run()
            .await;
        let totals = report.totals;
        tracing::info!(
            "Sync scanned {} row(s) in {} page(s) ({} ms): {} inserted, {} updated, {} deleted",
            totals.scanned,
            report.pages,
            report.duration_ms,
            totals.inserted,
            totals.updated,
            totals.deleted
        );
        match report.outcome {
            SyncOutcome::Success => {}
            SyncOutcome::PartialFailure(e) => {
                tracing::error!(
                    "Sync stopped after {} committed page(s): {}",
                    report.pages,
                    e
                );
                failures.push(format!("sync: {}", e));
            }
            SyncOutcome::Fatal(e) => {
                tracing::error!("Sync failed before committing any page: {}", e);
                failures.push(format!("sync: {}", e));
            }
        }
    }

    if cli.create_view {
        let result = match &config.view {
            Some(view) => {
                query::create_view(
                    &mut client,
                    &config.schema.schema_name,
                    &view.view_name,
                    &view.query,
                )
                .await
            }
            None => Err(anyhow::anyhow!(
                "--create-view requires a [view] section in the config file"
            )),
        };
        if let Err(e) = result {
            tracing::error!("View creation failed: {:#}", e);
            failures.push(format!("create-view: {:#}", e));
        }
    }

    if cli.select_query {
        if let Err(e) = run_select(&client, &config, cli.output_csv.as_deref()).await {
            tracing::error!("Query execution failed: {:#}", e);
            failures.push(format!("select-query: {:#}", e));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} operation(s) failed: {}",
            failures.len(),
            failures.join("; ")
        )
    }
}

async fn run_select(
    client: &tokio_postgres::Client,
    config: &Config,
    output_csv: Option<&std::path::Path>,
) -> Result<()> {
    let sql = &config
        .query
        .as_ref()
        .context("--select-query requires a [query] section in the config file")?
        .sql;
    let output = query::execute_select(client, sql).await?;
    match output_csv {
        Some(path) => query::write_csv(&output, path)?,
        None => println!("{}", query::render_table(&output)),
    }
    Ok(())
}

/// RUST_LOG wins, then the config file's logging.level, then "info".
fn init_logging(config: &Config) {
    let default_level = config.logging.level.as_deref().unwrap_or("info");
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    if config.logging.format.as_deref() == Some("compact") {
        builder.compact().init();
    } else {
        builder.init();
    }
}
