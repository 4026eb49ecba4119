// ABOUTME: TOML configuration loading for table-sync
// ABOUTME: Validates identifiers up front so SQL generation can trust them

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::utils::validate_postgres_identifier;

/// Top-level configuration file.
///
/// The `[view]` and `[query]` sections are optional; the operations that need
/// them fail at the point of use when they are missing.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub schema: SchemaConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub view: Option<ViewConfig>,
    pub query: Option<QueryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    /// Pool sizing hint kept for config compatibility. The tool runs a single
    /// sequential sync and holds one connection, so this is accepted but unused.
    #[serde(default)]
    pub min_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    pub schema_name: String,
    pub main_table: String,
    pub stage_table: String,
    pub history_table: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub batch_size: usize,
    /// Business key column used to match rows between main and stage.
    #[serde(default = "default_key_column")]
    pub key_column: String,
    /// Last-write-wins tie-breaker column.
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    /// "full" (default) or "compact".
    pub format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    pub view_name: String,
    pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub sql: String,
}

fn default_port() -> u16 {
    5432
}

fn default_key_column() -> String {
    "filenames".to_string()
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

/// Load and validate a configuration file.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Validate every identifier that will be quoted into generated SQL.
    fn validate(&self) -> Result<()> {
        for (what, ident) in [
            ("schema.schema_name", &self.schema.schema_name),
            ("schema.main_table", &self.schema.main_table),
            ("schema.stage_table", &self.schema.stage_table),
            ("schema.history_table", &self.schema.history_table),
            ("sync.key_column", &self.sync.key_column),
            ("sync.timestamp_column", &self.sync.timestamp_column),
        ] {
            validate_postgres_identifier(ident)
                .with_context(|| format!("Invalid identifier in config: {}", what))?;
        }
        if let Some(view) = &self.view {
            validate_postgres_identifier(&view.view_name)
                .context("Invalid identifier in config: view.view_name")?;
        }
        if self.sync.batch_size == 0 {
            anyhow::bail!("sync.batch_size must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL_CONFIG: &str = r#"
        [database]
        host = "localhost"
        name = "imaging"
        user = "sync"
        password = "secret"
        min_connections = 2

        [schema]
        schema_name = "cxr"
        main_table = "reports"
        stage_table = "reports_stage"
        history_table = "reports_history"

        [sync]
        batch_size = 500

        [logging]
        level = "debug"

        [view]
        view_name = "recent_reports"
        query = "SELECT * FROM cxr.reports WHERE size > 0"

        [query]
        sql = "SELECT filenames, size FROM cxr.reports"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(FULL_CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.database.host, "localhost");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.min_connections, Some(2));
        assert_eq!(config.schema.main_table, "reports");
        assert_eq!(config.sync.batch_size, 500);
        assert_eq!(config.sync.key_column, "filenames");
        assert_eq!(config.sync.timestamp_column, "timestamp");
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        assert_eq!(config.view.unwrap().view_name, "recent_reports");
        assert!(config.query.unwrap().sql.starts_with("SELECT"));
    }

    #[test]
    fn test_optional_sections_absent() {
        let minimal = r#"
            [database]
            host = "db"
            name = "n"
            user = "u"
            password = "p"

            [schema]
            schema_name = "public"
            main_table = "main"
            stage_table = "stage"
            history_table = "history"

            [sync]
            batch_size = 1000
        "#;
        let config: Config = toml::from_str(minimal).unwrap();
        config.validate().unwrap();
        assert!(config.view.is_none());
        assert!(config.query.is_none());
        assert!(config.logging.level.is_none());
    }

    #[test]
    fn test_rejects_bad_identifier() {
        let bad = FULL_CONFIG.replace("main_table = \"reports\"", "main_table = \"re;ports\"");
        let config: Config = toml::from_str(&bad).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let bad = FULL_CONFIG.replace("batch_size = 500", "batch_size = 0");
        let config: Config = toml::from_str(&bad).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL_CONFIG.as_bytes()).unwrap();
        let config = load(file.path()).unwrap();
        assert_eq!(config.database.name, "imaging");
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/table-sync.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
