// ABOUTME: Error taxonomy for the sync core - retryable vs fatal categories
// ABOUTME: The driver's retry loop checks is_transient() explicitly

use thiserror::Error;

/// Errors raised by the sync core.
///
/// The driver retries `Connection` errors at page granularity; everything
/// else propagates to the nearest transaction boundary and aborts the run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient connectivity or resource-exhaustion failure.
    #[error("database connection error: {0}")]
    Connection(#[source] tokio_postgres::Error),

    /// Schema reconciliation or catalog read failure. Fatal.
    #[error("schema error for {schema}.{table}: {message}")]
    Schema {
        schema: String,
        table: String,
        message: String,
    },

    /// Any other database failure. Fatal.
    #[error("database error: {0}")]
    Database(#[source] tokio_postgres::Error),
}

impl SyncError {
    /// Whether the driver's retry loop should re-attempt the page.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connection(_))
    }

    pub fn schema(schema: &str, table: &str, message: impl Into<String>) -> Self {
        SyncError::Schema {
            schema: schema.to_string(),
            table: table.to_string(),
            message: message.into(),
        }
    }
}

impl From<tokio_postgres::Error> for SyncError {
    /// Classify a driver error as transient or fatal.
    ///
    /// Transient: the connection dropped, or the server reported a
    /// connection-exception (class 08), insufficient-resources (class 53,
    /// which covers connection-slot exhaustion), or admin-shutdown state.
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            return SyncError::Connection(err);
        }
        match err.code() {
            Some(state) if is_transient_sqlstate(state.code()) => SyncError::Connection(err),
            _ => SyncError::Database(err),
        }
    }
}

/// SQLSTATE codes the retry loop treats as transient.
pub(crate) fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("53") || code == "57P01"
}
