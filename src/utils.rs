// ABOUTME: SQL identifier hygiene shared by every query-building module
// ABOUTME: Validate config-supplied names once, then quote them everywhere

use anyhow::{bail, Result};

/// Validate a PostgreSQL identifier (schema, table, or column name).
///
/// Config-supplied names end up interpolated into generated SQL, so they must
/// pass this check before any query builder sees them. Accepts the usual
/// unquoted-identifier alphabet: a leading letter or underscore followed by
/// letters, digits, and underscores, at most 63 bytes.
pub fn validate_postgres_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty");
    }
    if trimmed.len() > 63 {
        bail!(
            "Identifier '{}' exceeds the 63-character limit (got {})",
            trimmed,
            trimmed.len()
        );
    }
    let first = trimmed.chars().next().unwrap();
    if !first.is_ascii_alphabetic() && first != '_' {
        bail!(
            "Identifier '{}' must start with a letter or underscore",
            trimmed
        );
    }
    for c in trimmed.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}'",
                trimmed,
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                }
            );
        }
    }
    Ok(())
}

/// Double-quote an identifier, escaping embedded quotes.
///
/// Assumes the identifier has already been validated.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a schema-qualified table reference: `"schema"."table"`.
pub fn quote_qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}
