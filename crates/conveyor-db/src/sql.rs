//! Shared helpers for the Postgres stores.

use conveyor_core::StoreError;

/// Map driver errors onto the transient/permanent split the resilience
/// policy keys off. Connection-class SQLSTATEs (08xxx) and resource
/// pressure (53xxx, 57xxx) are transient.
pub(crate) fn map_sqlx(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => StoreError::Timeout("connection pool timed out".to_string()),
        sqlx::Error::PoolClosed => StoreError::Connection("connection pool closed".to_string()),
        sqlx::Error::Io(e) => StoreError::Connection(e.to_string()),
        sqlx::Error::Tls(e) => StoreError::Connection(e.to_string()),
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if code.starts_with("08") {
                StoreError::Connection(db.to_string())
            } else if code.starts_with("53") || code.starts_with("57") {
                StoreError::Busy(db.to_string())
            } else {
                StoreError::Other(anyhow::anyhow!("database error [{}]: {}", code, db))
            }
        }
        other => StoreError::Other(anyhow::anyhow!(other)),
    }
}

/// Table names are configuration, not user input, but they still end up
/// spliced into DDL/DML text; restrict them to identifier characters.
pub(crate) fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Other(anyhow::anyhow!(
            "invalid identifier \"{}\"",
            name
        )))
    }
}

/// `schema.table` or bare `table`, both parts validated.
pub(crate) fn qualified_table(
    schema: Option<&str>,
    table: &str,
) -> Result<String, StoreError> {
    validate_identifier(table)?;
    match schema {
        Some(schema) => {
            validate_identifier(schema)?;
            Ok(format!("{}.{}", schema, table))
        }
        None => Ok(table.to_string()),
    }
}
