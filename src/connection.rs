//! # Store Handles
//!
//! Every publisher and every subscription owns its own
//! [`rusqlite::Connection`]; handles are never shared, because SQLite
//! serializes callers on a single handle and per-handle ownership is what
//! buys concurrency between subscriptions.
//!
//! Connections are opened from a DSN and configured with the same pragma
//! block throughout the crate: WAL journaling so readers never block the
//! writer, `synchronous = NORMAL` to sync the WAL on commit only, a busy
//! timeout so contending handles wait instead of failing, and foreign
//! keys on.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Milliseconds a handle waits on a locked database before surfacing
/// `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u32 = 1000;

/// Validates a connection string.
///
/// The DSN must be non-empty, and an in-memory DSN must use shared-cache
/// mode: a private `:memory:` database is visible to one handle only, so
/// the publisher and each subscription would silently operate on
/// different databases.
pub fn validate_dsn(dsn: &str) -> Result<()> {
    if dsn.is_empty() {
        return Err(Error::InvalidConnectionString(
            "connection string is empty".to_string(),
        ));
    }
    let in_memory = dsn.contains(":memory:") || dsn.contains("mode=memory");
    if in_memory && !dsn.contains("cache=shared") {
        return Err(Error::InvalidConnectionString(
            "\":memory:\" does not work with multiple connections; use \
             \"file::memory:?cache=shared\""
                .to_string(),
        ));
    }
    Ok(())
}

/// Opens a connection for the given DSN and applies the standard pragmas.
pub(crate) fn open_connection(dsn: &str) -> Result<Connection> {
    validate_dsn(dsn)?;
    let conn = Connection::open(dsn)?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};\n\
         PRAGMA foreign_keys = ON;"
    ))?;
    Ok(conn)
}

// =============================================================================
// Tests
// =============================================================================
