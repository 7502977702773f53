//! # Per-Topic Schema
//!
//! Every topic is backed by two tables: a messages log and a
//! consumer-group offsets table. Both are created lazily, on first
//! publish or first subscribe, with `CREATE TABLE IF NOT EXISTS`, which
//! doubles as the serialization point for concurrent bootstrappers.
//!
//! ## Table shapes
//!
//! ```text
//! <messages>                         <offsets>
//! ┌────────────────────────┐         ┌─────────────────────────┐
//! │ "offset"  INTEGER PK   │         │ consumer_group TEXT PK  │
//! │ uuid       TEXT        │         │ offset_acked   INTEGER  │
//! │ created_at TEXT        │         │ locked_until   INTEGER  │
//! │ payload    BLOB        │         └─────────────────────────┘
//! │ metadata   TEXT (JSON) │
//! └────────────────────────┘
//! ```
//!
//! `"offset"` is `AUTOINCREMENT`, so offsets strictly increase within a
//! topic and are never reused; zero is the sentinel initial ack value and
//! no real row carries it. `locked_until` holds unixepoch seconds: a
//! value in the future means some subscriber instance holds the delivery
//! lease for that group.
//!
//! DDL must not run inside an open transaction; [`ensure_topic_tables`]
//! rejects that with [`Error::InitializationWithinTransaction`] before
//! touching the store.

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::topic::validate_topic_name;

/// Messages table DDL, parameterized by table name.
///
/// A UNIQUE constraint on uuid would slow inserts down without benefit;
/// message identity is the producer's concern.
fn create_messages_table_sql(table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS "{table}" (
    "offset"   INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    uuid       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    payload    BLOB NOT NULL,
    metadata   TEXT NOT NULL
);"#
    )
}

/// Offsets table DDL, parameterized by table name.
fn create_offsets_table_sql(table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS "{table}" (
    consumer_group TEXT NOT NULL,
    offset_acked   INTEGER NOT NULL,
    locked_until   INTEGER NOT NULL,
    PRIMARY KEY (consumer_group)
);"#
    )
}

/// Idempotently creates the messages and offsets tables for a topic.
///
/// Both table names are validated before interpolation. Safe to call from
/// concurrent publishers and subscribers; `IF NOT EXISTS` resolves the
/// race inside the store.
///
/// # Errors
///
/// - [`Error::InvalidTopicName`] if either table name fails validation.
/// - [`Error::InitializationWithinTransaction`] if the connection has an
///   open transaction.
/// - [`Error::Sqlite`] for store-level failures.
pub fn ensure_topic_tables(
    conn: &Connection,
    messages_table: &str,
    offsets_table: &str,
) -> Result<()> {
    validate_topic_name(messages_table)?;
    validate_topic_name(offsets_table)?;
    if !conn.is_autocommit() {
        return Err(Error::InitializationWithinTransaction);
    }

    conn.execute_batch(&create_messages_table_sql(messages_table))?;
    conn.execute_batch(&create_offsets_table_sql(offsets_table))?;
    Ok(())
}

/// Inserts the `(consumer_group, 0, 0)` cursor row for a new group,
/// ignoring the conflict when the group already exists.
///
/// The consumer group name is bound as a parameter; only the table name
/// is interpolated, and the caller has validated it.
pub(crate) fn seed_consumer_group(
    conn: &Connection,
    offsets_table: &str,
    consumer_group: &str,
) -> Result<()> {
    conn.execute(
        &format!(
            r#"INSERT INTO "{offsets_table}" (consumer_group, offset_acked, locked_until)
VALUES (?1, 0, 0)
ON CONFLICT(consumer_group) DO NOTHING"#
        ),
        [consumer_group],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        Connection::open_in_memory().expect("open in-memory db")
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )
            .expect("prepare");
        stmt.query_map([], |row| row.get(0))
            .expect("query")
            .collect::<std::result::Result<Vec<_>, _>>()
            .expect("collect")
    }

    #[test]
    fn creates_both_tables() {
        let conn = open();
        ensure_topic_tables(&conn, "watermill_orders", "watermill_offsets_orders")
            .expect("bootstrap");

        let tables = table_names(&conn);
        assert!(tables.contains(&"watermill_orders".to_string()));
        assert!(tables.contains(&"watermill_offsets_orders".to_string()));
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let conn = open();
        ensure_topic_tables(&conn, "watermill_t", "watermill_offsets_t").expect("first");
        ensure_topic_tables(&conn, "watermill_t", "watermill_offsets_t").expect("second");
        assert_eq!(table_names(&conn).len(), 2);
    }

    #[test]
    fn rejects_invalid_table_names() {
        let conn = open();
        let err = ensure_topic_tables(&conn, "bad table", "watermill_offsets_t").unwrap_err();
        assert!(matches!(err, Error::InvalidTopicName { .. }));
    }

    #[test]
    fn rejects_bootstrap_within_transaction() {
        let mut conn = open();
        let tx = conn.transaction().expect("begin");
        let err = ensure_topic_tables(&tx, "watermill_t", "watermill_offsets_t").unwrap_err();
        assert!(matches!(err, Error::InitializationWithinTransaction));
        tx.rollback().expect("rollback");
    }

    #[test]
    fn seed_is_conflict_ignored() {
        let conn = open();
        ensure_topic_tables(&conn, "watermill_t", "watermill_offsets_t").expect("bootstrap");
        seed_consumer_group(&conn, "watermill_offsets_t", "g1").expect("first seed");
        seed_consumer_group(&conn, "watermill_offsets_t", "g1").expect("repeat seed");

        let (acked, locked): (i64, i64) = conn
            .query_row(
                "SELECT offset_acked, locked_until FROM watermill_offsets_t WHERE consumer_group = 'g1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("row");
        assert_eq!((acked, locked), (0, 0));
    }

    #[test]
    fn empty_consumer_group_is_a_legal_row() {
        let conn = open();
        ensure_topic_tables(&conn, "watermill_t", "watermill_offsets_t").expect("bootstrap");
        seed_consumer_group(&conn, "watermill_offsets_t", "").expect("seed empty group");

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM watermill_offsets_t WHERE consumer_group = ''",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);
    }
}
