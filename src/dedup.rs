//! # Expiring-Key Deduplication
//!
//! A small repository backing idempotent consumers: it remembers keys for
//! a configured window and answers "have I seen this before?". The table
//! is a plain `(key TEXT PRIMARY KEY, expires_at INTEGER)` pair; the
//! primary-key conflict on insert *is* the duplicate detection, so check
//! and record are one atomic statement.
//!
//! A background task purges expired rows on an interval and terminates
//! when the cleanup token is cancelled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::topic::validate_topic_name;

/// Table used when the configuration leaves the name empty.
pub const DEFAULT_EXPIRING_KEYS_TABLE: &str = "watermill_expiring_keys";

/// Smallest effective expiration window.
const MIN_EXPIRATION: Duration = Duration::from_millis(5);

/// Expiration used when the configuration leaves it zero.
const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60);

/// Purge interval used when the configuration leaves it zero.
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(15);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`ExpiringKeyRepository::new`].
#[derive(Debug, Clone)]
pub struct ExpiringKeyRepositoryConfig {
    /// Key table name; empty selects [`DEFAULT_EXPIRING_KEYS_TABLE`].
    /// Follows topic-name validation rules.
    pub table_name: String,

    /// How long a key counts as seen. Clamped to at least five
    /// milliseconds; zero selects the one-minute default.
    pub expiration: Duration,

    /// How often expired keys are purged. Zero selects the
    /// fifteen-second default.
    pub cleanup_interval: Duration,

    /// Cancelling this token stops the background purge task.
    pub cleanup_context: CancellationToken,
}

impl Default for ExpiringKeyRepositoryConfig {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            expiration: DEFAULT_EXPIRATION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cleanup_context: CancellationToken::new(),
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Tracks key duplicates within an expiration window.
#[derive(Debug)]
pub struct ExpiringKeyRepository {
    conn: Arc<Mutex<Connection>>,
    insert_sql: String,
    expiration: Duration,
}

impl ExpiringKeyRepository {
    /// Creates the key table and starts the background purge task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTopicName`] for a table name outside the rules.
    /// - [`Error::InitializationWithinTransaction`] when `conn` has an
    ///   open transaction.
    /// - [`Error::Sqlite`] when the table cannot be created.
    pub fn new(conn: Connection, config: ExpiringKeyRepositoryConfig) -> Result<Self> {
        let table = if config.table_name.is_empty() {
            DEFAULT_EXPIRING_KEYS_TABLE.to_string()
        } else {
            validate_topic_name(&config.table_name)?;
            config.table_name
        };
        let expiration = if config.expiration.is_zero() {
            DEFAULT_EXPIRATION
        } else {
            config.expiration.max(MIN_EXPIRATION)
        };
        let cleanup_interval = if config.cleanup_interval.is_zero() {
            DEFAULT_CLEANUP_INTERVAL
        } else {
            config.cleanup_interval
        };

        if !conn.is_autocommit() {
            return Err(Error::InitializationWithinTransaction);
        }
        conn.execute_batch(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
    key        TEXT PRIMARY KEY NOT NULL,
    expires_at INTEGER NOT NULL
);"#
        ))?;

        let conn = Arc::new(Mutex::new(conn));
        let insert_sql = format!(r#"INSERT INTO "{table}" (key, expires_at) VALUES (?1, ?2)"#);
        let cleanup_sql = format!(r#"DELETE FROM "{table}" WHERE expires_at < ?1"#);
        spawn_purge_task(
            Arc::clone(&conn),
            cleanup_sql,
            cleanup_interval,
            config.cleanup_context,
        );

        Ok(Self {
            conn,
            insert_sql,
            expiration,
        })
    }

    /// Records `key` and reports whether it was already present.
    ///
    /// `Ok(false)` means the key is new and is now recorded until it
    /// expires. `Ok(true)` means a live record already existed. An `Err`
    /// leaves the duplicate question unanswered; callers should treat it
    /// as a duplicate rather than risk reprocessing.
    pub async fn is_duplicate(&self, key: &str) -> Result<bool> {
        let conn = Arc::clone(&self.conn);
        let sql = self.insert_sql.clone();
        let key = key.to_string();
        let expires_at = Utc::now().timestamp_millis() + self.expiration.as_millis() as i64;

        let outcome = tokio::task::spawn_blocking(move || {
            conn.lock()
                .expect("connection mutex poisoned")
                .execute(&sql, params![key, expires_at])
        })
        .await
        .expect("deduplication insert task panicked");

        match outcome {
            Ok(_) => Ok(false),
            Err(err) if is_primary_key_conflict(&err) => Ok(true),
            Err(err) => Err(err.into()),
        }
    }
}

fn is_primary_key_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn spawn_purge_task(
    conn: Arc<Mutex<Connection>>,
    cleanup_sql: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can have expired yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let conn = Arc::clone(&conn);
            let sql = cleanup_sql.clone();
            let purged = tokio::task::spawn_blocking(move || {
                let now = Utc::now().timestamp_millis();
                conn.lock()
                    .expect("connection mutex poisoned")
                    .execute(&sql, params![now])
            })
            .await;
            match purged {
                Ok(Ok(deleted)) => {
                    debug!(deleted, "purged expired deduplication keys");
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "failed to purge expired deduplication keys");
                }
                Err(err) => {
                    warn!(error = %err, "deduplication purge task failed");
                }
            }
        }
    });
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_is_not_a_duplicate() {
        let conn = Connection::open_in_memory().expect("open");
        let repo = ExpiringKeyRepository::new(conn, ExpiringKeyRepositoryConfig::default())
            .expect("repository");

        assert!(!repo.is_duplicate("k").await.expect("first"));
        assert!(repo.is_duplicate("k").await.expect("repeat"));
        assert!(!repo.is_duplicate("other").await.expect("distinct key"));
    }

    #[tokio::test]
    async fn key_reappears_after_expiration_and_purge() {
        let conn = Connection::open_in_memory().expect("open");
        let repo = ExpiringKeyRepository::new(
            conn,
            ExpiringKeyRepositoryConfig {
                expiration: Duration::from_millis(1), // clamped to 5ms
                cleanup_interval: Duration::from_millis(10),
                ..ExpiringKeyRepositoryConfig::default()
            },
        )
        .expect("repository");

        assert!(!repo.is_duplicate("k").await.expect("first"));

        // Wait out the expiration plus at least one purge cycle.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if !repo.is_duplicate("k").await.expect("retry") {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "key was never purged"
            );
        }
    }

    #[tokio::test]
    async fn purge_task_stops_on_cancellation() {
        let conn = Connection::open_in_memory().expect("open");
        let cancel = CancellationToken::new();
        let repo = ExpiringKeyRepository::new(
            conn,
            ExpiringKeyRepositoryConfig {
                expiration: Duration::from_millis(1),
                cleanup_interval: Duration::from_millis(10),
                cleanup_context: cancel.clone(),
                ..ExpiringKeyRepositoryConfig::default()
            },
        )
        .expect("repository");

        assert!(!repo.is_duplicate("k").await.expect("record"));
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // With the purger stopped, the expired row stays and still
        // registers as a duplicate.
        assert!(repo.is_duplicate("k").await.expect("still present"));
    }

    #[tokio::test]
    async fn rejects_construction_within_transaction() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("BEGIN").expect("begin");
        let err = ExpiringKeyRepository::new(conn, ExpiringKeyRepositoryConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::InitializationWithinTransaction));
    }

    #[tokio::test]
    async fn rejects_invalid_table_name() {
        let conn = Connection::open_in_memory().expect("open");
        let err = ExpiringKeyRepository::new(
            conn,
            ExpiringKeyRepositoryConfig {
                table_name: "bad name".to_string(),
                ..ExpiringKeyRepositoryConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidTopicName { .. }));
    }
}
