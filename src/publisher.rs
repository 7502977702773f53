//! # Publisher
//!
//! Appends message batches to per-topic tables. The publisher owns a
//! dedicated writer thread holding the store handle; async callers talk
//! to it over a request channel with one-shot responses, so `publish` is
//! callable from any task without sharing the connection.
//!
//! ## Write path
//!
//! 1. Reject when closed; validate the topic name.
//! 2. JSON-encode every message's metadata up front: a single encoding
//!    failure aborts the whole batch before any row is written.
//! 3. On the first sight of a topic, bootstrap its tables. The
//!    known-topics set is advisory: losing it only causes a redundant
//!    `CREATE TABLE IF NOT EXISTS` round, never incorrect data.
//! 4. Insert the batch as one multi-VALUES statement. SQLite's
//!    per-statement atomicity makes the batch all-or-nothing.
//!
//! The publisher never retries internally; store errors surface to the
//! caller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error};

use crate::connection::open_connection;
use crate::error::{Error, Result};
use crate::schema::ensure_topic_tables;
use crate::topic::{validate_topic_name, TableNameGenerators};
use crate::types::Message;

/// Size of the publish request channel.
const PUBLISH_CHANNEL_SIZE: usize = 64;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`Publisher::new`].
#[derive(Debug, Clone, Default)]
pub struct PublisherConfig {
    /// Table-name generators. Must match the subscriber's generators for
    /// the two sides to see the same tables.
    pub table_names: TableNameGenerators,
}

// =============================================================================
// Request Types
// =============================================================================

enum PublishRequest {
    Publish {
        topic: String,
        messages: Vec<Message>,
        response: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

// =============================================================================
// Publisher Handle
// =============================================================================

/// Appends messages to topics, creating topic tables lazily.
///
/// `Publisher` is `Send + Sync`; clones of the handle are not needed
/// because all methods take `&self`.
pub struct Publisher {
    request_tx: mpsc::Sender<PublishRequest>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    closed: AtomicBool,
}

impl Publisher {
    /// Opens a store handle for `dsn` and spawns the writer thread.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConnectionString`] for an empty or private
    /// in-memory DSN; [`Error::Sqlite`] when the store cannot be opened.
    pub fn new(dsn: &str, config: PublisherConfig) -> Result<Self> {
        let conn = open_connection(dsn)?;
        let (request_tx, request_rx) = mpsc::channel(PUBLISH_CHANNEL_SIZE);

        let worker = PublishWorker {
            conn,
            table_names: config.table_names,
            known_topics: HashSet::new(),
        };
        let handle = thread::Builder::new()
            .name("millstone-publisher".to_string())
            .spawn(move || worker.run(request_rx))
            .map_err(|e| Error::Unknown(format!("failed to spawn publisher thread: {e}")))?;

        Ok(Self {
            request_tx,
            worker: Arc::new(Mutex::new(Some(handle))),
            closed: AtomicBool::new(false),
        })
    }

    /// Appends `messages`, in argument order, to the topic's messages
    /// table. Returns only when every row is durable. An empty batch is a
    /// no-op success.
    ///
    /// # Errors
    ///
    /// - [`Error::PublisherClosed`] after [`Publisher::close`].
    /// - [`Error::InvalidTopicName`] for a topic outside the allowed
    ///   character class.
    /// - [`Error::MetadataEncoding`] when any message's metadata fails to
    ///   serialize; the batch is aborted whole.
    /// - [`Error::Sqlite`] for store-level failures.
    pub async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PublisherClosed);
        }
        validate_topic_name(topic)?;
        if messages.is_empty() {
            return Ok(());
        }

        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(PublishRequest::Publish {
                topic: topic.to_string(),
                messages,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::PublisherClosed)?;
        response_rx.await.map_err(|_| Error::PublisherClosed)?
    }

    /// Shuts the writer thread down and closes the store handle. Further
    /// `publish` calls fail with [`Error::PublisherClosed`]; repeated
    /// closes are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.request_tx.send(PublishRequest::Shutdown).await;
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        Ok(())
    }
}

// =============================================================================
// Writer Thread
// =============================================================================

struct PublishWorker {
    conn: Connection,
    table_names: TableNameGenerators,
    known_topics: HashSet<String>,
}

impl PublishWorker {
    fn run(mut self, mut request_rx: mpsc::Receiver<PublishRequest>) {
        while let Some(request) = request_rx.blocking_recv() {
            match request {
                PublishRequest::Publish {
                    topic,
                    messages,
                    response,
                } => {
                    let result = self.publish(&topic, messages);
                    if let Err(err) = &result {
                        error!(topic = %topic, error = %err, "publish failed");
                    }
                    let _ = response.send(result);
                }
                PublishRequest::Shutdown => break,
            }
        }
    }

    fn publish(&mut self, topic: &str, messages: Vec<Message>) -> Result<()> {
        let created_at = Utc::now().to_rfc3339();
        let mut placeholders = Vec::with_capacity(messages.len());
        let mut values: Vec<Value> = Vec::with_capacity(messages.len() * 4);
        for msg in messages {
            let metadata =
                serde_json::to_string(&msg.metadata).map_err(|source| Error::MetadataEncoding {
                    uuid: msg.uuid.clone(),
                    source,
                })?;
            values.push(Value::Text(msg.uuid));
            values.push(Value::Text(created_at.clone()));
            values.push(Value::Blob(msg.payload));
            values.push(Value::Text(metadata));
            placeholders.push("(?, ?, ?, ?)");
        }

        let messages_table = self.table_names.messages_table(topic);
        if !self.known_topics.contains(topic) {
            let offsets_table = self.table_names.offsets_table(topic);
            ensure_topic_tables(&self.conn, &messages_table, &offsets_table)?;
            self.known_topics.insert(topic.to_string());
            debug!(topic = %topic, table = %messages_table, "initialized topic tables");
        }

        let sql = format!(
            r#"INSERT INTO "{messages_table}" (uuid, created_at, payload, metadata) VALUES {}"#,
            placeholders.join(", ")
        );
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_topic_before_touching_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dsn = dir.path().join("pub.db");
        let publisher =
            Publisher::new(dsn.to_str().unwrap(), PublisherConfig::default()).expect("publisher");

        let err = publisher
            .publish("bad topic", vec![Message::new("m1", Vec::new())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTopicName { .. }));
        publisher.close().await.expect("close");
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dsn = dir.path().join("pub.db");
        let publisher =
            Publisher::new(dsn.to_str().unwrap(), PublisherConfig::default()).expect("publisher");

        publisher.publish("orders", Vec::new()).await.expect("noop");

        // No tables were created for the topic.
        let conn = Connection::open(&dsn).expect("open");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'watermill_%'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 0);
        publisher.close().await.expect("close");
    }

    #[tokio::test]
    async fn publish_after_close_fails_and_double_close_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dsn = dir.path().join("pub.db");
        let publisher =
            Publisher::new(dsn.to_str().unwrap(), PublisherConfig::default()).expect("publisher");

        publisher.close().await.expect("first close");
        publisher.close().await.expect("second close");

        let err = publisher
            .publish("orders", vec![Message::new("m1", Vec::new())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublisherClosed));
    }

    #[tokio::test]
    async fn batch_lands_in_publish_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dsn = dir.path().join("pub.db");
        let publisher =
            Publisher::new(dsn.to_str().unwrap(), PublisherConfig::default()).expect("publisher");

        let batch = vec![
            Message::new("a", b"1".to_vec()).with_metadata("k", "v"),
            Message::new("b", b"2".to_vec()),
            Message::new("c", b"3".to_vec()),
        ];
        publisher.publish("orders", batch).await.expect("publish");
        publisher.close().await.expect("close");

        let conn = Connection::open(&dsn).expect("open");
        let mut stmt = conn
            .prepare(r#"SELECT uuid FROM "watermill_orders" ORDER BY "offset""#)
            .expect("prepare");
        let uuids: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<std::result::Result<_, _>>()
            .expect("collect");
        assert_eq!(uuids, vec!["a", "b", "c"]);
    }
}
