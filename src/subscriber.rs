//! # Subscriber Supervisor
//!
//! Owns the registry of active subscriptions for one consumer group.
//! `subscribe` lazily creates a subscription per topic, with its own store
//! handle and runner thread; repeated calls for the same topic
//! return the same stream. `close` fans shutdown out to every runner and
//! joins them.
//!
//! Each subscription's cancellation token is a child of the subscriber's
//! root token and is additionally wired to the caller-supplied context
//! token and to the store handle's interrupt hook, so cancelling the
//! context interrupts pending store I/O on that subscription.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::connection::{open_connection, validate_dsn};
use crate::error::{Error, Result};
use crate::schema::{ensure_topic_tables, seed_consumer_group};
use crate::subscription::{spawn_runner, SubscriptionConfig};
use crate::topic::{validate_topic_name, TableNameGenerators};
use crate::types::Message;

/// Default number of messages read per lease.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Largest accepted batch size.
const MAX_BATCH_SIZE: usize = 1_000_000;

/// Default idle wait between batch queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default time a consumer may hold a message before it is nacked.
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(30);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`Subscriber::new`]. Every field has a reasonable
/// default.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Consumer group sharing one delivery cursor per topic. The empty
    /// string is the default group and is legal.
    ///
    /// Messages are processed in batches under a lease, so another
    /// subscriber with the same group name only obtains messages when it
    /// acquires the group's lease.
    pub consumer_group: String,

    /// Number of messages read per acquired lease. Bounds `1..=1_000_000`.
    pub batch_size: usize,

    /// Idle wait between batch queries when no messages were available.
    /// Bounds one millisecond to one week.
    pub poll_interval: Duration,

    /// Time to wait for a message acknowledgement before nacking it and
    /// aborting the batch. `None` disables the deadline; an unresponsive
    /// consumer then blocks the subscription from reading new messages.
    pub ack_deadline: Option<Duration>,

    /// Create the topic tables on subscribe when they are absent.
    pub initialize_schema: bool,

    /// Table-name generators; must match the publisher's.
    pub table_names: TableNameGenerators,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            consumer_group: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ack_deadline: Some(DEFAULT_ACK_DEADLINE),
            initialize_schema: true,
            table_names: TableNameGenerators::default(),
        }
    }
}

// =============================================================================
// Message Stream
// =============================================================================

/// The outbound end of a subscription.
///
/// Clones share one underlying channel: when several consumers hold the
/// same stream, each message is delivered to exactly one of them.
/// `recv` returns `None` once the subscription has shut down.
#[derive(Clone)]
pub struct MessageStream {
    inner: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl MessageStream {
    fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rx)),
        }
    }

    /// Receives the next message, or `None` when the subscription is
    /// closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        self.inner.lock().await.recv().await
    }
}

impl fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}

// =============================================================================
// Subscriber
// =============================================================================

struct SubscriptionEntry {
    stream: MessageStream,
    cancel: CancellationToken,
    runner: JoinHandle<()>,
}

/// Streams messages from topics for one consumer group.
///
/// A subscriber is single-use: after [`Subscriber::close`] it cannot
/// produce new subscriptions.
pub struct Subscriber {
    dsn: String,
    config: SubscriberConfig,
    id: String,
    cancel: CancellationToken,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    closed: AtomicBool,
}

impl Subscriber {
    /// Validates the configuration and creates the subscriber. No store
    /// handle is opened until the first `subscribe`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConnectionString`] for an empty or private
    ///   in-memory DSN.
    /// - [`Error::InvalidTopicName`] when a non-empty consumer group
    ///   fails the name rules (groups follow topic-name validation).
    /// - [`Error::InvalidConfiguration`] for out-of-bounds batch size or
    ///   poll interval.
    pub fn new(dsn: &str, config: SubscriberConfig) -> Result<Self> {
        validate_dsn(dsn)?;
        if !config.consumer_group.is_empty() {
            validate_topic_name(&config.consumer_group)?;
        }
        if config.batch_size == 0 {
            return Err(Error::InvalidConfiguration(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if config.batch_size > MAX_BATCH_SIZE {
            return Err(Error::InvalidConfiguration(
                "batch_size must not exceed one million".to_string(),
            ));
        }
        if config.poll_interval < MIN_POLL_INTERVAL {
            return Err(Error::InvalidConfiguration(
                "poll_interval must be at least one millisecond".to_string(),
            ));
        }
        if config.poll_interval > MAX_POLL_INTERVAL {
            return Err(Error::InvalidConfiguration(
                "poll_interval must not exceed one week".to_string(),
            ));
        }

        Ok(Self {
            dsn: dsn.to_string(),
            config,
            id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Streams messages from `topic`. The first call creates the
    /// subscription; repeated calls return the same stream.
    ///
    /// Cancelling `ctx` shuts this subscription down and interrupts any
    /// pending store I/O on its handle.
    ///
    /// # Errors
    ///
    /// [`Error::SubscriberClosed`] after [`Subscriber::close`];
    /// [`Error::InvalidTopicName`] for a bad topic; [`Error::Sqlite`]
    /// when the store cannot be opened or bootstrapped.
    pub async fn subscribe(&self, ctx: CancellationToken, topic: &str) -> Result<MessageStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SubscriberClosed);
        }
        validate_topic_name(topic)?;

        let mut registry = self.subscriptions.lock().await;
        if let Some(entry) = registry.get(topic) {
            return Ok(entry.stream.clone());
        }

        let conn = open_connection(&self.dsn)?;
        let messages_table = self.config.table_names.messages_table(topic);
        let offsets_table = self.config.table_names.offsets_table(topic);
        if self.config.initialize_schema {
            ensure_topic_tables(&conn, &messages_table, &offsets_table)?;
        } else {
            validate_topic_name(&messages_table)?;
            validate_topic_name(&offsets_table)?;
        }
        seed_consumer_group(&conn, &offsets_table, &self.config.consumer_group)?;

        // One child token per subscription: cancelled by the caller's
        // context, by unsubscribe, or by subscriber close. The store
        // interrupt hook hangs off the same token.
        let sub_cancel = self.cancel.child_token();
        {
            let ctx = ctx.clone();
            let token = sub_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.cancelled() => token.cancel(),
                    _ = token.cancelled() => {}
                }
            });
        }
        {
            let interrupt = conn.get_interrupt_handle();
            let token = sub_cancel.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                interrupt.interrupt();
            });
        }

        let (tx, rx) = mpsc::channel(1);
        let runner = spawn_runner(
            conn,
            SubscriptionConfig {
                topic: topic.to_string(),
                consumer_group: self.config.consumer_group.clone(),
                messages_table,
                offsets_table,
                batch_size: self.config.batch_size,
                poll_interval: self.config.poll_interval,
                ack_deadline: self.config.ack_deadline,
            },
            tx,
            sub_cancel.clone(),
        )?;

        debug!(
            subscriber_id = %self.id,
            consumer_group = %self.config.consumer_group,
            topic = %topic,
            "subscribed"
        );

        let stream = MessageStream::new(rx);
        registry.insert(
            topic.to_string(),
            SubscriptionEntry {
                stream: stream.clone(),
                cancel: sub_cancel,
                runner,
            },
        );
        Ok(stream)
    }

    /// Shuts down the subscription for `topic`, joining its runner. A
    /// no-op for topics without a subscription.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let entry = self.subscriptions.lock().await.remove(topic);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            let _ = tokio::task::spawn_blocking(move || entry.runner.join()).await;
            debug!(subscriber_id = %self.id, topic = %topic, "unsubscribed");
        }
        Ok(())
    }

    /// Signals shutdown to every subscription and waits for their runners
    /// to terminate. Subsequent `subscribe` calls fail with
    /// [`Error::SubscriberClosed`]; repeated closes are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        let entries: Vec<SubscriptionEntry> = {
            let mut registry = self.subscriptions.lock().await;
            registry.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = tokio::task::spawn_blocking(move || entry.runner.join()).await;
        }
        debug!(subscriber_id = %self.id, "subscriber closed");
        Ok(())
    }

    /// Returns `true` once [`Subscriber::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tests
// =============================================================================
