//! # Subscription Runtime
//!
//! One runner per subscription, on a dedicated OS thread with a
//! current-thread tokio runtime. The runner owns the subscription's store
//! handle outright and drives the delivery state machine:
//!
//! ```text
//! Idle ──poll tick──► Acquiring ──lease row──► Reading ──batch──► Delivering
//!   ▲                     │                       │                   │
//!   │                zero rows                 empty                ack all
//!   │                     ▼                       ▼                   ▼
//!   └─────────────────── Idle ◄─────────────── Idle ◄─────────── Advancing
//! ```
//!
//! `Closed` is terminal from every state via the cancellation token.
//!
//! ## Lease protocol
//!
//! Competing subscribers in one consumer group are serialized by the
//! `locked_until` column. All arithmetic uses the store's `unixepoch()`
//! so clock skew between subscriber hosts is irrelevant:
//!
//! - **Acquire** sets `locked_until = now + grace` where the lease is
//!   free, returning the group's `offset_acked`. The `UPDATE ...
//!   RETURNING` is atomic; at most one caller observes a row.
//! - **Extend** runs every `grace − 1` seconds during long deliveries and
//!   carries the highest contiguous acked offset. Its predicate on the
//!   previously persisted `offset_acked` detects silent lease loss
//!   (another instance advanced the cursor); the runner then abandons
//!   the in-flight batch without writing anything.
//! - **Release** writes the final offset with `locked_until = 0`.
//!
//! ## Failure policy
//!
//! Transient store errors never terminate the runner: they are logged and
//! the runner backs off until the next poll tick. Only cancellation
//! terminates it. On a nack or an ack-deadline expiry the batch is
//! aborted and the offset advanced to the highest contiguous acked
//! message, so redelivery resumes exactly after the last confirmed one.

use std::future;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::types::{AckSignal, Message, Metadata};

/// Seconds a delivery lease stays valid without extension.
pub const LEASE_GRACE_SECONDS: i64 = 5;

/// The lease clock fires one second before the lease would lapse.
const LEASE_EXTEND_PERIOD: Duration = Duration::from_secs(LEASE_GRACE_SECONDS as u64 - 1);

// =============================================================================
// Configuration
// =============================================================================

/// Per-subscription parameters, resolved by the subscriber supervisor.
pub(crate) struct SubscriptionConfig {
    pub(crate) topic: String,
    pub(crate) consumer_group: String,
    pub(crate) messages_table: String,
    pub(crate) offsets_table: String,
    pub(crate) batch_size: usize,
    pub(crate) poll_interval: Duration,
    /// `None` disables the nack clock; delivery then blocks on the
    /// consumer indefinitely.
    pub(crate) ack_deadline: Option<Duration>,
}

/// Spawns the runner thread for one subscription.
///
/// The thread hosts a current-thread runtime and blocks on the runner
/// future; the outbound channel closes when the runner exits and the
/// sender drops.
pub(crate) fn spawn_runner(
    conn: Connection,
    config: SubscriptionConfig,
    output: mpsc::Sender<Message>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let thread_name = format!("millstone-sub-{}", config.topic);
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create subscription runtime");
            rt.block_on(Runner::new(conn, config, output, cancel).run());
        })
        .map_err(|e| Error::Unknown(format!("failed to spawn subscription thread: {e}")))
}

// =============================================================================
// Runner
// =============================================================================

/// Result of one pass through the poll loop.
enum Outcome {
    /// A full batch was delivered and acknowledged; acquire again
    /// immediately.
    Delivered,
    /// No lease, or no rows behind the cursor; wait for the next tick.
    Idle,
    /// The batch was abandoned (nack, deadline, lease loss or shutdown);
    /// wait for the next tick.
    Aborted,
}

/// The consumer's effective verdict on one delivered message.
enum Verdict {
    Ack,
    Nack,
    Deadline,
}

struct Runner {
    conn: Connection,
    topic: String,
    consumer_group: String,
    poll_interval: Duration,
    ack_deadline: Option<Duration>,
    sql_acquire: String,
    sql_extend: String,
    sql_batch: String,
    sql_ack: String,
    output: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl Runner {
    fn new(
        conn: Connection,
        config: SubscriptionConfig,
        output: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        let offsets = &config.offsets_table;
        let messages = &config.messages_table;
        let sql_acquire = format!(
            r#"UPDATE "{offsets}" SET locked_until = unixepoch() + {LEASE_GRACE_SECONDS}
WHERE consumer_group = ?1 AND locked_until < unixepoch()
RETURNING offset_acked"#
        );
        let sql_extend = format!(
            r#"UPDATE "{offsets}" SET locked_until = unixepoch() + {LEASE_GRACE_SECONDS}, offset_acked = ?1
WHERE consumer_group = ?2 AND offset_acked = ?3 AND locked_until >= unixepoch()
RETURNING locked_until"#
        );
        let sql_batch = format!(
            r#"SELECT "offset", uuid, created_at, payload, metadata
FROM "{messages}"
WHERE "offset" > ?1
ORDER BY "offset" ASC
LIMIT {}"#,
            config.batch_size
        );
        let sql_ack = format!(
            r#"UPDATE "{offsets}" SET offset_acked = ?1, locked_until = 0
WHERE consumer_group = ?2 AND offset_acked = ?3"#
        );

        Self {
            conn,
            topic: config.topic,
            consumer_group: config.consumer_group,
            poll_interval: config.poll_interval,
            ack_deadline: config.ack_deadline,
            sql_acquire,
            sql_extend,
            sql_batch,
            sql_ack,
            output,
            cancel,
        }
    }

    async fn run(self) {
        debug!(
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            "subscription runner started"
        );

        let mut poll = time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'outer,
                _ = poll.tick() => {}
            }

            // Drain available work; return to the tick wait once idle.
            loop {
                if self.cancel.is_cancelled() {
                    break 'outer;
                }
                match self.poll_once().await {
                    Ok(Outcome::Delivered) => continue,
                    Ok(Outcome::Idle) | Ok(Outcome::Aborted) => break,
                    Err(err) => {
                        warn!(
                            topic = %self.topic,
                            consumer_group = %self.consumer_group,
                            error = %err,
                            "subscription poll failed; backing off until next tick"
                        );
                        break;
                    }
                }
            }
        }

        debug!(
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            "subscription runner stopped"
        );
    }

    async fn poll_once(&self) -> Result<Outcome> {
        let Some(acked) = self.acquire_lease()? else {
            // Another subscriber instance holds the lease.
            return Ok(Outcome::Idle);
        };
        let batch = self.read_batch(acked)?;
        if batch.is_empty() {
            // No work; the lease lapses on its own after the grace period.
            return Ok(Outcome::Idle);
        }
        self.deliver_batch(acked, batch).await
    }

    // =========================================================================
    // Lease Statements
    // =========================================================================

    fn acquire_lease(&self) -> Result<Option<i64>> {
        let mut stmt = self.conn.prepare_cached(&self.sql_acquire)?;
        let acked = stmt
            .query_row(params![self.consumer_group], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(acked)
    }

    /// Extends the lease, persisting `contiguous` as the new cursor.
    /// Returns `false` when the lease was silently lost to another
    /// instance; the caller must abandon the batch without writing.
    fn extend_lease(&self, persisted: &mut i64, contiguous: i64) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(&self.sql_extend)?;
        let extended = stmt
            .query_row(
                params![contiguous, self.consumer_group, *persisted],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        match extended {
            Some(_) => {
                *persisted = contiguous;
                Ok(true)
            }
            None => {
                warn!(
                    topic = %self.topic,
                    consumer_group = %self.consumer_group,
                    "lease lost during delivery; abandoning in-flight batch"
                );
                Ok(false)
            }
        }
    }

    /// Writes `contiguous` as the acked offset and frees the lease. The
    /// predicate on the previously persisted value detects concurrent
    /// mutation of the offsets row.
    fn release_lease(&self, persisted: &mut i64, contiguous: i64) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(&self.sql_ack)?;
        let changed = stmt.execute(params![contiguous, self.consumer_group, *persisted])?;
        if changed == 0 {
            warn!(
                topic = %self.topic,
                consumer_group = %self.consumer_group,
                offset_acked = contiguous,
                "offset row changed concurrently; progress not persisted"
            );
        } else {
            *persisted = contiguous;
        }
        Ok(())
    }

    // =========================================================================
    // Batch Read
    // =========================================================================

    fn read_batch(&self, acked: i64) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare_cached(&self.sql_batch)?;
        let rows = stmt.query_map(params![acked], |row| {
            Ok(StoredMessage {
                offset: row.get(0)?,
                uuid: row.get(1)?,
                created_at: row.get(2)?,
                payload: row.get(3)?,
                metadata: row.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    async fn deliver_batch(&self, initial_acked: i64, batch: Vec<StoredMessage>) -> Result<Outcome> {
        // Cursor value currently persisted in the offsets row.
        let mut persisted = initial_acked;
        // Highest contiguous acked offset in this batch.
        let mut contiguous = initial_acked;

        let mut lease_clock =
            time::interval_at(Instant::now() + LEASE_EXTEND_PERIOD, LEASE_EXTEND_PERIOD);
        lease_clock.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for stored in batch {
            let offset = stored.offset;
            trace!(
                topic = %self.topic,
                offset,
                uuid = %stored.uuid,
                created_at = %stored.created_at,
                "delivering message"
            );
            let (msg, waiter) = match stored.into_message() {
                Ok(pair) => pair,
                Err(err) => {
                    self.release_lease(&mut persisted, contiguous)?;
                    return Err(err);
                }
            };

            let nack_clock = ack_deadline_clock(self.ack_deadline);
            tokio::pin!(nack_clock);

            // Hand the message to the outbound channel. Blocks until the
            // consumer side has capacity, the nack clock fires, or the
            // subscription is shut down.
            let permit = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(Outcome::Aborted),
                    _ = lease_clock.tick() => {
                        if !self.extend_lease(&mut persisted, contiguous)? {
                            return Ok(Outcome::Aborted);
                        }
                    }
                    _ = &mut nack_clock => {
                        self.release_lease(&mut persisted, contiguous)?;
                        return Ok(Outcome::Aborted);
                    }
                    permit = self.output.reserve() => match permit {
                        Ok(permit) => break permit,
                        // Every stream handle dropped; equivalent to close.
                        Err(_) => return Ok(Outcome::Aborted),
                    },
                }
            };
            permit.send(msg);
            let wait = waiter.wait();
            tokio::pin!(wait);

            // Await the consumer's verdict.
            let verdict = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(Outcome::Aborted),
                    _ = lease_clock.tick() => {
                        if !self.extend_lease(&mut persisted, contiguous)? {
                            return Ok(Outcome::Aborted);
                        }
                    }
                    _ = &mut nack_clock => break Verdict::Deadline,
                    signal = &mut wait => break match signal {
                        AckSignal::Ack => Verdict::Ack,
                        AckSignal::Nack => Verdict::Nack,
                    },
                }
            };

            match verdict {
                Verdict::Ack => contiguous = offset,
                Verdict::Nack => {
                    debug!(
                        topic = %self.topic,
                        consumer_group = %self.consumer_group,
                        offset,
                        "message nacked; aborting batch for redelivery"
                    );
                    self.release_lease(&mut persisted, contiguous)?;
                    return Ok(Outcome::Aborted);
                }
                Verdict::Deadline => {
                    debug!(
                        topic = %self.topic,
                        consumer_group = %self.consumer_group,
                        offset,
                        "ack deadline passed; aborting batch for redelivery"
                    );
                    self.release_lease(&mut persisted, contiguous)?;
                    return Ok(Outcome::Aborted);
                }
            }
        }

        // Advancing: the whole batch is acknowledged.
        self.release_lease(&mut persisted, contiguous)?;
        Ok(Outcome::Delivered)
    }
}

/// The per-message nack clock; never fires when the deadline is disabled.
async fn ack_deadline_clock(deadline: Option<Duration>) {
    match deadline {
        Some(timeout) => time::sleep(timeout).await,
        None => future::pending().await,
    }
}

// =============================================================================
// Stored Rows
// =============================================================================

/// One row of the batch query, not yet reconstructed into a [`Message`].
struct StoredMessage {
    offset: i64,
    uuid: String,
    created_at: String,
    payload: Vec<u8>,
    metadata: String,
}

impl StoredMessage {
    fn into_message(self) -> Result<(Message, crate::types::AckWaiter)> {
        let metadata: Metadata =
            serde_json::from_str(&self.metadata).map_err(|source| Error::MetadataDecoding {
                uuid: self.uuid.clone(),
                source,
            })?;
        let mut msg = Message::new(self.uuid, self.payload);
        msg.metadata = metadata;
        let waiter = msg.attach_signal();
        Ok((msg, waiter))
    }
}

// =============================================================================
// Tests
// =============================================================================
