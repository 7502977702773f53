//! # millstone: a durable publish/subscribe bus on SQLite
//!
//! Producers append messages to named topics; independent consumer groups
//! stream each topic's messages in arrival order with at-least-once
//! delivery, across process restarts. SQLite is both the queue and the
//! persistence layer; there is no external broker.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  publish   ┌──────────────────────────┐
//! │  Publisher   │───────────►│  watermill_<topic>       │
//! │ (writer      │            │  (append-only log)       │
//! │  thread)     │            └────────────┬─────────────┘
//! └──────────────┘                         │ batch read
//!                                          ▼
//! ┌──────────────┐  lease     ┌──────────────────────────┐
//! │ Subscriber   │◄──────────►│  watermill_offsets_<t>   │
//! │ (one runner  │            │  (cursor + locked_until) │
//! │  per topic)  │            └──────────────────────────┘
//! └──────┬───────┘
//!        │ MessageStream
//!        ▼
//!   consumer: ack / nack per message
//! ```
//!
//! Competing subscribers in one consumer group are serialized by an
//! expiring lease on the group's offsets row, so at any instant at most
//! one instance is delivering. A crashed consumer's lease simply lapses
//! and another instance picks the same messages up again.
//!
//! ## Example
//!
//! ```rust,ignore
//! use millstone::{Message, Publisher, PublisherConfig, Subscriber, SubscriberConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> millstone::Result<()> {
//!     let publisher = Publisher::new("bus.db", PublisherConfig::default())?;
//!     publisher
//!         .publish("orders", vec![Message::new("order-1", b"created".to_vec())])
//!         .await?;
//!
//!     let subscriber = Subscriber::new("bus.db", SubscriberConfig {
//!         consumer_group: "billing".to_string(),
//!         ..SubscriberConfig::default()
//!     })?;
//!     let stream = subscriber.subscribe(CancellationToken::new(), "orders").await?;
//!     while let Some(msg) = stream.recv().await {
//!         println!("got {}", msg.uuid);
//!         msg.ack();
//!     }
//!
//!     subscriber.close().await?;
//!     publisher.close().await
//! }
//! ```

/// Error types for all bus operations.
pub mod error;

/// Topic-name validation and table-name generation.
pub mod topic;

/// Per-topic table DDL and lazy schema bootstrap.
pub mod schema;

/// Store handle opening, DSN validation and pragmas.
pub mod connection;

/// Messages and acknowledgement signals.
pub mod types;

/// The publisher and its writer thread.
pub mod publisher;

/// The subscription runtime: poll loop, lease protocol, delivery.
///
/// One runner task per subscription, each owning a dedicated store
/// handle. See the module docs for the delivery state machine.
pub mod subscription;

/// The subscriber supervisor: subscription registry and shutdown fan-out.
pub mod subscriber;

/// Expiring-key deduplication for idempotent consumers.
pub mod dedup;

pub use dedup::{ExpiringKeyRepository, ExpiringKeyRepositoryConfig};
pub use error::{Error, Result};
pub use publisher::{Publisher, PublisherConfig};
pub use subscriber::{MessageStream, Subscriber, SubscriberConfig};
pub use subscription::LEASE_GRACE_SECONDS;
pub use topic::{validate_topic_name, TableNameGenerator, TableNameGenerators};
pub use types::{Message, Metadata};
