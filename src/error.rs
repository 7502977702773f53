//! # Error Handling
//!
//! A single [`Error`] enum covers every failure mode in the crate. Callers
//! typically either propagate errors or match on the boundary-rejection
//! variants (`InvalidTopicName`, `PublisherClosed`, `SubscriberClosed`).
//!
//! ## Categories
//!
//! | Category | Variants | Typical response |
//! |----------|----------|------------------|
//! | Boundary rejection | `InvalidTopicName`, `InvalidConnectionString`, `InvalidConfiguration` | Fix the input |
//! | Lifecycle | `PublisherClosed`, `SubscriberClosed` | Stop calling |
//! | Schema | `InitializationWithinTransaction` | Bootstrap out-of-band |
//! | Codec | `MetadataEncoding`, `MetadataDecoding` | Inspect the message |
//! | Store | `Sqlite` | Surfaced verbatim to publishers; the subscription runner logs and retries on the next poll tick |

use thiserror::Error;

/// All errors that can occur in millstone operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The topic, consumer-group or table name is empty or contains a
    /// character outside `[A-Za-z0-9\-$:._]`.
    ///
    /// Names are interpolated into SQL statements because identifiers
    /// cannot be bound as parameters, so this check is the injection
    /// barrier. It runs before any string reaches a statement.
    #[error("invalid name {name:?}: names must be non-empty and contain only characters from [A-Za-z0-9-$:._]")]
    InvalidTopicName {
        /// The rejected identifier.
        name: String,
    },

    /// The publisher is closed and does not accept any more messages.
    #[error("publisher is closed and does not accept any more messages")]
    PublisherClosed,

    /// The subscriber is closed and can no longer produce subscriptions.
    #[error("subscriber is closed and can no longer produce subscriptions")]
    SubscriberClosed,

    /// Schema bootstrap was attempted while the connection had an open
    /// transaction. SQLite rejects DDL there; initialize the tables
    /// before opening a transaction.
    #[error("attempted table initialization within a transaction; initialize schema before opening one")]
    InitializationWithinTransaction,

    /// The connection string is empty or names a private in-memory
    /// database. A bare `:memory:` DSN gives every connection its own
    /// database, which breaks the offsets protocol silently; in-memory
    /// stores must use shared-cache mode.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// A configuration value is outside its documented bounds.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Message metadata could not be serialized to JSON at publish time.
    /// The whole batch is aborted; no row of it is written.
    #[error("unable to encode metadata of message {uuid:?} to JSON")]
    MetadataEncoding {
        /// UUID of the offending message.
        uuid: String,
        /// The underlying serialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// A stored metadata column could not be decoded back into a string
    /// map during delivery.
    #[error("unable to decode metadata of message {uuid:?} from JSON")]
    MetadataDecoding {
        /// UUID of the offending message.
        uuid: String,
        /// The underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// SQLite operation failed. Wraps any error from `rusqlite`:
    /// constraint violations, locked or corrupted files, interrupts.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Operation failed for a reason outside the taxonomy above,
    /// surfaced verbatim.
    #[error("{0}")]
    Unknown(String),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
