//! # Messages and Acknowledgement Signals
//!
//! A [`Message`] is the unit of exchange: a producer-assigned UUID, an
//! opaque payload, and a string-to-string metadata map. On the consumer
//! side every delivered message additionally carries a one-shot
//! acknowledgement channel back to the subscription runner.
//!
//! ## At-least-once contract
//!
//! The runner delivers a message and then waits for exactly one signal:
//! [`Message::ack`] confirms processing and lets the group's offset
//! advance past this message; [`Message::nack`] requests redelivery and
//! aborts the rest of the in-flight batch. Dropping a delivered message
//! without signalling counts as a nack, so a panicking consumer can never
//! silently swallow a message.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::oneshot;

/// Message metadata: a JSON-encodable mapping from string to string.
pub type Metadata = HashMap<String, String>;

/// The consumer's verdict on a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckSignal {
    /// Processing succeeded; the offset may advance.
    Ack,
    /// Processing failed; redeliver.
    Nack,
}

/// A publish/subscribe message.
///
/// Producers build messages with [`Message::new`] and
/// [`Message::with_metadata`]; consumers receive messages from a
/// subscription stream and must settle each one with [`Message::ack`] or
/// [`Message::nack`].
pub struct Message {
    /// Opaque message identity as assigned by the producer.
    pub uuid: String,
    /// Opaque byte payload.
    pub payload: Vec<u8>,
    /// Producer-supplied metadata, persisted as JSON.
    pub metadata: Metadata,
    signal: Option<oneshot::Sender<AckSignal>>,
}

impl Message {
    /// Creates a message for publishing.
    pub fn new(uuid: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            uuid: uuid.into(),
            payload,
            metadata: Metadata::new(),
            signal: None,
        }
    }

    /// Adds a metadata entry, builder-style.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Confirms successful processing.
    ///
    /// Returns `false` when the message carried no live signal channel:
    /// it was never delivered by a subscription, was already settled, or
    /// the subscription runner has moved on (deadline passed, batch
    /// aborted, subscriber closed).
    pub fn ack(mut self) -> bool {
        self.settle(AckSignal::Ack)
    }

    /// Requests redelivery. The runner aborts the in-flight batch without
    /// advancing the group offset past this message.
    ///
    /// Returns `false` under the same conditions as [`Message::ack`].
    pub fn nack(mut self) -> bool {
        self.settle(AckSignal::Nack)
    }

    fn settle(&mut self, signal: AckSignal) -> bool {
        match self.signal.take() {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    /// Attaches a fresh signal channel for delivery and returns the
    /// runner's waiting half.
    pub(crate) fn attach_signal(&mut self) -> AckWaiter {
        let (tx, rx) = oneshot::channel();
        self.signal = Some(tx);
        AckWaiter { rx }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("uuid", &self.uuid)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

// =============================================================================
// Runner-Side Waiter
// =============================================================================

/// The subscription runner's half of a message's signal channel.
#[derive(Debug)]
pub(crate) struct AckWaiter {
    rx: oneshot::Receiver<AckSignal>,
}

impl AckWaiter {
    /// Waits for the consumer's verdict. A message dropped without an
    /// explicit signal resolves to [`AckSignal::Nack`].
    pub(crate) async fn wait(self) -> AckSignal {
        self.rx.await.unwrap_or(AckSignal::Nack)
    }
}

// =============================================================================
// Tests
// =============================================================================
