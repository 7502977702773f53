//! # Topic Names and Table-Name Generation
//!
//! Topics and consumer groups become SQLite table names and are spliced
//! into statements as identifiers, which cannot be bound as parameters.
//! [`validate_topic_name`] is therefore the injection barrier: every
//! externally supplied name passes through it before any interpolation.
//!
//! Table names are produced by a pluggable [`TableNameGenerators`] pair.
//! A publisher and a subscriber must be configured with identical
//! generators; otherwise they operate on disjoint tables and never see
//! each other's messages.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Generates a table name for a topic.
pub type TableNameGenerator = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Checks that a topic, consumer-group or table name is safe to splice
/// into a SQL statement.
///
/// Valid names are non-empty and contain only characters from
/// `[A-Za-z0-9\-$:._]`.
///
/// # Errors
///
/// Returns [`Error::InvalidTopicName`] for the empty string or any name
/// containing a character outside the class.
pub fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(is_allowed_character) {
        return Err(Error::InvalidTopicName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn is_allowed_character(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '$' | ':' | '.' | '_')
}

// =============================================================================
// Table-Name Generators
// =============================================================================

/// The pair of functions mapping a topic to its messages table and its
/// offsets table.
///
/// The defaults produce `watermill_<topic>` and
/// `watermill_offsets_<topic>`.
#[derive(Clone)]
pub struct TableNameGenerators {
    /// Maps a topic to its messages table name.
    pub messages: TableNameGenerator,
    /// Maps a topic to its offsets table name.
    pub offsets: TableNameGenerator,
}

impl TableNameGenerators {
    /// Returns the messages table name for a topic.
    pub fn messages_table(&self, topic: &str) -> String {
        (self.messages)(topic)
    }

    /// Returns the offsets table name for a topic.
    pub fn offsets_table(&self, topic: &str) -> String {
        (self.offsets)(topic)
    }
}

impl Default for TableNameGenerators {
    fn default() -> Self {
        Self {
            messages: Arc::new(|topic| format!("watermill_{topic}")),
            offsets: Arc::new(|topic| format!("watermill_offsets_{topic}")),
        }
    }
}

impl fmt::Debug for TableNameGenerators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableNameGenerators").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_names_within_character_class() {
        for name in ["orders", "orders-v2", "a$b:c.d_e", "0", "A-Za-z0-9"] {
            assert!(validate_topic_name(name).is_ok(), "rejected {name:?}");
        }
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(
            validate_topic_name(""),
            Err(Error::InvalidTopicName { .. })
        ));
    }

    #[test]
    fn rejects_names_outside_character_class() {
        for name in ["bad topic", "semi;colon", "quote'", "star*", "slash/", "taco🌮"] {
            assert!(
                matches!(
                    validate_topic_name(name),
                    Err(Error::InvalidTopicName { .. })
                ),
                "accepted {name:?}"
            );
        }
    }

    #[test]
    fn sql_injection_attempts_are_rejected() {
        assert!(validate_topic_name("x'; DROP TABLE watermill_x; --").is_err());
        assert!(validate_topic_name("x\" OR 1=1").is_err());
    }

    #[test]
    fn default_generators_use_watermill_prefix() {
        let generators = TableNameGenerators::default();
        assert_eq!(generators.messages_table("orders"), "watermill_orders");
        assert_eq!(
            generators.offsets_table("orders"),
            "watermill_offsets_orders"
        );
    }

    #[test]
    fn custom_generators_are_applied() {
        let generators = TableNameGenerators {
            messages: Arc::new(|topic| format!("msg_{topic}")),
            offsets: Arc::new(|topic| format!("cur_{topic}")),
        };
        assert_eq!(generators.messages_table("t"), "msg_t");
        assert_eq!(generators.offsets_table("t"), "cur_t");
    }
}
