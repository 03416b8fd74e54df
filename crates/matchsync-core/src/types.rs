//! Core types for the match sync layer

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod connection;
pub mod matches;
pub mod message;
pub mod operation;

pub use connection::{ConnectionQuality, ConnectionState, ConnectionType};
pub use matches::Match;
pub use message::{ChatEntry, DeliveryState, Message};
pub use operation::{OperationKind, PendingOperation};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of an account on the backend
    UserId
);

string_id!(
    /// Identifier of a match document
    MatchId
);

string_id!(
    /// Identifier of a message document
    MessageId
);

impl MatchId {
    /// Create a new time-ordered MatchId
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }
}

/// Names an optimistic local entry before the backend has confirmed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalId(pub Ulid);

impl LocalId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// The idempotency token of the send this entry represents.
    ///
    /// Deterministic, so every retry and replay of the same local entry
    /// targets the same remote write.
    pub fn send_token(&self) -> IdempotencyToken {
        IdempotencyToken(format!("send-{}", self.0))
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local_{}", self.0)
    }
}

/// Dedup token attached to every remote write batch.
///
/// The backend applies a batch at most once per token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(pub String);

impl IdempotencyToken {
    /// A fresh token for a one-off operation (mark read, reset).
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Remote document id of the message written under this token.
    pub fn message_id(&self) -> MessageId {
        MessageId(self.0.clone())
    }
}

impl std::fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical key of the unordered pair `{a, b}`.
///
/// Used as the document id of the uniqueness record that guards
/// "at most one active match per pair".
/// The lower id is length-prefixed, so ids containing `_` cannot collide.
pub fn pair_key(a: &UserId, b: &UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}_{}", low.as_str().len(), low, high)
}

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_order_independent() {
        let a = UserId::from("alice");
        let b = UserId::from("bob");
        assert_eq!(pair_key(&a, &b), pair_key(&b, &a));
        assert_eq!(pair_key(&a, &b), "5:alice_bob");
    }

    #[test]
    fn test_pair_key_separates_ids_containing_separator() {
        let left = pair_key(&UserId::from("a_b"), &UserId::from("c"));
        let right = pair_key(&UserId::from("a"), &UserId::from("b_c"));
        assert_ne!(left, right);
    }

    #[test]
    fn test_send_token_is_deterministic() {
        let local = LocalId::new();
        assert_eq!(local.send_token(), local.send_token());
        assert_eq!(local.send_token().message_id().as_str(), local.send_token().as_str());
        assert!(local.send_token().as_str().starts_with("send-"));
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let a = IdempotencyToken::generate("read");
        let b = IdempotencyToken::generate("read");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("read-"));
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = MatchId::from("m1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m1\"");
    }
}
