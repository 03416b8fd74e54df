//! Remote collection layout and the queries built on it.
//!
//! Every component goes through these constructors so that, for example,
//! `MatchStore` and `MatchLifecycleManager` use the very same membership
//! predicate.

use serde_json::Value;

use crate::backend::{Cursor, Direction, FieldPath, OrderBy, Predicate, Query};
use crate::types::{MatchId, UserId};

pub const MATCHES: &str = "matches";
pub const MESSAGES: &str = "messages";
/// Uniqueness records keyed by [`crate::types::pair_key`]
pub const MATCH_PAIRS: &str = "match_pairs";
pub const USERS: &str = "users";

pub mod match_fields {
    pub const USER1_ID: &str = "user1Id";
    pub const USER2_ID: &str = "user2Id";
    pub const IS_ACTIVE: &str = "isActive";
    pub const CREATED_AT: &str = "createdAt";
    pub const LAST_MESSAGE: &str = "lastMessage";
    pub const LAST_MESSAGE_TIMESTAMP: &str = "lastMessageTimestamp";
    pub const LAST_MESSAGE_SENDER_ID: &str = "lastMessageSenderId";
    pub const UNREAD_COUNT: &str = "unreadCount";
    pub const UNMATCHED_BY: &str = "unmatchedBy";
    pub const UNMATCHED_AT: &str = "unmatchedAt";
}

pub mod message_fields {
    pub const MATCH_ID: &str = "matchId";
    pub const SENDER_ID: &str = "senderId";
    pub const RECEIVER_ID: &str = "receiverId";
    pub const TEXT: &str = "text";
    pub const TIMESTAMP: &str = "timestamp";
    pub const IS_READ: &str = "isRead";
}

pub mod pair_fields {
    pub const MATCH_ID: &str = "matchId";
    pub const CREATED_AT: &str = "createdAt";
}

pub mod user_fields {
    pub const DISPLAY_NAME: &str = "displayName";
    pub const MATCH_COUNT: &str = "matchCount";
}

/// `unreadCount.<userId>`
pub fn unread_path(user: &UserId) -> FieldPath {
    FieldPath::parse(match_fields::UNREAD_COUNT).child(user.as_str())
}

fn user_value(user: &UserId) -> Value {
    Value::from(user.as_str())
}

/// Active matches where `user` is either participant, as one disjunctive
/// predicate.
pub fn user_membership(user: &UserId) -> Predicate {
    Predicate::eq(match_fields::USER1_ID, user_value(user))
        .or(Predicate::eq(match_fields::USER2_ID, user_value(user)))
        .and_eq(match_fields::IS_ACTIVE, true)
}

/// The current user's match list, most recent activity first.
pub fn active_matches(user: &UserId, limit: Option<usize>) -> Query {
    let query = Query::collection(MATCHES)
        .filter(user_membership(user))
        .order_by(OrderBy::coalesce(
            &[match_fields::LAST_MESSAGE_TIMESTAMP, match_fields::CREATED_AT],
            Direction::Descending,
        ));
    match limit {
        Some(limit) => query.limit(limit),
        None => query,
    }
}

/// Active match between `a` and `b` in either orientation.
pub fn active_match_between(a: &UserId, b: &UserId) -> Query {
    let forward = Predicate::eq(match_fields::USER1_ID, user_value(a))
        .and_eq(match_fields::USER2_ID, user_value(b));
    let backward = Predicate::eq(match_fields::USER1_ID, user_value(b))
        .and_eq(match_fields::USER2_ID, user_value(a));
    Query::collection(MATCHES)
        .filter(forward.or(backward).and_eq(match_fields::IS_ACTIVE, true))
        .limit(1)
}

pub fn conversation(match_id: &MatchId) -> Predicate {
    Predicate::eq(message_fields::MATCH_ID, match_id.as_str())
}

/// Newest-first window over a conversation; callers reverse it.
pub fn recent_messages(match_id: &MatchId, limit: usize) -> Query {
    Query::collection(MESSAGES)
        .filter(conversation(match_id))
        .order_by(OrderBy::descending(message_fields::TIMESTAMP))
        .limit(limit)
}

/// The page of messages immediately older than `before`.
pub fn older_messages(match_id: &MatchId, before: Cursor, limit: usize) -> Query {
    recent_messages(match_id, limit).start_after(before)
}

/// Unread messages in one conversation addressed to `reader`.
pub fn unread_addressed_to(match_id: &MatchId, reader: &UserId) -> Predicate {
    conversation(match_id)
        .and_eq(message_fields::RECEIVER_ID, user_value(reader))
        .and_eq(message_fields::IS_READ, false)
}
