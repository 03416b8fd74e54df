//! Match records

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{MatchId, UserId};
use crate::backend::Document;
use crate::error::{SyncError, SyncResult};

/// Durable conversation/relationship record between two users.
///
/// Decoded from a `matches` document; field names on the wire are camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    #[serde(skip)]
    pub id: MatchId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub is_active: bool,
    /// Server time of creation (Unix millis)
    pub created_at: i64,
    pub last_message: Option<String>,
    pub last_message_timestamp: Option<i64>,
    pub last_message_sender_id: Option<UserId>,
    #[serde(default)]
    pub unread_count: HashMap<UserId, u32>,
    pub unmatched_by: Option<UserId>,
    pub unmatched_at: Option<i64>,
}

impl Match {
    pub fn from_document(doc: &Document) -> SyncResult<Self> {
        let mut record: Match = serde_json::from_value(doc.data.clone()).map_err(|e| {
            SyncError::Serialization(format!("match {}: {}", doc.id, e))
        })?;
        record.id = MatchId(doc.id.clone());
        Ok(record)
    }

    pub fn involves(&self, user: &UserId) -> bool {
        self.user1_id == *user || self.user2_id == *user
    }

    /// The other participant, if `user` is one of the two.
    pub fn partner_of(&self, user: &UserId) -> Option<&UserId> {
        if self.user1_id == *user {
            Some(&self.user2_id)
        } else if self.user2_id == *user {
            Some(&self.user1_id)
        } else {
            None
        }
    }

    /// Recency used to order the match list.
    pub fn activity_at(&self) -> i64 {
        self.last_message_timestamp.unwrap_or(self.created_at)
    }

    pub fn unread_for(&self, user: &UserId) -> u32 {
        self.unread_count.get(user).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(data: serde_json::Value) -> Document {
        Document {
            id: "m1".to_string(),
            data,
            sequence: 1,
            revision: 1,
        }
    }

    #[test]
    fn test_decode_minimal_match() {
        let m = Match::from_document(&doc(json!({
            "user1Id": "a",
            "user2Id": "b",
            "isActive": true,
            "createdAt": 100
        })))
        .unwrap();
        assert_eq!(m.id, MatchId::from("m1"));
        assert!(m.last_message.is_none());
        assert_eq!(m.activity_at(), 100);
        assert_eq!(m.unread_for(&UserId::from("a")), 0);
    }

    #[test]
    fn test_decode_full_match() {
        let m = Match::from_document(&doc(json!({
            "user1Id": "a",
            "user2Id": "b",
            "isActive": true,
            "createdAt": 100,
            "lastMessage": "hi",
            "lastMessageTimestamp": 250,
            "lastMessageSenderId": "a",
            "unreadCount": {"b": 2}
        })))
        .unwrap();
        assert_eq!(m.activity_at(), 250);
        assert_eq!(m.unread_for(&UserId::from("b")), 2);
        assert_eq!(m.partner_of(&UserId::from("b")), Some(&UserId::from("a")));
        assert_eq!(m.partner_of(&UserId::from("z")), None);
    }

    #[test]
    fn test_malformed_match_is_serialization_error() {
        let err = Match::from_document(&doc(json!({"user1Id": 42}))).unwrap_err();
        assert!(matches!(err, SyncError::Serialization(_)));
    }
}
