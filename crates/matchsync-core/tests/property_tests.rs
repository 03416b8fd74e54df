//! Property-based tests for conversation ordering and unread counters
//!
//! Uses proptest to check the buffer's ordering guarantees under arbitrary
//! arrival orders, and the unread invariant under arbitrary send/read mixes.

use std::collections::HashSet;
use std::sync::Arc;

use matchsync_core::offline_queue::OperationExecutor;
use matchsync_core::{
    schema, ConversationBuffer, LocalId, MatchId, MemoryBackend, Message, MessageId,
    OperationKind, PendingOperation, RemoteOperationExecutor, UserId,
};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Strategy Generators
// ============================================================================

/// Messages with few distinct timestamps (so ties are common) and unique
/// arrival sequences.
fn messages_strategy(max: usize) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(0..5i64, 1..max).prop_map(|timestamps| {
        timestamps
            .into_iter()
            .enumerate()
            .map(|(i, ts)| message(i as u64 + 1, ts))
            .collect()
    })
}

fn message(sequence: u64, timestamp: i64) -> Message {
    Message {
        id: MessageId::from(format!("msg-{}", sequence)),
        match_id: MatchId::from("m1"),
        sender_id: UserId::from("a"),
        receiver_id: UserId::from("b"),
        text: format!("text {}", sequence),
        timestamp,
        is_read: false,
        sequence,
    }
}

/// Operations a pair of users can perform on their match
#[derive(Debug, Clone)]
enum PairOp {
    Send { from_a: bool },
    Read { by_a: bool },
}

fn pair_ops_strategy(max_ops: usize) -> impl Strategy<Value = Vec<PairOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => any::<bool>().prop_map(|from_a| PairOp::Send { from_a }),
            1 => any::<bool>().prop_map(|by_a| PairOp::Read { by_a }),
        ],
        0..max_ops,
    )
}

fn order_keys(buffer: &ConversationBuffer) -> Vec<(i64, u64)> {
    buffer.iter().map(|e| e.message.order_key()).collect()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Whatever order messages arrive in, the buffer is sorted by
    /// (timestamp, arrival sequence) and holds each id once.
    #[test]
    fn buffer_is_sorted_for_any_arrival_order(
        messages in messages_strategy(40),
        seed in any::<u64>(),
    ) {
        let mut shuffled = messages.clone();
        // Deterministic shuffle from the seed
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            shuffled.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let mut buffer = ConversationBuffer::new();
        for msg in &shuffled {
            buffer.apply_remote(msg.clone());
        }
        // Redelivery never duplicates
        for msg in &shuffled {
            buffer.apply_remote(msg.clone());
        }

        let keys = order_keys(&buffer);
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(&keys, &sorted);
        prop_assert_eq!(buffer.len(), messages.len());
        let ids: HashSet<_> = buffer.iter().map(|e| e.id().clone()).collect();
        prop_assert_eq!(ids.len(), messages.len());
    }

    /// Merging an older page keeps everything already delivered in the same
    /// relative order and only adds at the head.
    #[test]
    fn merge_older_preserves_delivered_order(
        messages in messages_strategy(40),
        split in 0usize..40,
        overlap in 0usize..5,
    ) {
        let mut all = messages;
        all.sort_by_key(|m| m.order_key());
        let split = split.min(all.len());
        let (older, newer) = all.split_at(split);

        let mut buffer = ConversationBuffer::new();
        for msg in newer {
            buffer.apply_remote(msg.clone());
        }
        let delivered: Vec<MessageId> = buffer.iter().map(|e| e.id().clone()).collect();

        // Pages may overlap what is already delivered
        let mut page: Vec<Message> = older.to_vec();
        page.extend(newer.iter().take(overlap).cloned());
        page.reverse();
        buffer.merge_older(page);

        let ids: Vec<MessageId> = buffer.iter().map(|e| e.id().clone()).collect();
        prop_assert_eq!(ids.len(), all.len());
        prop_assert_eq!(&ids[older.len()..], &delivered[..]);
        let keys = order_keys(&buffer);
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(keys, sorted);
    }

    /// For each user, the counter equals the unread messages addressed to
    /// them, whatever mix of sends and reads came before.
    #[test]
    fn unread_counter_matches_unread_messages(ops in pair_ops_strategy(25)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let backend = MemoryBackend::new();
            backend.insert_raw(
                schema::MATCHES,
                "m1",
                json!({
                    "user1Id": "a", "user2Id": "b", "isActive": true, "createdAt": 1,
                    "unreadCount": {"a": 0, "b": 0}
                }),
            );
            let executor = RemoteOperationExecutor::new(Arc::new(backend.connect()));
            let (a, b) = (UserId::from("a"), UserId::from("b"));
            let match_id = MatchId::from("m1");

            for op in ops {
                let kind = match op {
                    PairOp::Send { from_a } => {
                        let (from, to) = if from_a { (&a, &b) } else { (&b, &a) };
                        OperationKind::SendMessage {
                            local_id: LocalId::new(),
                            match_id: match_id.clone(),
                            sender_id: from.clone(),
                            receiver_id: to.clone(),
                            text: "x".to_string(),
                        }
                    }
                    PairOp::Read { by_a } => OperationKind::MarkRead {
                        match_id: match_id.clone(),
                        reader_id: if by_a { a.clone() } else { b.clone() },
                    },
                };
                let pending = PendingOperation::new(kind.token(), kind);
                executor.execute(&pending).await.unwrap();
            }

            let record = backend.document(schema::MATCHES, "m1").unwrap().data;
            let messages = backend.documents(schema::MESSAGES);
            for user in ["a", "b"] {
                let unread = messages
                    .iter()
                    .filter(|m| m.data["receiverId"] == json!(user) && m.data["isRead"] == json!(false))
                    .count() as u64;
                assert_eq!(record["unreadCount"][user].as_u64(), Some(unread), "user {}", user);
            }
        });
    }
}
