//! End-to-end sync scenarios
//!
//! Each test wires full `SyncClient`s for one or more simulated devices
//! against a shared `MemoryBackend`. Devices lose and regain the network
//! independently: the backend connection and the reachability provider are
//! toggled together, the way a real radio going down affects both.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use matchsync_core::offline_queue::OperationExecutor;
use matchsync_core::{
    schema, ConversationEvent, DeliveryState, LocalId, ManualReachability, MatchId, MemoryBackend,
    MemoryConnection, OperationKind, PendingOperation, Reachability, RemoteOperationExecutor,
    SyncClient, SyncConfig, UserId,
};
use serde_json::json;

// ============================================================================
// Test Utilities
// ============================================================================

struct Device {
    conn: MemoryConnection,
    reachability: Arc<ManualReachability>,
    client: SyncClient,
}

impl Device {
    fn new(backend: &MemoryBackend, user: &str) -> Self {
        Self::with_config(backend, user, SyncConfig::default())
    }

    fn with_config(backend: &MemoryBackend, user: &str, config: SyncConfig) -> Self {
        let conn = backend.connect();
        let reachability = Arc::new(ManualReachability::new(Reachability::wifi()));
        let client = SyncClient::builder(
            UserId::from(user),
            Arc::new(conn.clone()),
            reachability.clone(),
        )
        .config(config)
        .build()
        .expect("client builds");
        Self {
            conn,
            reachability,
            client,
        }
    }

    async fn go_offline(&self) {
        self.conn.set_online(false);
        self.reachability.set(Reachability::offline());
        wait_until("device offline", || !self.client.connectivity().is_connected()).await;
    }

    fn go_online(&self) {
        self.conn.set_online(true);
        self.reachability.set(Reachability::wifi());
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn active_matches(backend: &MemoryBackend) -> Vec<serde_json::Value> {
    backend
        .documents(schema::MATCHES)
        .into_iter()
        .filter(|doc| doc.data["isActive"] == json!(true))
        .map(|doc| doc.data)
        .collect()
}

fn user(id: &str) -> UserId {
    UserId::from(id)
}

// ============================================================================
// Scenarios
// ============================================================================

/// Mutual like fires `create_match` twice in quick succession, from both
/// sides: exactly one active match exists afterwards.
#[tokio::test]
async fn test_double_create_yields_one_match() {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice");
    let bob = Device::new(&backend, "bob");

    let (bob_id, alice_id) = (user("bob"), user("alice"));
    let (first, second, third) = tokio::join!(
        alice.client.create_match(&bob_id),
        alice.client.create_match(&bob_id),
        bob.client.create_match(&alice_id),
    );
    let results = [first.unwrap(), second.unwrap(), third.unwrap()];

    assert_eq!(active_matches(&backend).len(), 1);
    assert_eq!(backend.documents(schema::MATCH_PAIRS).len(), 1);
    assert_eq!(results.iter().filter(|r| r.created).count(), 1);
    let ids: HashSet<_> = results.iter().map(|r| r.record.id.clone()).collect();
    assert_eq!(ids.len(), 1);
}

/// A message sent while the receiver is offline shows up in the receiver's
/// match list once they reconnect; reading resets the counter.
#[tokio::test]
async fn test_offline_receiver_catches_up() {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice");
    let bob = Device::new(&backend, "bob");

    let match_id = alice.client.create_match(&user("bob")).await.unwrap().record.id;
    let bob_matches = bob.client.start().await.unwrap();
    wait_until("bob sees the match", || bob_matches.borrow().get(&match_id).is_some()).await;

    bob.go_offline().await;
    wait_until("bob's list goes stale", || !bob.client.matches().is_live()).await;

    alice.client.send(&match_id, "hi").await.unwrap();
    // Last-known-good data stays visible while offline
    assert!(bob.client.matches().current().get(&match_id).is_some());

    bob.go_online();
    wait_until("bob's list catches up", || {
        bob_matches
            .borrow()
            .get(&match_id)
            .map_or(false, |m| m.last_message.as_deref() == Some("hi"))
    })
    .await;
    let record = bob.client.matches().current().get(&match_id).cloned().unwrap();
    assert_eq!(record.unread_for(&user("bob")), 1);
    assert_eq!(record.last_message_sender_id, Some(user("alice")));
    assert!(bob.client.matches().is_live());

    let stream = bob.client.open(&match_id).await.unwrap();
    assert_eq!(stream.initial.len(), 1);
    bob.client.mark_read(&match_id).await.unwrap();

    wait_until("counter reset reaches the list", || {
        bob_matches
            .borrow()
            .get(&match_id)
            .map_or(false, |m| m.unread_for(&user("bob")) == 0)
    })
    .await;
    assert_eq!(bob.client.total_unread().await.unwrap(), 0);
}

/// Three messages sent offline land remotely once each, in send order.
#[tokio::test]
async fn test_offline_sends_replay_in_order() {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice");
    let bob = Device::new(&backend, "bob");

    let match_id = alice.client.create_match(&user("bob")).await.unwrap().record.id;
    alice.client.start().await.unwrap();
    let mut chat = alice.client.open(&match_id).await.unwrap();

    alice.go_offline().await;
    let mut local_ids = Vec::new();
    for text in ["one", "two", "three"] {
        let entry = alice.client.send(&match_id, text).await.unwrap();
        assert!(matches!(entry.state, DeliveryState::Pending { .. }));
        local_ids.push(entry.local_id().unwrap());
    }
    assert_eq!(alice.client.queue().len().unwrap(), 3);
    assert!(backend.documents(schema::MESSAGES).is_empty());

    alice.go_online();
    wait_until("queue drains", || alice.client.queue().is_empty().unwrap_or(false)).await;

    assert_eq!(backend.documents(schema::MESSAGES).len(), 3);
    let stream = bob.client.open(&match_id).await.unwrap();
    let texts: Vec<_> = stream.initial.iter().map(|e| e.message.text.clone()).collect();
    assert_eq!(texts, ["one", "two", "three"]);
    for (entry, local_id) in stream.initial.iter().zip(&local_ids) {
        assert_eq!(entry.id(), &local_id.send_token().message_id());
    }

    // The sender's own echoes were upgraded, not duplicated
    wait_until("echoes confirmed", || {
        alice
            .client
            .conversations()
            .entries(&match_id)
            .map_or(false, |e| e.len() == 3 && e.iter().all(|m| m.is_confirmed()))
    })
    .await;
    while let Some(event) = chat.try_next() {
        assert!(!matches!(event, ConversationEvent::Prepended(_)));
    }
}

/// Two overlapping `subscribe` calls leave exactly one live listener and no
/// duplicate rows.
#[tokio::test]
async fn test_overlapping_subscribe_keeps_one_listener() {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice");
    alice.client.create_match(&user("bob")).await.unwrap();
    alice.client.create_match(&user("carol")).await.unwrap();

    let alice_id = user("alice");
    let (first, second) = tokio::join!(
        alice.client.matches().subscribe(&alice_id),
        alice.client.matches().subscribe(&alice_id),
    );
    first.unwrap();
    second.unwrap();

    wait_until("one listener left", || backend.listener_count() == 1).await;
    let list = alice.client.matches().current();
    assert_eq!(list.matches.len(), 2);
    let ids: HashSet<_> = list.matches.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids.len(), 2);
    assert!(alice.client.matches().is_live());
}

/// Two rapid `load_older` calls with the same cursor never duplicate ids.
#[tokio::test]
async fn test_concurrent_load_older_has_no_duplicates() {
    let backend = MemoryBackend::new();
    let config = SyncConfig {
        message_page_size: 3,
        ..SyncConfig::default()
    };
    let alice = Device::with_config(&backend, "alice", config);
    let match_id = alice.client.create_match(&user("bob")).await.unwrap().record.id;
    for i in 0..8 {
        alice.client.send(&match_id, format!("m{}", i)).await.unwrap();
    }

    let chat = alice.client.open(&match_id).await.unwrap();
    assert_eq!(chat.initial.len(), 3);
    let cursor = chat.initial[0].message.cursor();

    let conversations = alice.client.conversations();
    let (a, b) = tokio::join!(
        conversations.load_older(&match_id, Some(cursor.clone())),
        conversations.load_older(&match_id, Some(cursor)),
    );
    assert_eq!(a.unwrap() + b.unwrap(), 3);

    let entries = conversations.entries(&match_id).unwrap();
    let ids: HashSet<_> = entries.iter().map(|e| e.id().clone()).collect();
    assert_eq!(ids.len(), entries.len());
    let texts: Vec<_> = entries.iter().map(|e| e.message.text.as_str()).collect();
    assert_eq!(texts, ["m2", "m3", "m4", "m5", "m6", "m7"]);

    conversations.load_older(&match_id, None).await.unwrap();
    conversations.load_older(&match_id, None).await.unwrap();
    let texts: Vec<_> = conversations
        .entries(&match_id)
        .unwrap()
        .iter()
        .map(|e| e.message.text.clone())
        .collect();
    assert_eq!(texts.len(), 8);
    assert_eq!(texts[0], "m0");
}

// ============================================================================
// Properties
// ============================================================================

/// Closing X then opening Y never delivers X's messages on Y's stream.
#[tokio::test]
async fn test_switching_conversations_is_isolated() {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice");
    let bob = Device::new(&backend, "bob");
    let carol = Device::new(&backend, "carol");
    let x = alice.client.create_match(&user("bob")).await.unwrap().record.id;
    let y = alice.client.create_match(&user("carol")).await.unwrap().record.id;

    let mut x_stream = alice.client.open(&x).await.unwrap();
    assert!(alice.client.close(&x));
    let mut y_stream = alice.client.open(&y).await.unwrap();

    bob.client.send(&x, "for x").await.unwrap();
    carol.client.send(&y, "for y").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), y_stream.next())
        .await
        .unwrap()
        .unwrap();
    match event {
        ConversationEvent::Appended(entry) => assert_eq!(entry.message.match_id, y),
        other => panic!("unexpected event {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(event) = y_stream.try_next() {
        if let ConversationEvent::Appended(entry) = event {
            assert_eq!(entry.message.match_id, y);
        }
    }
    assert!(x_stream.next().await.is_none());
}

/// Committing the same pending operation twice leaves the remote state as
/// a single commit would.
#[tokio::test]
async fn test_replay_is_idempotent() {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice");
    let match_id = alice.client.create_match(&user("bob")).await.unwrap().record.id;

    let executor = RemoteOperationExecutor::new(Arc::new(backend.connect()));
    let kind = OperationKind::SendMessage {
        local_id: LocalId::new(),
        match_id: match_id.clone(),
        sender_id: user("alice"),
        receiver_id: user("bob"),
        text: "once".to_string(),
    };
    let op = PendingOperation::new(kind.token(), kind);
    executor.execute(&op).await.unwrap();
    let after_one = backend.document(schema::MATCHES, match_id.as_str()).unwrap().data;
    executor.execute(&op).await.unwrap();
    let after_two = backend.document(schema::MATCHES, match_id.as_str()).unwrap().data;

    assert_eq!(after_one, after_two);
    assert_eq!(backend.documents(schema::MESSAGES).len(), 1);
    assert_eq!(after_two["unreadCount"]["bob"], json!(1));
}

/// Many operations queued offline are applied exactly once, sends and reads
/// interleaved in their original order.
#[tokio::test]
async fn test_mixed_queue_replays_completely() {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice");
    let bob = Device::new(&backend, "bob");
    let match_id = alice.client.create_match(&user("bob")).await.unwrap().record.id;
    for i in 0..3 {
        bob.client.send(&match_id, format!("from bob {}", i)).await.unwrap();
    }
    alice.client.start().await.unwrap();

    alice.go_offline().await;
    for i in 0..10 {
        alice.client.send(&match_id, format!("from alice {}", i)).await.unwrap();
    }
    alice.client.mark_read(&match_id).await.unwrap();
    assert_eq!(alice.client.queue().len().unwrap(), 11);

    alice.go_online();
    wait_until("queue drains", || alice.client.queue().is_empty().unwrap_or(false)).await;

    let messages = backend.documents(schema::MESSAGES);
    assert_eq!(messages.len(), 13);
    let record = backend.document(schema::MATCHES, match_id.as_str()).unwrap().data;
    assert_eq!(record["unreadCount"]["alice"], json!(0));
    assert_eq!(record["unreadCount"]["bob"], json!(10));
    assert_eq!(record["lastMessage"], json!("from alice 9"));
    assert_eq!(bob.client.total_unread().await.unwrap(), 10);
}

/// Malformed match records are skipped; the subscription keeps going.
#[tokio::test]
async fn test_malformed_record_does_not_break_list() {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice");
    alice.client.create_match(&user("bob")).await.unwrap();
    backend.insert_raw(
        schema::MATCHES,
        "broken",
        json!({"user1Id": "alice", "user2Id": 42, "isActive": true}),
    );

    let list = alice.client.start().await.unwrap();
    assert_eq!(list.borrow().matches.len(), 1);

    alice.client.create_match(&user("carol")).await.unwrap();
    wait_until("new match arrives", || list.borrow().matches.len() == 2).await;
}

/// Unmatching removes the match from both lists but keeps its messages.
#[tokio::test]
async fn test_unmatch_leaves_lists_and_keeps_messages() {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice");
    let bob = Device::new(&backend, "bob");
    let match_id: MatchId = alice.client.create_match(&user("bob")).await.unwrap().record.id;
    alice.client.send(&match_id, "bye?").await.unwrap();

    let alice_list = alice.client.start().await.unwrap();
    let bob_list = bob.client.start().await.unwrap();
    bob.client.unmatch(&match_id).await.unwrap();

    wait_until("alice list empties", || alice_list.borrow().matches.is_empty()).await;
    wait_until("bob list empties", || bob_list.borrow().matches.is_empty()).await;
    assert_eq!(backend.documents(schema::MESSAGES).len(), 1);

    // The pair may match again later
    let again = alice.client.create_match(&user("bob")).await.unwrap();
    assert!(again.created);
    assert_ne!(again.record.id, match_id);
}
