#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier_domain::{Attachment, ChatMessage, ConversationKey, RoomId, UserId};
use parking_lot::Mutex;
use tokio::time::timeout;

use crate::server::blob::{BlobStore, InMemoryBlobStore};
use crate::server::conversation::{ConversationResolver, ConversationStore, RoomSummary};
use crate::server::db::Database;
use crate::server::error::{RouteError, StoreError};
use crate::server::history::MessageHistory;
use crate::server::hub::{ConnectionHandle, ConnectionHub, Mailbox, connection_channel};
use crate::server::offline::{InMemoryOfflineStore, OfflineStore};
use crate::server::router::MessageRouter;
use crate::server::supervisor::{SideEffectConfig, SideEffectSupervisor};

/// Wraps the in-memory backlog and counts enqueues.
#[derive(Default)]
struct CountingStore {
	inner: InMemoryOfflineStore,
	enqueues: AtomicUsize,
	/// Registered into the hub right before an enqueue completes.
	register_on_enqueue: Mutex<Option<(ConnectionHub, ConnectionHandle)>>,
}

#[async_trait::async_trait]
impl OfflineStore for CountingStore {
	fn backend_name(&self) -> &'static str {
		"counting"
	}

	async fn enqueue(&self, room_id: RoomId, recipient_id: UserId, msg: &ChatMessage) -> Result<(), StoreError> {
		self.enqueues.fetch_add(1, Ordering::SeqCst);
		self.inner.enqueue(room_id, recipient_id, msg).await?;
		if let Some((hub, handle)) = self.register_on_enqueue.lock().take() {
			hub.register(handle);
		}
		Ok(())
	}

	async fn drain(&self, room_id: RoomId, recipient_id: UserId) -> Result<Vec<ChatMessage>, StoreError> {
		self.inner.drain(room_id, recipient_id).await
	}

	async fn restore(&self, room_id: RoomId, recipient_id: UserId, msgs: &[ChatMessage]) -> Result<(), StoreError> {
		self.inner.restore(room_id, recipient_id, msgs).await
	}

	async fn pending(&self, room_id: RoomId, recipient_id: UserId) -> Result<usize, StoreError> {
		self.inner.pending(room_id, recipient_id).await
	}
}

struct DownStore;

#[async_trait::async_trait]
impl OfflineStore for DownStore {
	fn backend_name(&self) -> &'static str {
		"down"
	}

	async fn enqueue(&self, _room_id: RoomId, _recipient_id: UserId, _msg: &ChatMessage) -> Result<(), StoreError> {
		Err(StoreError::unavailable("down", "connection refused"))
	}

	async fn drain(&self, _room_id: RoomId, _recipient_id: UserId) -> Result<Vec<ChatMessage>, StoreError> {
		Err(StoreError::unavailable("down", "connection refused"))
	}

	async fn restore(&self, _room_id: RoomId, _recipient_id: UserId, _msgs: &[ChatMessage]) -> Result<(), StoreError> {
		Err(StoreError::unavailable("down", "connection refused"))
	}

	async fn pending(&self, _room_id: RoomId, _recipient_id: UserId) -> Result<usize, StoreError> {
		Err(StoreError::unavailable("down", "connection refused"))
	}
}

struct DownDirectory;

#[async_trait::async_trait]
impl ConversationStore for DownDirectory {
	fn backend_name(&self) -> &'static str {
		"down"
	}

	async fn find(&self, _key: &ConversationKey) -> Result<Option<RoomId>, StoreError> {
		Err(StoreError::unavailable("down", "timeout"))
	}

	async fn find_or_create(&self, _key: &ConversationKey) -> Result<RoomId, StoreError> {
		Err(StoreError::unavailable("down", "timeout"))
	}

	async fn join(&self, _room_id: RoomId, _user_id: UserId) -> Result<(), StoreError> {
		Err(StoreError::unavailable("down", "timeout"))
	}

	async fn participants(&self, _room_id: RoomId) -> Result<BTreeSet<UserId>, StoreError> {
		Err(StoreError::unavailable("down", "timeout"))
	}

	async fn rooms_for_user(&self, _user_id: UserId) -> Result<Vec<RoomSummary>, StoreError> {
		Err(StoreError::unavailable("down", "timeout"))
	}
}

struct Fixture {
	hub: ConnectionHub,
	store: Arc<CountingStore>,
	blobs: Arc<InMemoryBlobStore>,
	conversations: ConversationResolver,
	router: MessageRouter,
}

fn fixture() -> Fixture {
	fixture_with(Arc::new(InMemoryBlobStore::default()))
}

fn fixture_with(blobs: Arc<InMemoryBlobStore>) -> Fixture {
	let hub = ConnectionHub::default();
	let store = Arc::new(CountingStore::default());
	let conversations = ConversationResolver::in_memory();
	let router = MessageRouter::new(
		hub.clone(),
		store.clone(),
		blobs.clone() as Arc<dyn BlobStore>,
		conversations.clone(),
	);
	Fixture {
		hub,
		store,
		blobs,
		conversations,
		router,
	}
}

fn connect(hub: &ConnectionHub, conn_id: u64, user: UserId, room: RoomId, cap: usize) -> Mailbox {
	let (handle, mailbox) = connection_channel(conn_id, user, room, cap);
	hub.register(handle);
	mailbox
}

async fn next_delivery(rx: &mut Mailbox) -> ChatMessage {
	*timeout(Duration::from_millis(250), rx.deliveries.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open")
}

#[tokio::test]
async fn online_recipient_gets_direct_delivery_without_touching_the_store() {
	let f = fixture();
	let room = RoomId::new_v4();
	let (alice, bob) = (UserId::new_v4(), UserId::new_v4());
	let mut bob_rx = connect(&f.hub, 1, bob, room, 8);

	let msg = ChatMessage::new(room, alice, Some(bob), "hi", 1);
	let outcome = f.router.route(msg.clone()).await.expect("route");

	assert_eq!(outcome.message_id, msg.message_id);
	assert_eq!(outcome.delivered, vec![bob]);
	assert!(outcome.queued.is_empty());
	assert_eq!(next_delivery(&mut bob_rx).await, msg);
	assert_eq!(f.store.enqueues.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn offline_recipient_is_queued() {
	let f = fixture();
	let room = RoomId::new_v4();
	let (alice, bob) = (UserId::new_v4(), UserId::new_v4());

	let msg = ChatMessage::new(room, alice, Some(bob), "hi", 1);
	let outcome = f.router.route(msg.clone()).await.expect("route");

	assert!(outcome.delivered.is_empty());
	assert_eq!(outcome.queued, vec![bob]);
	assert_eq!(f.store.drain(room, bob).await.expect("drain"), vec![msg]);
}

#[tokio::test]
async fn recipient_in_another_room_is_treated_as_offline() {
	let f = fixture();
	let (room, elsewhere) = (RoomId::new_v4(), RoomId::new_v4());
	let (alice, bob) = (UserId::new_v4(), UserId::new_v4());
	let mut bob_rx = connect(&f.hub, 1, bob, elsewhere, 8);

	let outcome = f
		.router
		.route(ChatMessage::new(room, alice, Some(bob), "hi", 1))
		.await
		.expect("route");

	assert_eq!(outcome.queued, vec![bob]);
	assert!(timeout(Duration::from_millis(50), bob_rx.deliveries.recv()).await.is_err());
}

#[tokio::test]
async fn full_outbound_queue_falls_back_to_store() {
	let f = fixture();
	let room = RoomId::new_v4();
	let (alice, bob) = (UserId::new_v4(), UserId::new_v4());
	let bob_rx = connect(&f.hub, 1, bob, room, 1);

	let first = f
		.router
		.route(ChatMessage::new(room, alice, Some(bob), "one", 1))
		.await
		.expect("route");
	let second = f
		.router
		.route(ChatMessage::new(room, alice, Some(bob), "two", 2))
		.await
		.expect("route");

	assert_eq!(first.delivered, vec![bob]);
	assert_eq!(second.queued, vec![bob]);
	assert!(bob_rx.signals.take_backlog_request(), "online recipient must be told to drain");
	let stored = f.store.drain(room, bob).await.expect("drain");
	assert_eq!(stored.len(), 1);
	assert_eq!(stored[0].body, "two");
}

#[tokio::test]
async fn broadcast_reaches_online_members_and_queues_for_offline_participants() {
	let f = fixture();
	let room = RoomId::new_v4();
	let (sender, online_a, online_b, offline) =
		(UserId::new_v4(), UserId::new_v4(), UserId::new_v4(), UserId::new_v4());

	f.conversations
		.register_room(room, &[sender, online_a, online_b, offline])
		.await
		.expect("register room");
	let mut sender_rx = connect(&f.hub, 1, sender, room, 8);
	let mut a_rx = connect(&f.hub, 2, online_a, room, 8);
	let mut b_rx = connect(&f.hub, 3, online_b, room, 8);

	let msg = ChatMessage::new(room, sender, None, "hello room", 1);
	let outcome = f.router.route(msg.clone()).await.expect("route");

	let mut delivered = outcome.delivered.clone();
	delivered.sort();
	let mut expected = vec![online_a, online_b];
	expected.sort();
	assert_eq!(delivered, expected);
	assert_eq!(outcome.queued, vec![offline]);
	assert_eq!(f.store.enqueues.load(Ordering::SeqCst), 1);

	assert_eq!(next_delivery(&mut a_rx).await, msg);
	assert_eq!(next_delivery(&mut b_rx).await, msg);
	assert!(
		timeout(Duration::from_millis(50), sender_rx.deliveries.recv()).await.is_err(),
		"sender must not receive its own broadcast"
	);
	assert_eq!(f.store.pending(room, offline).await.expect("pending"), 1);
}

#[tokio::test]
async fn broadcast_degrades_to_online_members_when_directory_is_down() {
	let hub = ConnectionHub::default();
	let store = Arc::new(CountingStore::default());
	let router = MessageRouter::new(
		hub.clone(),
		store.clone(),
		Arc::new(InMemoryBlobStore::default()),
		ConversationResolver::new(Arc::new(DownDirectory)),
	);
	let room = RoomId::new_v4();
	let (sender, member) = (UserId::new_v4(), UserId::new_v4());
	let _sender_rx = connect(&hub, 1, sender, room, 8);
	let mut member_rx = connect(&hub, 2, member, room, 8);

	let outcome = router
		.route(ChatMessage::new(room, sender, None, "hey", 1))
		.await
		.expect("route");
	assert_eq!(outcome.delivered, vec![member]);
	assert!(outcome.queued.is_empty());
	next_delivery(&mut member_rx).await;
}

#[tokio::test]
async fn inline_attachment_is_uploaded_before_delivery() {
	let f = fixture();
	let room = RoomId::new_v4();
	let (alice, bob, carol) = (UserId::new_v4(), UserId::new_v4(), UserId::new_v4());
	let mut bob_rx = connect(&f.hub, 1, bob, room, 8);

	let inline = Attachment::Inline {
		content_type: "image/png".to_string(),
		data: vec![0x89, b'P', b'N', b'G'],
	};
	f.router
		.route(ChatMessage::new(room, alice, Some(bob), "pic", 1).with_attachment(inline.clone()))
		.await
		.expect("route");
	f.router
		.route(ChatMessage::new(room, alice, Some(carol), "pic", 2).with_attachment(inline))
		.await
		.expect("route");

	let delivered = next_delivery(&mut bob_rx).await;
	let url = delivered.attachment_url().expect("stored url").to_string();
	assert!(url.starts_with("memory://"), "got: {url}");
	let (content_type, bytes) = f.blobs.get(&url).expect("uploaded");
	assert_eq!(content_type, "image/png");
	assert_eq!(bytes, vec![0x89, b'P', b'N', b'G']);

	let stored = f.store.drain(room, carol).await.expect("drain");
	assert!(!stored[0].has_inline_attachment());
	assert!(stored[0].attachment_url().is_some());
}

#[tokio::test]
async fn failed_upload_drops_the_message() {
	let f = fixture_with(Arc::new(InMemoryBlobStore::failing()));
	let room = RoomId::new_v4();
	let (alice, bob) = (UserId::new_v4(), UserId::new_v4());
	let mut bob_rx = connect(&f.hub, 1, bob, room, 8);

	let msg = ChatMessage::new(room, alice, Some(bob), "pic", 1).with_attachment(Attachment::Inline {
		content_type: "image/png".to_string(),
		data: vec![1],
	});
	let err = f.router.route(msg).await.unwrap_err();
	assert!(matches!(err, RouteError::Attachment(_)), "got: {err:?}");

	assert!(timeout(Duration::from_millis(50), bob_rx.deliveries.recv()).await.is_err());
	assert_eq!(f.store.enqueues.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn store_outage_is_reported_as_lost() {
	let router = MessageRouter::new(
		ConnectionHub::default(),
		Arc::new(DownStore),
		Arc::new(InMemoryBlobStore::default()),
		ConversationResolver::in_memory(),
	);
	let bob = UserId::new_v4();
	let outcome = router
		.route(ChatMessage::new(RoomId::new_v4(), UserId::new_v4(), Some(bob), "hi", 1))
		.await
		.expect("route never fails on store errors");
	assert_eq!(outcome.lost, vec![bob]);
	assert!(outcome.queued.is_empty());
}

#[tokio::test]
async fn recipient_registering_during_enqueue_is_nudged() {
	let f = fixture();
	let room = RoomId::new_v4();
	let (alice, bob) = (UserId::new_v4(), UserId::new_v4());

	let (handle, bob_rx) = connection_channel(9, bob, room, 8);
	*f.store.register_on_enqueue.lock() = Some((f.hub.clone(), handle));

	let outcome = f
		.router
		.route(ChatMessage::new(room, alice, Some(bob), "racy", 1))
		.await
		.expect("route");
	assert_eq!(outcome.queued, vec![bob]);

	timeout(Duration::from_millis(250), bob_rx.signals.backlog_requested())
		.await
		.expect("expected a nudge within timeout");
	assert_eq!(f.store.pending(room, bob).await.expect("pending"), 1);
}

#[tokio::test]
async fn overflow_while_online_is_picked_up_without_reconnecting() {
	let f = fixture();
	let room = RoomId::new_v4();
	let (alice, bob) = (UserId::new_v4(), UserId::new_v4());
	let mut bob_rx = connect(&f.hub, 1, bob, room, 1);

	for (i, body) in ["first", "second", "third"].into_iter().enumerate() {
		f.router
			.route(ChatMessage::new(room, alice, Some(bob), body, i as i64))
			.await
			.expect("route");
	}

	// What a connection task does: write the queued delivery, then answer the nudge.
	assert_eq!(next_delivery(&mut bob_rx).await.body, "first");
	assert!(bob_rx.deliveries.try_recv().is_err());
	timeout(Duration::from_millis(250), bob_rx.signals.backlog_requested())
		.await
		.expect("overflow must leave a drain request");
	let bodies: Vec<String> = f
		.store
		.drain(room, bob)
		.await
		.expect("drain")
		.into_iter()
		.map(|m| m.body)
		.collect();
	assert_eq!(bodies, vec!["second", "third"]);
}

#[tokio::test]
async fn routed_messages_are_recorded_in_history() {
	let dir = tempfile::tempdir().expect("tempdir");
	let url = format!("sqlite://{}?mode=rwc", dir.path().join("history.db").display());
	let db = Database::connect(&url).await.expect("connect sqlite");
	let history = MessageHistory::new(db);

	let (supervisor, _failures) = SideEffectSupervisor::new(SideEffectConfig::default());
	let router = fixture().router.with_history(supervisor, history.clone());

	let room = RoomId::new_v4();
	let msg = ChatMessage::new(room, UserId::new_v4(), Some(UserId::new_v4()), "remember me", 1);
	router.route(msg.clone()).await.expect("route");

	let recorded = timeout(Duration::from_secs(2), async {
		loop {
			let rows = history.recent(room, 10).await.expect("recent");
			if !rows.is_empty() {
				return rows;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("history written");
	assert_eq!(recorded, vec![msg]);
}
