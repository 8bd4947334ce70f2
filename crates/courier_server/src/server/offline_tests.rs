#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_domain::{ChatMessage, RoomId, UserId};

use crate::config::{OfflineBackendKind, OfflineSettings};
use crate::server::db::Database;
use crate::server::offline::{InMemoryOfflineStore, OfflineStore, OfflineStoreConfig, SqlOfflineStore, open_offline_store};

fn capped(max_per_recipient: usize) -> OfflineStoreConfig {
	OfflineStoreConfig {
		max_per_recipient: Some(max_per_recipient),
		ttl: None,
	}
}

async fn sqlite_db() -> (tempfile::TempDir, Database) {
	let dir = tempfile::tempdir().expect("tempdir");
	let url = format!("sqlite://{}?mode=rwc", dir.path().join("offline.db").display());
	let db = Database::connect(&url).await.expect("connect sqlite");
	(dir, db)
}

fn msg(room: RoomId, to: UserId, body: &str, at: i64) -> ChatMessage {
	ChatMessage::new(room, UserId::new_v4(), Some(to), body, at)
}

async fn drain_is_ordered_and_exactly_once(store: &dyn OfflineStore) {
	let room = RoomId::new_v4();
	let user = UserId::new_v4();
	let sent: Vec<ChatMessage> = (0..5).map(|i| msg(room, user, &format!("m{i}"), i)).collect();

	for m in &sent {
		store.enqueue(room, user, m).await.expect("enqueue");
	}
	assert_eq!(store.pending(room, user).await.expect("pending"), 5);

	let first = store.drain(room, user).await.expect("drain");
	assert_eq!(first, sent, "{} must preserve enqueue order", store.backend_name());

	let second = store.drain(room, user).await.expect("second drain");
	assert!(second.is_empty(), "{} second drain must be empty", store.backend_name());
	assert_eq!(store.pending(room, user).await.expect("pending"), 0);
}

async fn backlogs_are_keyed_by_room_and_recipient(store: &dyn OfflineStore) {
	let room_a = RoomId::new_v4();
	let room_b = RoomId::new_v4();
	let alice = UserId::new_v4();
	let bob = UserId::new_v4();

	store.enqueue(room_a, alice, &msg(room_a, alice, "a-alice", 1)).await.expect("enqueue");
	store.enqueue(room_b, alice, &msg(room_b, alice, "b-alice", 2)).await.expect("enqueue");
	store.enqueue(room_a, bob, &msg(room_a, bob, "a-bob", 3)).await.expect("enqueue");

	let drained = store.drain(room_a, alice).await.expect("drain");
	assert_eq!(drained.len(), 1);
	assert_eq!(drained[0].body, "a-alice");

	assert_eq!(store.pending(room_b, alice).await.expect("pending"), 1);
	assert_eq!(store.pending(room_a, bob).await.expect("pending"), 1);
}

async fn cap_drops_oldest(store: &dyn OfflineStore) {
	let room = RoomId::new_v4();
	let user = UserId::new_v4();
	for i in 0..5 {
		store
			.enqueue(room, user, &msg(room, user, &format!("m{i}"), i))
			.await
			.expect("enqueue");
	}

	let bodies: Vec<String> = store
		.drain(room, user)
		.await
		.expect("drain")
		.into_iter()
		.map(|m| m.body)
		.collect();
	assert_eq!(bodies, vec!["m2", "m3", "m4"], "{} keeps the newest entries", store.backend_name());
}

async fn unbounded_by_default(store: &dyn OfflineStore) {
	let room = RoomId::new_v4();
	let user = UserId::new_v4();
	for i in 0..501 {
		store
			.enqueue(room, user, &msg(room, user, &format!("m{i}"), i))
			.await
			.expect("enqueue");
	}

	let drained = store.drain(room, user).await.expect("drain");
	assert_eq!(drained.len(), 501, "{} must keep every entry", store.backend_name());
	assert_eq!(drained.first().map(|m| m.body.as_str()), Some("m0"));
	assert_eq!(drained.last().map(|m| m.body.as_str()), Some("m500"));
}

async fn restore_goes_ahead_of_newer_entries(store: &dyn OfflineStore) {
	let room = RoomId::new_v4();
	let user = UserId::new_v4();
	for i in 0..3 {
		store
			.enqueue(room, user, &msg(room, user, &format!("m{i}"), i))
			.await
			.expect("enqueue");
	}

	let taken = store.drain(room, user).await.expect("drain");
	// m0 made it out; m3 arrives while m1 and m2 are in flight.
	store.enqueue(room, user, &msg(room, user, "m3", 3)).await.expect("enqueue");
	store.restore(room, user, &taken[1..]).await.expect("restore");
	store.restore(room, user, &[]).await.expect("empty restore");

	let bodies: Vec<String> = store
		.drain(room, user)
		.await
		.expect("drain")
		.into_iter()
		.map(|m| m.body)
		.collect();
	assert_eq!(bodies, vec!["m1", "m2", "m3"], "{} restores at the head", store.backend_name());
}

#[tokio::test]
async fn memory_store_drains_in_order_exactly_once() {
	drain_is_ordered_and_exactly_once(&InMemoryOfflineStore::new(OfflineStoreConfig::default())).await;
}

#[tokio::test]
async fn memory_store_keys_backlogs() {
	backlogs_are_keyed_by_room_and_recipient(&InMemoryOfflineStore::new(OfflineStoreConfig::default())).await;
}

#[tokio::test]
async fn memory_store_enforces_cap() {
	cap_drops_oldest(&InMemoryOfflineStore::new(capped(3))).await;
}

#[tokio::test]
async fn memory_store_is_unbounded_by_default() {
	unbounded_by_default(&InMemoryOfflineStore::default()).await;
}

#[tokio::test]
async fn memory_store_restores_at_the_head() {
	restore_goes_ahead_of_newer_entries(&InMemoryOfflineStore::default()).await;
}

#[tokio::test]
async fn sql_store_drains_in_order_exactly_once() {
	let (_dir, db) = sqlite_db().await;
	drain_is_ordered_and_exactly_once(&SqlOfflineStore::new(db, OfflineStoreConfig::default())).await;
}

#[tokio::test]
async fn sql_store_keys_backlogs() {
	let (_dir, db) = sqlite_db().await;
	backlogs_are_keyed_by_room_and_recipient(&SqlOfflineStore::new(db, OfflineStoreConfig::default())).await;
}

#[tokio::test]
async fn sql_store_enforces_cap() {
	let (_dir, db) = sqlite_db().await;
	cap_drops_oldest(&SqlOfflineStore::new(db, capped(3))).await;
}

#[tokio::test]
async fn sql_store_is_unbounded_by_default() {
	let (_dir, db) = sqlite_db().await;
	unbounded_by_default(&SqlOfflineStore::new(db, OfflineStoreConfig::default())).await;
}

#[tokio::test]
async fn sql_store_restores_at_the_head() {
	let (_dir, db) = sqlite_db().await;
	restore_goes_ahead_of_newer_entries(&SqlOfflineStore::new(db, OfflineStoreConfig::default())).await;
}

#[tokio::test]
async fn sql_backlog_survives_reopen() {
	let (dir, db) = sqlite_db().await;
	let room = RoomId::new_v4();
	let user = UserId::new_v4();
	let m = msg(room, user, "durable", 1);
	SqlOfflineStore::new(db, OfflineStoreConfig::default())
		.enqueue(room, user, &m)
		.await
		.expect("enqueue");

	let url = format!("sqlite://{}?mode=rwc", dir.path().join("offline.db").display());
	let reopened = Database::connect(&url).await.expect("reopen sqlite");
	let drained = SqlOfflineStore::new(reopened, OfflineStoreConfig::default())
		.drain(room, user)
		.await
		.expect("drain");
	assert_eq!(drained, vec![m]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_drains_hand_out_each_message_once() {
	let (_dir, db) = sqlite_db().await;
	let store: Arc<dyn OfflineStore> = Arc::new(SqlOfflineStore::new(db, OfflineStoreConfig::default()));
	let room = RoomId::new_v4();
	let user = UserId::new_v4();
	for i in 0..50 {
		store
			.enqueue(room, user, &msg(room, user, &format!("m{i}"), i))
			.await
			.expect("enqueue");
	}

	let mut tasks = Vec::new();
	for _ in 0..4 {
		let store = store.clone();
		tasks.push(tokio::spawn(async move { store.drain(room, user).await }));
	}

	let mut total = 0;
	for t in tasks {
		// SQLite may report a busy database under contention; that drain
		// simply returns nothing.
		if let Ok(drained) = t.await.expect("task must not panic") {
			total += drained.len();
		}
	}
	assert_eq!(total + store.pending(room, user).await.expect("pending"), 50);
}

#[tokio::test]
async fn configured_backend_is_selected() {
	let settings = OfflineSettings {
		backend: OfflineBackendKind::Memory,
		redis_url: None,
		max_per_recipient: Some(10),
		ttl: Some(Duration::from_secs(60)),
	};
	let store = open_offline_store(&settings, None).await.expect("memory store");
	assert_eq!(store.backend_name(), "memory");

	let sql = OfflineSettings {
		backend: OfflineBackendKind::Sql,
		..settings
	};
	assert!(open_offline_store(&sql, None).await.is_err(), "sql backend needs a database");

	let (_dir, db) = sqlite_db().await;
	let store = open_offline_store(&sql, Some(&db)).await.expect("sql store");
	assert_eq!(store.backend_name(), "sql");
}
