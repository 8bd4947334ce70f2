#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use courier_domain::{ConversationKey, ParseIdError, RoomId, UserId};
use proptest::prelude::*;

use crate::server::conversation::{ConversationResolver, RoomSummary, SqlConversationStore};
use crate::server::db::Database;
use crate::server::error::ConversationError;

async fn sqlite_resolver() -> (tempfile::TempDir, ConversationResolver) {
	let dir = tempfile::tempdir().expect("tempdir");
	let url = format!("sqlite://{}?mode=rwc", dir.path().join("conversations.db").display());
	let db = Database::connect(&url).await.expect("connect sqlite");
	(dir, ConversationResolver::new(Arc::new(SqlConversationStore::new(db))))
}

async fn find_or_create_is_symmetric(resolver: &ConversationResolver) {
	let a = UserId::new_v4();
	let b = UserId::new_v4();

	assert_eq!(resolver.find(a, b).await.expect("find"), None);

	let ab = resolver.find_or_create(a, b).await.expect("create");
	let ba = resolver.find_or_create(b, a).await.expect("lookup reversed");
	assert_eq!(ab, ba);
	assert_eq!(resolver.find(b, a).await.expect("find"), Some(ab));

	let participants = resolver.participants(ab).await.expect("participants");
	assert_eq!(participants, BTreeSet::from([a, b]));
}

async fn concurrent_find_or_create_yields_one_room(resolver: ConversationResolver) {
	let a = UserId::new_v4();
	let b = UserId::new_v4();

	let mut tasks = Vec::new();
	for i in 0..16 {
		let resolver = resolver.clone();
		tasks.push(tokio::spawn(async move {
			if i % 2 == 0 {
				resolver.find_or_create(a, b).await
			} else {
				resolver.find_or_create(b, a).await
			}
		}));
	}

	let mut rooms = BTreeSet::new();
	for t in tasks {
		rooms.insert(t.await.expect("task must not panic").expect("find_or_create"));
	}
	assert_eq!(rooms.len(), 1, "got rooms: {rooms:?}");
}

async fn membership_is_tracked(resolver: &ConversationResolver) {
	let a = UserId::new_v4();
	let b = UserId::new_v4();
	let c = UserId::new_v4();

	let pair_room = resolver.find_or_create(a, b).await.expect("create");
	let group = RoomId::new_v4();
	resolver.register_room(group, &[a, c]).await.expect("register group");
	resolver.join(group, a).await.expect("join is idempotent");

	assert_eq!(
		resolver.participants(group).await.expect("participants"),
		BTreeSet::from([a, c])
	);

	let mut rooms = resolver.rooms_for_user(a).await.expect("rooms_for_user");
	rooms.sort_by_key(|r| r.room_id);
	let mut expected = vec![
		RoomSummary {
			room_id: pair_room,
			pair: Some(ConversationKey::new(a, b).expect("pair")),
		},
		RoomSummary {
			room_id: group,
			pair: None,
		},
	];
	expected.sort_by_key(|r| r.room_id);
	assert_eq!(rooms, expected);

	assert!(resolver.rooms_for_user(UserId::new_v4()).await.expect("rooms").is_empty());
}

#[tokio::test]
async fn memory_find_or_create_is_symmetric() {
	find_or_create_is_symmetric(&ConversationResolver::in_memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_find_or_create_yields_one_room() {
	concurrent_find_or_create_yields_one_room(ConversationResolver::in_memory()).await;
}

#[tokio::test]
async fn memory_membership_is_tracked() {
	membership_is_tracked(&ConversationResolver::in_memory()).await;
}

#[tokio::test]
async fn sql_find_or_create_is_symmetric() {
	let (_dir, resolver) = sqlite_resolver().await;
	find_or_create_is_symmetric(&resolver).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sql_concurrent_find_or_create_yields_one_room() {
	let (_dir, resolver) = sqlite_resolver().await;
	concurrent_find_or_create_yields_one_room(resolver).await;
}

#[tokio::test]
async fn sql_membership_is_tracked() {
	let (_dir, resolver) = sqlite_resolver().await;
	membership_is_tracked(&resolver).await;
}

#[tokio::test]
async fn self_conversation_is_rejected() {
	let a = UserId::new_v4();
	let err = ConversationResolver::in_memory().find_or_create(a, a).await.unwrap_err();
	assert!(
		matches!(err, ConversationError::InvalidPair(ParseIdError::SameParticipant)),
		"got: {err:?}"
	);
}

proptest! {
	#[test]
	fn resolve_is_order_independent(a in any::<u128>(), b in any::<u128>()) {
		prop_assume!(a != b);
		let a = UserId::from_uuid(uuid::Uuid::from_u128(a));
		let b = UserId::from_uuid(uuid::Uuid::from_u128(b));
		prop_assert_eq!(
			ConversationResolver::resolve(a, b).unwrap(),
			ConversationResolver::resolve(b, a).unwrap()
		);
	}
}
