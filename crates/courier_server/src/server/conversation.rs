#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use courier_domain::{ConversationKey, ParseIdError, RoomId, UserId};
use parking_lot::Mutex;
use tracing::debug;

use crate::server::db::Database;
use crate::server::error::{ConversationError, StoreError};
use crate::util::time::unix_ms_now;

/// A room a user participates in. `pair` is set for two-party conversations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
	pub room_id: RoomId,
	pub pair: Option<ConversationKey>,
}

#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
	fn backend_name(&self) -> &'static str;

	async fn find(&self, key: &ConversationKey) -> Result<Option<RoomId>, StoreError>;

	/// Return the room for `key`, creating it if absent. Concurrent callers for
	/// the same key all get the same id.
	async fn find_or_create(&self, key: &ConversationKey) -> Result<RoomId, StoreError>;

	/// Record that `user_id` participates in `room_id`. Idempotent.
	async fn join(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError>;

	async fn participants(&self, room_id: RoomId) -> Result<BTreeSet<UserId>, StoreError>;

	async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomSummary>, StoreError>;
}

/// Maps participant pairs to rooms and tracks room membership.
#[derive(Clone)]
pub struct ConversationResolver {
	store: Arc<dyn ConversationStore>,
}

impl ConversationResolver {
	pub fn new(store: Arc<dyn ConversationStore>) -> Self {
		Self { store }
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(InMemoryConversationStore::default()))
	}

	pub fn backend_name(&self) -> &'static str {
		self.store.backend_name()
	}

	/// Canonical key for the pair; `resolve(a, b) == resolve(b, a)`.
	pub fn resolve(a: UserId, b: UserId) -> Result<ConversationKey, ParseIdError> {
		ConversationKey::new(a, b)
	}

	pub async fn find(&self, a: UserId, b: UserId) -> Result<Option<RoomId>, ConversationError> {
		let key = Self::resolve(a, b)?;
		Ok(self.store.find(&key).await?)
	}

	pub async fn find_or_create(&self, a: UserId, b: UserId) -> Result<RoomId, ConversationError> {
		let key = Self::resolve(a, b)?;
		let room_id = self.store.find_or_create(&key).await?;
		debug!(pair = %key, room_id = %room_id, "conversation resolved");
		Ok(room_id)
	}

	/// Register an externally assigned multi-party room.
	pub async fn register_room(&self, room_id: RoomId, participants: &[UserId]) -> Result<(), StoreError> {
		for user_id in participants {
			self.store.join(room_id, *user_id).await?;
		}
		Ok(())
	}

	pub async fn join(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError> {
		self.store.join(room_id, user_id).await
	}

	pub async fn participants(&self, room_id: RoomId) -> Result<BTreeSet<UserId>, StoreError> {
		self.store.participants(room_id).await
	}

	pub async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomSummary>, StoreError> {
		self.store.rooms_for_user(user_id).await
	}
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
	room_by_pair: HashMap<ConversationKey, RoomId>,
	pair_by_room: HashMap<RoomId, ConversationKey>,
	participants: BTreeMap<RoomId, BTreeSet<UserId>>,
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
	fn backend_name(&self) -> &'static str {
		"memory"
	}

	async fn find(&self, key: &ConversationKey) -> Result<Option<RoomId>, StoreError> {
		Ok(self.inner.lock().room_by_pair.get(key).copied())
	}

	async fn find_or_create(&self, key: &ConversationKey) -> Result<RoomId, StoreError> {
		let mut inner = self.inner.lock();
		if let Some(room_id) = inner.room_by_pair.get(key) {
			return Ok(*room_id);
		}

		let room_id = RoomId::new_v4();
		let (a, b) = key.participants();
		inner.room_by_pair.insert(*key, room_id);
		inner.pair_by_room.insert(room_id, *key);
		inner.participants.entry(room_id).or_default().extend([a, b]);
		Ok(room_id)
	}

	async fn join(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError> {
		self.inner.lock().participants.entry(room_id).or_default().insert(user_id);
		Ok(())
	}

	async fn participants(&self, room_id: RoomId) -> Result<BTreeSet<UserId>, StoreError> {
		Ok(self.inner.lock().participants.get(&room_id).cloned().unwrap_or_default())
	}

	async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomSummary>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner
			.participants
			.iter()
			.filter(|(_, members)| members.contains(&user_id))
			.map(|(room_id, _)| RoomSummary {
				room_id: *room_id,
				pair: inner.pair_by_room.get(room_id).copied(),
			})
			.collect())
	}
}

const BACKEND: &str = "sql";

fn sql_err(op: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
	move |e| StoreError::unavailable(BACKEND, format!("{op}: {e}"))
}

fn parse_room(raw: &str) -> Result<RoomId, StoreError> {
	RoomId::parse(raw).map_err(|e| StoreError::Corrupt(format!("conversations.room_id {raw:?}: {e}")))
}

fn parse_user(raw: &str) -> Result<UserId, StoreError> {
	UserId::parse(raw).map_err(|e| StoreError::Corrupt(format!("conversation_participants.user_id {raw:?}: {e}")))
}

/// Conversations in the `conversations` and `conversation_participants` tables.
///
/// The unique `pair_key` column makes concurrent creation converge on one row.
#[derive(Debug, Clone)]
pub struct SqlConversationStore {
	db: Database,
}

impl SqlConversationStore {
	pub fn new(db: Database) -> Self {
		Self { db }
	}
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
	fn backend_name(&self) -> &'static str {
		BACKEND
	}

	async fn find(&self, key: &ConversationKey) -> Result<Option<RoomId>, StoreError> {
		let pair_key = key.storage_key();
		let row: Option<(String,)> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as("SELECT room_id FROM conversations WHERE pair_key = ?")
				.bind(&pair_key)
				.fetch_optional(pool)
				.await
				.map_err(sql_err("select conversation (sqlite)"))?,
			Database::Postgres(pool) => sqlx::query_as("SELECT room_id FROM conversations WHERE pair_key = $1")
				.bind(&pair_key)
				.fetch_optional(pool)
				.await
				.map_err(sql_err("select conversation (postgres)"))?,
			Database::Mysql(pool) => sqlx::query_as("SELECT room_id FROM conversations WHERE pair_key = ?")
				.bind(&pair_key)
				.fetch_optional(pool)
				.await
				.map_err(sql_err("select conversation (mysql)"))?,
		};

		row.map(|(room,)| parse_room(&room)).transpose()
	}

	async fn find_or_create(&self, key: &ConversationKey) -> Result<RoomId, StoreError> {
		let pair_key = key.storage_key();
		let candidate = RoomId::new_v4().to_string();
		let (a, b) = key.participants();
		let (a, b) = (a.to_string(), b.to_string());
		let now = unix_ms_now();

		let room: String = match &self.db {
			Database::Sqlite(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin sqlite tx"))?;
				sqlx::query(
					"INSERT INTO conversations (room_id, pair_key, created_at) VALUES (?, ?, ?) \
					ON CONFLICT(pair_key) DO NOTHING",
				)
				.bind(&candidate)
				.bind(&pair_key)
				.bind(now)
				.execute(&mut *tx)
				.await
				.map_err(sql_err("insert conversation (sqlite)"))?;

				let (room,): (String,) = sqlx::query_as("SELECT room_id FROM conversations WHERE pair_key = ?")
					.bind(&pair_key)
					.fetch_one(&mut *tx)
					.await
					.map_err(sql_err("select conversation (sqlite)"))?;

				for user in [&a, &b] {
					sqlx::query("INSERT OR IGNORE INTO conversation_participants (room_id, user_id) VALUES (?, ?)")
						.bind(&room)
						.bind(user)
						.execute(&mut *tx)
						.await
						.map_err(sql_err("insert participant (sqlite)"))?;
				}

				tx.commit().await.map_err(sql_err("commit sqlite tx"))?;
				room
			}
			Database::Postgres(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin postgres tx"))?;
				sqlx::query(
					"INSERT INTO conversations (room_id, pair_key, created_at) VALUES ($1, $2, $3) \
					ON CONFLICT (pair_key) DO NOTHING",
				)
				.bind(&candidate)
				.bind(&pair_key)
				.bind(now)
				.execute(&mut *tx)
				.await
				.map_err(sql_err("insert conversation (postgres)"))?;

				let (room,): (String,) = sqlx::query_as("SELECT room_id FROM conversations WHERE pair_key = $1")
					.bind(&pair_key)
					.fetch_one(&mut *tx)
					.await
					.map_err(sql_err("select conversation (postgres)"))?;

				for user in [&a, &b] {
					sqlx::query(
						"INSERT INTO conversation_participants (room_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
					)
					.bind(&room)
					.bind(user)
					.execute(&mut *tx)
					.await
					.map_err(sql_err("insert participant (postgres)"))?;
				}

				tx.commit().await.map_err(sql_err("commit postgres tx"))?;
				room
			}
			Database::Mysql(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin mysql tx"))?;
				sqlx::query("INSERT IGNORE INTO conversations (room_id, pair_key, created_at) VALUES (?, ?, ?)")
					.bind(&candidate)
					.bind(&pair_key)
					.bind(now)
					.execute(&mut *tx)
					.await
					.map_err(sql_err("insert conversation (mysql)"))?;

				let (room,): (String,) = sqlx::query_as("SELECT room_id FROM conversations WHERE pair_key = ?")
					.bind(&pair_key)
					.fetch_one(&mut *tx)
					.await
					.map_err(sql_err("select conversation (mysql)"))?;

				for user in [&a, &b] {
					sqlx::query("INSERT IGNORE INTO conversation_participants (room_id, user_id) VALUES (?, ?)")
						.bind(&room)
						.bind(user)
						.execute(&mut *tx)
						.await
						.map_err(sql_err("insert participant (mysql)"))?;
				}

				tx.commit().await.map_err(sql_err("commit mysql tx"))?;
				room
			}
		};

		parse_room(&room)
	}

	async fn join(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError> {
		let room = room_id.to_string();
		let user = user_id.to_string();
		let now = unix_ms_now();

		match &self.db {
			Database::Sqlite(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin sqlite tx"))?;
				sqlx::query("INSERT OR IGNORE INTO conversations (room_id, pair_key, created_at) VALUES (?, NULL, ?)")
					.bind(&room)
					.bind(now)
					.execute(&mut *tx)
					.await
					.map_err(sql_err("insert room (sqlite)"))?;
				sqlx::query("INSERT OR IGNORE INTO conversation_participants (room_id, user_id) VALUES (?, ?)")
					.bind(&room)
					.bind(&user)
					.execute(&mut *tx)
					.await
					.map_err(sql_err("insert participant (sqlite)"))?;
				tx.commit().await.map_err(sql_err("commit sqlite tx"))?;
			}
			Database::Postgres(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin postgres tx"))?;
				sqlx::query(
					"INSERT INTO conversations (room_id, pair_key, created_at) VALUES ($1, NULL, $2) ON CONFLICT DO NOTHING",
				)
				.bind(&room)
				.bind(now)
				.execute(&mut *tx)
				.await
				.map_err(sql_err("insert room (postgres)"))?;
				sqlx::query(
					"INSERT INTO conversation_participants (room_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
				)
				.bind(&room)
				.bind(&user)
				.execute(&mut *tx)
				.await
				.map_err(sql_err("insert participant (postgres)"))?;
				tx.commit().await.map_err(sql_err("commit postgres tx"))?;
			}
			Database::Mysql(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin mysql tx"))?;
				sqlx::query("INSERT IGNORE INTO conversations (room_id, pair_key, created_at) VALUES (?, NULL, ?)")
					.bind(&room)
					.bind(now)
					.execute(&mut *tx)
					.await
					.map_err(sql_err("insert room (mysql)"))?;
				sqlx::query("INSERT IGNORE INTO conversation_participants (room_id, user_id) VALUES (?, ?)")
					.bind(&room)
					.bind(&user)
					.execute(&mut *tx)
					.await
					.map_err(sql_err("insert participant (mysql)"))?;
				tx.commit().await.map_err(sql_err("commit mysql tx"))?;
			}
		}

		Ok(())
	}

	async fn participants(&self, room_id: RoomId) -> Result<BTreeSet<UserId>, StoreError> {
		let room = room_id.to_string();
		let rows: Vec<(String,)> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as("SELECT user_id FROM conversation_participants WHERE room_id = ?")
				.bind(&room)
				.fetch_all(pool)
				.await
				.map_err(sql_err("select participants (sqlite)"))?,
			Database::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM conversation_participants WHERE room_id = $1")
					.bind(&room)
					.fetch_all(pool)
					.await
					.map_err(sql_err("select participants (postgres)"))?
			}
			Database::Mysql(pool) => sqlx::query_as("SELECT user_id FROM conversation_participants WHERE room_id = ?")
				.bind(&room)
				.fetch_all(pool)
				.await
				.map_err(sql_err("select participants (mysql)"))?,
		};

		rows.iter().map(|(user,)| parse_user(user)).collect()
	}

	async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomSummary>, StoreError> {
		let user = user_id.to_string();
		let rows: Vec<(String, Option<String>)> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(
				"SELECT c.room_id, c.pair_key FROM conversations c \
				JOIN conversation_participants p ON p.room_id = c.room_id \
				WHERE p.user_id = ? ORDER BY c.created_at, c.room_id",
			)
			.bind(&user)
			.fetch_all(pool)
			.await
			.map_err(sql_err("select rooms for user (sqlite)"))?,
			Database::Postgres(pool) => sqlx::query_as(
				"SELECT c.room_id, c.pair_key FROM conversations c \
				JOIN conversation_participants p ON p.room_id = c.room_id \
				WHERE p.user_id = $1 ORDER BY c.created_at, c.room_id",
			)
			.bind(&user)
			.fetch_all(pool)
			.await
			.map_err(sql_err("select rooms for user (postgres)"))?,
			Database::Mysql(pool) => sqlx::query_as(
				"SELECT c.room_id, c.pair_key FROM conversations c \
				JOIN conversation_participants p ON p.room_id = c.room_id \
				WHERE p.user_id = ? ORDER BY c.created_at, c.room_id",
			)
			.bind(&user)
			.fetch_all(pool)
			.await
			.map_err(sql_err("select rooms for user (mysql)"))?,
		};

		rows.into_iter()
			.map(|(room, pair)| {
				let pair = pair
					.map(|p| {
						ConversationKey::from_storage_key(&p)
							.map_err(|e| StoreError::Corrupt(format!("conversations.pair_key {p:?}: {e}")))
					})
					.transpose()?;
				Ok(RoomSummary {
					room_id: parse_room(&room)?,
					pair,
				})
			})
			.collect()
	}
}
