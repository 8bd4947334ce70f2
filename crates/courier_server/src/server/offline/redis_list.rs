#![forbid(unsafe_code)]

use anyhow::Context as _;
use courier_domain::{ChatMessage, RoomId, UserId};
use redis::AsyncCommands as _;
use redis::aio::ConnectionManager;
use tracing::info;

use super::{OfflineStore, OfflineStoreConfig, decode_entries, encode_entry, record_trimmed};
use crate::server::error::StoreError;

const BACKEND: &str = "redis";

/// Backlog kept in one Redis list per `(room, recipient)`: `unread:{room}:{user}`.
#[derive(Clone)]
pub struct RedisOfflineStore {
	conn: ConnectionManager,
	cfg: OfflineStoreConfig,
}

impl RedisOfflineStore {
	pub async fn connect(redis_url: &str, cfg: OfflineStoreConfig) -> anyhow::Result<Self> {
		if redis_url.starts_with("rediss://") {
			info!("offline store: redis TLS enabled (rediss://)");
		}

		let client = redis::Client::open(redis_url).context("parse redis url")?;
		let conn = client.get_connection_manager().await.context("connect redis")?;
		Ok(Self { conn, cfg })
	}

	pub fn key(room_id: RoomId, recipient_id: UserId) -> String {
		format!("unread:{room_id}:{recipient_id}")
	}

	fn expire(&self, pipe: &mut redis::Pipeline, key: &str) {
		if let Some(ttl) = self.cfg.ttl {
			pipe.expire(key, ttl.as_secs() as i64).ignore();
		}
	}
}

#[async_trait::async_trait]
impl OfflineStore for RedisOfflineStore {
	fn backend_name(&self) -> &'static str {
		BACKEND
	}

	async fn enqueue(&self, room_id: RoomId, recipient_id: UserId, msg: &ChatMessage) -> Result<(), StoreError> {
		let key = Self::key(room_id, recipient_id);
		let payload = encode_entry(msg)?;
		let mut conn = self.conn.clone();

		let mut pipe = redis::pipe();
		pipe.atomic().rpush(&key, payload);
		if let Some(cap) = self.cfg.max_per_recipient {
			pipe.ltrim(&key, -(cap as isize), -1).ignore();
		}
		self.expire(&mut pipe, &key);

		let (len,): (u64,) = pipe
			.query_async(&mut conn)
			.await
			.map_err(|e| StoreError::unavailable(BACKEND, format!("enqueue: {e}")))?;

		if let Some(cap) = self.cfg.max_per_recipient {
			record_trimmed(BACKEND, room_id, recipient_id, len.saturating_sub(cap as u64));
		}
		Ok(())
	}

	async fn drain(&self, room_id: RoomId, recipient_id: UserId) -> Result<Vec<ChatMessage>, StoreError> {
		let key = Self::key(room_id, recipient_id);
		let mut conn = self.conn.clone();

		let (entries,): (Vec<String>,) = redis::pipe()
			.atomic()
			.lrange(&key, 0, -1)
			.del(&key)
			.ignore()
			.query_async(&mut conn)
			.await
			.map_err(|e| StoreError::unavailable(BACKEND, format!("drain: {e}")))?;

		Ok(decode_entries(BACKEND, entries.iter().map(String::as_str)))
	}

	async fn restore(&self, room_id: RoomId, recipient_id: UserId, msgs: &[ChatMessage]) -> Result<(), StoreError> {
		if msgs.is_empty() {
			return Ok(());
		}
		let key = Self::key(room_id, recipient_id);
		// LPUSH inserts its values one by one at the head, so push them newest first.
		let payloads = msgs.iter().rev().map(encode_entry).collect::<Result<Vec<_>, _>>()?;
		let mut conn = self.conn.clone();

		let mut pipe = redis::pipe();
		pipe.atomic().lpush(&key, payloads).ignore();
		self.expire(&mut pipe, &key);

		let _: () = pipe
			.query_async(&mut conn)
			.await
			.map_err(|e| StoreError::unavailable(BACKEND, format!("restore: {e}")))?;
		Ok(())
	}

	async fn pending(&self, room_id: RoomId, recipient_id: UserId) -> Result<usize, StoreError> {
		let key = Self::key(room_id, recipient_id);
		let mut conn = self.conn.clone();

		conn.llen::<_, usize>(&key)
			.await
			.map_err(|e| StoreError::unavailable(BACKEND, format!("pending: {e}")))
	}
}
