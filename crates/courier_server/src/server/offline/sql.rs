#![forbid(unsafe_code)]

use courier_domain::{ChatMessage, RoomId, UserId};

use super::{OfflineStore, OfflineStoreConfig, decode_entries, encode_entry, record_trimmed};
use crate::server::db::Database;
use crate::server::error::StoreError;
use crate::util::time::unix_ms_now;

const BACKEND: &str = "sql";

/// With a cap configured, keeps the newest `cap` rows: everything older than the row at offset `cap - 1`
/// (newest first) is deleted. The derived table lets MySQL read the target table.
const TRIM_SQLITE_MYSQL: &str = "DELETE FROM offline_messages WHERE room_id = ? AND recipient_id = ? AND seq < \
	(SELECT keep_from FROM (SELECT seq AS keep_from FROM offline_messages WHERE room_id = ? AND recipient_id = ? \
	ORDER BY seq DESC LIMIT 1 OFFSET ?) AS oldest_kept)";

const TRIM_POSTGRES: &str = "DELETE FROM offline_messages WHERE room_id = $1 AND recipient_id = $2 AND seq < \
	(SELECT keep_from FROM (SELECT seq AS keep_from FROM offline_messages WHERE room_id = $3 AND recipient_id = $4 \
	ORDER BY seq DESC LIMIT 1 OFFSET $5) AS oldest_kept)";

/// Durable backlog in the `offline_messages` table. Survives restarts.
#[derive(Debug, Clone)]
pub struct SqlOfflineStore {
	db: Database,
	cfg: OfflineStoreConfig,
}

fn sql_err(op: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
	move |e| StoreError::unavailable(BACKEND, format!("{op}: {e}"))
}

impl SqlOfflineStore {
	pub fn new(db: Database, cfg: OfflineStoreConfig) -> Self {
		Self { db, cfg }
	}
}

#[async_trait::async_trait]
impl OfflineStore for SqlOfflineStore {
	fn backend_name(&self) -> &'static str {
		BACKEND
	}

	async fn enqueue(&self, room_id: RoomId, recipient_id: UserId, msg: &ChatMessage) -> Result<(), StoreError> {
		let payload = encode_entry(msg)?;
		let room = room_id.to_string();
		let recipient = recipient_id.to_string();
		let keep_offset = self.cfg.max_per_recipient.map(|max| max.saturating_sub(1) as i64);
		let now = unix_ms_now();

		let trimmed = match &self.db {
			Database::Sqlite(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin sqlite tx"))?;
				sqlx::query(
					"INSERT INTO offline_messages (room_id, recipient_id, payload, created_at) VALUES (?, ?, ?, ?)",
				)
				.bind(&room)
				.bind(&recipient)
				.bind(&payload)
				.bind(now)
				.execute(&mut *tx)
				.await
				.map_err(sql_err("insert offline message (sqlite)"))?;

				let trimmed = match keep_offset {
					Some(offset) => sqlx::query(TRIM_SQLITE_MYSQL)
						.bind(&room)
						.bind(&recipient)
						.bind(&room)
						.bind(&recipient)
						.bind(offset)
						.execute(&mut *tx)
						.await
						.map_err(sql_err("trim offline messages (sqlite)"))?
						.rows_affected(),
					None => 0,
				};

				tx.commit().await.map_err(sql_err("commit sqlite tx"))?;
				trimmed
			}
			Database::Postgres(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin postgres tx"))?;
				sqlx::query(
					"INSERT INTO offline_messages (room_id, recipient_id, payload, created_at) VALUES ($1, $2, $3, $4)",
				)
				.bind(&room)
				.bind(&recipient)
				.bind(&payload)
				.bind(now)
				.execute(&mut *tx)
				.await
				.map_err(sql_err("insert offline message (postgres)"))?;

				let trimmed = match keep_offset {
					Some(offset) => sqlx::query(TRIM_POSTGRES)
						.bind(&room)
						.bind(&recipient)
						.bind(&room)
						.bind(&recipient)
						.bind(offset)
						.execute(&mut *tx)
						.await
						.map_err(sql_err("trim offline messages (postgres)"))?
						.rows_affected(),
					None => 0,
				};

				tx.commit().await.map_err(sql_err("commit postgres tx"))?;
				trimmed
			}
			Database::Mysql(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin mysql tx"))?;
				sqlx::query(
					"INSERT INTO offline_messages (room_id, recipient_id, payload, created_at) VALUES (?, ?, ?, ?)",
				)
				.bind(&room)
				.bind(&recipient)
				.bind(&payload)
				.bind(now)
				.execute(&mut *tx)
				.await
				.map_err(sql_err("insert offline message (mysql)"))?;

				let trimmed = match keep_offset {
					Some(offset) => sqlx::query(TRIM_SQLITE_MYSQL)
						.bind(&room)
						.bind(&recipient)
						.bind(&room)
						.bind(&recipient)
						.bind(offset)
						.execute(&mut *tx)
						.await
						.map_err(sql_err("trim offline messages (mysql)"))?
						.rows_affected(),
					None => 0,
				};

				tx.commit().await.map_err(sql_err("commit mysql tx"))?;
				trimmed
			}
		};

		record_trimmed(BACKEND, room_id, recipient_id, trimmed);
		Ok(())
	}

	async fn drain(&self, room_id: RoomId, recipient_id: UserId) -> Result<Vec<ChatMessage>, StoreError> {
		let room = room_id.to_string();
		let recipient = recipient_id.to_string();

		let mut rows: Vec<(i64, String)> = match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query_as("DELETE FROM offline_messages WHERE room_id = ? AND recipient_id = ? RETURNING seq, payload")
					.bind(&room)
					.bind(&recipient)
					.fetch_all(pool)
					.await
					.map_err(sql_err("drain offline messages (sqlite)"))?
			}
			Database::Postgres(pool) => sqlx::query_as(
				"DELETE FROM offline_messages WHERE room_id = $1 AND recipient_id = $2 RETURNING seq, payload",
			)
			.bind(&room)
			.bind(&recipient)
			.fetch_all(pool)
			.await
			.map_err(sql_err("drain offline messages (postgres)"))?,
			Database::Mysql(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin mysql tx"))?;
				let rows: Vec<(i64, String)> = sqlx::query_as(
					"SELECT seq, payload FROM offline_messages WHERE room_id = ? AND recipient_id = ? \
					ORDER BY seq FOR UPDATE",
				)
				.bind(&room)
				.bind(&recipient)
				.fetch_all(&mut *tx)
				.await
				.map_err(sql_err("select offline messages (mysql)"))?;

				if let Some((max_seq, _)) = rows.last() {
					sqlx::query("DELETE FROM offline_messages WHERE room_id = ? AND recipient_id = ? AND seq <= ?")
						.bind(&room)
						.bind(&recipient)
						.bind(*max_seq)
						.execute(&mut *tx)
						.await
						.map_err(sql_err("delete offline messages (mysql)"))?;
				}

				tx.commit().await.map_err(sql_err("commit mysql tx"))?;
				rows
			}
		};

		rows.sort_by_key(|(seq, _)| *seq);
		Ok(decode_entries(BACKEND, rows.iter().map(|(_, payload)| payload.as_str())))
	}

	/// Takes the current rows out and writes `msgs` followed by those rows, so
	/// the restored entries get the lowest sequence numbers. Concurrent
	/// enqueues wait for the transaction: SQLite holds the write lock, MySQL the
	/// gap lock from `FOR UPDATE`, Postgres an explicit table lock.
	async fn restore(&self, room_id: RoomId, recipient_id: UserId, msgs: &[ChatMessage]) -> Result<(), StoreError> {
		if msgs.is_empty() {
			return Ok(());
		}
		let room = room_id.to_string();
		let recipient = recipient_id.to_string();
		let now = unix_ms_now();
		let mut entries = msgs
			.iter()
			.map(|msg| encode_entry(msg).map(|payload| (payload, now)))
			.collect::<Result<Vec<_>, _>>()?;

		match &self.db {
			Database::Sqlite(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin sqlite tx"))?;
				let mut rows: Vec<(i64, String, i64)> = sqlx::query_as(
					"DELETE FROM offline_messages WHERE room_id = ? AND recipient_id = ? RETURNING seq, payload, created_at",
				)
				.bind(&room)
				.bind(&recipient)
				.fetch_all(&mut *tx)
				.await
				.map_err(sql_err("take offline messages (sqlite)"))?;
				rows.sort_by_key(|(seq, _, _)| *seq);
				entries.extend(rows.into_iter().map(|(_, payload, created_at)| (payload, created_at)));

				for (payload, created_at) in &entries {
					sqlx::query(
						"INSERT INTO offline_messages (room_id, recipient_id, payload, created_at) VALUES (?, ?, ?, ?)",
					)
					.bind(&room)
					.bind(&recipient)
					.bind(payload)
					.bind(*created_at)
					.execute(&mut *tx)
					.await
					.map_err(sql_err("restore offline message (sqlite)"))?;
				}
				tx.commit().await.map_err(sql_err("commit sqlite tx"))?;
			}
			Database::Postgres(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin postgres tx"))?;
				sqlx::query("LOCK TABLE offline_messages IN SHARE ROW EXCLUSIVE MODE")
					.execute(&mut *tx)
					.await
					.map_err(sql_err("lock offline messages (postgres)"))?;
				let mut rows: Vec<(i64, String, i64)> = sqlx::query_as(
					"DELETE FROM offline_messages WHERE room_id = $1 AND recipient_id = $2 RETURNING seq, payload, created_at",
				)
				.bind(&room)
				.bind(&recipient)
				.fetch_all(&mut *tx)
				.await
				.map_err(sql_err("take offline messages (postgres)"))?;
				rows.sort_by_key(|(seq, _, _)| *seq);
				entries.extend(rows.into_iter().map(|(_, payload, created_at)| (payload, created_at)));

				for (payload, created_at) in &entries {
					sqlx::query(
						"INSERT INTO offline_messages (room_id, recipient_id, payload, created_at) VALUES ($1, $2, $3, $4)",
					)
					.bind(&room)
					.bind(&recipient)
					.bind(payload)
					.bind(*created_at)
					.execute(&mut *tx)
					.await
					.map_err(sql_err("restore offline message (postgres)"))?;
				}
				tx.commit().await.map_err(sql_err("commit postgres tx"))?;
			}
			Database::Mysql(pool) => {
				let mut tx = pool.begin().await.map_err(sql_err("begin mysql tx"))?;
				let rows: Vec<(i64, String, i64)> = sqlx::query_as(
					"SELECT seq, payload, created_at FROM offline_messages WHERE room_id = ? AND recipient_id = ? \
					ORDER BY seq FOR UPDATE",
				)
				.bind(&room)
				.bind(&recipient)
				.fetch_all(&mut *tx)
				.await
				.map_err(sql_err("select offline messages (mysql)"))?;

				if let Some((max_seq, _, _)) = rows.last() {
					sqlx::query("DELETE FROM offline_messages WHERE room_id = ? AND recipient_id = ? AND seq <= ?")
						.bind(&room)
						.bind(&recipient)
						.bind(*max_seq)
						.execute(&mut *tx)
						.await
						.map_err(sql_err("delete offline messages (mysql)"))?;
				}
				entries.extend(rows.into_iter().map(|(_, payload, created_at)| (payload, created_at)));

				for (payload, created_at) in &entries {
					sqlx::query(
						"INSERT INTO offline_messages (room_id, recipient_id, payload, created_at) VALUES (?, ?, ?, ?)",
					)
					.bind(&room)
					.bind(&recipient)
					.bind(payload)
					.bind(*created_at)
					.execute(&mut *tx)
					.await
					.map_err(sql_err("restore offline message (mysql)"))?;
				}
				tx.commit().await.map_err(sql_err("commit mysql tx"))?;
			}
		}
		Ok(())
	}

	async fn pending(&self, room_id: RoomId, recipient_id: UserId) -> Result<usize, StoreError> {
		let room = room_id.to_string();
		let recipient = recipient_id.to_string();

		let (count,): (i64,) = match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM offline_messages WHERE room_id = ? AND recipient_id = ?")
					.bind(&room)
					.bind(&recipient)
					.fetch_one(pool)
					.await
					.map_err(sql_err("count offline messages (sqlite)"))?
			}
			Database::Postgres(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM offline_messages WHERE room_id = $1 AND recipient_id = $2")
					.bind(&room)
					.bind(&recipient)
					.fetch_one(pool)
					.await
					.map_err(sql_err("count offline messages (postgres)"))?
			}
			Database::Mysql(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM offline_messages WHERE room_id = ? AND recipient_id = ?")
					.bind(&room)
					.bind(&recipient)
					.fetch_one(pool)
					.await
					.map_err(sql_err("count offline messages (mysql)"))?
			}
		};

		Ok(count.max(0) as usize)
	}
}
