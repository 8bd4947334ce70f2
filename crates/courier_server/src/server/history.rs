#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use courier_domain::{Attachment, ChatMessage, MessageId, MessageStatus, RoomId, UserId};

use crate::server::db::Database;

type HistoryRow = (String, String, String, Option<String>, String, Option<String>, String, i64);

/// Durable chat history. A disabled history accepts and discards appends.
#[derive(Debug, Clone)]
pub struct MessageHistory {
	backend: Option<Database>,
}

impl MessageHistory {
	pub fn new(db: Database) -> Self {
		Self { backend: Some(db) }
	}

	pub fn disabled() -> Self {
		Self { backend: None }
	}

	pub fn is_enabled(&self) -> bool {
		self.backend.is_some()
	}

	/// Persist `msg`. Appending the same message id twice is a no-op.
	pub async fn append(&self, msg: &ChatMessage) -> anyhow::Result<MessageId> {
		let Some(backend) = &self.backend else {
			return Ok(msg.message_id);
		};

		if msg.has_inline_attachment() {
			return Err(anyhow!("refusing to persist an unresolved inline attachment"));
		}

		let message_id = msg.message_id.to_string();
		let room_id = msg.room_id.to_string();
		let sender_id = msg.sender_id.to_string();
		let recipient_id = msg.recipient_id.map(|r| r.to_string());
		let attachment_url = msg.attachment_url();
		let status = msg.status.as_str();

		match backend {
			Database::Sqlite(pool) => {
				sqlx::query(
					"INSERT OR IGNORE INTO message_history \
					(message_id, room_id, sender_id, recipient_id, body, attachment_url, status, created_at_unix_ms) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(&message_id)
				.bind(&room_id)
				.bind(&sender_id)
				.bind(&recipient_id)
				.bind(&msg.body)
				.bind(attachment_url)
				.bind(status)
				.bind(msg.created_at_unix_ms)
				.execute(pool)
				.await
				.context("insert message_history (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO message_history \
					(message_id, room_id, sender_id, recipient_id, body, attachment_url, status, created_at_unix_ms) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (message_id) DO NOTHING",
				)
				.bind(&message_id)
				.bind(&room_id)
				.bind(&sender_id)
				.bind(&recipient_id)
				.bind(&msg.body)
				.bind(attachment_url)
				.bind(status)
				.bind(msg.created_at_unix_ms)
				.execute(pool)
				.await
				.context("insert message_history (postgres)")?;
			}
			Database::Mysql(pool) => {
				sqlx::query(
					"INSERT IGNORE INTO message_history \
					(message_id, room_id, sender_id, recipient_id, body, attachment_url, status, created_at_unix_ms) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(&message_id)
				.bind(&room_id)
				.bind(&sender_id)
				.bind(&recipient_id)
				.bind(&msg.body)
				.bind(attachment_url)
				.bind(status)
				.bind(msg.created_at_unix_ms)
				.execute(pool)
				.await
				.context("insert message_history (mysql)")?;
			}
		}

		Ok(msg.message_id)
	}

	/// Up to `limit` most recent messages of a room, oldest first.
	pub async fn recent(&self, room_id: RoomId, limit: u32) -> anyhow::Result<Vec<ChatMessage>> {
		let Some(backend) = &self.backend else {
			return Ok(Vec::new());
		};

		let room = room_id.to_string();
		let limit = i64::from(limit);
		let mut rows: Vec<HistoryRow> = match backend {
			Database::Sqlite(pool) => sqlx::query_as(
				"SELECT message_id, room_id, sender_id, recipient_id, body, attachment_url, status, created_at_unix_ms \
				FROM message_history WHERE room_id = ? ORDER BY created_at_unix_ms DESC LIMIT ?",
			)
			.bind(&room)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select message_history (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(
				"SELECT message_id, room_id, sender_id, recipient_id, body, attachment_url, status, created_at_unix_ms \
				FROM message_history WHERE room_id = $1 ORDER BY created_at_unix_ms DESC LIMIT $2",
			)
			.bind(&room)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select message_history (postgres)")?,
			Database::Mysql(pool) => sqlx::query_as(
				"SELECT message_id, room_id, sender_id, recipient_id, body, attachment_url, status, created_at_unix_ms \
				FROM message_history WHERE room_id = ? ORDER BY created_at_unix_ms DESC LIMIT ?",
			)
			.bind(&room)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select message_history (mysql)")?,
		};

		rows.reverse();
		rows.into_iter().map(row_to_message).collect()
	}
}

fn row_to_message(row: HistoryRow) -> anyhow::Result<ChatMessage> {
	let (message_id, room_id, sender_id, recipient_id, body, attachment_url, status, created_at_unix_ms) = row;
	Ok(ChatMessage {
		message_id: MessageId::parse(&message_id).context("message_history.message_id")?,
		room_id: RoomId::parse(&room_id).context("message_history.room_id")?,
		sender_id: UserId::parse(&sender_id).context("message_history.sender_id")?,
		recipient_id: recipient_id
			.as_deref()
			.map(UserId::parse)
			.transpose()
			.context("message_history.recipient_id")?,
		body,
		attachment: attachment_url.map(|url| Attachment::Stored { url }),
		created_at_unix_ms,
		status: status.parse::<MessageStatus>().context("message_history.status")?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn sqlite_history() -> (tempfile::TempDir, MessageHistory) {
		let dir = tempfile::tempdir().expect("tempdir");
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("history.db").display());
		let db = Database::connect(&url).await.expect("connect sqlite");
		(dir, MessageHistory::new(db))
	}

	#[tokio::test]
	async fn disabled_history_accepts_appends() {
		let history = MessageHistory::disabled();
		assert!(!history.is_enabled());
		let msg = ChatMessage::new(RoomId::new_v4(), UserId::new_v4(), None, "hi", 1);
		assert_eq!(history.append(&msg).await.expect("append"), msg.message_id);
		assert!(history.recent(msg.room_id, 10).await.expect("recent").is_empty());
	}

	#[tokio::test]
	async fn sqlite_history_keeps_order_and_is_idempotent() {
		let (_dir, history) = sqlite_history().await;
		let room = RoomId::new_v4();
		let sender = UserId::new_v4();

		let first = ChatMessage::new(room, sender, None, "first", 10);
		let second = ChatMessage::new(room, sender, Some(UserId::new_v4()), "second", 20).with_attachment(
			Attachment::Stored {
				url: "/files/a.png".to_string(),
			},
		);

		history.append(&first).await.expect("append first");
		history.append(&second).await.expect("append second");
		history.append(&first).await.expect("append duplicate");

		let got = history.recent(room, 10).await.expect("recent");
		assert_eq!(got, vec![first, second]);
	}

	#[tokio::test]
	async fn inline_attachments_are_refused() {
		let (_dir, history) = sqlite_history().await;
		let msg = ChatMessage::new(RoomId::new_v4(), UserId::new_v4(), None, "raw", 1).with_attachment(
			Attachment::Inline {
				content_type: "image/png".to_string(),
				data: vec![1, 2, 3],
			},
		);
		assert!(history.append(&msg).await.is_err());
	}
}
