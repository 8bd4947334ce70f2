#![forbid(unsafe_code)]

//! Offline backlog: messages held for recipients without a live connection.
//!
//! Every backend drains with an atomic fetch-and-clear, so a message is handed
//! to exactly one successful `drain` call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use courier_domain::{ChatMessage, RoomId, UserId};
use tracing::{info, warn};

use crate::config::{OfflineBackendKind, OfflineSettings};
use crate::server::db::Database;
use crate::server::error::StoreError;

mod memory;
mod redis_list;
mod sql;

pub use memory::InMemoryOfflineStore;
pub use redis_list::RedisOfflineStore;
pub use sql::SqlOfflineStore;

#[async_trait::async_trait]
pub trait OfflineStore: Send + Sync {
	fn backend_name(&self) -> &'static str;

	/// Append `msg` to the backlog of `(room_id, recipient_id)`.
	async fn enqueue(&self, room_id: RoomId, recipient_id: UserId, msg: &ChatMessage) -> Result<(), StoreError>;

	/// Remove and return the whole backlog in enqueue order.
	async fn drain(&self, room_id: RoomId, recipient_id: UserId) -> Result<Vec<ChatMessage>, StoreError>;

	/// Put `msgs` back at the head of the backlog, ahead of anything enqueued
	/// since they were drained. Used when a replay is cut short.
	async fn restore(&self, room_id: RoomId, recipient_id: UserId, msgs: &[ChatMessage]) -> Result<(), StoreError>;

	/// Backlog length without consuming it.
	async fn pending(&self, room_id: RoomId, recipient_id: UserId) -> Result<usize, StoreError>;
}

/// Backlog bounds. Both are off by default: an entry stays until a drain
/// consumes it.
#[derive(Debug, Clone, Default)]
pub struct OfflineStoreConfig {
	/// Oldest entries are dropped past this many per `(room, recipient)`.
	pub max_per_recipient: Option<usize>,
	/// Redis only: the backlog key expires this long after its last write.
	pub ttl: Option<Duration>,
}

impl From<&OfflineSettings> for OfflineStoreConfig {
	fn from(settings: &OfflineSettings) -> Self {
		Self {
			max_per_recipient: settings.max_per_recipient.filter(|max| *max > 0),
			ttl: settings.ttl.filter(|ttl| !ttl.is_zero()),
		}
	}
}

/// Open the configured backend. `db` is required for the `sql` backend.
pub async fn open_offline_store(
	settings: &OfflineSettings,
	db: Option<&Database>,
) -> anyhow::Result<Arc<dyn OfflineStore>> {
	let cfg = OfflineStoreConfig::from(settings);

	let store: Arc<dyn OfflineStore> = match settings.backend {
		OfflineBackendKind::Memory => Arc::new(InMemoryOfflineStore::new(cfg)),
		OfflineBackendKind::Redis => {
			let Some(url) = settings.redis_url.as_deref() else {
				return Err(anyhow!("offline backend is redis but no redis_url configured"));
			};
			Arc::new(RedisOfflineStore::connect(url, cfg).await?)
		}
		OfflineBackendKind::Sql => {
			let Some(db) = db else {
				return Err(anyhow!("offline backend is sql but no database configured"));
			};
			Arc::new(SqlOfflineStore::new(db.clone(), cfg))
		}
	};

	info!(backend = store.backend_name(), "offline store ready");
	Ok(store)
}

pub(crate) fn encode_entry(msg: &ChatMessage) -> Result<String, StoreError> {
	serde_json::to_string(msg).map_err(|e| StoreError::Corrupt(format!("encode offline entry: {e}")))
}

/// Decode drained payloads. Entries are already removed from the store, so a
/// corrupt one is logged and skipped rather than failing the whole drain.
pub(crate) fn decode_entries<'a>(backend: &'static str, payloads: impl IntoIterator<Item = &'a str>) -> Vec<ChatMessage> {
	payloads
		.into_iter()
		.filter_map(|payload| match serde_json::from_str::<ChatMessage>(payload) {
			Ok(msg) => Some(msg),
			Err(e) => {
				warn!(backend, error = %e, "offline store: dropping undecodable entry");
				metrics::counter!("courier_server_offline_corrupt_total", "backend" => backend).increment(1);
				None
			}
		})
		.collect()
}

pub(crate) fn record_trimmed(backend: &'static str, room_id: RoomId, recipient_id: UserId, dropped: u64) {
	if dropped == 0 {
		return;
	}
	warn!(
		backend,
		room_id = %room_id,
		recipient_id = %recipient_id,
		dropped,
		"offline store: backlog over cap; dropped oldest entries"
	);
	metrics::counter!("courier_server_offline_dropped_total", "backend" => backend).increment(dropped);
}
