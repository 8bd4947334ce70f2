#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use courier_domain::{ChatMessage, RoomId, UserId};
use parking_lot::Mutex;

use super::{OfflineStore, OfflineStoreConfig, record_trimmed};
use crate::server::error::StoreError;

/// Process-local backlog. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryOfflineStore {
	inner: Mutex<HashMap<(RoomId, UserId), VecDeque<ChatMessage>>>,
	cfg: OfflineStoreConfig,
}

impl InMemoryOfflineStore {
	pub fn new(cfg: OfflineStoreConfig) -> Self {
		Self {
			inner: Mutex::new(HashMap::new()),
			cfg,
		}
	}
}

#[async_trait::async_trait]
impl OfflineStore for InMemoryOfflineStore {
	fn backend_name(&self) -> &'static str {
		"memory"
	}

	async fn enqueue(&self, room_id: RoomId, recipient_id: UserId, msg: &ChatMessage) -> Result<(), StoreError> {
		let mut dropped = 0u64;
		{
			let mut inner = self.inner.lock();
			let backlog = inner.entry((room_id, recipient_id)).or_default();
			backlog.push_back(msg.clone());
			if let Some(max) = self.cfg.max_per_recipient {
				while backlog.len() > max {
					backlog.pop_front();
					dropped += 1;
				}
			}
		}

		record_trimmed(self.backend_name(), room_id, recipient_id, dropped);
		Ok(())
	}

	async fn drain(&self, room_id: RoomId, recipient_id: UserId) -> Result<Vec<ChatMessage>, StoreError> {
		let backlog = self.inner.lock().remove(&(room_id, recipient_id)).unwrap_or_default();
		Ok(backlog.into())
	}

	async fn restore(&self, room_id: RoomId, recipient_id: UserId, msgs: &[ChatMessage]) -> Result<(), StoreError> {
		if msgs.is_empty() {
			return Ok(());
		}
		let mut inner = self.inner.lock();
		let backlog = inner.entry((room_id, recipient_id)).or_default();
		for msg in msgs.iter().rev() {
			backlog.push_front(msg.clone());
		}
		Ok(())
	}

	async fn pending(&self, room_id: RoomId, recipient_id: UserId) -> Result<usize, StoreError> {
		Ok(self
			.inner
			.lock()
			.get(&(room_id, recipient_id))
			.map(VecDeque::len)
			.unwrap_or(0))
	}
}
