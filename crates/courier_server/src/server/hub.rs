#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use courier_domain::{ChatMessage, RoomId, UserId};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	/// Another connection registered for the same user and room.
	Superseded,
	ShuttingDown,
}

/// Why a direct delivery did not reach the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
	QueueFull,
	Closed,
}

/// Control state shared by a handle and its connection task. It lives outside
/// the bounded delivery queue, so a full queue never swallows a signal.
#[derive(Debug, Default)]
struct Control {
	backlog_pending: AtomicBool,
	backlog: Notify,
	close_reason: Mutex<Option<CloseReason>>,
	close: Notify,
}

/// Non-owning handle to a live connection. Dropping it never closes the transport.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	conn_id: u64,
	user_id: UserId,
	room_id: RoomId,
	tx: mpsc::Sender<Box<ChatMessage>>,
	control: Arc<Control>,
}

/// Receiving side of a connection: bounded deliveries plus control signals.
#[derive(Debug)]
pub struct Mailbox {
	pub deliveries: mpsc::Receiver<Box<ChatMessage>>,
	pub signals: ControlSignals,
}

/// Out-of-band signals for one connection task.
#[derive(Debug)]
pub struct ControlSignals {
	control: Arc<Control>,
}

/// Create a handle and the mailbox its connection task reads from.
pub fn connection_channel(
	conn_id: u64,
	user_id: UserId,
	room_id: RoomId,
	capacity: usize,
) -> (ConnectionHandle, Mailbox) {
	let (tx, deliveries) = mpsc::channel(capacity.max(1));
	let control = Arc::new(Control::default());
	let handle = ConnectionHandle {
		conn_id,
		user_id,
		room_id,
		tx,
		control: control.clone(),
	};
	let mailbox = Mailbox {
		deliveries,
		signals: ControlSignals { control },
	};
	(handle, mailbox)
}

impl ConnectionHandle {
	pub fn conn_id(&self) -> u64 {
		self.conn_id
	}

	pub fn user_id(&self) -> UserId {
		self.user_id
	}

	pub fn room_id(&self) -> RoomId {
		self.room_id
	}

	/// Hand a copy of `msg` to the connection without waiting.
	pub fn try_deliver(&self, msg: &ChatMessage) -> Result<(), DeliverError> {
		match self.tx.try_send(Box::new(msg.clone())) {
			Ok(()) => Ok(()),
			Err(TrySendError::Full(_)) => Err(DeliverError::QueueFull),
			Err(TrySendError::Closed(_)) => Err(DeliverError::Closed),
		}
	}

	/// Ask the connection to re-drain its backlog. Repeated nudges before the
	/// connection reacts collapse into one drain. Returns `false` once the
	/// connection has stopped reading.
	pub fn nudge_backlog(&self) -> bool {
		if self.is_closed() {
			return false;
		}
		self.control.backlog_pending.store(true, Ordering::Release);
		self.control.backlog.notify_one();
		true
	}

	/// Ask the connection to close. The first reason wins. Returns `false` once
	/// the connection has stopped reading; it is already closing.
	pub fn close(&self, reason: CloseReason) -> bool {
		self.control.close_reason.lock().get_or_insert(reason);
		self.control.close.notify_one();
		!self.is_closed()
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

impl ControlSignals {
	/// Resolves once a backlog drain was requested, consuming the request.
	pub async fn backlog_requested(&self) {
		loop {
			if self.take_backlog_request() {
				return;
			}
			self.control.backlog.notified().await;
		}
	}

	pub fn take_backlog_request(&self) -> bool {
		self.control.backlog_pending.swap(false, Ordering::AcqRel)
	}

	/// Resolves with the reason once a close was requested.
	pub async fn close_requested(&self) -> CloseReason {
		loop {
			if let Some(reason) = self.close_reason() {
				return reason;
			}
			self.control.close.notified().await;
		}
	}

	pub fn close_reason(&self) -> Option<CloseReason> {
		*self.control.close_reason.lock()
	}
}

/// Configuration for `ConnectionHub`.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
	pub debug_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStats {
	pub connections: usize,
	pub rooms: usize,
}

/// Registry of reachable connections keyed by `(user, room)`.
///
/// All access goes through one mutex that is never held across an await.
#[derive(Debug, Clone)]
pub struct ConnectionHub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

#[derive(Debug, Default)]
struct Inner {
	by_key: HashMap<(UserId, RoomId), ConnectionHandle>,
	members_by_room: HashMap<RoomId, BTreeSet<UserId>>,
}

impl ConnectionHub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register `handle`, returning the connection it superseded, if any.
	pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
		let key = (handle.user_id, handle.room_id);
		let conn_id = handle.conn_id;

		let mut inner = self.inner.lock();
		inner.members_by_room.entry(key.1).or_default().insert(key.0);
		let previous = inner.by_key.insert(key, handle);
		let stats = inner.stats();
		drop(inner);

		record_gauges(stats);
		if self.cfg.debug_logs {
			debug!(
				conn_id,
				user_id = %key.0,
				room_id = %key.1,
				superseded = previous.as_ref().map(ConnectionHandle::conn_id),
				"hub: registered"
			);
		}

		previous.filter(|prev| prev.conn_id != conn_id)
	}

	/// Remove the mapping for `(user, room)` if it still belongs to `conn_id`.
	///
	/// Returns `false` when the key is absent or owned by a newer connection.
	pub fn unregister(&self, user_id: UserId, room_id: RoomId, conn_id: u64) -> bool {
		let key = (user_id, room_id);

		let mut inner = self.inner.lock();
		let owned = inner.by_key.get(&key).is_some_and(|h| h.conn_id == conn_id);
		if !owned {
			return false;
		}

		inner.by_key.remove(&key);
		if let Some(members) = inner.members_by_room.get_mut(&room_id) {
			members.remove(&user_id);
			if members.is_empty() {
				inner.members_by_room.remove(&room_id);
			}
		}
		let stats = inner.stats();
		drop(inner);

		record_gauges(stats);
		if self.cfg.debug_logs {
			debug!(conn_id, user_id = %user_id, room_id = %room_id, "hub: unregistered");
		}
		true
	}

	pub fn lookup(&self, user_id: UserId, room_id: RoomId) -> Option<ConnectionHandle> {
		self.inner.lock().by_key.get(&(user_id, room_id)).cloned()
	}

	/// Users with a live connection in `room_id` at call time.
	pub fn room_members(&self, room_id: RoomId) -> BTreeSet<UserId> {
		self.inner
			.lock()
			.members_by_room
			.get(&room_id)
			.cloned()
			.unwrap_or_default()
	}

	/// Handles of every live connection in `room_id` at call time.
	pub fn room_handles(&self, room_id: RoomId) -> Vec<ConnectionHandle> {
		let inner = self.inner.lock();
		let Some(members) = inner.members_by_room.get(&room_id) else {
			return Vec::new();
		};
		members
			.iter()
			.filter_map(|user| inner.by_key.get(&(*user, room_id)).cloned())
			.collect()
	}

	pub fn stats(&self) -> HubStats {
		self.inner.lock().stats()
	}
}

impl Default for ConnectionHub {
	fn default() -> Self {
		Self::new(HubConfig::default())
	}
}

impl Inner {
	fn stats(&self) -> HubStats {
		HubStats {
			connections: self.by_key.len(),
			rooms: self.members_by_room.len(),
		}
	}
}

fn record_gauges(stats: HubStats) {
	metrics::gauge!("courier_server_hub_connections").set(stats.connections as f64);
	metrics::gauge!("courier_server_hub_rooms").set(stats.rooms as f64);
}
