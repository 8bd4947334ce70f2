#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use courier_domain::{Attachment, ChatMessage, MessageId, RoomId, UserId};
use tracing::{debug, warn};

use crate::server::blob::BlobStore;
use crate::server::conversation::ConversationResolver;
use crate::server::error::{RouteError, StoreError};
use crate::server::history::MessageHistory;
use crate::server::hub::ConnectionHub;
use crate::server::offline::OfflineStore;
use crate::server::supervisor::SideEffectSupervisor;

/// Where a routed message ended up, per recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
	pub message_id: MessageId,
	/// Handed to a live connection.
	pub delivered: Vec<UserId>,
	/// Stored in the offline backlog.
	pub queued: Vec<UserId>,
	/// Neither delivered nor stored.
	pub lost: Vec<UserId>,
}

impl RouteOutcome {
	fn new(message_id: MessageId) -> Self {
		Self {
			message_id,
			delivered: Vec::new(),
			queued: Vec::new(),
			lost: Vec::new(),
		}
	}
}

#[derive(Clone)]
struct HistorySink {
	supervisor: SideEffectSupervisor,
	history: MessageHistory,
}

/// Decides, per recipient, between direct delivery and the offline backlog.
#[derive(Clone)]
pub struct MessageRouter {
	hub: ConnectionHub,
	offline: Arc<dyn OfflineStore>,
	blobs: Arc<dyn BlobStore>,
	conversations: ConversationResolver,
	history: Option<HistorySink>,
}

impl std::fmt::Debug for MessageRouter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MessageRouter")
			.field("offline", &self.offline.backend_name())
			.field("conversations", &self.conversations.backend_name())
			.field("history", &self.history.is_some())
			.finish()
	}
}

impl MessageRouter {
	pub fn new(
		hub: ConnectionHub,
		offline: Arc<dyn OfflineStore>,
		blobs: Arc<dyn BlobStore>,
		conversations: ConversationResolver,
	) -> Self {
		Self {
			hub,
			offline,
			blobs,
			conversations,
			history: None,
		}
	}

	/// Record every routed message through `supervisor`.
	pub fn with_history(mut self, supervisor: SideEffectSupervisor, history: MessageHistory) -> Self {
		self.history = Some(HistorySink { supervisor, history });
		self
	}

	pub fn hub(&self) -> &ConnectionHub {
		&self.hub
	}

	pub fn offline(&self) -> &Arc<dyn OfflineStore> {
		&self.offline
	}

	pub fn conversations(&self) -> &ConversationResolver {
		&self.conversations
	}

	pub async fn route(&self, mut msg: ChatMessage) -> Result<RouteOutcome, RouteError> {
		self.resolve_attachment(&mut msg).await?;

		let mut outcome = RouteOutcome::new(msg.message_id);
		match msg.recipient_id {
			Some(recipient) => self.route_to(recipient, &msg, &mut outcome).await,
			None => {
				for recipient in self.broadcast_targets(&msg).await {
					self.route_to(recipient, &msg, &mut outcome).await;
				}
			}
		}

		self.record_history(&msg);

		metrics::counter!("courier_server_messages_routed_total").increment(1);
		debug!(
			message_id = %msg.message_id,
			room_id = %msg.room_id,
			sender_id = %msg.sender_id,
			broadcast = msg.is_broadcast(),
			delivered = outcome.delivered.len(),
			queued = outcome.queued.len(),
			lost = outcome.lost.len(),
			"message routed"
		);
		Ok(outcome)
	}

	/// Store `msg` for `recipient` and nudge the recipient if it is online, either
	/// because it registered meanwhile or because its outbound queue was full.
	pub async fn enqueue_with_recheck(
		&self,
		room_id: RoomId,
		recipient: UserId,
		msg: &ChatMessage,
	) -> Result<(), StoreError> {
		if let Err(err) = self.offline.enqueue(room_id, recipient, msg).await {
			warn!(
				%room_id,
				recipient_id = %recipient,
				message_id = %msg.message_id,
				backend = self.offline.backend_name(),
				error = %err,
				"offline enqueue failed; message lost"
			);
			metrics::counter!("courier_server_offline_enqueue_failures_total").increment(1);
			return Err(err);
		}
		metrics::counter!("courier_server_offline_enqueued_total").increment(1);

		// The recipient may have registered and drained between our lookup and
		// the enqueue above.
		if let Some(handle) = self.hub.lookup(recipient, room_id)
			&& handle.nudge_backlog()
		{
			debug!(%room_id, recipient_id = %recipient, conn_id = handle.conn_id(), "backlog nudge sent");
		}
		Ok(())
	}

	async fn route_to(&self, recipient: UserId, msg: &ChatMessage, outcome: &mut RouteOutcome) {
		if let Some(handle) = self.hub.lookup(recipient, msg.room_id) {
			match handle.try_deliver(msg) {
				Ok(()) => {
					metrics::counter!("courier_server_messages_delivered_total").increment(1);
					outcome.delivered.push(recipient);
					return;
				}
				Err(err) => {
					debug!(
						recipient_id = %recipient,
						conn_id = handle.conn_id(),
						error = ?err,
						"direct delivery failed; falling back to offline"
					);
					metrics::counter!("courier_server_direct_delivery_failures_total").increment(1);
				}
			}
		}

		match self.enqueue_with_recheck(msg.room_id, recipient, msg).await {
			Ok(()) => outcome.queued.push(recipient),
			Err(_) => outcome.lost.push(recipient),
		}
	}

	async fn broadcast_targets(&self, msg: &ChatMessage) -> BTreeSet<UserId> {
		let mut targets = match self.conversations.participants(msg.room_id).await {
			Ok(participants) => participants,
			Err(err) => {
				warn!(
					room_id = %msg.room_id,
					error = %err,
					"participant lookup failed; broadcasting to online members only"
				);
				metrics::counter!("courier_server_participant_lookup_failures_total").increment(1);
				BTreeSet::new()
			}
		};
		targets.extend(self.hub.room_members(msg.room_id));
		targets.remove(&msg.sender_id);
		targets
	}

	async fn resolve_attachment(&self, msg: &mut ChatMessage) -> Result<(), RouteError> {
		match msg.attachment.take() {
			Some(Attachment::Inline { content_type, data }) => {
				let len = data.len();
				let url = self
					.blobs
					.upload(msg.sender_id, data, &content_type)
					.await
					.inspect_err(|err| {
						warn!(
							message_id = %msg.message_id,
							sender_id = %msg.sender_id,
							len,
							error = %err,
							"attachment upload failed; message dropped"
						);
						metrics::counter!("courier_server_attachment_upload_failures_total").increment(1);
					})?;
				msg.attachment = Some(Attachment::Stored { url });
			}
			other => msg.attachment = other,
		}
		Ok(())
	}

	fn record_history(&self, msg: &ChatMessage) {
		let Some(sink) = &self.history else {
			return;
		};
		let history = sink.history.clone();
		let msg = msg.clone();
		sink.supervisor.submit("history.append", async move {
			history.append(&msg).await.map(|_| ())
		});
	}
}
