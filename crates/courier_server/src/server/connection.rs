#![forbid(unsafe_code)]

//! Per-connection lifecycle: handshake, registration, backlog replay, the
//! active loop and cleanup.
//!
//! The transport is abstracted as a [`FrameSink`] for writes and an
//! [`Inbound`] channel for reads, so the same state machine runs over QUIC and
//! over in-process channels in tests.

use std::time::Duration;

use courier_domain::{ChatMessage, MessageStatus, RoomId, UserId};
use courier_protocol::{
	ClientFrame, DEFAULT_MAX_FRAME_SIZE, DeliveredMessage, Hello, SendMessage, ServerFrame, Welcome, error_codes,
	parse_file_field,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::server::auth::IdentityVerifier;
use crate::server::error::{ConversationError, IdentityError, RouteError};
use crate::server::hub::{CloseReason, ConnectionHandle, ConnectionHub, Mailbox, connection_channel};
use crate::server::router::MessageRouter;
use crate::util::time::unix_ms_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
	Connecting,
	Active,
	Closing,
	Closed,
}

impl ConnectionPhase {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionPhase::Connecting => "connecting",
			ConnectionPhase::Active => "active",
			ConnectionPhase::Closing => "closing",
			ConnectionPhase::Closed => "closed",
		}
	}
}

/// Write half of a client transport.
#[async_trait::async_trait]
pub trait FrameSink: Send {
	async fn send(&mut self, frame: &ServerFrame) -> anyhow::Result<()>;

	/// Close the transport. Must not fail.
	async fn close(&mut self);
}

/// Read-side events produced by a transport reader task.
///
/// The reader closes its channel on EOF or on an unrecoverable read error.
#[derive(Debug)]
pub enum Inbound {
	Frame(ClientFrame),
	/// A complete frame whose payload did not decode.
	Malformed(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub server_name: String,
	pub handshake_timeout: Duration,
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			server_name: "courier".to_string(),
			handshake_timeout: Duration::from_secs(5),
			outbound_queue_capacity: 256,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

impl ConnectionSettings {
	pub fn from_config(cfg: &ServerConfig) -> Self {
		Self {
			server_name: cfg.server.server_name.clone(),
			handshake_timeout: cfg.server.handshake_timeout,
			outbound_queue_capacity: cfg.server.outbound_queue_capacity,
			max_frame_bytes: cfg.server.max_frame_bytes,
		}
	}
}

/// Everything a connection task needs, shared by all connections.
#[derive(Debug, Clone)]
pub struct ServerContext {
	pub router: MessageRouter,
	pub identity: IdentityVerifier,
	pub settings: ConnectionSettings,
}

impl ServerContext {
	pub fn hub(&self) -> &ConnectionHub {
		self.router.hub()
	}
}

/// Unregisters exactly once, explicitly or on drop.
struct RegistrationGuard {
	hub: ConnectionHub,
	user_id: UserId,
	room_id: RoomId,
	conn_id: u64,
	registered: bool,
}

impl RegistrationGuard {
	fn register(hub: ConnectionHub, handle: ConnectionHandle) -> (Self, Option<ConnectionHandle>) {
		let guard = Self {
			hub: hub.clone(),
			user_id: handle.user_id(),
			room_id: handle.room_id(),
			conn_id: handle.conn_id(),
			registered: true,
		};
		let superseded = hub.register(handle);
		(guard, superseded)
	}

	fn release(&mut self) -> bool {
		if !std::mem::replace(&mut self.registered, false) {
			return false;
		}
		self.hub.unregister(self.user_id, self.room_id, self.conn_id)
	}
}

impl Drop for RegistrationGuard {
	fn drop(&mut self) {
		self.release();
	}
}

struct Session {
	conn_id: u64,
	user_id: UserId,
	room_id: RoomId,
	client_name: Option<String>,
}

/// Why the active loop stopped.
enum Exit {
	ClientGone,
	WriteFailed,
	Closed(CloseReason),
}

fn enter(conn_id: u64, phase: &mut ConnectionPhase, next: ConnectionPhase) {
	debug!(conn_id, from = phase.as_str(), to = next.as_str(), "connection phase");
	metrics::counter!("courier_server_connection_phase_total", "phase" => next.as_str()).increment(1);
	*phase = next;
}

/// Drive one client connection from handshake to close.
pub async fn serve_connection<S: FrameSink>(
	conn_id: u64,
	mut sink: S,
	mut inbound: mpsc::Receiver<Inbound>,
	ctx: ServerContext,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut phase = ConnectionPhase::Connecting;
	metrics::counter!("courier_server_connections_total").increment(1);

	let Some(session) = handshake(conn_id, &mut sink, &mut inbound, &ctx, &mut shutdown).await else {
		enter(conn_id, &mut phase, ConnectionPhase::Closed);
		sink.close().await;
		return;
	};

	enter(conn_id, &mut phase, ConnectionPhase::Active);
	let (handle, mut mailbox) = connection_channel(
		conn_id,
		session.user_id,
		session.room_id,
		ctx.settings.outbound_queue_capacity,
	);
	let (mut guard, superseded) = RegistrationGuard::register(ctx.hub().clone(), handle);
	if let Some(previous) = superseded {
		info!(
			conn_id,
			superseded_conn_id = previous.conn_id(),
			user_id = %session.user_id,
			room_id = %session.room_id,
			"superseding previous connection"
		);
		previous.close(CloseReason::Superseded);
	}

	info!(
		conn_id,
		user_id = %session.user_id,
		room_id = %session.room_id,
		client_name = session.client_name.as_deref().unwrap_or("-"),
		"client connected"
	);

	if let Err(err) = ctx.router.conversations().join(session.room_id, session.user_id).await {
		warn!(conn_id, room_id = %session.room_id, error = %err, "participant join failed");
	}

	let mut unsent: Option<Box<ChatMessage>> = None;
	let exit = match send_welcome(&mut sink, &session, &ctx).await {
		Err(_) => Exit::WriteFailed,
		Ok(()) => match replay_backlog(&mut sink, &session, &ctx).await {
			Err(()) => Exit::WriteFailed,
			Ok(()) => {
				active_loop(
					&mut sink,
					&mut inbound,
					&mut mailbox,
					&session,
					&ctx,
					&mut shutdown,
					&mut unsent,
				)
				.await
			}
		},
	};

	enter(conn_id, &mut phase, ConnectionPhase::Closing);
	match exit {
		Exit::Closed(reason) => {
			let (code, message) = match reason {
				CloseReason::Superseded => (error_codes::SUPERSEDED, "another connection joined as this user"),
				CloseReason::ShuttingDown => (error_codes::SHUTTING_DOWN, "server is shutting down"),
			};
			let _ = sink.send(&ServerFrame::error(code, message)).await;
		}
		Exit::WriteFailed => {
			metrics::counter!("courier_server_connection_write_failures_total").increment(1);
		}
		Exit::ClientGone => {}
	}

	guard.release();
	mailbox.deliveries.close();
	let mut residual = unsent.into_iter().collect::<Vec<_>>();
	while let Ok(msg) = mailbox.deliveries.try_recv() {
		residual.push(msg);
	}
	for msg in residual {
		// Failures are logged and metered by the router.
		let _ = ctx
			.router
			.enqueue_with_recheck(session.room_id, session.user_id, &msg)
			.await;
	}

	sink.close().await;
	enter(conn_id, &mut phase, ConnectionPhase::Closed);
	info!(conn_id, user_id = %session.user_id, room_id = %session.room_id, "client disconnected");
}

async fn handshake<S: FrameSink>(
	conn_id: u64,
	sink: &mut S,
	inbound: &mut mpsc::Receiver<Inbound>,
	ctx: &ServerContext,
	shutdown: &mut watch::Receiver<bool>,
) -> Option<Session> {
	let first = tokio::select! {
		res = tokio::time::timeout(ctx.settings.handshake_timeout, inbound.recv()) => match res {
			Ok(item) => item,
			Err(_) => {
				debug!(conn_id, "handshake timed out");
				metrics::counter!("courier_server_handshake_failures_total", "reason" => "timeout").increment(1);
				return None;
			}
		},
		_ = shutdown.changed() => return None,
	};

	let hello = match first {
		Some(Inbound::Frame(ClientFrame::Hello(hello))) => hello,
		Some(other) => {
			debug!(conn_id, first = ?other, "first frame was not hello");
			metrics::counter!("courier_server_handshake_failures_total", "reason" => "no_hello").increment(1);
			let _ = sink
				.send(&ServerFrame::error(
					error_codes::HANDSHAKE_REQUIRED,
					"first frame must be hello",
				))
				.await;
			return None;
		}
		None => return None,
	};

	match identify(&hello, ctx).await {
		Ok((user_id, room_id)) => Some(Session {
			conn_id,
			user_id,
			room_id,
			client_name: hello.client_name,
		}),
		Err(err) => {
			warn!(conn_id, error = %err, "handshake rejected");
			metrics::counter!("courier_server_handshake_failures_total", "reason" => err.code()).increment(1);
			let _ = sink.send(&ServerFrame::error(err.code(), err.to_string())).await;
			None
		}
	}
}

async fn identify(hello: &Hello, ctx: &ServerContext) -> Result<(UserId, RoomId), IdentityError> {
	let user_id = ctx.identity.verify(hello)?;

	let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

	if let Some(raw) = non_empty(&hello.room_id) {
		let room_id = RoomId::parse(&raw).map_err(|source| IdentityError::InvalidId {
			field: "room_id",
			source,
		})?;
		return Ok((user_id, room_id));
	}

	let Some(raw_peer) = non_empty(&hello.peer_id) else {
		return Err(IdentityError::MissingRoom);
	};
	let peer = UserId::parse(&raw_peer).map_err(|source| IdentityError::InvalidId {
		field: "peer_id",
		source,
	})?;

	match ctx.router.conversations().find_or_create(user_id, peer).await {
		Ok(room_id) => Ok((user_id, room_id)),
		Err(ConversationError::InvalidPair(source)) => Err(IdentityError::InvalidId {
			field: "peer_id",
			source,
		}),
		Err(ConversationError::Store(err)) => Err(IdentityError::Room(err)),
	}
}

async fn send_welcome<S: FrameSink>(sink: &mut S, session: &Session, ctx: &ServerContext) -> anyhow::Result<()> {
	let welcome = ServerFrame::Welcome(Welcome {
		user_id: session.user_id,
		room_id: session.room_id,
		server_name: ctx.settings.server_name.clone(),
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: ctx.settings.max_frame_bytes as u64,
	});
	sink.send(&welcome).await.inspect_err(|err| {
		debug!(conn_id = session.conn_id, error = %err, "welcome write failed");
	})
}

/// Drain and push the backlog. On a write failure the unsent rest goes back to
/// the head of the backlog.
async fn replay_backlog<S: FrameSink>(sink: &mut S, session: &Session, ctx: &ServerContext) -> Result<(), ()> {
	let offline = ctx.router.offline();
	let backlog = match offline.drain(session.room_id, session.user_id).await {
		Ok(backlog) => backlog,
		Err(err) => {
			warn!(
				conn_id = session.conn_id,
				backend = offline.backend_name(),
				error = %err,
				"backlog drain failed; messages stay stored"
			);
			metrics::counter!("courier_server_offline_drain_failures_total").increment(1);
			return Ok(());
		}
	};
	if backlog.is_empty() {
		return Ok(());
	}

	debug!(conn_id = session.conn_id, count = backlog.len(), "replaying backlog");
	for (idx, msg) in backlog.iter().enumerate() {
		if write_delivery(sink, msg).await.is_err() {
			restore_unsent(session, ctx, &backlog[idx..]).await;
			return Err(());
		}
	}
	metrics::counter!("courier_server_offline_replayed_total").increment(backlog.len() as u64);
	Ok(())
}

async fn restore_unsent(session: &Session, ctx: &ServerContext, unsent: &[ChatMessage]) {
	let offline = ctx.router.offline();
	let Err(err) = offline.restore(session.room_id, session.user_id, unsent).await else {
		return;
	};
	warn!(
		conn_id = session.conn_id,
		backend = offline.backend_name(),
		count = unsent.len(),
		error = %err,
		"could not restore unsent backlog at its head; appending instead"
	);
	for msg in unsent {
		if let Err(err) = offline.enqueue(session.room_id, session.user_id, msg).await {
			warn!(
				conn_id = session.conn_id,
				message_id = %msg.message_id,
				error = %err,
				"could not store unsent backlog entry"
			);
		}
	}
}

async fn write_delivery<S: FrameSink>(sink: &mut S, msg: &ChatMessage) -> anyhow::Result<()> {
	let mut frame = DeliveredMessage::from(msg);
	frame.status = MessageStatus::Delivered;
	sink.send(&ServerFrame::Message(frame)).await
}

async fn active_loop<S: FrameSink>(
	sink: &mut S,
	inbound: &mut mpsc::Receiver<Inbound>,
	mailbox: &mut Mailbox,
	session: &Session,
	ctx: &ServerContext,
	shutdown: &mut watch::Receiver<bool>,
	unsent: &mut Option<Box<ChatMessage>>,
) -> Exit {
	if *shutdown.borrow() {
		return Exit::Closed(CloseReason::ShuttingDown);
	}

	loop {
		tokio::select! {
			biased;

			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					return Exit::Closed(CloseReason::ShuttingDown);
				}
			}

			reason = mailbox.signals.close_requested() => return Exit::Closed(reason),

			item = mailbox.deliveries.recv() => match item {
				Some(msg) => {
					if let Err(err) = write_delivery(sink, &msg).await {
						debug!(conn_id = session.conn_id, error = %err, "delivery write failed");
						*unsent = Some(msg);
						return Exit::WriteFailed;
					}
				}
				None => return Exit::ClientGone,
			},

			() = mailbox.signals.backlog_requested() => {
				if replay_backlog(sink, session, ctx).await.is_err() {
					return Exit::WriteFailed;
				}
			}

			event = inbound.recv() => match event {
				Some(Inbound::Frame(frame)) => {
					if handle_frame(sink, frame, session, ctx).await.is_err() {
						return Exit::WriteFailed;
					}
				}
				Some(Inbound::Malformed(reason)) => {
					reject_frame(sink, session, error_codes::MALFORMED_FRAME, reason).await;
				}
				None => return Exit::ClientGone,
			},
		}
	}
}

async fn handle_frame<S: FrameSink>(
	sink: &mut S,
	frame: ClientFrame,
	session: &Session,
	ctx: &ServerContext,
) -> anyhow::Result<()> {
	match frame {
		ClientFrame::Message(send) => {
			let msg = match build_message(send, session) {
				Ok(msg) => msg,
				Err((code, reason)) => {
					reject_frame(sink, session, code, reason).await;
					return Ok(());
				}
			};
			if let Err((code, reason)) = check_room_override(&msg, session, ctx).await {
				reject_frame(sink, session, code, reason).await;
				return Ok(());
			}

			match ctx.router.route(msg).await {
				Ok(outcome) => {
					sink.send(&ServerFrame::Ack {
						message_id: outcome.message_id,
						delivered: outcome.delivered.len() as u32,
						queued: outcome.queued.len() as u32,
					})
					.await
				}
				Err(RouteError::Attachment(err)) => {
					let _ = sink
						.send(&ServerFrame::error(error_codes::UPLOAD_FAILED, err.to_string()))
						.await;
					Ok(())
				}
			}
		}
		ClientFrame::Ping { nonce } => {
			sink.send(&ServerFrame::Pong {
				nonce,
				server_time_unix_ms: unix_ms_now(),
			})
			.await
		}
		ClientFrame::Hello(_) => {
			reject_frame(sink, session, error_codes::MALFORMED_FRAME, "already identified".to_string()).await;
			Ok(())
		}
	}
}

/// A message may name another room than the session's, but only one the
/// sender participates in.
async fn check_room_override(
	msg: &ChatMessage,
	session: &Session,
	ctx: &ServerContext,
) -> Result<(), (&'static str, String)> {
	if msg.room_id == session.room_id {
		return Ok(());
	}
	match ctx.router.conversations().participants(msg.room_id).await {
		Ok(participants) if participants.contains(&session.user_id) => {
			debug!(
				conn_id = session.conn_id,
				session_room = %session.room_id,
				room_id = %msg.room_id,
				"message addressed to another room"
			);
			Ok(())
		}
		Ok(_) => Err((
			error_codes::NOT_A_PARTICIPANT,
			format!("not a participant of room {}", msg.room_id),
		)),
		Err(err) => Err((error_codes::ROOM_UNAVAILABLE, err.to_string())),
	}
}

/// Drop a bad frame without closing the connection.
async fn reject_frame<S: FrameSink>(sink: &mut S, session: &Session, code: &'static str, reason: String) {
	warn!(conn_id = session.conn_id, user_id = %session.user_id, code, reason = %reason, "frame dropped");
	metrics::counter!("courier_server_frames_rejected_total", "code" => code).increment(1);
	let _ = sink.send(&ServerFrame::error(code, reason)).await;
}

fn build_message(send: SendMessage, session: &Session) -> Result<ChatMessage, (&'static str, String)> {
	if let Some(from) = send.from
		&& from != session.user_id
	{
		debug!(conn_id = session.conn_id, claimed = %from, "ignoring client-supplied sender");
	}

	let file = send.file.as_deref().map(str::trim).filter(|f| !f.is_empty());
	if send.body.trim().is_empty() && file.is_none() {
		return Err((error_codes::MALFORMED_FRAME, "empty message".to_string()));
	}

	let room_id = send.chat_room_id.unwrap_or(session.room_id);
	let msg = ChatMessage::new(room_id, session.user_id, send.to, send.body, unix_ms_now());
	match file {
		Some(raw) => {
			let attachment = parse_file_field(raw).map_err(|e| (error_codes::INVALID_ATTACHMENT, e.to_string()))?;
			Ok(msg.with_attachment(attachment))
		}
		None => Ok(msg),
	}
}
