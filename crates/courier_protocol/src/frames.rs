#![forbid(unsafe_code)]

use courier_domain::{ChatMessage, MessageId, MessageStatus, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	/// Must be the first frame on a new stream.
	Hello(Hello),
	Message(SendMessage),
	Ping {
		#[serde(default)]
		nonce: u64,
	},
}

/// Handshake frame.
///
/// Ids stay strings here so a malformed id can be answered with an
/// `invalid_identity` error instead of a generic decode failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hello {
	#[serde(default)]
	pub user_id: Option<String>,
	/// Room to join. Takes precedence over `peer_id`.
	#[serde(default)]
	pub room_id: Option<String>,
	/// Join the two-party conversation with this user.
	#[serde(default)]
	pub peer_id: Option<String>,
	#[serde(default)]
	pub auth_token: Option<String>,
	#[serde(default)]
	pub client_name: Option<String>,
}

/// A message submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
	/// Ignored by the server; the connection identity is authoritative.
	#[serde(default)]
	pub from: Option<UserId>,
	/// `None` fans out to the room.
	#[serde(default)]
	pub to: Option<UserId>,
	/// Defaults to the room the connection joined.
	#[serde(default)]
	pub chat_room_id: Option<RoomId>,
	#[serde(default)]
	pub body: String,
	/// `data:<mime>;base64,<data>` or bare base64.
	#[serde(default)]
	pub file: Option<String>,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	Welcome(Welcome),
	Message(DeliveredMessage),
	Ack {
		message_id: MessageId,
		delivered: u32,
		queued: u32,
	},
	Pong {
		nonce: u64,
		server_time_unix_ms: i64,
	},
	Error(ErrorFrame),
}

impl ServerFrame {
	pub fn error(code: &str, message: impl Into<String>) -> Self {
		ServerFrame::Error(ErrorFrame {
			code: code.to_string(),
			message: message.into(),
		})
	}

	pub fn message(msg: &ChatMessage) -> Self {
		ServerFrame::Message(DeliveredMessage::from(msg))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
	pub user_id: UserId,
	pub room_id: RoomId,
	pub server_name: String,
	pub server_time_unix_ms: i64,
	pub max_frame_bytes: u64,
}

/// A message as seen by a recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredMessage {
	pub message_id: MessageId,
	pub from: UserId,
	pub to: Option<UserId>,
	pub chat_room_id: RoomId,
	pub body: String,
	/// Retrievable attachment URL.
	pub file: Option<String>,
	pub created_at_unix_ms: i64,
	pub status: MessageStatus,
}

impl From<&ChatMessage> for DeliveredMessage {
	fn from(msg: &ChatMessage) -> Self {
		Self {
			message_id: msg.message_id,
			from: msg.sender_id,
			to: msg.recipient_id,
			chat_room_id: msg.room_id,
			body: msg.body.clone(),
			file: msg.attachment_url().map(str::to_string),
			created_at_unix_ms: msg.created_at_unix_ms,
			status: msg.status,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
	pub code: String,
	pub message: String,
}

/// Stable `ErrorFrame::code` values.
pub mod error_codes {
	pub const INVALID_IDENTITY: &str = "invalid_identity";
	pub const UNAUTHORIZED: &str = "unauthorized";
	pub const HANDSHAKE_REQUIRED: &str = "handshake_required";
	pub const ROOM_UNAVAILABLE: &str = "room_unavailable";
	pub const NOT_A_PARTICIPANT: &str = "not_a_participant";
	pub const MALFORMED_FRAME: &str = "malformed_frame";
	pub const INVALID_ATTACHMENT: &str = "invalid_attachment";
	pub const UPLOAD_FAILED: &str = "upload_failed";
	pub const SUPERSEDED: &str = "superseded";
	pub const SHUTTING_DOWN: &str = "shutting_down";
}
