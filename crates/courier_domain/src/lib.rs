#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("a conversation needs two distinct participants")]
	SameParticipant,
}

macro_rules! uuid_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub uuid::Uuid);

		impl $name {
			/// Create a new random id.
			pub fn new_v4() -> Self {
				Self(uuid::Uuid::new_v4())
			}

			pub const fn from_uuid(id: uuid::Uuid) -> Self {
				Self(id)
			}

			/// Parse a hyphenated or simple uuid string.
			pub fn parse(s: &str) -> Result<Self, ParseIdError> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				uuid::Uuid::parse_str(s)
					.map(Self)
					.map_err(|_| ParseIdError::InvalidFormat(s.to_string()))
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::parse(s)
			}
		}
	};
}

uuid_id! {
	/// Stable user identifier handed out by the identity service.
	UserId
}

uuid_id! {
	/// Chat room identifier. Two-party rooms are minted by the conversation resolver.
	RoomId
}

uuid_id! {
	/// Server-assigned message identifier.
	MessageId
}

/// Canonical identity of a two-party conversation.
///
/// The pair is stored sorted, so `new(a, b)` and `new(b, a)` compare equal and
/// produce the same `storage_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
	low: UserId,
	high: UserId,
}

impl ConversationKey {
	pub fn new(a: UserId, b: UserId) -> Result<Self, ParseIdError> {
		if a == b {
			return Err(ParseIdError::SameParticipant);
		}
		let (low, high) = if a < b { (a, b) } else { (b, a) };
		Ok(Self { low, high })
	}

	pub fn participants(&self) -> (UserId, UserId) {
		(self.low, self.high)
	}

	pub fn contains(&self, user: &UserId) -> bool {
		self.low == *user || self.high == *user
	}

	/// The other participant, if `user` is part of this conversation.
	pub fn peer_of(&self, user: &UserId) -> Option<UserId> {
		if self.low == *user {
			Some(self.high)
		} else if self.high == *user {
			Some(self.low)
		} else {
			None
		}
	}

	/// Deterministic string form used as a unique column value.
	pub fn storage_key(&self) -> String {
		format!("{}:{}", self.low, self.high)
	}

	/// Inverse of `storage_key`; accepts either order.
	pub fn from_storage_key(s: &str) -> Result<Self, ParseIdError> {
		let (a, b) = s
			.trim()
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected <user>:<user>".into()))?;
		Self::new(UserId::parse(a)?, UserId::parse(b)?)
	}
}

impl fmt::Display for ConversationKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.low, self.high)
	}
}

/// Delivery status carried on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
	#[default]
	Sent,
	Delivered,
	Read,
}

impl MessageStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageStatus::Sent => "sent",
			MessageStatus::Delivered => "delivered",
			MessageStatus::Read => "read",
		}
	}
}

impl fmt::Display for MessageStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageStatus {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"sent" => Ok(MessageStatus::Sent),
			"delivered" => Ok(MessageStatus::Delivered),
			"read" => Ok(MessageStatus::Read),
			other => Err(ParseIdError::InvalidFormat(other.to_string())),
		}
	}
}

/// Message attachment.
///
/// `Inline` only exists between frame decode and routing; everything written to
/// a connection, the offline store or history carries `Stored`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
	Inline { content_type: String, data: Vec<u8> },
	Stored { url: String },
}

impl Attachment {
	pub fn url(&self) -> Option<&str> {
		match self {
			Attachment::Stored { url } => Some(url),
			Attachment::Inline { .. } => None,
		}
	}

	pub fn is_inline(&self) -> bool {
		matches!(self, Attachment::Inline { .. })
	}
}

impl fmt::Debug for Attachment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Attachment::Inline { content_type, data } => f
				.debug_struct("Inline")
				.field("content_type", content_type)
				.field("len", &data.len())
				.finish(),
			Attachment::Stored { url } => f.debug_struct("Stored").field("url", url).finish(),
		}
	}
}

/// A chat message as it moves through routing, the offline backlog and history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub message_id: MessageId,
	pub room_id: RoomId,
	pub sender_id: UserId,
	/// `Some` routes point-to-point, `None` fans out to the room.
	pub recipient_id: Option<UserId>,
	pub body: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub attachment: Option<Attachment>,
	pub created_at_unix_ms: i64,
	#[serde(default)]
	pub status: MessageStatus,
}

impl ChatMessage {
	pub fn new(
		room_id: RoomId,
		sender_id: UserId,
		recipient_id: Option<UserId>,
		body: impl Into<String>,
		created_at_unix_ms: i64,
	) -> Self {
		Self {
			message_id: MessageId::new_v4(),
			room_id,
			sender_id,
			recipient_id,
			body: body.into(),
			attachment: None,
			created_at_unix_ms,
			status: MessageStatus::Sent,
		}
	}

	pub fn with_attachment(mut self, attachment: Attachment) -> Self {
		self.attachment = Some(attachment);
		self
	}

	pub fn is_broadcast(&self) -> bool {
		self.recipient_id.is_none()
	}

	pub fn attachment_url(&self) -> Option<&str> {
		self.attachment.as_ref().and_then(Attachment::url)
	}

	pub fn has_inline_attachment(&self) -> bool {
		self.attachment.as_ref().is_some_and(Attachment::is_inline)
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
