#![forbid(unsafe_code)]

use std::fmt;

use courier_domain::ParseIdError;
use courier_protocol::error_codes;
use thiserror::Error;

/// Failure of a backing store (offline backlog, conversations).
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("{backend} unavailable: {detail}")]
	Unavailable { backend: &'static str, detail: String },

	#[error("stored record is corrupt: {0}")]
	Corrupt(String),
}

impl StoreError {
	pub fn unavailable(backend: &'static str, err: impl fmt::Display) -> Self {
		StoreError::Unavailable {
			backend,
			detail: err.to_string(),
		}
	}

	/// Transient failures; the same call may succeed later.
	pub fn is_retryable(&self) -> bool {
		matches!(self, StoreError::Unavailable { .. })
	}
}

#[derive(Debug, Error)]
pub enum ConversationError {
	#[error("invalid conversation pair: {0}")]
	InvalidPair(#[from] ParseIdError),

	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Handshake could not establish who is connecting or where.
#[derive(Debug, Error)]
pub enum IdentityError {
	#[error("missing user id")]
	MissingUserId,

	#[error("missing room (room_id or peer_id required)")]
	MissingRoom,

	#[error("invalid {field}: {source}")]
	InvalidId {
		field: &'static str,
		#[source]
		source: ParseIdError,
	},

	#[error("unauthorized: {0}")]
	Unauthorized(String),

	#[error("room lookup failed: {0}")]
	Room(#[from] StoreError),
}

impl IdentityError {
	pub fn code(&self) -> &'static str {
		match self {
			IdentityError::MissingUserId | IdentityError::MissingRoom | IdentityError::InvalidId { .. } => {
				error_codes::INVALID_IDENTITY
			}
			IdentityError::Unauthorized(_) => error_codes::UNAUTHORIZED,
			IdentityError::Room(_) => error_codes::ROOM_UNAVAILABLE,
		}
	}
}

#[derive(Debug, Error)]
pub enum BlobError {
	#[error("attachment too large: len={len} max={max}")]
	TooLarge { len: usize, max: usize },

	#[error("blob storage is not configured")]
	Disabled,

	#[error("blob write failed: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RouteError {
	#[error("attachment upload failed: {0}")]
	Attachment(#[from] BlobError),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn only_unavailable_is_retryable() {
		assert!(StoreError::unavailable("redis", "connection refused").is_retryable());
		assert!(!StoreError::Corrupt("bad json".into()).is_retryable());
	}

	#[test]
	fn identity_errors_map_to_wire_codes() {
		assert_eq!(IdentityError::MissingUserId.code(), error_codes::INVALID_IDENTITY);
		assert_eq!(IdentityError::Unauthorized("x".into()).code(), error_codes::UNAUTHORIZED);
		assert_eq!(
			IdentityError::from(StoreError::unavailable("sql", "down")).code(),
			error_codes::ROOM_UNAVAILABLE
		);
	}
}
