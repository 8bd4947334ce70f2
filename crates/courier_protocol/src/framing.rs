#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024; // 8 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

impl FramingError {
	/// Whether the stream can keep going after this error.
	///
	/// A `Decode` error only poisons the frame it came from; the length prefix
	/// was valid, so the next frame starts at a known offset.
	pub fn is_recoverable(&self) -> bool {
		matches!(self, FramingError::Decode(_))
	}
}

fn encode_payload<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload = serde_json::to_vec(msg).map_err(FramingError::Encode)?;
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}
	Ok(payload)
}

/// Encode a message into a length-prefixed JSON frame.
pub fn encode_frame<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload = encode_payload(msg, max_frame_size)?;

	let mut out = Vec::with_capacity(4 + payload.len());
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(&payload);
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Serialize>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into<M: Serialize>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let payload = encode_payload(msg, max_frame_size)?;

	buf.reserve(4 + payload.len());
	buf.put_u32(payload.len() as u32);
	buf.put_slice(&payload);
	Ok(())
}

/// Compute total frame length (prefix + payload).
#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	4 + payload_len
}

/// Decode a single frame from the start of `src`.
pub fn decode_frame<M: DeserializeOwned>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	if src.len() < 4 {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = 4 + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = serde_json::from_slice(&src[4..need]).map_err(FramingError::Decode)?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer.
///
/// A complete frame is always removed from `buf`, even when its payload fails
/// to decode.
pub fn try_decode_frame_from_buffer<M: DeserializeOwned>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = 4 + len;
	if buf.len() < need {
		return Ok(None);
	}

	let frame = buf.split_to(need);
	let msg = serde_json::from_slice(&frame[4..]).map_err(FramingError::Decode)?;
	Ok(Some(msg))
}

#[cfg(test)]
mod tests {
	use serde::Deserialize;

	use super::*;

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct TestMsg {
		s: String,
		n: u32,
	}

	#[test]
	fn decode_requires_full_frame() {
		let msg = TestMsg { s: "x".repeat(10), n: 7 };
		let frame = encode_frame_default(&msg).expect("encode");

		let err = decode_frame::<TestMsg>(&frame[..4], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => {
				assert!(need > have);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn malformed_payload_is_consumed_and_recoverable() {
		let mut buf = BytesMut::new();
		buf.put_u32(5);
		buf.put_slice(b"{nope");
		encode_frame_into(
			&mut buf,
			&TestMsg {
				s: "next".to_string(),
				n: 1,
			},
			DEFAULT_MAX_FRAME_SIZE,
		)
		.expect("encode");

		let err = try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(err.is_recoverable(), "expected recoverable error, got: {err:?}");

		let next = try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("some");
		assert_eq!(next.s, "next");
		assert!(buf.is_empty());
	}

	#[test]
	fn encode_rejects_too_large() {
		let msg = TestMsg {
			s: "a".repeat(10_000),
			n: 1,
		};

		let err = encode_frame(&msg, 32).unwrap_err();
		match err {
			FramingError::FrameTooLarge { len, max } => {
				assert!(len > max);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decode_rejects_too_large_prefix() {
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

		let err = try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(
			matches!(err, FramingError::FrameTooLarge { .. }),
			"unexpected error: {err:?}"
		);
		assert!(!err.is_recoverable());
	}
}
