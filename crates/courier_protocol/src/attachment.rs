#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use courier_domain::Attachment;
use thiserror::Error;

/// Content type assumed for bare base64 payloads.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum AttachmentError {
	#[error("attachment payload is empty")]
	Empty,
	#[error("unsupported data url encoding (expected ;base64)")]
	UnsupportedEncoding,
	#[error("malformed data url")]
	MalformedDataUrl,
	#[error("invalid base64: {0}")]
	InvalidBase64(#[from] base64::DecodeError),
}

/// Parse the `file` field of a message frame into an inline attachment.
///
/// Accepts `data:<mime>;base64,<data>` or bare base64.
pub fn parse_file_field(raw: &str) -> Result<Attachment, AttachmentError> {
	let raw = raw.trim();
	if raw.is_empty() {
		return Err(AttachmentError::Empty);
	}

	let (content_type, encoded) = match raw.strip_prefix("data:") {
		Some(rest) => {
			let (meta, data) = rest.split_once(',').ok_or(AttachmentError::MalformedDataUrl)?;
			let mime = meta.strip_suffix(";base64").ok_or(AttachmentError::UnsupportedEncoding)?;
			let mime = mime.trim();
			let mime = if mime.is_empty() { DEFAULT_CONTENT_TYPE } else { mime };
			(mime.to_ascii_lowercase(), data)
		}
		None => (DEFAULT_CONTENT_TYPE.to_string(), raw),
	};

	let data = STANDARD.decode(encoded.trim())?;
	if data.is_empty() {
		return Err(AttachmentError::Empty);
	}

	Ok(Attachment::Inline { content_type, data })
}

/// Build a `data:` url; used by clients and tests.
pub fn to_data_url(content_type: &str, data: &[u8]) -> String {
	format!("data:{content_type};base64,{}", STANDARD.encode(data))
}
