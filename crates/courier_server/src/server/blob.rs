#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use courier_domain::UserId;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::BlobSettings;
use crate::server::error::BlobError;
use crate::util::time::unix_nanos_now;

/// Turns an inline attachment into a retrievable URL.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
	async fn upload(&self, owner: UserId, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobError>;
}

/// File extension used for stored attachments.
pub fn extension_for(content_type: &str) -> &'static str {
	match content_type {
		"image/png" => "png",
		"image/jpeg" | "image/jpg" => "jpg",
		"image/gif" => "gif",
		"image/webp" => "webp",
		"video/mp4" => "mp4",
		"video/webm" => "webm",
		"audio/mpeg" => "mp3",
		"application/pdf" => "pdf",
		"text/plain" => "txt",
		_ => "bin",
	}
}

/// Object key for an upload: `<owner>/<unix_nanos>.<ext>`.
pub fn object_key(owner: UserId, content_type: &str) -> String {
	format!("{owner}/{}.{}", unix_nanos_now(), extension_for(content_type))
}

fn check_size(len: usize, max: usize) -> Result<(), BlobError> {
	if len > max {
		return Err(BlobError::TooLarge { len, max });
	}
	Ok(())
}

/// Writes attachments under a local directory served at `public_base_url`.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
	root: PathBuf,
	public_base_url: String,
	max_bytes: usize,
}

impl FilesystemBlobStore {
	pub fn new(root: PathBuf, public_base_url: impl Into<String>, max_bytes: usize) -> Self {
		Self {
			root,
			public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
			max_bytes,
		}
	}
}

#[async_trait::async_trait]
impl BlobStore for FilesystemBlobStore {
	async fn upload(&self, owner: UserId, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobError> {
		check_size(bytes.len(), self.max_bytes)?;

		let key = object_key(owner, content_type);
		let path = self.root.join(&key);
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(&path, &bytes).await?;

		debug!(path = %path.display(), len = bytes.len(), "blob stored");
		metrics::counter!("courier_server_blob_uploads_total").increment(1);
		Ok(format!("{}/{key}", self.public_base_url))
	}
}

/// Keeps uploads in memory; URLs use the `memory://` scheme.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
	objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
	fail_uploads: bool,
}

impl InMemoryBlobStore {
	/// A store whose uploads always fail, for exercising error paths.
	pub fn failing() -> Self {
		Self {
			objects: Mutex::new(HashMap::new()),
			fail_uploads: true,
		}
	}

	/// Content type and bytes stored under `url`.
	pub fn get(&self, url: &str) -> Option<(String, Vec<u8>)> {
		let key = url.strip_prefix("memory://")?;
		self.objects.lock().get(key).cloned()
	}

	pub fn len(&self) -> usize {
		self.objects.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBlobStore {
	async fn upload(&self, owner: UserId, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobError> {
		if self.fail_uploads {
			return Err(BlobError::Io(std::io::Error::other("blob store unavailable")));
		}

		let key = object_key(owner, content_type);
		self.objects
			.lock()
			.insert(key.clone(), (content_type.to_string(), bytes));
		Ok(format!("memory://{key}"))
	}
}

/// Rejects every upload; used when no blob directory is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledBlobStore;

#[async_trait::async_trait]
impl BlobStore for DisabledBlobStore {
	async fn upload(&self, _owner: UserId, _bytes: Vec<u8>, _content_type: &str) -> Result<String, BlobError> {
		Err(BlobError::Disabled)
	}
}

/// Build the configured blob store.
pub fn blob_store_from_settings(settings: &BlobSettings) -> Arc<dyn BlobStore> {
	match &settings.dir {
		Some(dir) => Arc::new(FilesystemBlobStore::new(
			dir.clone(),
			settings.public_base_url.clone(),
			settings.max_bytes,
		)),
		None => Arc::new(DisabledBlobStore),
	}
}
