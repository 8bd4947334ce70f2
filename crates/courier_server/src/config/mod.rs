#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use courier_domain::SecretString;
use courier_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.courier/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".courier").join("config.toml"))
}

/// Load the server config from TOML at `path` plus `COURIER_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.validate()?;

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub auth_token: Option<SecretString>,
	pub server: ServerSettings,
	pub offline: OfflineSettings,
	pub persistence: PersistenceSettings,
	pub blobs: BlobSettings,
	pub side_effects: SideEffectSettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

/// Transport and connection settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// `quic://host:port`; `--bind` wins over this.
	pub bind: Option<String>,
	/// Name reported in the welcome frame.
	pub server_name: String,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// How long a new connection may take to send its hello frame.
	pub handshake_timeout: Duration,
	/// Per-connection outbound queue depth.
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
}

/// Which offline backlog implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfflineBackendKind {
	#[default]
	Memory,
	Redis,
	Sql,
}

impl OfflineBackendKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			OfflineBackendKind::Memory => "memory",
			OfflineBackendKind::Redis => "redis",
			OfflineBackendKind::Sql => "sql",
		}
	}
}

impl fmt::Display for OfflineBackendKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OfflineBackendKind {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"memory" | "in_memory" | "inmemory" => Ok(OfflineBackendKind::Memory),
			"redis" => Ok(OfflineBackendKind::Redis),
			"sql" | "database" | "durable" => Ok(OfflineBackendKind::Sql),
			other => Err(anyhow!("unknown offline backend: {other} (expected memory, redis or sql)")),
		}
	}
}

#[derive(Debug, Clone)]
pub struct OfflineSettings {
	pub backend: OfflineBackendKind,
	pub redis_url: Option<String>,
	/// Oldest entries are dropped past this many per (room, recipient). Unbounded when unset.
	pub max_per_recipient: Option<usize>,
	/// Redis key expiry. Never expires when unset.
	pub ttl: Option<Duration>,
}

/// Persistence settings; the database also backs the `sql` offline backend.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Store conversations and message history in the database.
	pub enabled: bool,
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BlobSettings {
	/// Directory for uploaded attachments. Uploads are rejected when unset.
	pub dir: Option<PathBuf>,
	/// Prefix for URLs handed back to clients.
	pub public_base_url: String,
	pub max_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct SideEffectSettings {
	pub workers: usize,
	pub queue_capacity: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	auth_token: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	offline: FileOfflineSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	blobs: FileBlobSettings,

	#[serde(default)]
	side_effects: FileSideEffectSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	server_name: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	handshake_timeout_ms: Option<u64>,
	outbound_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOfflineSettings {
	backend: Option<String>,
	redis_url: Option<String>,
	max_per_recipient: Option<usize>,
	ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBlobSettings {
	dir: Option<String>,
	public_base_url: Option<String>,
	max_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSideEffectSettings {
	workers: Option<usize>,
	queue_capacity: Option<usize>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let backend = match non_empty(file.offline.backend) {
			Some(raw) => raw.parse().unwrap_or_else(|e| {
				warn!(error = %e, "offline config: falling back to memory backend");
				OfflineBackendKind::Memory
			}),
			None => OfflineBackendKind::Memory,
		};

		Self {
			auth_token: non_empty(file.auth_token).map(SecretString::new),
			server: ServerSettings {
				bind: non_empty(file.server.bind),
				server_name: non_empty(file.server.server_name).unwrap_or_else(|| "courier".to_string()),
				tls_cert_path: non_empty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
				handshake_timeout: Duration::from_millis(file.server.handshake_timeout_ms.unwrap_or(5_000)),
				outbound_queue_capacity: file.server.outbound_queue_capacity.unwrap_or(256).max(1),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
			},
			offline: OfflineSettings {
				backend,
				redis_url: non_empty(file.offline.redis_url),
				max_per_recipient: file.offline.max_per_recipient.filter(|max| *max > 0),
				ttl: file.offline.ttl_secs.filter(|secs| *secs > 0).map(Duration::from_secs),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
			},
			blobs: BlobSettings {
				dir: non_empty(file.blobs.dir).map(PathBuf::from),
				public_base_url: non_empty(file.blobs.public_base_url)
					.map(|s| s.trim_end_matches('/').to_string())
					.unwrap_or_else(|| "/files".to_string()),
				max_bytes: file.blobs.max_bytes.unwrap_or(5 * 1024 * 1024),
			},
			side_effects: SideEffectSettings {
				workers: file.side_effects.workers.unwrap_or(4).max(1),
				queue_capacity: file.side_effects.queue_capacity.unwrap_or(1024).max(1),
			},
		}
	}

	/// Reject combinations that cannot start.
	pub fn validate(&self) -> anyhow::Result<()> {
		match self.offline.backend {
			OfflineBackendKind::Redis if self.offline.redis_url.is_none() => {
				Err(anyhow!("offline backend is redis but no offline.redis_url configured"))
			}
			OfflineBackendKind::Sql if self.persistence.database_url.is_none() => Err(anyhow!(
				"offline backend is sql but no persistence.database_url configured"
			)),
			_ if self.persistence.enabled && self.persistence.database_url.is_none() => {
				Err(anyhow!("persistence enabled but no database_url configured"))
			}
			_ => Ok(()),
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `COURIER_*` overrides read through `lookup`.
fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("COURIER_SERVER_AUTH_TOKEN") {
		cfg.auth_token = Some(SecretString::new(v));
		info!("server auth: auth_token overridden by env");
	}

	if let Some(v) = var("COURIER_SERVER_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = var("COURIER_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = var("COURIER_SERVER_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = var("COURIER_SERVER_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = var("COURIER_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("COURIER_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("COURIER_HANDSHAKE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.handshake_timeout = Duration::from_millis(ms);
		info!(ms, "server config: handshake_timeout overridden by env");
	}

	if let Some(v) = var("COURIER_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
	{
		cfg.server.outbound_queue_capacity = capacity.max(1);
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = var("COURIER_OFFLINE_BACKEND") {
		match v.parse::<OfflineBackendKind>() {
			Ok(backend) => {
				cfg.offline.backend = backend;
				info!(%backend, "offline config: backend overridden by env");
			}
			Err(e) => warn!(error = %e, "offline config: ignoring COURIER_OFFLINE_BACKEND"),
		}
	}

	if let Some(v) = var("COURIER_REDIS_URL") {
		cfg.offline.redis_url = Some(v);
		info!("offline config: redis_url overridden by env");
	}

	if let Some(v) = var("COURIER_OFFLINE_MAX_PER_RECIPIENT")
		&& let Ok(max) = v.parse::<usize>()
	{
		cfg.offline.max_per_recipient = (max > 0).then_some(max);
		info!(max, "offline config: max_per_recipient overridden by env");
	}

	if let Some(v) = var("COURIER_OFFLINE_TTL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.offline.ttl = (secs > 0).then(|| Duration::from_secs(secs));
		info!(secs, "offline config: ttl overridden by env");
	}

	if let Some(v) = var("COURIER_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = var("COURIER_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("COURIER_BLOB_DIR") {
		cfg.blobs.dir = Some(PathBuf::from(v));
		info!("blob config: dir overridden by env");
	}

	if let Some(v) = var("COURIER_BLOB_PUBLIC_BASE_URL") {
		cfg.blobs.public_base_url = v.trim_end_matches('/').to_string();
		info!("blob config: public_base_url overridden by env");
	}

	if let Some(v) = var("COURIER_BLOB_MAX_BYTES")
		&& let Ok(max) = v.parse::<usize>()
	{
		cfg.blobs.max_bytes = max;
		info!(max, "blob config: max_bytes overridden by env");
	}

	if let Some(v) = var("COURIER_SIDE_EFFECT_WORKERS")
		&& let Ok(workers) = v.parse::<usize>()
	{
		cfg.side_effects.workers = workers.max(1);
		info!(workers, "side effects: workers overridden by env");
	}

	if cfg.auth_token.is_none() && cfg.server.auth_hmac_secret.is_none() {
		warn!("server auth: no auth_token or auth_hmac_secret configured; handshake user ids are trusted as-is");
	}
}
