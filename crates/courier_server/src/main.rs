#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use courier_server::config::{OfflineBackendKind, ServerConfig, default_config_path, load_server_config_from_path};
use courier_server::quic::config::QuicServerConfig;
use courier_server::quic::listener::serve_endpoint;
use courier_server::server::auth::IdentityVerifier;
use courier_server::server::blob::blob_store_from_settings;
use courier_server::server::connection::{ConnectionSettings, ServerContext};
use courier_server::server::conversation::{ConversationResolver, SqlConversationStore};
use courier_server::server::db::Database;
use courier_server::server::health::{HealthState, spawn_health_server};
use courier_server::server::history::MessageHistory;
use courier_server::server::hub::{ConnectionHub, HubConfig};
use courier_server::server::offline::open_offline_store;
use courier_server::server::router::MessageRouter;
use courier_server::server::supervisor::{SideEffectConfig, SideEffectFailure, SideEffectSupervisor};
use courier_server::util::endpoint::{DEFAULT_BIND_ENDPOINT, parse_bind_endpoint};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier_server [--bind quic://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: {DEFAULT_BIND_ENDPOINT})\n\
\t           Format: quic://host:port\n\
\t--config   Config file (default: ~/.courier/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_bind(cli: Option<&str>, cfg: &ServerConfig) -> SocketAddr {
	let endpoint = cli.or(cfg.server.bind.as_deref()).unwrap_or(DEFAULT_BIND_ENDPOINT);
	parse_bind_endpoint(endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("courier_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn spawn_failure_monitor(mut failures: mpsc::Receiver<SideEffectFailure>) {
	tokio::spawn(async move {
		while let Some(failure) = failures.recv().await {
			match failure {
				SideEffectFailure::Rejected { label, reason } => {
					warn!(label, reason, "side effect dropped");
				}
				SideEffectFailure::Failed { label, error } => {
					error!(label, error = %error, "side effect failed");
				}
			}
		}
	});
}

async fn build_context(cfg: &ServerConfig) -> anyhow::Result<(ServerContext, &'static str)> {
	let needs_db = cfg.persistence.enabled || cfg.offline.backend == OfflineBackendKind::Sql;
	let db = match cfg.persistence.database_url.as_deref() {
		Some(url) if needs_db => {
			let db = Database::connect(url).await?;
			info!(driver = db.driver(), "database connected");
			Some(db)
		}
		_ => None,
	};

	let offline = open_offline_store(&cfg.offline, db.as_ref()).await?;
	let offline_backend = offline.backend_name();

	let conversations = match &db {
		Some(db) => ConversationResolver::new(Arc::new(SqlConversationStore::new(db.clone()))),
		None => ConversationResolver::in_memory(),
	};

	let hub = ConnectionHub::new(HubConfig::default());
	let mut router = MessageRouter::new(hub, offline, blob_store_from_settings(&cfg.blobs), conversations);

	if cfg.persistence.enabled
		&& let Some(db) = &db
	{
		let (supervisor, failures) = SideEffectSupervisor::new(SideEffectConfig::from(&cfg.side_effects));
		spawn_failure_monitor(failures);
		router = router.with_history(supervisor, MessageHistory::new(db.clone()));
		info!(workers = cfg.side_effects.workers, "message history enabled");
	}

	let ctx = ServerContext {
		router,
		identity: IdentityVerifier::from_config(cfg),
		settings: ConnectionSettings::from_config(cfg),
	};
	Ok((ctx, offline_backend))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_addr = resolve_bind(args.bind.as_deref(), &server_cfg);

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let (ctx, offline_backend) = build_context(&server_cfg).await?;

	let health_state = HealthState::new(ctx.hub().clone(), offline_backend);
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"courier_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	{
		let health_state = health_state.clone();
		tokio::spawn(async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				warn!(error = %e, "ctrl-c handler failed; running until killed");
				std::future::pending::<()>().await;
			}
			info!("shutdown requested");
			health_state.mark_not_ready();
			let _ = shutdown_tx.send(true);
		});
	}

	health_state.mark_ready();
	serve_endpoint(endpoint, ctx, shutdown_rx).await?;

	info!("courier_server stopped");
	Ok(())
}
