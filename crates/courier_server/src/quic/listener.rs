#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use quinn::Endpoint;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::quic::transport::{QuicFrameSink, spawn_frame_reader};
use crate::server::connection::{ServerContext, serve_connection};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept QUIC connections until `shutdown` flips to `true`.
pub async fn serve_endpoint(
	endpoint: Endpoint,
	ctx: ServerContext,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let local_addr = endpoint.local_addr().context("endpoint local_addr")?;
	info!(%local_addr, "accepting QUIC connections");

	let mut next_conn_id: u64 = 1;
	loop {
		let incoming = tokio::select! {
			incoming = endpoint.accept() => match incoming {
				Some(incoming) => incoming,
				None => break,
			},
			_ = shutdown.wait_for(|stop| *stop) => break,
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;

		let ctx = ctx.clone();
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_quic_connection(conn_id, connection, ctx, shutdown).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	info!("listener stopping; waiting for connections to drain");
	if tokio::time::timeout(DRAIN_TIMEOUT, endpoint.wait_idle()).await.is_err() {
		warn!("connections still open after drain timeout");
	}
	endpoint.close(0u32.into(), b"shutdown");
	Ok(())
}

async fn handle_quic_connection(
	conn_id: u64,
	connection: quinn::Connection,
	ctx: ServerContext,
	shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let accept = tokio::time::timeout(ctx.settings.handshake_timeout, connection.accept_bi());
	let (send, recv) = match accept.await {
		Ok(streams) => streams.context("accept client bidirectional stream")?,
		Err(_) => {
			connection.close(0u32.into(), b"no stream");
			return Err(anyhow::anyhow!("client opened no stream within the handshake timeout"));
		}
	};

	let max_frame_bytes = ctx.settings.max_frame_bytes;
	let inbound = spawn_frame_reader(conn_id, recv, max_frame_bytes);
	let sink = QuicFrameSink::new(conn_id, connection, send, max_frame_bytes);
	serve_connection(conn_id, sink, inbound, ctx, shutdown).await;
	Ok(())
}
