#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use courier_protocol::{ClientFrame, ServerFrame, encode_frame, try_decode_frame_from_buffer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::connection::{FrameSink, Inbound};

const INBOUND_QUEUE: usize = 64;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Writes frames to the client's bidirectional stream.
pub struct QuicFrameSink {
	conn_id: u64,
	connection: quinn::Connection,
	send: quinn::SendStream,
	max_frame_bytes: usize,
}

impl QuicFrameSink {
	pub fn new(conn_id: u64, connection: quinn::Connection, send: quinn::SendStream, max_frame_bytes: usize) -> Self {
		Self {
			conn_id,
			connection,
			send,
			max_frame_bytes,
		}
	}
}

#[async_trait::async_trait]
impl FrameSink for QuicFrameSink {
	async fn send(&mut self, frame: &ServerFrame) -> anyhow::Result<()> {
		let bytes = encode_frame(frame, self.max_frame_bytes).map_err(|e| anyhow!(e))?;
		metrics::counter!("courier_server_frames_out_total").increment(1);
		metrics::counter!("courier_server_bytes_out_total").increment(bytes.len() as u64);

		self.send.write_all(&bytes).await.context("stream write")?;
		Ok(())
	}

	async fn close(&mut self) {
		// Give queued frames a chance to reach the peer before tearing down.
		if self.send.finish().is_ok() {
			let _ = tokio::time::timeout(FLUSH_TIMEOUT, self.send.stopped()).await;
		}
		self.connection.close(0u32.into(), b"bye");
		debug!(conn_id = self.conn_id, "quic connection closed");
	}
}

/// Spawn a task that turns stream bytes into [`Inbound`] events.
///
/// The returned channel closes on EOF, on a read error and on an oversized frame.
pub fn spawn_frame_reader(conn_id: u64, mut recv: quinn::RecvStream, max_frame_bytes: usize) -> mpsc::Receiver<Inbound> {
	let (tx, rx) = mpsc::channel(INBOUND_QUEUE);

	tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					debug!(conn_id, "client stream finished");
					return;
				}
				Err(e) => {
					debug!(conn_id, error = %e, "client stream read failed");
					return;
				}
			};
			metrics::counter!("courier_server_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				let event = match try_decode_frame_from_buffer::<ClientFrame>(&mut buf, max_frame_bytes) {
					Ok(Some(frame)) => {
						metrics::counter!("courier_server_frames_in_total").increment(1);
						Inbound::Frame(frame)
					}
					Ok(None) => break,
					Err(e) if e.is_recoverable() => {
						metrics::counter!("courier_server_decode_errors_total").increment(1);
						Inbound::Malformed(e.to_string())
					}
					Err(e) => {
						warn!(conn_id, error = %e, "unreadable client stream; closing");
						metrics::counter!("courier_server_decode_errors_total").increment(1);
						return;
					}
				};

				if tx.send(event).await.is_err() {
					return;
				}
			}
		}
	});

	rx
}
