#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::hub::ConnectionHub;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	hub: Option<ConnectionHub>,
	offline_backend: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
	pub connections: usize,
	pub rooms: usize,
	pub offline_backend: &'static str,
}

impl HealthState {
	pub fn new(hub: ConnectionHub, offline_backend: &'static str) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			hub: Some(hub),
			offline_backend,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	pub fn stats(&self) -> StatsSnapshot {
		let hub = self.hub.as_ref().map(ConnectionHub::stats).unwrap_or_default();
		StatsSnapshot {
			connections: hub.connections,
			rooms: hub.rooms,
			offline_backend: self.offline_backend,
		}
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "health server listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(respond(req.method(), req.uri().path(), &state))
}

fn respond(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return plain(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => plain(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => plain(StatusCode::OK, Bytes::from_static(b"ready")),
		"/readyz" => plain(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		"/stats" => match serde_json::to_vec(&state.stats()) {
			Ok(body) => {
				let mut resp = plain(StatusCode::OK, Bytes::from(body));
				resp.headers_mut()
					.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
				resp
			}
			Err(err) => {
				warn!(error = %err, "stats encode failed");
				plain(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
			}
		},
		_ => plain(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

fn plain(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

#[cfg(test)]
mod tests {
	use courier_domain::{RoomId, UserId};

	use super::*;
	use crate::server::hub::{HubConfig, connection_channel};

	#[test]
	fn readiness_follows_state() {
		let state = HealthState::new(ConnectionHub::new(HubConfig::default()), "memory");
		assert_eq!(
			respond(&Method::GET, "/readyz", &state).status(),
			StatusCode::SERVICE_UNAVAILABLE
		);

		state.mark_ready();
		assert_eq!(respond(&Method::GET, "/readyz", &state).status(), StatusCode::OK);
		assert_eq!(respond(&Method::GET, "/healthz", &state).status(), StatusCode::OK);
		assert_eq!(
			respond(&Method::POST, "/healthz", &state).status(),
			StatusCode::METHOD_NOT_ALLOWED
		);
		assert_eq!(respond(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
	}

	#[test]
	fn stats_reflect_the_hub() {
		let hub = ConnectionHub::new(HubConfig::default());
		let state = HealthState::new(hub.clone(), "redis");
		let (handle, _mailbox) = connection_channel(1, UserId::new_v4(), RoomId::new_v4(), 1);
		hub.register(handle);

		assert_eq!(
			state.stats(),
			StatsSnapshot {
				connections: 1,
				rooms: 1,
				offline_backend: "redis",
			}
		);

		let resp = respond(&Method::GET, "/stats", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			resp.headers().get(CONTENT_TYPE),
			Some(&HeaderValue::from_static("application/json"))
		);
	}
}
