#![forbid(unsafe_code)]

use std::net::SocketAddr;

/// Default listen endpoint.
pub const DEFAULT_BIND_ENDPOINT: &str = "quic://127.0.0.1:18300";

/// Parse a `quic://host:port` bind endpoint. The host must be an IP literal
/// (IPv6 bracketed).
pub fn parse_bind_endpoint(s: &str) -> Result<SocketAddr, String> {
	let s = s.trim();
	if s.is_empty() {
		return Err("endpoint must be non-empty (expected quic://host:port)".to_string());
	}

	let rest = s
		.strip_prefix("quic://")
		.ok_or_else(|| format!("invalid endpoint (expected quic://host:port): {s}"))?;

	if rest.contains(['/', '?', '#']) {
		return Err(format!(
			"invalid endpoint (expected quic://host:port without path/query/fragment): {s}"
		));
	}

	let addr: SocketAddr = rest
		.parse()
		.map_err(|_| format!("host must be an IP literal with a port (e.g. quic://127.0.0.1:18300): {s}"))?;

	if addr.port() == 0 {
		return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
	}

	Ok(addr)
}
