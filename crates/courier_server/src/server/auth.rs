#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courier_domain::{SecretString, UserId};
use courier_protocol::Hello;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::ServerConfig;
use crate::server::error::IdentityError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Verify a `v1.<payload>.<sig>` token and return its claims.
pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = crate::util::time::unix_ms_now().max(0) as u64 / 1000;
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token for `sub` that expires at `exp` (unix seconds).
pub fn sign_hmac_token(sub: &str, exp: u64, secret: &str) -> anyhow::Result<String> {
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp,
	};
	let payload = serde_json::to_vec(&claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Establishes the user id of a connecting client from its hello frame.
#[derive(Debug, Clone, Default)]
pub struct IdentityVerifier {
	auth_token: Option<SecretString>,
	hmac_secret: Option<SecretString>,
}

impl IdentityVerifier {
	pub fn new(auth_token: Option<SecretString>, hmac_secret: Option<SecretString>) -> Self {
		Self {
			auth_token,
			hmac_secret,
		}
	}

	pub fn from_config(cfg: &ServerConfig) -> Self {
		Self::new(cfg.auth_token.clone(), cfg.server.auth_hmac_secret.clone())
	}

	/// Any hello is accepted at face value.
	pub fn trusting() -> Self {
		Self::default()
	}

	pub fn verify(&self, hello: &Hello) -> Result<UserId, IdentityError> {
		let claimed = parse_optional_user(hello.user_id.as_deref())?;

		if let Some(secret) = &self.hmac_secret {
			let token = presented_token(hello)?;
			let claims =
				verify_hmac_token(token, secret.expose()).map_err(|e| IdentityError::Unauthorized(e.to_string()))?;
			let subject = UserId::parse(&claims.sub)
				.map_err(|_| IdentityError::Unauthorized("token subject is not a user id".to_string()))?;
			if let Some(claimed) = claimed
				&& claimed != subject
			{
				return Err(IdentityError::Unauthorized(
					"token subject does not match user_id".to_string(),
				));
			}
			return Ok(subject);
		}

		if let Some(expected) = &self.auth_token {
			let token = presented_token(hello)?;
			if !constant_time_eq(token.as_bytes(), expected.expose().as_bytes()) {
				return Err(IdentityError::Unauthorized("invalid auth token".to_string()));
			}
		}

		claimed.ok_or(IdentityError::MissingUserId)
	}
}

fn presented_token(hello: &Hello) -> Result<&str, IdentityError> {
	hello
		.auth_token
		.as_deref()
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.ok_or_else(|| IdentityError::Unauthorized("missing auth token".to_string()))
}

fn parse_optional_user(raw: Option<&str>) -> Result<Option<UserId>, IdentityError> {
	match raw.map(str::trim).filter(|s| !s.is_empty()) {
		None => Ok(None),
		Some(s) => UserId::parse(s)
			.map(Some)
			.map_err(|source| IdentityError::InvalidId {
				field: "user_id",
				source,
			}),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SECRET: &str = "test-secret";

	fn hello(user: Option<UserId>, token: Option<&str>) -> Hello {
		Hello {
			user_id: user.map(|u| u.to_string()),
			room_id: None,
			peer_id: None,
			auth_token: token.map(str::to_string),
			client_name: None,
		}
	}

	fn far_future() -> u64 {
		(crate::util::time::unix_ms_now() as u64 / 1000) + 3600
	}

	#[test]
	fn hmac_token_round_trip() {
		let user = UserId::new_v4();
		let token = sign_hmac_token(&user.to_string(), far_future(), SECRET).expect("sign");
		let claims = verify_hmac_token(&token, SECRET).expect("verify");
		assert_eq!(claims.sub, user.to_string());

		assert!(verify_hmac_token(&token, "other-secret").is_err());
		assert!(verify_hmac_token("v2.a.b", SECRET).is_err());
	}

	#[test]
	fn expired_tokens_are_rejected() {
		let token = sign_hmac_token(&UserId::new_v4().to_string(), 1, SECRET).expect("sign");
		let err = verify_hmac_token(&token, SECRET).unwrap_err();
		assert!(err.to_string().contains("expired"), "got: {err}");
	}

	#[test]
	fn trusting_verifier_uses_hello_user() {
		let user = UserId::new_v4();
		let verifier = IdentityVerifier::trusting();
		assert_eq!(verifier.verify(&hello(Some(user), None)).expect("verify"), user);
		assert!(matches!(
			verifier.verify(&hello(None, None)),
			Err(IdentityError::MissingUserId)
		));

		let mut bad = hello(None, None);
		bad.user_id = Some("not-a-uuid".to_string());
		assert!(matches!(
			verifier.verify(&bad),
			Err(IdentityError::InvalidId { field: "user_id", .. })
		));
	}

	#[test]
	fn static_token_must_match() {
		let user = UserId::new_v4();
		let verifier = IdentityVerifier::new(Some(SecretString::new("letmein")), None);

		assert_eq!(verifier.verify(&hello(Some(user), Some("letmein"))).expect("verify"), user);
		assert!(matches!(
			verifier.verify(&hello(Some(user), Some("wrong"))),
			Err(IdentityError::Unauthorized(_))
		));
		assert!(matches!(
			verifier.verify(&hello(Some(user), None)),
			Err(IdentityError::Unauthorized(_))
		));
	}

	#[test]
	fn hmac_subject_becomes_identity() {
		let user = UserId::new_v4();
		let verifier = IdentityVerifier::new(None, Some(SecretString::new(SECRET)));
		let token = sign_hmac_token(&user.to_string(), far_future(), SECRET).expect("sign");

		assert_eq!(verifier.verify(&hello(None, Some(&token))).expect("verify"), user);
		assert_eq!(verifier.verify(&hello(Some(user), Some(&token))).expect("verify"), user);

		let err = verifier
			.verify(&hello(Some(UserId::new_v4()), Some(&token)))
			.unwrap_err();
		assert!(matches!(err, IdentityError::Unauthorized(_)), "got: {err:?}");
	}

	#[test]
	fn hmac_subject_must_be_a_user_id() {
		let verifier = IdentityVerifier::new(None, Some(SecretString::new(SECRET)));
		let token = sign_hmac_token("alice", far_future(), SECRET).expect("sign");
		assert!(matches!(
			verifier.verify(&hello(None, Some(&token))),
			Err(IdentityError::Unauthorized(_))
		));
	}
}
