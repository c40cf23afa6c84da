#![forbid(unsafe_code)]

pub mod auth;
pub mod browser;
pub mod kick;
pub mod session;

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

pub use browser::BrowserError;
pub use kick::pusher::DecodeError;
pub use session::SessionCredentials;

/// Top-level error taxonomy for the session lifecycle and command surface.
#[derive(Debug, Error)]
pub enum KickError {
	/// The site detected automation and refused to serve the page. Not retried.
	#[error("blocked by anti-automation protection: {0}")]
	Blocked(String),

	/// Credential acquisition or injection failed.
	#[error(transparent)]
	Auth(#[from] AuthError),

	/// Bad caller arguments.
	#[error("invalid argument: {0}")]
	Validation(String),

	/// Command issued without a valid session or a resolved channel identity.
	#[error("precondition failed: {0}")]
	Precondition(String),

	/// Malformed realtime frame.
	#[error(transparent)]
	Decode(#[from] DecodeError),

	/// HTTP or socket failure.
	#[error("network error: {0}")]
	Network(String),

	/// Browser automation failure.
	#[error(transparent)]
	Browser(BrowserError),

	/// A bounded wait elapsed.
	#[error("timed out: {0}")]
	Timeout(String),
}

impl From<BrowserError> for KickError {
	fn from(err: BrowserError) -> Self {
		if err.is_timeout() {
			Self::Timeout(err.to_string())
		} else {
			Self::Browser(err)
		}
	}
}

impl KickError {
	pub fn validation(msg: impl Into<String>) -> Self {
		Self::Validation(msg.into())
	}

	pub fn precondition(msg: impl Into<String>) -> Self {
		Self::Precondition(msg.into())
	}
}

/// Authentication failures. Every missing credential value has its own variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
	#[error("2FA authentication required: an otp secret must be supplied")]
	TwoFactorRequired,

	#[error("failed to capture cookies")]
	MissingCookies,

	#[error("failed to capture bearer token")]
	MissingBearerToken,

	#[error("failed to capture xsrf token")]
	MissingXsrfToken,

	/// A caller-supplied login input was empty.
	#[error("{0} is required and must be non-empty")]
	MissingField(&'static str),

	#[error("invalid otp secret: {0}")]
	InvalidOtpSecret(String),
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	/// True when the secret is empty or whitespace only.
	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}
