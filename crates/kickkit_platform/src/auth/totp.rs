#![forbid(unsafe_code)]

//! RFC 6238 time-based one-time passwords.

use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use crate::AuthError;

pub const DEFAULT_STEP_SECS: u64 = 30;
pub const DEFAULT_DIGITS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TotpAlgorithm {
	#[default]
	Sha1,
	Sha256,
	Sha512,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Totp {
	key: Vec<u8>,
	algorithm: TotpAlgorithm,
	step_secs: u64,
	digits: u32,
}

impl std::fmt::Debug for Totp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Totp")
			.field("algorithm", &self.algorithm)
			.field("step_secs", &self.step_secs)
			.field("digits", &self.digits)
			.finish_non_exhaustive()
	}
}

impl Totp {
	/// Authenticator-app style base32 secret. Case, spaces, dashes and `=` padding are ignored.
	pub fn from_base32(secret: &str) -> Result<Self, AuthError> {
		let cleaned: String = secret
			.chars()
			.filter(|c| !c.is_whitespace() && *c != '=' && *c != '-')
			.map(|c| c.to_ascii_uppercase())
			.collect();
		if cleaned.is_empty() {
			return Err(AuthError::InvalidOtpSecret("secret is empty".to_string()));
		}
		let key = BASE32_NOPAD
			.decode(cleaned.as_bytes())
			.map_err(|e| AuthError::InvalidOtpSecret(e.to_string()))?;
		Ok(Self::from_key(key))
	}

	pub fn from_key(key: Vec<u8>) -> Self {
		Self {
			key,
			algorithm: TotpAlgorithm::Sha1,
			step_secs: DEFAULT_STEP_SECS,
			digits: DEFAULT_DIGITS,
		}
	}

	pub fn with_algorithm(mut self, algorithm: TotpAlgorithm) -> Self {
		self.algorithm = algorithm;
		self
	}

	pub fn with_digits(mut self, digits: u32) -> Self {
		self.digits = digits.clamp(1, 9);
		self
	}

	/// Code for a unix timestamp in seconds.
	pub fn code_at(&self, unix_secs: u64) -> String {
		let counter = unix_secs / self.step_secs.max(1);
		let hash = self.hmac(&counter.to_be_bytes());

		let offset = usize::from(hash[hash.len() - 1] & 0x0f);
		let binary = (u32::from(hash[offset] & 0x7f) << 24)
			| (u32::from(hash[offset + 1]) << 16)
			| (u32::from(hash[offset + 2]) << 8)
			| u32::from(hash[offset + 3]);

		let code = binary % 10u32.pow(self.digits);
		format!("{code:0width$}", width = self.digits as usize)
	}

	pub fn now(&self) -> String {
		let secs = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or_default();
		self.code_at(secs)
	}

	fn hmac(&self, msg: &[u8]) -> Vec<u8> {
		// HMAC accepts keys of any length, so new_from_slice cannot fail here.
		match self.algorithm {
			TotpAlgorithm::Sha1 => match Hmac::<Sha1>::new_from_slice(&self.key) {
				Ok(mut mac) => {
					mac.update(msg);
					mac.finalize().into_bytes().to_vec()
				}
				Err(_) => vec![0; 20],
			},
			TotpAlgorithm::Sha256 => match Hmac::<Sha256>::new_from_slice(&self.key) {
				Ok(mut mac) => {
					mac.update(msg);
					mac.finalize().into_bytes().to_vec()
				}
				Err(_) => vec![0; 32],
			},
			TotpAlgorithm::Sha512 => match Hmac::<Sha512>::new_from_slice(&self.key) {
				Ok(mut mac) => {
					mac.update(msg);
					mac.finalize().into_bytes().to_vec()
				}
				Err(_) => vec![0; 64],
			},
		}
	}
}

/// Current code for a base32 secret.
pub fn generate(secret: &str) -> Result<String, AuthError> {
	Ok(Totp::from_base32(secret)?.now())
}

#[cfg(test)]
mod tests {
	use super::*;

	// RFC 6238 appendix B, 8-digit vectors; the 6-digit code is the low six digits.
	const RFC_SHA1_SECRET_B32: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

	#[test]
	fn rfc6238_sha1() {
		let totp = Totp::from_base32(RFC_SHA1_SECRET_B32).unwrap();
		assert_eq!(totp.code_at(59), "287082");
		assert_eq!(totp.code_at(1_111_111_109), "081804");
		assert_eq!(totp.code_at(1_234_567_890), "005924");
		assert_eq!(totp.clone().with_digits(8).code_at(59), "94287082");
	}

	#[test]
	fn rfc6238_sha256() {
		let totp = Totp::from_key(b"12345678901234567890123456789012".to_vec()).with_algorithm(TotpAlgorithm::Sha256);
		assert_eq!(totp.code_at(59), "119246");
	}

	#[test]
	fn secret_formatting_is_tolerated() {
		let spaced = Totp::from_base32("gezd gnbv gy3t qojq gezd gnbv gy3t qojq").unwrap();
		assert_eq!(spaced.code_at(59), "287082");
		let padded = Totp::from_base32("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ====").unwrap();
		assert_eq!(padded.code_at(59), "287082");
	}

	#[test]
	fn invalid_secrets() {
		assert!(matches!(Totp::from_base32(""), Err(AuthError::InvalidOtpSecret(_))));
		assert!(matches!(Totp::from_base32("not base32!"), Err(AuthError::InvalidOtpSecret(_))));
	}

	#[test]
	fn codes_are_stable_within_a_step() {
		let totp = Totp::from_base32(RFC_SHA1_SECRET_B32).unwrap();
		assert_eq!(totp.code_at(60), totp.code_at(89));
		assert_eq!(generate(RFC_SHA1_SECRET_B32).unwrap().len(), 6);
	}
}
