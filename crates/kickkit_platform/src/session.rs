#![forbid(unsafe_code)]

use crate::{AuthError, SecretString};

/// Authorization basis for every mutating operation.
///
/// Valid by construction: all three values are non-empty. A login produces a fresh value that replaces
/// the previous one wholesale; nothing mutates it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
	authorization_token: SecretString,
	anti_forgery_token: SecretString,
	cookie_jar: SecretString,
}

impl SessionCredentials {
	/// Validate and wrap captured values. Reports the first missing value, cookies first.
	pub fn new(
		authorization_token: impl Into<String>,
		anti_forgery_token: impl Into<String>,
		cookie_jar: impl Into<String>,
	) -> Result<Self, AuthError> {
		let authorization_token = SecretString::new(authorization_token.into().trim());
		let anti_forgery_token = SecretString::new(anti_forgery_token.into().trim());
		let cookie_jar = SecretString::new(cookie_jar.into().trim());

		if cookie_jar.is_blank() {
			return Err(AuthError::MissingCookies);
		}
		if authorization_token.is_blank() {
			return Err(AuthError::MissingBearerToken);
		}
		if anti_forgery_token.is_blank() {
			return Err(AuthError::MissingXsrfToken);
		}

		Ok(Self {
			authorization_token,
			anti_forgery_token,
			cookie_jar,
		})
	}

	pub fn is_valid(&self) -> bool {
		!self.authorization_token.is_blank() && !self.anti_forgery_token.is_blank() && !self.cookie_jar.is_blank()
	}

	pub fn authorization_token(&self) -> &SecretString {
		&self.authorization_token
	}

	pub fn anti_forgery_token(&self) -> &SecretString {
		&self.anti_forgery_token
	}

	/// Serialized `cookie` header value.
	pub fn cookie_jar(&self) -> &SecretString {
		&self.cookie_jar
	}

	pub(crate) fn bearer_header(&self) -> String {
		format!("Bearer {}", self.authorization_token.expose())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_complete_set() {
		let creds = SessionCredentials::new("tok", "xsrf", "a=1; b=2").unwrap();
		assert!(creds.is_valid());
		assert_eq!(creds.bearer_header(), "Bearer tok");
		assert_eq!(creds.cookie_jar().expose(), "a=1; b=2");
	}

	#[test]
	fn names_the_missing_value() {
		assert_eq!(SessionCredentials::new("tok", "xsrf", ""), Err(AuthError::MissingCookies));
		assert_eq!(SessionCredentials::new(" ", "xsrf", "a=1"), Err(AuthError::MissingBearerToken));
		assert_eq!(SessionCredentials::new("tok", "", "a=1"), Err(AuthError::MissingXsrfToken));
	}

	#[test]
	fn debug_does_not_leak() {
		let creds = SessionCredentials::new("very-secret", "xsrf", "a=1").unwrap();
		assert!(!format!("{creds:?}").contains("very-secret"));
	}
}
