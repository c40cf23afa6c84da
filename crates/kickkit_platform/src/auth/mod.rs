#![forbid(unsafe_code)]

//! Session credential acquisition through a scripted browser login.

pub mod totp;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::browser::stealth::is_challenge_title;
use crate::browser::{BrowserLauncher, BrowserPage, serialize_cookie_jar};
use crate::kick::DEFAULT_BASE_URL;
use crate::{AuthError, KickError, SecretString, SessionCredentials};

pub const LOGIN_BUTTON: &str = "nav > div:nth-child(3) > button:first-child";
pub const USERNAME_INPUT: &str = r#"input[name="emailOrUsername"]"#;
pub const PASSWORD_INPUT: &str = r#"input[name="password"]"#;
pub const LOGIN_SUBMIT: &str = r#"button[data-test="login-submit"]"#;
pub const OTP_INPUT: &str = r#"input[data-input-otp="true"]"#;
pub const OTP_SUBMIT: &str = r#"button[type="submit"]"#;
pub const VERIFY_PROMPT: &str = "Verify 2FA Code";

/// Authenticated endpoint the page calls after login; its request carries the bearer token.
pub const FOLLOWED_PATH: &str = "/api/v2/channels/followed";
pub const XSRF_COOKIE: &str = "XSRF-TOKEN";

/// Caller-supplied login inputs.
#[derive(Debug, Clone)]
pub struct LoginCredentials {
	pub username: String,
	pub password: SecretString,
	/// Base32 TOTP secret; only needed when the account has 2FA enabled.
	pub otp_secret: Option<SecretString>,
}

impl LoginCredentials {
	pub fn new(
		username: impl Into<String>,
		password: impl Into<String>,
		otp_secret: Option<String>,
	) -> Result<Self, AuthError> {
		let username = username.into().trim().to_string();
		let password = SecretString::new(password.into());
		if username.is_empty() {
			return Err(AuthError::MissingField("username"));
		}
		if password.is_blank() {
			return Err(AuthError::MissingField("password"));
		}
		let otp_secret = otp_secret.map(SecretString::new).filter(|s| !s.is_blank());
		Ok(Self {
			username,
			password,
			otp_secret,
		})
	}
}

/// Produces a complete credential set or fails; never a partial one.
#[async_trait]
pub trait CredentialAcquirer: Send + Sync {
	async fn acquire(&self, login: &LoginCredentials) -> Result<SessionCredentials, KickError>;
}

#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
	pub base_url: String,
	pub selector_timeout: Duration,
	pub navigation_timeout: Duration,
	pub typing_delay: Duration,
}

impl Default for AcquisitionSettings {
	fn default() -> Self {
		Self {
			base_url: DEFAULT_BASE_URL.to_string(),
			selector_timeout: Duration::from_millis(6000),
			navigation_timeout: Duration::from_millis(30_000),
			typing_delay: Duration::from_millis(100),
		}
	}
}

/// Drives the site's own login form in a throwaway browser.
pub struct BrowserCredentialAcquirer<L> {
	launcher: L,
	settings: AcquisitionSettings,
}

impl<L: BrowserLauncher> BrowserCredentialAcquirer<L> {
	pub fn new(launcher: L, settings: AcquisitionSettings) -> Self {
		Self { launcher, settings }
	}
}

#[async_trait]
impl<L: BrowserLauncher> CredentialAcquirer for BrowserCredentialAcquirer<L> {
	async fn acquire(&self, login: &LoginCredentials) -> Result<SessionCredentials, KickError> {
		metrics::counter!("kickkit_acquisitions_total").increment(1);
		info!(username = %login.username, "starting browser login");

		let mut page = self.launcher.launch().await?;
		let result = login_flow(page.as_mut(), login, &self.settings).await;
		page.close().await;

		match &result {
			Ok(_) => info!(username = %login.username, "session credentials captured"),
			Err(e) => {
				metrics::counter!("kickkit_acquisition_failures_total").increment(1);
				warn!(username = %login.username, error = %e, "browser login failed");
			}
		}
		result
	}
}

async fn login_flow(
	page: &mut dyn BrowserPage,
	login: &LoginCredentials,
	settings: &AcquisitionSettings,
) -> Result<SessionCredentials, KickError> {
	let base = settings.base_url.trim_end_matches('/');
	let wait = settings.selector_timeout;
	let delay = settings.typing_delay;

	page.observe_request(FOLLOWED_PATH).await?;

	let status = page.goto(&format!("{base}/")).await?;
	ensure_not_blocked(page, status).await?;

	page.wait_for_selector(LOGIN_BUTTON, wait).await?;
	page.click(LOGIN_BUTTON).await?;
	page.wait_for_selector(USERNAME_INPUT, wait).await?;
	page.type_text(USERNAME_INPUT, &login.username, delay).await?;
	page.type_text(PASSWORD_INPUT, login.password.expose(), delay).await?;
	page.click(LOGIN_SUBMIT).await?;

	match two_factor(page, login, settings).await {
		Ok(()) => {}
		Err(e @ KickError::Auth(_)) => return Err(e),
		// The OTP step is best effort; missing tokens surface in the final validation.
		Err(e) => debug!(error = %e, "2FA step did not complete"),
	}

	let status = page.goto(&format!("{base}{FOLLOWED_PATH}")).await?;
	ensure_not_blocked(page, status).await?;

	let cookies = page.cookies().await?;
	let jar = serialize_cookie_jar(&cookies);
	let xsrf = cookies
		.iter()
		.find(|c| c.name == XSRF_COOKIE)
		.map(|c| c.value.clone())
		.unwrap_or_default();
	let bearer = page
		.observed_headers()
		.and_then(|h| h.get("authorization").cloned())
		.and_then(|v| bearer_token(&v))
		.unwrap_or_default();

	Ok(SessionCredentials::new(bearer, xsrf, jar)?)
}

/// Race the OTP field against the verification prompt disappearing.
async fn two_factor(
	page: &mut dyn BrowserPage,
	login: &LoginCredentials,
	settings: &AcquisitionSettings,
) -> Result<(), KickError> {
	let race = format!(
		"document.querySelector('{otp}') || !(document.body && document.body.textContent || '').includes('{prompt}')",
		otp = OTP_INPUT.replace('\'', "\\'"),
		prompt = VERIFY_PROMPT,
	);
	page.wait_for_function(&race, settings.selector_timeout).await?;

	let probe = format!("!!document.querySelector('{}')", OTP_INPUT.replace('\'', "\\'"));
	let requires_otp = page.evaluate(&probe).await? == Value::Bool(true);
	if !requires_otp {
		debug!("no 2FA prompt");
		return Ok(());
	}

	let Some(secret) = &login.otp_secret else {
		return Err(AuthError::TwoFactorRequired.into());
	};
	let code = totp::generate(secret.expose())?;

	info!("answering 2FA prompt");
	page.wait_for_selector(OTP_INPUT, settings.selector_timeout).await?;
	page.type_text(OTP_INPUT, &code, settings.typing_delay).await?;
	page.click(OTP_SUBMIT).await?;
	page.wait_for_navigation(settings.navigation_timeout).await?;
	Ok(())
}

/// A 403 document or an interstitial title means the automation was detected.
pub(crate) async fn ensure_not_blocked(page: &mut dyn BrowserPage, status: Option<u16>) -> Result<(), KickError> {
	if status == Some(403) {
		return Err(KickError::Blocked(
			"request blocked by anti-bot protection (HTTP 403)".to_string(),
		));
	}
	if let Ok(title) = page.title().await
		&& is_challenge_title(&title)
	{
		return Err(KickError::Blocked(format!("anti-bot challenge page: {title}")));
	}
	Ok(())
}

fn bearer_token(header: &str) -> Option<String> {
	let (_, token) = header.split_once("Bearer ")?;
	let token = token.trim();
	(!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn login_inputs_are_validated() {
		assert_eq!(
			LoginCredentials::new(" ", "pw", None).unwrap_err(),
			AuthError::MissingField("username")
		);
		assert_eq!(
			LoginCredentials::new("me", "", None).unwrap_err(),
			AuthError::MissingField("password")
		);
		let ok = LoginCredentials::new("me", "pw", Some("  ".to_string())).unwrap();
		assert!(ok.otp_secret.is_none());
	}

	#[test]
	fn bearer_header_parsing() {
		assert_eq!(bearer_token("Bearer abc|def"), Some("abc|def".to_string()));
		assert_eq!(bearer_token("Bearer "), None);
		assert_eq!(bearer_token("Basic xyz"), None);
	}
}
