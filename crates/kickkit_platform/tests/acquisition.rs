#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kickkit_platform::auth::{
	AcquisitionSettings, BrowserCredentialAcquirer, CredentialAcquirer, LOGIN_BUTTON, LoginCredentials, OTP_INPUT,
	PASSWORD_INPUT, USERNAME_INPUT,
};
use kickkit_platform::browser::{BrowserCookie, BrowserError, BrowserLauncher, BrowserPage};
use kickkit_platform::{AuthError, KickError};
use parking_lot::Mutex;
use serde_json::Value;

/// What the scripted site does.
#[derive(Debug, Clone)]
struct Script {
	status: Option<u16>,
	title: &'static str,
	missing_selector: Option<&'static str>,
	requires_otp: bool,
	authorization: Option<&'static str>,
	cookies: Vec<(&'static str, &'static str)>,
}

impl Default for Script {
	fn default() -> Self {
		Self {
			status: Some(200),
			title: "Kick",
			missing_selector: None,
			requires_otp: false,
			authorization: Some("Bearer 12345|tokenvalue"),
			cookies: vec![("XSRF-TOKEN", "xsrf-value"), ("kick_session", "sess")],
		}
	}
}

#[derive(Debug, Default)]
struct Journal {
	visited: Vec<String>,
	typed: Vec<(String, String)>,
	clicked: Vec<String>,
	observing: Option<String>,
}

struct FakePage {
	script: Script,
	journal: Arc<Mutex<Journal>>,
	closes: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserPage for FakePage {
	async fn goto(&mut self, url: &str) -> Result<Option<u16>, BrowserError> {
		self.journal.lock().visited.push(url.to_string());
		Ok(self.script.status)
	}

	async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
		if self.script.missing_selector == Some(selector) {
			return Err(BrowserError::Timeout {
				method: format!("wait_for_selector({selector})"),
				duration: timeout,
			});
		}
		Ok(())
	}

	async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
		self.journal.lock().clicked.push(selector.to_string());
		Ok(())
	}

	async fn type_text(&mut self, selector: &str, text: &str, _delay: Duration) -> Result<(), BrowserError> {
		self.journal.lock().typed.push((selector.to_string(), text.to_string()));
		Ok(())
	}

	async fn wait_for_function(&mut self, _expression: &str, _timeout: Duration) -> Result<(), BrowserError> {
		Ok(())
	}

	async fn wait_for_navigation(&mut self, _timeout: Duration) -> Result<(), BrowserError> {
		Ok(())
	}

	async fn evaluate(&mut self, expression: &str) -> Result<Value, BrowserError> {
		if expression.starts_with("!!document.querySelector") {
			return Ok(Value::Bool(self.script.requires_otp));
		}
		if expression == "document.title" {
			return Ok(Value::String(self.script.title.to_string()));
		}
		Ok(Value::Null)
	}

	async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, BrowserError> {
		Ok(self
			.script
			.cookies
			.iter()
			.map(|(name, value)| BrowserCookie {
				name: name.to_string(),
				value: value.to_string(),
				domain: "kick.com".to_string(),
			})
			.collect())
	}

	async fn observe_request(&mut self, url_fragment: &str) -> Result<(), BrowserError> {
		self.journal.lock().observing = Some(url_fragment.to_string());
		Ok(())
	}

	fn observed_headers(&self) -> Option<HashMap<String, String>> {
		let auth = self.script.authorization?;
		Some(HashMap::from([("authorization".to_string(), auth.to_string())]))
	}

	async fn close(&mut self) {
		self.closes.fetch_add(1, Ordering::SeqCst);
	}
}

struct FakeLauncher {
	script: Script,
	journal: Arc<Mutex<Journal>>,
	launches: Arc<AtomicUsize>,
	closes: Arc<AtomicUsize>,
}

impl FakeLauncher {
	fn new(script: Script) -> Self {
		Self {
			script,
			journal: Arc::default(),
			launches: Arc::default(),
			closes: Arc::default(),
		}
	}
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
	async fn launch(&self) -> Result<Box<dyn BrowserPage>, BrowserError> {
		self.launches.fetch_add(1, Ordering::SeqCst);
		Ok(Box::new(FakePage {
			script: self.script.clone(),
			journal: self.journal.clone(),
			closes: self.closes.clone(),
		}))
	}
}

struct Harness {
	journal: Arc<Mutex<Journal>>,
	closes: Arc<AtomicUsize>,
	launches: Arc<AtomicUsize>,
	acquirer: BrowserCredentialAcquirer<FakeLauncher>,
}

fn harness(script: Script) -> Harness {
	let launcher = FakeLauncher::new(script);
	let (journal, closes, launches) = (
		launcher.journal.clone(),
		launcher.closes.clone(),
		launcher.launches.clone(),
	);
	let settings = AcquisitionSettings {
		base_url: "https://site.test".to_string(),
		typing_delay: Duration::ZERO,
		..AcquisitionSettings::default()
	};
	Harness {
		journal,
		closes,
		launches,
		acquirer: BrowserCredentialAcquirer::new(launcher, settings),
	}
}

fn login(otp: Option<&str>) -> LoginCredentials {
	LoginCredentials::new("viewer", "hunter2", otp.map(str::to_string)).expect("login inputs")
}

#[tokio::test]
async fn successful_login_captures_all_three_values() {
	let h = harness(Script::default());
	let creds = h.acquirer.acquire(&login(None)).await.expect("acquire");

	assert_eq!(creds.authorization_token().expose(), "12345|tokenvalue");
	assert_eq!(creds.anti_forgery_token().expose(), "xsrf-value");
	assert_eq!(creds.cookie_jar().expose(), "XSRF-TOKEN=xsrf-value; kick_session=sess");
	assert_eq!(h.closes.load(Ordering::SeqCst), 1);
	assert_eq!(h.launches.load(Ordering::SeqCst), 1);

	let journal = h.journal.lock();
	assert_eq!(journal.observing.as_deref(), Some("/api/v2/channels/followed"));
	assert_eq!(
		journal.visited,
		vec![
			"https://site.test/".to_string(),
			"https://site.test/api/v2/channels/followed".to_string()
		]
	);
	assert_eq!(journal.clicked.first().map(String::as_str), Some(LOGIN_BUTTON));
	assert_eq!(
		journal.typed,
		vec![
			(USERNAME_INPUT.to_string(), "viewer".to_string()),
			(PASSWORD_INPUT.to_string(), "hunter2".to_string()),
		]
	);
}

#[tokio::test]
async fn missing_bearer_token_is_named_and_browser_closed_once() {
	let h = harness(Script {
		authorization: None,
		..Script::default()
	});
	let err = h.acquirer.acquire(&login(None)).await.unwrap_err();
	assert!(matches!(err, KickError::Auth(AuthError::MissingBearerToken)), "{err:?}");
	assert_eq!(h.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_cookies_and_xsrf_are_distinguished() {
	let h = harness(Script {
		cookies: vec![],
		..Script::default()
	});
	let err = h.acquirer.acquire(&login(None)).await.unwrap_err();
	assert!(matches!(err, KickError::Auth(AuthError::MissingCookies)), "{err:?}");

	let h = harness(Script {
		cookies: vec![("kick_session", "sess")],
		..Script::default()
	});
	let err = h.acquirer.acquire(&login(None)).await.unwrap_err();
	assert!(matches!(err, KickError::Auth(AuthError::MissingXsrfToken)), "{err:?}");
	assert_eq!(h.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn two_factor_without_secret_is_terminal() {
	let h = harness(Script {
		requires_otp: true,
		..Script::default()
	});
	let err = h.acquirer.acquire(&login(None)).await.unwrap_err();
	assert!(matches!(err, KickError::Auth(AuthError::TwoFactorRequired)), "{err:?}");
	assert_eq!(h.closes.load(Ordering::SeqCst), 1);
	assert_eq!(h.journal.lock().visited.len(), 1);
}

#[tokio::test]
async fn two_factor_with_secret_types_a_code() {
	let h = harness(Script {
		requires_otp: true,
		..Script::default()
	});
	h.acquirer
		.acquire(&login(Some("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ")))
		.await
		.expect("acquire");

	let journal = h.journal.lock();
	let (_, code) = journal
		.typed
		.iter()
		.find(|(sel, _)| sel == OTP_INPUT)
		.expect("otp typed");
	assert_eq!(code.len(), 6);
	assert!(code.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn blocked_page_is_reported_and_closed() {
	let h = harness(Script {
		status: Some(403),
		..Script::default()
	});
	let err = h.acquirer.acquire(&login(None)).await.unwrap_err();
	assert!(matches!(err, KickError::Blocked(_)), "{err:?}");
	assert_eq!(h.closes.load(Ordering::SeqCst), 1);

	let h = harness(Script {
		title: "Just a moment...",
		..Script::default()
	});
	let err = h.acquirer.acquire(&login(None)).await.unwrap_err();
	assert!(matches!(err, KickError::Blocked(_)), "{err:?}");
}

#[tokio::test]
async fn missing_login_form_times_out() {
	let h = harness(Script {
		missing_selector: Some(LOGIN_BUTTON),
		..Script::default()
	});
	let err = h.acquirer.acquire(&login(None)).await.unwrap_err();
	assert!(matches!(err, KickError::Timeout(_)), "{err:?}");
	assert_eq!(h.closes.load(Ordering::SeqCst), 1);
}
