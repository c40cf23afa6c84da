#![forbid(unsafe_code)]

//! Headless browser control surface.
//!
//! The acquisition flow and the metadata directory only see [`BrowserLauncher`] and
//! [`BrowserPage`]; the Chromium/CDP implementation lives behind them.

pub mod cdp;
pub mod driver;
pub mod error;
pub mod launch;
pub mod stealth;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub use driver::CdpPage;
pub use error::BrowserError;
pub use launch::ChromiumLauncher;

#[derive(Debug, Clone)]
pub struct BrowserConfig {
	/// Chromium binary; searched on `PATH` when unset.
	pub executable: Option<PathBuf>,
	pub headless: bool,
	/// Bound for selector and predicate waits.
	pub selector_timeout: Duration,
	/// Bound for page loads and the DevTools handshake.
	pub navigation_timeout: Duration,
}

impl Default for BrowserConfig {
	fn default() -> Self {
		Self {
			executable: None,
			headless: true,
			selector_timeout: Duration::from_millis(6000),
			navigation_timeout: Duration::from_millis(30_000),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
	pub name: String,
	pub value: String,
	pub domain: String,
}

/// `name=value; name=value`, in page order.
pub fn serialize_cookie_jar(cookies: &[BrowserCookie]) -> String {
	cookies
		.iter()
		.map(|c| format!("{}={}", c.name, c.value))
		.collect::<Vec<_>>()
		.join("; ")
}

/// One isolated browser tab. Implementations own whatever process backs it; `close` releases it.
#[async_trait]
pub trait BrowserPage: Send {
	/// Navigate and wait for the load event. Returns the main document's HTTP status when known.
	async fn goto(&mut self, url: &str) -> Result<Option<u16>, BrowserError>;

	async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;

	async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;

	/// Type into the element, pausing `delay` between characters.
	async fn type_text(&mut self, selector: &str, text: &str, delay: Duration) -> Result<(), BrowserError>;

	/// Poll a JavaScript expression until it is truthy.
	async fn wait_for_function(&mut self, expression: &str, timeout: Duration) -> Result<(), BrowserError>;

	/// Wait for the next load event.
	async fn wait_for_navigation(&mut self, timeout: Duration) -> Result<(), BrowserError>;

	async fn evaluate(&mut self, expression: &str) -> Result<Value, BrowserError>;

	async fn title(&mut self) -> Result<String, BrowserError> {
		let v = self.evaluate("document.title").await?;
		Ok(v.as_str().unwrap_or_default().to_string())
	}

	async fn body_text(&mut self) -> Result<String, BrowserError> {
		let v = self.evaluate("document.body ? document.body.innerText : ''").await?;
		Ok(v.as_str().unwrap_or_default().to_string())
	}

	async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, BrowserError>;

	/// Start recording the headers of the first request whose URL contains `url_fragment`.
	/// Must be installed before the navigation that triggers the request.
	async fn observe_request(&mut self, url_fragment: &str) -> Result<(), BrowserError>;

	/// Headers of the observed request (lower-cased names), once it has been seen.
	fn observed_headers(&self) -> Option<HashMap<String, String>>;

	/// Release the tab and its backing process. Safe to call more than once.
	async fn close(&mut self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
	/// A fresh, isolated page with the stealth posture already applied.
	async fn launch(&self) -> Result<Box<dyn BrowserPage>, BrowserError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cookie_jar_format() {
		let cookies = vec![
			BrowserCookie {
				name: "XSRF-TOKEN".to_string(),
				value: "abc".to_string(),
				domain: "kick.com".to_string(),
			},
			BrowserCookie {
				name: "session".to_string(),
				value: "s%3D1".to_string(),
				domain: ".kick.com".to_string(),
			},
		];
		assert_eq!(serialize_cookie_jar(&cookies), "XSRF-TOKEN=abc; session=s%3D1");
		assert_eq!(serialize_cookie_jar(&[]), "");
	}
}
