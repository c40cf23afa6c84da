#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

/// Browser automation failures.
#[derive(Debug, Error)]
pub enum BrowserError {
	/// No usable Chromium binary, or the process died before exposing DevTools.
	#[error("failed to launch browser: {reason}")]
	LaunchFailed { reason: String },

	#[error("failed to connect to DevTools at {url}: {reason}")]
	ConnectionFailed { url: String, reason: String },

	/// A CDP command returned an error response.
	#[error("CDP error {code}: {message}")]
	CdpError {
		code: i64,
		message: String,
		data: Option<String>,
	},

	/// A command or a bounded wait did not complete in time.
	#[error("'{method}' timed out after {duration:?}")]
	Timeout { method: String, duration: Duration },

	#[error("CDP protocol error: {detail}")]
	Protocol { detail: String },

	#[error("element not found: {selector}")]
	ElementNotFound { selector: String },

	#[error("navigation failed: {reason}")]
	NavigationFailed { reason: String },

	#[error("JavaScript exception: {message}")]
	JsException { message: String },

	#[error("page load timed out after {duration:?}")]
	PageLoadTimeout { duration: Duration },

	/// Zero-size or hidden element.
	#[error("element not interactable: {reason}")]
	ElementNotInteractable { reason: String },
}

impl BrowserError {
	pub fn is_timeout(&self) -> bool {
		matches!(self, Self::Timeout { .. } | Self::PageLoadTimeout { .. })
	}

	pub(crate) fn protocol(detail: impl Into<String>) -> Self {
		Self::Protocol { detail: detail.into() }
	}
}
