#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};
use url::Url;

use super::stealth::launch_args;
use super::{BrowserConfig, BrowserError, BrowserLauncher, BrowserPage, CdpPage};

const CANDIDATES: [&str; 5] = [
	"chromium",
	"chromium-browser",
	"google-chrome",
	"google-chrome-stable",
	"chrome",
];

const DEVTOOLS_PREFIX: &str = "DevTools listening on ";

/// A running Chromium and its throwaway profile. Killed on drop as a last resort.
pub struct BrowserProcess {
	child: Child,
	profile: TempDir,
}

impl BrowserProcess {
	pub async fn shutdown(mut self) {
		if let Err(e) = self.child.kill().await {
			debug!(error = %e, "browser process already gone");
		}
		let path = self.profile.path().to_path_buf();
		if let Err(e) = self.profile.close() {
			warn!(path = %path.display(), error = %e, "failed to remove browser profile");
		}
	}
}

/// Launches an isolated Chromium per page.
#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
	cfg: BrowserConfig,
	http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TargetInfo {
	#[serde(rename = "type")]
	kind: String,
	#[serde(rename = "webSocketDebuggerUrl")]
	ws_url: Option<String>,
}

impl ChromiumLauncher {
	pub fn new(cfg: BrowserConfig) -> Self {
		Self {
			cfg,
			http: reqwest::Client::new(),
		}
	}

	pub fn config(&self) -> &BrowserConfig {
		&self.cfg
	}

	fn executable(&self) -> Result<PathBuf, BrowserError> {
		if let Some(path) = &self.cfg.executable {
			return Ok(path.clone());
		}
		find_on_path(std::env::var_os("PATH").as_deref()).ok_or_else(|| BrowserError::LaunchFailed {
			reason: format!("no chromium executable found on PATH (tried {})", CANDIDATES.join(", ")),
		})
	}

	async fn spawn(&self) -> Result<(BrowserProcess, Url), BrowserError> {
		let exe = self.executable()?;
		let profile = tempfile::Builder::new()
			.prefix("kickkit-profile-")
			.tempdir()
			.map_err(|e| BrowserError::LaunchFailed {
				reason: format!("failed to create profile directory: {e}"),
			})?;

		let mut child = Command::new(&exe)
			.args(launch_args(self.cfg.headless))
			.arg(format!("--user-data-dir={}", profile.path().display()))
			.arg("--remote-debugging-port=0")
			.arg("about:blank")
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| BrowserError::LaunchFailed {
				reason: format!("{}: {e}", exe.display()),
			})?;

		let Some(stderr) = child.stderr.take() else {
			return Err(BrowserError::LaunchFailed {
				reason: "browser stderr was not captured".to_string(),
			});
		};
		let process = BrowserProcess { child, profile };

		let timeout = self.cfg.navigation_timeout;
		match tokio::time::timeout(timeout, devtools_endpoint(stderr)).await {
			Ok(Ok(url)) => {
				info!(exe = %exe.display(), devtools = %url, "browser launched");
				Ok((process, url))
			}
			Ok(Err(e)) => {
				process.shutdown().await;
				Err(e)
			}
			Err(_) => {
				process.shutdown().await;
				Err(BrowserError::Timeout {
					method: "browser launch".to_string(),
					duration: timeout,
				})
			}
		}
	}

	/// First page target's websocket URL, creating one if the browser has none.
	async fn page_ws_url(&self, browser_ws: &Url) -> Result<String, BrowserError> {
		let host = browser_ws.host_str().unwrap_or("127.0.0.1");
		let port = browser_ws.port().ok_or_else(|| BrowserError::protocol("DevTools url has no port"))?;
		let base = format!("http://{host}:{port}");

		let targets: Vec<TargetInfo> = self
			.http
			.get(format!("{base}/json/list"))
			.send()
			.await
			.and_then(|r| r.error_for_status())
			.map_err(|e| BrowserError::ConnectionFailed {
				url: base.clone(),
				reason: e.to_string(),
			})?
			.json()
			.await
			.map_err(|e| BrowserError::protocol(format!("bad /json/list body: {e}")))?;

		if let Some(ws) = targets.into_iter().find(|t| t.kind == "page").and_then(|t| t.ws_url) {
			return Ok(ws);
		}

		let created: TargetInfo = self
			.http
			.put(format!("{base}/json/new?about:blank"))
			.send()
			.await
			.and_then(|r| r.error_for_status())
			.map_err(|e| BrowserError::ConnectionFailed {
				url: base.clone(),
				reason: e.to_string(),
			})?
			.json()
			.await
			.map_err(|e| BrowserError::protocol(format!("bad /json/new body: {e}")))?;

		created
			.ws_url
			.ok_or_else(|| BrowserError::protocol("new target has no webSocketDebuggerUrl"))
	}
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
	async fn launch(&self) -> Result<Box<dyn BrowserPage>, BrowserError> {
		metrics::counter!("kickkit_browser_launches_total").increment(1);
		let (process, browser_ws) = self.spawn().await?;

		let page_ws = match self.page_ws_url(&browser_ws).await {
			Ok(ws) => ws,
			Err(e) => {
				process.shutdown().await;
				return Err(e);
			}
		};

		let page = CdpPage::attach(&page_ws, self.cfg.clone(), Some(process)).await?;
		Ok(Box::new(page))
	}
}

/// Read stderr until Chromium prints its DevTools endpoint, then keep draining it in the background.
async fn devtools_endpoint(stderr: ChildStderr) -> Result<Url, BrowserError> {
	let mut lines = BufReader::new(stderr).lines();
	loop {
		let line = lines.next_line().await.map_err(|e| BrowserError::LaunchFailed {
			reason: format!("failed to read browser output: {e}"),
		})?;
		let Some(line) = line else {
			return Err(BrowserError::LaunchFailed {
				reason: "browser exited before exposing DevTools".to_string(),
			});
		};

		if let Some(url) = parse_devtools_line(&line) {
			tokio::spawn(async move {
				while let Ok(Some(line)) = lines.next_line().await {
					debug!(target: "kickkit_platform::browser::chromium", "{line}");
				}
			});
			return Ok(url);
		}
		debug!(target: "kickkit_platform::browser::chromium", "{line}");
	}
}

fn parse_devtools_line(line: &str) -> Option<Url> {
	let rest = line.trim().strip_prefix(DEVTOOLS_PREFIX)?;
	Url::parse(rest.trim()).ok().filter(|u| u.scheme() == "ws")
}

fn find_on_path(path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
	let path = path?;
	std::env::split_paths(path).find_map(|dir| {
		CANDIDATES
			.iter()
			.map(|name| dir.join(name))
			.find(|p| is_executable_file(p))
	})
}

fn is_executable_file(p: &Path) -> bool {
	p.metadata().map(|m| m.is_file()).unwrap_or(false)
}
