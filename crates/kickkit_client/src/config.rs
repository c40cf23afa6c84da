#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use kickkit_domain::ChannelSlug;
use kickkit_platform::auth::LoginCredentials;
use kickkit_platform::browser::BrowserConfig;
use kickkit_platform::kick::DEFAULT_BASE_URL;
use kickkit_platform::kick::pusher::connection::DEFAULT_PUSHER_WS_URL;
use kickkit_platform::{AuthError, SecretString};
use serde::Deserialize;
use tracing::info;

use crate::{ClientOptions, LoginMode};

/// Default config path: `~/.kickkit/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".kickkit").join("config.toml"))
}

/// Load the config from the default path and env overrides.
pub fn load_config() -> anyhow::Result<KickkitConfig> {
	let path = default_config_path()?;
	load_config_from_path(&path)
}

/// Same as `load_config` but with an explicit config path. A missing file yields defaults.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<KickkitConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = KickkitConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct KickkitConfig {
	/// Channel slug to attach to.
	pub channel: Option<String>,
	pub client: ClientSettings,
	pub kick: KickSettings,
	pub auth: AuthSettings,
	pub browser: BrowserSettings,
	pub telemetry: TelemetrySettings,
}

impl Default for KickkitConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
	pub plain_emote: bool,
	pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct KickSettings {
	pub base_url: String,
	pub pusher_ws_url: String,
	pub request_timeout: Duration,
}

/// Either a username/password pair (browser login) or the three captured tokens.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	pub username: Option<String>,
	pub password: Option<SecretString>,
	pub otp_secret: Option<SecretString>,
	pub bearer_token: Option<SecretString>,
	pub xsrf_token: Option<SecretString>,
	pub cookies: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
	/// Chromium binary; searched on `PATH` when unset.
	pub executable: Option<PathBuf>,
	pub headless: bool,
	pub selector_timeout: Duration,
	pub navigation_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetrySettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	channel: Option<String>,

	#[serde(default)]
	client: FileClientSettings,

	#[serde(default)]
	kick: FileKickSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	browser: FileBrowserSettings,

	#[serde(default)]
	telemetry: FileTelemetrySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileClientSettings {
	plain_emote: Option<bool>,
	read_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileKickSettings {
	base_url: Option<String>,
	pusher_ws_url: Option<String>,
	request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	username: Option<String>,
	password: Option<String>,
	otp_secret: Option<String>,
	bearer_token: Option<String>,
	xsrf_token: Option<String>,
	cookies: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBrowserSettings {
	executable: Option<String>,
	headless: Option<bool>,
	selector_timeout_ms: Option<u64>,
	navigation_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTelemetrySettings {
	metrics_bind: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

fn secret(v: Option<String>) -> Option<SecretString> {
	non_blank(v).map(SecretString::new)
}

impl KickkitConfig {
	fn from_file(file: FileConfig) -> Self {
		let browser_defaults = BrowserConfig::default();

		Self {
			channel: non_blank(file.channel).map(|s| s.trim().to_string()),
			client: ClientSettings {
				plain_emote: file.client.plain_emote.unwrap_or(true),
				read_only: file.client.read_only.unwrap_or(false),
			},
			kick: KickSettings {
				base_url: non_blank(file.kick.base_url).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
				pusher_ws_url: non_blank(file.kick.pusher_ws_url).unwrap_or_else(|| DEFAULT_PUSHER_WS_URL.to_string()),
				request_timeout: Duration::from_millis(file.kick.request_timeout_ms.filter(|v| *v > 0).unwrap_or(15_000)),
			},
			auth: AuthSettings {
				username: non_blank(file.auth.username),
				password: secret(file.auth.password),
				otp_secret: secret(file.auth.otp_secret),
				bearer_token: secret(file.auth.bearer_token),
				xsrf_token: secret(file.auth.xsrf_token),
				cookies: secret(file.auth.cookies),
			},
			browser: BrowserSettings {
				executable: non_blank(file.browser.executable).map(PathBuf::from),
				headless: file.browser.headless.unwrap_or(browser_defaults.headless),
				selector_timeout: file
					.browser
					.selector_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(browser_defaults.selector_timeout),
				navigation_timeout: file
					.browser
					.navigation_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(browser_defaults.navigation_timeout),
			},
			telemetry: TelemetrySettings {
				metrics_bind: non_blank(file.telemetry.metrics_bind),
			},
		}
	}

	pub fn client_options(&self) -> ClientOptions {
		ClientOptions {
			plain_emote: self.client.plain_emote,
			read_only: self.client.read_only,
			base_url: self.kick.base_url.clone(),
			pusher_ws_url: self.kick.pusher_ws_url.clone(),
			request_timeout: self.kick.request_timeout,
			browser: BrowserConfig {
				executable: self.browser.executable.clone(),
				headless: self.browser.headless,
				selector_timeout: self.browser.selector_timeout,
				navigation_timeout: self.browser.navigation_timeout,
			},
			..ClientOptions::default()
		}
	}

	pub fn channel_slug(&self) -> anyhow::Result<ChannelSlug> {
		let raw = self.channel.as_deref().ok_or_else(|| anyhow!("no channel configured"))?;
		ChannelSlug::new(raw).with_context(|| format!("invalid channel {raw:?}"))
	}

	/// Login mode implied by the `[auth]` table. Any token setting selects token mode; otherwise a
	/// username selects browser login. `None` when nothing is configured.
	pub fn login_mode(&self) -> Result<Option<LoginMode>, AuthError> {
		let auth = &self.auth;
		if auth.bearer_token.is_some() || auth.xsrf_token.is_some() || auth.cookies.is_some() {
			let blank = || SecretString::new(String::new());
			return Ok(Some(LoginMode::Tokens {
				bearer_token: auth.bearer_token.clone().unwrap_or_else(blank),
				xsrf_token: auth.xsrf_token.clone().unwrap_or_else(blank),
				cookies: auth.cookies.clone().unwrap_or_else(blank),
			}));
		}

		let Some(username) = &auth.username else {
			return Ok(None);
		};
		let password = auth.password.as_ref().map(|p| p.expose().to_string()).unwrap_or_default();
		let otp = auth.otp_secret.as_ref().map(|s| s.expose().to_string());
		Ok(Some(LoginMode::Credentials(LoginCredentials::new(username.clone(), password, otp)?)))
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut KickkitConfig) {
	apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides_from(cfg: &mut KickkitConfig, lookup: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("KICKKIT_CHANNEL") {
		cfg.channel = Some(v);
		info!("config: channel overridden by env");
	}

	if let Some(v) = var("KICKKIT_PLAIN_EMOTE")
		&& let Some(b) = parse_env_bool(&v)
	{
		cfg.client.plain_emote = b;
		info!("client config: plain_emote overridden by env");
	}

	if let Some(v) = var("KICKKIT_READ_ONLY")
		&& let Some(b) = parse_env_bool(&v)
	{
		cfg.client.read_only = b;
		info!("client config: read_only overridden by env");
	}

	if let Some(v) = var("KICKKIT_BASE_URL") {
		cfg.kick.base_url = v;
		info!("kick config: base_url overridden by env");
	}

	if let Some(v) = var("KICKKIT_PUSHER_WS_URL") {
		cfg.kick.pusher_ws_url = v;
		info!("kick config: pusher_ws_url overridden by env");
	}

	if let Some(v) = var("KICKKIT_REQUEST_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.kick.request_timeout = Duration::from_millis(ms);
		info!("kick config: request_timeout overridden by env");
	}

	if let Some(v) = var("KICKKIT_USERNAME") {
		cfg.auth.username = Some(v);
		info!("auth config: username overridden by env");
	}

	let secrets: [(&str, &mut Option<SecretString>); 5] = [
		("KICKKIT_PASSWORD", &mut cfg.auth.password),
		("KICKKIT_OTP_SECRET", &mut cfg.auth.otp_secret),
		("KICKKIT_BEARER_TOKEN", &mut cfg.auth.bearer_token),
		("KICKKIT_XSRF_TOKEN", &mut cfg.auth.xsrf_token),
		("KICKKIT_COOKIES", &mut cfg.auth.cookies),
	];
	for (key, slot) in secrets {
		if let Some(v) = var(key) {
			*slot = Some(SecretString::new(v));
			info!(key, "auth config: secret overridden by env");
		}
	}

	if let Some(v) = var("KICKKIT_BROWSER") {
		cfg.browser.executable = Some(PathBuf::from(v));
		info!("browser config: executable overridden by env");
	}

	if let Some(v) = var("KICKKIT_HEADLESS")
		&& let Some(b) = parse_env_bool(&v)
	{
		cfg.browser.headless = b;
		info!("browser config: headless overridden by env");
	}

	if let Some(v) = var("KICKKIT_METRICS_BIND") {
		cfg.telemetry.metrics_bind = Some(v);
		info!("telemetry config: metrics_bind overridden by env");
	}
}
