#![forbid(unsafe_code)]

//! Authenticated REST commands.
//!
//! Every command checks its preconditions and arguments before touching the network, then issues
//! exactly one request. Backend rejections and transport failures are logged and reported through
//! the return value (`Ok(false)` / `Ok(None)`); they are never retried.

use std::time::Duration;

use kickkit_domain::{ChannelIdentity, ChannelSlug};
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use tracing::{debug, warn};

use super::DEFAULT_BASE_URL;
use crate::{KickError, SessionCredentials};

/// Longest chat message the backend accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

/// Everything a command reads from the façade: a credential snapshot and the resolved channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandContext<'a> {
	pub credentials: Option<&'a SessionCredentials>,
	pub identity: Option<&'a ChannelIdentity>,
}

impl<'a> CommandContext<'a> {
	pub fn new(credentials: Option<&'a SessionCredentials>, identity: Option<&'a ChannelIdentity>) -> Self {
		Self { credentials, identity }
	}

	fn session(&self) -> Result<&'a SessionCredentials, KickError> {
		match self.credentials {
			Some(creds) if creds.is_valid() => Ok(creds),
			_ => Err(KickError::precondition("no valid session; login first")),
		}
	}

	fn channel(&self) -> Result<&'a ChannelIdentity, KickError> {
		self.identity
			.ok_or_else(|| KickError::precondition("channel identity is not resolved yet"))
	}

	fn require(&self) -> Result<(&'a SessionCredentials, &'a ChannelIdentity), KickError> {
		let identity = self.channel()?;
		let creds = self.session()?;
		Ok((creds, identity))
	}
}

/// Ban length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanKind {
	Permanent,
	/// Timed ban; must be at least one minute.
	Timeout { minutes: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowMode {
	Off,
	/// Minimum seconds between messages per user; must be at least one.
	On { interval_secs: u32 },
}

#[derive(Debug, Serialize)]
struct BanBody<'a> {
	banned_username: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	duration: Option<u32>,
	permanent: bool,
}

#[derive(Debug, Serialize)]
struct SlowModeBody {
	slow_mode: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	message_interval: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SendMessageBody<'a> {
	content: &'a str,
	#[serde(rename = "type")]
	message_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct KickClient {
	base_url: String,
	client: reqwest::Client,
}

impl Default for KickClient {
	fn default() -> Self {
		Self::new(DEFAULT_BASE_URL)
	}
}

impl KickClient {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			base_url: base_url.into(),
			client: reqwest::Client::new(),
		}
	}

	/// Client whose requests give up after `timeout`.
	pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.unwrap_or_else(|e| {
				warn!(error = %e, "failed to build http client with timeout; using defaults");
				reqwest::Client::new()
			});
		Self {
			base_url: base_url.into(),
			client,
		}
	}

	pub fn base_url(&self) -> &str {
		self.base_url.trim_end_matches('/')
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url(), path)
	}

	/// Request with the shared header set. `write` adds the anti-forgery header.
	fn request(
		&self,
		method: Method,
		path: &str,
		creds: &SessionCredentials,
		referer_slug: &ChannelSlug,
		write: bool,
	) -> RequestBuilder {
		let mut req = self
			.client
			.request(method, self.url(path))
			.header("accept", "application/json")
			.header("accept-language", "en-US,en;q=0.9")
			.header("authorization", creds.bearer_header())
			.header("cache-control", "max-age=0")
			.header("cluster", "v2")
			.header("content-type", "application/json")
			.header("priority", "u=1, i")
			.header("cookie", creds.cookie_jar().expose())
			.header("Referer", format!("{}/{}", self.base_url(), referer_slug.as_str()))
			.header("Referrer-Policy", "strict-origin-when-cross-origin");
		if write {
			req = req.header("x-xsrf-token", creds.anti_forgery_token().expose());
		}
		req
	}

	/// Send once; `None` on transport failure or non-2xx.
	async fn execute(&self, op: &'static str, req: RequestBuilder) -> Option<Response> {
		match req.send().await {
			Ok(resp) if resp.status().is_success() => {
				debug!(op, status = %resp.status(), "kick command ok");
				metrics::counter!("kickkit_commands_total", "op" => op, "result" => "ok").increment(1);
				Some(resp)
			}
			Ok(resp) => {
				warn!(op, status = %resp.status(), "kick command rejected");
				metrics::counter!("kickkit_commands_total", "op" => op, "result" => "rejected").increment(1);
				None
			}
			Err(e) => {
				warn!(op, error = %e, "kick command failed");
				metrics::counter!("kickkit_commands_total", "op" => op, "result" => "error").increment(1);
				None
			}
		}
	}

	async fn execute_json(&self, op: &'static str, req: RequestBuilder) -> Option<serde_json::Value> {
		let resp = self.execute(op, req).await?;
		match resp.json::<serde_json::Value>().await {
			Ok(v) => Some(v),
			Err(e) => {
				warn!(op, error = %e, "kick command returned an unreadable body");
				None
			}
		}
	}

	pub async fn ban(&self, ctx: CommandContext<'_>, username: &str, kind: BanKind) -> Result<bool, KickError> {
		let (creds, identity) = ctx.require()?;
		let username = non_empty(username, "username")?;
		let body = match kind {
			BanKind::Permanent => BanBody {
				banned_username: username,
				duration: None,
				permanent: true,
			},
			BanKind::Timeout { minutes } if minutes >= 1 => BanBody {
				banned_username: username,
				duration: Some(minutes),
				permanent: false,
			},
			BanKind::Timeout { .. } => {
				return Err(KickError::validation("ban duration must be at least 1 minute unless permanent"));
			}
		};

		let path = format!("/api/v2/channels/{}/bans", identity.channel_id);
		let req = self.request(Method::POST, &path, creds, &identity.slug, true).json(&body);
		Ok(self.execute("ban", req).await.is_some())
	}

	pub async fn unban(&self, ctx: CommandContext<'_>, username: &str) -> Result<bool, KickError> {
		let (creds, identity) = ctx.require()?;
		let username = non_empty(username, "username")?;

		let path = format!(
			"/api/v2/channels/{}/bans/{}",
			identity.channel_id,
			urlencoding::encode(username)
		);
		let req = self.request(Method::DELETE, &path, creds, &identity.slug, true);
		Ok(self.execute("unban", req).await.is_some())
	}

	pub async fn delete_message(&self, ctx: CommandContext<'_>, message_id: &str) -> Result<bool, KickError> {
		let (creds, identity) = ctx.require()?;
		let message_id = non_empty(message_id, "message id")?;

		let path = format!(
			"/api/v2/channels/{}/messages/{}",
			identity.channel_id,
			urlencoding::encode(message_id)
		);
		let req = self.request(Method::DELETE, &path, creds, &identity.slug, true);
		Ok(self.execute("delete_message", req).await.is_some())
	}

	/// Toggle slow mode. The backend can answer 2xx with `"success": false`; that counts as failure.
	pub async fn slow_mode(&self, ctx: CommandContext<'_>, mode: SlowMode) -> Result<bool, KickError> {
		let (creds, identity) = ctx.require()?;
		let body = match mode {
			SlowMode::Off => SlowModeBody {
				slow_mode: false,
				message_interval: None,
			},
			SlowMode::On { interval_secs } if interval_secs >= 1 => SlowModeBody {
				slow_mode: true,
				message_interval: Some(interval_secs),
			},
			SlowMode::On { .. } => {
				return Err(KickError::validation("slow mode interval must be at least 1 second"));
			}
		};

		let path = format!("/api/v2/channels/{}/chatroom", urlencoding::encode(identity.slug.as_str()));
		let req = self.request(Method::PUT, &path, creds, &identity.slug, true).json(&body);
		let Some(resp) = self.execute("slow_mode", req).await else {
			return Ok(false);
		};

		let accepted = match resp.json::<serde_json::Value>().await {
			Ok(v) => v.get("success").and_then(serde_json::Value::as_bool) != Some(false),
			Err(_) => true,
		};
		if !accepted {
			warn!(channel = %identity.slug, "slow mode change reported unsuccessful");
		}
		Ok(accepted)
	}

	/// Current poll of `target` (or the resolved channel).
	pub async fn poll(
		&self,
		ctx: CommandContext<'_>,
		target: Option<&ChannelSlug>,
	) -> Result<Option<serde_json::Value>, KickError> {
		self.channel_resource(ctx, target, "polls", "poll").await
	}

	pub async fn leaderboards(
		&self,
		ctx: CommandContext<'_>,
		target: Option<&ChannelSlug>,
	) -> Result<Option<serde_json::Value>, KickError> {
		self.channel_resource(ctx, target, "leaderboards", "leaderboards").await
	}

	async fn channel_resource(
		&self,
		ctx: CommandContext<'_>,
		target: Option<&ChannelSlug>,
		resource: &str,
		op: &'static str,
	) -> Result<Option<serde_json::Value>, KickError> {
		let slug = match target {
			Some(slug) => slug,
			None => &ctx.channel()?.slug,
		};
		let creds = ctx.session()?;

		let path = format!("/api/v2/channels/{}/{}", urlencoding::encode(slug.as_str()), resource);
		let req = self.request(Method::GET, &path, creds, slug, false);
		Ok(self.execute_json(op, req).await)
	}

	/// Post a chat message to the resolved chatroom.
	pub async fn send_message(&self, ctx: CommandContext<'_>, content: &str) -> Result<bool, KickError> {
		let (creds, identity) = ctx.require()?;
		if content.trim().is_empty() {
			return Err(KickError::validation("message content must be non-empty"));
		}
		let len = content.chars().count();
		if len > MAX_MESSAGE_CHARS {
			return Err(KickError::validation(format!(
				"message is {len} characters; the limit is {MAX_MESSAGE_CHARS}"
			)));
		}

		let path = format!("/api/v2/messages/send/{}", identity.chatroom_id);
		let body = SendMessageBody {
			content,
			message_type: "message",
		};
		let req = self.request(Method::POST, &path, creds, &identity.slug, true).json(&body);
		Ok(self.execute("send_message", req).await.is_some())
	}
}

fn non_empty<'a>(value: &'a str, what: &str) -> Result<&'a str, KickError> {
	let trimmed = value.trim();
	if trimmed.is_empty() {
		return Err(KickError::validation(format!("{what} must be non-empty")));
	}
	Ok(trimmed)
}
