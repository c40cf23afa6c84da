#![forbid(unsafe_code)]

//! Read-only channel and video metadata, fetched through a real browser page because the
//! endpoints sit behind the site's anti-bot layer.

use async_trait::async_trait;
use kickkit_domain::{ChannelId, ChannelIdentity, ChannelSlug, ChatroomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::DEFAULT_BASE_URL;
use crate::KickError;
use crate::auth::ensure_not_blocked;
use crate::browser::{BrowserLauncher, BrowserPage};

#[async_trait]
pub trait ChannelDirectory: Send + Sync {
	async fn channel(&self, slug: &ChannelSlug) -> Result<ChannelIdentity, KickError>;

	async fn video(&self, video_id: &str) -> Result<VideoInfo, KickError>;
}

/// Summary of a past broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
	pub id: Option<u64>,
	pub title: Option<String>,
	pub thumbnail: Option<Value>,
	pub duration: Option<u64>,
	pub live_stream_id: Option<u64>,
	pub start_time: Option<String>,
	pub created_at: Option<String>,
	pub updated_at: Option<String>,
	pub uuid: Option<String>,
	pub views: Option<u64>,
	/// Playback source URL.
	pub stream: Option<String>,
	pub language: Option<String>,
	pub livestream: Value,
	pub channel: Value,
}

impl VideoInfo {
	pub fn from_json(raw: &Value) -> Result<Self, KickError> {
		let Some(livestream) = raw.get("livestream").filter(|v| v.is_object()) else {
			return Err(KickError::Network("video response has no livestream object".to_string()));
		};
		let str_of = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);
		let u64_of = |v: &Value, key: &str| v.get(key).and_then(Value::as_u64);

		Ok(Self {
			id: u64_of(raw, "id"),
			title: str_of(livestream, "session_title"),
			thumbnail: livestream.get("thumbnail").cloned().filter(|v| !v.is_null()),
			duration: u64_of(livestream, "duration"),
			live_stream_id: u64_of(raw, "live_stream_id"),
			start_time: str_of(livestream, "start_time"),
			created_at: str_of(raw, "created_at"),
			updated_at: str_of(raw, "updated_at"),
			uuid: str_of(raw, "uuid"),
			views: u64_of(raw, "views"),
			stream: str_of(raw, "source"),
			language: str_of(livestream, "language"),
			livestream: livestream.clone(),
			channel: livestream.get("channel").cloned().unwrap_or(Value::Null),
		})
	}
}

#[derive(Debug, Deserialize)]
struct ChannelResponse {
	id: u64,
	slug: String,
	chatroom: ChatroomRef,
	user: Option<UserRef>,
}

#[derive(Debug, Deserialize)]
struct ChatroomRef {
	id: u64,
}

#[derive(Debug, Deserialize)]
struct UserRef {
	username: String,
}

/// Parse `/api/v2/channels/<slug>`.
pub fn channel_identity_from_json(raw: Value) -> Result<ChannelIdentity, KickError> {
	let resp: ChannelResponse =
		serde_json::from_value(raw).map_err(|e| KickError::Network(format!("unexpected channel response: {e}")))?;
	let slug = ChannelSlug::new(resp.slug).map_err(|e| KickError::Network(format!("channel response slug: {e}")))?;
	let display_user = resp.user.map(|u| u.username).unwrap_or_else(|| slug.as_str().to_string());
	Ok(ChannelIdentity {
		channel_id: ChannelId(resp.id),
		chatroom_id: ChatroomId(resp.chatroom.id),
		slug,
		display_user,
	})
}

pub struct BrowserChannelDirectory<L> {
	launcher: L,
	base_url: String,
}

impl<L: BrowserLauncher> BrowserChannelDirectory<L> {
	pub fn new(launcher: L) -> Self {
		Self::with_base_url(launcher, DEFAULT_BASE_URL)
	}

	pub fn with_base_url(launcher: L, base_url: impl Into<String>) -> Self {
		Self {
			launcher,
			base_url: base_url.into(),
		}
	}

	/// One page per lookup, closed on every path.
	async fn fetch_json(&self, path: &str) -> Result<Value, KickError> {
		let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
		let mut page = self.launcher.launch().await?;
		let result = read_json_page(page.as_mut(), &url).await;
		page.close().await;
		result
	}
}

async fn read_json_page(page: &mut dyn BrowserPage, url: &str) -> Result<Value, KickError> {
	let status = page.goto(url).await?;
	ensure_not_blocked(page, status).await?;
	if let Some(code) = status
		&& !(200..300).contains(&code)
	{
		return Err(KickError::Network(format!("{url} failed: status={code}")));
	}

	let body = page.body_text().await?;
	serde_json::from_str(body.trim()).map_err(|e| KickError::Network(format!("{url} returned non-JSON body: {e}")))
}

#[async_trait]
impl<L: BrowserLauncher> ChannelDirectory for BrowserChannelDirectory<L> {
	async fn channel(&self, slug: &ChannelSlug) -> Result<ChannelIdentity, KickError> {
		debug!(channel = %slug, "fetching channel metadata");
		let raw = self
			.fetch_json(&format!("/api/v2/channels/{}", urlencoding::encode(slug.as_str())))
			.await?;
		let identity = channel_identity_from_json(raw)?;
		info!(
			channel = %identity.slug,
			channel_id = %identity.channel_id,
			chatroom_id = %identity.chatroom_id,
			"channel resolved"
		);
		Ok(identity)
	}

	async fn video(&self, video_id: &str) -> Result<VideoInfo, KickError> {
		let video_id = video_id.trim();
		if video_id.is_empty() {
			return Err(KickError::validation("video id must be non-empty"));
		}
		let raw = self
			.fetch_json(&format!("/api/v1/video/{}", urlencoding::encode(video_id)))
			.await?;
		VideoInfo::from_json(&raw)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn channel_identity_parsing() {
		let raw = json!({
			"id": 668,
			"slug": "xqc",
			"chatroom": { "id": 668, "slow_mode": false },
			"user": { "username": "xQc", "id": 676 },
			"followers_count": 1
		});
		let identity = channel_identity_from_json(raw).unwrap();
		assert_eq!(identity.channel_id, ChannelId(668));
		assert_eq!(identity.chatroom_id, ChatroomId(668));
		assert_eq!(identity.slug.as_str(), "xqc");
		assert_eq!(identity.display_user, "xQc");
	}

	#[test]
	fn channel_without_chatroom_is_rejected() {
		let raw = json!({ "id": 1, "slug": "a" });
		assert!(matches!(channel_identity_from_json(raw), Err(KickError::Network(_))));
	}

	#[test]
	fn video_summary() {
		let raw = json!({
			"id": 5,
			"live_stream_id": 77,
			"uuid": "abc-123",
			"views": 1200,
			"source": "https://stream.example/master.m3u8",
			"created_at": "2024-01-01T00:00:00Z",
			"updated_at": "2024-01-02T00:00:00Z",
			"livestream": {
				"session_title": "late night",
				"thumbnail": { "src": "https://img.example/t.jpg" },
				"duration": 3600,
				"start_time": "2024-01-01 00:00:00",
				"language": "English",
				"channel": { "slug": "someone" }
			}
		});
		let info = VideoInfo::from_json(&raw).unwrap();
		assert_eq!(info.id, Some(5));
		assert_eq!(info.title.as_deref(), Some("late night"));
		assert_eq!(info.duration, Some(3600));
		assert_eq!(info.stream.as_deref(), Some("https://stream.example/master.m3u8"));
		assert_eq!(info.channel, json!({ "slug": "someone" }));
	}

	#[test]
	fn video_without_livestream_is_rejected() {
		assert!(VideoInfo::from_json(&json!({ "id": 5 })).is_err());
	}
}
