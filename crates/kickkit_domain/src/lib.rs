#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown event kind: {0}")]
	UnknownEventKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Caller-facing event kinds: the eleven chat kinds plus the client lifecycle kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
	Ready,
	ChatMessage,
	Subscription,
	GiftedSubscriptions,
	StreamHost,
	MessageDeleted,
	UserBanned,
	UserUnbanned,
	PinnedMessageCreated,
	PinnedMessageDeleted,
	PollUpdate,
	PollDelete,
	Disconnect,
	Error,
}

impl EventKind {
	/// Every kind, in declaration order.
	pub const ALL: [EventKind; 14] = [
		EventKind::Ready,
		EventKind::ChatMessage,
		EventKind::Subscription,
		EventKind::GiftedSubscriptions,
		EventKind::StreamHost,
		EventKind::MessageDeleted,
		EventKind::UserBanned,
		EventKind::UserUnbanned,
		EventKind::PinnedMessageCreated,
		EventKind::PinnedMessageDeleted,
		EventKind::PollUpdate,
		EventKind::PollDelete,
		EventKind::Disconnect,
		EventKind::Error,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Ready => "ready",
			EventKind::ChatMessage => "ChatMessage",
			EventKind::Subscription => "Subscription",
			EventKind::GiftedSubscriptions => "GiftedSubscriptions",
			EventKind::StreamHost => "StreamHost",
			EventKind::MessageDeleted => "MessageDeleted",
			EventKind::UserBanned => "UserBanned",
			EventKind::UserUnbanned => "UserUnbanned",
			EventKind::PinnedMessageCreated => "PinnedMessageCreated",
			EventKind::PinnedMessageDeleted => "PinnedMessageDeleted",
			EventKind::PollUpdate => "PollUpdate",
			EventKind::PollDelete => "PollDelete",
			EventKind::Disconnect => "disconnect",
			EventKind::Error => "error",
		}
	}

	/// True for kinds emitted by the client itself rather than decoded from the chat stream.
	pub const fn is_lifecycle(self) -> bool {
		matches!(self, EventKind::Ready | EventKind::Disconnect | EventKind::Error)
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		EventKind::ALL
			.into_iter()
			.find(|kind| kind.as_str() == s)
			.ok_or_else(|| ParseIdError::UnknownEventKind(s.to_string()))
	}
}

/// Numeric channel identifier assigned by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		parse_numeric(s).map(Self)
	}
}

/// Numeric chatroom identifier; the realtime topic is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatroomId(pub u64);

impl fmt::Display for ChatroomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ChatroomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		parse_numeric(s).map(Self)
	}
}

fn parse_numeric(s: &str) -> Result<u64, ParseIdError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ParseIdError::Empty);
	}
	s.parse::<u64>()
		.map_err(|_| ParseIdError::InvalidFormat(format!("expected a numeric id, got {s}")))
}

/// Channel slug as it appears in channel URLs. Deserializing goes through [`ChannelSlug::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelSlug(String);

impl ChannelSlug {
	/// Create a non-empty slug. Surrounding whitespace is dropped.
	pub fn new(slug: impl Into<String>) -> Result<Self, ParseIdError> {
		let slug = slug.into();
		let trimmed = slug.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.contains('/') || trimmed.contains('?') || trimmed.contains('#') {
			return Err(ParseIdError::InvalidFormat(format!("slug must not contain URL separators: {trimmed}")));
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelSlug {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for ChannelSlug {
	type Error = ParseIdError;

	fn try_from(slug: String) -> Result<Self, Self::Error> {
		Self::new(slug)
	}
}

impl From<ChannelSlug> for String {
	fn from(slug: ChannelSlug) -> Self {
		slug.0
	}
}

impl FromStr for ChannelSlug {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelSlug::new(s.to_string())
	}
}

/// Identity of the channel a client is attached to. Resolved once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
	pub channel_id: ChannelId,
	pub chatroom_id: ChatroomId,
	pub slug: ChannelSlug,
	/// Username of the channel owner.
	pub display_user: String,
}

impl ChannelIdentity {
	/// Public user view announced with the `ready` event.
	pub fn public_user(&self) -> PublicUser {
		PublicUser {
			id: self.channel_id,
			username: self.slug.as_str().to_string(),
			tag: self.display_user.clone(),
		}
	}
}

/// Public identity of the attached channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicUser {
	pub id: ChannelId,
	pub username: String,
	pub tag: String,
}

/// Realtime topic helpers for chatroom subscriptions.
pub struct ChatroomTopic;

impl ChatroomTopic {
	/// Prefix for chatroom topics.
	pub const PREFIX: &'static str = "chatrooms.";

	/// Version suffix for chatroom topics.
	pub const SUFFIX: &'static str = ".v2";

	/// Format a chatroom topic (e.g. `chatrooms.25.v2`).
	pub fn format(chatroom: ChatroomId) -> String {
		format!("{}{}{}", Self::PREFIX, chatroom.0, Self::SUFFIX)
	}

	/// Parse a chatroom topic of the form `chatrooms.<id>.v2`.
	pub fn parse(s: &str) -> Result<ChatroomId, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let id = s
			.strip_prefix(Self::PREFIX)
			.and_then(|rest| rest.strip_suffix(Self::SUFFIX))
			.ok_or_else(|| ParseIdError::InvalidFormat("expected chatrooms.<id>.v2".into()))?;

		id.parse()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn event_kind_parse_and_display() {
		assert_eq!("ready".parse::<EventKind>().unwrap(), EventKind::Ready);
		assert_eq!("PollDelete".parse::<EventKind>().unwrap(), EventKind::PollDelete);
		assert_eq!(EventKind::Disconnect.to_string(), "disconnect");
		assert!("chatmessage".parse::<EventKind>().is_err());
	}

	#[test]
	fn event_kind_names_are_unique() {
		let mut names: Vec<&str> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
		names.sort_unstable();
		names.dedup();
		assert_eq!(names.len(), EventKind::ALL.len());
	}

	#[test]
	fn lifecycle_kinds() {
		let lifecycle: Vec<EventKind> = EventKind::ALL.into_iter().filter(|k| k.is_lifecycle()).collect();
		assert_eq!(lifecycle, vec![EventKind::Ready, EventKind::Disconnect, EventKind::Error]);
	}

	#[test]
	fn chatroom_topic_parse_roundtrip() {
		let topic = ChatroomTopic::format(ChatroomId(25));
		assert_eq!(topic, "chatrooms.25.v2");
		assert_eq!(ChatroomTopic::parse(&topic).unwrap(), ChatroomId(25));
		assert!(ChatroomTopic::parse("chatrooms.abc.v2").is_err());
		assert!(ChatroomTopic::parse("channel.25").is_err());
	}

	#[test]
	fn rejects_bad_ids() {
		assert!(ChannelSlug::new("  ").is_err());
		assert!(ChannelSlug::new("a/b").is_err());
		assert_eq!(ChannelSlug::new(" xqc ").unwrap().as_str(), "xqc");
		assert!("".parse::<ChannelId>().is_err());
		assert!("12x".parse::<ChatroomId>().is_err());
		assert_eq!("42".parse::<ChannelId>().unwrap(), ChannelId(42));
	}

	#[test]
	fn slug_deserialize_validates() {
		let slug: ChannelSlug = serde_json::from_str("\" xqc \"").unwrap();
		assert_eq!(slug.as_str(), "xqc");
		assert_eq!(serde_json::to_string(&slug).unwrap(), "\"xqc\"");
		assert!(serde_json::from_str::<ChannelSlug>("\"   \"").is_err());
		assert!(serde_json::from_str::<ChannelSlug>("\"a/b\"").is_err());
	}

	#[test]
	fn public_user_from_identity() {
		let identity = ChannelIdentity {
			channel_id: ChannelId(7),
			chatroom_id: ChatroomId(9),
			slug: ChannelSlug::new("trainwreckstv").unwrap(),
			display_user: "Trainwreckstv".to_string(),
		};
		let user = identity.public_user();
		assert_eq!(user.id, ChannelId(7));
		assert_eq!(user.username, "trainwreckstv");
		assert_eq!(user.tag, "Trainwreckstv");
	}
}
