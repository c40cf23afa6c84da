#![forbid(unsafe_code)]

//! Pusher envelope codec for the chatroom stream.
//!
//! Inbound frames look like `{"event": "<tag>", "data": "<json string>", "channel": "..."}`. Domain
//! tags live under the `App\Events\` namespace; `pusher:*` tags are protocol control frames.

pub mod connection;

use std::borrow::Cow;
use std::sync::OnceLock;

use kickkit_domain::{ChatroomId, ChatroomTopic, EventKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionState, PusherConfig, connect};

/// Namespace shared by every domain event tag.
pub const EVENT_NAMESPACE: &str = "App\\Events\\";

const EVENT_TAGS: [(&str, EventKind); 11] = [
	("App\\Events\\ChatMessageEvent", EventKind::ChatMessage),
	("App\\Events\\SubscriptionEvent", EventKind::Subscription),
	("App\\Events\\GiftedSubscriptionsEvent", EventKind::GiftedSubscriptions),
	("App\\Events\\StreamHostEvent", EventKind::StreamHost),
	("App\\Events\\MessageDeletedEvent", EventKind::MessageDeleted),
	("App\\Events\\UserBannedEvent", EventKind::UserBanned),
	("App\\Events\\UserUnbannedEvent", EventKind::UserUnbanned),
	("App\\Events\\PinnedMessageCreatedEvent", EventKind::PinnedMessageCreated),
	("App\\Events\\PinnedMessageDeletedEvent", EventKind::PinnedMessageDeleted),
	("App\\Events\\PollUpdateEvent", EventKind::PollUpdate),
	("App\\Events\\PollDeleteEvent", EventKind::PollDelete),
];

/// Map a wire tag to its domain kind (exact match).
pub fn event_kind_for_tag(tag: &str) -> Option<EventKind> {
	EVENT_TAGS.iter().find(|(t, _)| *t == tag).map(|(_, kind)| *kind)
}

/// Decode failures. Never fatal for the stream: the frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
	#[error("malformed envelope: {0}")]
	Envelope(String),

	#[error("malformed {tag} payload: {reason}")]
	Payload { tag: String, reason: String },
}

/// Chat message payload, kept exactly as it arrived.
///
/// Only `content` is ever rewritten (emote placeholders, when it is a string). The accessors read
/// the commonly used fields and return `None` for anything absent or of an unexpected shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage(Value);

impl ChatMessage {
	pub fn from_value(raw: Value) -> Self {
		Self(raw)
	}

	/// Message id. The wire has used both strings and numbers.
	pub fn id(&self) -> Option<&Value> {
		self.0.get("id")
	}

	pub fn chatroom_id(&self) -> Option<&Value> {
		self.0.get("chatroom_id")
	}

	pub fn content(&self) -> Option<&str> {
		self.str_field("content")
	}

	pub fn message_type(&self) -> Option<&str> {
		self.str_field("type")
	}

	pub fn created_at(&self) -> Option<&str> {
		self.str_field("created_at")
	}

	/// Sender object (id, username, slug, identity), as received.
	pub fn sender(&self) -> Option<&Value> {
		self.0.get("sender")
	}

	pub fn sender_username(&self) -> Option<&str> {
		self.sender()?.get("username")?.as_str()
	}

	pub fn as_value(&self) -> &Value {
		&self.0
	}

	pub fn into_value(self) -> Value {
		self.0
	}

	/// Replace `[emote:<id>:<name>]` placeholders in `content` with the emote name.
	pub fn with_plain_emotes(mut self) -> Self {
		let plain = self.content().and_then(|content| match strip_emote_placeholders(content) {
			Cow::Owned(plain) => Some(plain),
			Cow::Borrowed(_) => None,
		});
		if let Some(plain) = plain
			&& let Some(slot) = self.0.get_mut("content")
		{
			*slot = Value::String(plain);
		}
		self
	}

	fn str_field(&self, key: &str) -> Option<&str> {
		self.0.get(key)?.as_str()
	}
}

impl From<Value> for ChatMessage {
	fn from(raw: Value) -> Self {
		Self(raw)
	}
}

fn emote_placeholder() -> Option<&'static Regex> {
	static EMOTE_RE: OnceLock<Option<Regex>> = OnceLock::new();
	EMOTE_RE
		.get_or_init(|| Regex::new(r"\[emote:(\d+):(\w+)\]").ok())
		.as_ref()
}

/// Rewrite inline emote placeholders to their visible name.
pub fn strip_emote_placeholders(content: &str) -> Cow<'_, str> {
	match emote_placeholder() {
		Some(re) => re.replace_all(content, "$2"),
		None => Cow::Borrowed(content),
	}
}

/// Typed domain event decoded from one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum KickEvent {
	ChatMessage(ChatMessage),
	Subscription(Value),
	GiftedSubscriptions(Value),
	StreamHost(Value),
	MessageDeleted(Value),
	UserBanned(Value),
	UserUnbanned(Value),
	PinnedMessageCreated(Value),
	PinnedMessageDeleted(Value),
	PollUpdate(Value),
	PollDelete(Value),
}

impl KickEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			Self::ChatMessage(_) => EventKind::ChatMessage,
			Self::Subscription(_) => EventKind::Subscription,
			Self::GiftedSubscriptions(_) => EventKind::GiftedSubscriptions,
			Self::StreamHost(_) => EventKind::StreamHost,
			Self::MessageDeleted(_) => EventKind::MessageDeleted,
			Self::UserBanned(_) => EventKind::UserBanned,
			Self::UserUnbanned(_) => EventKind::UserUnbanned,
			Self::PinnedMessageCreated(_) => EventKind::PinnedMessageCreated,
			Self::PinnedMessageDeleted(_) => EventKind::PinnedMessageDeleted,
			Self::PollUpdate(_) => EventKind::PollUpdate,
			Self::PollDelete(_) => EventKind::PollDelete,
		}
	}

	/// Payload as a JSON value.
	pub fn payload(&self) -> Value {
		match self {
			Self::ChatMessage(msg) => msg.as_value().clone(),
			Self::Subscription(v)
			| Self::GiftedSubscriptions(v)
			| Self::StreamHost(v)
			| Self::MessageDeleted(v)
			| Self::UserBanned(v)
			| Self::UserUnbanned(v)
			| Self::PinnedMessageCreated(v)
			| Self::PinnedMessageDeleted(v)
			| Self::PollUpdate(v)
			| Self::PollDelete(v) => v.clone(),
		}
	}
}

/// Pusher protocol frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
	ConnectionEstablished {
		socket_id: Option<String>,
		activity_timeout: Option<u64>,
	},
	SubscriptionSucceeded {
		channel: Option<String>,
	},
	Ping,
	Pong,
	Error {
		code: Option<u64>,
		message: Option<String>,
	},
}

/// Outcome of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
	Event(KickEvent),
	Control(ControlFrame),
	/// Well-formed envelope with a tag outside the known table.
	Unrecognized(String),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
	event: String,
	#[serde(default)]
	data: Value,
	#[serde(default)]
	channel: Option<String>,
}

/// Decode one text frame. Pure: no I/O, same input gives the same output.
pub fn decode(frame: &str) -> Result<Decoded, DecodeError> {
	let envelope: RawEnvelope = serde_json::from_str(frame).map_err(|e| DecodeError::Envelope(e.to_string()))?;

	if let Some(control) = decode_control(&envelope) {
		return Ok(Decoded::Control(control));
	}

	let Some(kind) = event_kind_for_tag(&envelope.event) else {
		return Ok(Decoded::Unrecognized(envelope.event));
	};

	let payload = inner_json(&envelope.data).map_err(|reason| DecodeError::Payload {
		tag: envelope.event.clone(),
		reason,
	})?;

	let event = match kind {
		EventKind::ChatMessage => KickEvent::ChatMessage(ChatMessage::from_value(payload)),
		EventKind::Subscription => KickEvent::Subscription(payload),
		EventKind::GiftedSubscriptions => KickEvent::GiftedSubscriptions(payload),
		EventKind::StreamHost => KickEvent::StreamHost(payload),
		EventKind::MessageDeleted => KickEvent::MessageDeleted(payload),
		EventKind::UserBanned => KickEvent::UserBanned(payload),
		EventKind::UserUnbanned => KickEvent::UserUnbanned(payload),
		EventKind::PinnedMessageCreated => KickEvent::PinnedMessageCreated(payload),
		EventKind::PinnedMessageDeleted => KickEvent::PinnedMessageDeleted(payload),
		EventKind::PollUpdate => KickEvent::PollUpdate(payload),
		EventKind::PollDelete => KickEvent::PollDelete(payload),
		EventKind::Ready | EventKind::Disconnect | EventKind::Error => {
			return Ok(Decoded::Unrecognized(envelope.event));
		}
	};

	Ok(Decoded::Event(event))
}

/// The `data` field is normally a string holding a JSON document; objects are accepted as-is.
fn inner_json(data: &Value) -> Result<Value, String> {
	match data {
		Value::String(s) => serde_json::from_str(s).map_err(|e| e.to_string()),
		Value::Object(_) => Ok(data.clone()),
		Value::Null => Err("missing data".to_string()),
		other => Err(format!("unexpected data type: {other}")),
	}
}

fn decode_control(envelope: &RawEnvelope) -> Option<ControlFrame> {
	let inner = || inner_json(&envelope.data).ok();
	let control = match envelope.event.as_str() {
		"pusher:connection_established" => {
			let data = inner();
			ControlFrame::ConnectionEstablished {
				socket_id: data
					.as_ref()
					.and_then(|d| d.get("socket_id"))
					.and_then(Value::as_str)
					.map(str::to_string),
				activity_timeout: data.as_ref().and_then(|d| d.get("activity_timeout")).and_then(Value::as_u64),
			}
		}
		"pusher_internal:subscription_succeeded" => ControlFrame::SubscriptionSucceeded {
			// Pusher puts the channel on the envelope; older frames carried it inside `data`.
			channel: envelope.channel.clone().or_else(|| {
				inner()
					.as_ref()
					.and_then(|d| d.get("channel"))
					.and_then(Value::as_str)
					.map(str::to_string)
			}),
		},
		"pusher:ping" => ControlFrame::Ping,
		"pusher:pong" => ControlFrame::Pong,
		"pusher:error" => {
			let data = inner();
			ControlFrame::Error {
				code: data.as_ref().and_then(|d| d.get("code")).and_then(Value::as_u64),
				message: data
					.as_ref()
					.and_then(|d| d.get("message"))
					.and_then(Value::as_str)
					.map(str::to_string),
			}
		}
		_ => return None,
	};
	Some(control)
}

#[derive(Serialize)]
struct OutboundFrame<'a, T: Serialize> {
	event: &'a str,
	data: T,
}

#[derive(Serialize)]
struct SubscribeData<'a> {
	auth: &'a str,
	channel: String,
}

/// Subscribe control frame for a chatroom. Public chatrooms need no auth.
pub fn subscribe_frame(chatroom: ChatroomId) -> String {
	let frame = OutboundFrame {
		event: "pusher:subscribe",
		data: SubscribeData {
			auth: "",
			channel: ChatroomTopic::format(chatroom),
		},
	};
	serde_json::to_string(&frame).unwrap_or_default()
}

/// Reply to a `pusher:ping`.
pub fn pong_frame() -> String {
	let frame = OutboundFrame {
		event: "pusher:pong",
		data: serde_json::Map::new(),
	};
	serde_json::to_string(&frame).unwrap_or_default()
}
