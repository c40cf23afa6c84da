#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use kickkit_domain::{ChatroomId, ChatroomTopic};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::{ControlFrame, Decoded, KickEvent, decode, pong_frame, subscribe_frame};
use crate::{KickError, new_session_id};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type KickWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<KickWs>> + Send + Sync>;

/// Public Pusher application used by the chat frontend.
pub const DEFAULT_PUSHER_WS_URL: &str = "wss://ws-us2.pusher.com/app/32cbd69e4b950bf97679";

const CLIENT_QUERY: [(&str, &str); 4] = [
	("protocol", "7"),
	("client", "js"),
	("version", "7.4.0"),
	("flash", "false"),
];

#[derive(Clone)]
pub struct PusherConfig {
	pub ws_url: String,
	/// Rewrite emote placeholders in chat message content.
	pub plain_emote: bool,
	pub event_buffer: usize,
	/// Upper bound on the TCP connect plus websocket upgrade.
	pub connect_timeout: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl Default for PusherConfig {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_PUSHER_WS_URL.to_string(),
			plain_emote: true,
			event_buffer: 256,
			connect_timeout: Duration::from_secs(15),
			ws_connector: None,
		}
	}
}

impl std::fmt::Debug for PusherConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PusherConfig")
			.field("ws_url", &self.ws_url)
			.field("plain_emote", &self.plain_emote)
			.field("event_buffer", &self.event_buffer)
			.field("connect_timeout", &self.connect_timeout)
			.finish_non_exhaustive()
	}
}

impl PusherConfig {
	/// Socket URL with the client protocol query parameters. Parameters already present are kept.
	pub fn connection_url(&self) -> anyhow::Result<Url> {
		let mut url = Url::parse(&self.ws_url).with_context(|| format!("invalid pusher ws url: {}", self.ws_url))?;
		let present: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
		{
			let mut pairs = url.query_pairs_mut();
			for (k, v) in CLIENT_QUERY {
				if !present.iter().any(|p| p == k) {
					pairs.append_pair(k, v);
				}
			}
		}
		Ok(url)
	}

	fn connector(&self) -> WsConnector {
		if let Some(c) = &self.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| Box::pin(async move { connect_pusher_ws(url).await }) as BoxFuture<'static, anyhow::Result<KickWs>>)
	}
}

async fn connect_pusher_ws(url: Url) -> anyhow::Result<KickWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to pusher ws")?;
	Ok(ws)
}

/// What a live connection reports to its consumer, in order.
///
/// `Ready` is sent once the subscribe frame is on the wire. `Error` (if any) precedes the single
/// terminal `Disconnected`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
	Ready,
	Event(KickEvent),
	Error(String),
	Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Connecting,
	Open,
	Closed,
}

/// Owner side of one chatroom connection. Dropping it shuts the socket down.
pub struct ConnectionHandle {
	id: String,
	chatroom: ChatroomId,
	shutdown: Option<oneshot::Sender<()>>,
	task: Option<JoinHandle<()>>,
	state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for ConnectionHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionHandle")
			.field("id", &self.id)
			.field("chatroom", &self.chatroom)
			.field("state", &*self.state.borrow())
			.finish()
	}
}

impl ConnectionHandle {
	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn chatroom(&self) -> ChatroomId {
		self.chatroom
	}

	pub fn state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	pub fn is_closed(&self) -> bool {
		self.state() == ConnectionState::Closed
	}

	/// Close the socket and wait for the reader task to finish. Idempotent.
	pub async fn close(&mut self) {
		if let Some(tx) = self.shutdown.take() {
			let _ = tx.send(());
		}
		if let Some(task) = self.task.take()
			&& let Err(e) = task.await
		{
			warn!(connection = %self.id, error = %e, "pusher reader task failed");
		}
	}
}

/// Open the socket and subscribe to the chatroom topic.
///
/// Fails only if the websocket handshake fails or does not finish within `connect_timeout`;
/// everything afterwards is reported on the returned receiver.
pub async fn connect(
	cfg: &PusherConfig,
	chatroom: ChatroomId,
) -> Result<(ConnectionHandle, mpsc::Receiver<ConnectionEvent>), KickError> {
	let url = cfg
		.connection_url()
		.map_err(|e| KickError::validation(format!("{e:#}")))?;
	let id = new_session_id();
	info!(connection = %id, %chatroom, url = %url, "connecting to pusher");

	let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
	let ws = match tokio::time::timeout(cfg.connect_timeout, (cfg.connector())(url)).await {
		Ok(Ok(ws)) => ws,
		Ok(Err(e)) => return Err(KickError::Network(format!("realtime connection failed: {e:#}"))),
		Err(_) => {
			warn!(connection = %id, timeout = ?cfg.connect_timeout, "pusher handshake stalled");
			return Err(KickError::Timeout(format!(
				"pusher handshake did not finish within {:?}",
				cfg.connect_timeout
			)));
		}
	};
	metrics::counter!("kickkit_pusher_connections_total").increment(1);

	let (events_tx, events_rx) = mpsc::channel(cfg.event_buffer.max(1));
	let (shutdown_tx, shutdown_rx) = oneshot::channel();

	let task = tokio::spawn(run_connection(
		ws,
		ReaderCtx {
			id: id.clone(),
			chatroom,
			plain_emote: cfg.plain_emote,
			events_tx,
			state_tx,
		},
		shutdown_rx,
	));

	let handle = ConnectionHandle {
		id,
		chatroom,
		shutdown: Some(shutdown_tx),
		task: Some(task),
		state: state_rx,
	};

	Ok((handle, events_rx))
}

struct ReaderCtx {
	id: String,
	chatroom: ChatroomId,
	plain_emote: bool,
	events_tx: mpsc::Sender<ConnectionEvent>,
	state_tx: watch::Sender<ConnectionState>,
}

impl ReaderCtx {
	async fn emit(&self, ev: ConnectionEvent) -> bool {
		self.events_tx.send(ev).await.is_ok()
	}

	async fn finish(&self, error: Option<String>) {
		let _ = self.state_tx.send(ConnectionState::Closed);
		if let Some(err) = error {
			let _ = self.emit(ConnectionEvent::Error(err)).await;
		}
		let _ = self.emit(ConnectionEvent::Disconnected).await;
		info!(connection = %self.id, chatroom = %self.chatroom, "pusher connection closed");
	}
}

async fn run_connection(mut ws: KickWs, ctx: ReaderCtx, mut shutdown_rx: oneshot::Receiver<()>) {
	let subscribe = subscribe_frame(ctx.chatroom);
	if let Err(e) = ws.send(Message::Text(subscribe.into())).await {
		ctx.finish(Some(format!("failed to send subscribe frame: {e}"))).await;
		return;
	}

	let _ = ctx.state_tx.send(ConnectionState::Open);
	debug!(connection = %ctx.id, chatroom = %ctx.chatroom, "subscribe frame sent");
	if !ctx.emit(ConnectionEvent::Ready).await {
		let _ = ws.close(None).await;
		ctx.finish(None).await;
		return;
	}

	let mut error = None;
	loop {
		tokio::select! {
			_ = &mut shutdown_rx => {
				debug!(connection = %ctx.id, "pusher connection shutdown requested");
				let _ = ws.close(None).await;
				break;
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					debug!(connection = %ctx.id, "pusher ws ended");
					break;
				};

				let msg = match msg {
					Ok(m) => m,
					Err(e) => {
						warn!(connection = %ctx.id, error = %e, "pusher ws read error");
						error = Some(format!("pusher ws read error: {e}"));
						break;
					}
				};

				match msg {
					Message::Text(t) => {
						let keep_going = handle_text(&mut ws, &ctx, t.as_str()).await;
						if !keep_going {
							let _ = ws.close(None).await;
							break;
						}
					}

					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}

					Message::Close(frame) => {
						debug!(connection = %ctx.id, ?frame, "pusher ws closed by server");
						break;
					}

					_ => {}
				}
			}
		}
	}

	ctx.finish(error).await;
}

/// Returns false once the consumer is gone.
async fn handle_text(ws: &mut KickWs, ctx: &ReaderCtx, text: &str) -> bool {
	metrics::counter!("kickkit_pusher_frames_total").increment(1);
	match decode(text) {
		Ok(Decoded::Event(event)) => {
			let event = match event {
				KickEvent::ChatMessage(msg) if ctx.plain_emote => KickEvent::ChatMessage(msg.with_plain_emotes()),
				other => other,
			};
			metrics::counter!("kickkit_pusher_events_total", "kind" => event.kind().as_str()).increment(1);
			ctx.emit(ConnectionEvent::Event(event)).await
		}

		Ok(Decoded::Control(control)) => {
			match control {
				ControlFrame::Ping => {
					if let Err(e) = ws.send(Message::Text(pong_frame().into())).await {
						warn!(connection = %ctx.id, error = %e, "failed to answer pusher ping");
					}
				}
				ControlFrame::ConnectionEstablished {
					socket_id,
					activity_timeout,
				} => {
					debug!(connection = %ctx.id, ?socket_id, ?activity_timeout, "pusher connection established");
				}
				ControlFrame::SubscriptionSucceeded { channel } => {
					match channel.as_deref().map(ChatroomTopic::parse) {
						Some(Ok(confirmed)) if confirmed != ctx.chatroom => {
							warn!(
								connection = %ctx.id,
								chatroom = %ctx.chatroom,
								%confirmed,
								"subscription confirmed for another chatroom"
							);
						}
						_ => info!(connection = %ctx.id, chatroom = %ctx.chatroom, "chatroom subscription confirmed"),
					}
				}
				ControlFrame::Error { code, message } => {
					warn!(connection = %ctx.id, ?code, ?message, "pusher error frame");
				}
				ControlFrame::Pong => {}
			}
			true
		}

		Ok(Decoded::Unrecognized(tag)) => {
			metrics::counter!("kickkit_pusher_unknown_events_total").increment(1);
			debug!(connection = %ctx.id, %tag, "ignoring unrecognized pusher event");
			true
		}

		Err(e) => {
			metrics::counter!("kickkit_pusher_decode_errors_total").increment(1);
			warn!(connection = %ctx.id, error = %e, "dropping malformed pusher frame");
			true
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn connection_url_carries_client_query() {
		let cfg = PusherConfig::default();
		let url = cfg.connection_url().unwrap();
		assert_eq!(
			url.as_str(),
			"wss://ws-us2.pusher.com/app/32cbd69e4b950bf97679?protocol=7&client=js&version=7.4.0&flash=false"
		);
	}

	#[test]
	fn connection_url_keeps_existing_params() {
		let cfg = PusherConfig {
			ws_url: "ws://127.0.0.1:9000/app/k?protocol=8".to_string(),
			..PusherConfig::default()
		};
		let url = cfg.connection_url().unwrap();
		let pairs: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
		assert_eq!(pairs[0], ("protocol".to_string(), "8".to_string()));
		assert_eq!(pairs.iter().filter(|(k, _)| k == "protocol").count(), 1);
		assert!(pairs.iter().any(|(k, v)| k == "flash" && v == "false"));
	}

	#[test]
	fn invalid_url_is_rejected() {
		let cfg = PusherConfig {
			ws_url: "not a url".to_string(),
			..PusherConfig::default()
		};
		assert!(cfg.connection_url().is_err());
	}
}
