#![forbid(unsafe_code)]

//! DevTools protocol transport: numbered commands over one websocket, replies matched back by id.
//!
//! Anything without an id is an event and goes to the receiver returned from [`CdpClient::connect`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::BrowserError;

type CdpWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = Result<Value, BrowserError>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CdpEvent {
	/// e.g. `Network.requestWillBeSent`.
	pub method: String,
	pub params: Value,
}

#[derive(Serialize)]
struct Command<'a> {
	id: u64,
	method: &'a str,
	params: Value,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
	code: i64,
	message: String,
	#[serde(default)]
	data: Option<String>,
}

/// One parsed DevTools message.
#[derive(Debug)]
enum Incoming {
	Reply { id: u64, reply: Reply },
	Event(CdpEvent),
}

impl Incoming {
	fn classify(json: Value) -> Option<Self> {
		if let Some(id) = json.get("id").and_then(Value::as_u64) {
			let reply = match json.get("error") {
				Some(err) => match serde_json::from_value::<RemoteError>(err.clone()) {
					Ok(e) => Err(BrowserError::CdpError {
						code: e.code,
						message: e.message,
						data: e.data,
					}),
					Err(_) => Err(BrowserError::protocol(format!("malformed error reply: {err}"))),
				},
				None => Ok(json.get("result").cloned().unwrap_or(Value::Null)),
			};
			return Some(Self::Reply { id, reply });
		}

		let method = json.get("method")?.as_str()?.to_string();
		let params = json.get("params").cloned().unwrap_or(Value::Null);
		Some(Self::Event(CdpEvent { method, params }))
	}
}

/// Removes the pending slot when the caller stops waiting, whatever the reason.
struct PendingSlot<'a> {
	pending: &'a Pending,
	id: u64,
}

impl Drop for PendingSlot<'_> {
	fn drop(&mut self) {
		self.pending.lock().remove(&self.id);
	}
}

/// Clones share the socket and the pending table.
#[derive(Clone)]
pub struct CdpClient {
	next_id: Arc<AtomicU64>,
	pending: Pending,
	writer: Arc<tokio::sync::Mutex<SplitSink<CdpWs, Message>>>,
}

impl CdpClient {
	/// Connect to a page's DevTools websocket (`ws://host:port/devtools/page/<id>`).
	pub async fn connect(ws_url: &str) -> Result<(Self, mpsc::UnboundedReceiver<CdpEvent>), BrowserError> {
		info!(url = ws_url, "attaching to DevTools");

		let (ws, _) = tokio_tungstenite::connect_async(ws_url)
			.await
			.map_err(|e| BrowserError::ConnectionFailed {
				url: ws_url.to_string(),
				reason: e.to_string(),
			})?;

		let (writer, reader) = ws.split();
		let pending = Pending::default();
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		tokio::spawn(read_loop(reader, pending.clone(), event_tx));

		let client = Self {
			next_id: Arc::new(AtomicU64::new(1)),
			pending,
			writer: Arc::new(tokio::sync::Mutex::new(writer)),
		};
		Ok((client, event_rx))
	}

	pub async fn send(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
		self.send_with_timeout(method, params, COMMAND_TIMEOUT).await
	}

	pub async fn send_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, BrowserError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let frame = serde_json::to_string(&Command { id, method, params })
			.map_err(|e| BrowserError::protocol(format!("encode {method}: {e}")))?;

		// Registered before the write so a fast reply cannot be missed.
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);
		let _slot = PendingSlot {
			pending: &self.pending,
			id,
		};

		debug!(id, method, "cdp command");
		self.writer
			.lock()
			.await
			.send(Message::Text(frame.into()))
			.await
			.map_err(|e| BrowserError::protocol(format!("write {method}: {e}")))?;

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(reply)) => reply,
			Ok(Err(_)) => Err(BrowserError::protocol("DevTools connection closed")),
			Err(_) => Err(BrowserError::Timeout {
				method: method.to_string(),
				duration: timeout,
			}),
		}
	}

	/// `<Domain>.enable`.
	pub async fn enable(&self, domain: &str) -> Result<(), BrowserError> {
		self.send(&format!("{domain}.enable"), Value::Object(Default::default()))
			.await
			.map(drop)
	}

	pub async fn close(&self) {
		let _ = self.writer.lock().await.close().await;
	}
}

async fn read_loop(mut reader: SplitStream<CdpWs>, pending: Pending, events: mpsc::UnboundedSender<CdpEvent>) {
	while let Some(msg) = reader.next().await {
		let text = match msg {
			Ok(Message::Text(t)) => t.to_string(),
			Ok(Message::Close(_)) => break,
			Ok(_) => continue,
			Err(e) => {
				warn!(error = %e, "DevTools read failed");
				break;
			}
		};

		let Some(incoming) = serde_json::from_str(&text).ok().and_then(Incoming::classify) else {
			debug!(len = text.len(), "ignoring unparseable DevTools message");
			continue;
		};
		match incoming {
			Incoming::Reply { id, reply } => {
				let waiter = pending.lock().remove(&id);
				if let Some(tx) = waiter {
					let _ = tx.send(reply);
				}
			}
			Incoming::Event(event) => {
				let _ = events.send(event);
			}
		}
	}

	debug!("DevTools socket finished");
	// Dropping the senders wakes every waiter with a closed-channel error.
	pending.lock().clear();
}
