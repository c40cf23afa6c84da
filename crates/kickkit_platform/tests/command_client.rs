#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kickkit_domain::{ChannelId, ChannelIdentity, ChannelSlug, ChatroomId};
use kickkit_platform::kick::{BanKind, CommandContext, KickClient, SlowMode};
use kickkit_platform::{KickError, SessionCredentials};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Recorded {
	method: String,
	path: String,
	headers: HashMap<String, String>,
	body: String,
}

/// Minimal HTTP/1.1 responder: one canned reply per connection, every request recorded.
struct Stub {
	addr: SocketAddr,
	accepted: Arc<AtomicUsize>,
	requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Stub {
	async fn start(status: u16, body: &'static str) -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		let accepted = Arc::new(AtomicUsize::new(0));
		let requests = Arc::new(Mutex::new(Vec::new()));

		let (acc, reqs) = (accepted.clone(), requests.clone());
		tokio::spawn(async move {
			loop {
				let Ok((mut stream, _)) = listener.accept().await else {
					return;
				};
				acc.fetch_add(1, Ordering::SeqCst);
				let reqs = reqs.clone();
				tokio::spawn(async move {
					let Some(req) = read_request(&mut stream).await else {
						return;
					};
					reqs.lock().await.push(req);
					let reply = format!(
						"HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
						body.len()
					);
					let _ = stream.write_all(reply.as_bytes()).await;
					let _ = stream.shutdown().await;
				});
			}
		});

		Self {
			addr,
			accepted,
			requests,
		}
	}

	fn base_url(&self) -> String {
		format!("http://{}", self.addr)
	}

	fn client(&self) -> KickClient {
		KickClient::with_timeout(self.base_url(), Duration::from_secs(5))
	}

	async fn only_request(&self) -> Recorded {
		let reqs = self.requests.lock().await;
		assert_eq!(reqs.len(), 1, "expected exactly one request, got {reqs:?}");
		reqs[0].clone()
	}
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<Recorded> {
	let mut buf = Vec::new();
	let mut chunk = [0u8; 4096];
	let header_end = loop {
		let n = stream.read(&mut chunk).await.ok()?;
		if n == 0 {
			return None;
		}
		buf.extend_from_slice(&chunk[..n]);
		if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
			break pos + 4;
		}
	};

	let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
	let mut lines = head.split("\r\n");
	let mut start = lines.next()?.split(' ');
	let method = start.next()?.to_string();
	let path = start.next()?.to_string();
	let headers: HashMap<String, String> = lines
		.filter_map(|l| l.split_once(':'))
		.map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
		.collect();

	let len: usize = headers.get("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
	while buf.len() < header_end + len {
		let n = stream.read(&mut chunk).await.ok()?;
		if n == 0 {
			break;
		}
		buf.extend_from_slice(&chunk[..n]);
	}
	let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

	Some(Recorded {
		method,
		path,
		headers,
		body,
	})
}

fn identity() -> ChannelIdentity {
	ChannelIdentity {
		channel_id: ChannelId(7),
		chatroom_id: ChatroomId(8),
		slug: ChannelSlug::new("somechannel").expect("slug"),
		display_user: "SomeChannel".to_string(),
	}
}

fn creds() -> SessionCredentials {
	SessionCredentials::new("tok-1", "xsrf-1", "XSRF-TOKEN=xsrf-1; session=abc").expect("creds")
}

fn body_json(req: &Recorded) -> serde_json::Value {
	serde_json::from_str(&req.body).expect("json body")
}

#[tokio::test]
async fn ban_sends_the_full_header_set() {
	let stub = Stub::start(200, "{}").await;
	let (creds, identity) = (creds(), identity());
	let ctx = CommandContext::new(Some(&creds), Some(&identity));

	assert!(stub.client().ban(ctx, "troll", BanKind::Permanent).await.expect("ban"));

	let req = stub.only_request().await;
	assert_eq!(req.method, "POST");
	assert_eq!(req.path, "/api/v2/channels/7/bans");
	let h = &req.headers;
	assert_eq!(h["authorization"], "Bearer tok-1");
	assert_eq!(h["cookie"], "XSRF-TOKEN=xsrf-1; session=abc");
	assert_eq!(h["x-xsrf-token"], "xsrf-1");
	assert_eq!(h["cluster"], "v2");
	assert_eq!(h["accept"], "application/json");
	assert_eq!(h["content-type"], "application/json");
	assert_eq!(h["referer"], format!("{}/somechannel", stub.base_url()));
	assert_eq!(h["referrer-policy"], "strict-origin-when-cross-origin");
	assert_eq!(
		body_json(&req),
		serde_json::json!({ "banned_username": "troll", "permanent": true })
	);
}

#[tokio::test]
async fn timed_ban_body() {
	let stub = Stub::start(200, "{}").await;
	let (creds, identity) = (creds(), identity());
	let ctx = CommandContext::new(Some(&creds), Some(&identity));

	assert!(
		stub.client()
			.ban(ctx, "troll", BanKind::Timeout { minutes: 10 })
			.await
			.expect("ban")
	);
	let req = stub.only_request().await;
	assert_eq!(
		body_json(&req),
		serde_json::json!({ "banned_username": "troll", "duration": 10, "permanent": false })
	);
}

#[tokio::test]
async fn zero_minute_ban_never_reaches_the_network() {
	let stub = Stub::start(200, "{}").await;
	let (creds, identity) = (creds(), identity());
	let ctx = CommandContext::new(Some(&creds), Some(&identity));

	let err = stub
		.client()
		.ban(ctx, "troll", BanKind::Timeout { minutes: 0 })
		.await
		.unwrap_err();
	assert!(matches!(err, KickError::Validation(_)));

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(stub.accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn commands_without_session_make_zero_calls() {
	let stub = Stub::start(200, "{}").await;
	let identity = identity();
	let ctx = CommandContext::new(None, Some(&identity));
	let client = stub.client();

	assert!(matches!(
		client.ban(ctx, "u", BanKind::Permanent).await,
		Err(KickError::Precondition(_))
	));
	assert!(matches!(client.unban(ctx, "u").await, Err(KickError::Precondition(_))));
	assert!(matches!(client.delete_message(ctx, "m").await, Err(KickError::Precondition(_))));
	assert!(matches!(
		client.slow_mode(ctx, SlowMode::On { interval_secs: 3 }).await,
		Err(KickError::Precondition(_))
	));
	assert!(matches!(client.poll(ctx, None).await, Err(KickError::Precondition(_))));
	assert!(matches!(client.leaderboards(ctx, None).await, Err(KickError::Precondition(_))));
	assert!(matches!(client.send_message(ctx, "hi").await, Err(KickError::Precondition(_))));

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(stub.accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn backend_rejection_is_falsy() {
	let stub = Stub::start(500, r#"{"message":"nope"}"#).await;
	let (creds, identity) = (creds(), identity());
	let ctx = CommandContext::new(Some(&creds), Some(&identity));
	let client = stub.client();

	assert!(!client.unban(ctx, "troll").await.expect("unban"));
	let req = stub.only_request().await;
	assert_eq!(req.method, "DELETE");
	assert_eq!(req.path, "/api/v2/channels/7/bans/troll");
}

#[tokio::test]
async fn delete_message_path() {
	let stub = Stub::start(204, "").await;
	let (creds, identity) = (creds(), identity());
	let ctx = CommandContext::new(Some(&creds), Some(&identity));

	assert!(stub.client().delete_message(ctx, "abc-123").await.expect("delete"));
	let req = stub.only_request().await;
	assert_eq!(req.method, "DELETE");
	assert_eq!(req.path, "/api/v2/channels/7/messages/abc-123");
}

#[tokio::test]
async fn slow_mode_honours_success_flag() {
	let stub = Stub::start(200, r#"{"success":false}"#).await;
	let (creds, identity) = (creds(), identity());
	let ctx = CommandContext::new(Some(&creds), Some(&identity));

	let ok = stub
		.client()
		.slow_mode(ctx, SlowMode::On { interval_secs: 5 })
		.await
		.expect("slow mode");
	assert!(!ok);

	let req = stub.only_request().await;
	assert_eq!(req.method, "PUT");
	assert_eq!(req.path, "/api/v2/channels/somechannel/chatroom");
	assert_eq!(
		body_json(&req),
		serde_json::json!({ "slow_mode": true, "message_interval": 5 })
	);
}

#[tokio::test]
async fn slow_mode_off() {
	let stub = Stub::start(200, r#"{"success":true}"#).await;
	let (creds, identity) = (creds(), identity());
	let ctx = CommandContext::new(Some(&creds), Some(&identity));

	assert!(stub.client().slow_mode(ctx, SlowMode::Off).await.expect("slow mode"));
	assert_eq!(body_json(&stub.only_request().await), serde_json::json!({ "slow_mode": false }));
}

#[tokio::test]
async fn poll_for_another_channel_needs_no_identity() {
	let stub = Stub::start(200, r#"{"data":{"poll":{"title":"?"}}}"#).await;
	let creds = creds();
	let ctx = CommandContext::new(Some(&creds), None);
	let other = ChannelSlug::new("other").expect("slug");

	let poll = stub.client().poll(ctx, Some(&other)).await.expect("poll");
	assert_eq!(poll, Some(serde_json::json!({ "data": { "poll": { "title": "?" } } })));

	let req = stub.only_request().await;
	assert_eq!(req.method, "GET");
	assert_eq!(req.path, "/api/v2/channels/other/polls");
	assert_eq!(req.headers["referer"], format!("{}/other", stub.base_url()));
	assert!(!req.headers.contains_key("x-xsrf-token"));
}

#[tokio::test]
async fn leaderboards_default_to_the_resolved_channel() {
	let stub = Stub::start(200, r#"{"gifts":[]}"#).await;
	let (creds, identity) = (creds(), identity());
	let ctx = CommandContext::new(Some(&creds), Some(&identity));

	let boards = stub.client().leaderboards(ctx, None).await.expect("leaderboards");
	assert_eq!(boards, Some(serde_json::json!({ "gifts": [] })));
	assert_eq!(stub.only_request().await.path, "/api/v2/channels/somechannel/leaderboards");
}

#[tokio::test]
async fn send_message_posts_to_the_chatroom() {
	let stub = Stub::start(200, r#"{"status":{"error":false}}"#).await;
	let (creds, identity) = (creds(), identity());
	let ctx = CommandContext::new(Some(&creds), Some(&identity));

	assert!(stub.client().send_message(ctx, "hello \"chat\"").await.expect("send"));
	let req = stub.only_request().await;
	assert_eq!(req.method, "POST");
	assert_eq!(req.path, "/api/v2/messages/send/8");
	assert_eq!(
		body_json(&req),
		serde_json::json!({ "content": "hello \"chat\"", "type": "message" })
	);
}
