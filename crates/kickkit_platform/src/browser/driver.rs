#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::cdp::{CdpClient, CdpEvent};
use super::launch::BrowserProcess;
use super::stealth::{DOCUMENT_START_SCRIPT, sanitize_user_agent};
use super::{BrowserConfig, BrowserCookie, BrowserError, BrowserPage};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
struct ElementCenter {
	x: f64,
	y: f64,
}

#[derive(Debug, Default)]
struct PageState {
	observe: Option<String>,
	observed_request_id: Option<String>,
	observed: Option<HashMap<String, String>>,
	document_status: Option<u16>,
}

/// A Chromium tab driven over CDP.
pub struct CdpPage {
	client: CdpClient,
	state: Arc<Mutex<PageState>>,
	loads: watch::Receiver<u64>,
	pump: JoinHandle<()>,
	cfg: BrowserConfig,
	process: Option<BrowserProcess>,
	closed: bool,
}

impl CdpPage {
	/// Attach to a page target and apply the stealth patches. `process` is shut down on close.
	pub async fn attach(ws_url: &str, cfg: BrowserConfig, process: Option<BrowserProcess>) -> Result<Self, BrowserError> {
		let (client, events) = CdpClient::connect(ws_url).await?;
		let state = Arc::new(Mutex::new(PageState::default()));
		let (loads_tx, loads) = watch::channel(0u64);
		let pump = tokio::spawn(event_pump(events, state.clone(), loads_tx));

		let mut page = Self {
			client,
			state,
			loads,
			pump,
			cfg,
			process,
			closed: false,
		};

		if let Err(e) = page.prepare().await {
			page.close().await;
			return Err(e);
		}
		Ok(page)
	}

	async fn prepare(&self) -> Result<(), BrowserError> {
		for domain in ["Page", "Network", "Runtime", "DOM"] {
			self.client.enable(domain).await?;
		}

		self.client
			.send(
				"Page.addScriptToEvaluateOnNewDocument",
				json!({ "source": DOCUMENT_START_SCRIPT }),
			)
			.await?;

		let ua = self.eval("navigator.userAgent").await?;
		if let Some(ua) = ua.as_str() {
			self.client
				.send(
					"Network.setUserAgentOverride",
					json!({
						"userAgent": sanitize_user_agent(ua),
						"acceptLanguage": "en-US,en;q=0.9",
					}),
				)
				.await?;
		}
		Ok(())
	}

	async fn eval(&self, expression: &str) -> Result<Value, BrowserError> {
		let result = self
			.client
			.send(
				"Runtime.evaluate",
				json!({
					"expression": expression,
					"returnByValue": true,
					"awaitPromise": true,
				}),
			)
			.await?;

		if let Some(exception) = result.get("exceptionDetails") {
			let message = exception
				.get("exception")
				.and_then(|e| e.get("description"))
				.and_then(Value::as_str)
				.or_else(|| exception.get("text").and_then(Value::as_str))
				.unwrap_or("unknown exception")
				.to_string();
			return Err(BrowserError::JsException { message });
		}

		Ok(result
			.get("result")
			.and_then(|r| r.get("value"))
			.cloned()
			.unwrap_or(Value::Null))
	}

	async fn query_selector(&self, selector: &str) -> Result<Option<i64>, BrowserError> {
		let doc = self.client.send("DOM.getDocument", json!({})).await?;
		let root = doc
			.get("root")
			.and_then(|r| r.get("nodeId"))
			.and_then(Value::as_i64)
			.ok_or_else(|| BrowserError::protocol("DOM.getDocument did not return a root nodeId"))?;

		let found = self
			.client
			.send("DOM.querySelector", json!({ "nodeId": root, "selector": selector }))
			.await?;
		let node = found.get("nodeId").and_then(Value::as_i64).unwrap_or(0);
		Ok((node != 0).then_some(node))
	}

	async fn require_node(&self, selector: &str) -> Result<i64, BrowserError> {
		self.query_selector(selector)
			.await?
			.ok_or_else(|| BrowserError::ElementNotFound {
				selector: selector.to_string(),
			})
	}

	async fn element_center(&self, node: i64) -> Result<ElementCenter, BrowserError> {
		let _ = self
			.client
			.send("DOM.scrollIntoViewIfNeeded", json!({ "nodeId": node }))
			.await;
		let result = self.client.send("DOM.getBoxModel", json!({ "nodeId": node })).await?;
		let quad: Vec<f64> = result
			.get("model")
			.and_then(|m| m.get("content"))
			.and_then(Value::as_array)
			.map(|a| a.iter().filter_map(Value::as_f64).collect())
			.ok_or_else(|| BrowserError::protocol("DOM.getBoxModel did not return a content quad"))?;
		center_of_quad(&quad)
	}

	async fn wait_for_load_after(&self, before: u64, timeout: Duration) -> Result<(), BrowserError> {
		let mut loads = self.loads.clone();
		match tokio::time::timeout(timeout, loads.wait_for(|n| *n > before)).await {
			Ok(Ok(_)) => Ok(()),
			Ok(Err(_)) => Err(BrowserError::protocol("page event stream ended")),
			Err(_) => Err(BrowserError::PageLoadTimeout { duration: timeout }),
		}
	}
}

/// Center of an 8-value content quad. Zero-size boxes are not clickable.
fn center_of_quad(quad: &[f64]) -> Result<ElementCenter, BrowserError> {
	if quad.len() < 8 {
		return Err(BrowserError::protocol(format!("content quad has {} values, expected 8", quad.len())));
	}
	let xs = quad.iter().step_by(2).copied();
	let ys = quad.iter().skip(1).step_by(2).copied();
	let (min_x, max_x) = xs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
	let (min_y, max_y) = ys.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));

	let (width, height) = (max_x - min_x, max_y - min_y);
	if width <= 0.0 || height <= 0.0 {
		return Err(BrowserError::ElementNotInteractable {
			reason: format!("element has zero or negative size: {width}x{height}"),
		});
	}
	Ok(ElementCenter {
		x: min_x + width / 2.0,
		y: min_y + height / 2.0,
	})
}

#[async_trait]
impl BrowserPage for CdpPage {
	async fn goto(&mut self, url: &str) -> Result<Option<u16>, BrowserError> {
		let before = *self.loads.borrow();
		self.state.lock().document_status = None;

		let result = self.client.send("Page.navigate", json!({ "url": url })).await?;
		if let Some(err) = result.get("errorText").and_then(Value::as_str)
			&& !err.is_empty()
		{
			return Err(BrowserError::NavigationFailed {
				reason: format!("{url}: {err}"),
			});
		}

		self.wait_for_load_after(before, self.cfg.navigation_timeout).await?;
		let status = self.state.lock().document_status;
		debug!(url, ?status, "page loaded");
		Ok(status)
	}

	async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
		let deadline = Instant::now() + timeout;
		loop {
			// Node ids go stale across navigations; a failed lookup is just "not yet".
			if let Ok(Some(_)) = self.query_selector(selector).await {
				return Ok(());
			}
			if Instant::now() >= deadline {
				return Err(BrowserError::Timeout {
					method: format!("wait_for_selector({selector})"),
					duration: timeout,
				});
			}
			sleep(POLL_INTERVAL).await;
		}
	}

	async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
		let node = self.require_node(selector).await?;
		let at = self.element_center(node).await?;

		for kind in ["mousePressed", "mouseReleased"] {
			self.client
				.send(
					"Input.dispatchMouseEvent",
					json!({
						"type": kind,
						"x": at.x,
						"y": at.y,
						"button": "left",
						"clickCount": 1,
					}),
				)
				.await?;
		}
		Ok(())
	}

	async fn type_text(&mut self, selector: &str, text: &str, delay: Duration) -> Result<(), BrowserError> {
		let node = self.require_node(selector).await?;
		self.client.send("DOM.focus", json!({ "nodeId": node })).await?;

		for ch in text.chars() {
			let key = ch.to_string();
			self.client
				.send(
					"Input.dispatchKeyEvent",
					json!({ "type": "keyDown", "text": key, "unmodifiedText": key, "key": key }),
				)
				.await?;
			self.client
				.send("Input.dispatchKeyEvent", json!({ "type": "keyUp", "key": key }))
				.await?;
			if !delay.is_zero() {
				sleep(delay).await;
			}
		}
		Ok(())
	}

	async fn wait_for_function(&mut self, expression: &str, timeout: Duration) -> Result<(), BrowserError> {
		let deadline = Instant::now() + timeout;
		let probe = format!("!!({expression})");
		loop {
			if let Ok(Value::Bool(true)) = self.eval(&probe).await {
				return Ok(());
			}
			if Instant::now() >= deadline {
				return Err(BrowserError::Timeout {
					method: "wait_for_function".to_string(),
					duration: timeout,
				});
			}
			sleep(POLL_INTERVAL).await;
		}
	}

	async fn wait_for_navigation(&mut self, timeout: Duration) -> Result<(), BrowserError> {
		let before = *self.loads.borrow();
		self.wait_for_load_after(before, timeout).await
	}

	async fn evaluate(&mut self, expression: &str) -> Result<Value, BrowserError> {
		self.eval(expression).await
	}

	async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, BrowserError> {
		let result = self.client.send("Network.getCookies", json!({})).await?;
		let cookies = result
			.get("cookies")
			.and_then(Value::as_array)
			.map(|arr| {
				arr.iter()
					.filter_map(|c| {
						Some(BrowserCookie {
							name: c.get("name")?.as_str()?.to_string(),
							value: c.get("value")?.as_str()?.to_string(),
							domain: c.get("domain").and_then(Value::as_str).unwrap_or_default().to_string(),
						})
					})
					.collect()
			})
			.unwrap_or_default();
		Ok(cookies)
	}

	async fn observe_request(&mut self, url_fragment: &str) -> Result<(), BrowserError> {
		let mut st = self.state.lock();
		st.observe = Some(url_fragment.to_string());
		st.observed_request_id = None;
		st.observed = None;
		Ok(())
	}

	fn observed_headers(&self) -> Option<HashMap<String, String>> {
		self.state.lock().observed.clone()
	}

	async fn close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;

		if let Err(e) = self
			.client
			.send_with_timeout("Page.close", json!({}), Duration::from_secs(2))
			.await
		{
			debug!(error = %e, "Page.close failed");
		}
		self.client.close().await;
		self.pump.abort();

		if let Some(process) = self.process.take() {
			process.shutdown().await;
		}
	}
}

impl Drop for CdpPage {
	fn drop(&mut self) {
		if !self.closed {
			warn!("browser page dropped without close");
		}
		self.pump.abort();
	}
}

fn header_map(headers: Option<&Value>) -> HashMap<String, String> {
	headers
		.and_then(Value::as_object)
		.map(|obj| {
			obj.iter()
				.filter_map(|(k, v)| Some((k.to_ascii_lowercase(), v.as_str()?.to_string())))
				.collect()
		})
		.unwrap_or_default()
}

async fn event_pump(
	mut events: mpsc::UnboundedReceiver<CdpEvent>,
	state: Arc<Mutex<PageState>>,
	loads: watch::Sender<u64>,
) {
	while let Some(ev) = events.recv().await {
		match ev.method.as_str() {
			"Network.requestWillBeSent" => {
				let url = ev
					.params
					.get("request")
					.and_then(|r| r.get("url"))
					.and_then(Value::as_str)
					.unwrap_or_default();
				let mut st = state.lock();
				if st.observed.is_none()
					&& let Some(fragment) = st.observe.as_deref()
					&& url.contains(fragment)
				{
					debug!(url, "observed request");
					st.observed_request_id = ev.params.get("requestId").and_then(Value::as_str).map(str::to_string);
					st.observed = Some(header_map(ev.params.get("request").and_then(|r| r.get("headers"))));
				}
			}

			// Carries the headers added by the network stack (cookie among them).
			"Network.requestWillBeSentExtraInfo" => {
				let id = ev.params.get("requestId").and_then(Value::as_str);
				let mut st = state.lock();
				if id.is_some() && st.observed_request_id.as_deref() == id {
					let extra = header_map(ev.params.get("headers"));
					if let Some(observed) = st.observed.as_mut() {
						for (k, v) in extra {
							observed.entry(k).or_insert(v);
						}
					}
				}
			}

			"Network.responseReceived" => {
				if ev.params.get("type").and_then(Value::as_str) == Some("Document") {
					let status = ev
						.params
						.get("response")
						.and_then(|r| r.get("status"))
						.and_then(Value::as_u64)
						.and_then(|s| u16::try_from(s).ok());
					state.lock().document_status = status;
				}
			}

			"Page.loadEventFired" => {
				loads.send_modify(|n| *n += 1);
			}

			_ => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn quad_center() {
		let c = center_of_quad(&[10.0, 20.0, 110.0, 20.0, 110.0, 70.0, 10.0, 70.0]).unwrap();
		assert_eq!(c, ElementCenter { x: 60.0, y: 45.0 });
	}

	#[test]
	fn degenerate_quads() {
		assert!(matches!(
			center_of_quad(&[0.0; 8]),
			Err(BrowserError::ElementNotInteractable { .. })
		));
		assert!(matches!(center_of_quad(&[1.0, 2.0]), Err(BrowserError::Protocol { .. })));
	}

	#[test]
	fn header_names_are_lowercased() {
		let headers = json!({ "Authorization": "Bearer abc", "X-Num": 3 });
		let map = header_map(Some(&headers));
		assert_eq!(map.get("authorization").map(String::as_str), Some("Bearer abc"));
		assert!(!map.contains_key("x-num"));
	}
}
