#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use kickkit_domain::{EventKind, PublicUser};
use kickkit_platform::kick::pusher::KickEvent;
use parking_lot::RwLock;

/// Everything a listener can observe: decoded chat events plus the client's own lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
	/// The chatroom subscription is live.
	Ready(PublicUser),
	Kick(KickEvent),
	Disconnect,
	Error(String),
}

impl ClientEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			Self::Ready(_) => EventKind::Ready,
			Self::Kick(ev) => ev.kind(),
			Self::Disconnect => EventKind::Disconnect,
			Self::Error(_) => EventKind::Error,
		}
	}
}

pub type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Listeners keyed by event kind, invoked in registration order.
#[derive(Default)]
pub struct Listeners {
	by_kind: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

impl std::fmt::Debug for Listeners {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let by_kind = self.by_kind.read();
		let mut counts: Vec<(EventKind, usize)> = by_kind.iter().map(|(k, v)| (*k, v.len())).collect();
		counts.sort_unstable();
		f.debug_struct("Listeners").field("by_kind", &counts).finish()
	}
}

impl Listeners {
	pub fn add(&self, kind: EventKind, listener: Listener) {
		self.by_kind.write().entry(kind).or_default().push(listener);
	}

	pub fn count(&self, kind: EventKind) -> usize {
		self.by_kind.read().get(&kind).map_or(0, Vec::len)
	}

	/// Invoke every listener registered for the event's kind. Returns how many ran.
	///
	/// The list is cloned out of the lock first so a listener may register further listeners.
	pub fn emit(&self, event: &ClientEvent) -> usize {
		let targets: Vec<Listener> = match self.by_kind.read().get(&event.kind()) {
			Some(list) => list.clone(),
			None => return 0,
		};
		for listener in &targets {
			listener(event);
		}
		targets.len()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use kickkit_domain::ChannelId;
	use parking_lot::Mutex;
	use serde_json::json;

	use super::*;

	#[test]
	fn listeners_run_in_registration_order() {
		let listeners = Listeners::default();
		let seen = Arc::new(Mutex::new(Vec::new()));
		for tag in ["first", "second", "third"] {
			let seen = seen.clone();
			listeners.add(EventKind::UserBanned, Arc::new(move |_| seen.lock().push(tag)));
		}

		let ran = listeners.emit(&ClientEvent::Kick(KickEvent::UserBanned(json!({}))));
		assert_eq!(ran, 3);
		assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
	}

	#[test]
	fn events_only_reach_their_kind() {
		let listeners = Listeners::default();
		let hits = Arc::new(AtomicUsize::new(0));
		let h = hits.clone();
		listeners.add(
			EventKind::Ready,
			Arc::new(move |_| {
				h.fetch_add(1, Ordering::SeqCst);
			}),
		);

		assert_eq!(listeners.emit(&ClientEvent::Disconnect), 0);
		let user = PublicUser {
			id: ChannelId(1),
			username: "a".to_string(),
			tag: "A".to_string(),
		};
		assert_eq!(listeners.emit(&ClientEvent::Ready(user)), 1);
		assert_eq!(hits.load(Ordering::SeqCst), 1);
		assert_eq!(listeners.count(EventKind::Ready), 1);
		assert_eq!(listeners.count(EventKind::Error), 0);
	}

	#[test]
	fn listener_may_register_another() {
		let listeners = Arc::new(Listeners::default());
		let inner = listeners.clone();
		listeners.add(
			EventKind::Error,
			Arc::new(move |_| inner.add(EventKind::Error, Arc::new(|_| {}))),
		);

		listeners.emit(&ClientEvent::Error("boom".to_string()));
		assert_eq!(listeners.count(EventKind::Error), 2);
	}
}
