#![forbid(unsafe_code)]

//! Client façade: login, channel initialization, realtime dispatch and moderation commands for one
//! channel.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use kickkit_domain::{ChannelIdentity, ChannelSlug, EventKind, PublicUser};
use kickkit_platform::auth::{AcquisitionSettings, BrowserCredentialAcquirer, CredentialAcquirer, LoginCredentials};
use kickkit_platform::browser::{BrowserConfig, ChromiumLauncher};
use kickkit_platform::kick::pusher::connection::DEFAULT_PUSHER_WS_URL;
use kickkit_platform::kick::pusher::{ConnectionEvent, ConnectionHandle, PusherConfig, connect};
use kickkit_platform::kick::{
	BanKind, BrowserChannelDirectory, ChannelDirectory, CommandContext, DEFAULT_BASE_URL, KickClient, SlowMode,
	VideoInfo,
};
use kickkit_platform::{AuthError, KickError, SecretString, SessionCredentials};
use parking_lot::RwLock;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod config;
pub mod listeners;

pub use listeners::{ClientEvent, Listener, Listeners};

/// Lifecycle of a [`ChatClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
	Unauthenticated,
	Authenticating,
	Initializing,
	Ready,
	Disconnected,
	/// Unrecoverable failure. Only a new `login`/`start` leaves it.
	Errored,
}

impl ClientState {
	fn is_terminal(self) -> bool {
		matches!(self, Self::Disconnected | Self::Errored)
	}
}

/// How `login` obtains session credentials.
#[derive(Debug, Clone)]
pub enum LoginMode {
	/// Drive the site's login form in a browser.
	Credentials(LoginCredentials),
	/// Use tokens captured elsewhere; no browser is launched.
	Tokens {
		bearer_token: SecretString,
		xsrf_token: SecretString,
		cookies: SecretString,
	},
}

impl LoginMode {
	pub fn tokens(bearer_token: impl Into<String>, xsrf_token: impl Into<String>, cookies: impl Into<String>) -> Self {
		Self::Tokens {
			bearer_token: SecretString::new(bearer_token.into()),
			xsrf_token: SecretString::new(xsrf_token.into()),
			cookies: SecretString::new(cookies.into()),
		}
	}

	fn label(&self) -> &'static str {
		match self {
			Self::Credentials(_) => "credentials",
			Self::Tokens { .. } => "tokens",
		}
	}
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
	/// Rewrite `[emote:<id>:<name>]` placeholders in chat messages to `<name>`.
	pub plain_emote: bool,
	/// Listen only: no login, every authenticated command is rejected.
	pub read_only: bool,
	pub base_url: String,
	pub pusher_ws_url: String,
	/// Bounds each command request and the realtime handshake.
	pub request_timeout: Duration,
	pub browser: BrowserConfig,
	pub typing_delay: Duration,
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			plain_emote: true,
			read_only: false,
			base_url: DEFAULT_BASE_URL.to_string(),
			pusher_ws_url: DEFAULT_PUSHER_WS_URL.to_string(),
			request_timeout: Duration::from_secs(15),
			browser: BrowserConfig::default(),
			typing_delay: Duration::from_millis(100),
		}
	}
}

impl ClientOptions {
	fn acquisition_settings(&self) -> AcquisitionSettings {
		AcquisitionSettings {
			base_url: self.base_url.clone(),
			selector_timeout: self.browser.selector_timeout,
			navigation_timeout: self.browser.navigation_timeout,
			typing_delay: self.typing_delay,
		}
	}

	fn pusher_config(&self) -> PusherConfig {
		PusherConfig {
			ws_url: self.pusher_ws_url.clone(),
			plain_emote: self.plain_emote,
			connect_timeout: self.request_timeout,
			..PusherConfig::default()
		}
	}
}

struct Live {
	handle: ConnectionHandle,
	dispatcher: JoinHandle<()>,
}

struct Inner {
	channel: ChannelSlug,
	options: ClientOptions,
	commands: KickClient,
	acquirer: Arc<dyn CredentialAcquirer>,
	directory: Arc<dyn ChannelDirectory>,
	listeners: Listeners,

	credentials: RwLock<Option<Arc<SessionCredentials>>>,
	identity: RwLock<Option<Arc<ChannelIdentity>>>,
	state: watch::Sender<ClientState>,

	/// Serializes `login`, `start` and `close`.
	lifecycle: Mutex<()>,
	connection: Mutex<Option<Live>>,
	/// Bumped whenever the live connection is replaced; stale dispatchers go quiet.
	generation: AtomicU64,
	/// Bumped by `close`; work started under an older epoch is abandoned.
	epoch: AtomicU64,
	cancel: Notify,
}

impl Inner {
	fn set_state(&self, next: ClientState) {
		let prev = self.state.send_replace(next);
		if prev != next {
			debug!(channel = %self.channel, from = ?prev, to = ?next, "client state changed");
		}
	}

	fn snapshot(&self) -> (Option<Arc<SessionCredentials>>, Option<Arc<ChannelIdentity>>) {
		(self.credentials.read().clone(), self.identity.read().clone())
	}

	fn emit(&self, event: &ClientEvent) {
		let kind = event.kind();
		let ran = self.listeners.emit(event);
		metrics::counter!("kickkit_client_events_dispatched_total", "kind" => kind.as_str()).increment(1);
		if ran == 0 {
			debug!(%kind, "no listeners registered");
		}
	}
}

/// One channel, one session, at most one realtime connection.
#[derive(Clone)]
pub struct ChatClient {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for ChatClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChatClient")
			.field("channel", &self.inner.channel)
			.field("state", &self.state())
			.field("read_only", &self.inner.options.read_only)
			.finish()
	}
}

impl ChatClient {
	/// Client backed by a local Chromium for login and metadata lookups.
	pub fn new(channel: ChannelSlug, options: ClientOptions) -> Self {
		let acquirer = BrowserCredentialAcquirer::new(
			ChromiumLauncher::new(options.browser.clone()),
			options.acquisition_settings(),
		);
		let directory =
			BrowserChannelDirectory::with_base_url(ChromiumLauncher::new(options.browser.clone()), &options.base_url);
		Self::with_collaborators(channel, options, Arc::new(acquirer), Arc::new(directory))
	}

	/// Client with caller-supplied credential acquisition and channel lookup.
	pub fn with_collaborators(
		channel: ChannelSlug,
		options: ClientOptions,
		acquirer: Arc<dyn CredentialAcquirer>,
		directory: Arc<dyn ChannelDirectory>,
	) -> Self {
		let commands = KickClient::with_timeout(options.base_url.clone(), options.request_timeout);
		let (state, _) = watch::channel(ClientState::Unauthenticated);
		Self {
			inner: Arc::new(Inner {
				channel,
				options,
				commands,
				acquirer,
				directory,
				listeners: Listeners::default(),
				credentials: RwLock::new(None),
				identity: RwLock::new(None),
				state,
				lifecycle: Mutex::new(()),
				connection: Mutex::new(None),
				generation: AtomicU64::new(0),
				epoch: AtomicU64::new(0),
				cancel: Notify::new(),
			}),
		}
	}

	pub fn channel(&self) -> &ChannelSlug {
		&self.inner.channel
	}

	pub fn options(&self) -> &ClientOptions {
		&self.inner.options
	}

	pub fn state(&self) -> ClientState {
		*self.inner.state.borrow()
	}

	pub fn watch_state(&self) -> watch::Receiver<ClientState> {
		self.inner.state.subscribe()
	}

	/// Public identity of the attached channel, once resolved.
	pub fn user(&self) -> Option<PublicUser> {
		self.inner.identity.read().as_ref().map(|i| i.public_user())
	}

	pub fn identity(&self) -> Option<ChannelIdentity> {
		self.inner.identity.read().as_deref().cloned()
	}

	pub fn is_authenticated(&self) -> bool {
		self.inner.credentials.read().as_ref().is_some_and(|c| c.is_valid())
	}

	/// Register a listener for one event kind. Several listeners per kind run in registration order.
	pub fn on<F>(&self, kind: EventKind, listener: F)
	where
		F: Fn(&ClientEvent) + Send + Sync + 'static,
	{
		self.inner.listeners.add(kind, Arc::new(listener));
		debug!(%kind, registered = self.inner.listeners.count(kind), "listener added");
	}

	/// Authenticate, resolve the channel and open the realtime connection.
	///
	/// Logging in again replaces the credentials wholesale and swaps the connection; the previous
	/// socket is closed before the new one opens.
	pub async fn login(&self, mode: LoginMode) -> Result<PublicUser, KickError> {
		if self.inner.options.read_only {
			return Err(KickError::precondition("login is unavailable in read-only mode"));
		}
		let _lifecycle = self.inner.lifecycle.lock().await;
		let epoch = self.inner.epoch.load(Ordering::SeqCst);

		metrics::counter!("kickkit_client_logins_total", "mode" => mode.label()).increment(1);
		info!(channel = %self.inner.channel, mode = mode.label(), "logging in");
		self.inner.set_state(ClientState::Authenticating);

		let result = async {
			let credentials = self.authenticate(mode, epoch).await?;
			*self.inner.credentials.write() = Some(Arc::new(credentials));
			self.initialize(epoch).await
		}
		.await;
		self.settle_lifecycle(epoch, result)
	}

	/// Read-only startup: resolve the channel and listen, without credentials.
	pub async fn start(&self) -> Result<PublicUser, KickError> {
		if !self.inner.options.read_only {
			return Err(KickError::precondition("start is for read-only mode; use login"));
		}
		let _lifecycle = self.inner.lifecycle.lock().await;
		let epoch = self.inner.epoch.load(Ordering::SeqCst);

		info!(channel = %self.inner.channel, "starting in read-only mode");
		let result = self.initialize(epoch).await;
		self.settle_lifecycle(epoch, result)
	}

	/// Close the realtime connection and abandon any login in progress.
	pub async fn close(&self) {
		self.inner.epoch.fetch_add(1, Ordering::SeqCst);
		self.inner.cancel.notify_waiters();

		let _lifecycle = self.inner.lifecycle.lock().await;
		let live = self.inner.connection.lock().await.take();
		if let Some(mut live) = live {
			// The dispatcher still owns this generation, so listeners see the disconnect.
			live.handle.close().await;
			if let Err(e) = live.dispatcher.await {
				warn!(error = %e, "dispatcher task failed");
			}
		}
		self.inner.generation.fetch_add(1, Ordering::SeqCst);
		if self.state() != ClientState::Unauthenticated {
			self.inner.set_state(ClientState::Disconnected);
		}
		info!(channel = %self.inner.channel, "client closed");
	}

	async fn authenticate(&self, mode: LoginMode, epoch: u64) -> Result<SessionCredentials, KickError> {
		match mode {
			LoginMode::Credentials(login) => self.cancellable(epoch, self.inner.acquirer.acquire(&login)).await,
			LoginMode::Tokens {
				bearer_token,
				xsrf_token,
				cookies,
			} => {
				for (name, value) in [
					("bearer_token", &bearer_token),
					("xsrf_token", &xsrf_token),
					("cookies", &cookies),
				] {
					if value.is_blank() {
						return Err(AuthError::MissingField(name).into());
					}
				}
				Ok(SessionCredentials::new(
					bearer_token.expose(),
					xsrf_token.expose(),
					cookies.expose(),
				)?)
			}
		}
	}

	async fn initialize(&self, epoch: u64) -> Result<PublicUser, KickError> {
		self.inner.set_state(ClientState::Initializing);
		let identity = self.resolve_identity(epoch).await?;

		let mut slot = self.inner.connection.lock().await;
		if self.inner.epoch.load(Ordering::SeqCst) != epoch {
			return Err(closed_during_setup());
		}
		let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
		if let Some(mut old) = slot.take() {
			info!(connection = %old.handle.id(), "closing previous connection");
			old.handle.close().await;
			if let Err(e) = old.dispatcher.await {
				warn!(error = %e, "dispatcher task failed");
			}
		}

		let pusher = self.inner.options.pusher_config();
		let (handle, events) = self.cancellable(epoch, connect(&pusher, identity.chatroom_id)).await?;
		let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&self.inner), generation, events));
		*slot = Some(Live { handle, dispatcher });

		Ok(identity.public_user())
	}

	/// The identity is resolved once per client and reused by every later login.
	async fn resolve_identity(&self, epoch: u64) -> Result<Arc<ChannelIdentity>, KickError> {
		let cached = self.inner.identity.read().clone();
		if let Some(identity) = cached {
			return Ok(identity);
		}

		let identity = self
			.cancellable(epoch, self.inner.directory.channel(&self.inner.channel))
			.await?;
		let mut slot = self.inner.identity.write();
		Ok(slot.get_or_insert_with(|| Arc::new(identity)).clone())
	}

	/// Run `fut` unless `close` is called first; dropping it releases whatever it holds.
	async fn cancellable<T>(&self, epoch: u64, fut: impl Future<Output = Result<T, KickError>>) -> Result<T, KickError> {
		let cancelled = self.inner.cancel.notified();
		tokio::pin!(cancelled);
		cancelled.as_mut().enable();
		if self.inner.epoch.load(Ordering::SeqCst) != epoch {
			return Err(closed_during_setup());
		}

		tokio::select! {
			res = fut => res,
			() = cancelled => Err(closed_during_setup()),
		}
	}

	fn settle_lifecycle(&self, epoch: u64, result: Result<PublicUser, KickError>) -> Result<PublicUser, KickError> {
		match &result {
			Ok(user) => info!(channel = %self.inner.channel, user = %user.username, "client initialized"),
			Err(e) if self.inner.epoch.load(Ordering::SeqCst) != epoch => {
				debug!(error = %e, "setup abandoned by close");
			}
			Err(e) => {
				warn!(channel = %self.inner.channel, error = %e, "client setup failed");
				self.inner.set_state(ClientState::Errored);
			}
		}
		result
	}

	fn ensure_writable(&self) -> Result<(), KickError> {
		if self.inner.options.read_only {
			return Err(KickError::precondition("client is in read-only mode"));
		}
		Ok(())
	}

	/// Run one command against the current credentials and identity snapshot.
	///
	/// A result that arrives after the client moved to `Disconnected`/`Errored` is discarded.
	async fn command<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, KickError>
	where
		T: Default,
		F: FnOnce(KickClient, Option<Arc<SessionCredentials>>, Option<Arc<ChannelIdentity>>) -> Fut,
		Fut: Future<Output = Result<T, KickError>>,
	{
		self.ensure_writable()?;
		let before = self.state();
		let (credentials, identity) = self.inner.snapshot();
		let value = f(self.inner.commands.clone(), credentials, identity).await?;

		let after = self.state();
		if after.is_terminal() && !before.is_terminal() {
			debug!(op, state = ?after, "discarding command result after teardown");
			return Ok(T::default());
		}
		Ok(value)
	}

	pub async fn ban(&self, username: &str, kind: BanKind) -> Result<bool, KickError> {
		self.command("ban", |client, creds, identity| async move {
			client
				.ban(CommandContext::new(creds.as_deref(), identity.as_deref()), username, kind)
				.await
		})
		.await
	}

	pub async fn unban(&self, username: &str) -> Result<bool, KickError> {
		self.command("unban", |client, creds, identity| async move {
			client
				.unban(CommandContext::new(creds.as_deref(), identity.as_deref()), username)
				.await
		})
		.await
	}

	pub async fn delete_message(&self, message_id: &str) -> Result<bool, KickError> {
		self.command("delete_message", |client, creds, identity| async move {
			client
				.delete_message(CommandContext::new(creds.as_deref(), identity.as_deref()), message_id)
				.await
		})
		.await
	}

	pub async fn slow_mode(&self, mode: SlowMode) -> Result<bool, KickError> {
		self.command("slow_mode", |client, creds, identity| async move {
			client
				.slow_mode(CommandContext::new(creds.as_deref(), identity.as_deref()), mode)
				.await
		})
		.await
	}

	/// Current poll of `target`, or of the attached channel when `None`.
	pub async fn poll(&self, target: Option<&ChannelSlug>) -> Result<Option<serde_json::Value>, KickError> {
		self.command("poll", |client, creds, identity| async move {
			client
				.poll(CommandContext::new(creds.as_deref(), identity.as_deref()), target)
				.await
		})
		.await
	}

	pub async fn leaderboards(&self, target: Option<&ChannelSlug>) -> Result<Option<serde_json::Value>, KickError> {
		self.command("leaderboards", |client, creds, identity| async move {
			client
				.leaderboards(CommandContext::new(creds.as_deref(), identity.as_deref()), target)
				.await
		})
		.await
	}

	pub async fn send_message(&self, content: &str) -> Result<bool, KickError> {
		self.command("send_message", |client, creds, identity| async move {
			client
				.send_message(CommandContext::new(creds.as_deref(), identity.as_deref()), content)
				.await
		})
		.await
	}

	/// Past broadcast summary. Needs neither a session nor a resolved channel.
	pub async fn vod(&self, video_id: &str) -> Result<VideoInfo, KickError> {
		self.inner.directory.video(video_id).await
	}
}

fn closed_during_setup() -> KickError {
	KickError::precondition("client was closed during setup")
}

/// Forward one connection's events to listeners while its generation is current.
async fn dispatch(weak: Weak<Inner>, generation: u64, mut events: mpsc::Receiver<ConnectionEvent>) {
	while let Some(event) = events.recv().await {
		let Some(inner) = weak.upgrade() else {
			return;
		};
		if inner.generation.load(Ordering::SeqCst) != generation {
			debug!(generation, "dropping event from a replaced connection");
			continue;
		}

		match event {
			ConnectionEvent::Ready => {
				let Some(user) = inner.identity.read().as_ref().map(|i| i.public_user()) else {
					warn!("connection ready before the channel was resolved");
					continue;
				};
				inner.set_state(ClientState::Ready);
				info!(channel = %user.username, "ready");
				inner.emit(&ClientEvent::Ready(user));
			}
			ConnectionEvent::Event(ev) => inner.emit(&ClientEvent::Kick(ev)),
			ConnectionEvent::Error(message) => {
				inner.set_state(ClientState::Errored);
				inner.emit(&ClientEvent::Error(message));
			}
			ConnectionEvent::Disconnected => {
				if *inner.state.borrow() != ClientState::Errored {
					inner.set_state(ClientState::Disconnected);
				}
				inner.emit(&ClientEvent::Disconnect);
			}
		}
	}
}
