use flx_sync::{wait, SubscriptionStore, WaitOptions};

use std::{
	fmt,
	future,
	hash::{Hash, Hasher},
	path::{Path, PathBuf},
	pin::pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_channel as chan;
use futures::{stream, FutureExt, StreamExt};
use futures_concurrency::{future::Race, stream::Merge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
	sync::{broadcast, watch},
	task::JoinHandle,
	time,
};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::{
	auth::{User, UserId},
	config::{StopPolicy, SyncConfig},
	dispatch::{ErrorDispatcher, Route},
	error::{Error, ErrorCode, SessionError},
	progress::{ProgressDirection, ProgressMode, ProgressStream, ProgressTracker},
	reset::{ClientResetCoordinator, ReplicaView, ResetOutcome, ResetPhase},
	transport::{EventSink, SubscriptionSetPayload, Transport, TransportEvent, TransportSession},
};

const EVENTS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
	fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
	Active,
	Inactive,
	/// Terminal, reached through a fatal error.
	Invalid,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
	StateChanged(SessionState),
	SubscriptionSetSent { version: u64 },
	ClientReset(ResetOutcome),
	Error(SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
	pub stop_policy: StopPolicy,
	pub cancel_waits_on_nonfatal_error: bool,
	pub close_timeout: Duration,
}

impl From<&SyncConfig> for SessionOptions {
	fn from(config: &SyncConfig) -> Self {
		Self {
			stop_policy: config.stop_policy,
			cancel_waits_on_nonfatal_error: config.cancel_waits_on_nonfatal_error,
			close_timeout: config.session_close_timeout(),
		}
	}
}

pub(crate) struct SessionParams {
	pub path: PathBuf,
	pub user: Arc<User>,
	pub subscriptions: Arc<SubscriptionStore>,
	pub options: SessionOptions,
	pub dispatcher: ErrorDispatcher,
	pub reset: ClientResetCoordinator,
}

struct Inner {
	id: SessionId,
	path: PathBuf,
	user: Arc<User>,
	options: SessionOptions,
	state_tx: watch::Sender<SessionState>,
	latched_error: Mutex<Option<SessionError>>,
	nonfatal_tx: watch::Sender<Option<SessionError>>,
	closed: AtomicBool,
	/// `Some` while a client reset runs, holding whether the session resumes afterwards.
	reset_hold: Mutex<Option<bool>>,
	shutdown: CancellationToken,
	progress: ProgressTracker,
	subscriptions: Arc<SubscriptionStore>,
	last_sent_version: Mutex<Option<u64>>,
	transport: Box<dyn TransportSession>,
	events_tx: broadcast::Sender<SessionEvent>,
	dispatcher: ErrorDispatcher,
	reset: ClientResetCoordinator,
	driver: Mutex<Option<JoinHandle<()>>>,
}

/// The sync session of one replica.
///
/// Every handle to the same replica shares one session; handles compare equal by
/// session id.
#[derive(Clone)]
pub struct SyncSession {
	inner: Arc<Inner>,
}

impl fmt::Debug for SyncSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncSession")
			.field("id", &self.inner.id)
			.field("path", &self.inner.path)
			.field("state", &*self.inner.state_tx.borrow())
			.field("closed", &self.inner.closed.load(Ordering::Acquire))
			.finish_non_exhaustive()
	}
}

impl PartialEq for SyncSession {
	fn eq(&self, other: &Self) -> bool {
		self.inner.id == other.inner.id
	}
}

impl Eq for SyncSession {}

impl Hash for SyncSession {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.inner.id.hash(state);
	}
}

impl SyncSession {
	#[instrument(skip_all, fields(path = %params.path.display()), err)]
	pub(crate) async fn open(transport: &dyn Transport, params: SessionParams) -> Result<Self, Error> {
		let SessionParams {
			path,
			user,
			subscriptions,
			options,
			dispatcher,
			reset,
		} = params;

		let (sink, events_rx) = EventSink::new();
		let transport = transport
			.open_session(&path, user.session_auth(), sink)
			.await?;

		let session = Self {
			inner: Arc::new(Inner {
				id: SessionId::new(),
				path,
				user,
				options,
				state_tx: watch::Sender::new(SessionState::Active),
				latched_error: Mutex::new(None),
				nonfatal_tx: watch::Sender::new(None),
				closed: AtomicBool::new(false),
				reset_hold: Mutex::new(None),
				shutdown: CancellationToken::new(),
				progress: ProgressTracker::new(),
				subscriptions,
				last_sent_version: Mutex::new(None),
				transport,
				events_tx: broadcast::channel(EVENTS_CAPACITY).0,
				dispatcher,
				reset,
				driver: Mutex::new(None),
			}),
		};

		session.inner.transport.resume();

		let commits = session.inner.subscriptions.watch();
		let driver = tokio::spawn(session.clone().run(events_rx, commits));
		*session.inner.driver.lock() = Some(driver);

		info!(session_id = %session.id(), "Opened sync session;");

		Ok(session)
	}

	/// Applies transport events and subscription commits, in arrival order, until close.
	#[instrument(skip_all, fields(session_id = %self.inner.id))]
	async fn run(self, events_rx: chan::Receiver<TransportEvent>, commits: watch::Receiver<u64>) {
		enum StreamMessage {
			Transport(TransportEvent),
			Committed(u64),
			Shutdown,
		}

		let shutdown = self.inner.shutdown.clone();

		let mut msg_stream = pin!((
			events_rx.map(StreamMessage::Transport),
			WatchStream::new(commits).map(StreamMessage::Committed),
			stream::once(async move {
				shutdown.cancelled().await;
				StreamMessage::Shutdown
			}),
		)
			.merge());

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::Transport(event) => self.handle_event(event).await,
				StreamMessage::Committed(version) => {
					trace!(version, "Subscription lineage changed;");
					self.send_latest_subscriptions(false);
				}
				StreamMessage::Shutdown => break,
			}
		}

		debug!("Session driver stopped;");
	}

	async fn handle_event(&self, event: TransportEvent) {
		match event {
			TransportEvent::SubscriptionVersionAck { version, outcome } => {
				if !self.inner.subscriptions.apply_ack(version, outcome) {
					trace!(version, "Ignored subscription acknowledgement;");
				}
			}
			TransportEvent::Progress {
				direction,
				transferred,
				transferable,
			} => self.inner.progress.report(direction, transferred, transferable),
			TransportEvent::SessionError(error) => self.handle_error(error).await,
		}
	}

	#[instrument(skip_all, fields(error_id = %error.id, code = ?error.code))]
	async fn handle_error(&self, error: SessionError) {
		if self.is_closed() || *self.inner.state_tx.borrow() == SessionState::Invalid {
			debug!("Dropping error reported after the session ended;");
			return;
		}

		let route = self.inner.dispatcher.route(&error);
		if route == Route::Duplicate {
			debug!("Dropping duplicate error delivery;");
			return;
		}

		// Observation only, the route below is the single handler delivery
		self.publish(SessionEvent::Error(error.clone()));

		match route {
			Route::ClientReset => {
				if let Some(outcome) = self.inner.reset.handle(self, &error) {
					self.publish(SessionEvent::ClientReset(outcome));
				}
			}
			Route::Reauthenticate => self.reauthenticate().await,
			Route::Generic | Route::Duplicate => self.deliver_generic(&error),
		}
	}

	async fn reauthenticate(&self) {
		match self.inner.user.refresh_access_token().await {
			Ok(access_token) => {
				self.inner.transport.update_access_token(&access_token);
				info!("Session access token refreshed;");
			}
			Err(e) => {
				warn!(?e, "Failed to refresh access token;");
				self.deliver_generic(&SessionError::new(
					ErrorCode::AuthenticationFailed,
					e.to_string(),
					false,
				));
			}
		}
	}

	fn deliver_generic(&self, error: &SessionError) {
		if error.is_fatal() {
			self.invalidate(error.clone());
		} else {
			self.inner.nonfatal_tx.send_replace(Some(error.clone()));
		}

		self.inner.dispatcher.deliver(self, error);
	}

	fn publish(&self, event: SessionEvent) {
		// No subscribers is fine
		let _ = self.inner.events_tx.send(event);
	}

	fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::Acquire)
	}

	fn ensure_open(&self) -> Result<(), Error> {
		if self.is_closed() {
			Err(Error::Disposed(self.inner.id))
		} else {
			Ok(())
		}
	}

	fn latched_error(&self) -> SessionError {
		self.inner.latched_error.lock().clone().unwrap_or_else(|| {
			SessionError::new(ErrorCode::Other(0), "session invalidated", false)
		})
	}

	/// Sends the latest committed subscription set, unless it was already sent.
	fn send_latest_subscriptions(&self, force: bool) {
		if *self.inner.state_tx.borrow() != SessionState::Active {
			return;
		}

		let Ok(subscriptions) = self.inner.subscriptions.latest_snapshot() else {
			return;
		};
		let version = subscriptions.version();

		{
			let mut last_sent = self.inner.last_sent_version.lock();
			if !force && *last_sent == Some(version) {
				return;
			}
			*last_sent = Some(version);
		}

		self.inner.transport.send_subscription_set(SubscriptionSetPayload {
			version,
			fingerprint: flx_sync::fingerprint(subscriptions.as_slice()),
			subscriptions,
		});
		debug!(version, "Sent subscription set;");
		self.publish(SessionEvent::SubscriptionSetSent { version });
	}

	#[must_use]
	pub fn id(&self) -> SessionId {
		self.inner.id
	}

	pub fn path(&self) -> Result<&Path, Error> {
		self.ensure_open()?;
		Ok(&self.inner.path)
	}

	pub fn user_id(&self) -> Result<UserId, Error> {
		self.ensure_open()?;
		Ok(self.inner.user.id())
	}

	pub fn state(&self) -> Result<SessionState, Error> {
		self.ensure_open()?;
		Ok(*self.inner.state_tx.borrow())
	}

	/// The error that invalidated the session, if any.
	pub fn error(&self) -> Result<Option<SessionError>, Error> {
		self.ensure_open()?;
		Ok(self.inner.latched_error.lock().clone())
	}

	pub fn watch_state(&self) -> Result<watch::Receiver<SessionState>, Error> {
		self.ensure_open()?;
		Ok(self.inner.state_tx.subscribe())
	}

	pub fn events(&self) -> Result<broadcast::Receiver<SessionEvent>, Error> {
		self.ensure_open()?;
		Ok(self.inner.events_tx.subscribe())
	}

	pub fn reset_phase(&self) -> Result<ResetPhase, Error> {
		self.ensure_open()?;
		Ok(self.inner.reset.phase())
	}

	/// Resumes an inactive session. A no-op on an active one.
	///
	/// During a client reset the start is deferred until the reset finished.
	#[instrument(skip(self), fields(session_id = %self.inner.id), err)]
	pub fn start(&self) -> Result<(), Error> {
		self.ensure_open()?;

		let mut reset_hold = self.inner.reset_hold.lock();
		if let Some(resume) = reset_hold.as_mut() {
			*resume = true;
			debug!("Client reset in progress, deferring session start;");
			return Ok(());
		}

		let mut invalid = false;
		let started = self.inner.state_tx.send_if_modified(|state| match state {
			SessionState::Inactive => {
				*state = SessionState::Active;
				true
			}
			SessionState::Active => false,
			SessionState::Invalid => {
				invalid = true;
				false
			}
		});

		if invalid {
			return Err(Error::SessionInvalid(self.latched_error()));
		}

		if started {
			self.inner.transport.resume();
			self.send_latest_subscriptions(true);
			self.publish(SessionEvent::StateChanged(SessionState::Active));
			info!("Sync session started;");
		}

		Ok(())
	}

	/// Pauses an active session. A no-op on an inactive or invalid one.
	#[instrument(skip(self), fields(session_id = %self.inner.id), err)]
	pub fn stop(&self) -> Result<(), Error> {
		self.ensure_open()?;

		let mut reset_hold = self.inner.reset_hold.lock();
		if let Some(resume) = reset_hold.as_mut() {
			*resume = false;
			debug!("Client reset in progress, session stays inactive afterwards;");
			return Ok(());
		}

		if self.deactivate() {
			info!("Sync session stopped;");
		}

		Ok(())
	}

	fn deactivate(&self) -> bool {
		let stopped = self.inner.state_tx.send_if_modified(|state| {
			if *state == SessionState::Active {
				*state = SessionState::Inactive;
				true
			} else {
				false
			}
		});

		if stopped {
			self.inner.transport.pause();
			self.publish(SessionEvent::StateChanged(SessionState::Inactive));
		}

		stopped
	}

	pub(crate) fn replica_path(&self) -> &Path {
		&self.inner.path
	}

	pub(crate) fn replica_view(&self, frozen: bool, data_version: u64) -> Result<ReplicaView, Error> {
		Ok(ReplicaView::new(
			self.inner.path.clone(),
			frozen,
			data_version,
			self.inner.subscriptions.latest_snapshot()?,
		))
	}

	/// Holds the session inactive until [`Self::resume_after_reset`]; `start` and `stop`
	/// only record the state to return to meanwhile.
	pub(crate) fn suspend_for_reset(&self) {
		let mut reset_hold = self.inner.reset_hold.lock();
		*reset_hold = Some(true);

		if self.deactivate() {
			debug!("Session suspended for client reset;");
		}
	}

	pub(crate) fn resume_after_reset(&self) {
		let mut reset_hold = self.inner.reset_hold.lock();
		let resume = reset_hold.take().unwrap_or(true);

		if self.is_closed() {
			return;
		}

		if !resume {
			debug!("Session stopped during client reset, leaving it inactive;");
			return;
		}

		let resumed = self.inner.state_tx.send_if_modified(|state| {
			if *state == SessionState::Inactive {
				*state = SessionState::Active;
				true
			} else {
				false
			}
		});

		if resumed {
			self.inner.transport.resume();
			self.send_latest_subscriptions(true);
			self.publish(SessionEvent::StateChanged(SessionState::Active));
			debug!("Session resumed after client reset;");
		}
	}

	/// Latches `error` and moves the session to the terminal invalid state.
	pub(crate) fn invalidate(&self, error: SessionError) {
		self.inner.reset_hold.lock().take();

		if self.is_closed() || *self.inner.state_tx.borrow() == SessionState::Invalid {
			return;
		}

		*self.inner.latched_error.lock() = Some(error.clone());
		self.inner.state_tx.send_replace(SessionState::Invalid);
		self.inner.transport.pause();

		error!(%error, "Sync session invalidated;");
		self.publish(SessionEvent::StateChanged(SessionState::Invalid));
	}

	pub fn progress(
		&self,
		direction: ProgressDirection,
		mode: ProgressMode,
	) -> Result<ProgressStream, Error> {
		self.ensure_open()?;

		self.inner
			.progress
			.subscribe(direction)
			.map(|samples| ProgressStream::new(samples, mode))
			.ok_or(Error::Disposed(self.inner.id))
	}

	/// Number of live progress streams of `direction`.
	#[must_use]
	pub fn progress_registrations(&self, direction: ProgressDirection) -> usize {
		self.inner.progress.registrations(direction)
	}

	pub async fn wait_for_upload_completion(&self) -> Result<(), Error> {
		self.wait_for_transfer(ProgressDirection::Upload, &WaitOptions::default())
			.await
	}

	pub async fn wait_for_upload_completion_with(&self, options: WaitOptions) -> Result<(), Error> {
		self.wait_for_transfer(ProgressDirection::Upload, &options).await
	}

	pub async fn wait_for_download_completion(&self) -> Result<(), Error> {
		self.wait_for_transfer(ProgressDirection::Download, &WaitOptions::default())
			.await
	}

	pub async fn wait_for_download_completion_with(&self, options: WaitOptions) -> Result<(), Error> {
		self.wait_for_transfer(ProgressDirection::Download, &options)
			.await
	}

	/// Waits until everything transferable in `direction` when called was transferred.
	#[instrument(skip(self, options), fields(session_id = %self.inner.id), err)]
	async fn wait_for_transfer(
		&self,
		direction: ProgressDirection,
		options: &WaitOptions,
	) -> Result<(), Error> {
		enum Wake {
			Progress(bool),
			State(bool),
			NonFatal(bool),
		}

		self.ensure_open()?;

		let mut progress = self
			.inner
			.progress
			.subscribe(direction)
			.ok_or(Error::Disposed(self.inner.id))?;
		let target = progress.borrow_and_update().transferable_bytes;
		let mut state = self.inner.state_tx.subscribe();
		let mut nonfatal = self.inner.nonfatal_tx.subscribe();
		let cancel_on_error = self.inner.options.cancel_waits_on_nonfatal_error;

		let transfer = async {
			loop {
				if self.is_closed() {
					return Err(Error::Disposed(self.inner.id));
				}

				if progress.borrow_and_update().transferred_bytes >= target {
					return Ok(());
				}
				if *state.borrow_and_update() == SessionState::Invalid {
					return Err(Error::SessionInvalid(self.latched_error()));
				}

				let wake = (
					progress.changed().map(|res| Wake::Progress(res.is_ok())),
					state.changed().map(|res| Wake::State(res.is_ok())),
					async {
						if cancel_on_error {
							nonfatal.changed().await.is_ok()
						} else {
							future::pending().await
						}
					}
					.map(Wake::NonFatal),
				)
					.race()
					.await;

				match wake {
					Wake::Progress(false) | Wake::State(false) | Wake::NonFatal(false) => {
						return Err(Error::Disposed(self.inner.id));
					}
					Wake::NonFatal(true) => {
						if let Some(error) = nonfatal.borrow_and_update().clone() {
							return Err(Error::Interrupted(error));
						}
					}
					Wake::Progress(true) | Wake::State(true) => {}
				}
			}
		};

		wait::bounded(
			options,
			transfer,
			|| Error::Timeout(direction.label()),
			|| Error::Cancelled(direction.label()),
		)
		.await
	}

	/// Closes the session right away. Idempotent.
	pub fn close(&self) {
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		self.inner.shutdown.cancel();
		self.inner.transport.close();
		self.inner.progress.close();

		info!(session_id = %self.inner.id, "Closed sync session;");
	}

	/// Closes the session following its stop policy and waits for the driver to stop.
	#[instrument(skip(self), fields(session_id = %self.inner.id))]
	pub async fn close_and_wait(&self) {
		if self.inner.options.stop_policy == StopPolicy::AfterChangesUploaded
			&& !self.is_closed()
			&& *self.inner.state_tx.borrow() == SessionState::Active
		{
			match time::timeout(
				self.inner.options.close_timeout,
				self.wait_for_upload_completion(),
			)
			.await
			{
				Ok(Ok(())) => debug!("Uploaded pending changes before closing;"),
				Ok(Err(e)) => warn!(?e, "Closing with pending uploads;"),
				Err(_) => warn!("Timed out uploading pending changes before closing;"),
			}
		}

		self.close();

		let driver = self.inner.driver.lock().take();
		if let Some(driver) = driver {
			if let Err(e) = driver.await {
				error!(?e, "Session driver failed;");
			}
		}
	}
}
