use flx_sync::{HandleScope, SubscriptionSet, SubscriptionStore, WeakSubscriptionSet, WriteStorage};

use std::{
	fmt,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
	dispatch::SyncErrorHandler,
	error::{Error, SessionError},
	reset::{ClientResetStrategy, ResetEngine},
	session::SyncSession,
};

/// What a replica is opened with.
pub struct ReplicaConfig {
	pub path: PathBuf,
	pub storage: Arc<dyn WriteStorage>,
	pub reset_engine: Arc<dyn ResetEngine>,
	pub client_reset: ClientResetStrategy,
	/// Overrides the client default error handler for this replica's session.
	pub error_handler: Option<SyncErrorHandler>,
}

impl fmt::Debug for ReplicaConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ReplicaConfig")
			.field("path", &self.path)
			.field("client_reset", &self.client_reset)
			.field("error_handler", &self.error_handler.is_some())
			.finish_non_exhaustive()
	}
}

impl ReplicaConfig {
	pub fn new(
		path: impl Into<PathBuf>,
		storage: Arc<dyn WriteStorage>,
		reset_engine: Arc<dyn ResetEngine>,
	) -> Self {
		Self {
			path: path.into(),
			storage,
			reset_engine,
			client_reset: ClientResetStrategy::None,
			error_handler: None,
		}
	}

	#[must_use]
	pub fn with_client_reset(mut self, strategy: ClientResetStrategy) -> Self {
		self.client_reset = strategy;
		self
	}

	#[must_use]
	pub fn with_error_handler(
		mut self,
		handler: impl Fn(&SyncSession, &SessionError) + Send + Sync + 'static,
	) -> Self {
		self.error_handler = Some(Arc::new(handler));
		self
	}
}

/// State shared by every handle open on the same replica path.
pub(crate) struct SharedReplica {
	path: PathBuf,
	store: Arc<SubscriptionStore>,
	session: SyncSession,
	handles: AtomicUsize,
	closed: AtomicBool,
}

impl SharedReplica {
	pub fn new(path: PathBuf, store: Arc<SubscriptionStore>, session: SyncSession) -> Self {
		Self {
			path,
			store,
			session,
			handles: AtomicUsize::new(0),
			closed: AtomicBool::new(false),
		}
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Takes a handle unless the last one is already gone.
	fn acquire(&self) -> bool {
		!self.is_closed()
			&& self
				.handles
				.try_update(Ordering::AcqRel, Ordering::Acquire, |handles| {
					(handles > 0).then_some(handles + 1)
				})
				.is_ok()
	}

	/// Gives a handle back, returning `true` for the last one.
	fn release(&self) -> bool {
		if self.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.closed.store(true, Ordering::Release);
			true
		} else {
			false
		}
	}

	/// Closes a replica that never got a handle.
	pub fn discard(&self) {
		self.closed.store(true, Ordering::Release);
		self.session.close();
		self.store.close();
	}
}

/// A handle to an open replica.
///
/// Handles opened on the same path share subscriptions and session. Closing a handle
/// invalidates the subscription sets it produced; closing the last one closes the
/// session and the subscription store.
pub struct Replica {
	shared: Arc<SharedReplica>,
	scope: Arc<HandleScope>,
	cached: Mutex<Option<WeakSubscriptionSet>>,
}

impl fmt::Debug for Replica {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Replica")
			.field("path", &self.shared.path)
			.field("session", &self.shared.session)
			.field("closed", &self.is_closed())
			.finish_non_exhaustive()
	}
}

impl Replica {
	pub(crate) fn first(shared: Arc<SharedReplica>) -> Self {
		shared.handles.store(1, Ordering::Release);
		Self::with_scope(shared)
	}

	pub(crate) fn attach(shared: Arc<SharedReplica>) -> Option<Self> {
		shared.acquire().then(|| Self::with_scope(shared))
	}

	fn with_scope(shared: Arc<SharedReplica>) -> Self {
		Self {
			shared,
			scope: HandleScope::new(),
			cached: Mutex::new(None),
		}
	}

	#[must_use]
	pub fn path(&self) -> &Path {
		&self.shared.path
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.scope.is_closed() || self.shared.is_closed()
	}

	fn ensure_open(&self) -> Result<(), Error> {
		if self.is_closed() {
			Err(Error::ReplicaClosed(self.shared.path.clone()))
		} else {
			Ok(())
		}
	}

	/// The latest subscription set, reusing this handle's previous one while current.
	pub fn subscriptions(&self) -> Result<SubscriptionSet, Error> {
		self.ensure_open()?;

		let latest = self.shared.store.latest_version()?;
		let mut cached = self.cached.lock();

		if let Some(set) = cached.as_ref().and_then(WeakSubscriptionSet::upgrade) {
			if set.version()? == latest {
				return Ok(set);
			}
		}

		let set = SubscriptionSet::latest(&self.shared.store, &self.scope)?;
		*cached = Some(set.downgrade());

		Ok(set)
	}

	pub fn session(&self) -> Result<SyncSession, Error> {
		self.ensure_open()?;
		Ok(self.shared.session.clone())
	}

	/// Opens another handle on the same replica.
	pub fn open_another(&self) -> Result<Self, Error> {
		self.ensure_open()?;
		Self::attach(Arc::clone(&self.shared)).ok_or_else(|| Error::ReplicaClosed(self.shared.path.clone()))
	}

	/// Closes this handle. Idempotent.
	pub fn close(&self) {
		if !self.scope.close() {
			return;
		}

		if self.shared.release() {
			self.shared.session.close();
			self.shared.store.close();
			info!(path = %self.shared.path.display(), "Closed replica;");
		} else {
			debug!(path = %self.shared.path.display(), "Closed replica handle;");
		}
	}

	/// Like [`Replica::close`], letting the session finish uploading when this is the
	/// last handle.
	pub async fn close_and_wait(&self) {
		if !self.scope.close() {
			return;
		}

		if self.shared.release() {
			self.shared.session.close_and_wait().await;
			self.shared.store.close();
			info!(path = %self.shared.path.display(), "Closed replica;");
		}
	}
}

impl Drop for Replica {
	fn drop(&mut self) {
		self.close();
	}
}
