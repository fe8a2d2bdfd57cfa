use flx_sync::SubscriptionStore;

use std::{
	collections::HashMap,
	fmt,
	path::{Path, PathBuf},
	sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use super::{
	auth::User,
	config::SyncConfig,
	dispatch::{ErrorDispatcher, SyncErrorHandler},
	error::{Error, SessionError},
	replica::{Replica, ReplicaConfig, SharedReplica},
	reset::ClientResetCoordinator,
	session::{SessionOptions, SessionParams, SyncSession},
	transport::Transport,
};

/// Opens replicas for one user and keeps one session per replica path.
pub struct SyncClient {
	config: SyncConfig,
	transport: Arc<dyn Transport>,
	user: Arc<User>,
	default_error_handler: Option<SyncErrorHandler>,
	replicas: Mutex<HashMap<PathBuf, Weak<SharedReplica>>>,
}

impl fmt::Debug for SyncClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncClient")
			.field("app_id", &self.config.app_id)
			.field("user", &self.user)
			.field("replicas", &self.replicas.lock().len())
			.finish_non_exhaustive()
	}
}

impl SyncClient {
	pub fn new(config: SyncConfig, transport: Arc<dyn Transport>, user: Arc<User>) -> Self {
		Self {
			config,
			transport,
			user,
			default_error_handler: None,
			replicas: Mutex::new(HashMap::new()),
		}
	}

	/// Handler for session errors of replicas opened without their own.
	#[must_use]
	pub fn with_default_error_handler(
		mut self,
		handler: impl Fn(&SyncSession, &SessionError) + Send + Sync + 'static,
	) -> Self {
		self.default_error_handler = Some(Arc::new(handler));
		self
	}

	#[must_use]
	pub const fn config(&self) -> &SyncConfig {
		&self.config
	}

	#[must_use]
	pub const fn user(&self) -> &Arc<User> {
		&self.user
	}

	fn attach_existing(
		replicas: &mut HashMap<PathBuf, Weak<SharedReplica>>,
		path: &Path,
	) -> Option<Replica> {
		replicas.retain(|_, shared| shared.strong_count() > 0);
		replicas
			.get(path)
			.and_then(Weak::upgrade)
			.and_then(Replica::attach)
	}

	/// Opens a replica, or another handle on it when `path` is already open.
	///
	/// A second open of the same path shares the first one's session; its reset strategy
	/// and error handler are ignored.
	#[instrument(skip_all, fields(path = %replica.path.display()), err)]
	pub async fn open_replica(&self, replica: ReplicaConfig) -> Result<Replica, Error> {
		if let Some(handle) = Self::attach_existing(&mut self.replicas.lock(), &replica.path) {
			debug!("Attached to open replica;");
			return Ok(handle);
		}

		let ReplicaConfig {
			path,
			storage,
			reset_engine,
			client_reset,
			error_handler,
		} = replica;

		let store = SubscriptionStore::new(storage);
		let dispatcher = ErrorDispatcher::new(
			error_handler,
			self.default_error_handler.clone(),
			client_reset.is_configured(),
		);

		let session = SyncSession::open(
			self.transport.as_ref(),
			SessionParams {
				path: path.clone(),
				user: Arc::clone(&self.user),
				subscriptions: Arc::clone(&store),
				options: SessionOptions::from(&self.config),
				dispatcher,
				reset: ClientResetCoordinator::new(client_reset, reset_engine),
			},
		)
		.await?;

		let shared = Arc::new(SharedReplica::new(path.clone(), store, session));

		let mut replicas = self.replicas.lock();
		// Another open of this path may have finished while our session was connecting
		if let Some(handle) = Self::attach_existing(&mut replicas, &path) {
			drop(replicas);
			shared.discard();
			debug!("Attached to replica opened concurrently;");
			return Ok(handle);
		}
		replicas.insert(path, Arc::downgrade(&shared));
		let handle = Replica::first(shared);
		drop(replicas);

		info!("Opened replica;");

		Ok(handle)
	}
}
