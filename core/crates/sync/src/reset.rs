use flx_sync::SubscriptionSnapshot;

use std::{
	any::Any,
	error::Error as StdError,
	fmt,
	panic::{self, AssertUnwindSafe},
	path::{Path, PathBuf},
	sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
	error::{ErrorCode, SessionError},
	session::SyncSession,
};

pub type CallbackError = Box<dyn StdError + Send + Sync>;

pub type BeforeResetCallback = Arc<dyn Fn(&ReplicaView) -> Result<(), CallbackError> + Send + Sync>;
pub type AfterResetCallback =
	Arc<dyn Fn(&ReplicaView, &ReplicaView) -> Result<(), CallbackError> + Send + Sync>;
pub type SessionErrorCallback = Arc<dyn Fn(&SyncSession, &SessionError) + Send + Sync>;

/// How a session recovers once the server reports that its history diverged.
#[derive(Clone, Default)]
pub enum ClientResetStrategy {
	/// Discard unsynced local changes and adopt the server state.
	DiscardLocal {
		on_before_reset: Option<BeforeResetCallback>,
		on_after_reset: Option<AfterResetCallback>,
		/// Runs when the automatic reset can't be done or a callback failed.
		manual_fallback: SessionErrorCallback,
	},
	/// Leave recovery to the application.
	ManualRecovery { on_client_reset: SessionErrorCallback },
	/// Reset errors reach the generic error handler.
	#[default]
	None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
	DiscardLocal,
	ManualRecovery,
	None,
}

impl ClientResetStrategy {
	pub fn discard_local(
		manual_fallback: impl Fn(&SyncSession, &SessionError) + Send + Sync + 'static,
	) -> Self {
		Self::DiscardLocal {
			on_before_reset: None,
			on_after_reset: None,
			manual_fallback: Arc::new(manual_fallback),
		}
	}

	pub fn manual(on_client_reset: impl Fn(&SyncSession, &SessionError) + Send + Sync + 'static) -> Self {
		Self::ManualRecovery {
			on_client_reset: Arc::new(on_client_reset),
		}
	}

	#[must_use]
	pub fn with_before_reset(
		mut self,
		callback: impl Fn(&ReplicaView) -> Result<(), CallbackError> + Send + Sync + 'static,
	) -> Self {
		match &mut self {
			Self::DiscardLocal {
				on_before_reset, ..
			} => *on_before_reset = Some(Arc::new(callback)),
			other => warn!(strategy = ?other.kind(), "Before-reset callback ignored;"),
		}
		self
	}

	#[must_use]
	pub fn with_after_reset(
		mut self,
		callback: impl Fn(&ReplicaView, &ReplicaView) -> Result<(), CallbackError> + Send + Sync + 'static,
	) -> Self {
		match &mut self {
			Self::DiscardLocal { on_after_reset, .. } => *on_after_reset = Some(Arc::new(callback)),
			other => warn!(strategy = ?other.kind(), "After-reset callback ignored;"),
		}
		self
	}

	#[must_use]
	pub const fn kind(&self) -> StrategyKind {
		match self {
			Self::DiscardLocal { .. } => StrategyKind::DiscardLocal,
			Self::ManualRecovery { .. } => StrategyKind::ManualRecovery,
			Self::None => StrategyKind::None,
		}
	}

	#[must_use]
	pub const fn is_configured(&self) -> bool {
		!matches!(self, Self::None)
	}
}

impl fmt::Debug for ClientResetStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::DiscardLocal {
				on_before_reset,
				on_after_reset,
				..
			} => f
				.debug_struct("DiscardLocal")
				.field("on_before_reset", &on_before_reset.is_some())
				.field("on_after_reset", &on_after_reset.is_some())
				.finish_non_exhaustive(),
			Self::ManualRecovery { .. } => f.debug_struct("ManualRecovery").finish_non_exhaustive(),
			Self::None => write!(f, "None"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetPhase {
	Monitoring,
	ResetDetected,
	Recovering,
	Recovered,
	FallbackRequired,
	FallbackHandled,
	ManualHandled,
}

/// Read-only view of a replica around a client reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaView {
	path: PathBuf,
	frozen: bool,
	data_version: u64,
	subscriptions: Arc<SubscriptionSnapshot>,
}

impl ReplicaView {
	pub(crate) const fn new(
		path: PathBuf,
		frozen: bool,
		data_version: u64,
		subscriptions: Arc<SubscriptionSnapshot>,
	) -> Self {
		Self {
			path,
			frozen,
			data_version,
			subscriptions,
		}
	}

	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Frozen views are taken before the reset and never change.
	#[must_use]
	pub const fn is_frozen(&self) -> bool {
		self.frozen
	}

	#[must_use]
	pub const fn data_version(&self) -> u64 {
		self.data_version
	}

	#[must_use]
	pub fn subscriptions(&self) -> &SubscriptionSnapshot {
		&self.subscriptions
	}
}

/// One reset incident, from the triggering error to the post-reset view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResetContext {
	pub error: SessionError,
	pub before: Option<ReplicaView>,
	pub after: Option<ReplicaView>,
}

/// Completion signal of a reset incident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
	pub context: ClientResetContext,
	pub strategy: StrategyKind,
	pub phase: ResetPhase,
	pub completed_at: DateTime<Utc>,
}

impl ResetOutcome {
	#[must_use]
	pub const fn recovered(&self) -> bool {
		matches!(self.phase, ResetPhase::Recovered)
	}
}

#[derive(Debug, thiserror::Error)]
#[error("failed to discard local changes: {0}")]
pub struct ResetEngineError(pub String);

/// Storage side of a client reset.
pub trait ResetEngine: Send + Sync + 'static {
	fn data_version(&self, path: &Path) -> u64;

	/// Replaces local state with the server's, returning the new data version.
	fn discard_local_changes(&self, path: &Path) -> Result<u64, ResetEngineError>;
}

/// Runs the configured [`ClientResetStrategy`] for a session, one incident at a time.
pub(crate) struct ClientResetCoordinator {
	strategy: ClientResetStrategy,
	engine: Arc<dyn ResetEngine>,
	phase_tx: watch::Sender<ResetPhase>,
}

impl fmt::Debug for ClientResetCoordinator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientResetCoordinator")
			.field("strategy", &self.strategy)
			.field("phase", &*self.phase_tx.borrow())
			.finish_non_exhaustive()
	}
}

impl ClientResetCoordinator {
	pub fn new(strategy: ClientResetStrategy, engine: Arc<dyn ResetEngine>) -> Self {
		Self {
			strategy,
			engine,
			phase_tx: watch::Sender::new(ResetPhase::Monitoring),
		}
	}

	pub const fn is_configured(&self) -> bool {
		self.strategy.is_configured()
	}

	pub fn phase(&self) -> ResetPhase {
		*self.phase_tx.borrow()
	}

	fn transition(&self, phase: ResetPhase) {
		self.phase_tx.send_replace(phase);
		trace!(?phase, "Client reset state transitioned;");
	}

	/// Handles a reset-class error; `None` when it was dropped.
	#[instrument(skip_all, fields(error_id = %error.id, strategy = ?self.strategy.kind()))]
	pub fn handle(&self, session: &SyncSession, error: &SessionError) -> Option<ResetOutcome> {
		if !self.is_configured() {
			return None;
		}

		let phase = self.phase();
		if phase != ResetPhase::Monitoring {
			debug!(?phase, "Client reset already in progress or handled, dropping error;");
			return None;
		}

		self.transition(ResetPhase::ResetDetected);
		info!(%error, "Client reset detected;");
		session.suspend_for_reset();

		let mut context = ClientResetContext {
			error: error.clone(),
			before: None,
			after: None,
		};

		let phase = match &self.strategy {
			ClientResetStrategy::DiscardLocal {
				on_before_reset,
				on_after_reset,
				manual_fallback,
			} => self.discard_local(
				session,
				&mut context,
				on_before_reset.as_ref(),
				on_after_reset.as_ref(),
				manual_fallback,
			),
			ClientResetStrategy::ManualRecovery { on_client_reset } => {
				session.invalidate(error.clone());
				if let Err(e) = guarded("client reset", || {
					on_client_reset(session, error);
					Ok(())
				}) {
					error!(%e, "Manual client reset handler failed;");
				}
				self.transition(ResetPhase::ManualHandled);
				ResetPhase::ManualHandled
			}
			ClientResetStrategy::None => ResetPhase::Monitoring,
		};

		if phase == ResetPhase::Recovered {
			self.transition(ResetPhase::Monitoring);
		}
		info!(?phase, "Client reset finished;");

		Some(ResetOutcome {
			context,
			strategy: self.strategy.kind(),
			phase,
			completed_at: Utc::now(),
		})
	}

	fn discard_local(
		&self,
		session: &SyncSession,
		context: &mut ClientResetContext,
		on_before_reset: Option<&BeforeResetCallback>,
		on_after_reset: Option<&AfterResetCallback>,
		manual_fallback: &SessionErrorCallback,
	) -> ResetPhase {
		if context.error.code == ErrorCode::AutoClientResetFailure {
			warn!("Automatic client reset is not possible, handing over to manual fallback;");
			return self.fallback(session, &context.error, manual_fallback);
		}

		let path = session.replica_path();

		let before = match session.replica_view(true, self.engine.data_version(path)) {
			Ok(view) => view,
			Err(e) => {
				warn!(?e, "Failed to capture the pre-reset replica;");
				return self.fallback(session, &context.error, manual_fallback);
			}
		};
		context.before = Some(before.clone());

		if let Some(on_before_reset) = on_before_reset {
			if let Err(e) = guarded("before reset", || on_before_reset(&before)) {
				warn!(%e, "Before-reset callback failed, handing over to manual fallback;");
				return self.fallback(session, &context.error, manual_fallback);
			}
		}

		self.transition(ResetPhase::Recovering);

		let after = match self
			.engine
			.discard_local_changes(path)
			.map_err(|e| e.to_string())
			.and_then(|data_version| {
				session
					.replica_view(false, data_version)
					.map_err(|e| e.to_string())
			}) {
			Ok(view) => view,
			Err(e) => {
				warn!(%e, "Failed to discard local changes;");
				return self.fallback(session, &context.error, manual_fallback);
			}
		};

		if let Some(on_after_reset) = on_after_reset {
			// Local data is already reset at this point, a failing callback can't undo it
			if let Err(e) = guarded("after reset", || on_after_reset(&before, &after)) {
				error!(%e, "After-reset callback failed;");
			}
		}
		context.after = Some(after);

		self.transition(ResetPhase::Recovered);
		session.resume_after_reset();

		ResetPhase::Recovered
	}

	fn fallback(
		&self,
		session: &SyncSession,
		error: &SessionError,
		manual_fallback: &SessionErrorCallback,
	) -> ResetPhase {
		self.transition(ResetPhase::FallbackRequired);
		session.invalidate(error.clone());

		if let Err(e) = guarded("manual fallback", || {
			manual_fallback(session, error);
			Ok(())
		}) {
			error!(%e, "Manual fallback handler failed;");
		}

		self.transition(ResetPhase::FallbackHandled);
		ResetPhase::FallbackHandled
	}
}

/// Runs a user callback, turning a panic into an error.
fn guarded(
	name: &'static str,
	callback: impl FnOnce() -> Result<(), CallbackError>,
) -> Result<(), CallbackError> {
	panic::catch_unwind(AssertUnwindSafe(callback))
		.unwrap_or_else(|payload| Err(format!("{name} callback panicked: {}", panic_message(&*payload)).into()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	payload
		.downcast_ref::<&str>()
		.map(ToString::to_string)
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "<non-string panic payload>".to_string())
}
