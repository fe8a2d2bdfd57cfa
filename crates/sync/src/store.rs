use std::{
	collections::BTreeMap,
	fmt,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::{
	error::{Error, SubscriptionError},
	snapshot::VersionedSnapshot,
	storage::WriteStorage,
	subscription::Subscription,
};

pub type SubscriptionSnapshot = VersionedSnapshot<Subscription>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionSetState {
	Pending,
	Complete,
	Error,
	Superseded,
}

impl SubscriptionSetState {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Complete | Self::Error)
	}
}

impl fmt::Display for SubscriptionSetState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pending => write!(f, "Pending"),
			Self::Complete => write!(f, "Complete"),
			Self::Error => write!(f, "Error"),
			Self::Superseded => write!(f, "Superseded"),
		}
	}
}

/// The server's verdict on a committed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
	Complete,
	Error(String),
}

#[derive(Debug)]
enum RecordState {
	Pending,
	Complete,
	Error(String),
}

#[derive(Debug)]
struct VersionRecord {
	snapshot: Arc<SubscriptionSnapshot>,
	state: RecordState,
}

#[derive(Debug)]
struct Lineage {
	head: Arc<SubscriptionSnapshot>,
	records: BTreeMap<u64, VersionRecord>,
	writer: Option<u64>,
	closed: bool,
}

impl Lineage {
	const fn ensure_open(&self) -> Result<(), Error> {
		if self.closed {
			Err(Error::Closed)
		} else {
			Ok(())
		}
	}

	/// Drops records behind the head that no handle references anymore.
	fn prune(&mut self) {
		let latest = self.head.version();
		let before = self.records.len();

		self.records.retain(|&version, record| {
			version >= latest || Arc::strong_count(&record.snapshot) > 1
		});

		let pruned = before - self.records.len();
		if pruned > 0 {
			trace!(pruned, latest, "Pruned subscription set versions;");
		}
	}
}

/// Every committed subscription set version of one replica.
///
/// Versions increase strictly, there is at most one open write transaction, and the
/// server acknowledgement of each version is latched on its record.
pub struct SubscriptionStore {
	storage: Arc<dyn WriteStorage>,
	lineage: RwLock<Lineage>,
	next_ticket: AtomicU64,
	changes_tx: watch::Sender<u64>,
}

impl fmt::Debug for SubscriptionStore {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let lineage = self.lineage.read();
		f.debug_struct("SubscriptionStore")
			.field("latest", &lineage.head.version())
			.field("records", &lineage.records.len())
			.field("writing", &lineage.writer.is_some())
			.field("closed", &lineage.closed)
			.finish_non_exhaustive()
	}
}

impl SubscriptionStore {
	#[must_use]
	pub fn new(storage: Arc<dyn WriteStorage>) -> Arc<Self> {
		let head = Arc::new(VersionedSnapshot::empty());
		let records = BTreeMap::from([(
			0,
			VersionRecord {
				snapshot: Arc::clone(&head),
				state: RecordState::Pending,
			},
		)]);
		let (changes_tx, _) = watch::channel(0);

		Arc::new(Self {
			storage,
			lineage: RwLock::new(Lineage {
				head,
				records,
				writer: None,
				closed: false,
			}),
			next_ticket: AtomicU64::new(1),
			changes_tx,
		})
	}

	pub fn is_closed(&self) -> bool {
		self.lineage.read().closed
	}

	pub fn latest_version(&self) -> Result<u64, Error> {
		let lineage = self.lineage.read();
		lineage.ensure_open()?;
		Ok(lineage.head.version())
	}

	pub fn latest_snapshot(&self) -> Result<Arc<SubscriptionSnapshot>, Error> {
		let lineage = self.lineage.read();
		lineage.ensure_open()?;
		Ok(Arc::clone(&lineage.head))
	}

	/// Notified with the latest version on every commit, acknowledgement and close.
	pub fn watch(&self) -> watch::Receiver<u64> {
		self.changes_tx.subscribe()
	}

	pub(crate) fn state_of(
		&self,
		version: u64,
	) -> Result<(SubscriptionSetState, Option<SubscriptionError>), Error> {
		let lineage = self.lineage.read();
		lineage.ensure_open()?;

		if version < lineage.head.version() {
			return Ok((SubscriptionSetState::Superseded, None));
		}

		Ok(match lineage.records.get(&version).map(|record| &record.state) {
			Some(RecordState::Complete) => (SubscriptionSetState::Complete, None),
			Some(RecordState::Error(message)) => (
				SubscriptionSetState::Error,
				Some(SubscriptionError {
					version,
					message: message.clone(),
				}),
			),
			Some(RecordState::Pending) | None => (SubscriptionSetState::Pending, None),
		})
	}

	/// Opens the lineage's single write transaction on top of `base_version`.
	pub(crate) fn begin_write(
		&self,
		base_version: u64,
	) -> Result<(u64, Arc<SubscriptionSnapshot>), Error> {
		let mut lineage = self.lineage.write();
		lineage.ensure_open()?;

		if lineage.writer.is_some() {
			return Err(Error::AlreadyUpdating);
		}

		let latest = lineage.head.version();
		if base_version < latest {
			return Err(Error::Superseded {
				version: base_version,
				latest,
			});
		}

		self.storage.begin_write()?;

		let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
		lineage.writer = Some(ticket);
		trace!(ticket, base_version, "Opened subscription set transaction;");

		Ok((ticket, Arc::clone(&lineage.head)))
	}

	pub(crate) fn ensure_writer(&self, ticket: u64) -> Result<(), Error> {
		let lineage = self.lineage.read();
		if !lineage.closed && lineage.writer == Some(ticket) {
			Ok(())
		} else {
			Err(Error::NoActiveTransaction)
		}
	}

	pub(crate) fn commit_write(
		&self,
		ticket: u64,
		subscriptions: Vec<Subscription>,
	) -> Result<Arc<SubscriptionSnapshot>, Error> {
		let snapshot = {
			let mut lineage = self.lineage.write();
			if lineage.closed || lineage.writer != Some(ticket) {
				return Err(Error::NoActiveTransaction);
			}
			lineage.writer = None;

			if let Err(e) = self.storage.commit() {
				if let Err(rollback_error) = self.storage.rollback() {
					warn!(
						?rollback_error,
						"Failed to roll back storage after a failed commit;"
					);
				}
				return Err(e.into());
			}

			let snapshot = Arc::new(lineage.head.successor(subscriptions));
			lineage.records.insert(
				snapshot.version(),
				VersionRecord {
					snapshot: Arc::clone(&snapshot),
					state: RecordState::Pending,
				},
			);
			lineage.head = Arc::clone(&snapshot);
			lineage.prune();

			snapshot
		};

		debug!(
			version = snapshot.version(),
			subscriptions = snapshot.len(),
			"Committed subscription set;"
		);
		self.changes_tx.send_replace(snapshot.version());

		Ok(snapshot)
	}

	pub(crate) fn abort_write(&self, ticket: u64) {
		let mut lineage = self.lineage.write();
		if lineage.writer != Some(ticket) {
			return;
		}
		lineage.writer = None;

		if let Err(e) = self.storage.rollback() {
			warn!(?e, "Failed to roll back subscription set transaction;");
		} else {
			trace!(ticket, "Rolled back subscription set transaction;");
		}
	}

	/// Latches the server's verdict on `version`.
	///
	/// Returns `false` when the version is unknown, already pruned, already terminal or
	/// when the store is closed.
	pub fn apply_ack(&self, version: u64, outcome: AckOutcome) -> bool {
		let mut lineage = self.lineage.write();
		if lineage.closed {
			return false;
		}

		let Some(record) = lineage.records.get_mut(&version) else {
			debug!(
				version,
				"Ignoring acknowledgement for unknown subscription set version;"
			);
			return false;
		};

		if !matches!(record.state, RecordState::Pending) {
			debug!(
				version,
				"Ignoring acknowledgement for already resolved subscription set;"
			);
			return false;
		}

		record.state = match outcome {
			AckOutcome::Complete => RecordState::Complete,
			AckOutcome::Error(message) => {
				warn!(%message, version, "Server rejected subscription set;");
				RecordState::Error(message)
			}
		};
		lineage.prune();
		let latest = lineage.head.version();
		drop(lineage);

		trace!(version, "Subscription set acknowledged;");
		self.changes_tx.send_replace(latest);

		true
	}

	/// Outcome of the newest terminal version at or after `version`, if any.
	fn resolution(&self, version: u64) -> Result<Option<Result<(), SubscriptionError>>, Error> {
		let lineage = self.lineage.read();
		lineage.ensure_open()?;

		Ok(lineage
			.records
			.range(version..)
			.rev()
			.find_map(|(&version, record)| match &record.state {
				RecordState::Pending => None,
				RecordState::Complete => Some(Ok(())),
				RecordState::Error(message) => Some(Err(SubscriptionError {
					version,
					message: message.clone(),
				})),
			}))
	}

	pub(crate) async fn wait_for(&self, version: u64) -> Result<(), Error> {
		let mut changes = self.changes_tx.subscribe();

		loop {
			if let Some(outcome) = self.resolution(version)? {
				return outcome.map_err(Into::into);
			}

			if changes.changed().await.is_err() {
				return Err(Error::Closed);
			}
		}
	}

	/// Closes the store, revoking any open transaction and failing every waiter.
	pub fn close(&self) {
		let mut lineage = self.lineage.write();
		if lineage.closed {
			return;
		}
		lineage.closed = true;

		if lineage.writer.take().is_some() {
			if let Err(e) = self.storage.rollback() {
				warn!(?e, "Failed to roll back revoked subscription set transaction;");
			}
		}
		lineage.records.clear();
		let latest = lineage.head.version();
		drop(lineage);

		debug!(latest, "Closed subscription store;");
		self.changes_tx.send_replace(latest);
	}
}
