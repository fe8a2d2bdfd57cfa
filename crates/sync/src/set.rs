use std::{
	fmt,
	panic::{self, AssertUnwindSafe},
	sync::{Arc, Weak},
};

use futures::FutureExt;
use futures_concurrency::future::Race;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::trace;

use super::{
	error::{Error, SubscriptionError},
	mutable::MutableSubscriptionSet,
	store::{SubscriptionSetState, SubscriptionSnapshot, SubscriptionStore},
	subscription::{fingerprint, Fingerprint, Query, Subscription},
	wait::{self, WaitOptions},
};

/// Lifetime of the subscription set references handed out by one replica handle.
///
/// Closing the scope closes every [`SubscriptionSet`] created under it, without
/// touching the underlying store.
#[derive(Debug)]
pub struct HandleScope {
	closed_tx: watch::Sender<bool>,
}

impl HandleScope {
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Returns `true` if this call is the one that closed the scope.
	pub fn close(&self) -> bool {
		self.closed_tx.send_if_modified(|closed| {
			let newly_closed = !*closed;
			*closed = true;
			newly_closed
		})
	}

	pub fn is_closed(&self) -> bool {
		*self.closed_tx.borrow()
	}

	pub async fn closed(&self) {
		let mut closed_rx = self.closed_tx.subscribe();
		// The sender lives as long as `self`, so this only returns once closed
		closed_rx.wait_for(|closed| *closed).await.ok();
	}
}

impl Default for HandleScope {
	fn default() -> Self {
		Self {
			closed_tx: watch::Sender::new(false),
		}
	}
}

struct Inner {
	store: Arc<SubscriptionStore>,
	scope: Arc<HandleScope>,
	current: RwLock<Arc<SubscriptionSnapshot>>,
}

/// A reference to one version of a replica's subscription lineage.
///
/// Reads see the pinned version; once a newer version is committed elsewhere the
/// reference reports [`SubscriptionSetState::Superseded`] and refuses updates, while
/// reads keep returning its frozen contents.
#[derive(Clone)]
pub struct SubscriptionSet {
	inner: Arc<Inner>,
}

impl fmt::Debug for SubscriptionSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SubscriptionSet")
			.field("version", &self.inner.current.read().version())
			.field("closed", &self.is_closed())
			.finish_non_exhaustive()
	}
}

impl SubscriptionSet {
	/// A reference to the latest committed version of `store`.
	pub fn latest(store: &Arc<SubscriptionStore>, scope: &Arc<HandleScope>) -> Result<Self, Error> {
		if scope.is_closed() {
			return Err(Error::Closed);
		}

		let snapshot = store.latest_snapshot()?;

		Ok(Self {
			inner: Arc::new(Inner {
				store: Arc::clone(store),
				scope: Arc::clone(scope),
				current: RwLock::new(snapshot),
			}),
		})
	}

	#[must_use]
	pub fn downgrade(&self) -> WeakSubscriptionSet {
		WeakSubscriptionSet {
			inner: Arc::downgrade(&self.inner),
		}
	}

	pub fn is_closed(&self) -> bool {
		self.inner.scope.is_closed() || self.inner.store.is_closed()
	}

	fn ensure_open(&self) -> Result<(), Error> {
		if self.is_closed() {
			Err(Error::Closed)
		} else {
			Ok(())
		}
	}

	pub(crate) fn store(&self) -> &SubscriptionStore {
		&self.inner.store
	}

	pub(crate) fn advance(&self, snapshot: Arc<SubscriptionSnapshot>) {
		*self.inner.current.write() = snapshot;
	}

	pub fn snapshot(&self) -> Result<Arc<SubscriptionSnapshot>, Error> {
		self.ensure_open()?;
		Ok(Arc::clone(&self.inner.current.read()))
	}

	pub fn version(&self) -> Result<u64, Error> {
		self.snapshot().map(|snapshot| snapshot.version())
	}

	pub fn len(&self) -> Result<usize, Error> {
		self.snapshot().map(|snapshot| snapshot.len())
	}

	pub fn is_empty(&self) -> Result<bool, Error> {
		self.snapshot().map(|snapshot| snapshot.is_empty())
	}

	pub fn get(&self, index: usize) -> Result<Subscription, Error> {
		let snapshot = self.snapshot()?;
		snapshot
			.get(index)
			.cloned()
			.ok_or(Error::IndexOutOfRange {
				index,
				len: snapshot.len(),
			})
	}

	/// Iterates over the version pinned at call time.
	pub fn iter(&self) -> Result<SubscriptionIter, Error> {
		self.snapshot().map(|snapshot| SubscriptionIter {
			set: self.downgrade(),
			snapshot,
			position: 0,
		})
	}

	pub fn find(&self, name: &str) -> Result<Option<Subscription>, Error> {
		Ok(self
			.snapshot()?
			.iter()
			.find(|subscription| subscription.name() == Some(name))
			.cloned())
	}

	pub fn find_query(&self, query: &Query) -> Result<Option<Subscription>, Error> {
		Ok(self
			.snapshot()?
			.iter()
			.find(|subscription| subscription.matches(query))
			.cloned())
	}

	pub fn state(&self) -> Result<SubscriptionSetState, Error> {
		let version = self.version()?;
		self.inner.store.state_of(version).map(|(state, _)| state)
	}

	/// The server's rejection of this version, present only in the `Error` state.
	pub fn error(&self) -> Result<Option<SubscriptionError>, Error> {
		let version = self.version()?;
		self.inner.store.state_of(version).map(|(_, error)| error)
	}

	pub fn fingerprint(&self) -> Result<Fingerprint, Error> {
		self.snapshot()
			.map(|snapshot| fingerprint(snapshot.as_slice()))
	}

	/// Opens a write transaction; dropping it uncommitted rolls it back.
	pub fn begin_update(&self) -> Result<MutableSubscriptionSet<'_>, Error> {
		let base_version = self.version()?;
		let (ticket, head) = self.inner.store.begin_write(base_version)?;

		Ok(MutableSubscriptionSet::new(self, ticket, &head))
	}

	/// Runs `mutator` inside a write transaction.
	///
	/// Commits when it returns `Ok`, rolls back when it returns `Err` or panics, and in
	/// the panic case resumes unwinding once the rollback is done. On commit this
	/// reference moves to the new version.
	pub fn update<R, E, F>(&self, mutator: F) -> Result<R, E>
	where
		E: From<Error>,
		F: FnOnce(&mut MutableSubscriptionSet<'_>) -> Result<R, E>,
	{
		let mut transaction = self.begin_update()?;

		match panic::catch_unwind(AssertUnwindSafe(|| mutator(&mut transaction))) {
			Ok(Ok(value)) => {
				transaction.commit()?;
				Ok(value)
			}
			Ok(Err(e)) => {
				transaction.rollback();
				Err(e)
			}
			Err(payload) => {
				transaction.rollback();
				trace!("Subscription set mutator panicked, transaction rolled back;");
				panic::resume_unwind(payload)
			}
		}
	}

	pub async fn wait_for_synchronization(&self) -> Result<(), Error> {
		self.wait_for_synchronization_with(WaitOptions::default())
			.await
	}

	/// Resolves once this version, or a newer one, reaches a terminal state.
	pub async fn wait_for_synchronization_with(&self, options: WaitOptions) -> Result<(), Error> {
		let version = self.version()?;
		let store = &self.inner.store;
		let scope = &self.inner.scope;

		let wait = (
			store.wait_for(version),
			scope.closed().map(|()| Err(Error::Closed)),
		)
			.race();

		wait::bounded(
			&options,
			wait,
			|| Error::Timeout(version),
			|| Error::Cancelled(version),
		)
		.await
	}
}

/// A non-owning [`SubscriptionSet`] reference.
#[derive(Debug, Clone, Default)]
pub struct WeakSubscriptionSet {
	inner: Weak<Inner>,
}

impl WeakSubscriptionSet {
	#[must_use]
	pub fn upgrade(&self) -> Option<SubscriptionSet> {
		self.inner.upgrade().map(|inner| SubscriptionSet { inner })
	}
}

/// Iterator over a pinned snapshot, restartable with [`SubscriptionIter::reset`].
#[derive(Debug, Clone)]
pub struct SubscriptionIter {
	set: WeakSubscriptionSet,
	snapshot: Arc<SubscriptionSnapshot>,
	position: usize,
}

impl SubscriptionIter {
	#[must_use]
	pub fn version(&self) -> u64 {
		self.snapshot.version()
	}

	/// Restarts from the first subscription of the version its set references now.
	///
	/// Once the set is dropped or closed the iterator ends immediately.
	pub fn reset(&mut self) {
		self.position = 0;

		match self.set.upgrade().as_ref().map(SubscriptionSet::snapshot) {
			Some(Ok(snapshot)) => self.snapshot = snapshot,
			_ => self.position = self.snapshot.len(),
		}
	}
}

impl Iterator for SubscriptionIter {
	type Item = Subscription;

	fn next(&mut self) -> Option<Self::Item> {
		let subscription = self.snapshot.get(self.position).cloned()?;
		self.position += 1;
		Some(subscription)
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		let remaining = self.snapshot.len().saturating_sub(self.position);
		(remaining, Some(remaining))
	}
}

impl ExactSizeIterator for SubscriptionIter {}
