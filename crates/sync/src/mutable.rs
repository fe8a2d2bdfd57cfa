use std::{mem, slice};

use tracing::{debug, trace};

use super::{
	error::Error,
	set::SubscriptionSet,
	store::SubscriptionSnapshot,
	subscription::{Query, Subscription, SubscriptionOptions},
};

/// The single open write transaction of a subscription lineage.
///
/// Starts from a copy of the latest committed version; nothing is visible to other
/// references until [`commit`](Self::commit). Dropping it uncommitted rolls back.
#[derive(Debug)]
pub struct MutableSubscriptionSet<'set> {
	set: &'set SubscriptionSet,
	ticket: u64,
	base_version: u64,
	subscriptions: Vec<Subscription>,
	finished: bool,
}

impl<'set> MutableSubscriptionSet<'set> {
	pub(crate) fn new(set: &'set SubscriptionSet, ticket: u64, head: &SubscriptionSnapshot) -> Self {
		Self {
			set,
			ticket,
			base_version: head.version(),
			subscriptions: head.iter().cloned().collect(),
			finished: false,
		}
	}

	fn ensure_active(&self) -> Result<(), Error> {
		if self.finished {
			return Err(Error::NoActiveTransaction);
		}
		self.set.store().ensure_writer(self.ticket)
	}

	/// Version this transaction was opened on; the commit produces `base_version + 1`.
	#[must_use]
	pub const fn base_version(&self) -> u64 {
		self.base_version
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.subscriptions.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.subscriptions.is_empty()
	}

	pub fn get(&self, index: usize) -> Result<&Subscription, Error> {
		self.subscriptions
			.get(index)
			.ok_or(Error::IndexOutOfRange {
				index,
				len: self.subscriptions.len(),
			})
	}

	pub fn iter(&self) -> slice::Iter<'_, Subscription> {
		self.subscriptions.iter()
	}

	#[must_use]
	pub fn find(&self, name: &str) -> Option<&Subscription> {
		self.subscriptions
			.iter()
			.find(|subscription| subscription.name() == Some(name))
	}

	#[must_use]
	pub fn find_query(&self, query: &Query) -> Option<&Subscription> {
		self.subscriptions
			.iter()
			.find(|subscription| subscription.matches(query))
	}

	/// Adds `query`, or returns the subscription already covering it.
	///
	/// Unnamed subscriptions are deduplicated on their exact query. A named one replaces
	/// the query of an existing subscription with the same name in place, unless
	/// `update_existing` is off, in which case a differing query is a
	/// [`Error::DuplicateName`].
	pub fn add(&mut self, query: &Query, options: SubscriptionOptions) -> Result<Subscription, Error> {
		self.ensure_active()?;

		let SubscriptionOptions {
			name,
			update_existing,
		} = options;

		let Some(name) = name else {
			if let Some(existing) = self
				.subscriptions
				.iter()
				.find(|subscription| !subscription.is_named() && subscription.matches(query))
			{
				return Ok(existing.clone());
			}

			return Ok(self.push(Subscription::new(None, query)));
		};

		let Some(position) = self
			.subscriptions
			.iter()
			.position(|subscription| subscription.name() == Some(name.as_str()))
		else {
			return Ok(self.push(Subscription::new(Some(name), query)));
		};

		let existing = &mut self.subscriptions[position];
		if existing.matches(query) {
			if update_existing {
				existing.touch();
			}
		} else if update_existing {
			trace!(%name, %query, "Replacing query of named subscription;");
			existing.replace_query(query);
		} else {
			return Err(Error::DuplicateName(name));
		}

		Ok(existing.clone())
	}

	fn push(&mut self, subscription: Subscription) -> Subscription {
		trace!(
			id = %subscription.id(),
			name = ?subscription.name(),
			object_type = subscription.object_type(),
			"Adding subscription;"
		);
		self.subscriptions.push(subscription.clone());
		subscription
	}

	pub fn remove_named(&mut self, name: &str) -> Result<bool, Error> {
		self.ensure_active()?;
		Ok(self.remove_where(|subscription| subscription.name() == Some(name)) > 0)
	}

	/// Removes `subscription` by id.
	pub fn remove(&mut self, subscription: &Subscription) -> Result<bool, Error> {
		self.ensure_active()?;
		let id = subscription.id();
		Ok(self.remove_where(|candidate| candidate.id() == id) > 0)
	}

	/// Removes every subscription on exactly `query`; named ones only if `remove_named`.
	pub fn remove_query(&mut self, query: &Query, remove_named: bool) -> Result<usize, Error> {
		self.ensure_active()?;
		Ok(self.remove_where(|subscription| {
			subscription.matches(query) && (remove_named || !subscription.is_named())
		}))
	}

	pub fn remove_by_type(&mut self, object_type: &str, remove_named: bool) -> Result<usize, Error> {
		self.ensure_active()?;
		Ok(self.remove_where(|subscription| {
			subscription.object_type() == object_type && (remove_named || !subscription.is_named())
		}))
	}

	pub fn remove_all(&mut self, remove_named: bool) -> Result<usize, Error> {
		self.ensure_active()?;
		Ok(self.remove_where(|subscription| remove_named || !subscription.is_named()))
	}

	fn remove_where(&mut self, predicate: impl Fn(&Subscription) -> bool) -> usize {
		let before = self.subscriptions.len();
		self.subscriptions
			.retain(|subscription| !predicate(subscription));

		let removed = before - self.subscriptions.len();
		trace!(removed, "Removed subscriptions;");
		removed
	}

	/// Publishes the transaction as `base_version + 1` and returns that version.
	pub fn commit(mut self) -> Result<u64, Error> {
		self.finished = true;

		let snapshot = self
			.set
			.store()
			.commit_write(self.ticket, mem::take(&mut self.subscriptions))?;
		let version = snapshot.version();
		self.set.advance(snapshot);

		Ok(version)
	}

	pub fn rollback(mut self) {
		self.finished = true;
		self.set.store().abort_write(self.ticket);
		debug!(
			base_version = self.base_version,
			"Discarded subscription set transaction;"
		);
	}
}

impl Drop for MutableSubscriptionSet<'_> {
	fn drop(&mut self) {
		if !self.finished {
			self.set.store().abort_write(self.ticket);
		}
	}
}
