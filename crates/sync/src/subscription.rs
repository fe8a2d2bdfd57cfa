use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::Error;

/// Predicate matching every object of a type.
pub const TRUE_PREDICATE: &str = "TRUEPREDICATE";

/// Digest of a subscription set's membership, see [`fingerprint`].
pub type Fingerprint = blake3::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for SubscriptionId {
	fn default() -> Self {
		Self::new()
	}
}

impl From<Uuid> for SubscriptionId {
	fn from(id: Uuid) -> Self {
		Self(id)
	}
}

impl From<SubscriptionId> for Uuid {
	fn from(SubscriptionId(id): SubscriptionId) -> Self {
		id
	}
}

impl fmt::Display for SubscriptionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// An object type paired with a canonical predicate.
///
/// Two queries are equal when both the type and the canonical predicate match exactly,
/// so `"age >  3"` and `" age > 3 "` refer to the same subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
	object_type: String,
	predicate: String,
}

impl Query {
	pub fn new(object_type: impl Into<String>, predicate: impl AsRef<str>) -> Result<Self, Error> {
		let object_type = object_type.into();
		if object_type.trim().is_empty() {
			return Err(Error::InvalidQuery("object type must not be empty"));
		}

		Ok(Self {
			object_type,
			predicate: canonicalize_predicate(predicate.as_ref()),
		})
	}

	pub fn all(object_type: impl Into<String>) -> Result<Self, Error> {
		Self::new(object_type, TRUE_PREDICATE)
	}

	#[must_use]
	pub fn object_type(&self) -> &str {
		&self.object_type
	}

	#[must_use]
	pub fn predicate(&self) -> &str {
		&self.predicate
	}
}

impl fmt::Display for Query {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {}", self.object_type, self.predicate)
	}
}

fn canonicalize_predicate(raw: &str) -> String {
	let mut canonical = String::with_capacity(raw.len());
	let mut quote = None;
	let mut escaped = false;
	let mut pending_space = false;

	for c in raw.trim().chars() {
		if let Some(open) = quote {
			canonical.push(c);
			if escaped {
				escaped = false;
			} else if c == '\\' {
				escaped = true;
			} else if c == open {
				quote = None;
			}
			continue;
		}

		if c.is_whitespace() {
			pending_space = true;
			continue;
		}

		if pending_space {
			canonical.push(' ');
			pending_space = false;
		}

		if c == '"' || c == '\'' {
			quote = Some(c);
		}
		canonical.push(c);
	}

	if canonical.is_empty() {
		TRUE_PREDICATE.to_string()
	} else {
		canonical
	}
}

/// Options for [`MutableSubscriptionSet::add`](crate::MutableSubscriptionSet::add).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
	pub name: Option<String>,
	/// Replace the query of an existing subscription with the same name.
	pub update_existing: bool,
}

impl SubscriptionOptions {
	#[must_use]
	pub fn named(name: impl Into<String>) -> Self {
		Self {
			name: Some(name.into()),
			..Default::default()
		}
	}

	#[must_use]
	pub const fn with_update_existing(mut self, update_existing: bool) -> Self {
		self.update_existing = update_existing;
		self
	}
}

impl Default for SubscriptionOptions {
	fn default() -> Self {
		Self {
			name: None,
			update_existing: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
	id: SubscriptionId,
	name: Option<String>,
	object_type: String,
	query: String,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
}

impl Subscription {
	pub(crate) fn new(name: Option<String>, query: &Query) -> Self {
		let now = Utc::now();

		Self {
			id: SubscriptionId::new(),
			name,
			object_type: query.object_type.clone(),
			query: query.predicate.clone(),
			created_at: now,
			updated_at: now,
		}
	}

	#[must_use]
	pub const fn id(&self) -> SubscriptionId {
		self.id
	}

	#[must_use]
	pub fn name(&self) -> Option<&str> {
		self.name.as_deref()
	}

	#[must_use]
	pub const fn is_named(&self) -> bool {
		self.name.is_some()
	}

	#[must_use]
	pub fn object_type(&self) -> &str {
		&self.object_type
	}

	#[must_use]
	pub fn query(&self) -> &str {
		&self.query
	}

	#[must_use]
	pub const fn created_at(&self) -> DateTime<Utc> {
		self.created_at
	}

	#[must_use]
	pub const fn updated_at(&self) -> DateTime<Utc> {
		self.updated_at
	}

	#[must_use]
	pub fn to_query(&self) -> Query {
		Query {
			object_type: self.object_type.clone(),
			predicate: self.query.clone(),
		}
	}

	#[must_use]
	pub fn matches(&self, query: &Query) -> bool {
		self.object_type == query.object_type && self.query == query.predicate
	}

	pub(crate) fn touch(&mut self) {
		self.updated_at = next_timestamp(self.updated_at);
	}

	pub(crate) fn replace_query(&mut self, query: &Query) {
		self.object_type.clone_from(&query.object_type);
		self.query.clone_from(&query.predicate);
		self.touch();
	}
}

// Clocks can be coarse, `updated_at` must still strictly advance.
fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
	let now = Utc::now();
	if now > previous {
		now
	} else {
		previous + Duration::microseconds(1)
	}
}

/// blake3 digest over `(name, object_type, query)` of every subscription, in order.
#[must_use]
pub fn fingerprint(subscriptions: &[Subscription]) -> Fingerprint {
	fn write_field(hasher: &mut blake3::Hasher, field: &str) {
		hasher.update(&(field.len() as u64).to_le_bytes());
		hasher.update(field.as_bytes());
	}

	let mut hasher = blake3::Hasher::new();
	hasher.update(&(subscriptions.len() as u64).to_le_bytes());

	for subscription in subscriptions {
		hasher.update(&[u8::from(subscription.is_named())]);
		write_field(&mut hasher, subscription.name().unwrap_or_default());
		write_field(&mut hasher, &subscription.object_type);
		write_field(&mut hasher, &subscription.query);
	}

	hasher.finalize()
}
