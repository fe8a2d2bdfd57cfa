use thiserror::Error;

use super::storage::StorageError;

#[derive(Debug, Error)]
pub enum Error {
	#[error("subscription set is already being updated")]
	AlreadyUpdating,
	#[error("subscription set has no active write transaction")]
	NoActiveTransaction,
	#[error("subscription set <version='{version}'> was superseded by <version='{latest}'>")]
	Superseded { version: u64, latest: u64 },
	#[error("subscription <name='{0}'> already exists with a different query")]
	DuplicateName(String),
	#[error("subscription index out of range <index='{index}', len='{len}'>")]
	IndexOutOfRange { index: usize, len: usize },
	#[error("invalid query: {0}")]
	InvalidQuery(&'static str),
	#[error("subscription set was closed")]
	Closed,
	#[error("timed out waiting for subscription set <version='{0}'>")]
	Timeout(u64),
	#[error("wait for subscription set <version='{0}'> was cancelled")]
	Cancelled(u64),
	#[error(transparent)]
	Subscription(#[from] SubscriptionError),
	#[error(transparent)]
	Storage(#[from] StorageError),
}

/// Server-side rejection of a committed subscription set version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("subscription set <version='{version}'> was rejected: {message}")]
pub struct SubscriptionError {
	pub version: u64,
	pub message: String,
}
