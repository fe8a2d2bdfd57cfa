use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("a write transaction is already open on this replica")]
	WriteInProgress,
	#[error("no write transaction is open on this replica")]
	NoWriteInProgress,
	#[error("storage backend failure: {0}")]
	Backend(String),
}

/// Write transaction boundary of the replica's storage engine.
///
/// Subscription set updates are bracketed by `begin_write` and either `commit` or
/// `rollback`, so that they serialize with every other write on the same replica.
pub trait WriteStorage: Send + Sync + 'static {
	fn begin_write(&self) -> Result<(), StorageError>;

	fn commit(&self) -> Result<(), StorageError>;

	fn rollback(&self) -> Result<(), StorageError>;
}

/// In-memory [`WriteStorage`] that only tracks the transaction flag.
#[derive(Debug, Default)]
pub struct MemoryStorage {
	writing: AtomicBool,
	commits: AtomicU64,
	rollbacks: AtomicU64,
}

impl MemoryStorage {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_writing(&self) -> bool {
		self.writing.load(Ordering::Acquire)
	}

	pub fn commits(&self) -> u64 {
		self.commits.load(Ordering::Relaxed)
	}

	pub fn rollbacks(&self) -> u64 {
		self.rollbacks.load(Ordering::Relaxed)
	}

	fn finish(&self, counter: &AtomicU64) -> Result<(), StorageError> {
		if self.writing.swap(false, Ordering::AcqRel) {
			counter.fetch_add(1, Ordering::Relaxed);
			Ok(())
		} else {
			Err(StorageError::NoWriteInProgress)
		}
	}
}

impl WriteStorage for MemoryStorage {
	fn begin_write(&self) -> Result<(), StorageError> {
		self.writing
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.map(|_| ())
			.map_err(|_| StorageError::WriteInProgress)
	}

	fn commit(&self) -> Result<(), StorageError> {
		self.finish(&self.commits)
	}

	fn rollback(&self) -> Result<(), StorageError> {
		self.finish(&self.rollbacks)
	}
}
