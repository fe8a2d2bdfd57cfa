use std::{fmt, slice, sync::Arc};

/// Immutable, numbered view of a collection.
///
/// Cloning is cheap, the items are shared between every clone.
pub struct VersionedSnapshot<T> {
	version: u64,
	items: Arc<[T]>,
}

impl<T> VersionedSnapshot<T> {
	pub fn new(version: u64, items: impl Into<Arc<[T]>>) -> Self {
		Self {
			version,
			items: items.into(),
		}
	}

	#[must_use]
	pub fn empty() -> Self {
		Self::new(0, Vec::new())
	}

	/// Builds the next snapshot in the lineage, numbered `version + 1`.
	#[must_use]
	pub fn successor(&self, items: Vec<T>) -> Self {
		Self::new(self.version + 1, items)
	}

	#[must_use]
	pub const fn version(&self) -> u64 {
		self.version
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.items.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	#[must_use]
	pub fn get(&self, index: usize) -> Option<&T> {
		self.items.get(index)
	}

	pub fn iter(&self) -> slice::Iter<'_, T> {
		self.items.iter()
	}

	#[must_use]
	pub fn as_slice(&self) -> &[T] {
		&self.items
	}
}

impl<T> Clone for VersionedSnapshot<T> {
	fn clone(&self) -> Self {
		Self {
			version: self.version,
			items: Arc::clone(&self.items),
		}
	}
}

impl<T: PartialEq> PartialEq for VersionedSnapshot<T> {
	fn eq(&self, other: &Self) -> bool {
		self.version == other.version && self.items == other.items
	}
}

impl<T: Eq> Eq for VersionedSnapshot<T> {}

impl<T: fmt::Debug> fmt::Debug for VersionedSnapshot<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("VersionedSnapshot")
			.field("version", &self.version)
			.field("items", &self.items)
			.finish()
	}
}

impl<'a, T> IntoIterator for &'a VersionedSnapshot<T> {
	type Item = &'a T;
	type IntoIter = slice::Iter<'a, T>;

	fn into_iter(self) -> Self::IntoIter {
		self.iter()
	}
}
