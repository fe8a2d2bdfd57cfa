//! Versioned Flexible Sync subscription sets.
//!
//! A replica owns a single [`SubscriptionStore`], the lineage of every committed
//! subscription set version. Handles ([`SubscriptionSet`]) pin one version of that
//! lineage and are mutated through [`MutableSubscriptionSet`] transactions.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod error;
mod mutable;
mod set;
mod snapshot;
mod storage;
mod store;
mod subscription;
pub mod wait;

pub use error::{Error, SubscriptionError};
pub use mutable::MutableSubscriptionSet;
pub use set::{HandleScope, SubscriptionIter, SubscriptionSet, WeakSubscriptionSet};
pub use snapshot::VersionedSnapshot;
pub use storage::{MemoryStorage, StorageError, WriteStorage};
pub use store::{AckOutcome, SubscriptionSetState, SubscriptionSnapshot, SubscriptionStore};
pub use subscription::{
	fingerprint, Fingerprint, Query, Subscription, SubscriptionId, SubscriptionOptions,
	TRUE_PREDICATE,
};
pub use wait::WaitOptions;
