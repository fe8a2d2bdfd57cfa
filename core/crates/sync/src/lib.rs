//! Sync client control plane: replicas, their sync sessions, client reset recovery
//! and session error dispatch.

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

mod auth;
mod client;
mod config;
mod dispatch;
mod error;
pub mod logging;
mod progress;
mod replica;
mod reset;
mod session;
mod transport;

pub use auth::{AuthError, AuthProvider, Credentials, SessionAuth, User, UserId, UserTokens};
pub use client::SyncClient;
pub use config::{ConfigError, StopPolicy, SyncConfig, SYNC_CONFIG_FILE_NAME};
pub use dispatch::SyncErrorHandler;
pub use error::{Error, ErrorCode, ErrorId, SessionError};
pub use progress::{ProgressDirection, ProgressMode, ProgressStream, SyncProgress};
pub use replica::{Replica, ReplicaConfig};
pub use reset::{
	AfterResetCallback, BeforeResetCallback, CallbackError, ClientResetContext,
	ClientResetStrategy, ReplicaView, ResetEngine, ResetEngineError, ResetOutcome, ResetPhase,
	SessionErrorCallback, StrategyKind,
};
pub use session::{SessionEvent, SessionId, SessionOptions, SessionState, SyncSession};
pub use transport::{
	EventSink, SubscriptionSetPayload, Transport, TransportError, TransportEvent,
	TransportSession,
};

pub use flx_sync::{
	AckOutcome, MemoryStorage, MutableSubscriptionSet, Query, Subscription, SubscriptionError,
	SubscriptionOptions, SubscriptionSet, SubscriptionSetState, SubscriptionSnapshot,
	WaitOptions, WriteStorage,
};
