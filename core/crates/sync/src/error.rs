use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
	auth::AuthError, config::ConfigError, session::SessionId, transport::TransportError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error(transparent)]
	Subscriptions(#[from] flx_sync::Error),
	#[error("sync session <id='{0}'> was closed")]
	Disposed(SessionId),
	#[error("sync session is invalid: {0}")]
	SessionInvalid(SessionError),
	#[error("wait interrupted by session error: {0}")]
	Interrupted(SessionError),
	#[error("timed out waiting for {0}")]
	Timeout(&'static str),
	#[error("wait for {0} was cancelled")]
	Cancelled(&'static str),
	#[error("replica <path='{}'> was closed", .0.display())]
	ReplicaClosed(PathBuf),
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error(transparent)]
	Auth(#[from] AuthError),
	#[error(transparent)]
	Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorId(Uuid);

impl ErrorId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for ErrorId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for ErrorId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
	/// Server and local history diverged, the replica must be reset.
	ClientReset,
	/// Divergence the engine cannot resolve by discarding local changes.
	AutoClientResetFailure,
	AccessTokenExpired,
	AuthenticationFailed,
	PermissionDenied,
	ProtocolViolation,
	ConnectionClosed,
	Other(i32),
}

impl ErrorCode {
	#[must_use]
	pub const fn is_reset_class(self) -> bool {
		matches!(self, Self::ClientReset | Self::AutoClientResetFailure)
	}

	#[must_use]
	pub const fn is_fatal(self) -> bool {
		matches!(
			self,
			Self::AuthenticationFailed | Self::PermissionDenied | Self::ProtocolViolation
		)
	}
}

/// An error reported by the sync transport for one session.
///
/// Every report carries its own id; re-deliveries of the same report share it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct SessionError {
	pub id: ErrorId,
	pub code: ErrorCode,
	pub message: String,
	pub is_reset_class: bool,
}

impl SessionError {
	pub fn new(code: ErrorCode, message: impl Into<String>, is_reset_class: bool) -> Self {
		Self {
			id: ErrorId::new(),
			code,
			message: message.into(),
			is_reset_class,
		}
	}

	#[must_use]
	pub const fn is_client_reset(&self) -> bool {
		self.is_reset_class || self.code.is_reset_class()
	}

	/// Errors after which the session cannot continue.
	#[must_use]
	pub const fn is_fatal(&self) -> bool {
		self.code.is_fatal() || self.is_client_reset()
	}
}
