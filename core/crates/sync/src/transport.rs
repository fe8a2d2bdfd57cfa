use flx_sync::{AckOutcome, Fingerprint, SubscriptionSnapshot};

use std::{fmt, path::Path, sync::Arc};

use async_channel as chan;
use async_trait::async_trait;

use super::{
	auth::SessionAuth,
	error::{ErrorCode, SessionError},
	progress::ProgressDirection,
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
	#[error("failed to open sync connection: {0}")]
	Connect(String),
	#[error("sync session event sink was closed")]
	SinkClosed,
}

/// A committed subscription set version, as handed to the transport.
#[derive(Debug, Clone)]
pub struct SubscriptionSetPayload {
	pub version: u64,
	pub fingerprint: Fingerprint,
	pub subscriptions: Arc<SubscriptionSnapshot>,
}

/// Everything a transport reports back about one session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
	SubscriptionVersionAck {
		version: u64,
		outcome: AckOutcome,
	},
	Progress {
		direction: ProgressDirection,
		transferred: u64,
		transferable: u64,
	},
	SessionError(SessionError),
}

/// Where a transport delivers the events of the session it serves.
///
/// Cheap to clone and safe to use from any thread; events are applied in the order
/// they were sent.
#[derive(Clone)]
pub struct EventSink(chan::Sender<TransportEvent>);

impl fmt::Debug for EventSink {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventSink")
			.field("closed", &self.0.is_closed())
			.finish()
	}
}

impl EventSink {
	pub(crate) fn new() -> (Self, chan::Receiver<TransportEvent>) {
		let (tx, rx) = chan::unbounded();
		(Self(tx), rx)
	}

	pub fn is_closed(&self) -> bool {
		self.0.is_closed()
	}

	pub fn send(&self, event: TransportEvent) -> Result<(), TransportError> {
		self.0
			.try_send(event)
			.map_err(|_| TransportError::SinkClosed)
	}

	pub fn on_subscription_version_ack(
		&self,
		version: u64,
		outcome: AckOutcome,
	) -> Result<(), TransportError> {
		self.send(TransportEvent::SubscriptionVersionAck { version, outcome })
	}

	pub fn on_progress(
		&self,
		direction: ProgressDirection,
		transferred: u64,
		transferable: u64,
	) -> Result<(), TransportError> {
		self.send(TransportEvent::Progress {
			direction,
			transferred,
			transferable,
		})
	}

	/// Reports a new error; returns it so callers can re-deliver the same report.
	pub fn on_session_error(
		&self,
		code: ErrorCode,
		message: impl Into<String>,
		is_reset_class: bool,
	) -> Result<SessionError, TransportError> {
		let error = SessionError::new(code, message, is_reset_class);
		self.send(TransportEvent::SessionError(error.clone()))?;
		Ok(error)
	}
}

/// Opens network sessions for replicas.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
	async fn open_session(
		&self,
		replica_path: &Path,
		auth: SessionAuth,
		events: EventSink,
	) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// The network side of one sync session.
pub trait TransportSession: Send + Sync + 'static {
	fn resume(&self);

	fn pause(&self);

	fn send_subscription_set(&self, payload: SubscriptionSetPayload);

	fn update_access_token(&self, access_token: &str);

	fn close(&self);
}
