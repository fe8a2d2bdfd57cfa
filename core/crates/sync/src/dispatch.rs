use std::{
	collections::VecDeque,
	fmt,
	panic::{self, AssertUnwindSafe},
	sync::Arc,
};

use parking_lot::Mutex;
use tracing::{error, trace};

use super::{
	error::{ErrorCode, ErrorId, SessionError},
	session::SyncSession,
};

pub type SyncErrorHandler = Arc<dyn Fn(&SyncSession, &SessionError) + Send + Sync>;

const REMEMBERED_ERRORS: usize = 256;

/// Where a session error goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
	ClientReset,
	Reauthenticate,
	Generic,
	/// Already delivered once.
	Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerSource {
	Session,
	Client,
	Logging,
}

/// Routes each session error to exactly one place.
///
/// The generic handler is resolved once, when the session is built: the per-session
/// handler, else the client default, else a handler that only logs.
pub(crate) struct ErrorDispatcher {
	source: HandlerSource,
	handler: SyncErrorHandler,
	reset_configured: bool,
	delivered: Mutex<VecDeque<ErrorId>>,
}

impl fmt::Debug for ErrorDispatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ErrorDispatcher")
			.field("source", &self.source)
			.field("reset_configured", &self.reset_configured)
			.finish_non_exhaustive()
	}
}

impl ErrorDispatcher {
	pub fn new(
		session_handler: Option<SyncErrorHandler>,
		client_handler: Option<SyncErrorHandler>,
		reset_configured: bool,
	) -> Self {
		let (source, handler) = [
			(HandlerSource::Session, session_handler),
			(HandlerSource::Client, client_handler),
		]
		.into_iter()
		.find_map(|(source, handler)| handler.map(|handler| (source, handler)))
		.unwrap_or_else(|| {
			let logging: SyncErrorHandler = Arc::new(log_unhandled);
			(HandlerSource::Logging, logging)
		});

		Self {
			source,
			handler,
			reset_configured,
			delivered: Mutex::new(VecDeque::with_capacity(REMEMBERED_ERRORS)),
		}
	}

	pub fn route(&self, error: &SessionError) -> Route {
		{
			let mut delivered = self.delivered.lock();
			if delivered.contains(&error.id) {
				return Route::Duplicate;
			}
			if delivered.len() == REMEMBERED_ERRORS {
				delivered.pop_front();
			}
			delivered.push_back(error.id);
		}

		if error.is_client_reset() && self.reset_configured {
			Route::ClientReset
		} else if error.code == ErrorCode::AccessTokenExpired {
			Route::Reauthenticate
		} else {
			Route::Generic
		}
	}

	pub fn deliver(&self, session: &SyncSession, error: &SessionError) {
		trace!(source = ?self.source, error_id = %error.id, "Delivering session error;");

		if panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(session, error))).is_err() {
			error!(source = ?self.source, "Session error handler panicked;");
		}
	}
}

fn log_unhandled(session: &SyncSession, error: &SessionError) {
	error!(session_id = %session.id(), %error, "Unhandled sync session error;");
}
