//! Bounds for suspension points: a timeout and a cancellation token.
//!
//! Neither one affects the operation being waited on, they only stop the caller
//! from waiting any longer.

use std::{future::Future, time::Duration};

use futures::{future, FutureExt};
use futures_concurrency::future::Race;
use tokio::time;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
	pub timeout: Option<Duration>,
	pub cancel: Option<CancellationToken>,
}

impl WaitOptions {
	#[must_use]
	pub fn with_timeout(timeout: Duration) -> Self {
		Self {
			timeout: Some(timeout),
			cancel: None,
		}
	}

	#[must_use]
	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.cancel = Some(token);
		self
	}
}

/// Runs `fut` under `options`, mapping expiry and cancellation to caller errors.
pub async fn bounded<F, T, E>(
	options: &WaitOptions,
	fut: F,
	timed_out: impl FnOnce() -> E,
	cancelled: impl FnOnce() -> E,
) -> Result<T, E>
where
	F: Future<Output = Result<T, E>>,
{
	enum Outcome<T> {
		Done(T),
		Cancelled,
	}

	let cancel = async {
		match &options.cancel {
			Some(token) => token.cancelled().await,
			None => future::pending::<()>().await,
		}
	};

	let raced = (fut.map(Outcome::Done), cancel.map(|()| Outcome::Cancelled)).race();

	let outcome = match options.timeout {
		Some(timeout) => match time::timeout(timeout, raced).await {
			Ok(outcome) => outcome,
			Err(_) => return Err(timed_out()),
		},
		None => raced.await,
	};

	match outcome {
		Outcome::Done(res) => res,
		Outcome::Cancelled => Err(cancelled()),
	}
}
