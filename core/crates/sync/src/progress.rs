use std::{
	pin::Pin,
	task::{Context, Poll},
};

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressDirection {
	Upload,
	Download,
}

impl ProgressDirection {
	pub(crate) const fn label(self) -> &'static str {
		match self {
			Self::Upload => "upload completion",
			Self::Download => "download completion",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressMode {
	/// Every sample until the session closes.
	ReportIndefinitely,
	/// Samples up to the work outstanding when the stream was created.
	ForCurrentlyOutstandingWork,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
	pub transferred_bytes: u64,
	pub transferable_bytes: u64,
}

impl SyncProgress {
	#[must_use]
	pub const fn is_complete(&self) -> bool {
		self.transferred_bytes >= self.transferable_bytes
	}

	#[must_use]
	#[allow(clippy::cast_precision_loss)]
	pub fn fraction(&self) -> f64 {
		if self.transferable_bytes == 0 {
			1.0
		} else {
			(self.transferred_bytes as f64 / self.transferable_bytes as f64).min(1.0)
		}
	}
}

#[derive(Debug)]
struct Channels {
	upload: watch::Sender<SyncProgress>,
	download: watch::Sender<SyncProgress>,
}

impl Channels {
	const fn get(&self, direction: ProgressDirection) -> &watch::Sender<SyncProgress> {
		match direction {
			ProgressDirection::Upload => &self.upload,
			ProgressDirection::Download => &self.download,
		}
	}
}

/// Latest transfer samples of a session, per direction.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
	channels: Mutex<Option<Channels>>,
}

impl ProgressTracker {
	pub fn new() -> Self {
		Self {
			channels: Mutex::new(Some(Channels {
				upload: watch::Sender::new(SyncProgress::default()),
				download: watch::Sender::new(SyncProgress::default()),
			})),
		}
	}

	pub fn report(&self, direction: ProgressDirection, transferred: u64, transferable: u64) {
		if let Some(channels) = &*self.channels.lock() {
			channels.get(direction).send_replace(SyncProgress {
				transferred_bytes: transferred,
				transferable_bytes: transferable,
			});
		}
	}

	pub fn subscribe(&self, direction: ProgressDirection) -> Option<watch::Receiver<SyncProgress>> {
		self.channels
			.lock()
			.as_ref()
			.map(|channels| channels.get(direction).subscribe())
	}

	pub fn registrations(&self, direction: ProgressDirection) -> usize {
		self.channels
			.lock()
			.as_ref()
			.map_or(0, |channels| channels.get(direction).receiver_count())
	}

	/// Drops the senders, ending every stream and failing every waiter.
	pub fn close(&self) {
		self.channels.lock().take();
	}
}

pin_project_lite::pin_project! {
	/// Progress notifications of one direction of a session.
	///
	/// Holds a registration on the session until dropped.
	#[must_use = "streams do nothing unless polled"]
	pub struct ProgressStream {
		#[pin]
		samples: WatchStream<SyncProgress>,
		ceiling: Option<u64>,
		finished: bool,
	}
}

impl ProgressStream {
	pub(crate) fn new(samples: watch::Receiver<SyncProgress>, mode: ProgressMode) -> Self {
		let ceiling = match mode {
			ProgressMode::ReportIndefinitely => None,
			ProgressMode::ForCurrentlyOutstandingWork => Some(samples.borrow().transferable_bytes),
		};

		Self {
			samples: WatchStream::new(samples),
			ceiling,
			finished: false,
		}
	}
}

impl Stream for ProgressStream {
	type Item = SyncProgress;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.project();

		if *this.finished {
			return Poll::Ready(None);
		}

		match this.samples.poll_next(cx) {
			Poll::Ready(Some(sample)) => {
				let Some(ceiling) = *this.ceiling else {
					return Poll::Ready(Some(sample));
				};

				let bounded = SyncProgress {
					transferred_bytes: sample.transferred_bytes.min(ceiling),
					transferable_bytes: ceiling,
				};
				if bounded.is_complete() {
					*this.finished = true;
				}

				Poll::Ready(Some(bounded))
			}
			Poll::Ready(None) => {
				*this.finished = true;
				Poll::Ready(None)
			}
			Poll::Pending => Poll::Pending,
		}
	}
}
