//! Filesystem watching
//!
//! Best-effort change notification feeding accelerated scans. Platform
//! backends (FSEvents, ReadDirectoryChangesW, inotify) are reached through
//! the `notify` crate; behind every backend sits a coalescer that batches
//! raw paths into one set per quiet window so a burst of edits produces a
//! single event. Watchers expose an event channel and an error channel;
//! fatal conditions terminate the watch and the consumer falls back to
//! poll-based scanning.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logging::*;

pub mod non_recursive;
pub mod recursive;

pub use non_recursive::NonRecursiveWatcher;
pub use recursive::RecursiveWatcher;

/// Quiet window before a pending path set is delivered.
pub const COALESCING_WINDOW: Duration = Duration::from_millis(20);

/// Cap on paths accumulated within one coalescing window.
pub const MAXIMUM_PENDING_PATHS: usize = 128;

/// Fatal watch failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
	/// The pending path set exceeded its cap; observers must rescan.
	TooManyPendingPaths,

	/// The backend can no longer guarantee coverage (overflow, root
	/// replacement, rescan request).
	Invalidated { message: String },

	/// Backend failure.
	Backend { message: String },
}

impl std::fmt::Display for WatchError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			WatchError::TooManyPendingPaths => {
				write!(f, "too many pending paths in coalescing window")
			}
			WatchError::Invalidated { message } => write!(f, "watch invalidated: {}", message),
			WatchError::Backend { message } => write!(f, "watch backend failed: {}", message),
		}
	}
}

impl std::error::Error for WatchError {}

/// Raw input to the coalescer from a backend.
#[derive(Debug)]
pub(crate) enum RawEvent {
	Paths(Vec<String>),
	Failed(WatchError),
}

/// Accumulate raw backend paths and deliver them as one set per quiet
/// window. The window restarts whenever new paths arrive before delivery;
/// exceeding the pending cap terminates the watch.
pub(crate) async fn coalesce(
	mut raw: mpsc::UnboundedReceiver<RawEvent>,
	events: mpsc::Sender<BTreeSet<String>>,
	errors: mpsc::Sender<WatchError>,
	token: CancellationToken,
	maximum_pending: usize,
) {
	let mut pending: BTreeSet<String> = BTreeSet::new();
	let mut deadline: Option<Instant> = None;

	loop {
		let wait_until = deadline;
		tokio::select! {
			_ = token.cancelled() => break,
			raw_event = raw.recv() => {
				match raw_event {
					None => break,
					Some(RawEvent::Paths(paths)) => {
						for path in paths {
							pending.insert(path);
						}
						if pending.len() > maximum_pending {
							warn!(pending = pending.len(), "watch coalescing overflow");
							let _ = errors.send(WatchError::TooManyPendingPaths).await;
							break;
						}
						if !pending.is_empty() {
							deadline = Some(Instant::now() + COALESCING_WINDOW);
						}
					}
					Some(RawEvent::Failed(error)) => {
						let _ = errors.send(error).await;
						break;
					}
				}
			}
			_ = async move {
				match wait_until {
					Some(at) => tokio::time::sleep_until(at).await,
					None => futures::future::pending().await,
				}
			}, if wait_until.is_some() => {
				deadline = None;
				if !pending.is_empty() {
					let batch = std::mem::take(&mut pending);
					trace!(paths = batch.len(), "delivering coalesced watch event");
					if events.send(batch).await.is_err() {
						break;
					}
				}
			}
		}
	}
}


// vim: ts=4
