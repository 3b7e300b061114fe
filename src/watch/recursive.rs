//! Recursive watcher
//!
//! Watches a whole synchronization root through the platform's recursive
//! facility and emits coalesced sets of root-relative paths. The target is
//! canonicalized once at creation so event paths (which arrive resolved)
//! can be made target-relative by prefix stripping; events outside the
//! target are discarded. Backends requesting a rescan invalidate the watch.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{coalesce, RawEvent, WatchError, MAXIMUM_PENDING_PATHS};

/// Channel capacity for delivered event sets; the consumer drains between
/// scans, so a small buffer suffices.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Outcome of waiting on a watcher.
#[derive(Debug)]
pub enum WatchOutcome {
	Events(BTreeSet<String>),
	Failed(WatchError),
	Terminated,
}

pub struct RecursiveWatcher {
	events: mpsc::Receiver<BTreeSet<String>>,
	errors: mpsc::Receiver<WatchError>,
	token: CancellationToken,
	backend: Option<notify::RecommendedWatcher>,
}

impl RecursiveWatcher {
	/// Start watching a target path recursively.
	pub fn new(target: &Path) -> Result<RecursiveWatcher, WatchError> {
		// Resolve symbolic links once; event paths arrive resolved and are
		// relativized against this prefix.
		let canonical = fs::canonicalize(target)
			.map_err(|e| WatchError::Backend { message: format!("unable to resolve target: {}", e) })?;

		let (raw_tx, raw_rx) = mpsc::unbounded_channel();
		let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
		let (errors_tx, errors_rx) = mpsc::channel(1);
		let token = CancellationToken::new();

		let prefix = canonical.clone();
		let mut backend = notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
			match result {
				Ok(event) => {
					if event.need_rescan() {
						let _ = raw_tx.send(RawEvent::Failed(WatchError::Invalidated {
							message: "backend requested a rescan".into(),
						}));
						return;
					}
					let paths = relativize(&prefix, &event.paths);
					if !paths.is_empty() {
						let _ = raw_tx.send(RawEvent::Paths(paths));
					}
				}
				Err(e) => {
					let _ = raw_tx.send(RawEvent::Failed(WatchError::Backend {
						message: e.to_string(),
					}));
				}
			}
		})
		.map_err(|e| WatchError::Backend { message: e.to_string() })?;

		backend
			.watch(&canonical, RecursiveMode::Recursive)
			.map_err(|e| WatchError::Backend { message: e.to_string() })?;

		tokio::spawn(coalesce(
			raw_rx,
			events_tx,
			errors_tx,
			token.clone(),
			MAXIMUM_PENDING_PATHS,
		));

		Ok(RecursiveWatcher { events: events_rx, errors: errors_rx, token, backend: Some(backend) })
	}

	/// Receive the next coalesced path set. Returns `None` once the watch
	/// has terminated.
	pub async fn next_events(&mut self) -> Option<BTreeSet<String>> {
		self.events.recv().await
	}

	/// Wait for the next watcher outcome: an event set, a fatal error, or
	/// termination.
	pub async fn next(&mut self) -> WatchOutcome {
		tokio::select! {
			events = self.events.recv() => {
				if let Some(paths) = events {
					return WatchOutcome::Events(paths);
				}
			}
			error = self.errors.recv() => {
				if let Some(error) = error {
					return WatchOutcome::Failed(error);
				}
			}
		}
		// A channel closed; report a still-pending error if one exists.
		match self.errors.try_recv() {
			Ok(error) => WatchOutcome::Failed(error),
			Err(_) => WatchOutcome::Terminated,
		}
	}

	/// Receive a fatal watch error, if one occurs.
	pub async fn next_error(&mut self) -> Option<WatchError> {
		self.errors.recv().await
	}

	/// Non-blocking check for a fatal error.
	pub fn take_error(&mut self) -> Option<WatchError> {
		self.errors.try_recv().ok()
	}

	/// Stop watching. Idempotent; unblocks pending receives.
	pub fn terminate(&mut self) {
		self.token.cancel();
		self.backend.take();
	}
}

impl Drop for RecursiveWatcher {
	fn drop(&mut self) {
		self.terminate();
	}
}

/// Convert absolute event paths into slash-separated target-relative paths,
/// dropping anything outside the target. An event for the target itself
/// maps to the empty root path.
fn relativize(prefix: &Path, paths: &[PathBuf]) -> Vec<String> {
	paths
		.iter()
		.filter_map(|path| {
			let relative = path.strip_prefix(prefix).ok()?;
			let mut result = String::new();
			for component in relative.components() {
				if !result.is_empty() {
					result.push('/');
				}
				result.push_str(&component.as_os_str().to_string_lossy());
			}
			Some(result)
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn test_relativize() {
		let prefix = PathBuf::from("/base/root");
		let paths = vec![
			PathBuf::from("/base/root/sub/file.txt"),
			PathBuf::from("/base/root"),
			PathBuf::from("/elsewhere/file.txt"),
		];
		let relative = relativize(&prefix, &paths);
		assert_eq!(relative, vec!["sub/file.txt".to_string(), String::new()]);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_watch_reports_created_files() {
		let dir = tempfile::TempDir::new().unwrap();
		let mut watcher = RecursiveWatcher::new(dir.path()).unwrap();

		// Give the backend a moment to become effective before mutating.
		tokio::time::sleep(Duration::from_millis(100)).await;
		fs::write(dir.path().join("created.txt"), b"x").unwrap();

		let events = tokio::time::timeout(Duration::from_secs(5), watcher.next_events())
			.await
			.expect("timed out waiting for watch event")
			.expect("watch terminated unexpectedly");
		assert!(events.iter().any(|p| p == "created.txt" || p.is_empty()));
		watcher.terminate();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_burst_coalesces_into_one_event() {
		let dir = tempfile::TempDir::new().unwrap();
		let mut watcher = RecursiveWatcher::new(dir.path()).unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;

		for index in 0..10 {
			fs::write(dir.path().join(format!("f{}.txt", index)), b"x").unwrap();
		}

		let events = tokio::time::timeout(Duration::from_secs(5), watcher.next_events())
			.await
			.expect("timed out waiting for watch event")
			.expect("watch terminated unexpectedly");
		let files = events.iter().filter(|p| p.starts_with('f')).count();
		assert!(files >= 1, "expected at least one created file in the batch: {:?}", events);
		watcher.terminate();
	}

	#[tokio::test]
	async fn test_terminate_is_idempotent() {
		let dir = tempfile::TempDir::new().unwrap();
		let mut watcher = RecursiveWatcher::new(dir.path()).unwrap();
		watcher.terminate();
		watcher.terminate();
		assert_eq!(watcher.next_events().await, None);
	}
}

// vim: ts=4
