//! Non-recursive watcher
//!
//! Watches individual directories (no descent) behind an LRU of watched
//! paths: watching a path re-inserts it as most recently used, evicting and
//! unwatching the least recent when the cache is full. Used on platforms
//! whose recursive facility is unavailable or untrusted; events pass
//! through the same coalescer as the recursive watcher.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{coalesce, RawEvent, WatchError, MAXIMUM_PENDING_PATHS};

/// Default capacity of the watched-path LRU.
pub const DEFAULT_WATCH_CAPACITY: usize = 50;

pub struct NonRecursiveWatcher {
	events: mpsc::Receiver<BTreeSet<String>>,
	errors: mpsc::Receiver<WatchError>,
	token: CancellationToken,
	backend: Option<notify::RecommendedWatcher>,

	/// Most recently used first.
	watched: VecDeque<PathBuf>,
	capacity: usize,
}

impl NonRecursiveWatcher {
	pub fn new() -> Result<NonRecursiveWatcher, WatchError> {
		Self::with_capacity(DEFAULT_WATCH_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> Result<NonRecursiveWatcher, WatchError> {
		let (raw_tx, raw_rx) = mpsc::unbounded_channel();
		let (events_tx, events_rx) = mpsc::channel(16);
		let (errors_tx, errors_rx) = mpsc::channel(1);
		let token = CancellationToken::new();

		let backend = notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
			match result {
				Ok(event) => {
					if event.need_rescan() {
						let _ = raw_tx.send(RawEvent::Failed(WatchError::Invalidated {
							message: "backend requested a rescan".into(),
						}));
						return;
					}
					let paths: Vec<String> = event
						.paths
						.iter()
						.map(|p| p.to_string_lossy().into_owned())
						.collect();
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

		tokio::spawn(coalesce(
			raw_rx,
			events_tx,
			errors_tx,
			token.clone(),
			MAXIMUM_PENDING_PATHS,
		));

		Ok(NonRecursiveWatcher {
			events: events_rx,
			errors: errors_rx,
			token,
			backend: Some(backend),
			watched: VecDeque::new(),
			capacity,
		})
	}

	/// Watch a path non-recursively, re-inserting it as most recently used.
	/// The least recently used path is evicted (and unwatched) when the
	/// cache is full.
	pub fn watch(&mut self, path: &Path) -> Result<(), WatchError> {
		let Some(backend) = self.backend.as_mut() else {
			return Err(WatchError::Backend { message: "watcher terminated".into() });
		};

		if let Some(index) = self.watched.iter().position(|p| p == path) {
			let existing = self.watched.remove(index).unwrap();
			self.watched.push_front(existing);
			return Ok(());
		}

		while self.watched.len() >= self.capacity {
			if let Some(evicted) = self.watched.pop_back() {
				let _ = backend.unwatch(&evicted);
			}
		}

		backend
			.watch(path, RecursiveMode::NonRecursive)
			.map_err(|e| WatchError::Backend { message: e.to_string() })?;
		self.watched.push_front(path.to_path_buf());
		Ok(())
	}

	/// Explicitly evict a watched path.
	pub fn unwatch(&mut self, path: &Path) {
		if let Some(index) = self.watched.iter().position(|p| p == path) {
			self.watched.remove(index);
			if let Some(backend) = self.backend.as_mut() {
				let _ = backend.unwatch(path);
			}
		}
	}

	/// Paths currently watched, most recently used first.
	pub fn watched(&self) -> impl Iterator<Item = &PathBuf> {
		self.watched.iter()
	}

	pub async fn next_events(&mut self) -> Option<BTreeSet<String>> {
		self.events.recv().await
	}

	pub async fn next_error(&mut self) -> Option<WatchError> {
		self.errors.recv().await
	}

	/// Stop watching. Idempotent; unblocks pending receives.
	pub fn terminate(&mut self) {
		self.token.cancel();
		self.backend.take();
		self.watched.clear();
	}
}

impl Drop for NonRecursiveWatcher {
	fn drop(&mut self) {
		self.terminate();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use std::time::Duration;

	#[tokio::test(flavor = "multi_thread")]
	async fn test_lru_eviction() {
		let dir = tempfile::TempDir::new().unwrap();
		let mut paths = Vec::new();
		for index in 0..3 {
			let path = dir.path().join(format!("d{}", index));
			fs::create_dir(&path).unwrap();
			paths.push(path);
		}

		let mut watcher = NonRecursiveWatcher::with_capacity(2).unwrap();
		watcher.watch(&paths[0]).unwrap();
		watcher.watch(&paths[1]).unwrap();
		watcher.watch(&paths[2]).unwrap();

		let watched: Vec<&PathBuf> = watcher.watched().collect();
		assert_eq!(watched.len(), 2);
		assert_eq!(watched[0], &paths[2]);
		assert_eq!(watched[1], &paths[1]);
		watcher.terminate();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_rewatch_promotes_to_front() {
		let dir = tempfile::TempDir::new().unwrap();
		let first = dir.path().join("first");
		let second = dir.path().join("second");
		fs::create_dir(&first).unwrap();
		fs::create_dir(&second).unwrap();

		let mut watcher = NonRecursiveWatcher::with_capacity(4).unwrap();
		watcher.watch(&first).unwrap();
		watcher.watch(&second).unwrap();
		watcher.watch(&first).unwrap();

		let watched: Vec<&PathBuf> = watcher.watched().collect();
		assert_eq!(watched[0], &first);
		assert_eq!(watched.len(), 2);
		watcher.terminate();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_watched_directory_reports_changes() {
		let dir = tempfile::TempDir::new().unwrap();
		let watched_dir = dir.path().join("watched");
		fs::create_dir(&watched_dir).unwrap();

		let mut watcher = NonRecursiveWatcher::new().unwrap();
		watcher.watch(&watched_dir).unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;

		fs::write(watched_dir.join("inside.txt"), b"x").unwrap();
		let events = tokio::time::timeout(Duration::from_secs(5), watcher.next_events())
			.await
			.expect("timed out waiting for watch event")
			.expect("watch terminated unexpectedly");
		assert!(events.iter().any(|p| p.contains("inside.txt") || p.contains("watched")));

		watcher.unwatch(&watched_dir);
		assert_eq!(watcher.watched().count(), 0);
		watcher.terminate();
	}
}

// vim: ts=4
