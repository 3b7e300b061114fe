//! Watcher behavior against a real filesystem: burst coalescing and
//! fallback-relevant termination semantics.

use std::fs;
use std::time::Duration;

use tempfile::TempDir;

use reflectr::watch::RecursiveWatcher;

#[tokio::test(flavor = "multi_thread")]
async fn test_burst_of_creations_coalesces_into_one_event() {
	let dir = TempDir::new().unwrap();
	let mut watcher = RecursiveWatcher::new(dir.path()).unwrap();

	// Let the watch become effective before mutating.
	tokio::time::sleep(Duration::from_millis(200)).await;

	for index in 0..10 {
		fs::write(dir.path().join(format!("file-{}.txt", index)), b"x").unwrap();
	}

	let events = tokio::time::timeout(Duration::from_secs(5), watcher.next_events())
		.await
		.expect("no event within timeout")
		.expect("watch terminated unexpectedly");

	// All ten creations (possibly plus the parent directory) arrive in a
	// single coalesced set.
	let created = (0..10).filter(|i| events.contains(&format!("file-{}.txt", i))).count();
	assert_eq!(created, 10, "expected all creations in one event, got {:?}", events);

	watcher.terminate();
	assert_eq!(watcher.next_events().await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_events_are_root_relative() {
	let dir = TempDir::new().unwrap();
	fs::create_dir_all(dir.path().join("nested/deep")).unwrap();
	let mut watcher = RecursiveWatcher::new(dir.path()).unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	fs::write(dir.path().join("nested/deep/leaf.txt"), b"x").unwrap();

	let events = tokio::time::timeout(Duration::from_secs(5), watcher.next_events())
		.await
		.expect("no event within timeout")
		.expect("watch terminated unexpectedly");
	assert!(
		events.iter().any(|p| p.contains("nested/deep")),
		"expected a relative path under nested/deep: {:?}",
		events
	);
	assert!(events.iter().all(|p| !p.starts_with('/')), "absolute path leaked: {:?}", events);
}

// vim: ts=4
