//! Transition application
//!
//! Applies a list of reconciled changes to the filesystem in a safe order:
//! removals before creations, shallow creations before deeper ones, and
//! file-to-directory kind swaps split into a removal followed by a creation
//! with a phantom intermediate. Failures never abort the transition; each
//! becomes a problem, and the result entry for the change reflects what is
//! actually on disk. Self-healing is left to the next scan cycle.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::logging::*;
use crate::scan::probe;
use crate::snapshot::reify::reify_entry;
use crate::snapshot::{join_path, Change, Entry, Problem};
use crate::stage::Stager;

/// Error terminating a transition before completion.
#[derive(Debug)]
pub enum TransitionError {
	Cancelled,
}

impl std::fmt::Display for TransitionError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TransitionError::Cancelled => write!(f, "transition cancelled"),
		}
	}
}

impl std::error::Error for TransitionError {}

/// Result of applying a change list.
#[derive(Debug, Default)]
pub struct TransitionOutcome {
	/// Resulting content per change, in the order the changes were given.
	pub results: Vec<Option<Entry>>,

	pub problems: Vec<Problem>,

	/// Set when a change referenced staged content that was absent; the
	/// controller re-runs staging and retries.
	pub stager_missing_files: bool,
}

/// Apply changes beneath a synchronization root.
pub fn transition(
	token: &CancellationToken,
	root: &Path,
	changes: &[Change],
	stager: &Stager,
) -> Result<TransitionOutcome, TransitionError> {
	let executability = probe::probe(root).map(|p| p.preserves_executability).unwrap_or(false);

	let mut transitioner = Transitioner {
		root,
		stager,
		executability,
		problems: Vec::new(),
		stager_missing_files: false,
	};

	// Removals first, deepest paths leading; then creations and replacements,
	// shallowest first so parents exist before children.
	let mut order: Vec<usize> = (0..changes.len()).collect();
	order.sort_by(|&a, &b| {
		let (ca, cb) = (&changes[a], &changes[b]);
		let rank = |change: &Change| usize::from(!change.is_removal());
		let depth = |change: &Change| change.path.split('/').count();
		rank(ca)
			.cmp(&rank(cb))
			.then_with(|| {
				if ca.is_removal() {
					depth(cb).cmp(&depth(ca))
				} else {
					depth(ca).cmp(&depth(cb))
				}
			})
			.then_with(|| ca.path.cmp(&cb.path))
	});

	let mut results: Vec<Option<Entry>> = vec![None; changes.len()];
	for index in order {
		if token.is_cancelled() {
			return Err(TransitionError::Cancelled);
		}
		let change = &changes[index];
		results[index] = transitioner.apply(change);
	}

	Ok(TransitionOutcome {
		results,
		problems: transitioner.problems,
		stager_missing_files: transitioner.stager_missing_files,
	})
}

struct Transitioner<'a> {
	root: &'a Path,
	stager: &'a Stager,
	executability: bool,
	problems: Vec<Problem>,
	stager_missing_files: bool,
}

impl<'a> Transitioner<'a> {
	fn fs_path(&self, path: &str) -> PathBuf {
		if path.is_empty() {
			self.root.to_path_buf()
		} else {
			self.root.join(path)
		}
	}

	fn problem(&mut self, path: &str, error: impl std::fmt::Display) {
		self.problems.push(Problem::new(path, error.to_string()));
	}

	/// Apply one change and return the resulting on-disk content.
	fn apply(&mut self, change: &Change) -> Option<Entry> {
		match (&change.old, &change.new) {
			(None, None) => None,
			(Some(old), None) => {
				if self.remove(&change.path, old) {
					None
				} else {
					self.observe(&change.path, Some(old))
				}
			}
			(None, Some(new)) => {
				let fs_path = self.fs_path(&change.path);
				if fs_path.symlink_metadata().is_ok() {
					self.problem(&change.path, "path already exists");
					return self.observe(&change.path, None);
				}
				let result = self.create(&change.path, new);
				result.map(|e| reify_entry(&e))
			}
			(Some(old), Some(new)) => {
				// In-place file replacement is atomic via rename; everything
				// else becomes a removal followed by a creation, with the
				// creation result standing in as a phantom until complete.
				if let (Entry::File { .. }, Entry::File { digest, executable }) = (old, new) {
					return match self.place_file(&change.path, digest, *executable, true) {
						Ok(true) => Some(new.clone()),
						Ok(false) => self.observe(&change.path, Some(old)),
						Err(e) => {
							self.problem(&change.path, e);
							self.observe(&change.path, Some(old))
						}
					};
				}
				if !self.remove(&change.path, old) {
					return self.observe(&change.path, Some(old));
				}
				let result = self.create(&change.path, new);
				result.map(|e| reify_entry(&e))
			}
		}
	}

	/// Remove expected content, validating kinds before deletion. Returns
	/// whether removal fully succeeded.
	fn remove(&mut self, path: &str, expected: &Entry) -> bool {
		let fs_path = self.fs_path(path);
		let metadata = match fs_path.symlink_metadata() {
			Ok(metadata) => metadata,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				// Already gone; treat as success.
				return true;
			}
			Err(e) => {
				self.problem(path, e);
				return false;
			}
		};

		match expected {
			Entry::Directory { contents } | Entry::PhantomDirectory { contents } => {
				if !metadata.is_dir() {
					self.problem(path, "expected a directory but found other content");
					return false;
				}
				let mut clean = true;
				for (name, child) in contents {
					if !self.remove(&join_path(path, name), child) {
						clean = false;
					}
				}
				if !clean {
					return false;
				}
				// Unknown content makes the directory non-empty and the
				// removal fails, which is the safe outcome.
				match fs::remove_dir(&fs_path) {
					Ok(()) => true,
					Err(e) => {
						self.problem(path, format!("unable to remove directory: {}", e));
						false
					}
				}
			}
			Entry::File { .. } => {
				if !metadata.is_file() {
					self.problem(path, "expected a file but found other content");
					return false;
				}
				match fs::remove_file(&fs_path) {
					Ok(()) => true,
					Err(e) => {
						self.problem(path, e);
						false
					}
				}
			}
			Entry::SymbolicLink { .. } => {
				if !metadata.file_type().is_symlink() {
					self.problem(path, "expected a symbolic link but found other content");
					return false;
				}
				match fs::remove_file(&fs_path) {
					Ok(()) => true,
					Err(e) => {
						self.problem(path, e);
						false
					}
				}
			}
			Entry::Untracked | Entry::Problematic { .. } => {
				// Never remove content the engine does not understand.
				self.problem(path, "refusing to remove untracked content");
				false
			}
		}
	}

	/// Create content at a path assumed absent. Returns the created entry,
	/// using a phantom directory while a composite creation is in flight.
	fn create(&mut self, path: &str, entry: &Entry) -> Option<Entry> {
		match entry {
			Entry::File { digest, executable } => {
				match self.place_file(path, digest, *executable, false) {
					Ok(true) => Some(entry.clone()),
					Ok(false) => None,
					Err(e) => {
						self.problem(path, e);
						None
					}
				}
			}
			Entry::SymbolicLink { target } => match self.place_symlink(path, target) {
				Ok(()) => Some(entry.clone()),
				Err(e) => {
					self.problem(path, e);
					None
				}
			},
			Entry::Directory { contents } | Entry::PhantomDirectory { contents } => {
				let fs_path = self.fs_path(path);
				if let Err(e) = fs::create_dir(&fs_path) {
					self.problem(path, format!("unable to create directory: {}", e));
					return None;
				}
				let mut created = BTreeMap::new();
				for (name, child) in contents {
					if let Some(result) = self.create(&join_path(path, name), child) {
						created.insert(name.clone(), result);
					}
				}
				Some(Entry::PhantomDirectory { contents: created })
			}
			Entry::Untracked | Entry::Problematic { .. } => {
				self.problem(path, "cannot create untracked or problematic content");
				None
			}
		}
	}

	/// Move staged content into place. `replace` permits atomically renaming
	/// over existing content. Returns false (without a problem) when the
	/// staged file is missing.
	fn place_file(
		&mut self,
		path: &str,
		digest: &[u8],
		executable: bool,
		replace: bool,
	) -> io::Result<bool> {
		let Some(staged) = self.stager.provide(digest) else {
			debug!(path, "staged content missing; deferring to next cycle");
			self.stager_missing_files = true;
			return Ok(false);
		};
		let fs_path = self.fs_path(path);
		if !replace && fs_path.symlink_metadata().is_ok() {
			return Err(io::Error::new(io::ErrorKind::AlreadyExists, "path already exists"));
		}
		// Staged content normally lives on the same volume; fall back to a
		// copy when it does not.
		if fs::rename(&staged, &fs_path).is_err() {
			fs::copy(&staged, &fs_path)?;
			let _ = fs::remove_file(&staged);
		}
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let mode = if executable && self.executability { 0o755 } else { 0o644 };
			fs::set_permissions(&fs_path, fs::Permissions::from_mode(mode))?;
		}
		#[cfg(not(unix))]
		{
			let _ = executable;
		}
		Ok(true)
	}

	fn place_symlink(&mut self, path: &str, target: &str) -> io::Result<()> {
		#[cfg(unix)]
		{
			std::os::unix::fs::symlink(target, self.fs_path(path))
		}
		#[cfg(not(unix))]
		{
			let _ = (path, target);
			Err(io::Error::new(
				io::ErrorKind::Unsupported,
				"symbolic link creation is not supported on this platform",
			))
		}
	}

	/// Best-effort observation of on-disk content after a failed change,
	/// matched against the expectation where possible.
	fn observe(&self, path: &str, expected: Option<&Entry>) -> Option<Entry> {
		let fs_path = self.fs_path(path);
		let metadata = match fs_path.symlink_metadata() {
			Ok(metadata) => metadata,
			Err(_) => return None,
		};
		let file_type = metadata.file_type();
		if file_type.is_dir() {
			let expected_contents = expected.and_then(Entry::contents);
			let mut contents = BTreeMap::new();
			if let Ok(reader) = fs::read_dir(&fs_path) {
				for entry in reader.flatten() {
					let name = entry.file_name().to_string_lossy().into_owned();
					let child_expected = expected_contents.and_then(|c| c.get(&name));
					if let Some(child) =
						self.observe(&join_path(path, &name), child_expected)
					{
						contents.insert(name, child);
					}
				}
			}
			Some(Entry::Directory { contents })
		} else if file_type.is_symlink() {
			match fs::read_link(&fs_path).ok().and_then(|t| t.to_str().map(str::to_string)) {
				Some(target) if !target.is_empty() => Some(Entry::SymbolicLink { target }),
				_ => Some(Entry::Problematic { problem: "unreadable symbolic link".into() }),
			}
		} else if file_type.is_file() {
			match expected {
				Some(entry @ Entry::File { .. }) => Some(entry.clone()),
				_ => Some(Entry::Problematic { problem: "unexpected file content".into() }),
			}
		} else {
			Some(Entry::Untracked)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hash::Algorithm;

	fn digest(data: &[u8]) -> Vec<u8> {
		Algorithm::Sha256.digest(data).unwrap()
	}

	fn file_entry(data: &[u8]) -> Entry {
		Entry::File { digest: digest(data), executable: false }
	}

	fn setup() -> (tempfile::TempDir, PathBuf, Stager) {
		let dir = tempfile::TempDir::new().unwrap();
		let root = dir.path().join("root");
		fs::create_dir_all(&root).unwrap();
		let stager = Stager::open(dir.path().join("staging"), Algorithm::Sha256).unwrap();
		(dir, root, stager)
	}

	fn stage(stager: &Stager, data: &[u8]) {
		fs::write(stager.path_for(&digest(data)), data).unwrap();
	}

	fn run(root: &Path, changes: &[Change], stager: &Stager) -> TransitionOutcome {
		transition(&CancellationToken::new(), root, changes, stager).unwrap()
	}

	#[test]
	fn test_create_file() {
		let (_dir, root, stager) = setup();
		stage(&stager, b"contents");
		let changes = vec![Change::new("new.txt", None, Some(file_entry(b"contents")))];
		let outcome = run(&root, &changes, &stager);
		assert!(outcome.problems.is_empty());
		assert!(!outcome.stager_missing_files);
		assert_eq!(outcome.results[0], Some(file_entry(b"contents")));
		assert_eq!(fs::read(root.join("new.txt")).unwrap(), b"contents");
	}

	#[test]
	fn test_create_directory_tree() {
		let (_dir, root, stager) = setup();
		stage(&stager, b"inner");
		let tree = Entry::Directory {
			contents: [
				("inner.txt".to_string(), file_entry(b"inner")),
				("empty".to_string(), Entry::Directory { contents: BTreeMap::new() }),
			]
			.into_iter()
			.collect(),
		};
		let changes = vec![Change::new("sub", None, Some(tree.clone()))];
		let outcome = run(&root, &changes, &stager);
		assert!(outcome.problems.is_empty());
		// The phantom intermediate reifies to a real directory tree.
		assert_eq!(outcome.results[0], Some(tree));
		assert!(root.join("sub/empty").is_dir());
		assert_eq!(fs::read(root.join("sub/inner.txt")).unwrap(), b"inner");
	}

	#[test]
	fn test_remove_file() {
		let (_dir, root, stager) = setup();
		fs::write(root.join("old.txt"), b"old").unwrap();
		let changes = vec![Change::new("old.txt", Some(file_entry(b"old")), None)];
		let outcome = run(&root, &changes, &stager);
		assert!(outcome.problems.is_empty());
		assert_eq!(outcome.results[0], None);
		assert!(!root.join("old.txt").exists());
	}

	#[test]
	fn test_replace_file_is_atomic_rename() {
		let (_dir, root, stager) = setup();
		fs::write(root.join("f.txt"), b"old").unwrap();
		stage(&stager, b"new");
		let changes =
			vec![Change::new("f.txt", Some(file_entry(b"old")), Some(file_entry(b"new")))];
		let outcome = run(&root, &changes, &stager);
		assert!(outcome.problems.is_empty());
		assert_eq!(fs::read(root.join("f.txt")).unwrap(), b"new");
	}

	#[test]
	fn test_missing_staged_file_sets_flag_without_problem() {
		let (_dir, root, stager) = setup();
		let changes = vec![Change::new("new.txt", None, Some(file_entry(b"never staged")))];
		let outcome = run(&root, &changes, &stager);
		assert!(outcome.stager_missing_files);
		assert!(outcome.problems.is_empty());
		assert_eq!(outcome.results[0], None);
	}

	#[test]
	fn test_kind_swap_file_to_directory() {
		let (_dir, root, stager) = setup();
		fs::write(root.join("x"), b"file").unwrap();
		stage(&stager, b"child");
		let tree = Entry::Directory {
			contents: [("child.txt".to_string(), file_entry(b"child"))].into_iter().collect(),
		};
		let changes = vec![Change::new("x", Some(file_entry(b"file")), Some(tree.clone()))];
		let outcome = run(&root, &changes, &stager);
		assert!(outcome.problems.is_empty());
		assert_eq!(outcome.results[0], Some(tree));
		assert!(root.join("x").is_dir());
	}

	#[test]
	fn test_removal_refuses_unexpected_content() {
		let (_dir, root, stager) = setup();
		fs::create_dir(root.join("d")).unwrap();
		fs::write(root.join("d/known.txt"), b"known").unwrap();
		fs::write(root.join("d/surprise.txt"), b"surprise").unwrap();
		let expected = Entry::Directory {
			contents: [("known.txt".to_string(), file_entry(b"known"))].into_iter().collect(),
		};
		let changes = vec![Change::new("d", Some(expected), None)];
		let outcome = run(&root, &changes, &stager);
		assert!(!outcome.problems.is_empty());
		// The surprise file survives and is reported in the result.
		assert!(root.join("d/surprise.txt").exists());
		assert!(matches!(outcome.results[0], Some(Entry::Directory { .. })));
	}

	#[test]
	fn test_removal_of_modified_file_fails_safely() {
		let (_dir, root, stager) = setup();
		fs::create_dir(root.join("d")).unwrap();
		let changes = vec![Change::new("d", Some(file_entry(b"was a file")), None)];
		let outcome = run(&root, &changes, &stager);
		assert_eq!(outcome.problems.len(), 1);
		assert!(root.join("d").is_dir());
	}

	#[test]
	fn test_creation_over_existing_content_fails() {
		let (_dir, root, stager) = setup();
		fs::write(root.join("f"), b"surprise").unwrap();
		stage(&stager, b"new");
		let changes = vec![Change::new("f", None, Some(file_entry(b"new")))];
		let outcome = run(&root, &changes, &stager);
		assert_eq!(outcome.problems.len(), 1);
		assert_eq!(fs::read(root.join("f")).unwrap(), b"surprise");
	}

	#[test]
	fn test_removals_precede_creations() {
		let (_dir, root, stager) = setup();
		fs::write(root.join("away.txt"), b"away").unwrap();
		stage(&stager, b"fresh");
		// Given creation first in the list, the removal must still run first;
		// both succeed independently here, exercising the ordering path.
		let changes = vec![
			Change::new("fresh.txt", None, Some(file_entry(b"fresh"))),
			Change::new("away.txt", Some(file_entry(b"away")), None),
		];
		let outcome = run(&root, &changes, &stager);
		assert!(outcome.problems.is_empty());
		assert_eq!(outcome.results[0], Some(file_entry(b"fresh")));
		assert_eq!(outcome.results[1], None);
	}

	#[cfg(unix)]
	#[test]
	fn test_symlink_creation() {
		let (_dir, root, stager) = setup();
		let changes = vec![Change::new(
			"link",
			None,
			Some(Entry::SymbolicLink { target: "target.txt".into() }),
		)];
		let outcome = run(&root, &changes, &stager);
		assert!(outcome.problems.is_empty());
		assert_eq!(fs::read_link(root.join("link")).unwrap().to_str(), Some("target.txt"));
	}

	#[cfg(unix)]
	#[test]
	fn test_executable_bit_applied() {
		use std::os::unix::fs::PermissionsExt;
		let (_dir, root, stager) = setup();
		stage(&stager, b"#!/bin/sh\n");
		let changes = vec![Change::new(
			"run.sh",
			None,
			Some(Entry::File { digest: digest(b"#!/bin/sh\n"), executable: true }),
		)];
		let outcome = run(&root, &changes, &stager);
		assert!(outcome.problems.is_empty());
		let mode = fs::metadata(root.join("run.sh")).unwrap().permissions().mode();
		assert_ne!(mode & 0o100, 0);
	}

	#[test]
	fn test_cancellation() {
		let (_dir, root, stager) = setup();
		let token = CancellationToken::new();
		token.cancel();
		let changes = vec![Change::new("a", None, Some(file_entry(b"a")))];
		let result = transition(&token, &root, &changes, &stager);
		assert!(matches!(result, Err(TransitionError::Cancelled)));
	}
}

// vim: ts=4
