//! Filesystem scanner
//!
//! Walks a synchronization root and produces a snapshot together with a
//! fresh metadata cache and ignore-decision cache. Three modes are chosen
//! implicitly by argument shape: a cold scan (no baseline, empty cache)
//! hashes everything; a warm scan reuses cache digests for files whose
//! metadata is unchanged; an accelerated scan additionally lifts whole
//! subtrees verbatim from a baseline snapshot, guided by watcher-reported
//! re-check paths and directory modification times.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use unicode_normalization::UnicodeNormalization;

use crate::hash::{Algorithm, UnsupportedAlgorithm};
use crate::ignore::{IgnoreCache, IgnoreStatus, Ignorer};
use crate::logging::*;
use crate::snapshot::{join_path, valid_name, Entry, Snapshot};

pub mod cache;
pub mod probe;

pub use cache::{Cache, CacheEntry};
pub use probe::ProbeResults;

/// Symbolic link handling policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SymlinkMode {
	/// Skip symbolic links entirely.
	Ignore,

	/// Keep only targets that are portable across platforms: relative, with
	/// no parent-directory components.
	#[default]
	Portable,

	/// Keep any target verbatim.
	PosixRaw,
}

impl SymlinkMode {
	pub fn from_name(name: &str) -> Option<Self> {
		match name {
			"ignore" => Some(Self::Ignore),
			"portable" => Some(Self::Portable),
			"posix-raw" => Some(Self::PosixRaw),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::Ignore => "ignore",
			Self::Portable => "portable",
			Self::PosixRaw => "posix-raw",
		}
	}
}

/// Permission propagation policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionsMode {
	/// Preserve the executable bit only where the filesystem preserves it.
	#[default]
	Portable,

	/// Preserve the raw executable bit.
	PosixRaw,
}

impl PermissionsMode {
	pub fn from_name(name: &str) -> Option<Self> {
		match name {
			"portable" => Some(Self::Portable),
			"posix-raw" => Some(Self::PosixRaw),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::Portable => "portable",
			Self::PosixRaw => "posix-raw",
		}
	}
}

/// Error terminating a scan.
#[derive(Debug)]
pub enum ScanError {
	/// The root itself could not be read.
	Root { source: io::Error },

	/// The scan was cancelled.
	Cancelled,

	/// The session digest is unavailable in this build.
	UnsupportedAlgorithm(UnsupportedAlgorithm),
}

impl std::fmt::Display for ScanError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ScanError::Root { source } => write!(f, "unable to read synchronization root: {}", source),
			ScanError::Cancelled => write!(f, "scan cancelled"),
			ScanError::UnsupportedAlgorithm(e) => write!(f, "{}", e),
		}
	}
}

impl std::error::Error for ScanError {}

impl From<UnsupportedAlgorithm> for ScanError {
	fn from(e: UnsupportedAlgorithm) -> Self {
		ScanError::UnsupportedAlgorithm(e)
	}
}

/// Output of a scan: the snapshot plus the caches to carry into the next one.
#[derive(Debug)]
pub struct ScanResult {
	pub snapshot: Snapshot,
	pub cache: Cache,
	pub ignore_cache: IgnoreCache,
}

/// Scan a filesystem root.
///
/// `baseline` enables accelerated mode: only `recheck_paths`, their
/// ancestors, and directories with changed modification times are walked;
/// everything else is lifted from the baseline. Path-local failures become
/// `Problematic` entries and never abort the scan.
#[allow(clippy::too_many_arguments)]
pub fn scan(
	token: &CancellationToken,
	root: &Path,
	baseline: Option<&Snapshot>,
	recheck_paths: &BTreeSet<String>,
	algorithm: Algorithm,
	cache: &Cache,
	ignorer: &dyn Ignorer,
	ignore_cache: &IgnoreCache,
	symlink_mode: SymlinkMode,
	permissions_mode: PermissionsMode,
) -> Result<ScanResult, ScanError> {
	// Verify digest support up front so failures are deterministic.
	algorithm.hasher()?;

	let metadata = match fs::metadata(root) {
		Ok(metadata) => metadata,
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			return Ok(ScanResult {
				snapshot: Snapshot::default(),
				cache: Cache::new(),
				ignore_cache: IgnoreCache::new(),
			});
		}
		Err(e) => return Err(ScanError::Root { source: e }),
	};

	// Expand the re-check set with every ancestor so the walk reaches each
	// reported path.
	let mut recheck = BTreeSet::new();
	if baseline.is_some() {
		recheck.insert(String::new());
		for path in recheck_paths {
			recheck.insert(path.clone());
			let mut remainder = path.as_str();
			while let Some(index) = remainder.rfind('/') {
				remainder = &remainder[..index];
				recheck.insert(remainder.to_string());
			}
		}
	}

	let probes = if metadata.is_dir() {
		probe::probe(root).unwrap_or_default()
	} else {
		root.parent().map(|p| probe::probe(p).unwrap_or_default()).unwrap_or_default()
	};

	let mut scanner = Scanner {
		token,
		algorithm,
		old_cache: cache,
		new_cache: Cache::new(),
		ignorer,
		old_ignore_cache: ignore_cache,
		new_ignore_cache: IgnoreCache::new(),
		symlink_mode,
		permissions_mode,
		probes,
		baseline: baseline.filter(|b| !b.is_empty()),
		recheck,
		directories: 0,
		files: 0,
		symbolic_links: 0,
		total_file_size: 0,
	};

	let content = if metadata.is_dir() {
		Some(scanner.directory("", root, false)?)
	} else if metadata.is_file() {
		match scanner.file("", root, &metadata) {
			Ok(entry) => Some(entry),
			Err(e) => return Err(ScanError::Root { source: e }),
		}
	} else {
		Some(Entry::Untracked)
	};

	Ok(ScanResult {
		snapshot: Snapshot {
			content,
			preserves_executability: scanner.probes.preserves_executability,
			decomposes_unicode: scanner.probes.decomposes_unicode,
			directories: scanner.directories,
			files: scanner.files,
			symbolic_links: scanner.symbolic_links,
			total_file_size: scanner.total_file_size,
		},
		cache: scanner.new_cache,
		ignore_cache: scanner.new_ignore_cache,
	})
}

struct Scanner<'a> {
	token: &'a CancellationToken,
	algorithm: Algorithm,
	old_cache: &'a Cache,
	new_cache: Cache,
	ignorer: &'a dyn Ignorer,
	old_ignore_cache: &'a IgnoreCache,
	new_ignore_cache: IgnoreCache,
	symlink_mode: SymlinkMode,
	permissions_mode: PermissionsMode,
	probes: ProbeResults,
	baseline: Option<&'a Snapshot>,
	recheck: BTreeSet<String>,

	directories: u64,
	files: u64,
	symbolic_links: u64,
	total_file_size: u64,
}

impl<'a> Scanner<'a> {
	fn check_cancelled(&self) -> Result<(), ScanError> {
		if self.token.is_cancelled() {
			Err(ScanError::Cancelled)
		} else {
			Ok(())
		}
	}

	fn ignore_decision(&mut self, path: &str, directory: bool) -> (IgnoreStatus, bool) {
		if let Some(hit) = self.old_ignore_cache.get(path, directory) {
			if hit.0 != IgnoreStatus::Nominal {
				debug_assert_eq!(hit, self.ignorer.ignore(path, directory));
			}
			self.new_ignore_cache.insert(path.to_string(), directory, hit);
			return hit;
		}
		let decision = self.ignorer.ignore(path, directory);
		self.new_ignore_cache.insert(path.to_string(), directory, decision);
		decision
	}

	/// Scan a directory. `masked` indicates an ignored ancestor: content is
	/// only kept where a negation unignores it.
	fn directory(&mut self, path: &str, fs_path: &Path, masked: bool) -> Result<Entry, ScanError> {
		self.check_cancelled()?;

		// Accelerated mode: lift unchanged subtrees from the baseline.
		if let Some(lifted) = self.try_lift(path, fs_path) {
			if !masked {
				self.note_directory_counted(path);
			}
			return Ok(lifted);
		}

		let metadata = match fs::symlink_metadata(fs_path) {
			Ok(metadata) => metadata,
			Err(e) => {
				if path.is_empty() {
					return Err(ScanError::Root { source: e });
				}
				return Ok(problematic(&e));
			}
		};
		self.record_directory(path, &metadata);
		if path.is_empty() || !masked {
			self.note_directory_counted(path);
		}

		let reader = match fs::read_dir(fs_path) {
			Ok(reader) => reader,
			Err(e) => {
				if path.is_empty() {
					return Err(ScanError::Root { source: e });
				}
				return Ok(problematic(&e));
			}
		};

		let mut names: Vec<(String, PathBuf, fs::Metadata)> = Vec::new();
		let mut contents: BTreeMap<String, Entry> = BTreeMap::new();
		for entry in reader {
			self.check_cancelled()?;
			let entry = match entry {
				Ok(entry) => entry,
				Err(e) => {
					// A failing iterator poisons the whole directory.
					return Ok(problematic(&e));
				}
			};
			let raw_name = entry.file_name();
			let name = match raw_name.to_str() {
				Some(name) => name.to_string(),
				None => {
					let lossy = raw_name.to_string_lossy().into_owned();
					contents.insert(lossy, Entry::Problematic {
						problem: "name is not valid UTF-8".to_string(),
					});
					continue;
				}
			};
			if probe::is_probe_name(&name) || !valid_name(&name) {
				continue;
			}
			let metadata = match entry.metadata() {
				Ok(metadata) => metadata,
				Err(e) => {
					contents.insert(name, problematic(&e));
					continue;
				}
			};
			names.push((name, entry.path(), metadata));
		}
		names.sort_by(|a, b| a.0.cmp(&b.0));

		for (name, child_fs_path, metadata) in names {
			self.check_cancelled()?;
			let child_path = join_path(path, &name);
			if let Some(child) = self.child(&child_path, &child_fs_path, &metadata, masked)? {
				contents.insert(name, child);
			}
		}

		self.detect_name_collisions(&mut contents);

		Ok(Entry::Directory { contents })
	}

	fn child(
		&mut self,
		path: &str,
		fs_path: &Path,
		metadata: &fs::Metadata,
		masked: bool,
	) -> Result<Option<Entry>, ScanError> {
		let file_type = metadata.file_type();

		if file_type.is_dir() {
			let (status, continue_traversal) = self.ignore_decision(path, true);
			let child_masked =
				if masked { status != IgnoreStatus::Unignored } else { status == IgnoreStatus::Ignored };
			if child_masked && !continue_traversal {
				return Ok(None);
			}
			let entry = self.directory(path, fs_path, child_masked)?;
			if child_masked {
				// A masked directory survives only if an unignored
				// descendant was found beneath it.
				match &entry {
					Entry::Directory { contents } if !contents.is_empty() => {
						self.note_directory_counted(path);
					}
					_ => return Ok(None),
				}
			}
			return Ok(Some(entry));
		}

		let (status, _) = self.ignore_decision(path, false);
		let keep =
			if masked { status == IgnoreStatus::Unignored } else { status != IgnoreStatus::Ignored };
		if !keep {
			return Ok(None);
		}

		if file_type.is_symlink() {
			if self.symlink_mode == SymlinkMode::Ignore {
				return Ok(None);
			}
			return Ok(Some(self.symbolic_link(fs_path)));
		}

		if file_type.is_file() {
			return match self.file(path, fs_path, metadata) {
				Ok(entry) => Ok(Some(entry)),
				Err(e) => {
					if self.token.is_cancelled() {
						return Err(ScanError::Cancelled);
					}
					Ok(Some(problematic(&e)))
				}
			};
		}

		// Sockets, FIFOs, devices.
		Ok(Some(Entry::Untracked))
	}

	fn file(&mut self, path: &str, fs_path: &Path, metadata: &fs::Metadata) -> io::Result<Entry> {
		let mode = permission_mode(metadata);
		let modification_time = metadata.modified()?;
		let size = metadata.len();

		let digest = match self.old_cache.get(path) {
			Some(entry) if entry.matches(mode, modification_time, size) => entry.digest.clone(),
			_ => self.hash_file(fs_path)?,
		};

		let raw_executable = mode & 0o100 != 0;
		let executable = match self.permissions_mode {
			PermissionsMode::Portable => self.probes.preserves_executability && raw_executable,
			PermissionsMode::PosixRaw => raw_executable,
		};

		self.new_cache.insert(path.to_string(), CacheEntry {
			directory: false,
			mode,
			modification_time,
			size,
			digest: digest.clone(),
		});
		self.files += 1;
		self.total_file_size += size;

		Ok(Entry::File { digest, executable })
	}

	fn hash_file(&self, fs_path: &Path) -> io::Result<Vec<u8>> {
		let mut hasher = self
			.algorithm
			.hasher()
			.map_err(|e| io::Error::new(io::ErrorKind::Unsupported, e.to_string()))?;
		let mut file = fs::File::open(fs_path)?;
		let mut buffer = vec![0u8; 64 * 1024];
		loop {
			if self.token.is_cancelled() {
				return Err(io::Error::new(io::ErrorKind::Interrupted, "scan cancelled"));
			}
			let read = file.read(&mut buffer)?;
			if read == 0 {
				break;
			}
			hasher.update(&buffer[..read]);
		}
		Ok(hasher.finish())
	}

	fn symbolic_link(&mut self, fs_path: &Path) -> Entry {
		let target = match fs::read_link(fs_path) {
			Ok(target) => target,
			Err(e) => return problematic(&e),
		};
		let target = match target.to_str() {
			Some(target) => target.to_string(),
			None => {
				return Entry::Problematic { problem: "symbolic link target is not valid UTF-8".into() }
			}
		};
		if target.is_empty() {
			return Entry::Problematic { problem: "symbolic link target is empty".into() };
		}
		if self.symlink_mode == SymlinkMode::Portable {
			if let Err(problem) = portable_symlink_target(&target) {
				return Entry::Problematic { problem };
			}
		}
		self.symbolic_links += 1;
		Entry::SymbolicLink { target }
	}

	fn record_directory(&mut self, path: &str, metadata: &fs::Metadata) {
		if let Ok(modification_time) = metadata.modified() {
			self.new_cache.insert(path.to_string(), CacheEntry {
				directory: true,
				mode: permission_mode(metadata),
				modification_time,
				size: 0,
				digest: Vec::new(),
			});
		}
	}

	fn note_directory_counted(&mut self, path: &str) {
		// The root directory is not reflected in the aggregate counter.
		if !path.is_empty() {
			self.directories += 1;
		}
	}

	/// Attempt to reuse the baseline subtree at `path`: possible when the
	/// path needs no re-check and the directory's modification time matches
	/// the previous scan's cache entry.
	fn try_lift(&mut self, path: &str, fs_path: &Path) -> Option<Entry> {
		let baseline = self.baseline?;
		if self.recheck.contains(path) {
			return None;
		}
		let cached = self.old_cache.get(path)?;
		if !cached.directory {
			return None;
		}
		let metadata = fs::symlink_metadata(fs_path).ok()?;
		if !metadata.is_dir() || metadata.modified().ok()? != cached.modification_time {
			return None;
		}
		let entry = baseline.content.as_ref()?.find(path)?;
		if !matches!(entry, Entry::Directory { .. }) {
			return None;
		}

		trace!(path, "lifting unchanged subtree from baseline");
		let entry = entry.clone();
		self.add_counters(&entry, true);
		self.copy_cache_subtree(path);
		self.new_ignore_cache.copy_subtree(self.old_ignore_cache, path);
		Some(entry)
	}

	fn add_counters(&mut self, entry: &Entry, root: bool) {
		match entry {
			Entry::Directory { contents } | Entry::PhantomDirectory { contents } => {
				if !root {
					self.directories += 1;
				}
				for child in contents.values() {
					self.add_counters(child, false);
				}
			}
			Entry::File { .. } => {
				self.files += 1;
			}
			Entry::SymbolicLink { .. } => {
				self.symbolic_links += 1;
			}
			_ => {}
		}
	}

	fn copy_cache_subtree(&mut self, path: &str) {
		let prefix = format!("{}/", path);
		for (key, entry) in &self.old_cache.entries {
			if key == path || key.starts_with(&prefix) {
				if !entry.directory {
					self.total_file_size += entry.size;
				}
				self.new_cache.insert(key.clone(), entry.clone());
			}
		}
	}

	/// Detect children whose names collapse under the filesystem's observed
	/// case and Unicode normalization behavior, replacing each collapsed
	/// group with problematic markers.
	fn detect_name_collisions(&mut self, contents: &mut BTreeMap<String, Entry>) {
		if !self.probes.case_insensitive && !self.probes.decomposes_unicode {
			return;
		}
		let mut canonical: BTreeMap<String, Vec<String>> = BTreeMap::new();
		for name in contents.keys() {
			let mut key: String = name.nfc().collect();
			if self.probes.case_insensitive {
				key = key.to_lowercase();
			}
			canonical.entry(key).or_default().push(name.clone());
		}
		for group in canonical.values().filter(|g| g.len() > 1) {
			let description = group
				.iter()
				.map(|n| format!("{:?}", n))
				.collect::<Vec<_>>()
				.join(", ");
			warn!(names = %description, "directory children collapse to the same canonical name");
			for name in group {
				if let Some(previous) = contents.insert(
					name.clone(),
					Entry::Problematic {
						problem: format!("name conflicts under filesystem normalization with: {}", description),
					},
				) {
					self.subtract_counters(&previous);
				}
			}
		}
	}

	fn subtract_counters(&mut self, entry: &Entry) {
		match entry {
			Entry::Directory { contents } | Entry::PhantomDirectory { contents } => {
				self.directories = self.directories.saturating_sub(1);
				for child in contents.values() {
					self.subtract_counters(child);
				}
			}
			Entry::File { .. } => {
				self.files = self.files.saturating_sub(1);
			}
			Entry::SymbolicLink { .. } => {
				self.symbolic_links = self.symbolic_links.saturating_sub(1);
			}
			_ => {}
		}
	}
}

fn problematic(e: &impl std::fmt::Display) -> Entry {
	Entry::Problematic { problem: e.to_string() }
}

fn permission_mode(metadata: &fs::Metadata) -> u32 {
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		metadata.permissions().mode() & 0o7777
	}
	#[cfg(not(unix))]
	{
		if metadata.permissions().readonly() {
			0o444
		} else {
			0o644
		}
	}
}

/// Validate a symbolic link target under the portable policy: relative, and
/// free of parent-directory components.
fn portable_symlink_target(target: &str) -> Result<(), String> {
	if target.starts_with('/') {
		return Err(format!("symbolic link target is absolute: {}", target));
	}
	if target.len() >= 2 && target.as_bytes()[1] == b':' {
		return Err(format!("symbolic link target has a drive anchor: {}", target));
	}
	if target.split('/').any(|component| component == "..") {
		return Err(format!("symbolic link target escapes parent: {}", target));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ignore::MutagenIgnorer;
	use std::io::Write;

	fn write_file(root: &Path, name: &str, contents: &[u8]) {
		let path = root.join(name);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).unwrap();
		}
		let mut file = fs::File::create(path).unwrap();
		file.write_all(contents).unwrap();
	}

	fn no_ignores() -> MutagenIgnorer {
		MutagenIgnorer::new(&[]).unwrap()
	}

	fn cold_scan(root: &Path, ignorer: &dyn Ignorer) -> ScanResult {
		scan(
			&CancellationToken::new(),
			root,
			None,
			&BTreeSet::new(),
			Algorithm::Sha256,
			&Cache::new(),
			ignorer,
			&IgnoreCache::new(),
			SymlinkMode::Portable,
			PermissionsMode::Portable,
		)
		.unwrap()
	}

	#[test]
	fn test_scan_missing_root() {
		let dir = tempfile::TempDir::new().unwrap();
		let result = cold_scan(&dir.path().join("missing"), &no_ignores());
		assert!(result.snapshot.is_empty());
		assert!(result.cache.is_empty());
	}

	#[test]
	fn test_scan_single_file() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "hello.txt", b"hi");
		let result = cold_scan(dir.path(), &no_ignores());
		let snapshot = &result.snapshot;
		snapshot.ensure_valid().unwrap();
		assert_eq!(snapshot.files, 1);
		assert_eq!(snapshot.directories, 0);
		assert_eq!(snapshot.total_file_size, 2);
		let content = snapshot.content.as_ref().unwrap();
		match content.find("hello.txt").unwrap() {
			Entry::File { digest, executable } => {
				assert_eq!(digest, &Algorithm::Sha256.digest(b"hi").unwrap());
				assert!(!executable);
			}
			other => panic!("unexpected entry: {:?}", other),
		}
	}

	#[test]
	fn test_scan_counters_match_tree() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "a.txt", b"aaa");
		write_file(dir.path(), "sub/b.txt", b"bb");
		write_file(dir.path(), "sub/deep/c.txt", b"c");
		let result = cold_scan(dir.path(), &no_ignores());
		assert_eq!(result.snapshot.files, 3);
		assert_eq!(result.snapshot.directories, 2);
		assert_eq!(result.snapshot.total_file_size, 6);
		// Root plus two subdirectories plus three files.
		assert_eq!(result.snapshot.content.as_ref().unwrap().count(), 6);
	}

	#[test]
	fn test_warm_scan_reuses_digests() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "file.bin", b"payload");
		let first = cold_scan(dir.path(), &no_ignores());

		// Re-scan with the previous cache; digests must be identical even
		// though no hashing should occur for unchanged files.
		let second = scan(
			&CancellationToken::new(),
			dir.path(),
			None,
			&BTreeSet::new(),
			Algorithm::Sha256,
			&first.cache,
			&no_ignores(),
			&first.ignore_cache,
			SymlinkMode::Portable,
			PermissionsMode::Portable,
		)
		.unwrap();
		assert_eq!(first.snapshot, second.snapshot);
	}

	#[test]
	fn test_cache_reuse_is_keyed_on_metadata() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "f.bin", b"one");
		let first = cold_scan(dir.path(), &no_ignores());

		// Same size, same mtime: the cached digest is reused.
		let mtime = fs::metadata(dir.path().join("f.bin")).unwrap().modified().unwrap();
		write_file(dir.path(), "f.bin", b"two");
		filetime::set_file_mtime(
			dir.path().join("f.bin"),
			filetime::FileTime::from_system_time(mtime),
		)
		.unwrap();
		let stale = scan(
			&CancellationToken::new(),
			dir.path(),
			None,
			&BTreeSet::new(),
			Algorithm::Sha256,
			&first.cache,
			&no_ignores(),
			&first.ignore_cache,
			SymlinkMode::Portable,
			PermissionsMode::Portable,
		)
		.unwrap();
		assert_eq!(stale.snapshot, first.snapshot);

		// A modification-time bump invalidates the cache entry.
		filetime::set_file_mtime(
			dir.path().join("f.bin"),
			filetime::FileTime::from_unix_time(1_700_000_000, 0),
		)
		.unwrap();
		let fresh = scan(
			&CancellationToken::new(),
			dir.path(),
			None,
			&BTreeSet::new(),
			Algorithm::Sha256,
			&first.cache,
			&no_ignores(),
			&first.ignore_cache,
			SymlinkMode::Portable,
			PermissionsMode::Portable,
		)
		.unwrap();
		match fresh.snapshot.content.as_ref().unwrap().find("f.bin").unwrap() {
			Entry::File { digest, .. } => {
				assert_eq!(digest, &Algorithm::Sha256.digest(b"two").unwrap());
			}
			other => panic!("unexpected entry: {:?}", other),
		}
	}

	#[test]
	fn test_ignored_content_is_omitted() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "a.log", b"x");
		write_file(dir.path(), "keep.log", b"y");
		write_file(dir.path(), "notes.md", b"z");
		let ignorer = MutagenIgnorer::new(&["*.log".to_string(), "!keep.log".to_string()]).unwrap();
		let result = cold_scan(dir.path(), &ignorer);
		let content = result.snapshot.content.as_ref().unwrap();
		assert!(content.find("a.log").is_none());
		assert!(content.find("keep.log").is_some());
		assert!(content.find("notes.md").is_some());
		assert_eq!(result.snapshot.files, 2);
	}

	#[test]
	fn test_masked_directory_with_unignored_leaf() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "vendor/junk.txt", b"junk");
		write_file(dir.path(), "vendor/keep/important.txt", b"keep");
		let ignorer = MutagenIgnorer::new(&[
			"/vendor".to_string(),
			"!/vendor/keep/**".to_string(),
		])
		.unwrap();
		let result = cold_scan(dir.path(), &ignorer);
		let content = result.snapshot.content.as_ref().unwrap();
		assert!(content.find("vendor/keep/important.txt").is_some());
		assert!(content.find("vendor/junk.txt").is_none());
	}

	#[test]
	fn test_fully_ignored_directory_dropped() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "vendor/junk.txt", b"junk");
		let ignorer = MutagenIgnorer::new(&["/vendor".to_string()]).unwrap();
		let result = cold_scan(dir.path(), &ignorer);
		let content = result.snapshot.content.as_ref().unwrap();
		assert!(content.find("vendor").is_none());
		assert_eq!(result.snapshot.directories, 0);
	}

	#[cfg(unix)]
	#[test]
	fn test_portable_symlinks() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "target.txt", b"data");
		std::os::unix::fs::symlink("target.txt", dir.path().join("good")).unwrap();
		std::os::unix::fs::symlink("../escape", dir.path().join("bad")).unwrap();
		let result = cold_scan(dir.path(), &no_ignores());
		let content = result.snapshot.content.as_ref().unwrap();
		assert_eq!(
			content.find("good"),
			Some(&Entry::SymbolicLink { target: "target.txt".to_string() })
		);
		assert!(matches!(content.find("bad"), Some(Entry::Problematic { .. })));
		assert_eq!(result.snapshot.symbolic_links, 1);
	}

	#[cfg(unix)]
	#[test]
	fn test_posix_raw_symlinks() {
		let dir = tempfile::TempDir::new().unwrap();
		std::os::unix::fs::symlink("/absolute/target", dir.path().join("raw")).unwrap();
		let result = scan(
			&CancellationToken::new(),
			dir.path(),
			None,
			&BTreeSet::new(),
			Algorithm::Sha256,
			&Cache::new(),
			&no_ignores(),
			&IgnoreCache::new(),
			SymlinkMode::PosixRaw,
			PermissionsMode::Portable,
		)
		.unwrap();
		let content = result.snapshot.content.as_ref().unwrap();
		assert_eq!(
			content.find("raw"),
			Some(&Entry::SymbolicLink { target: "/absolute/target".to_string() })
		);
	}

	#[cfg(unix)]
	#[test]
	fn test_symlink_ignore_mode() {
		let dir = tempfile::TempDir::new().unwrap();
		std::os::unix::fs::symlink("x", dir.path().join("link")).unwrap();
		let result = scan(
			&CancellationToken::new(),
			dir.path(),
			None,
			&BTreeSet::new(),
			Algorithm::Sha256,
			&Cache::new(),
			&no_ignores(),
			&IgnoreCache::new(),
			SymlinkMode::Ignore,
			PermissionsMode::Portable,
		)
		.unwrap();
		assert!(result.snapshot.content.as_ref().unwrap().find("link").is_none());
	}

	#[cfg(unix)]
	#[test]
	fn test_executable_bit() {
		use std::os::unix::fs::PermissionsExt;
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "run.sh", b"#!/bin/sh\n");
		let path = dir.path().join("run.sh");
		fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
		let result = cold_scan(dir.path(), &no_ignores());
		match result.snapshot.content.as_ref().unwrap().find("run.sh").unwrap() {
			Entry::File { executable, .. } => assert!(executable),
			other => panic!("unexpected entry: {:?}", other),
		}
	}

	#[test]
	fn test_cancellation() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "a.txt", b"a");
		let token = CancellationToken::new();
		token.cancel();
		let result = scan(
			&token,
			dir.path(),
			None,
			&BTreeSet::new(),
			Algorithm::Sha256,
			&Cache::new(),
			&no_ignores(),
			&IgnoreCache::new(),
			SymlinkMode::Portable,
			PermissionsMode::Portable,
		);
		assert!(matches!(result, Err(ScanError::Cancelled)));
	}

	#[test]
	fn test_accelerated_scan_with_no_rechecks_matches_baseline() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "a.txt", b"alpha");
		write_file(dir.path(), "sub/b.txt", b"beta");
		let first = cold_scan(dir.path(), &no_ignores());

		let accelerated = scan(
			&CancellationToken::new(),
			dir.path(),
			Some(&first.snapshot),
			&BTreeSet::new(),
			Algorithm::Sha256,
			&first.cache,
			&no_ignores(),
			&first.ignore_cache,
			SymlinkMode::Portable,
			PermissionsMode::Portable,
		)
		.unwrap();
		assert_eq!(accelerated.snapshot, first.snapshot);
		assert_eq!(accelerated.cache, first.cache);
	}

	#[test]
	fn test_accelerated_scan_picks_up_rechecked_change() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "a.txt", b"alpha");
		write_file(dir.path(), "sub/b.txt", b"beta");
		let first = cold_scan(dir.path(), &no_ignores());

		write_file(dir.path(), "sub/b.txt", b"modified");
		let mut recheck = BTreeSet::new();
		recheck.insert("sub/b.txt".to_string());
		let accelerated = scan(
			&CancellationToken::new(),
			dir.path(),
			Some(&first.snapshot),
			&recheck,
			Algorithm::Sha256,
			&first.cache,
			&no_ignores(),
			&first.ignore_cache,
			SymlinkMode::Portable,
			PermissionsMode::Portable,
		)
		.unwrap();
		match accelerated.snapshot.content.as_ref().unwrap().find("sub/b.txt").unwrap() {
			Entry::File { digest, .. } => {
				assert_eq!(digest, &Algorithm::Sha256.digest(b"modified").unwrap());
			}
			other => panic!("unexpected entry: {:?}", other),
		}
		assert_eq!(accelerated.snapshot.total_file_size, 5 + 8);
	}

	#[test]
	fn test_file_root() {
		let dir = tempfile::TempDir::new().unwrap();
		write_file(dir.path(), "solo.txt", b"solo");
		let result = cold_scan(&dir.path().join("solo.txt"), &no_ignores());
		assert!(matches!(result.snapshot.content, Some(Entry::File { .. })));
		assert_eq!(result.snapshot.files, 1);
		assert_eq!(result.snapshot.total_file_size, 4);
	}

	#[test]
	fn test_unreadable_child_becomes_problematic() {
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let dir = tempfile::TempDir::new().unwrap();
			write_file(dir.path(), "secret/hidden.txt", b"data");
			let secret = dir.path().join("secret");
			fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();
			let result = cold_scan(dir.path(), &no_ignores());
			fs::set_permissions(&secret, fs::Permissions::from_mode(0o755)).unwrap();
			// Root of the unreadable subtree is reported, not fatal. Skip
			// the assertion when running as root, which ignores modes.
			if !matches!(result.snapshot.content.as_ref().unwrap().find("secret"),
				Some(Entry::Directory { .. }))
			{
				assert!(matches!(
					result.snapshot.content.as_ref().unwrap().find("secret"),
					Some(Entry::Problematic { .. })
				));
			}
		}
	}
}

// vim: ts=4
