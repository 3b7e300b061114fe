//! Scan cache
//!
//! Maps scanned paths to the metadata observed for them so later scans can
//! skip re-hashing files whose `(mode, mtime, size)` triple is unchanged.
//! Directory entries carry their mtime for accelerated re-scans. The cache
//! persists across restarts as an atomically replaced Protocol Buffers file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::snapshot::wire::{write_atomic, WireError};

/// Metadata recorded for one scanned path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
	/// Whether the path was a directory.
	pub directory: bool,

	/// Permission bits as observed.
	pub mode: u32,

	pub modification_time: SystemTime,

	pub size: u64,

	/// Content digest; empty for directories.
	pub digest: Vec<u8>,
}

impl CacheEntry {
	/// Whether a file's current metadata still matches this entry, allowing
	/// its digest to be reused.
	pub fn matches(&self, mode: u32, modification_time: SystemTime, size: u64) -> bool {
		!self.directory
			&& self.mode == mode
			&& self.modification_time == modification_time
			&& self.size == size
	}
}

/// Path-keyed scan cache. Exchanged by move between controller and scanner.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cache {
	pub entries: HashMap<String, CacheEntry>,
}

impl Cache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, path: &str) -> Option<&CacheEntry> {
		self.entries.get(path)
	}

	pub fn insert(&mut self, path: String, entry: CacheEntry) {
		self.entries.insert(path, entry);
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Build a digest-to-path map for staging dedup. When several paths
	/// share content, the lexicographically first path wins so the result
	/// is deterministic.
	pub fn generate_reverse_lookup(&self) -> HashMap<Vec<u8>, String> {
		let mut reverse: HashMap<Vec<u8>, String> = HashMap::new();
		for (path, entry) in &self.entries {
			if entry.digest.is_empty() {
				continue;
			}
			match reverse.get_mut(&entry.digest) {
				Some(existing) => {
					if path < existing {
						*existing = path.clone();
					}
				}
				None => {
					reverse.insert(entry.digest.clone(), path.clone());
				}
			}
		}
		reverse
	}

	/// Persist atomically (temp-then-rename, mode 0600).
	pub fn save(&self, path: &Path) -> Result<(), WireError> {
		write_atomic(path, &WireCache::from(self).encode_to_vec())?;
		Ok(())
	}

	/// Load a persisted cache. A missing file yields an empty cache.
	pub fn load(path: &Path) -> Result<Cache, WireError> {
		match fs::read(path) {
			Ok(data) => Cache::try_from(&WireCache::decode(data.as_slice())?),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Cache::new()),
			Err(e) => Err(WireError::Io(e)),
		}
	}
}

#[derive(Clone, PartialEq, Message)]
pub struct WireCacheEntry {
	#[prost(string, tag = "1")]
	pub path: String,

	#[prost(bool, tag = "2")]
	pub directory: bool,

	#[prost(uint32, tag = "3")]
	pub mode: u32,

	#[prost(int64, tag = "4")]
	pub modification_time_seconds: i64,

	#[prost(uint32, tag = "5")]
	pub modification_time_nanos: u32,

	#[prost(uint64, tag = "6")]
	pub size: u64,

	#[prost(bytes = "vec", tag = "7")]
	pub digest: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireCache {
	#[prost(message, repeated, tag = "1")]
	pub entries: Vec<WireCacheEntry>,
}

impl From<&Cache> for WireCache {
	fn from(cache: &Cache) -> Self {
		let mut entries: Vec<WireCacheEntry> = cache
			.entries
			.iter()
			.map(|(path, entry)| {
				let (seconds, nanos) = split_system_time(entry.modification_time);
				WireCacheEntry {
					path: path.clone(),
					directory: entry.directory,
					mode: entry.mode,
					modification_time_seconds: seconds,
					modification_time_nanos: nanos,
					size: entry.size,
					digest: entry.digest.clone(),
				}
			})
			.collect();
		entries.sort_by(|a, b| a.path.cmp(&b.path));
		WireCache { entries }
	}
}

impl TryFrom<&WireCache> for Cache {
	type Error = WireError;

	fn try_from(wire: &WireCache) -> Result<Cache, WireError> {
		let mut cache = Cache::new();
		for entry in &wire.entries {
			if entry.path.is_empty() && wire.entries.len() > 1 {
				return Err(WireError::Invalid("empty non-root path in cache".into()));
			}
			cache.insert(
				entry.path.clone(),
				CacheEntry {
					directory: entry.directory,
					mode: entry.mode,
					modification_time: join_system_time(
						entry.modification_time_seconds,
						entry.modification_time_nanos,
					),
					size: entry.size,
					digest: entry.digest.clone(),
				},
			);
		}
		Ok(cache)
	}
}

fn split_system_time(time: SystemTime) -> (i64, u32) {
	match time.duration_since(UNIX_EPOCH) {
		Ok(duration) => (duration.as_secs() as i64, duration.subsec_nanos()),
		Err(e) => {
			let duration = e.duration();
			(-(duration.as_secs() as i64), duration.subsec_nanos())
		}
	}
}

fn join_system_time(seconds: i64, nanos: u32) -> SystemTime {
	if seconds >= 0 {
		UNIX_EPOCH + Duration::new(seconds as u64, nanos)
	} else {
		UNIX_EPOCH - Duration::new((-seconds) as u64, 0) + Duration::from_nanos(nanos as u64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(digest: &[u8]) -> CacheEntry {
		CacheEntry {
			directory: false,
			mode: 0o644,
			modification_time: UNIX_EPOCH + Duration::new(1_700_000_000, 500),
			size: digest.len() as u64,
			digest: digest.to_vec(),
		}
	}

	#[test]
	fn test_metadata_match() {
		let e = entry(b"abc");
		assert!(e.matches(0o644, e.modification_time, 3));
		assert!(!e.matches(0o755, e.modification_time, 3));
		assert!(!e.matches(0o644, UNIX_EPOCH, 3));
		assert!(!e.matches(0o644, e.modification_time, 4));
	}

	#[test]
	fn test_reverse_lookup_prefers_first_path() {
		let mut cache = Cache::new();
		cache.insert("z.txt".into(), entry(b"same"));
		cache.insert("a.txt".into(), entry(b"same"));
		cache.insert("dir".into(), CacheEntry {
			directory: true,
			mode: 0o755,
			modification_time: UNIX_EPOCH,
			size: 0,
			digest: vec![],
		});
		let reverse = cache.generate_reverse_lookup();
		assert_eq!(reverse.get(b"same".as_slice()), Some(&"a.txt".to_string()));
		assert_eq!(reverse.len(), 1);
	}

	#[test]
	fn test_persistence_round_trip() {
		let dir = tempfile::TempDir::new().unwrap();
		let path = dir.path().join("cache");
		let mut cache = Cache::new();
		cache.insert("file.txt".into(), entry(b"contents"));
		cache.insert("sub".into(), CacheEntry {
			directory: true,
			mode: 0o755,
			modification_time: UNIX_EPOCH + Duration::from_secs(123),
			size: 0,
			digest: vec![],
		});
		cache.save(&path).unwrap();
		let loaded = Cache::load(&path).unwrap();
		assert_eq!(loaded, cache);
	}

	#[test]
	fn test_load_missing_is_empty() {
		let dir = tempfile::TempDir::new().unwrap();
		assert!(Cache::load(&dir.path().join("nope")).unwrap().is_empty());
	}
}

// vim: ts=4
