//! Wire and on-disk form of snapshots
//!
//! Snapshots are serialized as Protocol Buffers messages with a fixed field
//! layout. Directory contents are flattened into name-sorted child lists so
//! that encoding is deterministic and identical trees always produce
//! identical bytes, which the differential scan transport depends on.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use prost::Message;

use super::{valid_name, Entry, Snapshot};

/// Entry kind discriminator on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EntryKind {
	Directory = 0,
	File = 1,
	SymbolicLink = 2,
	Untracked = 3,
	Problematic = 4,
	PhantomDirectory = 5,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireEntry {
	#[prost(enumeration = "EntryKind", tag = "1")]
	pub kind: i32,

	/// Children sorted by name. Only meaningful for directory kinds.
	#[prost(message, repeated, tag = "2")]
	pub contents: Vec<WireNamedEntry>,

	#[prost(bytes = "vec", tag = "3")]
	pub digest: Vec<u8>,

	#[prost(bool, tag = "4")]
	pub executable: bool,

	#[prost(string, tag = "5")]
	pub target: String,

	#[prost(string, tag = "6")]
	pub problem: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireNamedEntry {
	#[prost(string, tag = "1")]
	pub name: String,

	#[prost(message, optional, tag = "2")]
	pub entry: Option<WireEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireSnapshot {
	#[prost(message, optional, tag = "1")]
	pub content: Option<WireEntry>,

	#[prost(bool, tag = "2")]
	pub preserves_executability: bool,

	#[prost(bool, tag = "3")]
	pub decomposes_unicode: bool,

	#[prost(uint64, tag = "4")]
	pub directories: u64,

	#[prost(uint64, tag = "5")]
	pub files: u64,

	#[prost(uint64, tag = "6")]
	pub symbolic_links: u64,

	#[prost(uint64, tag = "7")]
	pub total_file_size: u64,
}

/// Error decoding a wire snapshot or cache.
#[derive(Debug)]
pub enum WireError {
	/// Malformed Protocol Buffers payload.
	Decode(prost::DecodeError),

	/// Well-formed payload describing an invalid structure.
	Invalid(String),

	/// Filesystem error while persisting or loading.
	Io(std::io::Error),
}

impl std::fmt::Display for WireError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			WireError::Decode(e) => write!(f, "malformed message: {}", e),
			WireError::Invalid(message) => write!(f, "invalid content: {}", message),
			WireError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl std::error::Error for WireError {}

impl From<prost::DecodeError> for WireError {
	fn from(e: prost::DecodeError) -> Self {
		WireError::Decode(e)
	}
}

impl From<std::io::Error> for WireError {
	fn from(e: std::io::Error) -> Self {
		WireError::Io(e)
	}
}

impl From<&Entry> for WireEntry {
	fn from(entry: &Entry) -> Self {
		let mut wire = WireEntry {
			kind: EntryKind::Directory as i32,
			contents: Vec::new(),
			digest: Vec::new(),
			executable: false,
			target: String::new(),
			problem: String::new(),
		};
		match entry {
			Entry::File { digest, executable } => {
				wire.kind = EntryKind::File as i32;
				wire.digest = digest.clone();
				wire.executable = *executable;
			}
			Entry::SymbolicLink { target } => {
				wire.kind = EntryKind::SymbolicLink as i32;
				wire.target = target.clone();
			}
			Entry::Directory { contents } => {
				wire.kind = EntryKind::Directory as i32;
				wire.contents = named_entries(contents);
			}
			Entry::Untracked => {
				wire.kind = EntryKind::Untracked as i32;
			}
			Entry::Problematic { problem } => {
				wire.kind = EntryKind::Problematic as i32;
				wire.problem = problem.clone();
			}
			Entry::PhantomDirectory { contents } => {
				wire.kind = EntryKind::PhantomDirectory as i32;
				wire.contents = named_entries(contents);
			}
		}
		wire
	}
}

fn named_entries(contents: &BTreeMap<String, Entry>) -> Vec<WireNamedEntry> {
	// BTreeMap iteration is already name-sorted, which keeps encoding
	// deterministic.
	contents
		.iter()
		.map(|(name, entry)| WireNamedEntry { name: name.clone(), entry: Some(entry.into()) })
		.collect()
}

impl TryFrom<&WireEntry> for Entry {
	type Error = WireError;

	fn try_from(wire: &WireEntry) -> Result<Entry, WireError> {
		let kind = EntryKind::try_from(wire.kind)
			.map_err(|_| WireError::Invalid(format!("unknown entry kind: {}", wire.kind)))?;
		match kind {
			EntryKind::File => {
				if wire.digest.is_empty() {
					return Err(WireError::Invalid("file entry with empty digest".into()));
				}
				Ok(Entry::File { digest: wire.digest.clone(), executable: wire.executable })
			}
			EntryKind::SymbolicLink => {
				if wire.target.is_empty() {
					return Err(WireError::Invalid("symbolic link with empty target".into()));
				}
				Ok(Entry::SymbolicLink { target: wire.target.clone() })
			}
			EntryKind::Directory => {
				Ok(Entry::Directory { contents: decode_contents(&wire.contents)? })
			}
			EntryKind::Untracked => Ok(Entry::Untracked),
			EntryKind::Problematic => {
				if wire.problem.is_empty() {
					return Err(WireError::Invalid("problematic entry with empty problem".into()));
				}
				Ok(Entry::Problematic { problem: wire.problem.clone() })
			}
			EntryKind::PhantomDirectory => {
				Ok(Entry::PhantomDirectory { contents: decode_contents(&wire.contents)? })
			}
		}
	}
}

fn decode_contents(wire: &[WireNamedEntry]) -> Result<BTreeMap<String, Entry>, WireError> {
	let mut contents = BTreeMap::new();
	for named in wire {
		if !valid_name(&named.name) {
			return Err(WireError::Invalid(format!("invalid child name: {:?}", named.name)));
		}
		let entry = named
			.entry
			.as_ref()
			.ok_or_else(|| WireError::Invalid(format!("missing entry for child {:?}", named.name)))?;
		if contents.insert(named.name.clone(), Entry::try_from(entry)?).is_some() {
			return Err(WireError::Invalid(format!("duplicate child name: {:?}", named.name)));
		}
	}
	Ok(contents)
}

impl From<&Snapshot> for WireSnapshot {
	fn from(snapshot: &Snapshot) -> Self {
		WireSnapshot {
			content: snapshot.content.as_ref().map(WireEntry::from),
			preserves_executability: snapshot.preserves_executability,
			decomposes_unicode: snapshot.decomposes_unicode,
			directories: snapshot.directories,
			files: snapshot.files,
			symbolic_links: snapshot.symbolic_links,
			total_file_size: snapshot.total_file_size,
		}
	}
}

impl TryFrom<&WireSnapshot> for Snapshot {
	type Error = WireError;

	fn try_from(wire: &WireSnapshot) -> Result<Snapshot, WireError> {
		let content = match &wire.content {
			Some(entry) => Some(Entry::try_from(entry)?),
			None => None,
		};
		let snapshot = Snapshot {
			content,
			preserves_executability: wire.preserves_executability,
			decomposes_unicode: wire.decomposes_unicode,
			directories: wire.directories,
			files: wire.files,
			symbolic_links: wire.symbolic_links,
			total_file_size: wire.total_file_size,
		};
		snapshot.ensure_valid().map_err(|e| WireError::Invalid(e.message))?;
		Ok(snapshot)
	}
}

/// Serialize a snapshot deterministically.
pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
	WireSnapshot::from(snapshot).encode_to_vec()
}

/// Decode and validate a serialized snapshot.
pub fn decode_snapshot(data: &[u8]) -> Result<Snapshot, WireError> {
	let wire = WireSnapshot::decode(data)?;
	Snapshot::try_from(&wire)
}

/// Write a serialized blob atomically (temp-then-rename) with mode 0600.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
	let mut temp = path.as_os_str().to_os_string();
	temp.push(".tmp");
	let temp = Path::new(&temp);
	{
		let mut options = fs::OpenOptions::new();
		options.write(true).create(true).truncate(true);
		#[cfg(unix)]
		{
			use std::os::unix::fs::OpenOptionsExt;
			options.mode(0o600);
		}
		let mut file = options.open(temp)?;
		file.write_all(data)?;
		file.sync_all()?;
	}
	fs::rename(temp, path)
}

/// Persist a snapshot checkpoint atomically.
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), WireError> {
	write_atomic(path, &encode_snapshot(snapshot))?;
	Ok(())
}

/// Load a snapshot checkpoint. A missing file yields an empty snapshot.
pub fn load_snapshot(path: &Path) -> Result<Snapshot, WireError> {
	match fs::read(path) {
		Ok(data) => decode_snapshot(&data),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::default()),
		Err(e) => Err(WireError::Io(e)),
	}
}


// vim: ts=4
