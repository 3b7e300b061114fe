//! Content staging
//!
//! Files arrive as rsync deltas and are reconstituted into a
//! content-addressed staging directory, keyed by digest. Staged content
//! becomes visible atomically (temp-then-rename, after fsync); a crashed
//! staging run leaves orphan temp files that are collected on the next open.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::hash::{Algorithm, Hasher, UnsupportedAlgorithm};
use crate::logging::*;
use crate::rsync::transmit::{ReceiveError, Receiver};
use crate::rsync::{Engine, Operation, Signature};

/// Suffix marking in-progress staging output.
const TEMPORARY_SUFFIX: &str = ".tmp";

/// Error raised by staging coordination.
#[derive(Debug)]
pub enum StageError {
	Io(io::Error),
	UnsupportedAlgorithm(UnsupportedAlgorithm),

	/// Request had mismatched path and digest list lengths.
	MismatchedRequest { paths: usize, digests: usize },
}

impl std::fmt::Display for StageError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			StageError::Io(e) => write!(f, "staging I/O failed: {}", e),
			StageError::UnsupportedAlgorithm(e) => write!(f, "{}", e),
			StageError::MismatchedRequest { paths, digests } => {
				write!(f, "staging request with {} paths but {} digests", paths, digests)
			}
		}
	}
}

impl std::error::Error for StageError {}

impl From<io::Error> for StageError {
	fn from(e: io::Error) -> Self {
		StageError::Io(e)
	}
}

impl From<UnsupportedAlgorithm> for StageError {
	fn from(e: UnsupportedAlgorithm) -> Self {
		StageError::UnsupportedAlgorithm(e)
	}
}

/// Content-addressed staging directory.
#[derive(Clone)]
pub struct Stager {
	root: PathBuf,
	algorithm: Algorithm,

	/// Digests currently being built; at most one writer per digest.
	in_flight: Arc<Mutex<HashSet<Vec<u8>>>>,
}

impl Stager {
	/// Open (creating if necessary) a staging directory and collect orphan
	/// temporary files left by a crashed run.
	pub fn open(root: PathBuf, algorithm: Algorithm) -> Result<Stager, StageError> {
		fs::create_dir_all(&root)?;
		for entry in fs::read_dir(&root)? {
			let entry = entry?;
			if entry.file_name().to_string_lossy().ends_with(TEMPORARY_SUFFIX) {
				debug!(path = %entry.path().display(), "removing orphaned staging temporary");
				let _ = fs::remove_file(entry.path());
			}
		}
		Ok(Stager { root, algorithm, in_flight: Arc::new(Mutex::new(HashSet::new())) })
	}

	pub fn algorithm(&self) -> Algorithm {
		self.algorithm
	}

	/// Final path for a digest's staged content.
	pub fn path_for(&self, digest: &[u8]) -> PathBuf {
		self.root.join(URL_SAFE_NO_PAD.encode(digest))
	}

	fn temporary_path_for(&self, digest: &[u8]) -> PathBuf {
		self.root.join(format!("{}{}", URL_SAFE_NO_PAD.encode(digest), TEMPORARY_SUFFIX))
	}

	/// Whether content for a digest is already staged.
	pub fn contains(&self, digest: &[u8]) -> bool {
		self.path_for(digest).is_file()
	}

	/// Path to staged content, if present.
	pub fn provide(&self, digest: &[u8]) -> Option<PathBuf> {
		let path = self.path_for(digest);
		path.is_file().then_some(path)
	}

	/// Stage content by copying an existing local file with identical
	/// content, verifying the digest along the way.
	pub fn stage_from_local(&self, source: &Path, digest: &[u8]) -> Result<bool, StageError> {
		if self.contains(digest) {
			return Ok(true);
		}
		if !self.begin_build(digest) {
			return Ok(false);
		}
		let result = self.copy_verified(source, digest);
		self.end_build(digest);
		result
	}

	fn copy_verified(&self, source: &Path, digest: &[u8]) -> Result<bool, StageError> {
		let mut hasher = self.algorithm.hasher()?;
		let temp = self.temporary_path_for(digest);
		let mut reader = fs::File::open(source)?;
		let mut writer = fs::File::create(&temp)?;
		let mut buffer = vec![0u8; 64 * 1024];
		loop {
			let read = reader.read(&mut buffer)?;
			if read == 0 {
				break;
			}
			hasher.update(&buffer[..read]);
			writer.write_all(&buffer[..read])?;
		}
		if hasher.finish() != digest {
			drop(writer);
			let _ = fs::remove_file(&temp);
			return Ok(false);
		}
		writer.sync_all()?;
		drop(writer);
		fs::rename(&temp, self.path_for(digest))?;
		Ok(true)
	}

	fn begin_build(&self, digest: &[u8]) -> bool {
		self.in_flight.lock().unwrap().insert(digest.to_vec())
	}

	fn end_build(&self, digest: &[u8]) {
		self.in_flight.lock().unwrap().remove(digest);
	}

	/// Remove all staged content, e.g. on session teardown.
	pub fn wipe(&self) -> Result<(), StageError> {
		for entry in fs::read_dir(&self.root)? {
			let entry = entry?;
			let _ = fs::remove_file(entry.path());
		}
		Ok(())
	}
}

/// The transfer plan computed from a staging request: the subset of paths
/// that still need content, with per-path base signatures for delta
/// computation against reusable on-disk content.
pub struct StagingPlan {
	pub paths: Vec<String>,
	pub digests: Vec<Vec<u8>>,
	pub signatures: Vec<Signature>,

	/// Base bytes per path, aligned with `signatures`.
	bases: Vec<Vec<u8>>,
}

impl StagingPlan {
	pub fn is_empty(&self) -> bool {
		self.paths.is_empty()
	}
}

/// Filter a staging request against staged and locally reusable content.
///
/// For each requested `(path, digest)` this dedups against already-staged
/// entries and against identical content elsewhere in the root (via the
/// cache's reverse-lookup map), and computes the base signature for the
/// remainder: the current content at the path when present, otherwise empty.
pub fn plan_staging(
	stager: &Stager,
	root: &Path,
	engine: &Engine,
	paths: &[String],
	digests: &[Vec<u8>],
	reverse_lookup: &std::collections::HashMap<Vec<u8>, String>,
) -> Result<StagingPlan, StageError> {
	if paths.len() != digests.len() {
		return Err(StageError::MismatchedRequest { paths: paths.len(), digests: digests.len() });
	}

	let mut plan = StagingPlan {
		paths: Vec::new(),
		digests: Vec::new(),
		signatures: Vec::new(),
		bases: Vec::new(),
	};
	let mut planned: HashSet<&[u8]> = HashSet::new();

	for (path, digest) in paths.iter().zip(digests) {
		if stager.contains(digest) || !planned.insert(digest.as_slice()) {
			continue;
		}
		// Identical content already on disk at another path stages locally
		// without any transfer.
		if let Some(existing) = reverse_lookup.get(digest) {
			if existing != path && stager.stage_from_local(&root.join(existing), digest)? {
				trace!(path, source = %existing, "staged from local duplicate");
				continue;
			}
		}

		let base = match fs::read(root.join(path)) {
			Ok(contents) => contents,
			Err(_) => Vec::new(),
		};
		let signature = engine
			.signature(&base, 0)
			.map_err(|e| StageError::Io(io::Error::other(e.to_string())))?;

		plan.paths.push(path.clone());
		plan.digests.push(digest.clone());
		plan.signatures.push(signature);
		plan.bases.push(base);
	}

	Ok(plan)
}

struct OpenBuild {
	index: usize,
	digest: Vec<u8>,
	temporary: PathBuf,
	file: fs::File,
	hasher: Box<dyn Hasher>,
}

/// Receiver reconstituting staged files from streamed delta operations.
///
/// Operations for one path arrive consecutively; a change of path index
/// commits the previous build and `finalize` commits the last one. A build
/// whose content does not hash to the expected digest is discarded, leaving
/// the file unstaged for the next cycle to retry.
pub struct StagingReceiver {
	stager: Stager,
	engine: Engine,
	plan: StagingPlan,
	current: Option<OpenBuild>,
}

impl StagingReceiver {
	pub fn new(stager: Stager, engine: Engine, plan: StagingPlan) -> Self {
		StagingReceiver { stager, engine, plan, current: None }
	}

	fn open_build(&mut self, index: usize) -> Result<(), ReceiveError> {
		let digest = self.plan.digests[index].clone();
		if !self.stager.begin_build(&digest) {
			return Err(ReceiveError::Protocol {
				message: format!("digest already being staged: {}", hex::encode(&digest)),
			});
		}
		let temporary = self.stager.temporary_path_for(&digest);
		let file = fs::File::create(&temporary)?;
		let hasher = self
			.stager
			.algorithm
			.hasher()
			.map_err(|e| ReceiveError::Protocol { message: e.to_string() })?;
		self.current = Some(OpenBuild { index, digest, temporary, file, hasher });
		Ok(())
	}

	fn commit_build(&mut self) -> Result<(), ReceiveError> {
		let Some(build) = self.current.take() else {
			return Ok(());
		};
		self.stager.end_build(&build.digest);
		let OpenBuild { digest, temporary, file, hasher, .. } = build;
		let observed = hasher.finish();
		if observed != digest {
			warn!(
				expected = %hex::encode(&digest),
				observed = %hex::encode(&observed),
				"discarding staged content with mismatched digest"
			);
			drop(file);
			let _ = fs::remove_file(&temporary);
			return Ok(());
		}
		file.sync_all()?;
		drop(file);
		fs::rename(&temporary, self.stager.path_for(&digest))?;
		Ok(())
	}

	fn write(&mut self, data: &[u8]) -> Result<(), ReceiveError> {
		let build = self.current.as_mut().expect("write without open build");
		build.hasher.update(data);
		build.file.write_all(data)?;
		Ok(())
	}
}

impl Receiver for StagingReceiver {
	fn receive(&mut self, path_index: usize, operation: &Operation) -> Result<(), ReceiveError> {
		if path_index >= self.plan.paths.len() {
			return Err(ReceiveError::Protocol {
				message: format!("path index {} out of range", path_index),
			});
		}
		match &self.current {
			Some(build) if build.index == path_index => {}
			_ => {
				self.commit_build()?;
				self.open_build(path_index)?;
			}
		}

		match operation {
			Operation::Data(data) => self.write(data),
			Operation::Blocks { .. } => {
				let signature = self.plan.signatures[path_index].clone();
				let base = std::mem::take(&mut self.plan.bases[path_index]);
				let mut reconstructed = Vec::new();
				self.engine
					.apply(&mut reconstructed, &base, &signature, operation)
					.map_err(ReceiveError::Engine)?;
				self.plan.bases[path_index] = base;
				self.write(&reconstructed)
			}
		}
	}

	fn finalize(&mut self) -> Result<(), ReceiveError> {
		self.commit_build()
	}
}

impl Drop for StagingReceiver {
	fn drop(&mut self) {
		// Abandon any unfinished build; its temporary is collected on the
		// next open.
		if let Some(build) = self.current.take() {
			self.stager.end_build(&build.digest);
		}
	}
}


// vim: ts=4
