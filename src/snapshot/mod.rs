//! Core filesystem snapshot model
//!
//! Entries form an immutable tree describing the content of a synchronization
//! root at a point in time. Snapshots wrap an optional root entry together
//! with filesystem behavior flags and aggregate counters.

use std::collections::BTreeMap;

use serde::ser::{Serialize, SerializeStruct, Serializer};

pub mod reify;
pub mod wire;

/// A single node in a snapshot tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
	/// Regular file content, identified by digest.
	File { digest: Vec<u8>, executable: bool },

	/// Symbolic link with its literal target.
	SymbolicLink { target: String },

	/// Directory with named children.
	Directory { contents: BTreeMap<String, Entry> },

	/// Recognized but unsynchronizable content (sockets, devices, ...).
	Untracked,

	/// Placeholder for content that could not be read or is invalid.
	Problematic { problem: String },

	/// Transient directory stand-in used while grafting subtrees during
	/// transitions. Must be reified to `Directory` before exposure.
	PhantomDirectory { contents: BTreeMap<String, Entry> },
}

/// How to copy an entry tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyMode {
	/// Clone the whole subtree into disjoint storage.
	Deep,

	/// Reuse the immutable subtree without cloning.
	ShallowShare,
}

/// Error produced when a snapshot or entry violates a structural invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSnapshot {
	pub message: String,
}

impl std::fmt::Display for InvalidSnapshot {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "invalid snapshot: {}", self.message)
	}
}

impl std::error::Error for InvalidSnapshot {}

fn invalid(message: impl Into<String>) -> InvalidSnapshot {
	InvalidSnapshot { message: message.into() }
}

/// Check that a child name is acceptable inside a directory.
pub fn valid_name(name: &str) -> bool {
	!name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

impl Entry {
	/// Validate the entry subtree against the structural invariants.
	///
	/// `allow_phantoms` permits `PhantomDirectory` nodes; snapshots exposed
	/// outside a transition must not contain them.
	pub fn ensure_valid(&self, allow_phantoms: bool) -> Result<(), InvalidSnapshot> {
		match self {
			Entry::File { digest, .. } => {
				if digest.is_empty() {
					return Err(invalid("file entry with empty digest"));
				}
			}
			Entry::SymbolicLink { target } => {
				if target.is_empty() {
					return Err(invalid("symbolic link entry with empty target"));
				}
			}
			Entry::Directory { contents } => {
				for (name, child) in contents {
					if !valid_name(name) {
						return Err(invalid(format!("invalid child name: {:?}", name)));
					}
					child.ensure_valid(allow_phantoms)?;
				}
			}
			Entry::Untracked => {}
			Entry::Problematic { problem } => {
				if problem.is_empty() {
					return Err(invalid("problematic entry with empty problem"));
				}
			}
			Entry::PhantomDirectory { contents } => {
				if !allow_phantoms {
					return Err(invalid("phantom directory in exposed snapshot"));
				}
				for (name, child) in contents {
					if !valid_name(name) {
						return Err(invalid(format!("invalid child name: {:?}", name)));
					}
					child.ensure_valid(allow_phantoms)?;
				}
			}
		}
		Ok(())
	}

	/// Total number of entries in the subtree, including this one.
	pub fn count(&self) -> u64 {
		match self {
			Entry::Directory { contents } | Entry::PhantomDirectory { contents } => {
				1 + contents.values().map(Entry::count).sum::<u64>()
			}
			_ => 1,
		}
	}

	/// Directory contents, if this entry is a directory or phantom directory.
	pub fn contents(&self) -> Option<&BTreeMap<String, Entry>> {
		match self {
			Entry::Directory { contents } | Entry::PhantomDirectory { contents } => Some(contents),
			_ => None,
		}
	}

	/// Whether the subtree consists solely of synchronizable content.
	///
	/// Untracked and problematic entries are unsynchronizable and must never
	/// propagate to the other endpoint.
	pub fn synchronizable(&self) -> bool {
		match self {
			Entry::Untracked | Entry::Problematic { .. } => false,
			Entry::Directory { contents } | Entry::PhantomDirectory { contents } => {
				contents.values().all(Entry::synchronizable)
			}
			_ => true,
		}
	}

	/// Copy the subtree. `Deep` clones every node into disjoint storage;
	/// `ShallowShare` borrows the immutable subtree, which is safe because
	/// entry trees are never mutated once constructed.
	pub fn copy(&self, mode: CopyMode) -> std::borrow::Cow<'_, Entry> {
		match mode {
			CopyMode::Deep => std::borrow::Cow::Owned(self.clone()),
			CopyMode::ShallowShare => std::borrow::Cow::Borrowed(self),
		}
	}

	/// Look up a descendant by slash-separated relative path. An empty path
	/// returns the entry itself.
	pub fn find(&self, path: &str) -> Option<&Entry> {
		if path.is_empty() {
			return Some(self);
		}
		let mut current = self;
		for component in path.split('/') {
			current = current.contents()?.get(component)?;
		}
		Some(current)
	}
}

/// Compact serialization for session status reporting: a kind tag plus the
/// kind's payload, with digests rendered as hex.
impl Serialize for Entry {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		let mut state = serializer.serialize_struct("Entry", 2)?;
		match self {
			Entry::File { digest, executable } => {
				state.serialize_field("kind", "F")?;
				state.serialize_field("digest", &hex::encode(digest))?;
				if *executable {
					state.serialize_field("executable", executable)?;
				}
			}
			Entry::SymbolicLink { target } => {
				state.serialize_field("kind", "L")?;
				state.serialize_field("target", target)?;
			}
			Entry::Directory { contents } | Entry::PhantomDirectory { contents } => {
				state.serialize_field("kind", "D")?;
				state.serialize_field("contents", contents)?;
			}
			Entry::Untracked => {
				state.serialize_field("kind", "U")?;
			}
			Entry::Problematic { problem } => {
				state.serialize_field("kind", "P")?;
				state.serialize_field("problem", problem)?;
			}
		}
		state.end()
	}
}

/// Structural equality over optional entries.
pub fn entries_equal(a: Option<&Entry>, b: Option<&Entry>) -> bool {
	match (a, b) {
		(None, None) => true,
		(Some(a), Some(b)) => a == b,
		_ => false,
	}
}

/// An immutable record of a filesystem root at a point in time.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Snapshot {
	/// Root content; `None` represents "nothing at the path".
	pub content: Option<Entry>,

	/// Whether the scanned filesystem preserves the executable bit.
	pub preserves_executability: bool,

	/// Whether the scanned filesystem decomposes Unicode names.
	pub decomposes_unicode: bool,

	/// Number of directory entries in the tree.
	pub directories: u64,

	/// Number of file entries in the tree.
	pub files: u64,

	/// Number of symbolic link entries in the tree.
	pub symbolic_links: u64,

	/// Sum of all file sizes in bytes.
	pub total_file_size: u64,
}

impl Snapshot {
	/// Validate the snapshot structure.
	pub fn ensure_valid(&self) -> Result<(), InvalidSnapshot> {
		if let Some(content) = &self.content {
			content.ensure_valid(false)?;
		}
		Ok(())
	}

	/// Whether the snapshot records no content at all.
	pub fn is_empty(&self) -> bool {
		self.content.is_none()
	}
}

/// A single divergence or applied modification at a path.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Change {
	/// Slash-separated path relative to the synchronization root. The root
	/// itself is the empty path.
	pub path: String,

	/// Content expected at the path before the change.
	pub old: Option<Entry>,

	/// Content required at the path after the change.
	pub new: Option<Entry>,
}

impl Change {
	pub fn new(path: impl Into<String>, old: Option<Entry>, new: Option<Entry>) -> Self {
		Change { path: path.into(), old, new }
	}

	/// Whether applying the change removes content without creating any.
	pub fn is_removal(&self) -> bool {
		self.old.is_some() && self.new.is_none()
	}
}

/// A pair of mutually exclusive change sets, one per endpoint.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Conflict {
	pub alpha_changes: Vec<Change>,
	pub beta_changes: Vec<Change>,
}

/// A path-scoped failure reported alongside transition results.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Problem {
	pub path: String,
	pub error: String,
}

impl Problem {
	pub fn new(path: impl Into<String>, error: impl Into<String>) -> Self {
		Problem { path: path.into(), error: error.into() }
	}
}

impl std::fmt::Display for Problem {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.path.is_empty() {
			write!(f, "{}", self.error)
		} else {
			write!(f, "{}: {}", self.path, self.error)
		}
	}
}

/// Apply a list of changes to an entry tree, returning the updated tree.
///
/// Changes are applied in order; missing intermediate directories are
/// created empty so a shallow parent change can precede its children.
pub fn apply_changes(
	base: Option<Entry>,
	changes: &[Change],
) -> Result<Option<Entry>, InvalidSnapshot> {
	let mut root = base;
	for change in changes {
		if change.path.is_empty() {
			root = change.new.clone();
			continue;
		}
		let current = match root {
			Some(Entry::Directory { .. }) | Some(Entry::PhantomDirectory { .. }) => {
				root.as_mut().unwrap()
			}
			None => {
				root = Some(Entry::Directory { contents: BTreeMap::new() });
				root.as_mut().unwrap()
			}
			Some(_) => {
				return Err(InvalidSnapshot {
					message: format!("change path {:?} crosses a non-directory root", change.path),
				})
			}
		};
		let components: Vec<&str> = change.path.split('/').collect();
		apply_change_at(current, &components, &change.new, &change.path)?;
	}
	Ok(root)
}

/// Descend through `components` starting at `current`, inserting or removing
/// the leaf per `new`. Recursion (rather than a loop that reassigns a `&mut
/// Entry` in place) keeps each mutable borrow scoped to its own call frame.
fn apply_change_at(
	current: &mut Entry,
	components: &[&str],
	new: &Option<Entry>,
	change_path: &str,
) -> Result<(), InvalidSnapshot> {
	let (component, rest) = match components.split_first() {
		Some(pair) => pair,
		None => return Ok(()),
	};
	if !valid_name(component) {
		return Err(InvalidSnapshot {
			message: format!("invalid change path: {:?}", change_path),
		});
	}
	let last = rest.is_empty();
	let contents = match current {
		Entry::Directory { contents } | Entry::PhantomDirectory { contents } => contents,
		_ => {
			return Err(InvalidSnapshot {
				message: format!("change path {:?} crosses a non-directory", change_path),
			})
		}
	};
	if last {
		match new {
			Some(new) => {
				contents.insert(component.to_string(), new.clone());
			}
			None => {
				contents.remove(*component);
			}
		}
		Ok(())
	} else {
		let next = contents
			.entry(component.to_string())
			.or_insert_with(|| Entry::Directory { contents: BTreeMap::new() });
		apply_change_at(next, rest, new, change_path)
	}
}

/// Join a parent path and child name into a slash-separated path.
pub fn join_path(parent: &str, name: &str) -> String {
	if parent.is_empty() {
		name.to_string()
	} else {
		format!("{}/{}", parent, name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn file(content: &[u8]) -> Entry {
		use sha2::{Digest, Sha256};
		Entry::File { digest: Sha256::digest(content).to_vec(), executable: false }
	}

	fn dir(children: Vec<(&str, Entry)>) -> Entry {
		Entry::Directory {
			contents: children.into_iter().map(|(n, e)| (n.to_string(), e)).collect(),
		}
	}

	#[test]
	fn test_valid_names() {
		assert!(valid_name("file.txt"));
		assert!(valid_name("üñíçødé"));
		assert!(!valid_name(""));
		assert!(!valid_name("."));
		assert!(!valid_name(".."));
		assert!(!valid_name("a/b"));
	}

	#[test]
	fn test_file_requires_digest() {
		let entry = Entry::File { digest: vec![], executable: false };
		assert!(entry.ensure_valid(false).is_err());
	}

	#[test]
	fn test_symlink_requires_target() {
		let entry = Entry::SymbolicLink { target: String::new() };
		assert!(entry.ensure_valid(false).is_err());
		let entry = Entry::SymbolicLink { target: "target".to_string() };
		assert!(entry.ensure_valid(false).is_ok());
	}

	#[test]
	fn test_problematic_requires_problem() {
		let entry = Entry::Problematic { problem: String::new() };
		assert!(entry.ensure_valid(false).is_err());
	}

	#[test]
	fn test_directory_rejects_invalid_child_names() {
		let entry = dir(vec![("..", Entry::Untracked)]);
		assert!(entry.ensure_valid(false).is_err());
	}

	#[test]
	fn test_phantom_rejected_when_exposed() {
		let entry = Entry::PhantomDirectory { contents: BTreeMap::new() };
		assert!(entry.ensure_valid(true).is_ok());
		assert!(entry.ensure_valid(false).is_err());
	}

	#[test]
	fn test_count_includes_root() {
		let tree = dir(vec![
			("a", file(b"a")),
			("sub", dir(vec![("b", file(b"b")), ("link", Entry::SymbolicLink { target: "a".into() })])),
		]);
		assert_eq!(tree.count(), 5);
		assert_eq!(file(b"x").count(), 1);
	}

	#[test]
	fn test_deep_copy_is_equal_and_disjoint() {
		let original = dir(vec![("a", file(b"alpha")), ("d", dir(vec![("b", file(b"beta"))]))]);
		let copy = original.copy(CopyMode::Deep).into_owned();
		assert_eq!(original, copy);
		// Mutating the copy must not affect the original.
		let mut copy = copy;
		if let Entry::Directory { contents } = &mut copy {
			contents.remove("a");
		}
		assert_ne!(original, copy);
		assert_eq!(original.count(), 4);
	}

	#[test]
	fn test_shallow_share_borrows() {
		let original = dir(vec![("a", file(b"alpha"))]);
		let shared = original.copy(CopyMode::ShallowShare);
		assert!(matches!(shared, std::borrow::Cow::Borrowed(_)));
		assert_eq!(shared.as_ref(), &original);
	}

	#[test]
	fn test_directory_equality_ignores_insertion_order() {
		let mut first = BTreeMap::new();
		first.insert("a".to_string(), file(b"1"));
		first.insert("b".to_string(), file(b"2"));
		let mut second = BTreeMap::new();
		second.insert("b".to_string(), file(b"2"));
		second.insert("a".to_string(), file(b"1"));
		assert_eq!(Entry::Directory { contents: first }, Entry::Directory { contents: second });
	}

	#[test]
	fn test_synchronizable() {
		assert!(file(b"ok").synchronizable());
		assert!(!Entry::Untracked.synchronizable());
		assert!(!dir(vec![("bad", Entry::Problematic { problem: "unreadable".into() })])
			.synchronizable());
	}

	#[test]
	fn test_find() {
		let tree = dir(vec![("sub", dir(vec![("f", file(b"f"))]))]);
		assert!(tree.find("sub/f").is_some());
		assert!(tree.find("sub/missing").is_none());
		assert_eq!(tree.find(""), Some(&tree));
	}

	#[test]
	fn test_join_path() {
		assert_eq!(join_path("", "a"), "a");
		assert_eq!(join_path("a", "b"), "a/b");
	}

	#[test]
	fn test_apply_changes() {
		let base = dir(vec![("old.txt", file(b"old"))]);
		let changes = vec![
			Change::new("old.txt", Some(file(b"old")), None),
			Change::new("sub", None, Some(dir(vec![]))),
			Change::new("sub/new.txt", None, Some(file(b"new"))),
		];
		let result = apply_changes(Some(base), &changes).unwrap().unwrap();
		assert!(result.find("old.txt").is_none());
		assert_eq!(result.find("sub/new.txt"), Some(&file(b"new")));
	}

	#[test]
	fn test_apply_changes_creates_intermediates() {
		let changes = vec![Change::new("a/b/c.txt", None, Some(file(b"c")))];
		let result = apply_changes(None, &changes).unwrap().unwrap();
		assert_eq!(result.find("a/b/c.txt"), Some(&file(b"c")));
	}

	#[test]
	fn test_apply_changes_root_replacement() {
		let changes = vec![Change::new("", None, Some(file(b"root")))];
		let result = apply_changes(None, &changes).unwrap();
		assert_eq!(result, Some(file(b"root")));
	}

	#[test]
	fn test_status_serialization_shape() {
		let conflict = Conflict {
			alpha_changes: vec![Change::new("f", None, Some(file(b"B")))],
			beta_changes: vec![Change::new("f", None, Some(Entry::Untracked))],
		};
		let rendered = serde_json::to_value(&conflict).unwrap();
		assert_eq!(rendered["alpha_changes"][0]["path"], "f");
		assert_eq!(rendered["alpha_changes"][0]["new"]["kind"], "F");
		assert_eq!(rendered["beta_changes"][0]["new"]["kind"], "U");
		assert!(rendered["alpha_changes"][0]["new"]["digest"].is_string());
	}
}

// vim: ts=4
