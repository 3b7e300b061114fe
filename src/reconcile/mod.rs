//! Three-way reconciliation
//!
//! Walks the union of the ancestor, alpha, and beta trees in sorted path
//! order, classifies each side's state against the ancestor, and produces
//! per-side change lists plus conflicts. Untracked and problematic content
//! never propagates; it survives on the side that produced it and blocks
//! changes that would overwrite it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::snapshot::{entries_equal, join_path, Change, Conflict, Entry};

/// Propagation policy for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SynchronizationMode {
	/// Propagate non-conflicting changes both ways; report conflicts.
	#[default]
	TwoWaySafe,

	/// Like `TwoWaySafe`, but alpha wins when both sides changed.
	TwoWayResolved,

	/// Propagate alpha to beta only; beta-side divergence conflicts, except
	/// creations in locations alpha does not occupy.
	OneWaySafe,

	/// Mirror alpha onto beta unconditionally.
	OneWayReplica,
}

impl SynchronizationMode {
	pub fn from_name(name: &str) -> Option<Self> {
		match name {
			"two-way-safe" => Some(Self::TwoWaySafe),
			"two-way-resolved" => Some(Self::TwoWayResolved),
			"one-way-safe" => Some(Self::OneWaySafe),
			"one-way-replica" => Some(Self::OneWayReplica),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::TwoWaySafe => "two-way-safe",
			Self::TwoWayResolved => "two-way-resolved",
			Self::OneWaySafe => "one-way-safe",
			Self::OneWayReplica => "one-way-replica",
		}
	}
}

/// Output of one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reconciliation {
	/// Updates to the ancestor where both sides already agree.
	pub ancestor_changes: Vec<Change>,

	/// Changes to apply on alpha.
	pub alpha_changes: Vec<Change>,

	/// Changes to apply on beta.
	pub beta_changes: Vec<Change>,

	pub conflicts: Vec<Conflict>,
}

/// Reconcile the three trees under the given mode.
pub fn reconcile(
	ancestor: Option<&Entry>,
	alpha: Option<&Entry>,
	beta: Option<&Entry>,
	mode: SynchronizationMode,
) -> Reconciliation {
	let mut reconciler = Reconciler { mode, result: Reconciliation::default() };
	reconciler.walk("", ancestor, alpha, beta);
	reconciler.result
}

struct Reconciler {
	mode: SynchronizationMode,
	result: Reconciliation,
}

impl Reconciler {
	fn walk(
		&mut self,
		path: &str,
		ancestor: Option<&Entry>,
		alpha: Option<&Entry>,
		beta: Option<&Entry>,
	) {
		// Agreement: both sides hold identical content. Record the ancestor
		// update (with unsynchronizable content stripped) and stop.
		if entries_equal(alpha, beta) {
			let agreed = alpha.and_then(reduced);
			if !entries_equal(ancestor, agreed.as_ref()) {
				self.result.ancestor_changes.push(Change::new(
					path,
					ancestor.cloned(),
					agreed,
				));
			}
			return;
		}

		// Both directories: the node itself agrees in kind, so align the
		// ancestor and recurse into the child union.
		if let (Some(Entry::Directory { contents: alpha_contents }), Some(Entry::Directory { contents: beta_contents })) =
			(alpha, beta)
		{
			if !matches!(ancestor, Some(Entry::Directory { .. })) {
				self.result.ancestor_changes.push(Change::new(
					path,
					ancestor.cloned(),
					Some(Entry::Directory { contents: BTreeMap::new() }),
				));
			}
			let ancestor_contents = ancestor.and_then(Entry::contents);
			for (name, anc_child, alpha_child, beta_child) in
				child_union(ancestor_contents, alpha_contents, beta_contents)
			{
				self.walk(&join_path(path, &name), anc_child, alpha_child, beta_child);
			}
			return;
		}

		// Node-level divergence.
		let alpha_delta = !entries_equal(ancestor, alpha);
		let beta_delta = !entries_equal(ancestor, beta);

		match self.mode {
			SynchronizationMode::TwoWaySafe => {
				if alpha_delta && !beta_delta {
					self.propagate(path, ancestor, alpha, beta, Side::Beta);
				} else if beta_delta && !alpha_delta {
					self.propagate(path, ancestor, beta, alpha, Side::Alpha);
				} else {
					self.conflict(path, ancestor, alpha, beta);
				}
			}
			SynchronizationMode::TwoWayResolved => {
				if alpha_delta && !beta_delta {
					self.propagate(path, ancestor, alpha, beta, Side::Beta);
				} else if beta_delta && !alpha_delta {
					self.propagate(path, ancestor, beta, alpha, Side::Alpha);
				} else {
					// Both changed: alpha wins.
					self.propagate(path, ancestor, alpha, beta, Side::Beta);
				}
			}
			SynchronizationMode::OneWaySafe => {
				if alpha_delta && !beta_delta {
					self.propagate(path, ancestor, alpha, beta, Side::Beta);
				} else if beta_delta && !alpha_delta {
					// Beta-only creations in locations alpha does not occupy
					// are tolerated; other divergence conflicts.
					if !(ancestor.is_none() && alpha.is_none() && beta.is_some()) {
						self.conflict(path, ancestor, alpha, beta);
					}
				} else {
					self.conflict(path, ancestor, alpha, beta);
				}
			}
			SynchronizationMode::OneWayReplica => {
				let replacement = alpha.and_then(reduced);
				if !entries_equal(replacement.as_ref(), beta) {
					self.result.beta_changes.push(Change::new(path, beta.cloned(), replacement));
				}
			}
		}
	}

	/// Propagate winner content onto the target side, unless unsynchronizable
	/// content on either side blocks it.
	fn propagate(
		&mut self,
		path: &str,
		ancestor: Option<&Entry>,
		winner: Option<&Entry>,
		loser: Option<&Entry>,
		target: Side,
	) {
		let winner_clean = winner.map(|e| e.synchronizable()).unwrap_or(true);
		let loser_clean = loser.map(|e| e.synchronizable()).unwrap_or(true);
		if !winner_clean || !loser_clean {
			match target {
				Side::Beta => self.conflict(path, ancestor, winner, loser),
				Side::Alpha => self.conflict(path, ancestor, loser, winner),
			}
			return;
		}
		let change = Change::new(path, loser.cloned(), winner.cloned());
		match target {
			Side::Alpha => self.result.alpha_changes.push(change),
			Side::Beta => self.result.beta_changes.push(change),
		}
	}

	fn conflict(
		&mut self,
		path: &str,
		ancestor: Option<&Entry>,
		alpha: Option<&Entry>,
		beta: Option<&Entry>,
	) {
		self.result.conflicts.push(Conflict {
			alpha_changes: vec![Change::new(path, ancestor.cloned(), alpha.cloned())],
			beta_changes: vec![Change::new(path, ancestor.cloned(), beta.cloned())],
		});
	}
}

enum Side {
	Alpha,
	Beta,
}

/// Strip unsynchronizable content from a subtree: untracked and problematic
/// entries disappear, recursively.
fn reduced(entry: &Entry) -> Option<Entry> {
	match entry {
		Entry::Untracked | Entry::Problematic { .. } => None,
		Entry::Directory { contents } | Entry::PhantomDirectory { contents } => {
			let reduced_contents: BTreeMap<String, Entry> = contents
				.iter()
				.filter_map(|(name, child)| reduced(child).map(|c| (name.clone(), c)))
				.collect();
			Some(Entry::Directory { contents: reduced_contents })
		}
		other => Some(other.clone()),
	}
}

/// Union of child names across the three trees, keyed by the NFC-normalized
/// form so sides that store decomposed names line up; the emitted name uses
/// the ancestor's recorded form when available.
fn child_union<'a>(
	ancestor: Option<&'a BTreeMap<String, Entry>>,
	alpha: &'a BTreeMap<String, Entry>,
	beta: &'a BTreeMap<String, Entry>,
) -> Vec<(String, Option<&'a Entry>, Option<&'a Entry>, Option<&'a Entry>)> {
	#[derive(Default)]
	struct Group<'a> {
		name: Option<String>,
		ancestor: Option<&'a Entry>,
		alpha: Option<&'a Entry>,
		beta: Option<&'a Entry>,
	}

	let mut union: BTreeMap<String, Group<'a>> = BTreeMap::new();
	if let Some(ancestor) = ancestor {
		for (name, entry) in ancestor {
			let group = union.entry(name.nfc().collect()).or_default();
			group.name = Some(name.clone());
			group.ancestor = Some(entry);
		}
	}
	for (name, entry) in alpha {
		let group = union.entry(name.nfc().collect()).or_default();
		group.name.get_or_insert_with(|| name.clone());
		group.alpha = Some(entry);
	}
	for (name, entry) in beta {
		let group = union.entry(name.nfc().collect()).or_default();
		group.name.get_or_insert_with(|| name.clone());
		group.beta = Some(entry);
	}

	union
		.into_values()
		.map(|group| {
			let name = group.name.expect("union group without a name");
			(name, group.ancestor, group.alpha, group.beta)
		})
		.collect()
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
	fn test_identical_sides_produce_no_changes() {
		let tree = dir(vec![("a", file(b"a")), ("sub", dir(vec![("b", file(b"b"))]))]);
		let result = reconcile(
			Some(&dir(vec![])),
			Some(&tree),
			Some(&tree),
			SynchronizationMode::TwoWaySafe,
		);
		assert!(result.alpha_changes.is_empty());
		assert!(result.beta_changes.is_empty());
		assert!(result.conflicts.is_empty());
		// The ancestor catches up to the agreed content.
		assert_eq!(result.ancestor_changes.len(), 1);
	}

	#[test]
	fn test_alpha_creation_propagates_to_beta() {
		let ancestor = dir(vec![]);
		let alpha = dir(vec![("new.txt", file(b"new"))]);
		let beta = dir(vec![]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWaySafe,
		);
		assert!(result.alpha_changes.is_empty());
		assert!(result.conflicts.is_empty());
		assert_eq!(result.beta_changes, vec![Change::new(
			"new.txt",
			None,
			Some(file(b"new")),
		)]);
	}

	#[test]
	fn test_both_modified_conflicts() {
		let ancestor = dir(vec![("f", file(b"A"))]);
		let alpha = dir(vec![("f", file(b"B"))]);
		let beta = dir(vec![("f", file(b"C"))]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWaySafe,
		);
		assert!(result.alpha_changes.is_empty());
		assert!(result.beta_changes.is_empty());
		assert_eq!(result.conflicts.len(), 1);
		let conflict = &result.conflicts[0];
		assert_eq!(conflict.alpha_changes, vec![Change::new(
			"f",
			Some(file(b"A")),
			Some(file(b"B")),
		)]);
		assert_eq!(conflict.beta_changes, vec![Change::new(
			"f",
			Some(file(b"A")),
			Some(file(b"C")),
		)]);
	}

	#[test]
	fn test_two_way_resolved_alpha_wins() {
		let ancestor = dir(vec![("f", file(b"A"))]);
		let alpha = dir(vec![("f", file(b"B"))]);
		let beta = dir(vec![("f", file(b"C"))]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWayResolved,
		);
		assert!(result.conflicts.is_empty());
		assert_eq!(result.beta_changes, vec![Change::new(
			"f",
			Some(file(b"C")),
			Some(file(b"B")),
		)]);
	}

	#[test]
	fn test_deletion_propagates() {
		let ancestor = dir(vec![("gone.txt", file(b"bye"))]);
		let alpha = dir(vec![]);
		let beta = dir(vec![("gone.txt", file(b"bye"))]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWaySafe,
		);
		assert_eq!(result.beta_changes, vec![Change::new(
			"gone.txt",
			Some(file(b"bye")),
			None,
		)]);
	}

	#[test]
	fn test_symmetry_in_two_way_safe() {
		let ancestor = dir(vec![("f", file(b"A")), ("g", file(b"G"))]);
		let alpha = dir(vec![("f", file(b"B")), ("g", file(b"G")), ("h", file(b"H"))]);
		let beta = dir(vec![("f", file(b"C")), ("g", file(b"G2"))]);

		let forward = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWaySafe,
		);
		let reversed = reconcile(
			Some(&ancestor),
			Some(&beta),
			Some(&alpha),
			SynchronizationMode::TwoWaySafe,
		);
		assert_eq!(forward.alpha_changes, reversed.beta_changes);
		assert_eq!(forward.beta_changes, reversed.alpha_changes);
		assert_eq!(forward.conflicts.len(), reversed.conflicts.len());
		for (f, r) in forward.conflicts.iter().zip(&reversed.conflicts) {
			assert_eq!(f.alpha_changes, r.beta_changes);
			assert_eq!(f.beta_changes, r.alpha_changes);
		}
	}

	#[test]
	fn test_untracked_never_propagates() {
		let ancestor = dir(vec![]);
		let alpha = dir(vec![("sock", Entry::Untracked)]);
		let beta = dir(vec![]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWaySafe,
		);
		assert!(result.beta_changes.is_empty());
		assert_eq!(result.conflicts.len(), 1);
	}

	#[test]
	fn test_overwriting_problematic_content_conflicts() {
		let ancestor = dir(vec![("f", file(b"old"))]);
		let alpha = dir(vec![("f", file(b"new"))]);
		let beta = dir(vec![("f", Entry::Problematic { problem: "unreadable".into() })]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWaySafe,
		);
		// Beta diverged too (problematic != ancestor), so this is the
		// both-changed case and must conflict rather than overwrite.
		assert!(result.beta_changes.is_empty());
		assert_eq!(result.conflicts.len(), 1);
	}

	#[test]
	fn test_deleting_over_untracked_content_conflicts() {
		let ancestor = dir(vec![("d", dir(vec![("f", file(b"x"))]))]);
		let alpha = dir(vec![]);
		let beta = dir(vec![("d", dir(vec![("f", file(b"x")), ("sock", Entry::Untracked)]))]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWaySafe,
		);
		// Alpha deleted the directory; beta holds untracked content inside
		// it. Removal would destroy the untracked entry.
		assert!(result.beta_changes.is_empty());
		assert_eq!(result.conflicts.len(), 1);
	}

	#[test]
	fn test_one_way_safe_tolerates_beta_creation() {
		let ancestor = dir(vec![]);
		let alpha = dir(vec![]);
		let beta = dir(vec![("artifact.o", file(b"obj"))]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::OneWaySafe,
		);
		assert!(result.alpha_changes.is_empty());
		assert!(result.beta_changes.is_empty());
		assert!(result.conflicts.is_empty());
	}

	#[test]
	fn test_one_way_safe_conflicts_on_beta_modification() {
		let ancestor = dir(vec![("f", file(b"A"))]);
		let alpha = dir(vec![("f", file(b"A"))]);
		let beta = dir(vec![("f", file(b"C"))]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::OneWaySafe,
		);
		assert!(result.beta_changes.is_empty());
		assert_eq!(result.conflicts.len(), 1);
	}

	#[test]
	fn test_one_way_replica_overwrites_beta() {
		let ancestor = dir(vec![]);
		let alpha = dir(vec![("f", file(b"A"))]);
		let beta = dir(vec![("f", file(b"C")), ("extra", file(b"E"))]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::OneWayReplica,
		);
		assert!(result.conflicts.is_empty());
		assert!(result.alpha_changes.is_empty());
		assert_eq!(result.beta_changes.len(), 2);
		assert!(result.beta_changes.contains(&Change::new("extra", Some(file(b"E")), None)));
		assert!(result.beta_changes.contains(&Change::new(
			"f",
			Some(file(b"C")),
			Some(file(b"A")),
		)));
	}

	#[test]
	fn test_kind_swap_emits_single_change() {
		let ancestor = dir(vec![("x", file(b"F"))]);
		let alpha = dir(vec![("x", dir(vec![("inner", file(b"I"))]))]);
		let beta = dir(vec![("x", file(b"F"))]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWaySafe,
		);
		assert_eq!(result.beta_changes, vec![Change::new(
			"x",
			Some(file(b"F")),
			Some(dir(vec![("inner", file(b"I"))])),
		)]);
	}

	#[test]
	fn test_unicode_names_align_to_ancestor_form() {
		// Ancestor and alpha store the composed form; beta decomposed.
		let composed = "caf\u{e9}".to_string();
		let decomposed = "cafe\u{301}".to_string();
		let mut alpha_contents = BTreeMap::new();
		alpha_contents.insert(composed.clone(), file(b"menu"));
		let mut beta_contents = BTreeMap::new();
		beta_contents.insert(decomposed, file(b"menu"));
		let mut ancestor_contents = BTreeMap::new();
		ancestor_contents.insert(composed.clone(), file(b"menu"));

		let result = reconcile(
			Some(&Entry::Directory { contents: ancestor_contents }),
			Some(&Entry::Directory { contents: alpha_contents }),
			Some(&Entry::Directory { contents: beta_contents }),
			SynchronizationMode::TwoWaySafe,
		);
		// The same logical child on both sides: nothing to do.
		assert!(result.alpha_changes.is_empty());
		assert!(result.beta_changes.is_empty());
		assert!(result.conflicts.is_empty());
	}

	#[test]
	fn test_changes_emitted_in_sorted_path_order() {
		let ancestor = dir(vec![]);
		let alpha = dir(vec![
			("zeta", file(b"z")),
			("alpha", file(b"a")),
			("mid", dir(vec![("inner", file(b"i"))])),
		]);
		let beta = dir(vec![]);
		let result = reconcile(
			Some(&ancestor),
			Some(&alpha),
			Some(&beta),
			SynchronizationMode::TwoWaySafe,
		);
		let paths: Vec<&str> = result.beta_changes.iter().map(|c| c.path.as_str()).collect();
		let mut sorted = paths.clone();
		sorted.sort();
		assert_eq!(paths, sorted);
	}
}

// vim: ts=4
