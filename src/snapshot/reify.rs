//! Phantom directory reification
//!
//! Transitions graft subtrees using `PhantomDirectory` placeholders. Before a
//! snapshot pair is exposed outside the transition machinery, the phantoms
//! are replaced by equivalent real directories and directory counts are
//! recomputed.

use std::collections::BTreeMap;

use super::Entry;

/// Replace `PhantomDirectory` nodes in both endpoint trees by equivalent
/// `Directory` nodes and return the fresh directory counts.
///
/// The ancestor is walked alongside so reification visits exactly the paths a
/// transition could have grafted; it is never modified.
pub fn reify_phantom_directories(
	ancestor: Option<&Entry>,
	alpha: Option<&Entry>,
	beta: Option<&Entry>,
) -> (Option<Entry>, Option<Entry>, u64, u64) {
	let mut alpha_directories = 0;
	let mut beta_directories = 0;
	let alpha = alpha.map(|entry| reify(ancestor, entry, &mut alpha_directories));
	let beta = beta.map(|entry| reify(ancestor, entry, &mut beta_directories));
	(alpha, beta, alpha_directories, beta_directories)
}

/// Reify a single subtree, converting any phantom directories to real ones.
pub fn reify_entry(entry: &Entry) -> Entry {
	let mut directories = 0;
	reify(None, entry, &mut directories)
}

fn reify(ancestor: Option<&Entry>, entry: &Entry, directories: &mut u64) -> Entry {
	match entry {
		Entry::Directory { contents } | Entry::PhantomDirectory { contents } => {
			*directories += 1;
			let ancestor_contents = ancestor.and_then(Entry::contents);
			let reified: BTreeMap<String, Entry> = contents
				.iter()
				.map(|(name, child)| {
					let ancestor_child = ancestor_contents.and_then(|c| c.get(name));
					(name.clone(), reify(ancestor_child, child, directories))
				})
				.collect();
			Entry::Directory { contents: reified }
		}
		other => other.clone(),
	}
}


// vim: ts=4
