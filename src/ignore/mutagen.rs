//! Mutagen-dialect ignore patterns
//!
//! Doublestar-based globbing: a leading `!` negates, a leading `/` anchors
//! the pattern to the synchronization root, a trailing `/` restricts the
//! match to directories, and a bare name also matches any path leaf.
//! Later matches override earlier ones.

use globset::{GlobBuilder, GlobMatcher};

use super::{component_matches, has_meta, IgnoreError, IgnoreStatus, Ignorer};

struct Pattern {
	negated: bool,
	directory_only: bool,
	anchored: bool,
	matcher: GlobMatcher,

	/// Pattern body split into components, for prefix reachability checks.
	components: Vec<String>,
}

impl Pattern {
	fn parse(raw: &str) -> Result<Pattern, IgnoreError> {
		let reject = |message: &str| IgnoreError { pattern: raw.to_string(), message: message.into() };

		if raw.is_empty() || raw.trim().is_empty() {
			return Err(reject("pattern is empty"));
		}

		let (negated, body) = match raw.strip_prefix('!') {
			Some(rest) => (true, rest),
			None => (false, raw),
		};
		let (directory_only, body) = match body.strip_suffix('/') {
			Some(rest) => (true, rest),
			None => (false, body),
		};
		let (anchored, body) = match body.strip_prefix('/') {
			Some(rest) => (true, rest),
			None => (false, body),
		};

		// Whole-root and degenerate patterns are rejected: "/", "//", "!",
		// "!/", "!//", and anything that reduces to whitespace.
		if body.is_empty() || body.trim().is_empty() {
			return Err(reject("pattern matches the whole synchronization root"));
		}

		let glob = if anchored { body.to_string() } else { format!("**/{}", body) };
		let matcher = GlobBuilder::new(&glob)
			.literal_separator(true)
			.build()
			.map_err(|e| reject(&e.to_string()))?
			.compile_matcher();

		Ok(Pattern {
			negated,
			directory_only,
			anchored,
			matcher,
			components: body.split('/').map(str::to_string).collect(),
		})
	}

	fn matches(&self, path: &str, directory: bool) -> bool {
		if self.directory_only && !directory {
			return false;
		}
		self.matcher.is_match(path)
	}

	/// Whether this pattern could match some path strictly below `path`.
	/// Floating patterns always can; anchored patterns are walked
	/// component-wise against the path.
	fn could_match_below(&self, path: &str) -> bool {
		if !self.anchored {
			return true;
		}
		let mut pattern_components = self.components.iter();
		for name in path.split('/') {
			match pattern_components.next() {
				None => return false,
				Some(component) => {
					if component == "**" {
						return true;
					}
					if has_meta(component) {
						if !component_matches(component, name) {
							return false;
						}
					} else if component != name {
						return false;
					}
				}
			}
		}
		pattern_components.next().is_some()
	}
}

/// Ignorer over an ordered Mutagen-dialect pattern list.
pub struct MutagenIgnorer {
	patterns: Vec<Pattern>,

	/// Count of negated patterns strictly after each index; lets matching
	/// stop early once an ignore verdict can no longer be overridden.
	negations_after: Vec<usize>,
}

impl MutagenIgnorer {
	pub fn new(raw_patterns: &[String]) -> Result<Self, IgnoreError> {
		let patterns =
			raw_patterns.iter().map(|raw| Pattern::parse(raw)).collect::<Result<Vec<_>, _>>()?;

		let mut negations_after = vec![0usize; patterns.len()];
		let mut remaining = 0;
		for index in (0..patterns.len()).rev() {
			negations_after[index] = remaining;
			if patterns[index].negated {
				remaining += 1;
			}
		}

		Ok(MutagenIgnorer { patterns, negations_after })
	}
}

impl Ignorer for MutagenIgnorer {
	fn ignore(&self, path: &str, directory: bool) -> (IgnoreStatus, bool) {
		let mut status = IgnoreStatus::Nominal;
		for (index, pattern) in self.patterns.iter().enumerate() {
			if pattern.matches(path, directory) {
				status =
					if pattern.negated { IgnoreStatus::Unignored } else { IgnoreStatus::Ignored };
			}
			if status == IgnoreStatus::Ignored && self.negations_after[index] == 0 {
				break;
			}
		}

		let continue_traversal = directory
			&& match status {
				IgnoreStatus::Nominal | IgnoreStatus::Unignored => true,
				IgnoreStatus::Ignored => self
					.patterns
					.iter()
					.filter(|p| p.negated)
					.any(|p| p.could_match_below(path)),
			};

		(status, continue_traversal)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ignorer(patterns: &[&str]) -> MutagenIgnorer {
		MutagenIgnorer::new(&patterns.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
	}

	#[test]
	fn test_rejects_degenerate_patterns() {
		for raw in ["", "/", "//", "!", "!/", "!//", "   ", "!  "] {
			assert!(
				MutagenIgnorer::new(&[raw.to_string()]).is_err(),
				"pattern {:?} should be rejected",
				raw
			);
		}
	}

	#[test]
	fn test_bare_name_matches_any_leaf() {
		let ignorer = ignorer(&["build"]);
		assert_eq!(ignorer.ignore("build", false).0, IgnoreStatus::Ignored);
		assert_eq!(ignorer.ignore("sub/build", true).0, IgnoreStatus::Ignored);
		assert_eq!(ignorer.ignore("building", false).0, IgnoreStatus::Nominal);
	}

	#[test]
	fn test_anchored_pattern() {
		let ignorer = ignorer(&["/target"]);
		assert_eq!(ignorer.ignore("target", true).0, IgnoreStatus::Ignored);
		assert_eq!(ignorer.ignore("sub/target", true).0, IgnoreStatus::Nominal);
	}

	#[test]
	fn test_directory_only_pattern() {
		let ignorer = ignorer(&["cache/"]);
		assert_eq!(ignorer.ignore("cache", true).0, IgnoreStatus::Ignored);
		assert_eq!(ignorer.ignore("cache", false).0, IgnoreStatus::Nominal);
	}

	#[test]
	fn test_negation_overrides_earlier_match() {
		let ignorer = ignorer(&["*.log", "!keep.log"]);
		assert_eq!(ignorer.ignore("a.log", false).0, IgnoreStatus::Ignored);
		assert_eq!(ignorer.ignore("keep.log", false).0, IgnoreStatus::Unignored);
		assert_eq!(ignorer.ignore("notes.md", false).0, IgnoreStatus::Nominal);
	}

	#[test]
	fn test_later_match_wins() {
		let ignorer = ignorer(&["!keep.log", "*.log"]);
		assert_eq!(ignorer.ignore("keep.log", false).0, IgnoreStatus::Ignored);
	}

	#[test]
	fn test_doublestar() {
		let ignorer = ignorer(&["/build/**/out"]);
		assert_eq!(ignorer.ignore("build/a/b/out", false).0, IgnoreStatus::Ignored);
		assert_eq!(ignorer.ignore("other/out", false).0, IgnoreStatus::Nominal);
	}

	#[test]
	fn test_continuation_under_negation() {
		// The directory is masked but a negation could re-include content
		// beneath it, so traversal must continue.
		let ignorer = ignorer(&["/node_modules", "!/node_modules/keep"]);
		let (status, descend) = ignorer.ignore("node_modules", true);
		assert_eq!(status, IgnoreStatus::Ignored);
		assert!(descend);
		assert_eq!(ignorer.ignore("node_modules/keep", true).0, IgnoreStatus::Unignored);
	}

	#[test]
	fn test_no_continuation_without_reachable_negation() {
		let ignorer = ignorer(&["/node_modules", "!/elsewhere/keep"]);
		let (status, descend) = ignorer.ignore("node_modules", true);
		assert_eq!(status, IgnoreStatus::Ignored);
		assert!(!descend);
	}

	#[test]
	fn test_floating_negation_keeps_traversal_open() {
		let ignorer = ignorer(&["/vendor", "!important.txt"]);
		let (status, descend) = ignorer.ignore("vendor", true);
		assert_eq!(status, IgnoreStatus::Ignored);
		assert!(descend);
	}

	#[test]
	fn test_idempotent_evaluation() {
		let ignorer = ignorer(&["*.tmp", "!keep.tmp", "/cache/"]);
		for (path, dir) in [("a.tmp", false), ("keep.tmp", false), ("cache", true)] {
			assert_eq!(ignorer.ignore(path, dir), ignorer.ignore(path, dir));
		}
	}

	#[test]
	fn test_nominal_file_has_no_continuation() {
		let ignorer = ignorer(&["*.tmp"]);
		// Continuation only applies to directories.
		assert_eq!(ignorer.ignore("notes.md", false), (IgnoreStatus::Nominal, false));
	}
}

// vim: ts=4
