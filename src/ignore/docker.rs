//! Docker-dialect ignore patterns
//!
//! A validated subset of `.dockerignore` semantics: `*`, `?`, `**`, and
//! character classes, with a leading `!` for inversion. Patterns are always
//! anchored to the synchronization root. Backslashes and patterns reducing
//! to the separator are rejected.

use globset::{GlobBuilder, GlobMatcher};

use super::{component_matches, has_meta, IgnoreError, IgnoreStatus, Ignorer};

struct Pattern {
	negated: bool,
	matcher: GlobMatcher,
	components: Vec<String>,
}

impl Pattern {
	fn parse(raw: &str) -> Result<Pattern, IgnoreError> {
		let reject = |message: &str| IgnoreError { pattern: raw.to_string(), message: message.into() };

		if raw.is_empty() || raw.trim().is_empty() {
			return Err(reject("pattern is empty"));
		}
		if raw.contains('\\') {
			return Err(reject("backslashes are not supported"));
		}

		let (negated, body) = match raw.strip_prefix('!') {
			Some(rest) => (true, rest),
			None => (false, raw),
		};

		// Patterns are root-anchored; a leading separator is redundant and a
		// trailing one is meaningless for matching.
		let body = body.trim_start_matches('/').trim_end_matches('/');
		if body.is_empty() || body.trim().is_empty() || body == "." {
			return Err(reject("pattern reduces to the path separator"));
		}

		let matcher = GlobBuilder::new(body)
			.literal_separator(true)
			.build()
			.map_err(|e| reject(&e.to_string()))?
			.compile_matcher();

		Ok(Pattern {
			negated,
			matcher,
			components: body.split('/').map(str::to_string).collect(),
		})
	}

	fn could_match_below(&self, path: &str) -> bool {
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

/// Ignorer over an ordered `.dockerignore`-style pattern list.
pub struct DockerIgnorer {
	patterns: Vec<Pattern>,
}

impl DockerIgnorer {
	pub fn new(raw_patterns: &[String]) -> Result<Self, IgnoreError> {
		let patterns =
			raw_patterns.iter().map(|raw| Pattern::parse(raw)).collect::<Result<Vec<_>, _>>()?;
		Ok(DockerIgnorer { patterns })
	}
}

impl Ignorer for DockerIgnorer {
	fn ignore(&self, path: &str, directory: bool) -> (IgnoreStatus, bool) {
		let mut status = IgnoreStatus::Nominal;
		for pattern in &self.patterns {
			if pattern.matcher.is_match(path) {
				status =
					if pattern.negated { IgnoreStatus::Unignored } else { IgnoreStatus::Ignored };
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


// vim: ts=4
