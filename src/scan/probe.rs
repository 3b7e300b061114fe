//! Filesystem behavior probes
//!
//! Executability preservation and Unicode normalization behavior are probed
//! once per scan by creating short-lived marker files directly under the
//! synchronization root. Roots that are not directories report conservative
//! defaults.

use std::fs;
use std::io;
use std::path::Path;

use unicode_normalization::UnicodeNormalization;

/// Observed filesystem behavior at a synchronization root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeResults {
	/// Whether the executable permission bit survives a round trip.
	pub preserves_executability: bool,

	/// Whether stored names come back in decomposed (NFD) form.
	pub decomposes_unicode: bool,

	/// Whether name lookups are case-insensitive.
	pub case_insensitive: bool,
}

const EXECUTABILITY_PROBE: &str = ".reflectr-probe-executability";
const UNICODE_PROBE: &str = ".reflectr-probe-unicode-\u{00e9}";
const CASE_PROBE: &str = ".reflectr-PROBE-case";

/// Run all behavior probes against a directory root.
pub fn probe(root: &Path) -> io::Result<ProbeResults> {
	Ok(ProbeResults {
		preserves_executability: probe_executability(root)?,
		decomposes_unicode: probe_unicode_decomposition(root)?,
		case_insensitive: probe_case_insensitivity(root)?,
	})
}

fn probe_executability(root: &Path) -> io::Result<bool> {
	#[cfg(not(unix))]
	{
		let _ = root;
		return Ok(false);
	}
	#[cfg(unix)]
	{
		use std::os::unix::fs::OpenOptionsExt;
		use std::os::unix::fs::PermissionsExt;

		let path = root.join(EXECUTABILITY_PROBE);
		let result = (|| {
			fs::OpenOptions::new().write(true).create(true).mode(0o700).open(&path)?;
			let mode = fs::metadata(&path)?.permissions().mode();
			Ok::<_, io::Error>(mode & 0o100 != 0)
		})();
		let _ = fs::remove_file(&path);
		result
	}
}

fn probe_unicode_decomposition(root: &Path) -> io::Result<bool> {
	let composed = root.join(UNICODE_PROBE);
	let result = (|| {
		fs::File::create(&composed)?;
		let decomposed: String = UNICODE_PROBE.nfd().collect();
		for entry in fs::read_dir(root)? {
			let entry = entry?;
			if let Some(name) = entry.file_name().to_str() {
				if name == decomposed && decomposed != UNICODE_PROBE {
					return Ok(true);
				}
			}
		}
		Ok(false)
	})();
	// The stored name may have been renormalized, so remove both forms.
	let _ = fs::remove_file(&composed);
	let decomposed: String = UNICODE_PROBE.nfd().collect();
	let _ = fs::remove_file(root.join(decomposed));
	result
}

fn probe_case_insensitivity(root: &Path) -> io::Result<bool> {
	let path = root.join(CASE_PROBE);
	let result = (|| {
		fs::File::create(&path)?;
		Ok(root.join(CASE_PROBE.to_lowercase()).exists() && CASE_PROBE != CASE_PROBE.to_lowercase())
	})();
	let _ = fs::remove_file(&path);
	result
}

/// Whether a name is one of the transient probe files, which must never
/// appear in a snapshot even if a scan races probe cleanup.
pub fn is_probe_name(name: &str) -> bool {
	name.starts_with(".reflectr-probe-") || name.starts_with(".reflectr-PROBE-")
}


// vim: ts=4
