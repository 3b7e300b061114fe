//! Digest algorithm registry
//!
//! Snapshots identify file content by digest. The algorithm is negotiated per
//! session by name; every algorithm produces fixed-length digests through an
//! incremental hasher. XXH128 support depends on build configuration and the
//! registry reports its availability.

use serde::{Deserialize, Serialize};

/// A named digest algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
	#[default]
	Sha1,
	Sha256,
	Xxh128,
}

/// Error constructing a hasher for an unavailable algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedAlgorithm {
	pub name: &'static str,
}

impl std::fmt::Display for UnsupportedAlgorithm {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "digest algorithm {} is not supported by this build", self.name)
	}
}

impl std::error::Error for UnsupportedAlgorithm {}

impl Algorithm {
	/// Look up an algorithm by its registered name.
	pub fn from_name(name: &str) -> Option<Algorithm> {
		match name {
			"sha1" => Some(Algorithm::Sha1),
			"sha256" => Some(Algorithm::Sha256),
			"xxh128" => Some(Algorithm::Xxh128),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Algorithm::Sha1 => "sha1",
			Algorithm::Sha256 => "sha256",
			Algorithm::Xxh128 => "xxh128",
		}
	}

	/// Whether the current build can produce this digest.
	pub fn supported(&self) -> bool {
		match self {
			Algorithm::Sha1 | Algorithm::Sha256 => true,
			Algorithm::Xxh128 => cfg!(feature = "xxh128"),
		}
	}

	/// Digest length in bytes.
	pub fn digest_length(&self) -> usize {
		match self {
			Algorithm::Sha1 => 20,
			Algorithm::Sha256 => 32,
			Algorithm::Xxh128 => 16,
		}
	}

	/// Construct an incremental hasher.
	pub fn hasher(&self) -> Result<Box<dyn Hasher>, UnsupportedAlgorithm> {
		match self {
			Algorithm::Sha1 => Ok(Box::new(Sha1Hasher(sha1::Sha1::default()))),
			Algorithm::Sha256 => Ok(Box::new(Sha256Hasher(sha2::Sha256::default()))),
			#[cfg(feature = "xxh128")]
			Algorithm::Xxh128 => Ok(Box::new(Xxh128Hasher(xxhash_rust::xxh3::Xxh3::new()))),
			#[cfg(not(feature = "xxh128"))]
			Algorithm::Xxh128 => Err(UnsupportedAlgorithm { name: self.name() }),
		}
	}

	/// Digest a complete byte slice.
	pub fn digest(&self, data: &[u8]) -> Result<Vec<u8>, UnsupportedAlgorithm> {
		let mut hasher = self.hasher()?;
		hasher.update(data);
		Ok(hasher.finish())
	}

	/// All algorithms this build supports, in registry order.
	pub fn supported_algorithms() -> Vec<Algorithm> {
		[Algorithm::Sha1, Algorithm::Sha256, Algorithm::Xxh128]
			.into_iter()
			.filter(Algorithm::supported)
			.collect()
	}
}

/// Incremental digest computation.
pub trait Hasher: Send {
	fn update(&mut self, data: &[u8]);
	fn finish(self: Box<Self>) -> Vec<u8>;
}

struct Sha1Hasher(sha1::Sha1);

impl Hasher for Sha1Hasher {
	fn update(&mut self, data: &[u8]) {
		use sha1::Digest;
		self.0.update(data);
	}

	fn finish(self: Box<Self>) -> Vec<u8> {
		use sha1::Digest;
		self.0.finalize().to_vec()
	}
}

struct Sha256Hasher(sha2::Sha256);

impl Hasher for Sha256Hasher {
	fn update(&mut self, data: &[u8]) {
		use sha2::Digest;
		self.0.update(data);
	}

	fn finish(self: Box<Self>) -> Vec<u8> {
		use sha2::Digest;
		self.0.finalize().to_vec()
	}
}

#[cfg(feature = "xxh128")]
struct Xxh128Hasher(xxhash_rust::xxh3::Xxh3);

#[cfg(feature = "xxh128")]
impl Hasher for Xxh128Hasher {
	fn update(&mut self, data: &[u8]) {
		self.0.update(data);
	}

	fn finish(self: Box<Self>) -> Vec<u8> {
		self.0.digest128().to_be_bytes().to_vec()
	}
}


// vim: ts=4
