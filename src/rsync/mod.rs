//! Rsync delta engine
//!
//! The classic rsync algorithm generalized to arbitrary byte streams: a base
//! is summarized into block signatures (weak rolling checksum plus strong
//! digest), a target is expressed as a delta of literal data and block
//! references against that signature, and a patch reconstructs the target
//! from the base and the delta. The same engine serves both in-memory use
//! (differential snapshot transport) and streaming use (file staging).

use std::collections::HashMap;

use prost::Message;

use crate::hash::{Algorithm, UnsupportedAlgorithm};

pub mod transmit;

pub use transmit::{Receiver, Transmission};

/// Default block size when the caller requests automatic selection.
const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024;

/// Upper bound on automatically selected block sizes.
const MAXIMUM_BLOCK_SIZE: u64 = 64 * 1024;

/// Lower bound on automatically selected block sizes.
const MINIMUM_BLOCK_SIZE: u64 = 512;

/// Maximum length of a single literal data operation.
const MAXIMUM_DATA_OPERATION_SIZE: usize = 64 * 1024;

/// Signature of one base block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHash {
	pub weak: u32,
	pub strong: Vec<u8>,
}

/// Block-wise summary of a base byte sequence.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Signature {
	/// Size of all blocks except possibly the final one.
	pub block_size: u64,

	/// Size of the final block; zero only for an empty base.
	pub last_block_size: u64,

	pub hashes: Vec<BlockHash>,
}

impl Signature {
	/// Whether the signature describes an empty base.
	pub fn is_empty(&self) -> bool {
		self.hashes.is_empty()
	}

	/// Validate internal consistency.
	pub fn ensure_valid(&self) -> Result<(), EngineError> {
		if self.hashes.is_empty() {
			if self.block_size != 0 || self.last_block_size != 0 {
				return Err(EngineError::InvalidSignature {
					message: "empty signature with non-zero block sizes".into(),
				});
			}
			return Ok(());
		}
		if self.block_size == 0 {
			return Err(EngineError::InvalidSignature { message: "zero block size".into() });
		}
		if self.last_block_size == 0 || self.last_block_size > self.block_size {
			return Err(EngineError::InvalidSignature {
				message: "final block size out of range".into(),
			});
		}
		Ok(())
	}

	/// Length of the base the signature describes.
	pub fn base_length(&self) -> u64 {
		if self.hashes.is_empty() {
			0
		} else {
			(self.hashes.len() as u64 - 1) * self.block_size + self.last_block_size
		}
	}
}

/// A single delta operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
	/// Literal target bytes.
	Data(Vec<u8>),

	/// A run of consecutive base blocks starting at `start`.
	Blocks { start: u64, count: u64 },
}

/// Error raised by the delta engine.
#[derive(Debug)]
pub enum EngineError {
	InvalidSignature { message: String },
	InvalidOperation { message: String },
	UnsupportedAlgorithm(UnsupportedAlgorithm),
}

impl std::fmt::Display for EngineError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			EngineError::InvalidSignature { message } => {
				write!(f, "invalid signature: {}", message)
			}
			EngineError::InvalidOperation { message } => {
				write!(f, "invalid delta operation: {}", message)
			}
			EngineError::UnsupportedAlgorithm(e) => write!(f, "{}", e),
		}
	}
}

impl std::error::Error for EngineError {}

impl From<UnsupportedAlgorithm> for EngineError {
	fn from(e: UnsupportedAlgorithm) -> Self {
		EngineError::UnsupportedAlgorithm(e)
	}
}

/// Rolling weak checksum: two 16-bit-truncated running sums, matching the
/// canonical rsync formulation.
#[derive(Clone, Debug, Default)]
pub struct RollingChecksum {
	s1: u32,
	s2: u32,
	len: usize,
}

impl RollingChecksum {
	pub fn new() -> Self {
		Self::default()
	}

	/// Initialize from a full window.
	pub fn reset(&mut self, window: &[u8]) {
		self.s1 = 0;
		self.s2 = 0;
		self.len = window.len();
		for &byte in window {
			self.s1 = (self.s1 + byte as u32) & 0xffff;
			self.s2 = (self.s2 + self.s1) & 0xffff;
		}
	}

	/// Slide the window one byte forward.
	pub fn roll(&mut self, outgoing: u8, incoming: u8) {
		self.s1 = (self.s1.wrapping_sub(outgoing as u32).wrapping_add(incoming as u32)) & 0xffff;
		self.s2 = (self
			.s2
			.wrapping_sub((self.len as u32).wrapping_mul(outgoing as u32))
			.wrapping_add(self.s1))
			& 0xffff;
	}

	pub fn digest(&self) -> u32 {
		self.s1 | (self.s2 << 16)
	}
}

/// The delta engine, parameterized by the strong digest algorithm.
#[derive(Clone, Copy, Debug)]
pub struct Engine {
	algorithm: Algorithm,
}

impl Default for Engine {
	fn default() -> Self {
		Engine { algorithm: Algorithm::Sha1 }
	}
}

impl Engine {
	pub fn new(algorithm: Algorithm) -> Self {
		Engine { algorithm }
	}

	/// Pick a block size for a base of the given length.
	pub fn optimal_block_size(base_length: u64) -> u64 {
		if base_length == 0 {
			return DEFAULT_BLOCK_SIZE;
		}
		let root = (base_length as f64).sqrt() as u64;
		root.clamp(MINIMUM_BLOCK_SIZE, MAXIMUM_BLOCK_SIZE)
	}

	fn strong(&self, block: &[u8]) -> Result<Vec<u8>, EngineError> {
		Ok(self.algorithm.digest(block)?)
	}

	/// Compute the block signature of a base. A block size of zero selects
	/// one automatically.
	pub fn signature(&self, base: &[u8], block_size: u64) -> Result<Signature, EngineError> {
		if base.is_empty() {
			return Ok(Signature::default());
		}
		let block_size = if block_size == 0 {
			Self::optimal_block_size(base.len() as u64)
		} else {
			block_size
		};

		let mut hashes = Vec::with_capacity(base.len() / block_size as usize + 1);
		let mut last_block_size = 0;
		let mut weak = RollingChecksum::new();
		for block in base.chunks(block_size as usize) {
			weak.reset(block);
			hashes.push(BlockHash { weak: weak.digest(), strong: self.strong(block)? });
			last_block_size = block.len() as u64;
		}

		Ok(Signature { block_size, last_block_size, hashes })
	}

	/// Compute a delta expressing `target` against a base signature.
	pub fn delta(&self, target: &[u8], base: &Signature) -> Result<Vec<Operation>, EngineError> {
		base.ensure_valid()?;

		let mut operations = DeltaBuilder::default();

		if base.is_empty() || target.is_empty() {
			operations.data(target);
			return Ok(operations.finish());
		}

		// Index weak checksums; collisions chain into a candidate list that
		// is disambiguated by the strong digest.
		let mut candidates: HashMap<u32, Vec<u64>> = HashMap::new();
		for (index, hash) in base.hashes.iter().enumerate() {
			candidates.entry(hash.weak).or_default().push(index as u64);
		}

		let block_size = base.block_size as usize;
		let mut weak = RollingChecksum::new();
		let mut offset = 0usize;
		let mut window_valid = false;
		while offset < target.len() {
			let remaining = target.len() - offset;
			if remaining < block_size {
				// The tail cannot fill a whole block; it can still match the
				// final short block of the base.
				if remaining as u64 == base.last_block_size && base.last_block_size != base.block_size
				{
					let tail = &target[offset..];
					weak.reset(tail);
					if let Some(index) = self.match_block(&candidates, base, &weak, tail)? {
						if index as usize == base.hashes.len() - 1 {
							operations.blocks(index);
							break;
						}
					}
				}
				operations.data(&target[offset..]);
				break;
			}

			if !window_valid {
				weak.reset(&target[offset..offset + block_size]);
				window_valid = true;
			}

			let window = &target[offset..offset + block_size];
			match self.match_block(&candidates, base, &weak, window)? {
				Some(index)
					if (index as usize) < base.hashes.len() - 1
						|| base.last_block_size == base.block_size =>
				{
					operations.blocks(index);
					offset += block_size;
					window_valid = false;
				}
				_ => {
					operations.byte(target[offset]);
					if offset + block_size < target.len() {
						weak.roll(target[offset], target[offset + block_size]);
					} else {
						window_valid = false;
					}
					offset += 1;
				}
			}
		}

		Ok(operations.finish())
	}

	fn match_block(
		&self,
		candidates: &HashMap<u32, Vec<u64>>,
		base: &Signature,
		weak: &RollingChecksum,
		window: &[u8],
	) -> Result<Option<u64>, EngineError> {
		let Some(indices) = candidates.get(&weak.digest()) else {
			return Ok(None);
		};
		let strong = self.strong(window)?;
		for &index in indices {
			let hash = &base.hashes[index as usize];
			// The final block only matches windows of its own length.
			let expected = if index as usize == base.hashes.len() - 1 {
				base.last_block_size
			} else {
				base.block_size
			};
			if expected == window.len() as u64 && hash.strong == strong {
				return Ok(Some(index));
			}
		}
		Ok(None)
	}

	/// Reconstruct the target from a base, its signature, and a delta.
	pub fn patch(
		&self,
		base: &[u8],
		signature: &Signature,
		delta: &[Operation],
	) -> Result<Vec<u8>, EngineError> {
		signature.ensure_valid()?;
		let mut target = Vec::new();
		for operation in delta {
			self.apply(&mut target, base, signature, operation)?;
		}
		Ok(target)
	}

	/// Apply one operation during patching; shared with streaming receipt.
	pub fn apply(
		&self,
		target: &mut Vec<u8>,
		base: &[u8],
		signature: &Signature,
		operation: &Operation,
	) -> Result<(), EngineError> {
		match operation {
			Operation::Data(data) => {
				target.extend_from_slice(data);
				Ok(())
			}
			Operation::Blocks { start, count } => {
				if *count == 0 {
					return Err(EngineError::InvalidOperation {
						message: "zero-length block reference".into(),
					});
				}
				let total_blocks = signature.hashes.len() as u64;
				let end = start.checked_add(*count).ok_or_else(|| EngineError::InvalidOperation {
					message: "block reference overflows".into(),
				})?;
				if end > total_blocks {
					return Err(EngineError::InvalidOperation {
						message: format!(
							"block reference {}..{} out of range ({} blocks)",
							start, end, total_blocks
						),
					});
				}
				for index in *start..end {
					let offset = (index * signature.block_size) as usize;
					let length = if index == total_blocks - 1 {
						signature.last_block_size
					} else {
						signature.block_size
					} as usize;
					if offset + length > base.len() {
						return Err(EngineError::InvalidOperation {
							message: "block reference beyond base length".into(),
						});
					}
					target.extend_from_slice(&base[offset..offset + length]);
				}
				Ok(())
			}
		}
	}

	/// Convenience: signature plus delta of `target` against `base`.
	pub fn deltafy_bytes(
		&self,
		target: &[u8],
		base: &[u8],
		block_size: u64,
	) -> Result<(Signature, Vec<Operation>), EngineError> {
		let signature = self.signature(base, block_size)?;
		let delta = self.delta(target, &signature)?;
		Ok((signature, delta))
	}

	/// Convenience: patch `base` with a delta computed against it.
	pub fn patch_bytes(
		&self,
		base: &[u8],
		signature: &Signature,
		delta: &[Operation],
	) -> Result<Vec<u8>, EngineError> {
		self.patch(base, signature, delta)
	}
}

/// Accumulates operations, coalescing adjacent literal bytes and contiguous
/// block references.
#[derive(Default)]
struct DeltaBuilder {
	operations: Vec<Operation>,
	pending: Vec<u8>,
}

impl DeltaBuilder {
	fn byte(&mut self, byte: u8) {
		self.pending.push(byte);
		if self.pending.len() >= MAXIMUM_DATA_OPERATION_SIZE {
			self.flush_pending();
		}
	}

	fn data(&mut self, data: &[u8]) {
		for chunk in data.chunks(MAXIMUM_DATA_OPERATION_SIZE) {
			self.pending.extend_from_slice(chunk);
			if self.pending.len() >= MAXIMUM_DATA_OPERATION_SIZE {
				self.flush_pending();
			}
		}
	}

	fn blocks(&mut self, index: u64) {
		self.flush_pending();
		if let Some(Operation::Blocks { start, count }) = self.operations.last_mut() {
			if *start + *count == index {
				*count += 1;
				return;
			}
		}
		self.operations.push(Operation::Blocks { start: index, count: 1 });
	}

	fn flush_pending(&mut self) {
		if !self.pending.is_empty() {
			self.operations.push(Operation::Data(std::mem::take(&mut self.pending)));
		}
	}

	fn finish(mut self) -> Vec<Operation> {
		self.flush_pending();
		self.operations
	}
}

/// Wire form of a signature.
#[derive(Clone, PartialEq, Message)]
pub struct WireSignature {
	#[prost(uint64, tag = "1")]
	pub block_size: u64,

	#[prost(uint64, tag = "2")]
	pub last_block_size: u64,

	#[prost(message, repeated, tag = "3")]
	pub hashes: Vec<WireBlockHash>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireBlockHash {
	#[prost(uint32, tag = "1")]
	pub weak: u32,

	#[prost(bytes = "vec", tag = "2")]
	pub strong: Vec<u8>,
}

/// Wire form of a delta operation. A populated `data` field carries literal
/// bytes; otherwise the block reference fields apply.
#[derive(Clone, PartialEq, Message)]
pub struct WireOperation {
	#[prost(bytes = "vec", tag = "1")]
	pub data: Vec<u8>,

	#[prost(uint64, tag = "2")]
	pub block_index: u64,

	#[prost(uint64, tag = "3")]
	pub count: u64,
}

impl From<&Signature> for WireSignature {
	fn from(signature: &Signature) -> Self {
		WireSignature {
			block_size: signature.block_size,
			last_block_size: signature.last_block_size,
			hashes: signature
				.hashes
				.iter()
				.map(|h| WireBlockHash { weak: h.weak, strong: h.strong.clone() })
				.collect(),
		}
	}
}

impl From<&WireSignature> for Signature {
	fn from(wire: &WireSignature) -> Self {
		Signature {
			block_size: wire.block_size,
			last_block_size: wire.last_block_size,
			hashes: wire
				.hashes
				.iter()
				.map(|h| BlockHash { weak: h.weak, strong: h.strong.clone() })
				.collect(),
		}
	}
}

impl From<&Operation> for WireOperation {
	fn from(operation: &Operation) -> Self {
		match operation {
			Operation::Data(data) => {
				WireOperation { data: data.clone(), block_index: 0, count: 0 }
			}
			Operation::Blocks { start, count } => {
				WireOperation { data: Vec::new(), block_index: *start, count: *count }
			}
		}
	}
}

impl TryFrom<&WireOperation> for Operation {
	type Error = EngineError;

	fn try_from(wire: &WireOperation) -> Result<Operation, EngineError> {
		if !wire.data.is_empty() {
			if wire.count != 0 {
				return Err(EngineError::InvalidOperation {
					message: "operation carries both data and block reference".into(),
				});
			}
			return Ok(Operation::Data(wire.data.clone()));
		}
		if wire.count == 0 {
			return Err(EngineError::InvalidOperation { message: "empty operation".into() });
		}
		Ok(Operation::Blocks { start: wire.block_index, count: wire.count })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip(base: &[u8], target: &[u8], block_size: u64) {
		let engine = Engine::default();
		let signature = engine.signature(base, block_size).unwrap();
		let delta = engine.delta(target, &signature).unwrap();
		let patched = engine.patch(base, &signature, &delta).unwrap();
		assert_eq!(patched, target, "round trip failed for {} byte base", base.len());
	}

	#[test]
	fn test_round_trip_identical() {
		let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
		round_trip(&data, &data, 64);
	}

	#[test]
	fn test_round_trip_empty_base() {
		round_trip(b"", b"fresh content", 0);
	}

	#[test]
	fn test_round_trip_empty_target() {
		round_trip(b"old content", b"", 0);
	}

	#[test]
	fn test_round_trip_insertion() {
		let base: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
		let mut target = base.clone();
		target.splice(5_000..5_000, b"inserted bytes".iter().copied());
		round_trip(&base, &target, 512);
	}

	#[test]
	fn test_round_trip_deletion_and_mutation() {
		let base: Vec<u8> = (0..20_000).map(|i| (i % 241) as u8).collect();
		let mut target = base.clone();
		target.drain(1_000..3_000);
		target[10_000] ^= 0xff;
		round_trip(&base, &target, 0);
	}

	#[test]
	fn test_round_trip_short_last_block() {
		// Base length deliberately not a block multiple.
		let base: Vec<u8> = (0..1000).map(|i| (i % 7) as u8).collect();
		round_trip(&base, &base, 64);
	}

	#[test]
	fn test_identical_data_produces_block_references() {
		let engine = Engine::default();
		let base = b"abcdefgh".repeat(1024);
		let signature = engine.signature(&base, 512).unwrap();
		let delta = engine.delta(&base, &signature).unwrap();
		assert!(delta.iter().all(|op| matches!(op, Operation::Blocks { .. })));
		// Contiguous references coalesce into a single run.
		assert_eq!(delta.len(), 1);
	}

	#[test]
	fn test_single_insertion_produces_one_data_operation() {
		let engine = Engine::default();
		let base: Vec<u8> = (0..8192).map(|i| (i % 201) as u8).collect();
		let signature = engine.signature(&base, 1024).unwrap();
		let mut target = base.clone();
		target.splice(4096..4096, b"wedge".iter().copied());
		let delta = engine.delta(&target, &signature).unwrap();
		let data_ops = delta.iter().filter(|op| matches!(op, Operation::Data(_))).count();
		assert_eq!(data_ops, 1);
		assert_eq!(engine.patch(&base, &signature, &delta).unwrap(), target);
	}

	#[test]
	fn test_rolling_checksum_matches_reset() {
		let data = b"rolling checksum consistency check data";
		let window = 16;
		let mut rolling = RollingChecksum::new();
		rolling.reset(&data[..window]);
		let mut reference = RollingChecksum::new();
		for offset in 1..data.len() - window {
			rolling.roll(data[offset - 1], data[offset + window - 1]);
			reference.reset(&data[offset..offset + window]);
			assert_eq!(rolling.digest(), reference.digest(), "divergence at offset {}", offset);
		}
	}

	#[test]
	fn test_signature_validation() {
		assert!(Signature::default().ensure_valid().is_ok());
		let bad = Signature {
			block_size: 0,
			last_block_size: 0,
			hashes: vec![BlockHash { weak: 1, strong: vec![1] }],
		};
		assert!(bad.ensure_valid().is_err());
		let bad = Signature {
			block_size: 8,
			last_block_size: 9,
			hashes: vec![BlockHash { weak: 1, strong: vec![1] }],
		};
		assert!(bad.ensure_valid().is_err());
	}

	#[test]
	fn test_patch_rejects_out_of_range_blocks() {
		let engine = Engine::default();
		let base = b"0123456789abcdef";
		let signature = engine.signature(base, 8).unwrap();
		let result = engine.patch(base, &signature, &[Operation::Blocks { start: 5, count: 1 }]);
		assert!(result.is_err());
	}

	#[test]
	fn test_wire_operation_round_trip() {
		for operation in [
			Operation::Data(b"payload".to_vec()),
			Operation::Blocks { start: 3, count: 7 },
		] {
			let wire = WireOperation::from(&operation);
			assert_eq!(Operation::try_from(&wire).unwrap(), operation);
		}
	}

	#[test]
	fn test_wire_signature_round_trip() {
		let engine = Engine::default();
		let signature = engine.signature(&b"wire trip".repeat(100), 64).unwrap();
		let wire = WireSignature::from(&signature);
		assert_eq!(Signature::from(&wire), signature);
	}

	#[test]
	fn test_optimal_block_size_bounds() {
		assert_eq!(Engine::optimal_block_size(0), DEFAULT_BLOCK_SIZE);
		assert_eq!(Engine::optimal_block_size(100), MINIMUM_BLOCK_SIZE);
		assert_eq!(Engine::optimal_block_size(u64::MAX / 2), MAXIMUM_BLOCK_SIZE);
	}
}

// vim: ts=4
