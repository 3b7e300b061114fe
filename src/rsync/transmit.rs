//! Streaming delta transmission
//!
//! File staging streams deltas from the side that has content to the side
//! that needs it. Operations travel as length-prefixed `Transmission`
//! messages tagged with the index of the path they apply to; receipt is
//! abstracted behind the `Receiver` trait so the same transmit path serves
//! in-process staging and the remote endpoint protocol.

use std::io;

use prost::Message;

use super::{Engine, EngineError, Operation, Signature, WireOperation};

/// Wire unit of the staging stream. Consecutive transmissions for one path
/// carry its operations in order; a change of `path_index` commits the
/// previous path, and `done` marks the end of the whole stream.
#[derive(Clone, PartialEq, Message)]
pub struct Transmission {
	#[prost(uint64, tag = "1")]
	pub path_index: u64,

	#[prost(message, optional, tag = "2")]
	pub operation: Option<WireOperation>,

	#[prost(bool, tag = "3")]
	pub done: bool,
}

/// Error raised during delta receipt.
#[derive(Debug)]
pub enum ReceiveError {
	/// Delta engine failure while applying operations.
	Engine(EngineError),

	/// Filesystem failure on the receiving side.
	Io(io::Error),

	/// Stream violated the transmission protocol.
	Protocol { message: String },
}

impl std::fmt::Display for ReceiveError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ReceiveError::Engine(e) => write!(f, "delta application failed: {}", e),
			ReceiveError::Io(e) => write!(f, "staging I/O failed: {}", e),
			ReceiveError::Protocol { message } => write!(f, "transmission protocol error: {}", message),
		}
	}
}

impl std::error::Error for ReceiveError {}

impl From<EngineError> for ReceiveError {
	fn from(e: EngineError) -> Self {
		ReceiveError::Engine(e)
	}
}

impl From<io::Error> for ReceiveError {
	fn from(e: io::Error) -> Self {
		ReceiveError::Io(e)
	}
}

/// Sink for streamed delta operations.
///
/// Operations arrive grouped by path in ascending transmission order; a new
/// path index commits the previous path and `finalize` commits the last.
pub trait Receiver: Send {
	fn receive(&mut self, path_index: usize, operation: &Operation) -> Result<(), ReceiveError>;
	fn finalize(&mut self) -> Result<(), ReceiveError>;
}

/// Compute and deliver the delta for one path's content.
pub fn transmit(
	engine: &Engine,
	path_index: usize,
	target: &[u8],
	base_signature: &Signature,
	receiver: &mut dyn Receiver,
) -> Result<(), ReceiveError> {
	let delta = engine.delta(target, base_signature)?;
	for operation in &delta {
		receiver.receive(path_index, operation)?;
	}
	Ok(())
}

/// Receiver that simply accumulates patched bytes per path, used by tests
/// and by in-memory snapshot transfer.
pub struct BufferReceiver<'a> {
	engine: Engine,
	bases: Vec<(&'a [u8], Signature)>,
	pub buffers: Vec<Vec<u8>>,
}

impl<'a> BufferReceiver<'a> {
	pub fn new(engine: Engine, bases: Vec<(&'a [u8], Signature)>) -> Self {
		let buffers = vec![Vec::new(); bases.len()];
		BufferReceiver { engine, bases, buffers }
	}
}

impl<'a> Receiver for BufferReceiver<'a> {
	fn receive(&mut self, path_index: usize, operation: &Operation) -> Result<(), ReceiveError> {
		let (base, signature) = self.bases.get(path_index).ok_or_else(|| ReceiveError::Protocol {
			message: format!("path index {} out of range", path_index),
		})?;
		let buffer = &mut self.buffers[path_index];
		self.engine.apply(buffer, base, signature, operation)?;
		Ok(())
	}

	fn finalize(&mut self) -> Result<(), ReceiveError> {
		Ok(())
	}
}


// vim: ts=4
