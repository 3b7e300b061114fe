//! Synchronization endpoints
//!
//! An endpoint owns one side's filesystem root and exposes the five
//! operations the controller drives: Poll, Scan, Stage, Supply, and
//! Transition. The local implementation runs against the filesystem
//! directly; the remote client speaks the compressed length-prefixed
//! protocol to a server wrapping a local implementation on the other side
//! of an agent transport.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::rsync::transmit::{ReceiveError, Receiver};
use crate::rsync::{EngineError, Operation, Signature, Transmission, WireOperation};
use crate::scan::ScanError;
use crate::snapshot::wire::WireError;
use crate::snapshot::{Change, Snapshot};
use crate::stage::StageError;
use crate::transition::TransitionError;

pub mod client;
pub mod framing;
pub mod local;
pub mod messages;
pub mod server;

pub use client::RemoteEndpoint;
pub use local::LocalEndpoint;
pub use messages::SessionParameters;
pub use crate::transition::TransitionOutcome;

use framing::{Encoder, FrameError};

/// Error surfaced by endpoint operations.
#[derive(Debug)]
pub enum EndpointError {
	Scan(ScanError),
	Stage(StageError),
	Transition(TransitionError),
	Receive(ReceiveError),
	Frame(FrameError),
	Engine(EngineError),
	Wire(WireError),
	Io(io::Error),

	/// The remote side reported a failure in a response.
	Remote { message: String },

	/// The peer violated the protocol.
	Protocol { message: String },

	Cancelled,
}

impl std::fmt::Display for EndpointError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			EndpointError::Scan(e) => write!(f, "scan failed: {}", e),
			EndpointError::Stage(e) => write!(f, "staging failed: {}", e),
			EndpointError::Transition(e) => write!(f, "transition failed: {}", e),
			EndpointError::Receive(e) => write!(f, "{}", e),
			EndpointError::Frame(e) => write!(f, "{}", e),
			EndpointError::Engine(e) => write!(f, "{}", e),
			EndpointError::Wire(e) => write!(f, "{}", e),
			EndpointError::Io(e) => write!(f, "I/O error: {}", e),
			EndpointError::Remote { message } => write!(f, "remote endpoint failed: {}", message),
			EndpointError::Protocol { message } => write!(f, "protocol violation: {}", message),
			EndpointError::Cancelled => write!(f, "operation cancelled"),
		}
	}
}

impl std::error::Error for EndpointError {}

impl From<ScanError> for EndpointError {
	fn from(e: ScanError) -> Self {
		match e {
			ScanError::Cancelled => EndpointError::Cancelled,
			other => EndpointError::Scan(other),
		}
	}
}

impl From<StageError> for EndpointError {
	fn from(e: StageError) -> Self {
		EndpointError::Stage(e)
	}
}

impl From<TransitionError> for EndpointError {
	fn from(e: TransitionError) -> Self {
		match e {
			TransitionError::Cancelled => EndpointError::Cancelled,
		}
	}
}

impl From<ReceiveError> for EndpointError {
	fn from(e: ReceiveError) -> Self {
		EndpointError::Receive(e)
	}
}

impl From<FrameError> for EndpointError {
	fn from(e: FrameError) -> Self {
		EndpointError::Frame(e)
	}
}

impl From<EngineError> for EndpointError {
	fn from(e: EngineError) -> Self {
		EndpointError::Engine(e)
	}
}

impl From<WireError> for EndpointError {
	fn from(e: WireError) -> Self {
		EndpointError::Wire(e)
	}
}

impl From<io::Error> for EndpointError {
	fn from(e: io::Error) -> Self {
		EndpointError::Io(e)
	}
}

/// Result of a scan operation.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
	pub snapshot: Snapshot,

	pub preserves_executability: bool,

	/// Transient condition; the controller should reschedule the scan.
	pub try_again: bool,
}

/// Result of a staging request: the paths still needing transfer with their
/// base signatures, and the receiver into which the controller pumps deltas
/// from the supplying side.
pub struct StageOutcome {
	pub paths: Vec<String>,
	pub signatures: Vec<Signature>,
	pub receiver: Option<Box<dyn Receiver>>,
}

/// One side of a synchronization session.
#[async_trait]
pub trait Endpoint: Send {
	/// Block until changes are likely present (or the token cancels).
	async fn poll(&mut self, token: &CancellationToken) -> Result<(), EndpointError>;

	/// Produce a snapshot of the root. `full` forces a cold walk.
	async fn scan(&mut self, token: &CancellationToken, full: bool)
		-> Result<ScanOutcome, EndpointError>;

	/// Prepare to receive content for the given paths and digests.
	async fn stage(
		&mut self,
		paths: Vec<String>,
		digests: Vec<Vec<u8>>,
	) -> Result<StageOutcome, EndpointError>;

	/// Stream deltas for the given paths into a receiver, finalizing it.
	async fn supply(
		&mut self,
		paths: Vec<String>,
		signatures: Vec<Signature>,
		receiver: Box<dyn Receiver>,
	) -> Result<(), EndpointError>;

	/// Apply reconciled changes to the root.
	async fn transition(
		&mut self,
		token: &CancellationToken,
		changes: Vec<Change>,
	) -> Result<TransitionOutcome, EndpointError>;
}

/// Shared write half of a control stream.
pub(crate) type SharedEncoder = Arc<Mutex<Encoder<Box<dyn io::Write + Send>>>>;

/// Receiver that forwards operations over a control stream as transmission
/// messages, flushing at path boundaries and on finalization.
pub(crate) struct TransmissionSender {
	encoder: SharedEncoder,
	current_path: Option<u64>,
}

impl TransmissionSender {
	pub(crate) fn new(encoder: SharedEncoder) -> Self {
		TransmissionSender { encoder, current_path: None }
	}
}

impl Receiver for TransmissionSender {
	fn receive(&mut self, path_index: usize, operation: &Operation) -> Result<(), ReceiveError> {
		let mut encoder = self.encoder.lock().unwrap();
		if self.current_path != Some(path_index as u64) {
			if self.current_path.is_some() {
				// Path boundary: make the previous batch visible.
				encoder
					.flush()
					.map_err(|e| ReceiveError::Protocol { message: e.to_string() })?;
			}
			self.current_path = Some(path_index as u64);
		}
		encoder
			.encode(&Transmission {
				path_index: path_index as u64,
				operation: Some(WireOperation::from(operation)),
				done: false,
			})
			.map_err(|e| ReceiveError::Protocol { message: e.to_string() })
	}

	fn finalize(&mut self) -> Result<(), ReceiveError> {
		let mut encoder = self.encoder.lock().unwrap();
		encoder
			.encode(&Transmission { path_index: 0, operation: None, done: true })
			.and_then(|_| encoder.flush())
			.map_err(|e| ReceiveError::Protocol { message: e.to_string() })
	}
}

// vim: ts=4
