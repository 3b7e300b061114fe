//! Error types for synchronization operations

use std::error::Error;
use std::fmt;
use std::io;

use crate::endpoint::EndpointError;
use crate::hash::UnsupportedAlgorithm;
use crate::ignore::IgnoreError;
use crate::rsync::transmit::ReceiveError;
use crate::rsync::EngineError;
use crate::scan::ScanError;
use crate::snapshot::wire::WireError;
use crate::snapshot::InvalidSnapshot;
use crate::stage::StageError;
use crate::transition::TransitionError;
use crate::watch::WatchError;

/// Unified error type for engine operations.
///
/// Domain modules carry their own error enums; this type collects them for
/// surfaces (the serve entry point, library consumers) that need a single
/// error channel.
#[derive(Debug)]
pub enum SyncError {
	/// I/O error
	Io(io::Error),

	/// Snapshot structure violation
	Snapshot(InvalidSnapshot),

	/// Wire encoding or persistence failure
	Wire(WireError),

	/// Digest algorithm unavailable in this build
	UnsupportedAlgorithm(UnsupportedAlgorithm),

	/// Ignore pattern validation failure
	Ignore(IgnoreError),

	/// Scan failure
	Scan(ScanError),

	/// Delta engine failure
	Engine(EngineError),

	/// Delta receipt failure
	Receive(ReceiveError),

	/// Staging failure
	Stage(StageError),

	/// Transition failure
	Transition(TransitionError),

	/// Watcher failure
	Watch(WatchError),

	/// Endpoint operation failure
	Endpoint(EndpointError),

	/// Operation cancelled
	Cancelled,

	/// Generic error message
	Other { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Snapshot(e) => write!(f, "{}", e),
			SyncError::Wire(e) => write!(f, "{}", e),
			SyncError::UnsupportedAlgorithm(e) => write!(f, "{}", e),
			SyncError::Ignore(e) => write!(f, "{}", e),
			SyncError::Scan(e) => write!(f, "{}", e),
			SyncError::Engine(e) => write!(f, "{}", e),
			SyncError::Receive(e) => write!(f, "{}", e),
			SyncError::Stage(e) => write!(f, "{}", e),
			SyncError::Transition(e) => write!(f, "{}", e),
			SyncError::Watch(e) => write!(f, "{}", e),
			SyncError::Endpoint(e) => write!(f, "{}", e),
			SyncError::Cancelled => write!(f, "operation cancelled"),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<InvalidSnapshot> for SyncError {
	fn from(e: InvalidSnapshot) -> Self {
		SyncError::Snapshot(e)
	}
}

impl From<WireError> for SyncError {
	fn from(e: WireError) -> Self {
		SyncError::Wire(e)
	}
}

impl From<UnsupportedAlgorithm> for SyncError {
	fn from(e: UnsupportedAlgorithm) -> Self {
		SyncError::UnsupportedAlgorithm(e)
	}
}

impl From<IgnoreError> for SyncError {
	fn from(e: IgnoreError) -> Self {
		SyncError::Ignore(e)
	}
}

impl From<ScanError> for SyncError {
	fn from(e: ScanError) -> Self {
		match e {
			ScanError::Cancelled => SyncError::Cancelled,
			other => SyncError::Scan(other),
		}
	}
}

impl From<EngineError> for SyncError {
	fn from(e: EngineError) -> Self {
		SyncError::Engine(e)
	}
}

impl From<ReceiveError> for SyncError {
	fn from(e: ReceiveError) -> Self {
		SyncError::Receive(e)
	}
}

impl From<StageError> for SyncError {
	fn from(e: StageError) -> Self {
		SyncError::Stage(e)
	}
}

impl From<TransitionError> for SyncError {
	fn from(e: TransitionError) -> Self {
		match e {
			TransitionError::Cancelled => SyncError::Cancelled,
		}
	}
}

impl From<WatchError> for SyncError {
	fn from(e: WatchError) -> Self {
		SyncError::Watch(e)
	}
}

impl From<EndpointError> for SyncError {
	fn from(e: EndpointError) -> Self {
		match e {
			EndpointError::Cancelled => SyncError::Cancelled,
			other => SyncError::Endpoint(other),
		}
	}
}

impl From<String> for SyncError {
	fn from(message: String) -> Self {
		SyncError::Other { message }
	}
}


// vim: ts=4
