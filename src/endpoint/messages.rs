//! Endpoint protocol messages
//!
//! Length-prefixed Protocol Buffers messages exchanged over the compressed
//! control stream. Field numbers are fixed; both sides must agree on the
//! protocol version carried in the initialize handshake.

use prost::Message;

use crate::hash::Algorithm;
use crate::ignore::Dialect;
use crate::reconcile::SynchronizationMode;
use crate::rsync::{WireOperation, WireSignature};
use crate::scan::{PermissionsMode, SymlinkMode};
use crate::snapshot::wire::WireEntry;
use crate::snapshot::{Change, Entry, Problem};

/// Protocol version expected by both sides of the control stream.
pub const PROTOCOL_VERSION: u32 = 1;

/// Session parameters resolved from a wire configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionParameters {
	pub synchronization_mode: SynchronizationMode,
	pub symlink_mode: SymlinkMode,
	pub permissions_mode: PermissionsMode,
	pub ignore_dialect: Dialect,
	pub ignores: Vec<String>,
	pub digest: Algorithm,
	pub ignore_vcs: bool,
}

impl Default for SessionParameters {
	fn default() -> Self {
		SessionParameters {
			synchronization_mode: SynchronizationMode::default(),
			symlink_mode: SymlinkMode::default(),
			permissions_mode: PermissionsMode::default(),
			ignore_dialect: Dialect::default(),
			ignores: Vec::new(),
			digest: Algorithm::default(),
			ignore_vcs: true,
		}
	}
}

#[derive(Clone, PartialEq, Message)]
pub struct Configuration {
	#[prost(string, tag = "1")]
	pub synchronization_mode: String,

	#[prost(string, tag = "2")]
	pub symlink_mode: String,

	#[prost(string, tag = "3")]
	pub permissions_mode: String,

	#[prost(string, tag = "4")]
	pub ignore_dialect: String,

	#[prost(string, repeated, tag = "5")]
	pub ignores: Vec<String>,

	#[prost(string, tag = "6")]
	pub digest: String,

	#[prost(bool, tag = "7")]
	pub ignore_vcs: bool,
}

impl From<&SessionParameters> for Configuration {
	fn from(parameters: &SessionParameters) -> Self {
		Configuration {
			synchronization_mode: parameters.synchronization_mode.name().to_string(),
			symlink_mode: parameters.symlink_mode.name().to_string(),
			permissions_mode: parameters.permissions_mode.name().to_string(),
			ignore_dialect: parameters.ignore_dialect.name().to_string(),
			ignores: parameters.ignores.clone(),
			digest: parameters.digest.name().to_string(),
			ignore_vcs: parameters.ignore_vcs,
		}
	}
}

impl Configuration {
	/// Resolve into session parameters, rejecting unknown names.
	pub fn resolve(&self) -> Result<SessionParameters, String> {
		Ok(SessionParameters {
			synchronization_mode: SynchronizationMode::from_name(&self.synchronization_mode)
				.ok_or_else(|| format!("unknown synchronization mode: {:?}", self.synchronization_mode))?,
			symlink_mode: SymlinkMode::from_name(&self.symlink_mode)
				.ok_or_else(|| format!("unknown symbolic link mode: {:?}", self.symlink_mode))?,
			permissions_mode: PermissionsMode::from_name(&self.permissions_mode)
				.ok_or_else(|| format!("unknown permissions mode: {:?}", self.permissions_mode))?,
			ignore_dialect: Dialect::from_name(&self.ignore_dialect)
				.ok_or_else(|| format!("unknown ignore dialect: {:?}", self.ignore_dialect))?,
			ignores: self.ignores.clone(),
			digest: Algorithm::from_name(&self.digest)
				.ok_or_else(|| format!("unknown digest algorithm: {:?}", self.digest))?,
			ignore_vcs: self.ignore_vcs,
		})
	}
}

#[derive(Clone, PartialEq, Message)]
pub struct InitializeSynchronizationRequest {
	#[prost(string, tag = "1")]
	pub session: String,

	#[prost(uint32, tag = "2")]
	pub version: u32,

	#[prost(message, optional, tag = "3")]
	pub configuration: Option<Configuration>,

	#[prost(string, tag = "4")]
	pub root: String,

	#[prost(bool, tag = "5")]
	pub alpha: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct InitializeSynchronizationResponse {
	#[prost(string, tag = "1")]
	pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PollRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct PollCompletionRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct PollResponse {
	#[prost(string, tag = "1")]
	pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ScanRequest {
	#[prost(message, optional, tag = "1")]
	pub baseline_snapshot_signature: Option<WireSignature>,

	#[prost(bool, tag = "2")]
	pub full: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ScanCompletionRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct ScanResponse {
	/// Delta from the client's baseline to the current serialized snapshot.
	#[prost(message, repeated, tag = "1")]
	pub snapshot_delta: Vec<WireOperation>,

	#[prost(string, tag = "2")]
	pub error: String,

	#[prost(bool, tag = "3")]
	pub try_again: bool,

	#[prost(bool, tag = "4")]
	pub preserves_executability: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct StageRequest {
	#[prost(string, repeated, tag = "1")]
	pub paths: Vec<String>,

	#[prost(bytes = "vec", repeated, tag = "2")]
	pub digests: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StageResponse {
	#[prost(string, repeated, tag = "1")]
	pub paths: Vec<String>,

	#[prost(message, repeated, tag = "2")]
	pub signatures: Vec<WireSignature>,

	#[prost(string, tag = "3")]
	pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SupplyRequest {
	#[prost(string, repeated, tag = "1")]
	pub paths: Vec<String>,

	#[prost(message, repeated, tag = "2")]
	pub signatures: Vec<WireSignature>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireChange {
	#[prost(string, tag = "1")]
	pub path: String,

	#[prost(message, optional, tag = "2")]
	pub old: Option<WireEntry>,

	#[prost(message, optional, tag = "3")]
	pub new: Option<WireEntry>,
}

impl From<&Change> for WireChange {
	fn from(change: &Change) -> Self {
		WireChange {
			path: change.path.clone(),
			old: change.old.as_ref().map(WireEntry::from),
			new: change.new.as_ref().map(WireEntry::from),
		}
	}
}

impl TryFrom<&WireChange> for Change {
	type Error = crate::snapshot::wire::WireError;

	fn try_from(wire: &WireChange) -> Result<Change, Self::Error> {
		Ok(Change {
			path: wire.path.clone(),
			old: wire.old.as_ref().map(Entry::try_from).transpose()?,
			new: wire.new.as_ref().map(Entry::try_from).transpose()?,
		})
	}
}

#[derive(Clone, PartialEq, Message)]
pub struct WireProblem {
	#[prost(string, tag = "1")]
	pub path: String,

	#[prost(string, tag = "2")]
	pub error: String,
}

impl From<&Problem> for WireProblem {
	fn from(problem: &Problem) -> Self {
		WireProblem { path: problem.path.clone(), error: problem.error.clone() }
	}
}

impl From<&WireProblem> for Problem {
	fn from(wire: &WireProblem) -> Self {
		Problem { path: wire.path.clone(), error: wire.error.clone() }
	}
}

/// Holder for an optional per-change result entry; protobuf repeated fields
/// cannot carry nulls directly.
#[derive(Clone, PartialEq, Message)]
pub struct WireResult {
	#[prost(message, optional, tag = "1")]
	pub entry: Option<WireEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransitionRequest {
	#[prost(message, repeated, tag = "1")]
	pub transitions: Vec<WireChange>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransitionCompletionRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct TransitionResponse {
	#[prost(message, repeated, tag = "1")]
	pub results: Vec<WireResult>,

	#[prost(message, repeated, tag = "2")]
	pub problems: Vec<WireProblem>,

	#[prost(bool, tag = "3")]
	pub stager_missing_files: bool,

	#[prost(string, tag = "4")]
	pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct EndpointRequest {
	#[prost(oneof = "endpoint_request::Kind", tags = "1, 2, 3, 4, 5")]
	pub kind: Option<endpoint_request::Kind>,
}

pub mod endpoint_request {
	use super::*;

	#[derive(Clone, PartialEq, prost::Oneof)]
	pub enum Kind {
		#[prost(message, tag = "1")]
		Poll(PollRequest),

		#[prost(message, tag = "2")]
		Scan(ScanRequest),

		#[prost(message, tag = "3")]
		Stage(StageRequest),

		#[prost(message, tag = "4")]
		Supply(SupplyRequest),

		#[prost(message, tag = "5")]
		Transition(TransitionRequest),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_configuration_round_trip() {
		let parameters = SessionParameters {
			ignores: vec!["*.log".to_string()],
			..Default::default()
		};
		let configuration = Configuration::from(&parameters);
		assert_eq!(configuration.resolve().unwrap(), parameters);
	}

	#[test]
	fn test_configuration_rejects_unknown_names() {
		let mut configuration = Configuration::from(&SessionParameters::default());
		configuration.digest = "crc32".to_string();
		assert!(configuration.resolve().is_err());
	}

	#[test]
	fn test_endpoint_request_oneof_round_trip() {
		let request = EndpointRequest {
			kind: Some(endpoint_request::Kind::Scan(ScanRequest {
				baseline_snapshot_signature: None,
				full: true,
			})),
		};
		let decoded = EndpointRequest::decode(request.encode_to_vec().as_slice()).unwrap();
		assert_eq!(decoded, request);
	}

	#[test]
	fn test_change_conversion_round_trip() {
		let change = Change::new(
			"sub/file.txt",
			None,
			Some(Entry::File { digest: vec![1, 2, 3], executable: true }),
		);
		let wire = WireChange::from(&change);
		assert_eq!(Change::try_from(&wire).unwrap(), change);
	}
}

// vim: ts=4
