//! Remote endpoint server
//!
//! Wraps a local endpoint behind the control stream protocol. After the
//! initialize handshake the server processes requests strictly in arrival
//! order, one at a time; long-running requests race their operation against
//! the paired completion message and always send a response so the client
//! can drain the stream.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::logging::*;
use crate::rsync::{Engine, Operation, Signature, Transmission};
use crate::snapshot::wire::encode_snapshot;
use crate::snapshot::Change;

use super::framing::{Decoder, Encoder, FrameError};
use super::messages::{
	endpoint_request, EndpointRequest, InitializeSynchronizationRequest,
	InitializeSynchronizationResponse, PollCompletionRequest, PollResponse,
	ScanCompletionRequest, ScanRequest, ScanResponse, StageRequest, StageResponse, SupplyRequest,
	TransitionCompletionRequest, TransitionRequest, TransitionResponse, WireResult,
	PROTOCOL_VERSION,
};
use super::{
	Endpoint, EndpointError, LocalEndpoint, SharedEncoder, TransmissionSender,
};

/// Serve one synchronization session over a control stream.
///
/// Endpoint state (scan cache, staging) is kept under `state_root`, in a
/// per-session subdirectory derived from the handshake.
pub async fn serve(
	reader: Box<dyn Read + Send>,
	writer: Box<dyn Write + Send>,
	state_root: PathBuf,
	token: CancellationToken,
) -> Result<(), EndpointError> {
	let encoder: SharedEncoder = Arc::new(Mutex::new(Encoder::new(writer)));
	let mut decoder = Some(Decoder::new(reader));

	// Handshake: build the endpoint or report why we cannot.
	let request: InitializeSynchronizationRequest = read(&mut decoder).await?;
	let endpoint = initialize(&request, &state_root);
	let mut endpoint = match endpoint {
		Ok(endpoint) => {
			send(&encoder, &InitializeSynchronizationResponse { error: String::new() })?;
			endpoint
		}
		Err(message) => {
			warn!(session = %request.session, error = %message, "refusing session");
			send(&encoder, &InitializeSynchronizationResponse { error: message })?;
			return Ok(());
		}
	};
	info!(session = %request.session, root = %request.root, "session initialized");

	loop {
		if token.is_cancelled() {
			return Ok(());
		}
		let request: EndpointRequest = match read(&mut decoder).await {
			Ok(request) => request,
			Err(EndpointError::Frame(FrameError::Closed)) => {
				debug!("control stream closed; terminating session");
				return Ok(());
			}
			Err(e) => return Err(e),
		};
		let Some(kind) = request.kind else {
			return Err(EndpointError::Protocol { message: "empty endpoint request".into() });
		};

		match kind {
			endpoint_request::Kind::Poll(_) => {
				serve_poll(&mut endpoint, &encoder, &mut decoder, &token).await?;
			}
			endpoint_request::Kind::Scan(request) => {
				serve_scan(&mut endpoint, &encoder, &mut decoder, &token, request).await?;
			}
			endpoint_request::Kind::Stage(request) => {
				serve_stage(&mut endpoint, &encoder, &mut decoder, request).await?;
			}
			endpoint_request::Kind::Supply(request) => {
				serve_supply(&mut endpoint, &encoder, request).await?;
			}
			endpoint_request::Kind::Transition(request) => {
				serve_transition(&mut endpoint, &encoder, &mut decoder, &token, request).await?;
			}
		}
	}
}

fn initialize(
	request: &InitializeSynchronizationRequest,
	state_root: &std::path::Path,
) -> Result<LocalEndpoint, String> {
	if request.version != PROTOCOL_VERSION {
		return Err(format!(
			"protocol version mismatch: client {}, server {}",
			request.version, PROTOCOL_VERSION
		));
	}
	if request.session.is_empty() {
		return Err("empty session identifier".to_string());
	}
	if request.root.is_empty() {
		return Err("empty synchronization root".to_string());
	}
	let parameters = request
		.configuration
		.as_ref()
		.ok_or_else(|| "missing configuration".to_string())?
		.resolve()?;
	if !parameters.digest.supported() {
		return Err(format!(
			"digest algorithm {} is not supported by this build",
			parameters.digest.name()
		));
	}

	let side = if request.alpha { "alpha" } else { "beta" };
	let state = state_root.join(format!("{}-{}", sanitize(&request.session), side));
	LocalEndpoint::new(&PathBuf::from(&request.root), &state, parameters)
		.map_err(|e| e.to_string())
}

/// Session identifiers become directory names; keep them tame.
fn sanitize(session: &str) -> String {
	session
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
		.collect()
}

fn send<M: Message>(encoder: &SharedEncoder, message: &M) -> Result<(), EndpointError> {
	Ok(encoder.lock().unwrap().send(message)?)
}

type TakenDecoder = Option<Decoder<Box<dyn Read + Send>>>;

async fn read<M>(decoder: &mut TakenDecoder) -> Result<M, EndpointError>
where
	M: Message + Default + 'static,
{
	let mut taken = decoder
		.take()
		.ok_or(EndpointError::Protocol { message: "control stream already failed".into() })?;
	let (taken, result) = tokio::task::spawn_blocking(move || {
		let result = taken.decode::<M>();
		(taken, result)
	})
	.await
	.map_err(|e| EndpointError::Protocol { message: format!("read task failed: {}", e) })?;
	*decoder = Some(taken);
	Ok(result?)
}

/// Run a long operation while listening for its paired completion message,
/// cancelling the operation when the completion arrives first. Evaluates to
/// the operation result plus the pending completion state; the caller must
/// send its response and then settle the completion with
/// `settle_completion`, in that order, because the client only sends the
/// completion after the response when it has not cancelled.
macro_rules! race_completion {
	($decoder:expr, $completion:ty, $token:expr, $operation:expr) => {{
		let taken = $decoder
			.take()
			.ok_or(EndpointError::Protocol { message: "control stream already failed".into() })?;
		let mut completion_task = tokio::task::spawn_blocking(move || {
			let mut taken = taken;
			let result = taken.decode::<$completion>();
			(taken, result)
		});
		let operation_token: CancellationToken = $token;
		let operation = $operation;
		tokio::pin!(operation);

		let mut completion_joined = None;
		let result = tokio::select! {
			result = &mut operation => result,
			joined = &mut completion_task => {
				completion_joined = Some(joined);
				operation_token.cancel();
				operation.await
			}
		};
		(result, completion_joined, completion_task)
	}};
}

type CompletionJoin<C> = Result<
	(Decoder<Box<dyn Read + Send>>, Result<C, FrameError>),
	tokio::task::JoinError,
>;

/// Consume the one completion message paired with a long request, restoring
/// the decoder for the next request. Must run after the response was sent.
async fn settle_completion<C>(
	decoder: &mut TakenDecoder,
	joined: Option<CompletionJoin<C>>,
	task: tokio::task::JoinHandle<(Decoder<Box<dyn Read + Send>>, Result<C, FrameError>)>,
) -> Result<(), EndpointError> {
	let joined = match joined {
		Some(joined) => joined,
		None => task.await,
	};
	let (taken, completion_result) = joined.map_err(|e| EndpointError::Protocol {
		message: format!("completion read task failed: {}", e),
	})?;
	*decoder = Some(taken);
	completion_result?;
	Ok(())
}

async fn serve_poll(
	endpoint: &mut LocalEndpoint,
	encoder: &SharedEncoder,
	decoder: &mut TakenDecoder,
	token: &CancellationToken,
) -> Result<(), EndpointError> {
	let operation_token = token.child_token();
	let (result, joined, task) = race_completion!(
		decoder,
		PollCompletionRequest,
		operation_token.clone(),
		endpoint.poll(&operation_token)
	);
	let error = match result {
		Ok(()) => String::new(),
		Err(e) => e.to_string(),
	};
	send(encoder, &PollResponse { error })?;
	settle_completion(decoder, joined, task).await
}

async fn serve_scan(
	endpoint: &mut LocalEndpoint,
	encoder: &SharedEncoder,
	decoder: &mut TakenDecoder,
	token: &CancellationToken,
	request: ScanRequest,
) -> Result<(), EndpointError> {
	let operation_token = token.child_token();
	let (result, joined, task) = race_completion!(
		decoder,
		ScanCompletionRequest,
		operation_token.clone(),
		endpoint.scan(&operation_token, request.full)
	);

	let response = match result {
		Ok(outcome) => {
			let baseline_signature = request
				.baseline_snapshot_signature
				.as_ref()
				.map(Signature::from)
				.unwrap_or_default();
			let serialized = encode_snapshot(&outcome.snapshot);
			let engine = Engine::default();
			match baseline_signature
				.ensure_valid()
				.and_then(|_| engine.delta(&serialized, &baseline_signature))
			{
				Ok(delta) => ScanResponse {
					snapshot_delta: delta.iter().map(Into::into).collect(),
					error: String::new(),
					try_again: outcome.try_again,
					preserves_executability: outcome.preserves_executability,
				},
				Err(e) => ScanResponse {
					snapshot_delta: Vec::new(),
					error: e.to_string(),
					try_again: false,
					preserves_executability: false,
				},
			}
		}
		Err(EndpointError::Cancelled) => ScanResponse {
			snapshot_delta: Vec::new(),
			error: EndpointError::Cancelled.to_string(),
			try_again: false,
			preserves_executability: false,
		},
		Err(e) => ScanResponse {
			snapshot_delta: Vec::new(),
			error: e.to_string(),
			try_again: false,
			preserves_executability: false,
		},
	};
	send(encoder, &response)?;
	settle_completion(decoder, joined, task).await
}

async fn serve_stage(
	endpoint: &mut LocalEndpoint,
	encoder: &SharedEncoder,
	decoder: &mut TakenDecoder,
	request: StageRequest,
) -> Result<(), EndpointError> {
	let requested_paths = request.paths.clone();
	let outcome = match endpoint.stage(request.paths, request.digests).await {
		Ok(outcome) => outcome,
		Err(e) => {
			return send(encoder, &StageResponse {
				paths: Vec::new(),
				signatures: Vec::new(),
				error: e.to_string(),
			});
		}
	};

	// When every requested path needs transfer, elide the path list; a
	// non-empty signature list with no paths means "all".
	let response_paths =
		if outcome.paths == requested_paths { Vec::new() } else { outcome.paths.clone() };
	send(encoder, &StageResponse {
		paths: response_paths,
		signatures: outcome.signatures.iter().map(Into::into).collect(),
		error: String::new(),
	})?;

	// Nothing to transfer: the request was fully deduplicated.
	let Some(mut receiver) = outcome.receiver else {
		return Ok(());
	};

	// Drain the client's transmission stream into the stager.
	let taken = decoder
		.take()
		.ok_or(EndpointError::Protocol { message: "control stream already failed".into() })?;
	let (taken, result) = tokio::task::spawn_blocking(move || {
		let mut taken = taken;
		let mut result = Ok(());
		loop {
			let transmission: Transmission = match taken.decode() {
				Ok(transmission) => transmission,
				Err(e) => {
					result = Err(EndpointError::Frame(e));
					break;
				}
			};
			if transmission.done {
				if let Err(e) = receiver.finalize() {
					result = Err(e.into());
				}
				break;
			}
			let operation = match transmission
				.operation
				.as_ref()
				.ok_or_else(|| EndpointError::Protocol {
					message: "transmission without operation".into(),
				})
				.and_then(|wire| Operation::try_from(wire).map_err(Into::into))
			{
				Ok(operation) => operation,
				Err(e) => {
					result = Err(e);
					break;
				}
			};
			if let Err(e) = receiver.receive(transmission.path_index as usize, &operation) {
				result = Err(e.into());
				break;
			}
		}
		(taken, result)
	})
	.await
	.map_err(|e| EndpointError::Protocol { message: format!("stage drain task failed: {}", e) })?;
	*decoder = Some(taken);
	result
}

async fn serve_supply(
	endpoint: &mut LocalEndpoint,
	encoder: &SharedEncoder,
	request: SupplyRequest,
) -> Result<(), EndpointError> {
	let signatures: Vec<Signature> = request.signatures.iter().map(Signature::from).collect();
	let sender = TransmissionSender::new(encoder.clone());
	// Supply finalizes the sender, which emits the terminating transmission
	// and flushes; failures after this point would poison the stream, so
	// they propagate as fatal.
	endpoint.supply(request.paths, signatures, Box::new(sender)).await
}

async fn serve_transition(
	endpoint: &mut LocalEndpoint,
	encoder: &SharedEncoder,
	decoder: &mut TakenDecoder,
	token: &CancellationToken,
	request: TransitionRequest,
) -> Result<(), EndpointError> {
	let changes = request
		.transitions
		.iter()
		.map(Change::try_from)
		.collect::<Result<Vec<_>, _>>();
	let changes = match changes {
		Ok(changes) => changes,
		Err(e) => {
			// Malformed change trees are a protocol-level failure, but the
			// completion pairing still has to run its course.
			let operation_token = token.child_token();
			let (_, joined, task) = race_completion!(
				decoder,
				TransitionCompletionRequest,
				operation_token.clone(),
				std::future::ready(Ok::<(), EndpointError>(()))
			);
			send(encoder, &TransitionResponse {
				results: Vec::new(),
				problems: Vec::new(),
				stager_missing_files: false,
				error: e.to_string(),
			})?;
			return settle_completion(decoder, joined, task).await;
		}
	};

	let operation_token = token.child_token();
	let (result, joined, task) = race_completion!(
		decoder,
		TransitionCompletionRequest,
		operation_token.clone(),
		endpoint.transition(&operation_token, changes)
	);

	let response = match result {
		Ok(outcome) => TransitionResponse {
			results: outcome
				.results
				.iter()
				.map(|entry| WireResult { entry: entry.as_ref().map(Into::into) })
				.collect(),
			problems: outcome.problems.iter().map(Into::into).collect(),
			stager_missing_files: outcome.stager_missing_files,
			error: String::new(),
		},
		Err(e) => TransitionResponse {
			results: Vec::new(),
			problems: Vec::new(),
			stager_missing_files: false,
			error: e.to_string(),
		},
	};
	send(encoder, &response)?;
	settle_completion(decoder, joined, task).await
}

// vim: ts=4
