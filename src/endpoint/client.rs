//! Remote endpoint client
//!
//! Drives a remote endpoint server over a bidirectional byte stream supplied
//! by the transport. Requests are processed strictly in send order with one
//! in flight; long-running requests (Poll, Scan, Transition) are paired with
//! a completion message that the client sends either when its token cancels
//! or after the response arrives, so the server always consumes exactly one
//! completion and always sends a response.
//!
//! Scans are differential: the client sends an rsync signature of the last
//! snapshot it received and patches the returned delta. The baseline is only
//! replaced by non-empty snapshots so empty endpoints cannot poison it.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::logging::*;
use crate::rsync::transmit::Receiver;
use crate::rsync::{Engine, Operation, Signature, Transmission, WireSignature};
use crate::snapshot::wire::{decode_snapshot, encode_snapshot};
use crate::snapshot::{Change, Entry, Snapshot};

use super::framing::{Decoder, Encoder};
use super::messages::{
	endpoint_request, Configuration, EndpointRequest, InitializeSynchronizationRequest,
	InitializeSynchronizationResponse, PollCompletionRequest, PollRequest, PollResponse,
	ScanCompletionRequest, ScanRequest, ScanResponse, SessionParameters, StageRequest,
	StageResponse, SupplyRequest, TransitionCompletionRequest, TransitionRequest,
	TransitionResponse, PROTOCOL_VERSION,
};
use super::{
	Endpoint, EndpointError, ScanOutcome, SharedEncoder, StageOutcome, TransmissionSender,
	TransitionOutcome,
};

pub struct RemoteEndpoint {
	encoder: SharedEncoder,
	decoder: Option<Decoder<Box<dyn Read + Send>>>,
	engine: Engine,

	/// Serialized form of the last non-empty snapshot received.
	baseline: Vec<u8>,
}

impl RemoteEndpoint {
	/// Perform the initialize handshake over a fresh control stream.
	pub async fn connect(
		reader: Box<dyn Read + Send>,
		writer: Box<dyn Write + Send>,
		session: &str,
		root: &str,
		alpha: bool,
		parameters: &SessionParameters,
	) -> Result<RemoteEndpoint, EndpointError> {
		let encoder: SharedEncoder = Arc::new(Mutex::new(Encoder::new(writer)));
		encoder.lock().unwrap().send(&InitializeSynchronizationRequest {
			session: session.to_string(),
			version: PROTOCOL_VERSION,
			configuration: Some(Configuration::from(parameters)),
			root: root.to_string(),
			alpha,
		})?;

		let mut decoder = Decoder::new(reader);
		let (decoder, response) = tokio::task::spawn_blocking(move || {
			let response = decoder.decode::<InitializeSynchronizationResponse>();
			(decoder, response)
		})
		.await
		.map_err(|e| EndpointError::Protocol { message: format!("handshake task failed: {}", e) })?;
		let response = response?;
		if !response.error.is_empty() {
			return Err(EndpointError::Remote { message: response.error });
		}

		Ok(RemoteEndpoint {
			encoder,
			decoder: Some(decoder),
			// Snapshot transport always uses the default engine; both sides
			// must agree on the strong hash for block matching to work.
			engine: Engine::default(),
			baseline: encode_snapshot(&Snapshot::default()),
		})
	}

	/// Seed the differential-scan baseline, typically with the session's
	/// ancestor-derived snapshot so the first scan is already differential.
	pub fn set_baseline(&mut self, snapshot: &Snapshot) {
		self.baseline = encode_snapshot(snapshot);
	}

	fn send<M: Message>(&self, message: &M) -> Result<(), EndpointError> {
		Ok(self.encoder.lock().unwrap().send(message)?)
	}

	fn take_decoder(&mut self) -> Result<Decoder<Box<dyn Read + Send>>, EndpointError> {
		self.decoder.take().ok_or(EndpointError::Protocol {
			message: "control stream already failed".to_string(),
		})
	}

	/// Read one response of a long-running request, sending the paired
	/// completion on cancellation (and after the response otherwise).
	async fn read_raced<M, C>(
		&mut self,
		token: &CancellationToken,
		completion: C,
	) -> Result<M, EndpointError>
	where
		M: Message + Default + 'static,
		C: Message,
	{
		let mut decoder = self.take_decoder()?;
		let mut read_task = tokio::task::spawn_blocking(move || {
			let response = decoder.decode::<M>();
			(decoder, response)
		});

		let mut completion_sent = false;
		let (decoder, response) = loop {
			tokio::select! {
				joined = &mut read_task => {
					break joined.map_err(|e| EndpointError::Protocol {
						message: format!("response read task failed: {}", e),
					})?;
				}
				_ = token.cancelled(), if !completion_sent => {
					trace!("cancellation observed; sending completion");
					self.send(&completion)?;
					completion_sent = true;
				}
			}
		};
		self.decoder = Some(decoder);
		let response = response?;
		if !completion_sent {
			self.send(&completion)?;
		}
		Ok(response)
	}

	/// Read one ordinary response.
	async fn read<M>(&mut self) -> Result<M, EndpointError>
	where
		M: Message + Default + 'static,
	{
		let mut decoder = self.take_decoder()?;
		let (decoder, response) = tokio::task::spawn_blocking(move || {
			let response = decoder.decode::<M>();
			(decoder, response)
		})
		.await
		.map_err(|e| EndpointError::Protocol {
			message: format!("response read task failed: {}", e),
		})?;
		self.decoder = Some(decoder);
		Ok(response?)
	}
}

#[async_trait]
impl Endpoint for RemoteEndpoint {
	async fn poll(&mut self, token: &CancellationToken) -> Result<(), EndpointError> {
		self.send(&EndpointRequest {
			kind: Some(endpoint_request::Kind::Poll(PollRequest {})),
		})?;
		let response: PollResponse =
			self.read_raced(token, PollCompletionRequest {}).await?;
		if !response.error.is_empty() {
			return Err(EndpointError::Remote { message: response.error });
		}
		Ok(())
	}

	async fn scan(
		&mut self,
		token: &CancellationToken,
		full: bool,
	) -> Result<ScanOutcome, EndpointError> {
		let signature = self.engine.signature(&self.baseline, 0)?;
		self.send(&EndpointRequest {
			kind: Some(endpoint_request::Kind::Scan(ScanRequest {
				baseline_snapshot_signature: Some(WireSignature::from(&signature)),
				full,
			})),
		})?;

		let response: ScanResponse =
			self.read_raced(token, ScanCompletionRequest {}).await?;
		if response.try_again {
			return Ok(ScanOutcome {
				snapshot: Snapshot::default(),
				preserves_executability: response.preserves_executability,
				try_again: true,
			});
		}
		if !response.error.is_empty() {
			return Err(EndpointError::Remote { message: response.error });
		}

		let delta = response
			.snapshot_delta
			.iter()
			.map(Operation::try_from)
			.collect::<Result<Vec<_>, _>>()?;
		let patched = self.engine.patch(&self.baseline, &signature, &delta)?;
		let snapshot = decode_snapshot(&patched)?;
		// Empty endpoints must not poison the baseline.
		if !snapshot.is_empty() {
			self.baseline = patched;
		}
		Ok(ScanOutcome {
			snapshot,
			preserves_executability: response.preserves_executability,
			try_again: false,
		})
	}

	async fn stage(
		&mut self,
		paths: Vec<String>,
		digests: Vec<Vec<u8>>,
	) -> Result<StageOutcome, EndpointError> {
		let requested_paths = paths.clone();
		self.send(&EndpointRequest {
			kind: Some(endpoint_request::Kind::Stage(StageRequest { paths, digests })),
		})?;

		let response: StageResponse = self.read().await?;
		if !response.error.is_empty() {
			return Err(EndpointError::Remote { message: response.error });
		}
		let signatures: Vec<Signature> =
			response.signatures.iter().map(Signature::from).collect();
		if signatures.is_empty() {
			return Ok(StageOutcome { paths: Vec::new(), signatures: Vec::new(), receiver: None });
		}
		// Empty paths with non-empty signatures means every requested path.
		let needed_paths =
			if response.paths.is_empty() { requested_paths } else { response.paths };
		if needed_paths.len() != signatures.len() {
			return Err(EndpointError::Protocol {
				message: format!(
					"stage response with {} paths but {} signatures",
					needed_paths.len(),
					signatures.len()
				),
			});
		}

		Ok(StageOutcome {
			paths: needed_paths,
			signatures,
			receiver: Some(Box::new(TransmissionSender::new(self.encoder.clone()))),
		})
	}

	async fn supply(
		&mut self,
		paths: Vec<String>,
		signatures: Vec<Signature>,
		mut receiver: Box<dyn Receiver>,
	) -> Result<(), EndpointError> {
		self.send(&EndpointRequest {
			kind: Some(endpoint_request::Kind::Supply(SupplyRequest {
				paths,
				signatures: signatures.iter().map(WireSignature::from).collect(),
			})),
		})?;

		let mut decoder = self.take_decoder()?;
		let (decoder, result) = tokio::task::spawn_blocking(move || {
			let mut result = Ok(());
			loop {
				let transmission: Transmission = match decoder.decode() {
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
				let Some(wire_operation) = &transmission.operation else {
					result = Err(EndpointError::Protocol {
						message: "transmission without operation".to_string(),
					});
					break;
				};
				let operation = match Operation::try_from(wire_operation) {
					Ok(operation) => operation,
					Err(e) => {
						result = Err(e.into());
						break;
					}
				};
				if let Err(e) =
					receiver.receive(transmission.path_index as usize, &operation)
				{
					result = Err(e.into());
					break;
				}
			}
			(decoder, result)
		})
		.await
		.map_err(|e| EndpointError::Protocol { message: format!("supply task failed: {}", e) })?;

		self.decoder = Some(decoder);
		result
	}

	async fn transition(
		&mut self,
		token: &CancellationToken,
		changes: Vec<Change>,
	) -> Result<TransitionOutcome, EndpointError> {
		self.send(&EndpointRequest {
			kind: Some(endpoint_request::Kind::Transition(TransitionRequest {
				transitions: changes.iter().map(Into::into).collect(),
			})),
		})?;

		let response: TransitionResponse =
			self.read_raced(token, TransitionCompletionRequest {}).await?;
		if !response.error.is_empty() {
			return Err(EndpointError::Remote { message: response.error });
		}

		let results = response
			.results
			.iter()
			.map(|result| result.entry.as_ref().map(Entry::try_from).transpose())
			.collect::<Result<Vec<Option<Entry>>, _>>()?;
		Ok(TransitionOutcome {
			results,
			problems: response.problems.iter().map(Into::into).collect(),
			stager_missing_files: response.stager_missing_files,
		})
	}
}

// vim: ts=4
