//! Control stream framing
//!
//! Each direction of the control stream is wrapped in a DEFLATE stream;
//! within it, every message is a varint length prefix followed by Protocol
//! Buffers bytes. Messages over 100 MiB are rejected. The encoder buffers
//! into the compressor and must be flushed explicitly after each logical
//! batch; its first error is sticky, poisoning all subsequent encodes.

use std::io;
use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use prost::Message;

/// Maximum accepted message size on either direction.
pub const MAXIMUM_MESSAGE_SIZE: u64 = 100 * 1024 * 1024;

/// Framing failure.
#[derive(Debug)]
pub enum FrameError {
	Io(io::Error),
	Decode(prost::DecodeError),

	/// A message exceeded the size cap.
	TooLarge { size: u64 },

	/// The peer closed the stream.
	Closed,

	/// A previous transmission error poisoned the encoder.
	Poisoned,
}

impl std::fmt::Display for FrameError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			FrameError::Io(e) => write!(f, "stream I/O failed: {}", e),
			FrameError::Decode(e) => write!(f, "malformed message: {}", e),
			FrameError::TooLarge { size } => {
				write!(f, "message of {} bytes exceeds maximum allowed size", size)
			}
			FrameError::Closed => write!(f, "stream closed by peer"),
			FrameError::Poisoned => write!(f, "stream poisoned by previous transmission error"),
		}
	}
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			FrameError::Closed
		} else {
			FrameError::Io(e)
		}
	}
}

impl From<prost::DecodeError> for FrameError {
	fn from(e: prost::DecodeError) -> Self {
		FrameError::Decode(e)
	}
}

/// Message encoder over one compressed stream direction.
pub struct Encoder<W: Write> {
	inner: DeflateEncoder<W>,
	poisoned: bool,
}

impl<W: Write> Encoder<W> {
	pub fn new(writer: W) -> Self {
		Encoder { inner: DeflateEncoder::new(writer, Compression::default()), poisoned: false }
	}

	/// Encode one message into the compressed stream. Data stays buffered in
	/// the compressor until `flush` is called.
	pub fn encode<M: Message>(&mut self, message: &M) -> Result<(), FrameError> {
		if self.poisoned {
			return Err(FrameError::Poisoned);
		}
		let bytes = message.encode_to_vec();
		if bytes.len() as u64 > MAXIMUM_MESSAGE_SIZE {
			self.poisoned = true;
			return Err(FrameError::TooLarge { size: bytes.len() as u64 });
		}
		let mut prefix = Vec::with_capacity(10);
		prost::encoding::encode_varint(bytes.len() as u64, &mut prefix);
		let result = (|| {
			self.inner.write_all(&prefix)?;
			self.inner.write_all(&bytes)?;
			Ok::<_, io::Error>(())
		})();
		if let Err(e) = result {
			self.poisoned = true;
			return Err(e.into());
		}
		Ok(())
	}

	/// Flush the compressor so the peer can decode the batch.
	pub fn flush(&mut self) -> Result<(), FrameError> {
		if self.poisoned {
			return Err(FrameError::Poisoned);
		}
		if let Err(e) = self.inner.flush() {
			self.poisoned = true;
			return Err(e.into());
		}
		Ok(())
	}

	/// Encode a message and flush in one step.
	pub fn send<M: Message>(&mut self, message: &M) -> Result<(), FrameError> {
		self.encode(message)?;
		self.flush()
	}
}

/// Message decoder over one compressed stream direction.
pub struct Decoder<R: Read> {
	inner: DeflateDecoder<R>,
}

impl<R: Read> Decoder<R> {
	pub fn new(reader: R) -> Self {
		Decoder { inner: DeflateDecoder::new(reader) }
	}

	/// Decode the next message, blocking until one is available.
	pub fn decode<M: Message + Default>(&mut self) -> Result<M, FrameError> {
		let length = self.read_varint()?;
		if length > MAXIMUM_MESSAGE_SIZE {
			return Err(FrameError::TooLarge { size: length });
		}
		let mut buffer = vec![0u8; length as usize];
		self.inner.read_exact(&mut buffer)?;
		Ok(M::decode(buffer.as_slice())?)
	}

	fn read_varint(&mut self) -> Result<u64, FrameError> {
		let mut result: u64 = 0;
		let mut shift = 0u32;
		loop {
			let mut byte = [0u8; 1];
			self.inner.read_exact(&mut byte)?;
			if shift >= 64 {
				return Err(FrameError::Decode(prost::DecodeError::new(
					"length prefix varint overflows",
				)));
			}
			result |= ((byte[0] & 0x7f) as u64) << shift;
			if byte[0] & 0x80 == 0 {
				return Ok(result);
			}
			shift += 7;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::endpoint::messages::{PollRequest, ScanRequest};
	use std::io::Cursor;

	#[test]
	fn test_encode_decode_round_trip() {
		let mut buffer = Vec::new();
		{
			let mut encoder = Encoder::new(&mut buffer);
			encoder.encode(&ScanRequest { baseline_snapshot_signature: None, full: true }).unwrap();
			encoder.encode(&PollRequest {}).unwrap();
			encoder.flush().unwrap();
		}

		let mut decoder = Decoder::new(Cursor::new(buffer));
		let scan: ScanRequest = decoder.decode().unwrap();
		assert!(scan.full);
		let _: PollRequest = decoder.decode().unwrap();
	}

	#[test]
	fn test_oversized_message_rejected_and_poisons() {
		use crate::rsync::WireOperation;

		let mut encoder = Encoder::new(Vec::new());
		let huge = WireOperation {
			data: vec![0u8; MAXIMUM_MESSAGE_SIZE as usize + 1],
			block_index: 0,
			count: 0,
		};
		assert!(matches!(encoder.encode(&huge), Err(FrameError::TooLarge { .. })));
		// The first error is sticky.
		assert!(matches!(encoder.encode(&PollRequest {}), Err(FrameError::Poisoned)));
		assert!(matches!(encoder.flush(), Err(FrameError::Poisoned)));
	}

	#[test]
	fn test_decode_truncated_stream_reports_closed() {
		let mut buffer = Vec::new();
		{
			let mut encoder = Encoder::new(&mut buffer);
			encoder.encode(&PollRequest {}).unwrap();
			encoder.flush().unwrap();
		}
		buffer.truncate(buffer.len() / 2);
		let mut decoder = Decoder::new(Cursor::new(buffer));
		let result: Result<PollRequest, _> = decoder.decode();
		assert!(result.is_err());
	}
}

// vim: ts=4
