//! Serving mode
//!
//! Runs the endpoint server over stdin/stdout, the transport handed to us by
//! whatever spawned this process (typically an agent launched over ssh).
//! Endpoint state lives under the user's state directory; logs go to stderr
//! because stdout carries the protocol stream.

use std::env;
use std::io::{Read, Write};
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::endpoint::server;
use crate::error::SyncError;
use crate::logging::*;

/// Resolve the state directory: `~/.reflectr`, created on demand.
pub fn state_directory() -> Result<PathBuf, SyncError> {
	let home = env::var("HOME")
		.map_err(|_| SyncError::Other { message: "unable to determine home directory".into() })?;
	let state = PathBuf::from(home).join(".reflectr");
	std::fs::create_dir_all(&state)?;
	Ok(state)
}

/// Serve a synchronization endpoint over stdio until the peer disconnects.
pub async fn serve() -> Result<(), SyncError> {
	let state = state_directory()?;
	info!(state = %state.display(), "serving endpoint over stdio");

	let reader: Box<dyn Read + Send> = Box::new(std::io::stdin());
	let writer: Box<dyn Write + Send> = Box::new(std::io::stdout());
	let token = CancellationToken::new();

	server::serve(reader, writer, state, token).await?;
	info!("session ended");
	Ok(())
}

// vim: ts=4
