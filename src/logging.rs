//! Logging prelude module for convenient access to tracing macros.
//!
//! # Usage
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("This is an info message");
//! debug!("Debug information");
//! ```

pub use tracing::{debug, error, info, trace, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// Logs at INFO level and above by default; control the level with the
/// `RUST_LOG` environment variable:
///
/// ```bash
/// RUST_LOG=debug reflectr serve /path
/// RUST_LOG=reflectr::scan=trace reflectr serve /path
/// ```
///
/// Output goes to stderr: in serving mode stdout carries the endpoint
/// protocol stream.
pub fn init_tracing() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();
}
