//! # Reflectr - Bidirectional Filesystem Synchronization Engine
//!
//! Reflectr continuously reflects two filesystem endpoints ("alpha" and
//! "beta") toward a common synchronized state. Endpoints are scanned into
//! immutable snapshots (accelerated by native filesystem watching), a
//! three-way reconciliation against the last agreed ancestor produces
//! per-side change lists and conflicts, content is staged through an
//! rsync-style delta engine, and transitions apply the changes with
//! per-path problem tracking. Remote endpoints are driven over a
//! compressed, length-prefixed Protocol Buffers control stream.
//!
//! ## Driving a cycle
//!
//! ```rust,ignore
//! use reflectr::endpoint::{Endpoint, LocalEndpoint, SessionParameters};
//! use reflectr::reconcile::reconcile;
//!
//! let mut alpha = LocalEndpoint::new(alpha_root, alpha_state, SessionParameters::default())?;
//! let mut beta = LocalEndpoint::new(beta_root, beta_state, SessionParameters::default())?;
//! // Poll -> Scan both -> reconcile -> Stage/Supply -> Transition both.
//! ```

#![deny(unsafe_code)]

pub mod endpoint;
pub mod error;
pub mod hash;
pub mod ignore;
pub mod logging;
pub mod reconcile;
pub mod rsync;
pub mod scan;
pub mod serve;
pub mod snapshot;
pub mod stage;
pub mod transition;
pub mod watch;

// Re-export commonly used types and functions
pub use endpoint::{Endpoint, EndpointError, LocalEndpoint, RemoteEndpoint, SessionParameters};
pub use error::SyncError;
pub use hash::Algorithm;
pub use reconcile::{reconcile, Reconciliation, SynchronizationMode};
pub use snapshot::{Change, Conflict, Entry, Problem, Snapshot};

// vim: ts=4
