//! Local endpoint
//!
//! Runs the scan/stage/transition machinery directly against a filesystem
//! root. Filesystem-heavy phases execute on blocking threads; polling rides
//! the recursive watcher, falling back to timed polling when watching fails,
//! and watcher-reported paths accelerate subsequent scans.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::ignore::{IgnoreCache, IgnoreVcs, Ignorer};
use crate::logging::*;
use crate::reconcile;
use crate::rsync::transmit::{transmit, Receiver};
use crate::rsync::{Engine, Signature};
use crate::scan::{scan, Cache};
use crate::snapshot::{Change, Snapshot};
use crate::stage::{plan_staging, Stager, StagingReceiver};
use crate::transition::transition;
use crate::watch::recursive::WatchOutcome;
use crate::watch::RecursiveWatcher;

use super::messages::SessionParameters;
use super::{Endpoint, EndpointError, ScanOutcome, StageOutcome, TransitionOutcome};

/// Poll cadence when no watcher is available.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Name of the persisted scan cache inside the endpoint state directory.
const CACHE_FILE: &str = "cache";

/// Name of the staging subdirectory inside the endpoint state directory.
const STAGING_DIRECTORY: &str = "staging";

pub struct LocalEndpoint {
	root: PathBuf,
	parameters: SessionParameters,
	ignorer: Arc<dyn Ignorer>,
	engine: Engine,
	stager: Stager,
	cache_path: PathBuf,

	cache: Cache,
	ignore_cache: IgnoreCache,
	last_snapshot: Option<Snapshot>,

	watcher: Option<RecursiveWatcher>,
	watch_failed: bool,
	recheck_paths: BTreeSet<String>,
	force_full_scan: bool,
}

impl LocalEndpoint {
	/// Create an endpoint for a root, keeping session state (scan cache and
	/// staging content) under `state`. The state directory must be on the
	/// same volume as the root so staged files can be renamed into place.
	pub fn new(
		root: &Path,
		state: &Path,
		parameters: SessionParameters,
	) -> Result<LocalEndpoint, EndpointError> {
		std::fs::create_dir_all(state)?;

		let ignorer: Arc<dyn Ignorer> = {
			let dialect = new_ignorer(&parameters)?;
			if parameters.ignore_vcs {
				Arc::new(IgnoreVcs::new(dialect))
			} else {
				Arc::from(dialect)
			}
		};

		let cache_path = state.join(CACHE_FILE);
		let cache = Cache::load(&cache_path).unwrap_or_else(|e| {
			warn!(error = %e, "discarding unreadable scan cache");
			Cache::new()
		});

		let stager = Stager::open(state.join(STAGING_DIRECTORY), parameters.digest)?;

		Ok(LocalEndpoint {
			root: root.to_path_buf(),
			engine: Engine::new(parameters.digest),
			ignorer,
			stager,
			cache_path,
			parameters,
			cache,
			ignore_cache: IgnoreCache::new(),
			last_snapshot: None,
			watcher: None,
			watch_failed: false,
			recheck_paths: BTreeSet::new(),
			force_full_scan: false,
		})
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn synchronization_mode(&self) -> reconcile::SynchronizationMode {
		self.parameters.synchronization_mode
	}

	fn ensure_watching(&mut self) {
		if self.watcher.is_some() || self.watch_failed {
			return;
		}
		match RecursiveWatcher::new(&self.root) {
			Ok(watcher) => self.watcher = Some(watcher),
			Err(e) => {
				info!(error = %e, "watching unavailable; falling back to timed polling");
				self.watch_failed = true;
			}
		}
	}
}

fn new_ignorer(parameters: &SessionParameters) -> Result<Box<dyn Ignorer>, EndpointError> {
	crate::ignore::new_ignorer(parameters.ignore_dialect, &parameters.ignores)
		.map_err(|e| EndpointError::Protocol { message: e.to_string() })
}

#[async_trait]
impl Endpoint for LocalEndpoint {
	async fn poll(&mut self, token: &CancellationToken) -> Result<(), EndpointError> {
		self.ensure_watching();

		let outcome = match self.watcher.as_mut() {
			Some(watcher) => {
				tokio::select! {
					_ = token.cancelled() => return Ok(()),
					outcome = watcher.next() => outcome,
				}
			}
			None => {
				tokio::select! {
					_ = token.cancelled() => {}
					_ = tokio::time::sleep(FALLBACK_POLL_INTERVAL) => {}
				}
				return Ok(());
			}
		};

		match outcome {
			WatchOutcome::Events(paths) => {
				debug!(paths = paths.len(), "watcher reported changes");
				self.recheck_paths.extend(paths);
			}
			WatchOutcome::Failed(error) => {
				warn!(error = %error, "watch failed; falling back to full scans");
				self.watcher = None;
				self.watch_failed = true;
				self.force_full_scan = true;
			}
			WatchOutcome::Terminated => {
				self.watcher = None;
				self.force_full_scan = true;
			}
		}
		Ok(())
	}

	async fn scan(
		&mut self,
		token: &CancellationToken,
		full: bool,
	) -> Result<ScanOutcome, EndpointError> {
		let full = full || self.force_full_scan;
		let token = token.clone();
		let root = self.root.clone();
		let algorithm = self.parameters.digest;
		let symlink_mode = self.parameters.symlink_mode;
		let permissions_mode = self.parameters.permissions_mode;
		let ignorer = self.ignorer.clone();
		let baseline = if full { None } else { self.last_snapshot.clone() };
		let cache = std::mem::take(&mut self.cache);
		let ignore_cache = std::mem::take(&mut self.ignore_cache);
		let recheck = std::mem::take(&mut self.recheck_paths);

		let (result, cache, ignore_cache, recheck) = tokio::task::spawn_blocking(move || {
			let result = scan(
				&token,
				&root,
				baseline.as_ref(),
				&recheck,
				algorithm,
				&cache,
				ignorer.as_ref(),
				&ignore_cache,
				symlink_mode,
				permissions_mode,
			);
			(result, cache, ignore_cache, recheck)
		})
		.await
		.map_err(|e| EndpointError::Protocol { message: format!("scan task failed: {}", e) })?;

		match result {
			Ok(scanned) => {
				if let Err(e) = scanned.cache.save(&self.cache_path) {
					warn!(error = %e, "unable to persist scan cache");
				}
				self.cache = scanned.cache;
				self.ignore_cache = scanned.ignore_cache;
				self.last_snapshot = Some(scanned.snapshot.clone());
				self.force_full_scan = false;
				let preserves_executability = scanned.snapshot.preserves_executability;
				Ok(ScanOutcome {
					snapshot: scanned.snapshot,
					preserves_executability,
					try_again: false,
				})
			}
			Err(e) => {
				// Restore the pre-scan state so a retry can still run warm.
				self.cache = cache;
				self.ignore_cache = ignore_cache;
				self.recheck_paths = recheck;
				Err(e.into())
			}
		}
	}

	async fn stage(
		&mut self,
		paths: Vec<String>,
		digests: Vec<Vec<u8>>,
	) -> Result<StageOutcome, EndpointError> {
		let stager = self.stager.clone();
		let engine = self.engine;
		let root = self.root.clone();
		let reverse_lookup = self.cache.generate_reverse_lookup();

		let plan = tokio::task::spawn_blocking(move || {
			plan_staging(&stager, &root, &engine, &paths, &digests, &reverse_lookup)
		})
		.await
		.map_err(|e| EndpointError::Protocol { message: format!("staging task failed: {}", e) })??;

		if plan.is_empty() {
			return Ok(StageOutcome { paths: Vec::new(), signatures: Vec::new(), receiver: None });
		}
		let paths = plan.paths.clone();
		let signatures = plan.signatures.clone();
		let receiver = StagingReceiver::new(self.stager.clone(), self.engine, plan);
		Ok(StageOutcome { paths, signatures, receiver: Some(Box::new(receiver)) })
	}

	async fn supply(
		&mut self,
		paths: Vec<String>,
		signatures: Vec<Signature>,
		mut receiver: Box<dyn Receiver>,
	) -> Result<(), EndpointError> {
		if paths.len() != signatures.len() {
			return Err(EndpointError::Protocol {
				message: format!(
					"supply request with {} paths but {} signatures",
					paths.len(),
					signatures.len()
				),
			});
		}
		let engine = self.engine;
		let root = self.root.clone();

		tokio::task::spawn_blocking(move || {
			for (index, (path, signature)) in paths.iter().zip(&signatures).enumerate() {
				let content = match std::fs::read(root.join(path)) {
					Ok(content) => content,
					Err(e) => {
						// The file changed underneath us; skip it and let
						// the next cycle repair.
						debug!(path, error = %e, "unable to read content for supply");
						continue;
					}
				};
				transmit(&engine, index, &content, signature, receiver.as_mut())?;
			}
			receiver.finalize()
		})
		.await
		.map_err(|e| EndpointError::Protocol { message: format!("supply task failed: {}", e) })??;

		Ok(())
	}

	async fn transition(
		&mut self,
		token: &CancellationToken,
		changes: Vec<Change>,
	) -> Result<TransitionOutcome, EndpointError> {
		let token = token.clone();
		let root = self.root.clone();
		let stager = self.stager.clone();

		// Revisit transitioned paths on the next accelerated scan even when
		// the watcher misses our own writes.
		self.recheck_paths.extend(changes.iter().map(|c| c.path.clone()));

		let outcome = tokio::task::spawn_blocking(move || {
			transition(&token, &root, &changes, &stager)
		})
		.await
		.map_err(|e| EndpointError::Protocol { message: format!("transition task failed: {}", e) })??;

		Ok(outcome)
	}
}

// vim: ts=4
