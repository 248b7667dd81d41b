//! Hasher: claim a pending request, fetch its bytes, commit the digest
//!
//! A failed attempt leaves the request locked. It is only unlocked again by
//! `release_expired_claims` when a claim lease is configured.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::HasherConfig;
use crate::error::{MirrorError, Result};
use crate::logging::*;
use crate::store::{Claim, File, Host, Server, Store};

const READ_BUFFER: usize = 1 << 16;

/// Result of one claim-fetch-commit attempt
#[derive(Debug)]
pub enum Outcome {
	/// Nothing eligible to claim
	Idle,
	Hashed(File),
	/// A request was claimed but could not be completed
	Failed,
}

/// Fetch the bytes announced by `server` and digest them
///
/// Returns the lower-case hex BLAKE3 digest and the number of bytes read.
pub async fn fetch_digest(server: &Server, io_timeout: Duration) -> Result<(String, u64)> {
	let mut stream = timeout(io_timeout, TcpStream::connect((server.ip.as_str(), server.port))).await??;
	timeout(io_timeout, stream.write_all(format!("{}\n", server.id).as_bytes())).await??;

	let mut digest = blake3::Hasher::new();
	let mut buf = vec![0u8; READ_BUFFER];
	let mut total = 0u64;
	loop {
		let n = timeout(io_timeout, stream.read(&mut buf)).await??;
		if n == 0 {
			break;
		}
		digest.update(&buf[..n]);
		total += n as u64;
	}
	Ok((digest.finalize().to_hex().to_string(), total))
}

#[derive(Clone)]
pub struct Hasher {
	store: Store,
	host: Host,
	config: HasherConfig,
}

impl Hasher {
	/// Hasher working on behalf of `host`, whose region scopes the claims
	pub fn new(store: Store, host: Host, config: HasherConfig) -> Self {
		Hasher { store, host, config }
	}

	pub fn claim_one(&self) -> Result<Option<Claim>> {
		self.store.claim(self.host.id)
	}

	/// Fetch, verify and commit one claimed request
	pub async fn process(&self, claim: &Claim) -> Result<File> {
		let (hash, size) = fetch_digest(&claim.server, self.config.io_timeout()).await?;
		if size != claim.request.size {
			return Err(MirrorError::protocol(format!(
				"hash request {} announced {} bytes, received {}",
				claim.request.id, claim.request.size, size
			)));
		}
		self.store.complete(claim, &hash)
	}

	pub async fn run_once(&self) -> Outcome {
		if let Some(lease) = self.config.claim_lease() {
			if let Err(e) = self.store.release_expired_claims(lease) {
				warn!("Cannot release expired claims: {}", e);
			}
		}

		let claim = match self.claim_one() {
			Ok(Some(claim)) => claim,
			Ok(None) => return Outcome::Idle,
			Err(e) => {
				warn!("Claim failed: {}", e);
				return Outcome::Failed;
			}
		};

		match self.process(&claim).await {
			Ok(file) => {
				info!("Hashed {:?} ({} bytes): {}", file.name, file.size, file.hash);
				Outcome::Hashed(file)
			}
			Err(e) => {
				error!(
					"Hash request {} ({:?}) failed, left locked: {}",
					claim.request.id, claim.request.name, e
				);
				Outcome::Failed
			}
		}
	}

	/// Run `workers` independent claim loops until the process stops
	pub async fn run(&self, workers: usize) -> Result<()> {
		info!("Hasher for {} started with {} workers", self.host.name, workers);
		let mut handles = Vec::with_capacity(workers);
		for id in 0..workers.max(1) {
			let hasher = self.clone();
			handles.push(tokio::spawn(async move {
				loop {
					if let Outcome::Idle = hasher.run_once().await {
						debug!("Hash worker {} idle", id);
						tokio::time::sleep(hasher.config.interval()).await;
					}
				}
			}));
		}
		for handle in handles {
			if let Err(e) = handle.await {
				error!("Hash worker died: {}", e);
			}
		}
		Ok(())
	}
}


// vim: ts=4
