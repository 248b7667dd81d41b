//! Hash requests, server announcements and the claim protocol
//!
//! A HashRequest moves through: created (scanner) -> announced (file server
//! creates its Server) -> claimed (`locked` flips to true inside one write
//! transaction) -> completed (File created, Server and request deleted in the
//! same transaction). A failed completion leaves the request locked.

use rand::seq::IndexedRandom;
use redb::ReadableTable;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::records::*;
use super::{save, Store, TreeView, WriteTables};
use crate::error::{MirrorError, Result};
use crate::logging::*;

/// A request this process has exclusive rights to, plus where to fetch it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
	pub request: HashRequest,
	pub server: Server,
}

fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl WriteTables<'_> {
	/// Record a pending file; (folder, name, mtime) must be new
	pub fn create_request(
		&mut self,
		folder: &Folder,
		name: Name,
		mtime: i64,
		size: u64,
	) -> Result<HashRequest> {
		if self.request_changes.get((folder.id, name.as_bytes(), mtime))?.is_some() {
			return Err(MirrorError::already_exists(format!(
				"hash request for {} in folder {} at mtime {}",
				name, folder.id, mtime
			)));
		}
		let request = HashRequest {
			id: self.next_id("request")?,
			name,
			mtime,
			size,
			host: folder.host,
			folder: folder.id,
			locked: false,
			claimed_at: None,
			claim_token: None,
		};
		save(&mut self.requests, request.id, &request)?;
		self.request_changes.insert((folder.id, request.name.as_bytes(), mtime), request.id)?;
		self.host_requests.insert((request.host, request.id), ())?;
		debug!("Created hash request {} ({:?})", request.id, request.name);
		Ok(request)
	}

	/// Delete a request together with its announcement
	pub fn remove_request(&mut self, request: &HashRequest) -> Result<()> {
		if let Some(server) = self.server_for_request(request.id)? {
			self.remove_server(&server)?;
		}
		self.requests.remove(request.id)?;
		self.request_changes.remove((request.folder, request.name.as_bytes(), request.mtime))?;
		self.host_requests.remove((request.host, request.id))?;
		debug!("Deleted hash request {}", request.id);
		Ok(())
	}

	/// Announce `request` at ip:port; at most one server per request
	pub fn create_server(&mut self, request: &HashRequest, ip: &str, port: u16) -> Result<Server> {
		if self.request_servers.get(request.id)?.is_some() {
			return Err(MirrorError::already_exists(format!("server for request {}", request.id)));
		}
		let server =
			Server { id: self.next_id("server")?, ip: ip.to_string(), port, request: request.id };
		save(&mut self.servers, server.id, &server)?;
		self.request_servers.insert(request.id, server.id)?;
		Ok(server)
	}

	pub fn remove_server(&mut self, server: &Server) -> Result<()> {
		self.servers.remove(server.id)?;
		self.request_servers.remove(server.request)?;
		Ok(())
	}

	fn lock_request(&mut self, mut request: HashRequest) -> Result<HashRequest> {
		if request.locked {
			return Err(MirrorError::AlreadyClaimed { request: request.id });
		}
		request.locked = true;
		request.claimed_at = Some(unix_now());
		request.claim_token = Some(self.next_id("claim")?);
		save(&mut self.requests, request.id, &request)?;
		Ok(request)
	}
}

impl Store {
	pub fn create_hash_request(
		&self,
		folder: &Folder,
		name: impl Into<Name>,
		mtime: i64,
		size: u64,
	) -> Result<HashRequest> {
		let name = name.into();
		self.write(|t| {
			let folder = t.require_folder(folder.id)?;
			t.create_request(&folder, name, mtime, size)
		})
	}

	pub fn delete_hash_request(&self, id: Id) -> Result<()> {
		self.write(|t| {
			let request =
				t.request(id)?.ok_or_else(|| MirrorError::not_found(format!("hash request {}", id)))?;
			t.remove_request(&request)
		})
	}

	pub fn request(&self, id: Id) -> Result<Option<HashRequest>> {
		self.read(|t| t.request(id))
	}

	pub fn request_by_change(&self, folder: Id, name: &[u8], mtime: i64) -> Result<Option<HashRequest>> {
		self.read(|t| t.request_by_change(folder, name, mtime))
	}

	pub fn requests_in_folder(&self, folder: Id) -> Result<Vec<HashRequest>> {
		self.read(|t| t.requests_in_folder(folder))
	}

	pub fn hash_requests_for_host(&self, host: Id) -> Result<Vec<HashRequest>> {
		self.read(|t| t.requests_for_host(host))
	}

	pub fn server(&self, id: Id) -> Result<Option<Server>> {
		self.read(|t| t.server(id))
	}

	pub fn server_for_request(&self, request: Id) -> Result<Option<Server>> {
		self.read(|t| t.server_for_request(request))
	}

	/// Create a Server at ip:port for every unlocked request of `host` lacking one
	///
	/// Servers left behind by an earlier run at another address are moved to the
	/// new address. Returns the servers created or moved.
	pub fn announce(&self, host: Id, ip: &str, port: u16) -> Result<Vec<Server>> {
		self.write(|t| {
			let mut announced = Vec::new();
			for request in t.requests_for_host(host)? {
				if request.locked {
					continue;
				}
				match t.server_for_request(request.id)? {
					None => announced.push(t.create_server(&request, ip, port)?),
					Some(mut server) if server.ip != ip || server.port != port => {
						server.ip = ip.to_string();
						server.port = port;
						save(&mut t.servers, server.id, &server)?;
						announced.push(server);
					}
					Some(_) => {}
				}
			}
			Ok(announced)
		})
	}

	/// Claim one random eligible request for hasher host `me`
	///
	/// Eligible means unlocked and announced, owned by a host in `me`'s region,
	/// or by `me` itself when it has no region. Returns None when nothing is
	/// eligible.
	pub fn claim(&self, me: Id) -> Result<Option<Claim>> {
		self.write(|t| {
			let me = t.require_host(me)?;

			let mut announced = Vec::new();
			for entry in t.request_servers.iter()? {
				let (request_id, server_id) = entry?;
				announced.push((request_id.value(), server_id.value()));
			}

			let mut eligible = Vec::new();
			for (request_id, server_id) in announced {
				let Some(request) = t.request(request_id)? else {
					continue;
				};
				if request.locked {
					continue;
				}
				let in_scope = match me.region {
					Some(region) => t.host(request.host)?.is_some_and(|h| h.region == Some(region)),
					None => request.host == me.id,
				};
				if in_scope {
					eligible.push((request, server_id));
				}
			}

			let Some((request, server_id)) = eligible.choose(&mut rand::rng()).cloned() else {
				return Ok(None);
			};
			let server = t.server(server_id)?.ok_or_else(|| MirrorError::Corrupted {
				message: format!("dangling server {}", server_id),
			})?;
			let request = t.lock_request(request)?;
			info!("Claimed hash request {} ({:?}) from {}:{}", request.id, request.name, server.ip, server.port);
			Ok(Some(Claim { request, server }))
		})
	}

	/// Claim one specific request; exactly one concurrent caller can win
	pub fn claim_request(&self, id: Id) -> Result<Claim> {
		self.write(|t| {
			let request =
				t.request(id)?.ok_or_else(|| MirrorError::not_found(format!("hash request {}", id)))?;
			let server = t.server_for_request(id)?.ok_or_else(|| {
				MirrorError::not_found(format!("server announcing hash request {}", id))
			})?;
			let request = t.lock_request(request)?;
			Ok(Claim { request, server })
		})
	}

	/// Replace a claimed request by a File carrying `hash`, atomically
	///
	/// Only the holder of the current claim may commit. A claim that expired and
	/// was handed to another hasher fails with AlreadyClaimed.
	pub fn complete(&self, claim: &Claim, hash: &str) -> Result<File> {
		self.write(|t| {
			let request = t.request(claim.request.id)?.ok_or_else(|| {
				MirrorError::not_found(format!("hash request {}", claim.request.id))
			})?;
			if !request.locked {
				return Err(MirrorError::Transaction {
					message: format!("hash request {} is not claimed", request.id),
				});
			}
			if request.claim_token.is_none() || request.claim_token != claim.request.claim_token {
				return Err(MirrorError::AlreadyClaimed { request: request.id });
			}
			let folder = t.require_folder(request.folder)?;
			let file = t.create_file(&folder, request.name.clone(), hash, request.mtime, request.size)?;
			t.remove_request(&request)?;
			Ok(file)
		})
	}

	/// Unlock claims older than `lease` and withdraw their servers
	///
	/// The file server re-announces them on its next pass. Returns the number
	/// of requests released.
	pub fn release_expired_claims(&self, lease: Duration) -> Result<usize> {
		let cutoff = unix_now().saturating_sub(lease.as_secs());
		self.write(|t| {
			let mut expired = Vec::new();
			for entry in t.requests.iter()? {
				let (_, value) = entry?;
				let request: HashRequest = serde_json::from_slice(value.value())?;
				if request.locked && request.claimed_at.is_none_or(|at| at <= cutoff) {
					expired.push(request);
				}
			}

			for mut request in expired.iter().cloned() {
				if let Some(server) = t.server_for_request(request.id)? {
					t.remove_server(&server)?;
				}
				request.locked = false;
				request.claimed_at = None;
				request.claim_token = None;
				save(&mut t.requests, request.id, &request)?;
				warn!("Released expired claim on hash request {} ({:?})", request.id, request.name);
			}
			Ok(expired.len())
		})
	}
}


// vim: ts=4
