//! Tree Store backed by redb
//!
//! Every record kind lives in its own table keyed by a numeric id and holds a
//! JSON encoded record. Unique constraints are index tables that are checked and
//! written inside the same write transaction as the record they guard, so a
//! violation aborts the whole transaction instead of corrupting state.
//!
//! redb serializes write transactions, which is what makes the claim protocol
//! linearizable: the read-check-lock sequence in [`Store::claim`] cannot
//! interleave with another claimant.

pub mod queue;
pub mod records;
pub mod tree;

use redb::{
	ReadOnlyTable, ReadTransaction, ReadableDatabase, ReadableTable, ReadableTableMetadata, Table,
	TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::error::{MirrorError, Result};
use crate::logging::*;

pub use queue::Claim;
pub use records::{File, Folder, HashRequest, Host, Id, Name, Node, Region, Server, StoreStats};

/// Id sequences, one counter per record kind
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

const REGIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("regions");
/// Unique region name -> region id
const REGION_NAMES: TableDefinition<&str, u64> = TableDefinition::new("region_names");

const HOSTS: TableDefinition<u64, &[u8]> = TableDefinition::new("hosts");
/// Unique host name -> host id
const HOST_NAMES: TableDefinition<&str, u64> = TableDefinition::new("host_names");

const FOLDERS: TableDefinition<u64, &[u8]> = TableDefinition::new("folders");
/// Unique (host, parent or 0 for roots, name) -> folder id
const FOLDER_NAMES: TableDefinition<(u64, u64, &[u8]), u64> = TableDefinition::new("folder_names");

const FILES: TableDefinition<u64, &[u8]> = TableDefinition::new("files");
/// Unique (folder, name) -> file id; the host is implied by the folder
const FILE_NAMES: TableDefinition<(u64, &[u8]), u64> = TableDefinition::new("file_names");
/// Dedup index (host, hash, file id)
const FILE_HASHES: TableDefinition<(u64, &str, u64), ()> = TableDefinition::new("file_hashes");

const REQUESTS: TableDefinition<u64, &[u8]> = TableDefinition::new("hash_requests");
/// Unique (folder, name, mtime) -> request id
const REQUEST_CHANGES: TableDefinition<(u64, &[u8], i64), u64> =
	TableDefinition::new("request_changes");
/// (host, request id), used by the announcer
const HOST_REQUESTS: TableDefinition<(u64, u64), ()> = TableDefinition::new("host_requests");

const SERVERS: TableDefinition<u64, &[u8]> = TableDefinition::new("servers");
/// Unique request id -> server id
const REQUEST_SERVERS: TableDefinition<u64, u64> = TableDefinition::new("request_servers");

const EMPTY: &[u8] = &[];

/// Shared handle to the store; clones refer to the same database
#[derive(Clone)]
pub struct Store {
	db: Arc<redb::Database>,
}

impl std::fmt::Debug for Store {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Store").finish_non_exhaustive()
	}
}

impl Store {
	/// Open or create a store and make sure every table exists
	pub fn open(path: &Path) -> Result<Self> {
		let db = redb::Database::create(path)?;
		{
			let txn = db.begin_write()?;
			WriteTables::open(&txn)?;
			txn.commit()?;
		}
		debug!("Store opened at {}", path.display());
		Ok(Store { db: Arc::new(db) })
	}

	/// Run `f` against a consistent read snapshot
	pub fn read<T>(&self, f: impl FnOnce(&ReadTables) -> Result<T>) -> Result<T> {
		let txn = self.db.begin_read()?;
		let tables = ReadTables::open(&txn)?;
		f(&tables)
	}

	/// Run `f` inside a write transaction; commit on Ok, roll back on Err
	pub fn write<T>(&self, f: impl FnOnce(&mut WriteTables<'_>) -> Result<T>) -> Result<T> {
		let txn = self.db.begin_write()?;
		let result = {
			let mut tables = WriteTables::open(&txn)?;
			f(&mut tables)
		};
		match result {
			Ok(value) => {
				txn.commit()?;
				Ok(value)
			}
			Err(e) => {
				if let Err(abort_err) = txn.abort() {
					warn!("Rollback failed after {}: {}", e, abort_err);
				}
				Err(e)
			}
		}
	}

	pub fn stats(&self) -> Result<StoreStats> {
		self.read(|t| t.stats())
	}
}

fn load<T: DeserializeOwned>(table: &impl ReadableTable<u64, &'static [u8]>, id: Id) -> Result<Option<T>> {
	match table.get(id)? {
		Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
		None => Ok(None),
	}
}

fn save<T: Serialize>(table: &mut Table<'_, u64, &'static [u8]>, id: Id, record: &T) -> Result<()> {
	let bytes = serde_json::to_vec(record)?;
	table.insert(id, bytes.as_slice())?;
	Ok(())
}

fn load_all<T: DeserializeOwned>(table: &impl ReadableTable<u64, &'static [u8]>) -> Result<Vec<T>> {
	let mut records = Vec::new();
	for entry in table.iter()? {
		let (_, value) = entry?;
		records.push(serde_json::from_slice(value.value())?);
	}
	Ok(records)
}

/// Read access shared by snapshots and write transactions
///
/// Implementors only hand out their tables; every query is written once here.
pub trait TreeView {
	type Records: ReadableTable<u64, &'static [u8]>;
	type Names: ReadableTable<&'static str, u64>;
	type FolderNames: ReadableTable<(u64, u64, &'static [u8]), u64>;
	type FileNames: ReadableTable<(u64, &'static [u8]), u64>;
	type FileHashes: ReadableTable<(u64, &'static str, u64), ()>;
	type RequestChanges: ReadableTable<(u64, &'static [u8], i64), u64>;
	type HostRequests: ReadableTable<(u64, u64), ()>;
	type Links: ReadableTable<u64, u64>;

	fn regions(&self) -> &Self::Records;
	fn region_names(&self) -> &Self::Names;
	fn hosts(&self) -> &Self::Records;
	fn host_names(&self) -> &Self::Names;
	fn folders(&self) -> &Self::Records;
	fn folder_names(&self) -> &Self::FolderNames;
	fn files(&self) -> &Self::Records;
	fn file_names(&self) -> &Self::FileNames;
	fn file_hashes(&self) -> &Self::FileHashes;
	fn requests(&self) -> &Self::Records;
	fn request_changes(&self) -> &Self::RequestChanges;
	fn host_requests(&self) -> &Self::HostRequests;
	fn servers(&self) -> &Self::Records;
	fn request_servers(&self) -> &Self::Links;

	fn region(&self, id: Id) -> Result<Option<Region>> {
		load(self.regions(), id)
	}

	fn region_by_name(&self, name: &str) -> Result<Option<Region>> {
		match self.region_names().get(name)? {
			Some(id) => self.region(id.value()),
			None => Ok(None),
		}
	}

	fn host(&self, id: Id) -> Result<Option<Host>> {
		load(self.hosts(), id)
	}

	fn host_by_name(&self, name: &str) -> Result<Option<Host>> {
		match self.host_names().get(name)? {
			Some(id) => self.host(id.value()),
			None => Ok(None),
		}
	}

	fn require_host(&self, id: Id) -> Result<Host> {
		self.host(id)?.ok_or_else(|| MirrorError::not_found(format!("host {}", id)))
	}

	fn folder(&self, id: Id) -> Result<Option<Folder>> {
		load(self.folders(), id)
	}

	fn require_folder(&self, id: Id) -> Result<Folder> {
		self.folder(id)?.ok_or_else(|| MirrorError::not_found(format!("folder {}", id)))
	}

	fn file(&self, id: Id) -> Result<Option<File>> {
		load(self.files(), id)
	}

	fn request(&self, id: Id) -> Result<Option<HashRequest>> {
		load(self.requests(), id)
	}

	fn server(&self, id: Id) -> Result<Option<Server>> {
		load(self.servers(), id)
	}

	/// Parentless folders registered for `host`, ordered by name
	fn roots(&self, host: Id) -> Result<Vec<Folder>> {
		self.folders_under(host, 0)
	}

	fn subfolders(&self, folder: &Folder) -> Result<Vec<Folder>> {
		self.folders_under(folder.host, folder.id)
	}

	fn folders_under(&self, host: Id, parent: Id) -> Result<Vec<Folder>> {
		let mut folders = Vec::new();
		for entry in self.folder_names().range((host, parent, EMPTY)..(host, parent + 1, EMPTY))? {
			let (_, id) = entry?;
			let id = id.value();
			let folder = self
				.folder(id)?
				.ok_or_else(|| MirrorError::Corrupted { message: format!("dangling folder {}", id) })?;
			folders.push(folder);
		}
		Ok(folders)
	}

	/// Files directly inside `folder`, ordered by name
	fn files_in(&self, folder: Id) -> Result<Vec<File>> {
		let mut files = Vec::new();
		for entry in self.file_names().range((folder, EMPTY)..(folder + 1, EMPTY))? {
			let (_, id) = entry?;
			let id = id.value();
			let file = self
				.file(id)?
				.ok_or_else(|| MirrorError::Corrupted { message: format!("dangling file {}", id) })?;
			files.push(file);
		}
		Ok(files)
	}

	/// Look up a direct child; files take precedence over folders
	fn child_by_name(&self, folder: &Folder, name: &[u8]) -> Result<Option<Node>> {
		if let Some(id) = self.file_names().get((folder.id, name))? {
			if let Some(file) = self.file(id.value())? {
				return Ok(Some(Node::File(file)));
			}
		}
		if let Some(id) = self.folder_names().get((folder.host, folder.id, name))? {
			if let Some(sub) = self.folder(id.value())? {
				return Ok(Some(Node::Folder(sub)));
			}
		}
		Ok(None)
	}

	/// Ancestor names concatenated, with a trailing separator
	fn folder_path(&self, folder: &Folder) -> Result<Vec<u8>> {
		let mut chain = vec![folder.clone()];
		let mut current = folder.parent;
		while let Some(parent_id) = current {
			let parent = self.require_folder(parent_id)?;
			current = parent.parent;
			chain.push(parent);
		}

		let mut path = Vec::new();
		for (depth, f) in chain.iter().rev().enumerate() {
			path.extend_from_slice(f.name.as_bytes());
			if depth > 0 || !path.ends_with(b"/") {
				path.push(b'/');
			}
		}
		Ok(path)
	}

	fn file_path(&self, file: &File) -> Result<Vec<u8>> {
		let mut path = self.folder_path(&self.require_folder(file.folder)?)?;
		path.extend_from_slice(file.name.as_bytes());
		Ok(path)
	}

	fn request_path(&self, request: &HashRequest) -> Result<Vec<u8>> {
		let mut path = self.folder_path(&self.require_folder(request.folder)?)?;
		path.extend_from_slice(request.name.as_bytes());
		Ok(path)
	}

	fn node_path(&self, node: &Node) -> Result<Vec<u8>> {
		match node {
			Node::Folder(f) => self.folder_path(f),
			Node::File(f) => self.file_path(f),
		}
	}

	/// `<host>::<path>` rendering of a node (lossy for non UTF-8 names)
	fn node_uri(&self, node: &Node) -> Result<String> {
		let host = self.require_host(node.host())?;
		Ok(format!("{}::{}", host.name, String::from_utf8_lossy(&self.node_path(node)?)))
	}

	/// Every file on `host` whose content digest is `hash`
	fn files_by_hash(&self, host: Id, hash: &str) -> Result<Vec<File>> {
		let mut files = Vec::new();
		for entry in self.file_hashes().range((host, hash, 0u64)..=(host, hash, u64::MAX))? {
			let (key, _) = entry?;
			let (_, _, id) = key.value();
			if let Some(file) = self.file(id)? {
				files.push(file);
			}
		}
		Ok(files)
	}

	fn request_by_change(&self, folder: Id, name: &[u8], mtime: i64) -> Result<Option<HashRequest>> {
		match self.request_changes().get((folder, name, mtime))? {
			Some(id) => self.request(id.value()),
			None => Ok(None),
		}
	}

	/// All pending requests for one name inside a folder, any mtime
	fn requests_for_name(&self, folder: Id, name: &[u8]) -> Result<Vec<HashRequest>> {
		let mut requests = Vec::new();
		let range = (folder, name, i64::MIN)..=(folder, name, i64::MAX);
		for entry in self.request_changes().range(range)? {
			let (_, id) = entry?;
			if let Some(request) = self.request(id.value())? {
				requests.push(request);
			}
		}
		Ok(requests)
	}

	fn requests_in_folder(&self, folder: Id) -> Result<Vec<HashRequest>> {
		let mut requests = Vec::new();
		let range = (folder, EMPTY, i64::MIN)..(folder + 1, EMPTY, i64::MIN);
		for entry in self.request_changes().range(range)? {
			let (_, id) = entry?;
			if let Some(request) = self.request(id.value())? {
				requests.push(request);
			}
		}
		Ok(requests)
	}

	fn requests_for_host(&self, host: Id) -> Result<Vec<HashRequest>> {
		let mut requests = Vec::new();
		for entry in self.host_requests().range((host, 0u64)..(host + 1, 0u64))? {
			let (key, _) = entry?;
			let (_, id) = key.value();
			if let Some(request) = self.request(id)? {
				requests.push(request);
			}
		}
		Ok(requests)
	}

	fn server_for_request(&self, request: Id) -> Result<Option<Server>> {
		match self.request_servers().get(request)? {
			Some(id) => self.server(id.value()),
			None => Ok(None),
		}
	}

	fn stats(&self) -> Result<StoreStats> {
		let requests: Vec<HashRequest> = load_all(self.requests())?;
		Ok(StoreStats {
			regions: self.regions().len()?,
			hosts: self.hosts().len()?,
			folders: self.folders().len()?,
			files: self.files().len()?,
			requests: requests.len() as u64,
			locked_requests: requests.iter().filter(|r| r.locked).count() as u64,
			servers: self.servers().len()?,
		})
	}
}

/// Tables of a read snapshot
pub struct ReadTables {
	regions: ReadOnlyTable<u64, &'static [u8]>,
	region_names: ReadOnlyTable<&'static str, u64>,
	hosts: ReadOnlyTable<u64, &'static [u8]>,
	host_names: ReadOnlyTable<&'static str, u64>,
	folders: ReadOnlyTable<u64, &'static [u8]>,
	folder_names: ReadOnlyTable<(u64, u64, &'static [u8]), u64>,
	files: ReadOnlyTable<u64, &'static [u8]>,
	file_names: ReadOnlyTable<(u64, &'static [u8]), u64>,
	file_hashes: ReadOnlyTable<(u64, &'static str, u64), ()>,
	requests: ReadOnlyTable<u64, &'static [u8]>,
	request_changes: ReadOnlyTable<(u64, &'static [u8], i64), u64>,
	host_requests: ReadOnlyTable<(u64, u64), ()>,
	servers: ReadOnlyTable<u64, &'static [u8]>,
	request_servers: ReadOnlyTable<u64, u64>,
}

impl ReadTables {
	fn open(txn: &ReadTransaction) -> Result<Self> {
		Ok(ReadTables {
			regions: txn.open_table(REGIONS)?,
			region_names: txn.open_table(REGION_NAMES)?,
			hosts: txn.open_table(HOSTS)?,
			host_names: txn.open_table(HOST_NAMES)?,
			folders: txn.open_table(FOLDERS)?,
			folder_names: txn.open_table(FOLDER_NAMES)?,
			files: txn.open_table(FILES)?,
			file_names: txn.open_table(FILE_NAMES)?,
			file_hashes: txn.open_table(FILE_HASHES)?,
			requests: txn.open_table(REQUESTS)?,
			request_changes: txn.open_table(REQUEST_CHANGES)?,
			host_requests: txn.open_table(HOST_REQUESTS)?,
			servers: txn.open_table(SERVERS)?,
			request_servers: txn.open_table(REQUEST_SERVERS)?,
		})
	}
}

/// Tables of an open write transaction
pub struct WriteTables<'txn> {
	sequences: Table<'txn, &'static str, u64>,
	regions: Table<'txn, u64, &'static [u8]>,
	region_names: Table<'txn, &'static str, u64>,
	hosts: Table<'txn, u64, &'static [u8]>,
	host_names: Table<'txn, &'static str, u64>,
	folders: Table<'txn, u64, &'static [u8]>,
	folder_names: Table<'txn, (u64, u64, &'static [u8]), u64>,
	files: Table<'txn, u64, &'static [u8]>,
	file_names: Table<'txn, (u64, &'static [u8]), u64>,
	file_hashes: Table<'txn, (u64, &'static str, u64), ()>,
	requests: Table<'txn, u64, &'static [u8]>,
	request_changes: Table<'txn, (u64, &'static [u8], i64), u64>,
	host_requests: Table<'txn, (u64, u64), ()>,
	servers: Table<'txn, u64, &'static [u8]>,
	request_servers: Table<'txn, u64, u64>,
}

impl<'txn> WriteTables<'txn> {
	fn open(txn: &'txn WriteTransaction) -> Result<Self> {
		Ok(WriteTables {
			sequences: txn.open_table(SEQUENCES)?,
			regions: txn.open_table(REGIONS)?,
			region_names: txn.open_table(REGION_NAMES)?,
			hosts: txn.open_table(HOSTS)?,
			host_names: txn.open_table(HOST_NAMES)?,
			folders: txn.open_table(FOLDERS)?,
			folder_names: txn.open_table(FOLDER_NAMES)?,
			files: txn.open_table(FILES)?,
			file_names: txn.open_table(FILE_NAMES)?,
			file_hashes: txn.open_table(FILE_HASHES)?,
			requests: txn.open_table(REQUESTS)?,
			request_changes: txn.open_table(REQUEST_CHANGES)?,
			host_requests: txn.open_table(HOST_REQUESTS)?,
			servers: txn.open_table(SERVERS)?,
			request_servers: txn.open_table(REQUEST_SERVERS)?,
		})
	}

	/// Allocate the next id for a record kind, starting at 1
	fn next_id(&mut self, kind: &str) -> Result<Id> {
		let next = self.sequences.get(kind)?.map(|v| v.value()).unwrap_or(0) + 1;
		self.sequences.insert(kind, next)?;
		Ok(next)
	}
}

impl TreeView for ReadTables {
	type Records = ReadOnlyTable<u64, &'static [u8]>;
	type Names = ReadOnlyTable<&'static str, u64>;
	type FolderNames = ReadOnlyTable<(u64, u64, &'static [u8]), u64>;
	type FileNames = ReadOnlyTable<(u64, &'static [u8]), u64>;
	type FileHashes = ReadOnlyTable<(u64, &'static str, u64), ()>;
	type RequestChanges = ReadOnlyTable<(u64, &'static [u8], i64), u64>;
	type HostRequests = ReadOnlyTable<(u64, u64), ()>;
	type Links = ReadOnlyTable<u64, u64>;

	fn regions(&self) -> &Self::Records {
		&self.regions
	}
	fn region_names(&self) -> &Self::Names {
		&self.region_names
	}
	fn hosts(&self) -> &Self::Records {
		&self.hosts
	}
	fn host_names(&self) -> &Self::Names {
		&self.host_names
	}
	fn folders(&self) -> &Self::Records {
		&self.folders
	}
	fn folder_names(&self) -> &Self::FolderNames {
		&self.folder_names
	}
	fn files(&self) -> &Self::Records {
		&self.files
	}
	fn file_names(&self) -> &Self::FileNames {
		&self.file_names
	}
	fn file_hashes(&self) -> &Self::FileHashes {
		&self.file_hashes
	}
	fn requests(&self) -> &Self::Records {
		&self.requests
	}
	fn request_changes(&self) -> &Self::RequestChanges {
		&self.request_changes
	}
	fn host_requests(&self) -> &Self::HostRequests {
		&self.host_requests
	}
	fn servers(&self) -> &Self::Records {
		&self.servers
	}
	fn request_servers(&self) -> &Self::Links {
		&self.request_servers
	}
}

impl<'txn> TreeView for WriteTables<'txn> {
	type Records = Table<'txn, u64, &'static [u8]>;
	type Names = Table<'txn, &'static str, u64>;
	type FolderNames = Table<'txn, (u64, u64, &'static [u8]), u64>;
	type FileNames = Table<'txn, (u64, &'static [u8]), u64>;
	type FileHashes = Table<'txn, (u64, &'static str, u64), ()>;
	type RequestChanges = Table<'txn, (u64, &'static [u8], i64), u64>;
	type HostRequests = Table<'txn, (u64, u64), ()>;
	type Links = Table<'txn, u64, u64>;

	fn regions(&self) -> &Self::Records {
		&self.regions
	}
	fn region_names(&self) -> &Self::Names {
		&self.region_names
	}
	fn hosts(&self) -> &Self::Records {
		&self.hosts
	}
	fn host_names(&self) -> &Self::Names {
		&self.host_names
	}
	fn folders(&self) -> &Self::Records {
		&self.folders
	}
	fn folder_names(&self) -> &Self::FolderNames {
		&self.folder_names
	}
	fn files(&self) -> &Self::Records {
		&self.files
	}
	fn file_names(&self) -> &Self::FileNames {
		&self.file_names
	}
	fn file_hashes(&self) -> &Self::FileHashes {
		&self.file_hashes
	}
	fn requests(&self) -> &Self::Records {
		&self.requests
	}
	fn request_changes(&self) -> &Self::RequestChanges {
		&self.request_changes
	}
	fn host_requests(&self) -> &Self::HostRequests {
		&self.host_requests
	}
	fn servers(&self) -> &Self::Records {
		&self.servers
	}
	fn request_servers(&self) -> &Self::Links {
		&self.request_servers
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_open_creates_empty_store() {
		let tmp = TempDir::new().unwrap();
		let store = Store::open(&tmp.path().join("store.redb")).unwrap();
		assert_eq!(store.stats().unwrap(), StoreStats::default());
	}

	#[test]
	fn test_failed_write_rolls_back() {
		let tmp = TempDir::new().unwrap();
		let store = Store::open(&tmp.path().join("store.redb")).unwrap();

		let result: Result<()> = store.write(|t| {
			t.ensure_host("alpha")?;
			Err(MirrorError::protocol("boom"))
		});
		assert!(result.is_err());
		assert!(store.read(|t| t.host_by_name("alpha")).unwrap().is_none());
	}

	#[test]
	fn test_ids_are_sequential_per_kind() {
		let tmp = TempDir::new().unwrap();
		let store = Store::open(&tmp.path().join("store.redb")).unwrap();
		let a = store.host_by_name_or_create("a").unwrap();
		let b = store.host_by_name_or_create("b").unwrap();
		let region = store.create_region("eu").unwrap();
		assert_eq!((a.id, b.id, region.id), (1, 2, 1));
	}
}

// vim: ts=4
