//! Region, host, folder and file records

use redb::ReadableTable;

use super::records::*;
use super::{save, Store, TreeView, WriteTables};
use crate::error::{MirrorError, Result};
use crate::logging::*;

impl WriteTables<'_> {
	pub fn create_region(&mut self, name: &str) -> Result<Region> {
		if self.region_names.get(name)?.is_some() {
			return Err(MirrorError::already_exists(format!("region {}", name)));
		}
		let region = Region { id: self.next_id("region")?, name: name.to_string() };
		save(&mut self.regions, region.id, &region)?;
		self.region_names.insert(name, region.id)?;
		debug!("Created {:?}", region);
		Ok(region)
	}

	/// Host with this name, created when missing
	pub fn ensure_host(&mut self, name: &str) -> Result<Host> {
		if let Some(host) = self.host_by_name(name)? {
			return Ok(host);
		}
		let host = Host { id: self.next_id("host")?, name: name.to_string(), region: None };
		save(&mut self.hosts, host.id, &host)?;
		self.host_names.insert(name, host.id)?;
		debug!("Created {:?}", host);
		Ok(host)
	}

	pub fn set_host_region(&mut self, host: Id, region: Option<Id>) -> Result<Host> {
		let mut record = self.require_host(host)?;
		if let Some(region) = region {
			if self.region(region)?.is_none() {
				return Err(MirrorError::not_found(format!("region {}", region)));
			}
		}
		record.region = region;
		save(&mut self.hosts, record.id, &record)?;
		Ok(record)
	}

	/// Fail with AlreadyExists if `name` is taken by a file or folder under `parent`
	fn check_free(&self, host: Id, parent: Option<Id>, name: &[u8]) -> Result<()> {
		let parent_id = parent.unwrap_or(0);
		let folder_taken = self.folder_names.get((host, parent_id, name))?.is_some();
		let file_taken = match parent {
			Some(p) => self.file_names.get((p, name))?.is_some(),
			None => false,
		};
		if folder_taken || file_taken {
			return Err(MirrorError::already_exists(format!(
				"{} under folder {}",
				String::from_utf8_lossy(name),
				parent_id
			)));
		}
		Ok(())
	}

	/// Create a folder; `parent == None` creates a root
	pub fn create_folder(&mut self, host: Id, parent: Option<&Folder>, name: Name) -> Result<Folder> {
		if name.is_empty() {
			return Err(MirrorError::InvalidConfig { message: "empty folder name".into() });
		}
		if let Some(p) = parent {
			if p.host != host {
				return Err(MirrorError::Transaction {
					message: format!("folder {} belongs to another host", p.id),
				});
			}
		}
		let parent_id = parent.map(|p| p.id);
		self.check_free(host, parent_id, name.as_bytes())?;

		let folder = Folder { id: self.next_id("folder")?, name, host, parent: parent_id };
		save(&mut self.folders, folder.id, &folder)?;
		self.folder_names.insert((host, parent_id.unwrap_or(0), folder.name.as_bytes()), folder.id)?;
		debug!("Created folder {} ({:?})", folder.id, folder.name);
		Ok(folder)
	}

	pub fn create_file(
		&mut self,
		folder: &Folder,
		name: Name,
		hash: &str,
		mtime: i64,
		size: u64,
	) -> Result<File> {
		self.check_free(folder.host, Some(folder.id), name.as_bytes())?;

		let file = File {
			id: self.next_id("file")?,
			name,
			hash: hash.to_string(),
			mtime,
			size,
			host: folder.host,
			folder: folder.id,
		};
		save(&mut self.files, file.id, &file)?;
		self.file_names.insert((folder.id, file.name.as_bytes()), file.id)?;
		self.file_hashes.insert((file.host, file.hash.as_str(), file.id), ())?;
		debug!("Created file {} ({:?})", file.id, file.name);
		Ok(file)
	}

	pub fn remove_file(&mut self, file: &File) -> Result<()> {
		self.files.remove(file.id)?;
		self.file_names.remove((file.folder, file.name.as_bytes()))?;
		self.file_hashes.remove((file.host, file.hash.as_str(), file.id))?;
		debug!("Deleted file {} ({:?})", file.id, file.name);
		Ok(())
	}

	/// Delete a folder with every descendant folder, file, request and server
	///
	/// Returns the number of folders and files removed.
	pub fn remove_folder(&mut self, folder: &Folder) -> Result<u64> {
		let mut removed = 0;
		let mut stack = vec![folder.clone()];
		while let Some(current) = stack.pop() {
			for file in self.files_in(current.id)? {
				self.remove_file(&file)?;
				removed += 1;
			}
			for request in self.requests_in_folder(current.id)? {
				self.remove_request(&request)?;
			}
			stack.extend(self.subfolders(&current)?);

			self.folders.remove(current.id)?;
			self.folder_names
				.remove((current.host, current.parent.unwrap_or(0), current.name.as_bytes()))?;
			removed += 1;
		}
		debug!("Deleted folder {} and {} entries below it", folder.id, removed - 1);
		Ok(removed)
	}
}

/// Convenience wrappers running one operation per transaction
impl Store {
	pub fn create_region(&self, name: &str) -> Result<Region> {
		self.write(|t| t.create_region(name))
	}

	pub fn region_by_name(&self, name: &str) -> Result<Option<Region>> {
		self.read(|t| t.region_by_name(name))
	}

	pub fn host(&self, id: Id) -> Result<Option<Host>> {
		self.read(|t| t.host(id))
	}

	pub fn host_by_name(&self, name: &str) -> Result<Option<Host>> {
		self.read(|t| t.host_by_name(name))
	}

	pub fn host_by_name_or_create(&self, name: &str) -> Result<Host> {
		if let Some(host) = self.host_by_name(name)? {
			return Ok(host);
		}
		self.write(|t| t.ensure_host(name))
	}

	pub fn set_host_region(&self, host: Id, region: Option<Id>) -> Result<Host> {
		self.write(|t| t.set_host_region(host, region))
	}

	pub fn folder(&self, id: Id) -> Result<Option<Folder>> {
		self.read(|t| t.folder(id))
	}

	pub fn file(&self, id: Id) -> Result<Option<File>> {
		self.read(|t| t.file(id))
	}

	pub fn roots(&self, host: Id) -> Result<Vec<Folder>> {
		self.read(|t| t.roots(host))
	}

	pub fn add_folder(&self, parent: &Folder, name: impl Into<Name>) -> Result<Folder> {
		let name = name.into();
		self.write(|t| {
			let parent = t.require_folder(parent.id)?;
			t.create_folder(parent.host, Some(&parent), name)
		})
	}

	pub fn add_file(
		&self,
		folder: &Folder,
		name: impl Into<Name>,
		hash: &str,
		mtime: i64,
		size: u64,
	) -> Result<File> {
		let name = name.into();
		self.write(|t| {
			let folder = t.require_folder(folder.id)?;
			t.create_file(&folder, name, hash, mtime, size)
		})
	}

	pub fn child_by_name(&self, folder: &Folder, name: &[u8]) -> Result<Option<Node>> {
		self.read(|t| t.child_by_name(folder, name))
	}

	pub fn subfolders(&self, folder: &Folder) -> Result<Vec<Folder>> {
		self.read(|t| t.subfolders(folder))
	}

	pub fn files_in(&self, folder: Id) -> Result<Vec<File>> {
		self.read(|t| t.files_in(folder))
	}

	/// Delete a folder and everything below it; missing folders are NotFound
	pub fn delete_folder(&self, id: Id) -> Result<u64> {
		self.write(|t| {
			let folder = t.require_folder(id)?;
			t.remove_folder(&folder)
		})
	}

	pub fn delete_file(&self, id: Id) -> Result<()> {
		self.write(|t| {
			let file = t.file(id)?.ok_or_else(|| MirrorError::not_found(format!("file {}", id)))?;
			t.remove_file(&file)
		})
	}

	pub fn folder_path(&self, folder: &Folder) -> Result<Vec<u8>> {
		self.read(|t| t.folder_path(folder))
	}

	pub fn file_path(&self, file: &File) -> Result<Vec<u8>> {
		self.read(|t| t.file_path(file))
	}

	pub fn node_uri(&self, node: &Node) -> Result<String> {
		self.read(|t| t.node_uri(node))
	}

	pub fn files_by_hash(&self, host: Id, hash: &str) -> Result<Vec<File>> {
		self.read(|t| t.files_by_hash(host, hash))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn setup() -> (TempDir, Store, Host) {
		let tmp = TempDir::new().unwrap();
		let store = Store::open(&tmp.path().join("store.redb")).unwrap();
		let host = store.host_by_name_or_create("alpha").unwrap();
		(tmp, store, host)
	}

	fn root(store: &Store, host: &Host, name: &str) -> Folder {
		store.write(|t| t.create_folder(host.id, None, Name::from(name))).unwrap()
	}

	#[test]
	fn test_paths_concatenate_ancestors() {
		let (_tmp, store, host) = setup();
		let data = root(&store, &host, "/data/");
		let photos = store.add_folder(&data, "photos").unwrap();
		let trip = store.add_folder(&photos, "trip").unwrap();
		let file = store.add_file(&trip, "a.jpg", "h1", 1, 10).unwrap();

		assert_eq!(store.folder_path(&data).unwrap(), b"/data/".to_vec());
		assert_eq!(store.folder_path(&trip).unwrap(), b"/data/photos/trip/".to_vec());
		assert_eq!(store.file_path(&file).unwrap(), b"/data/photos/trip/a.jpg".to_vec());
		assert_eq!(store.node_uri(&Node::File(file)).unwrap(), "alpha::/data/photos/trip/a.jpg");
	}

	#[test]
	fn test_sibling_names_are_unique_across_kinds() {
		let (_tmp, store, host) = setup();
		let data = root(&store, &host, "/data/");
		store.add_folder(&data, "x").unwrap();

		assert!(matches!(store.add_folder(&data, "x"), Err(MirrorError::AlreadyExists { .. })));
		assert!(matches!(
			store.add_file(&data, "x", "h", 1, 1),
			Err(MirrorError::AlreadyExists { .. })
		));
	}

	#[test]
	fn test_child_by_name_finds_files_and_folders() {
		let (_tmp, store, host) = setup();
		let data = root(&store, &host, "/data/");
		let sub = store.add_folder(&data, "sub").unwrap();
		let file = store.add_file(&data, "f", "h", 1, 1).unwrap();

		assert_eq!(store.child_by_name(&data, b"sub").unwrap(), Some(Node::Folder(sub)));
		assert_eq!(store.child_by_name(&data, b"f").unwrap(), Some(Node::File(file)));
		assert_eq!(store.child_by_name(&data, b"missing").unwrap(), None);
	}

	#[test]
	fn test_delete_folder_cascades() {
		let (_tmp, store, host) = setup();
		let data = root(&store, &host, "/data/");
		let a = store.add_folder(&data, "a").unwrap();
		let b = store.add_folder(&a, "b").unwrap();
		store.add_file(&a, "f1", "h1", 1, 1).unwrap();
		store.add_file(&b, "f2", "h2", 1, 1).unwrap();
		store.create_hash_request(&b, "pending", 5, 5).unwrap();

		let removed = store.delete_folder(a.id).unwrap();
		assert_eq!(removed, 4);

		let stats = store.stats().unwrap();
		assert_eq!(stats.folders, 1);
		assert_eq!(stats.files, 0);
		assert_eq!(stats.requests, 0);
		assert!(store.files_by_hash(host.id, "h1").unwrap().is_empty());
		assert!(matches!(store.delete_folder(a.id), Err(MirrorError::NotFound { .. })));
	}

	#[test]
	fn test_delete_file_frees_name_and_hash() {
		let (_tmp, store, host) = setup();
		let data = root(&store, &host, "/data/");
		let file = store.add_file(&data, "f", "h1", 1, 1).unwrap();

		store.delete_file(file.id).unwrap();
		assert_eq!(store.child_by_name(&data, b"f").unwrap(), None);
		assert!(store.files_by_hash(host.id, "h1").unwrap().is_empty());
		assert!(matches!(store.delete_file(file.id), Err(MirrorError::NotFound { .. })));

		// The name is free again
		store.add_folder(&data, "f").unwrap();
	}

	#[test]
	fn test_files_by_hash_is_scoped_to_host() {
		let (_tmp, store, host) = setup();
		let other = store.host_by_name_or_create("beta").unwrap();
		let data = root(&store, &host, "/data/");
		let backup = root(&store, &other, "/backup/");
		let mine = store.add_file(&data, "x", "same", 1, 1).unwrap();
		store.add_file(&backup, "y", "same", 1, 1).unwrap();

		assert_eq!(store.files_by_hash(host.id, "same").unwrap(), vec![mine]);
		assert_eq!(store.files_by_hash(other.id, "same").unwrap().len(), 1);
		assert!(store.files_by_hash(host.id, "other").unwrap().is_empty());
	}

	#[test]
	fn test_host_region_assignment() {
		let (_tmp, store, host) = setup();
		let region = store.create_region("eu").unwrap();
		assert!(matches!(store.create_region("eu"), Err(MirrorError::AlreadyExists { .. })));

		let host = store.set_host_region(host.id, Some(region.id)).unwrap();
		assert_eq!(host.region, Some(region.id));
		assert_eq!(store.region_by_name("eu").unwrap(), Some(region));
		assert!(store.set_host_region(host.id, Some(99)).is_err());
	}
}

// vim: ts=4
