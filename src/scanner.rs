//! Scanner: reconcile a host's filesystem against the Tree Store
//!
//! Every registered root seeds a shared [`WorkQueue`]; a pool of tokio tasks
//! pops folders, reconciles their entries on the blocking pool and pushes the
//! subfolders back. A round ends when nothing is queued or in progress.
//!
//! Files are never created directly: an unknown or changed file becomes a
//! HashRequest and only turns into a File once a hasher has digested it.

use std::collections::{HashSet, VecDeque};
use std::ffi::OsString;
use std::fs;
use std::ops::AddAssign;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::config::ScannerConfig;
use crate::error::{MirrorError, Result};
use crate::logging::*;
use crate::store::{Folder, Host, Name, Node, Store, TreeView, WriteTables};

/// Modification time in nanoseconds since the Unix epoch
pub fn mtime_nanos(meta: &fs::Metadata) -> i64 {
	meta.mtime().saturating_mul(1_000_000_000).saturating_add(meta.mtime_nsec())
}

// ============================================================================
// WORK QUEUE
// ============================================================================

/// FIFO shared by the scan workers
///
/// `pending` counts items pushed but not yet marked [`done`](Self::done), so
/// an empty FIFO with a folder still being processed is not drained yet: that
/// folder may push children.
pub struct WorkQueue<T> {
	items: Mutex<VecDeque<T>>,
	pending: AtomicUsize,
	notify: Notify,
}

impl<T> Default for WorkQueue<T> {
	fn default() -> Self {
		WorkQueue { items: Mutex::new(VecDeque::new()), pending: AtomicUsize::new(0), notify: Notify::new() }
	}
}

impl<T> WorkQueue<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn push(&self, item: T) {
		self.pending.fetch_add(1, Ordering::SeqCst);
		self.items.lock().await.push_back(item);
		self.notify.notify_waiters();
	}

	/// Next item, or None once the queue is drained
	pub async fn pop(&self) -> Option<T> {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			// Register before checking so a push or done in between is not missed
			notified.as_mut().enable();

			if let Some(item) = self.items.lock().await.pop_front() {
				return Some(item);
			}
			if self.pending.load(Ordering::SeqCst) == 0 {
				return None;
			}
			notified.await;
		}
	}

	/// Mark one popped item as fully processed
	pub fn done(&self) {
		if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
			self.notify.notify_waiters();
		}
	}

	/// Items queued or in progress
	pub fn pending(&self) -> usize {
		self.pending.load(Ordering::SeqCst)
	}
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Counters of one scan round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
	pub folders_scanned: u64,
	pub folders_added: u64,
	pub requests_created: u64,
	/// Folders, files and stale hash requests deleted
	pub entries_removed: u64,
	pub errors: u64,
}

impl ScanStats {
	/// Store mutations caused by the round; zero for an unchanged filesystem
	pub fn mutations(&self) -> u64 {
		self.folders_added + self.requests_created + self.entries_removed
	}
}

impl AddAssign for ScanStats {
	fn add_assign(&mut self, other: Self) {
		self.folders_scanned += other.folders_scanned;
		self.folders_added += other.folders_added;
		self.requests_created += other.requests_created;
		self.entries_removed += other.entries_removed;
		self.errors += other.errors;
	}
}

/// Effect of reconciling a single directory entry
#[derive(Debug, Default)]
struct EntryChange {
	/// Folder to scan next
	visit: Option<Folder>,
	folder_added: bool,
	request_created: bool,
	removed: u64,
}

impl EntryChange {
	fn stats(&self) -> ScanStats {
		ScanStats {
			folders_added: self.folder_added as u64,
			requests_created: self.request_created as u64,
			entries_removed: self.removed,
			..ScanStats::default()
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
	Directory,
	Regular { mtime: i64, size: u64 },
}

// ============================================================================
// SCANNER
// ============================================================================

#[derive(Clone)]
pub struct Scanner {
	store: Store,
	host: Host,
	config: ScannerConfig,
	exclude: Arc<Vec<glob::Pattern>>,
}

impl Scanner {
	/// Scanner for `host`, which must be the machine we are running on
	pub fn new(store: Store, host: Host, config: ScannerConfig) -> Result<Self> {
		if !host.is_local() {
			return Err(MirrorError::NotLocal { host: host.name });
		}
		let exclude = config
			.exclude
			.iter()
			.map(|p| {
				glob::Pattern::new(p).map_err(|e| MirrorError::InvalidConfig {
					message: format!("bad exclude pattern {:?}: {}", p, e),
				})
			})
			.collect::<Result<Vec<_>>>()?;
		Ok(Scanner { store, host, config, exclude: Arc::new(exclude) })
	}

	pub fn host(&self) -> &Host {
		&self.host
	}

	/// Scan rounds separated by the configured interval; one round when `once`
	pub async fn run(&self) -> Result<()> {
		loop {
			match self.run_round().await {
				Ok(stats) if stats.errors > 0 => {
					warn!("Scan round finished with {} errors: {:?}", stats.errors, stats)
				}
				Ok(stats) => info!("Scan round finished: {:?}", stats),
				Err(e) => error!("Scan round failed: {}", e),
			}
			if self.config.once {
				return Ok(());
			}
			tokio::time::sleep(self.config.interval()).await;
		}
	}

	/// Scan every root once and wait until the queue drains
	pub async fn run_round(&self) -> Result<ScanStats> {
		let roots = self.store.roots(self.host.id)?;
		if roots.is_empty() {
			warn!("Host {} has no registered roots", self.host.name);
		}

		let queue = Arc::new(WorkQueue::new());
		for root in roots {
			queue.push(root).await;
		}

		let mut workers = Vec::with_capacity(self.config.workers);
		for _ in 0..self.config.workers.max(1) {
			workers.push(tokio::spawn(self.clone().worker(queue.clone())));
		}

		let mut stats = ScanStats::default();
		for worker in workers {
			match worker.await {
				Ok(worker_stats) => stats += worker_stats,
				Err(e) => {
					error!("Scan worker died: {}", e);
					stats.errors += 1;
				}
			}
		}
		Ok(stats)
	}

	async fn worker(self, queue: Arc<WorkQueue<Folder>>) -> ScanStats {
		let mut stats = ScanStats::default();
		while let Some(folder) = queue.pop().await {
			let scanner = self.clone();
			let id = folder.id;
			match tokio::task::spawn_blocking(move || scanner.scan_folder(&folder)).await {
				Ok(Ok((subfolders, folder_stats))) => {
					stats += folder_stats;
					for sub in subfolders {
						queue.push(sub).await;
					}
				}
				Ok(Err(e)) => {
					warn!("Cannot scan folder {}: {}", id, e);
					stats.errors += 1;
				}
				Err(e) => {
					error!("Scan of folder {} aborted: {}", id, e);
					stats.errors += 1;
				}
			}
			queue.done();
		}
		stats
	}

	fn is_excluded(&self, name: &Name) -> bool {
		let name = name.to_string();
		self.exclude.iter().any(|p| p.matches(&name))
	}

	/// Reconcile the direct children of one folder, then tombstone the rest
	///
	/// Returns the subfolders to scan next.
	fn scan_folder(&self, folder: &Folder) -> Result<(Vec<Folder>, ScanStats)> {
		let dir = PathBuf::from(OsString::from_vec(self.store.folder_path(folder)?));
		debug!("Scanning {}", dir.display());

		let mut stats = ScanStats::default();
		let mut subfolders = Vec::new();
		let mut seen: HashSet<Vec<u8>> = HashSet::new();

		for entry in fs::read_dir(&dir)? {
			let entry = match entry {
				Ok(e) => e,
				Err(e) => {
					warn!("Cannot read entry in {}: {}", dir.display(), e);
					stats.errors += 1;
					continue;
				}
			};
			let name = Name::from(entry.file_name());
			if self.is_excluded(&name) {
				continue;
			}

			let path = entry.path();
			let kind = match fs::symlink_metadata(&path) {
				Ok(meta) if meta.is_dir() => EntryKind::Directory,
				Ok(meta) if meta.is_file() => {
					EntryKind::Regular { mtime: mtime_nanos(&meta), size: meta.len() }
				}
				Ok(_) => {
					debug!("Skipping special file {}", path.display());
					continue;
				}
				Err(e) => {
					// Keep the record: a transient error must not tombstone it
					warn!("Cannot stat {}: {}", path.display(), e);
					stats.errors += 1;
					seen.insert(name.into_bytes());
					continue;
				}
			};

			match self.store.write(|t| reconcile_entry(t, folder, &name, kind)) {
				Ok(change) => {
					stats += change.stats();
					subfolders.extend(change.visit);
				}
				Err(e) => {
					warn!("Cannot reconcile {}: {}", path.display(), e);
					stats.errors += 1;
				}
			}
			seen.insert(name.into_bytes());
		}

		stats.entries_removed += self.store.write(|t| tombstone(t, folder, &seen))?;
		stats.folders_scanned += 1;
		Ok((subfolders, stats))
	}
}

/// Bring the store in line with one on-disk entry, in one transaction
fn reconcile_entry(
	t: &mut WriteTables<'_>,
	folder: &Folder,
	name: &Name,
	kind: EntryKind,
) -> Result<EntryChange> {
	let mut change = EntryChange::default();
	let existing = t.child_by_name(folder, name.as_bytes())?;

	match (kind, existing) {
		(EntryKind::Directory, Some(Node::Folder(sub))) => change.visit = Some(sub),
		(EntryKind::Directory, existing) => {
			if let Some(Node::File(file)) = existing {
				t.remove_file(&file)?;
				change.removed += 1;
			}
			for request in t.requests_for_name(folder.id, name.as_bytes())? {
				if !request.locked {
					t.remove_request(&request)?;
					change.removed += 1;
				}
			}
			let sub = t.create_folder(folder.host, Some(folder), name.clone())?;
			debug!("New folder {} ({:?})", sub.id, sub.name);
			change.folder_added = true;
			change.visit = Some(sub);
		}
		(EntryKind::Regular { mtime, size }, Some(Node::File(file)))
			if file.mtime == mtime && file.size == size => {}
		(EntryKind::Regular { mtime, size }, existing) => {
			match existing {
				Some(Node::File(file)) => {
					debug!("File {:?} changed", file.name);
					t.remove_file(&file)?;
					change.removed += 1;
				}
				Some(Node::Folder(sub)) => {
					debug!("Folder {:?} became a file", sub.name);
					change.removed += t.remove_folder(&sub)?;
				}
				None => {}
			}
			request_hash(t, folder, name, mtime, size, &mut change)?;
		}
	}
	Ok(change)
}

/// Ensure exactly one pending request describes the file's current state
fn request_hash(
	t: &mut WriteTables<'_>,
	folder: &Folder,
	name: &Name,
	mtime: i64,
	size: u64,
	change: &mut EntryChange,
) -> Result<()> {
	let pending = t.requests_for_name(folder.id, name.as_bytes())?;
	if pending.iter().any(|r| r.mtime == mtime && r.size == size) {
		return Ok(());
	}
	if let Some(locked) = pending.iter().find(|r| r.locked) {
		debug!("Hash request {} for {:?} is being processed, skipping", locked.id, name);
		return Ok(());
	}
	for stale in pending {
		t.remove_request(&stale)?;
		change.removed += 1;
	}
	t.create_request(folder, name.clone(), mtime, size)?;
	change.request_created = true;
	Ok(())
}

/// Delete records under `folder` whose name was not seen on disk
fn tombstone(t: &mut WriteTables<'_>, folder: &Folder, seen: &HashSet<Vec<u8>>) -> Result<u64> {
	let mut removed = 0;
	for file in t.files_in(folder.id)? {
		if !seen.contains(file.name.as_bytes()) {
			debug!("File {:?} vanished", file.name);
			t.remove_file(&file)?;
			removed += 1;
		}
	}
	for sub in t.subfolders(folder)? {
		if !seen.contains(sub.name.as_bytes()) {
			debug!("Folder {:?} vanished", sub.name);
			removed += t.remove_folder(&sub)?;
		}
	}
	for request in t.requests_in_folder(folder.id)? {
		if !request.locked && !seen.contains(request.name.as_bytes()) {
			t.remove_request(&request)?;
			removed += 1;
		}
	}
	Ok(removed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::resolve::add_root;
	use filetime::FileTime;
	use std::os::unix::ffi::OsStrExt;
	use std::path::Path;
	use tempfile::TempDir;

	struct Fixture {
		_tmp: TempDir,
		data: PathBuf,
		store: Store,
		scanner: Scanner,
		root: Folder,
	}

	fn fixture(exclude: &[&str]) -> Fixture {
		let tmp = TempDir::new().unwrap();
		let data = tmp.path().join("data");
		fs::create_dir(&data).unwrap();
		let store = Store::open(&tmp.path().join("store.redb")).unwrap();
		let host = store.host_by_name_or_create(&crate::local_hostname().unwrap()).unwrap();
		let root = add_root(&store, &host, data.as_os_str().as_bytes()).unwrap();
		let config = ScannerConfig {
			workers: 4,
			once: true,
			exclude: exclude.iter().map(|s| s.to_string()).collect(),
			..ScannerConfig::default()
		};
		let scanner = Scanner::new(store.clone(), host, config).unwrap();
		Fixture { _tmp: tmp, data, store, scanner, root }
	}

	fn write(path: &Path, content: &[u8], mtime_secs: i64) {
		fs::write(path, content).unwrap();
		filetime::set_file_mtime(path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
	}

	#[test]
	fn test_mtime_nanos() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("f");
		fs::write(&path, b"x").unwrap();
		filetime::set_file_mtime(&path, FileTime::from_unix_time(100, 5)).unwrap();
		assert_eq!(mtime_nanos(&fs::metadata(&path).unwrap()), 100_000_000_005);
	}

	#[tokio::test]
	async fn test_work_queue_drains_after_done() {
		let queue = Arc::new(WorkQueue::new());
		queue.push(1).await;
		assert_eq!(queue.pop().await, Some(1));

		// Still in progress: a second consumer must wait for the push
		let waiter = {
			let queue = queue.clone();
			tokio::spawn(async move { queue.pop().await })
		};
		queue.push(2).await;
		queue.done();
		assert_eq!(waiter.await.unwrap(), Some(2));
		queue.done();
		assert_eq!(queue.pending(), 0);
		assert_eq!(queue.pop().await, None);
	}

	#[test]
	fn test_remote_host_rejected() {
		let tmp = TempDir::new().unwrap();
		let store = Store::open(&tmp.path().join("store.redb")).unwrap();
		let host = store.host_by_name_or_create("not-this-machine.invalid").unwrap();
		assert!(matches!(
			Scanner::new(store, host, ScannerConfig::default()),
			Err(MirrorError::NotLocal { .. })
		));
	}

	#[tokio::test]
	async fn test_scan_is_idempotent() {
		let f = fixture(&[]);
		write(&f.data.join("x"), b"0123456789", 100);
		fs::create_dir(f.data.join("sub")).unwrap();
		write(&f.data.join("sub/y"), b"y", 200);

		let first = f.scanner.run_round().await.unwrap();
		assert_eq!(first.folders_scanned, 2);
		assert_eq!(first.folders_added, 1);
		assert_eq!(first.requests_created, 2);
		assert_eq!(first.errors, 0);

		let request = f.store.request_by_change(f.root.id, b"x", 100_000_000_000).unwrap().unwrap();
		assert_eq!(request.size, 10);

		let second = f.scanner.run_round().await.unwrap();
		assert_eq!(second.mutations(), 0);
		assert_eq!(second.folders_scanned, 2);
	}

	#[tokio::test]
	async fn test_changed_file_supersedes_pending_request() {
		let f = fixture(&[]);
		write(&f.data.join("x"), b"one", 100);
		f.scanner.run_round().await.unwrap();

		write(&f.data.join("x"), b"three", 300);
		let stats = f.scanner.run_round().await.unwrap();
		assert_eq!((stats.requests_created, stats.entries_removed), (1, 1));

		let pending = f.store.requests_in_folder(f.root.id).unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!((pending[0].mtime, pending[0].size), (300_000_000_000, 5));
	}

	#[tokio::test]
	async fn test_locked_request_is_left_alone() {
		let f = fixture(&[]);
		write(&f.data.join("x"), b"one", 100);
		f.scanner.run_round().await.unwrap();
		f.store.announce(f.scanner.host().id, "127.0.0.1", 1).unwrap();
		let claim = f.store.claim(f.scanner.host().id).unwrap().unwrap();

		write(&f.data.join("x"), b"three", 300);
		let stats = f.scanner.run_round().await.unwrap();
		assert_eq!(stats.mutations(), 0);
		assert!(f.store.request(claim.request.id).unwrap().unwrap().locked);
	}

	#[tokio::test]
	async fn test_hashed_file_change_becomes_request() {
		let f = fixture(&[]);
		write(&f.data.join("x"), b"one", 100);
		f.scanner.run_round().await.unwrap();
		f.store.announce(f.scanner.host().id, "127.0.0.1", 1).unwrap();
		let claim = f.store.claim(f.scanner.host().id).unwrap().unwrap();
		f.store.complete(&claim, "digest").unwrap();

		assert_eq!(f.scanner.run_round().await.unwrap().mutations(), 0);

		write(&f.data.join("x"), b"one", 150);
		let stats = f.scanner.run_round().await.unwrap();
		assert_eq!((stats.entries_removed, stats.requests_created), (1, 1));
		assert!(f.store.files_in(f.root.id).unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_tombstone_pass() {
		let f = fixture(&[]);
		write(&f.data.join("x"), b"x", 100);
		fs::create_dir_all(f.data.join("sub/deeper")).unwrap();
		f.scanner.run_round().await.unwrap();
		assert_eq!(f.store.stats().unwrap().folders, 3);

		fs::remove_file(f.data.join("x")).unwrap();
		fs::remove_dir_all(f.data.join("sub")).unwrap();
		let stats = f.scanner.run_round().await.unwrap();
		// Two folders plus the retired hash request
		assert_eq!(stats.entries_removed, 3);

		let totals = f.store.stats().unwrap();
		assert_eq!((totals.folders, totals.requests), (1, 0));
	}

	#[tokio::test]
	async fn test_kind_change() {
		let f = fixture(&[]);
		write(&f.data.join("k"), b"k", 100);
		f.scanner.run_round().await.unwrap();

		fs::remove_file(f.data.join("k")).unwrap();
		fs::create_dir(f.data.join("k")).unwrap();
		let stats = f.scanner.run_round().await.unwrap();
		assert_eq!((stats.folders_added, stats.entries_removed), (1, 1));
		assert!(matches!(f.store.child_by_name(&f.root, b"k").unwrap(), Some(Node::Folder(_))));
	}

	#[tokio::test]
	async fn test_excluded_and_special_entries_skipped() {
		let f = fixture(&["*.tmp"]);
		write(&f.data.join("keep"), b"k", 100);
		write(&f.data.join("scratch.tmp"), b"t", 100);
		std::os::unix::fs::symlink(f.data.join("keep"), f.data.join("link")).unwrap();

		let stats = f.scanner.run_round().await.unwrap();
		assert_eq!(stats.requests_created, 1);
		let pending = f.store.requests_in_folder(f.root.id).unwrap();
		assert_eq!(pending[0].name, Name::from("keep"));
	}

	#[tokio::test]
	async fn test_missing_root_counts_error() {
		let f = fixture(&[]);
		fs::remove_dir(&f.data).unwrap();
		let stats = f.scanner.run_round().await.unwrap();
		assert_eq!(stats.errors, 1);
		assert_eq!(f.store.roots(f.scanner.host().id).unwrap().len(), 1);
	}
}

// vim: ts=4
