//! Sync change-set planner
//!
//! Diffs two folder subtrees and lists what would have to happen for the
//! destination to mirror the source. Nothing is executed: the result is a
//! plan, read from a single store snapshot.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::logging::*;
use crate::resolve::resolve_folder;
use crate::store::{File, Folder, Id, Name, Node, Store, TreeView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
	/// Transfer bytes from the source
	Copy,
	/// Duplicate a file already present on the destination host
	LinkedCopy,
	/// Overwrite an older destination file
	Replace,
	/// Both sides differ and the destination is not older; never resolved
	Conflict,
	Delete,
}

impl ChangeKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChangeKind::Copy => "COPY",
			ChangeKind::LinkedCopy => "LCOPY",
			ChangeKind::Replace => "REPLACE",
			ChangeKind::Conflict => "CONFLICT",
			ChangeKind::Delete => "DELETE",
		}
	}

	/// True if executing the change moves source bytes over the network
	pub fn transfers(&self) -> bool {
		matches!(self, ChangeKind::Copy | ChangeKind::Replace | ChangeKind::Conflict)
	}
}

impl fmt::Display for ChangeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// An existing tree entry with its rendered location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
	pub node: Node,
	pub uri: String,
	/// File size, or the summed size of every file below a folder
	pub size: u64,
}

/// Where a change lands on the destination side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
	Existing(Entry),
	/// Not there yet: `name` inside destination folder `parent`
	Planned { parent: Id, name: Name, uri: String },
}

impl Target {
	pub fn uri(&self) -> &str {
		match self {
			Target::Existing(entry) => &entry.uri,
			Target::Planned { uri, .. } => uri,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
	pub kind: ChangeKind,
	/// None for deletions
	pub source: Option<Entry>,
	pub target: Target,
}

impl fmt::Display for Change {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let source = self.source.as_ref().map(|s| s.uri.as_str()).unwrap_or("");
		write!(f, "{} {} -> {}", self.kind, source, self.target.uri())
	}
}

/// Ordered changes bringing a destination subtree in line with a source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
	changes: Vec<Change>,
}

impl ChangeSet {
	pub fn compute(store: &Store, source: &Folder, destination: &Folder) -> Result<Self> {
		store.read(|t| {
			let mut planner = Planner { view: t, changes: Vec::new() };
			planner.diff(source, destination)?;
			Ok(ChangeSet { changes: planner.changes })
		})
	}

	/// Resolve both `<host>::<path>` URIs to folders and diff them
	pub fn between_uris(store: &Store, source: &str, destination: &str) -> Result<Self> {
		let source_folder = resolve_folder(store, source)?;
		info!("Source: {}", source);
		let destination_folder = resolve_folder(store, destination)?;
		info!("Target: {}", destination);
		Self::compute(store, &source_folder, &destination_folder)
	}

	pub fn len(&self) -> usize {
		self.changes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.changes.is_empty()
	}

	pub fn iter(&self) -> std::slice::Iter<'_, Change> {
		self.changes.iter()
	}

	pub fn counts(&self) -> BTreeMap<ChangeKind, usize> {
		let mut counts = BTreeMap::new();
		for change in &self.changes {
			*counts.entry(change.kind).or_insert(0) += 1;
		}
		counts
	}

	/// Bytes that would cross the network; linked copies and deletions are free
	pub fn transfer_size(&self) -> u64 {
		self.changes
			.iter()
			.filter(|c| c.kind.transfers())
			.filter_map(|c| c.source.as_ref())
			.map(|s| s.size)
			.sum()
	}

	/// One line per change, with `<SOURCE>`, `<TYPE>` and `<TARGET>` substituted
	pub fn render(&self, format: &str) -> String {
		let mut output = String::new();
		for change in &self.changes {
			let source = change.source.as_ref().map(|s| s.uri.as_str()).unwrap_or("");
			let line = format
				.replace("<SOURCE>", source)
				.replace("<TARGET>", change.target.uri())
				.replace("<TYPE>", change.kind.as_str());
			output.push_str(&line);
			output.push('\n');
		}
		output
	}
}

impl<'a> IntoIterator for &'a ChangeSet {
	type Item = &'a Change;
	type IntoIter = std::slice::Iter<'a, Change>;

	fn into_iter(self) -> Self::IntoIter {
		self.changes.iter()
	}
}

struct Planner<'v, V: TreeView> {
	view: &'v V,
	changes: Vec<Change>,
}

impl<V: TreeView> Planner<'_, V> {
	fn entry(&self, node: Node) -> Result<Entry> {
		let uri = self.view.node_uri(&node)?;
		let size = match &node {
			Node::File(file) => file.size,
			Node::Folder(folder) => self.tree_size(folder)?,
		};
		Ok(Entry { node, uri, size })
	}

	fn tree_size(&self, folder: &Folder) -> Result<u64> {
		let mut size = 0;
		let mut stack = vec![folder.clone()];
		while let Some(current) = stack.pop() {
			size += self.view.files_in(current.id)?.iter().map(|f| f.size).sum::<u64>();
			stack.extend(self.view.subfolders(&current)?);
		}
		Ok(size)
	}

	fn planned(&self, parent: &Folder, name: &Name) -> Result<Target> {
		let parent_uri = self.view.node_uri(&Node::Folder(parent.clone()))?;
		Ok(Target::Planned { parent: parent.id, name: name.clone(), uri: format!("{}{}", parent_uri, name) })
	}

	fn push(&mut self, kind: ChangeKind, source: Option<Entry>, target: Target) {
		let change = Change { kind, source, target };
		debug!("Adding change: {}", change);
		self.changes.push(change);
	}

	fn diff(&mut self, source: &Folder, destination: &Folder) -> Result<()> {
		for file in self.view.files_in(source.id)? {
			match self.view.child_by_name(destination, file.name.as_bytes())? {
				None => self.copy_file(file, destination)?,
				Some(Node::File(existing)) if existing.hash == file.hash => {}
				Some(Node::File(existing)) => {
					let kind =
						if file.mtime > existing.mtime { ChangeKind::Replace } else { ChangeKind::Conflict };
					let source = self.entry(Node::File(file))?;
					let target = Target::Existing(self.entry(Node::File(existing))?);
					self.push(kind, Some(source), target);
				}
				// A folder where the source has a file
				Some(other) => {
					let source = self.entry(Node::File(file))?;
					let target = Target::Existing(self.entry(other)?);
					self.push(ChangeKind::Conflict, Some(source), target);
				}
			}
		}

		for sub in self.view.subfolders(source)? {
			match self.view.child_by_name(destination, sub.name.as_bytes())? {
				None => {
					let target = self.planned(destination, &sub.name)?;
					let source = self.entry(Node::Folder(sub))?;
					self.push(ChangeKind::Copy, Some(source), target);
				}
				Some(Node::Folder(existing)) => self.diff(&sub, &existing)?,
				Some(other) => {
					let source = self.entry(Node::Folder(sub))?;
					let target = Target::Existing(self.entry(other)?);
					self.push(ChangeKind::Conflict, Some(source), target);
				}
			}
		}

		for file in self.view.files_in(destination.id)? {
			if self.view.child_by_name(source, file.name.as_bytes())?.is_none() {
				let target = Target::Existing(self.entry(Node::File(file))?);
				self.push(ChangeKind::Delete, None, target);
			}
		}
		for sub in self.view.subfolders(destination)? {
			if self.view.child_by_name(source, sub.name.as_bytes())?.is_none() {
				let target = Target::Existing(self.entry(Node::Folder(sub))?);
				self.push(ChangeKind::Delete, None, target);
			}
		}
		Ok(())
	}

	/// COPY, or LCOPY when the destination host already holds the content
	fn copy_file(&mut self, file: File, destination: &Folder) -> Result<()> {
		let target = self.planned(destination, &file.name)?;
		match self.view.files_by_hash(destination.host, &file.hash)?.into_iter().next() {
			Some(local) => {
				let source = self.entry(Node::File(local))?;
				self.push(ChangeKind::LinkedCopy, Some(source), target);
			}
			None => {
				let source = self.entry(Node::File(file))?;
				self.push(ChangeKind::Copy, Some(source), target);
			}
		}
		Ok(())
	}
}


// vim: ts=4
