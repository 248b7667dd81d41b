//! Path resolution: `<host>::<path>` URIs to Folder/File records
//!
//! Paths are resolved against a host's registered roots. Root selection is
//! component-wise, so `/data2/x` never resolves through a root named `/data/`.

use std::fmt;

use crate::error::{MirrorError, Result};
use crate::logging::*;
use crate::store::{Folder, Host, Name, Node, Store, TreeView};

/// Separator between host and path in a URI
pub const URI_SEPARATOR: &str = "::";

/// A parsed `<host>::<path>` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
	pub host: String,
	pub path: Vec<u8>,
}

impl Uri {
	/// Split on the first `::`
	pub fn parse(uri: &str) -> Result<Self> {
		match uri.split_once(URI_SEPARATOR) {
			Some((host, path)) if !host.is_empty() => {
				Ok(Uri { host: host.to_string(), path: path.as_bytes().to_vec() })
			}
			_ => Err(MirrorError::InvalidUri { uri: uri.to_string() }),
		}
	}
}

impl fmt::Display for Uri {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{}{}", self.host, URI_SEPARATOR, String::from_utf8_lossy(&self.path))
	}
}

/// Ensure a trailing separator
pub fn normalize_root(path: &[u8]) -> Vec<u8> {
	let mut normalized = path.to_vec();
	if !normalized.ends_with(b"/") {
		normalized.push(b'/');
	}
	normalized
}

/// Non-empty path components
fn components(path: &[u8]) -> Vec<&[u8]> {
	path.split(|b| *b == b'/').filter(|c| !c.is_empty()).collect()
}

/// Number of leading components of `path` covered by `root`, if `root` is a
/// component-wise prefix of `path`
fn root_match(root: &[u8], path: &[u8]) -> Option<usize> {
	let root_parts = components(root);
	let path_parts = components(path);
	// An absolute root never covers a relative path, "/" included
	if root.starts_with(b"/") && !path.starts_with(b"/") {
		return None;
	}
	if root_parts.is_empty() && !root.starts_with(b"/") {
		return None;
	}
	if root_parts.len() > path_parts.len() {
		return None;
	}
	if root_parts.iter().zip(&path_parts).all(|(r, p)| r == p) {
		Some(root_parts.len())
	} else {
		None
	}
}

/// Resolve a URI, creating the host record if it is unknown
pub fn resolve(store: &Store, uri: &str) -> Result<Node> {
	let parsed = Uri::parse(uri)?;
	let host = store.host_by_name_or_create(&parsed.host)?;
	let node = descendant_by_path(store, &host, &parsed.path)?;
	debug!("Resolved {} to {:?}", uri, node);
	Ok(node)
}

/// Resolve a URI that must name a folder
pub fn resolve_folder(store: &Store, uri: &str) -> Result<Folder> {
	match resolve(store, uri)? {
		Node::Folder(folder) => Ok(folder),
		Node::File(_) => Err(MirrorError::not_found(format!("folder {}", uri))),
	}
}

/// Resolve a raw path against the roots registered for `host`
pub fn descendant_by_path(store: &Store, host: &Host, path: &[u8]) -> Result<Node> {
	store.read(|t| descendant_in(t, host, path))
}

/// Snapshot variant of [`descendant_by_path`]
pub fn descendant_in(view: &impl TreeView, host: &Host, path: &[u8]) -> Result<Node> {
	let not_found =
		|| MirrorError::not_found(format!("{}::{}", host.name, String::from_utf8_lossy(path)));

	let roots = view.roots(host.id)?;
	let normalized = normalize_root(path);
	if let Some(root) =
		roots.iter().find(|r| r.name.as_bytes() == path || r.name.as_bytes() == normalized.as_slice())
	{
		return Ok(Node::Folder(root.clone()));
	}

	let (root, depth) = roots
		.iter()
		.filter_map(|r| root_match(r.name.as_bytes(), path).map(|depth| (r, depth)))
		.max_by_key(|(_, depth)| *depth)
		.ok_or_else(not_found)?;

	let mut current = Node::Folder(root.clone());
	for part in components(path).into_iter().skip(depth) {
		let folder = match &current {
			Node::Folder(f) => f,
			// A file cannot have children
			Node::File(_) => return Err(not_found()),
		};
		current = view.child_by_name(folder, part)?.ok_or_else(not_found)?;
	}
	Ok(current)
}

/// Register `path` as a new root of `host`
pub fn add_root(store: &Store, host: &Host, path: &[u8]) -> Result<Folder> {
	if !path.starts_with(b"/") {
		return Err(MirrorError::InvalidConfig {
			message: format!("root {} is not an absolute path", String::from_utf8_lossy(path)),
		});
	}
	let name = Name::new(normalize_root(path));
	let root = store.write(|t| t.create_folder(host.id, None, name))?;
	info!("Added root {}::{}", host.name, root.name);
	Ok(root)
}

/// Remove a root and everything below it
pub fn remove_root(store: &Store, host: &Host, path: &[u8]) -> Result<u64> {
	let name = normalize_root(path);
	let root = store
		.roots(host.id)?
		.into_iter()
		.find(|r| r.name.as_bytes() == name.as_slice())
		.ok_or_else(|| {
			MirrorError::not_found(format!("root {}::{}", host.name, String::from_utf8_lossy(&name)))
		})?;
	let removed = store.delete_folder(root.id)?;
	info!("Removed root {}::{} ({} entries)", host.name, root.name, removed);
	Ok(removed)
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

	#[test]
	fn test_uri_parse() {
		let uri = Uri::parse("alpha::/data/x::y").unwrap();
		assert_eq!(uri.host, "alpha");
		assert_eq!(uri.path, b"/data/x::y".to_vec());
		assert_eq!(uri.to_string(), "alpha::/data/x::y");

		assert!(matches!(Uri::parse("/data"), Err(MirrorError::InvalidUri { .. })));
		assert!(matches!(Uri::parse("::/data"), Err(MirrorError::InvalidUri { .. })));
	}

	#[test]
	fn test_add_root_normalizes_and_rejects_duplicates() {
		let (_tmp, store, host) = setup();
		let root = add_root(&store, &host, b"/data").unwrap();
		assert_eq!(root.name.as_bytes(), b"/data/");
		assert!(matches!(add_root(&store, &host, b"/data/"), Err(MirrorError::AlreadyExists { .. })));
		assert!(add_root(&store, &host, b"relative").is_err());
	}

	#[test]
	fn test_remove_root() {
		let (_tmp, store, host) = setup();
		let root = add_root(&store, &host, b"/data").unwrap();
		store.add_folder(&root, "sub").unwrap();

		assert_eq!(remove_root(&store, &host, b"/data").unwrap(), 2);
		assert!(store.roots(host.id).unwrap().is_empty());
		assert!(matches!(remove_root(&store, &host, b"/data"), Err(MirrorError::NotFound { .. })));
	}

	#[test]
	fn test_resolve_round_trip() {
		let (_tmp, store, host) = setup();
		let root = add_root(&store, &host, b"/data").unwrap();
		let sub = store.add_folder(&root, "sub").unwrap();
		let file = store.add_file(&sub, "f.txt", "h", 1, 1).unwrap();

		for node in [Node::Folder(root), Node::Folder(sub), Node::File(file)] {
			let uri = store.node_uri(&node).unwrap();
			assert_eq!(resolve(&store, &uri).unwrap(), node, "round trip of {}", uri);
		}
	}

	#[test]
	fn test_resolve_root_without_trailing_separator() {
		let (_tmp, store, host) = setup();
		let root = add_root(&store, &host, b"/data").unwrap();
		assert_eq!(resolve(&store, "alpha::/data").unwrap(), Node::Folder(root));
	}

	#[test]
	fn test_sibling_roots_sharing_a_prefix() {
		let (_tmp, store, host) = setup();
		let data = add_root(&store, &host, b"/data").unwrap();
		let data2 = add_root(&store, &host, b"/data2").unwrap();
		let in_data = store.add_folder(&data, "x").unwrap();
		let in_data2 = store.add_folder(&data2, "x").unwrap();

		assert_eq!(resolve(&store, "alpha::/data/x").unwrap(), Node::Folder(in_data));
		assert_eq!(resolve(&store, "alpha::/data2/x/").unwrap(), Node::Folder(in_data2));
	}

	#[test]
	fn test_nested_roots_prefer_deepest() {
		let (_tmp, store, host) = setup();
		let outer = add_root(&store, &host, b"/srv").unwrap();
		store.add_folder(&outer, "media").unwrap();
		let inner = add_root(&store, &host, b"/srv/media").unwrap();
		let movies = store.add_folder(&inner, "movies").unwrap();

		assert_eq!(resolve(&store, "alpha::/srv/media/movies").unwrap(), Node::Folder(movies));
	}

	#[test]
	fn test_resolve_not_found() {
		let (_tmp, store, host) = setup();
		let root = add_root(&store, &host, b"/data").unwrap();
		store.add_file(&root, "f", "h", 1, 1).unwrap();

		for uri in ["alpha::/elsewhere/x", "alpha::/data/missing", "alpha::/data/f/below", "beta::/data"] {
			assert!(resolve(&store, uri).unwrap_err().is_not_found(), "{} should be missing", uri);
		}
	}

	#[test]
	fn test_relative_path_matches_no_root() {
		let (_tmp, store, host) = setup();
		let root = add_root(&store, &host, b"/data").unwrap();
		store.add_file(&root, "f", "h", 1, 1).unwrap();

		for uri in ["alpha::data", "alpha::data/", "alpha::data/f"] {
			assert!(resolve(&store, uri).unwrap_err().is_not_found(), "{} should be missing", uri);
		}

		// Not even the filesystem root covers a relative path
		let top = add_root(&store, &host, b"/").unwrap();
		store.add_folder(&top, "etc").unwrap();
		assert!(resolve(&store, "alpha::etc").unwrap_err().is_not_found());
		assert!(matches!(resolve(&store, "alpha::/etc").unwrap(), Node::Folder(_)));
	}
}

// vim: ts=4
