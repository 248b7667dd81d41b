//! Persisted record types
//!
//! Records reference each other by id only; relations are resolved through the
//! store, never through embedded pointers.

use base64::Engine as _;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

/// Primary key of every record kind
pub type Id = u64;

/// A file or folder name as raw bytes
///
/// Filesystem names are not guaranteed to be valid UTF-8, so they are kept as
/// bytes and only rendered lossily for display. The JSON encoding is base64.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(Vec<u8>);

impl Name {
	pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
		Name(bytes.into())
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.0
	}

	pub fn as_os_str(&self) -> &OsStr {
		OsStr::from_bytes(&self.0)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl From<&str> for Name {
	fn from(s: &str) -> Self {
		Name(s.as_bytes().to_vec())
	}
}

impl From<&[u8]> for Name {
	fn from(b: &[u8]) -> Self {
		Name(b.to_vec())
	}
}

impl From<&OsStr> for Name {
	fn from(s: &OsStr) -> Self {
		Name(s.as_bytes().to_vec())
	}
}

impl From<OsString> for Name {
	fn from(s: OsString) -> Self {
		Name(s.into_vec())
	}
}

impl fmt::Debug for Name {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", String::from_utf8_lossy(&self.0))
	}
}

impl fmt::Display for Name {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", String::from_utf8_lossy(&self.0))
	}
}

impl Serialize for Name {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
	}
}

impl<'de> Deserialize<'de> for Name {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		struct NameVisitor;

		impl Visitor<'_> for NameVisitor {
			type Value = Name;

			fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
				f.write_str("a base64 encoded name")
			}

			fn visit_str<E: de::Error>(self, v: &str) -> Result<Name, E> {
				base64::engine::general_purpose::STANDARD
					.decode(v)
					.map(Name)
					.map_err(|e| E::custom(format!("invalid name encoding: {}", e)))
			}
		}

		deserializer.deserialize_str(NameVisitor)
	}
}

/// A locality grouping used to prefer same-region hash work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
	pub id: Id,
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
	pub id: Id,
	pub name: String,
	#[serde(rename = "rg")]
	pub region: Option<Id>,
}

impl Host {
	/// True if this host is the machine we are running on
	pub fn is_local(&self) -> bool {
		crate::local_hostname().map(|local| local == self.name).unwrap_or(false)
	}
}

/// A directory; roots have no parent and carry the absolute path as name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
	pub id: Id,
	#[serde(rename = "nm")]
	pub name: Name,
	#[serde(rename = "hs")]
	pub host: Id,
	#[serde(rename = "pt")]
	pub parent: Option<Id>,
}

/// A file whose content digest is known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
	pub id: Id,
	#[serde(rename = "nm")]
	pub name: Name,
	/// Lower-case hex BLAKE3 digest
	#[serde(rename = "hh")]
	pub hash: String,
	/// Nanoseconds since the Unix epoch
	#[serde(rename = "mt")]
	pub mtime: i64,
	#[serde(rename = "sz")]
	pub size: u64,
	#[serde(rename = "hs")]
	pub host: Id,
	#[serde(rename = "fd")]
	pub folder: Id,
}

/// A file-to-be: attributes observed on disk, digest pending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRequest {
	pub id: Id,
	#[serde(rename = "nm")]
	pub name: Name,
	#[serde(rename = "mt")]
	pub mtime: i64,
	#[serde(rename = "sz")]
	pub size: u64,
	#[serde(rename = "hs")]
	pub host: Id,
	#[serde(rename = "fd")]
	pub folder: Id,
	#[serde(rename = "lk")]
	pub locked: bool,
	/// Unix timestamp (seconds) of the claim, if locked
	#[serde(rename = "ca", default)]
	pub claimed_at: Option<u64>,
	/// Fencing token of the current claim; every claim gets a fresh one
	#[serde(rename = "ct", default)]
	pub claim_token: Option<u64>,
}

/// Announcement that a request's bytes are fetchable at ip:port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
	pub id: Id,
	pub ip: String,
	pub port: u16,
	#[serde(rename = "rq")]
	pub request: Id,
}

/// A resolved tree entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
	Folder(Folder),
	File(File),
}

impl Node {
	pub fn host(&self) -> Id {
		match self {
			Node::Folder(f) => f.host,
			Node::File(f) => f.host,
		}
	}
}

/// Record counts, mostly for status output and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
	pub regions: u64,
	pub hosts: u64,
	pub folders: u64,
	pub files: u64,
	pub requests: u64,
	pub locked_requests: u64,
	pub servers: u64,
}


// vim: ts=4
