//! Error types for TreeMirror operations

use std::error::Error;
use std::fmt;
use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Main error type for store, scan, hash, serve and planning operations
#[derive(Debug)]
pub enum MirrorError {
	/// Path, URI or id resolves to nothing
	NotFound { what: String },

	/// Duplicate root or duplicate sibling name
	AlreadyExists { what: String },

	/// Another hasher won the claim on this request
	AlreadyClaimed { request: u64 },

	/// Socket I/O did not complete in time
	Timeout { operation: String },

	/// Store transaction was rejected
	Transaction { message: String },

	/// Malformed fetch request or response
	Protocol { message: String },

	/// URI is not of the form `<host>::<path>`
	InvalidUri { uri: String },

	/// Host is not the machine we are running on
	NotLocal { host: String },

	/// A stored record could not be decoded
	Corrupted { message: String },

	/// Invalid configuration
	InvalidConfig { message: String },

	/// I/O error
	Io(io::Error),
}

impl MirrorError {
	pub fn not_found(what: impl Into<String>) -> Self {
		MirrorError::NotFound { what: what.into() }
	}

	pub fn already_exists(what: impl Into<String>) -> Self {
		MirrorError::AlreadyExists { what: what.into() }
	}

	pub fn protocol(message: impl Into<String>) -> Self {
		MirrorError::Protocol { message: message.into() }
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, MirrorError::NotFound { .. })
	}
}

impl fmt::Display for MirrorError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			MirrorError::NotFound { what } => write!(f, "Not found: {}", what),
			MirrorError::AlreadyExists { what } => write!(f, "Already exists: {}", what),
			MirrorError::AlreadyClaimed { request } => {
				write!(f, "Hash request {} was already claimed", request)
			}
			MirrorError::Timeout { operation } => write!(f, "Timed out: {}", operation),
			MirrorError::Transaction { message } => {
				write!(f, "Store transaction failed: {}", message)
			}
			MirrorError::Protocol { message } => write!(f, "Protocol error: {}", message),
			MirrorError::InvalidUri { uri } => {
				write!(f, "{} is not a valid URI (expected <host>::<path>)", uri)
			}
			MirrorError::NotLocal { host } => write!(f, "Host {} is not local", host),
			MirrorError::Corrupted { message } => write!(f, "Store corrupted: {}", message),
			MirrorError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			MirrorError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for MirrorError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			MirrorError::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for MirrorError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::TimedOut {
			return MirrorError::Timeout { operation: e.to_string() };
		}
		MirrorError::Io(e)
	}
}

impl From<redb::DatabaseError> for MirrorError {
	fn from(e: redb::DatabaseError) -> Self {
		MirrorError::Transaction { message: e.to_string() }
	}
}

impl From<redb::TransactionError> for MirrorError {
	fn from(e: redb::TransactionError) -> Self {
		MirrorError::Transaction { message: e.to_string() }
	}
}

impl From<redb::TableError> for MirrorError {
	fn from(e: redb::TableError) -> Self {
		MirrorError::Transaction { message: e.to_string() }
	}
}

impl From<redb::StorageError> for MirrorError {
	fn from(e: redb::StorageError) -> Self {
		MirrorError::Transaction { message: e.to_string() }
	}
}

impl From<redb::CommitError> for MirrorError {
	fn from(e: redb::CommitError) -> Self {
		MirrorError::Transaction { message: e.to_string() }
	}
}

impl From<serde_json::Error> for MirrorError {
	fn from(e: serde_json::Error) -> Self {
		MirrorError::Corrupted { message: e.to_string() }
	}
}

impl From<tokio::time::error::Elapsed> for MirrorError {
	fn from(e: tokio::time::error::Elapsed) -> Self {
		MirrorError::Timeout { operation: e.to_string() }
	}
}

impl From<toml::de::Error> for MirrorError {
	fn from(e: toml::de::Error) -> Self {
		MirrorError::InvalidConfig { message: e.to_string() }
	}
}


// vim: ts=4
