//! # TreeMirror - Distributed Filesystem Tree Mirror
//!
//! TreeMirror keeps a shared, persisted mirror of several hosts' filesystem
//! trees. Scanners reconcile the local disk into the store, file servers
//! announce content that still needs a digest, hashers claim and digest it,
//! and the planner diffs two trees into a dedup-aware change set.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use treemirror::{plan::ChangeSet, store::Store};
//!
//! fn main() -> treemirror::Result<()> {
//!     let store = Store::open("treemirror.redb".as_ref())?;
//!     let changes = ChangeSet::between_uris(&store, "alpha::/data", "beta::/backup")?;
//!     print!("{}", changes.render("<SOURCE>::<TYPE>::<TARGET>"));
//!     println!("{}GB", changes.transfer_size() as f64 / (1u64 << 30) as f64);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod plan;
pub mod resolve;
pub mod scanner;
pub mod serve;
pub mod store;

// Re-export commonly used types and functions
pub use config::Config;
pub use error::{MirrorError, Result};
pub use plan::{Change, ChangeKind, ChangeSet};
pub use store::{File, Folder, HashRequest, Host, Node, Region, Server, Store};

/// Name of the machine we are running on
pub fn local_hostname() -> Option<String> {
	sysinfo::System::host_name()
}

// vim: ts=4
