//! Logging prelude module for convenient access to tracing macros.
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("Claimed hash request {}", id);
//! warn!("Cannot read directory {}: {}", path.display(), e);
//! ```

pub use tracing::{debug, error, info, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies:
///
/// ```bash
/// RUST_LOG=debug treemirror scan
/// RUST_LOG=treemirror::hasher=trace treemirror hash
/// ```
pub fn init_tracing(default_level: &str) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
	// A second init (tests, embedding) is not an error worth surfacing
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.try_init();
}

// vim: ts=4
