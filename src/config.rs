//! Configuration for the TreeMirror daemons
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (TOML, `Config::load`)
//! 3. Environment variables (TREEMIRROR_* prefix)
//! 4. CLI flags (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MirrorError, Result};

/// Environment variable overriding the store location
pub const ENV_STORE: &str = "TREEMIRROR_STORE";

/// Environment variable overriding the default log level
pub const ENV_LOG: &str = "TREEMIRROR_LOG";

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

/// Configuration shared by every daemon role
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// Path of the shared store file
	pub store: PathBuf,

	/// Log level used when RUST_LOG is not set (trace, debug, info, warn, error)
	pub log_level: String,

	pub scanner: ScannerConfig,

	pub hasher: HasherConfig,

	pub server: ServerConfig,

	pub sync: SyncConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			store: PathBuf::from("treemirror.redb"),
			log_level: "info".to_string(),
			scanner: ScannerConfig::default(),
			hasher: HasherConfig::default(),
			server: ServerConfig::default(),
			sync: SyncConfig::default(),
		}
	}
}

impl Config {
	/// Parse a TOML document on top of the defaults
	pub fn from_toml_str(text: &str) -> Result<Self> {
		let config: Config = toml::from_str(text)?;
		config.validate()?;
		Ok(config)
	}

	/// Load a TOML config file, then apply environment overrides
	pub fn load(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).map_err(|e| MirrorError::InvalidConfig {
			message: format!("cannot read {}: {}", path.display(), e),
		})?;
		let mut config = Self::from_toml_str(&text)?;
		config.apply_env();
		Ok(config)
	}

	/// Apply TREEMIRROR_* environment overrides
	pub fn apply_env(&mut self) {
		if let Ok(store) = std::env::var(ENV_STORE) {
			if !store.is_empty() {
				self.store = PathBuf::from(store);
			}
		}
		if let Ok(level) = std::env::var(ENV_LOG) {
			if !level.is_empty() {
				self.log_level = level;
			}
		}
	}

	pub fn validate(&self) -> Result<()> {
		let invalid =
			|message: &str| -> Result<()> { Err(MirrorError::InvalidConfig { message: message.into() }) };
		if self.scanner.workers == 0 {
			return invalid("scanner.workers must be > 0");
		}
		if self.hasher.workers == 0 {
			return invalid("hasher.workers must be > 0");
		}
		if self.server.chunk_size == 0 {
			return invalid("server.chunkSize must be > 0");
		}
		if self.hasher.io_timeout_secs == 0 || self.server.io_timeout_secs == 0 {
			return invalid("socket timeouts must be > 0");
		}
		for pattern in &self.scanner.exclude {
			glob::Pattern::new(pattern).map_err(|e| MirrorError::InvalidConfig {
				message: format!("bad exclude pattern {:?}: {}", pattern, e),
			})?;
		}
		Ok(())
	}
}

// ============================================================================
// PER-ROLE CONFIGURATION
// ============================================================================

/// Scanner daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScannerConfig {
	/// Pause between two scan rounds
	pub interval_secs: u64,

	/// Number of concurrent scan workers
	pub workers: usize,

	/// Run a single round and stop
	pub once: bool,

	/// Glob patterns matched against entry names; matches are not mirrored
	pub exclude: Vec<String>,
}

impl Default for ScannerConfig {
	fn default() -> Self {
		ScannerConfig { interval_secs: 3600, workers: 40, once: false, exclude: vec![] }
	}
}

impl ScannerConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}
}

/// Hasher daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HasherConfig {
	/// Pause when no eligible request exists
	pub interval_secs: u64,

	/// Number of independent claim loops
	pub workers: usize,

	/// Timeout for connecting to and reading from a file server
	pub io_timeout_secs: u64,

	/// Claims older than this are released; never released when unset
	pub claim_lease_secs: Option<u64>,
}

impl Default for HasherConfig {
	fn default() -> Self {
		HasherConfig { interval_secs: 30, workers: 1, io_timeout_secs: 5, claim_lease_secs: None }
	}
}

impl HasherConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}

	pub fn io_timeout(&self) -> Duration {
		Duration::from_secs(self.io_timeout_secs)
	}

	pub fn claim_lease(&self) -> Option<Duration> {
		self.claim_lease_secs.map(Duration::from_secs)
	}
}

/// File server daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
	/// Listen address; port 0 picks an ephemeral port
	pub listen: SocketAddr,

	/// Address written into Server records (defaults to the listen IP or hostname)
	pub advertise: Option<String>,

	/// Pause between two announce passes
	pub announce_interval_secs: u64,

	/// Bytes per write when streaming a file
	pub chunk_size: usize,

	/// Timeout for reading the id line and writing each chunk
	pub io_timeout_secs: u64,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig {
			listen: SocketAddr::from(([0, 0, 0, 0], 0)),
			advertise: None,
			announce_interval_secs: 360,
			chunk_size: 1 << 14,
			io_timeout_secs: 5,
		}
	}
}

impl ServerConfig {
	pub fn announce_interval(&self) -> Duration {
		Duration::from_secs(self.announce_interval_secs)
	}

	pub fn io_timeout(&self) -> Duration {
		Duration::from_secs(self.io_timeout_secs)
	}
}

/// Sync evaluator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
	/// Line template with `<SOURCE>`, `<TYPE>` and `<TARGET>` placeholders
	pub format: String,
}

impl Default for SyncConfig {
	fn default() -> Self {
		SyncConfig { format: "<SOURCE>::<TYPE>::<TARGET>".to_string() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_config_default() {
		let config = Config::default();
		assert_eq!(config.scanner.workers, 40);
		assert_eq!(config.hasher.interval_secs, 30);
		assert_eq!(config.server.listen.port(), 0);
		assert_eq!(config.server.chunk_size, 16384);
		assert!(config.hasher.claim_lease().is_none());
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_config_from_toml() {
		let config = Config::from_toml_str(
			r#"
			store = "/var/lib/treemirror/store.redb"
			logLevel = "debug"

			[scanner]
			workers = 8
			once = true
			exclude = ["*.tmp"]

			[hasher]
			claimLeaseSecs = 600

			[server]
			listen = "127.0.0.1:7070"
			advertise = "10.0.0.5"
			"#,
		)
		.expect("valid config");

		assert_eq!(config.store, PathBuf::from("/var/lib/treemirror/store.redb"));
		assert_eq!(config.log_level, "debug");
		assert_eq!(config.scanner.workers, 8);
		assert!(config.scanner.once);
		assert_eq!(config.scanner.interval_secs, 3600);
		assert_eq!(config.hasher.claim_lease(), Some(Duration::from_secs(600)));
		assert_eq!(config.server.listen.port(), 7070);
		assert_eq!(config.server.advertise.as_deref(), Some("10.0.0.5"));
	}

	#[test]
	fn test_config_rejects_zero_workers() {
		let result = Config::from_toml_str("[scanner]\nworkers = 0\n");
		assert!(matches!(result, Err(MirrorError::InvalidConfig { .. })));
	}

	#[test]
	fn test_config_rejects_bad_glob() {
		let result = Config::from_toml_str("[scanner]\nexclude = [\"[\"]\n");
		assert!(matches!(result, Err(MirrorError::InvalidConfig { .. })));
	}
}

// vim: ts=4
