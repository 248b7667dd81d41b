//! Loading TOML configuration files from disk

use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use treemirror::config::Config;
use treemirror::error::MirrorError;

#[test]
fn test_load_full_file() {
	let tmp = TempDir::new().unwrap();
	let path = tmp.path().join("treemirror.toml");
	fs::write(
		&path,
		r#"
store = "/var/lib/treemirror/store.redb"
logLevel = "warn"

[scanner]
intervalSecs = 600
workers = 8
exclude = ["*.tmp", ".cache"]

[hasher]
workers = 3
claimLeaseSecs = 900

[server]
listen = "0.0.0.0:7070"
advertise = "nas.example.org"
chunkSize = 65536

[sync]
format = "<TYPE> <SOURCE> <TARGET>"
"#,
	)
	.unwrap();

	let config = Config::load(&path).unwrap();
	assert_eq!(config.scanner.interval(), Duration::from_secs(600));
	assert_eq!(config.scanner.exclude.len(), 2);
	assert_eq!(config.hasher.workers, 3);
	assert_eq!(config.hasher.claim_lease(), Some(Duration::from_secs(900)));
	// Unset keys keep their defaults
	assert_eq!(config.hasher.io_timeout(), Duration::from_secs(5));
	assert_eq!(config.server.listen.port(), 7070);
	assert_eq!(config.server.advertise.as_deref(), Some("nas.example.org"));
	assert_eq!(config.server.chunk_size, 65536);
	assert_eq!(config.sync.format, "<TYPE> <SOURCE> <TARGET>");
}

#[test]
fn test_missing_file_is_config_error() {
	let tmp = TempDir::new().unwrap();
	let err = Config::load(&tmp.path().join("absent.toml")).unwrap_err();
	assert!(matches!(err, MirrorError::InvalidConfig { .. }));
}

#[test]
fn test_invalid_values_rejected() {
	let tmp = TempDir::new().unwrap();
	let path = tmp.path().join("bad.toml");
	fs::write(&path, "[scanner]\nexclude = [\"[unclosed\"]\n").unwrap();
	assert!(matches!(Config::load(&path), Err(MirrorError::InvalidConfig { .. })));

	fs::write(&path, "[server]\nchunkSize = 0\n").unwrap();
	assert!(matches!(Config::load(&path), Err(MirrorError::InvalidConfig { .. })));
}

// vim: ts=4
