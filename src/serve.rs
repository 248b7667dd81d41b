//! File server: announce pending hash requests and stream their bytes
//!
//! Wire protocol: the client writes its Server id as ASCII decimal followed by
//! `\n`; the server answers with the raw file bytes and closes the
//! connection. A bad id line gets no answer at all.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::error::{MirrorError, Result};
use crate::logging::*;
use crate::store::{Host, Id, Store, TreeView};

/// Longest accepted id line, newline included
pub const MAX_ID_LINE: usize = 32;

/// Parse `<decimal id>\n`
pub fn parse_id_line(line: &[u8]) -> Result<Id> {
	let digits = line
		.strip_suffix(b"\n")
		.ok_or_else(|| MirrorError::protocol("id line is not newline terminated"))?;
	let text = std::str::from_utf8(digits).map_err(|_| MirrorError::protocol("id line is not ASCII"))?;
	if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
		return Err(MirrorError::protocol(format!("malformed id line {:?}", text)));
	}
	text.parse().map_err(|_| MirrorError::protocol(format!("id {} out of range", text)))
}

pub struct FileServer {
	store: Store,
	host: Host,
	config: ServerConfig,
	listener: TcpListener,
	advertise: String,
	port: u16,
}

impl FileServer {
	/// Bind the listener for `host`, which must be the machine we are running on
	pub async fn bind(store: Store, host: Host, config: ServerConfig) -> Result<Self> {
		if !host.is_local() {
			return Err(MirrorError::NotLocal { host: host.name });
		}
		let listener = TcpListener::bind(config.listen).await?;
		let local = listener.local_addr()?;
		let advertise = match &config.advertise {
			Some(address) => address.clone(),
			None if local.ip().is_unspecified() => {
				crate::local_hostname().ok_or_else(|| MirrorError::InvalidConfig {
					message: "cannot determine the hostname, set server.advertise".into(),
				})?
			}
			None => local.ip().to_string(),
		};
		info!("File server for {} listening on {}, advertised as {}:{}", host.name, local, advertise, local.port());
		Ok(FileServer { store, host, config, listener, advertise, port: local.port() })
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		Ok(self.listener.local_addr()?)
	}

	/// Address written into Server records
	pub fn advertised(&self) -> (&str, u16) {
		(&self.advertise, self.port)
	}

	/// Create Server records for every unannounced request; returns how many
	pub fn announce_once(&self) -> Result<usize> {
		let servers = self.store.announce(self.host.id, &self.advertise, self.port)?;
		if !servers.is_empty() {
			info!("Announced {} hash requests", servers.len());
		}
		Ok(servers.len())
	}

	/// Answer one fetch; returns the number of bytes streamed
	pub async fn serve_connection(&self, mut stream: TcpStream) -> Result<u64> {
		let io_timeout = self.config.io_timeout();

		let mut line = Vec::with_capacity(MAX_ID_LINE);
		{
			let mut reader = BufReader::new((&mut stream).take(MAX_ID_LINE as u64));
			timeout(io_timeout, reader.read_until(b'\n', &mut line)).await??;
		}
		let id = parse_id_line(&line)?;

		let host = self.host.id;
		let path = self.store.read(|t| {
			let server = t.server(id)?.ok_or_else(|| MirrorError::protocol(format!("unknown server {}", id)))?;
			let request = t.request(server.request)?.ok_or_else(|| {
				MirrorError::protocol(format!("server {} has no hash request", id))
			})?;
			if request.host != host {
				return Err(MirrorError::protocol(format!("server {} belongs to another host", id)));
			}
			t.request_path(&request)
		})?;
		let path = PathBuf::from(OsString::from_vec(path));

		let mut file = tokio::fs::File::open(&path).await?;
		let mut buf = vec![0u8; self.config.chunk_size];
		let mut sent = 0u64;
		loop {
			let n = file.read(&mut buf).await?;
			if n == 0 {
				break;
			}
			timeout(io_timeout, stream.write_all(&buf[..n])).await??;
			sent += n as u64;
		}
		timeout(io_timeout, stream.shutdown()).await??;
		debug!("Served {} ({} bytes) for server {}", path.display(), sent, id);
		Ok(sent)
	}

	/// Listener and announcer, concurrently, until the process stops
	pub async fn run(self) -> Result<()> {
		let server = Arc::new(self);

		let listen = {
			let server = server.clone();
			async move {
				loop {
					match server.listener.accept().await {
						Ok((stream, peer)) => {
							let server = server.clone();
							tokio::spawn(async move {
								if let Err(e) = server.serve_connection(stream).await {
									warn!("Fetch from {} failed: {}", peer, e);
								}
							});
						}
						Err(e) => warn!("Accept failed: {}", e),
					}
				}
			}
		};

		let announce = {
			let server = server.clone();
			async move {
				loop {
					if let Err(e) = server.announce_once() {
						error!("Announce failed: {}", e);
					}
					tokio::time::sleep(server.config.announce_interval()).await;
				}
			}
		};

		tokio::select! {
			_ = listen => {}
			_ = announce => {}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::HasherConfig;
	use crate::hasher::{Hasher, Outcome};
	use crate::resolve::add_root;
	use crate::store::Folder;
	use std::os::unix::ffi::OsStrExt;
	use std::time::Duration;
	use tempfile::TempDir;

	#[test]
	fn test_parse_id_line() {
		assert_eq!(parse_id_line(b"42\n").unwrap(), 42);
		for bad in [&b"42"[..], b"\n", b"4x\n", b"-1\n", b" 1\n", b"99999999999999999999999\n"] {
			assert!(matches!(parse_id_line(bad), Err(MirrorError::Protocol { .. })), "{:?}", bad);
		}
	}

	struct Fixture {
		tmp: TempDir,
		store: Store,
		host: Host,
		root: Folder,
	}

	fn fixture() -> Fixture {
		let tmp = TempDir::new().unwrap();
		let data = tmp.path().join("data");
		std::fs::create_dir(&data).unwrap();
		let store = Store::open(&tmp.path().join("store.redb")).unwrap();
		let host = store.host_by_name_or_create(&crate::local_hostname().unwrap()).unwrap();
		let root = add_root(&store, &host, data.as_os_str().as_bytes()).unwrap();
		Fixture { tmp, store, host, root }
	}

	fn server_config() -> ServerConfig {
		ServerConfig {
			listen: SocketAddr::from(([127, 0, 0, 1], 0)),
			chunk_size: 4,
			io_timeout_secs: 2,
			..ServerConfig::default()
		}
	}

	#[tokio::test]
	async fn test_remote_host_rejected() {
		let f = fixture();
		let other = f.store.host_by_name_or_create("not-this-machine.invalid").unwrap();
		assert!(matches!(
			FileServer::bind(f.store.clone(), other, server_config()).await,
			Err(MirrorError::NotLocal { .. })
		));
	}

	#[tokio::test]
	async fn test_announce_once_is_idempotent() {
		let f = fixture();
		f.store.create_hash_request(&f.root, "x", 1, 1).unwrap();
		let server = FileServer::bind(f.store.clone(), f.host.clone(), server_config()).await.unwrap();
		assert_eq!(server.advertised().0, "127.0.0.1");
		assert_eq!(server.announce_once().unwrap(), 1);
		assert_eq!(server.announce_once().unwrap(), 0);
	}

	#[tokio::test]
	async fn test_fetch_round_trip() {
		let f = fixture();
		let content = b"hello, mirrored world";
		std::fs::write(f.tmp.path().join("data/x"), content).unwrap();
		f.store.create_hash_request(&f.root, "x", 1, content.len() as u64).unwrap();

		let server = FileServer::bind(f.store.clone(), f.host.clone(), server_config()).await.unwrap();
		server.announce_once().unwrap();
		tokio::spawn(server.run());

		let hasher = Hasher::new(f.store.clone(), f.host.clone(), HasherConfig::default());
		let Outcome::Hashed(file) = hasher.run_once().await else {
			panic!("expected a hashed file");
		};
		assert_eq!(file.hash, blake3::hash(content).to_hex().to_string());
		assert_eq!(f.store.stats().unwrap().servers, 0);
	}

	#[tokio::test]
	async fn test_bad_requests_get_no_bytes() {
		let f = fixture();
		std::fs::write(f.tmp.path().join("data/x"), b"secret").unwrap();
		f.store.create_hash_request(&f.root, "x", 1, 6).unwrap();

		let server = FileServer::bind(f.store.clone(), f.host.clone(), server_config()).await.unwrap();
		server.announce_once().unwrap();
		let addr = server.local_addr().unwrap();
		tokio::spawn(server.run());

		let too_long = vec![b'1'; MAX_ID_LINE + 8];
		for request in [&b"abc\n"[..], b"999\n", &too_long] {
			let mut client = TcpStream::connect(addr).await.unwrap();
			client.write_all(request).await.unwrap();
			let mut reply = Vec::new();
			let read = timeout(Duration::from_secs(5), client.read_to_end(&mut reply)).await.unwrap();
			// The server may reset instead of closing cleanly when input is left unread
			assert_eq!(read.unwrap_or(0), 0, "reply to {:?}", String::from_utf8_lossy(request));
		}
	}

	#[tokio::test]
	async fn test_silent_client_times_out() {
		let f = fixture();
		let config = ServerConfig { io_timeout_secs: 1, ..server_config() };
		let server = FileServer::bind(f.store.clone(), f.host.clone(), config).await.unwrap();

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
		let (accepted, _) = listener.accept().await.unwrap();
		// Half an id line, then nothing
		client.write_all(b"1").await.unwrap();

		let started = std::time::Instant::now();
		let result = timeout(Duration::from_secs(5), server.serve_connection(accepted)).await.unwrap();
		assert!(matches!(result, Err(MirrorError::Timeout { .. })), "{:?}", result);
		assert!(started.elapsed() < Duration::from_secs(3));

		let mut reply = Vec::new();
		let read = timeout(Duration::from_secs(5), client.read_to_end(&mut reply)).await.unwrap();
		assert_eq!(read.unwrap_or(0), 0);
	}
}

// vim: ts=4
