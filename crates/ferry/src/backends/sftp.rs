//! 🔐 SFTP sink: streams a unit onto a NAS over libssh2.
//!
//! libssh2 is blocking, so each write runs on the blocking pool. The unit's async reader
//! crosses over through `SyncIoBridge`, which turns it into a plain `std::io::Read`, and
//! `std::io::copy` pumps it into the remote file in 8 KiB gulps. Nothing is buffered whole.
//!
//! Each unit gets its own session. An `ssh2::Session` is not something you share across a
//! worker pool without a mutex, and a mutex would serialize the pool anyway.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::Deserialize;
use ssh2::{Session, Sftp};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info};

use crate::common::{TransferUnit, UnitOpener, UnitWrite};
use crate::connector::lenient;
use crate::errors::PipelineError;

#[derive(Clone, Deserialize)]
pub(crate) struct SftpSinkConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "lenient::u16")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "private_key_path")]
    pub pkey_path: Option<PathBuf>,
    #[serde(default)]
    pub pkey_passphrase: Option<String>,
    #[serde(default = "default_remote_dir", alias = "remote_path")]
    pub path: String,
}

fn default_port() -> u16 {
    22
}

fn default_remote_dir() -> String {
    "/".to_string()
}

impl std::fmt::Debug for SftpSinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSinkConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("pkey_path", &self.pkey_path)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct SftpSink {
    sink_config: SftpSinkConfig,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SftpSink {
    pub(crate) fn new(
        sink_config: SftpSinkConfig,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self { sink_config, connect_timeout, io_timeout }
    }

    pub(crate) async fn write(
        &self,
        unit: &TransferUnit,
        opener: &dyn UnitOpener,
    ) -> Result<UnitWrite, PipelineError> {
        let reader = opener
            .open(unit)
            .await
            .with_context(|| format!("opening '{}' for SFTP upload", unit.name))
            .map_err(|e| PipelineError::destination_write_failed(&e))?;
        // -- the bridge grabs the current runtime handle, so it must be built out here
        let bridge = SyncIoBridge::new(reader);

        let config = self.sink_config.clone();
        let name = unit.name.clone();
        let (connect_timeout, io_timeout) = (self.connect_timeout, self.io_timeout);
        let the_remote_path = remote_file_path(&config.path, &name);

        let joined = tokio::task::spawn_blocking(move || {
            upload_blocking(&config, connect_timeout, io_timeout, &the_remote_path, bridge)
        })
        .await;

        let copied = match joined {
            Ok(result) => result?,
            Err(join_err) => {
                return Err(PipelineError::destination_write_failed(&anyhow!(
                    "SFTP upload task for '{}' died: {join_err}",
                    unit.name
                )));
            }
        };

        info!(
            "🔐 uploaded '{}' ({copied} bytes) to sftp://{}:{}{}",
            unit.name,
            self.sink_config.host,
            self.sink_config.port,
            remote_file_path(&self.sink_config.path, &unit.name)
        );
        Ok(UnitWrite { rows: unit.rows })
    }
}

fn upload_blocking(
    config: &SftpSinkConfig,
    connect_timeout: Duration,
    io_timeout: Duration,
    remote_path: &str,
    mut source: impl Read,
) -> Result<u64, PipelineError> {
    let sftp = open_session(config, connect_timeout, io_timeout)
        .with_context(|| {
            format!("connecting to sftp://{}@{}:{}", config.username, config.host, config.port)
        })
        .map_err(|e| PipelineError::destination_unavailable(&e))?;

    let written = (|| -> anyhow::Result<u64> {
        ensure_remote_dirs(&sftp, &config.path)?;
        let mut remote = sftp
            .create(Path::new(remote_path))
            .with_context(|| format!("💀 creating remote file '{remote_path}'"))?;
        std::io::copy(&mut source, &mut remote)
            .with_context(|| format!("💀 streaming into remote file '{remote_path}'"))
    })();

    written.map_err(|e| PipelineError::destination_write_failed(&e))
}

fn open_session(
    config: &SftpSinkConfig,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> anyhow::Result<Sftp> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .context("💀 resolving SFTP host")?
        .next()
        .ok_or_else(|| anyhow!("💀 SFTP host resolved to no addresses"))?;
    let tcp = TcpStream::connect_timeout(&addr, connect_timeout).context("💀 tcp connect error")?;

    let mut session = Session::new().context("💀 creating SSH session")?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(io_timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake().context("💀 SSH handshake")?;

    // -- key auth first; a password is the fallback, never both
    match &config.pkey_path {
        Some(key_path) => session
            .userauth_pubkey_file(
                &config.username,
                None,
                key_path,
                config.pkey_passphrase.as_deref(),
            )
            .with_context(|| format!("💀 public key auth with '{}'", key_path.display()))?,
        None => session
            .userauth_password(&config.username, config.password.as_deref().unwrap_or(""))
            .context("💀 password auth")?,
    }
    if !session.authenticated() {
        anyhow::bail!("💀 the server accepted our credentials and then changed its mind");
    }

    session.sftp().context("💀 starting the SFTP subsystem")
}

/// 📁 `mkdir -p`, one component at a time. A component that already exists is fine.
fn ensure_remote_dirs(sftp: &Sftp, dir: &str) -> anyhow::Result<()> {
    for component in dir_chain(dir) {
        let path = Path::new(&component);
        if sftp.stat(path).is_ok() {
            continue;
        }
        if let Err(mkdir_err) = sftp.mkdir(path, 0o755) {
            // -- another worker may have won the race
            if sftp.stat(path).is_err() {
                return Err(anyhow::Error::new(mkdir_err)
                    .context(format!("💀 creating remote directory '{component}'")));
            }
        }
        debug!("📁 ensured remote directory '{component}'");
    }
    Ok(())
}

/// `/a/b/c` → [`/a`, `/a/b`, `/a/b/c`]. Relative paths stay relative.
fn dir_chain(dir: &str) -> Vec<String> {
    let absolute = dir.starts_with('/');
    let mut chain = Vec::new();
    let mut current = String::new();
    for component in dir.split('/').filter(|c| !c.is_empty() && *c != ".") {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(component);
        chain.push(current.clone());
    }
    chain
}

fn remote_file_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() && !name.is_empty() {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_mkdir_p_walks_every_ancestor() {
        assert_eq!(dir_chain("/data/in/2024"), vec!["/data", "/data/in", "/data/in/2024"]);
        assert_eq!(dir_chain("uploads//today/"), vec!["uploads", "uploads/today"]);
        assert!(dir_chain("/").is_empty());
    }

    #[test]
    fn the_one_where_remote_paths_join_cleanly() {
        assert_eq!(remote_file_path("/", "a.pdf"), "/a.pdf");
        assert_eq!(remote_file_path("/data/in/", "a.pdf"), "/data/in/a.pdf");
        assert_eq!(remote_file_path("relative", "a.pdf"), "relative/a.pdf");
    }

    #[test]
    fn the_one_where_settings_default_and_passwords_hide() {
        let the_config: SftpSinkConfig = serde_json::from_value(serde_json::json!({
            "host": "nas", "username": "drop", "password": "s3cret", "port": "2222",
        }))
        .expect("💀 settings parse");
        assert_eq!(the_config.port, 2222);
        assert_eq!(the_config.path, "/");
        assert!(!format!("{the_config:?}").contains("s3cret"));
    }

    #[tokio::test]
    async fn the_one_where_nobody_is_listening_and_the_nas_is_unavailable() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"x").expect("💀 fixture");

        // -- bind then drop to get a port nobody is listening on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .expect("💀 ephemeral port")
            .port();
        let the_sink = SftpSink::new(
            serde_json::from_value(serde_json::json!({
                "host": "127.0.0.1", "port": port, "username": "u", "password": "p",
            }))
            .expect("💀 settings parse"),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );

        let the_error = the_sink
            .write(&TransferUnit::local("a.txt", &path, 1), &crate::common::LocalFiles)
            .await
            .unwrap_err();
        assert_eq!(the_error.kind(), crate::errors::ErrorKind::DestinationUnavailable);
    }
}
