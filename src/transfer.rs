use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use ssh2::Session;

use crate::config::FETCH_IDLE_TIMEOUT;
use crate::error::{DumperError, Result};

/// Remote-copy channel used by the collector while messages arrive.
/// Fetches are synchronous; the transport is single-stream so no two
/// fetches ever run concurrently.
pub trait RemoteFetcher: Send {
    /// Copy a single remote file into `dest_dir`, returning the local path.
    fn fetch_file(&mut self, remote: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Recursively copy a remote directory into `dest_dir`, returning the
    /// local root created for it.
    fn fetch_dir(&mut self, remote: &str, dest_dir: &Path) -> Result<PathBuf>;
}

/// SSH/SFTP transport. `connect` establishes the session once; fetches
/// reuse it for the whole dump.
#[derive(Default)]
pub struct SshTransport {
    session: Option<Session>,
}

impl SshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate against `host:port` with a trust-on-first-use host
    /// key policy. Invalid credentials and unreachable endpoints are
    /// reported and yield `Ok(false)`; anything else is fatal. May be
    /// retried with different credentials after a failure.
    pub fn connect(&mut self, host: &str, port: u16, username: &str, password: &str) -> Result<bool> {
        let addr = format!("{host}:{port}");
        let tcp = match TcpStream::connect(&addr) {
            Ok(stream) => stream,
            Err(_) => {
                let err = DumperError::Unreachable {
                    host: host.to_string(),
                    port,
                };
                println!("[!]  {}", err.user_message());
                return Ok(false);
            }
        };

        let mut sess = Session::new().context("create SSH session")?;
        sess.set_tcp_stream(tcp);
        sess.handshake()
            .with_context(|| format!("SSH handshake with {addr}"))?;

        if sess.userauth_password(username, password).is_err() || !sess.authenticated() {
            let err = DumperError::AuthenticationFailed {
                host: host.to_string(),
                port,
                username: username.to_string(),
            };
            println!("[!]  {}", err.user_message());
            return Ok(false);
        }

        // Stalled reads abort the fetch instead of hanging the handler.
        sess.set_timeout(FETCH_IDLE_TIMEOUT.as_millis() as u32);

        println!("[*]  Connected to SSH '{username}@{host}:{port}'.");
        self.session = Some(sess);
        Ok(true)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(DumperError::NotConnected)
    }

    fn download(sftp: &ssh2::Sftp, remote: &str, local: &Path) -> anyhow::Result<()> {
        let mut remote_file = sftp
            .open(Path::new(remote))
            .with_context(|| format!("open remote file {remote}"))?;
        let mut local_file =
            File::create(local).with_context(|| format!("create {}", local.display()))?;

        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = remote_file
                .read(&mut buf)
                .with_context(|| format!("read remote file {remote}"))?;
            if n == 0 {
                break;
            }
            local_file
                .write_all(&buf[..n])
                .with_context(|| format!("write {}", local.display()))?;
        }
        Ok(())
    }
}

impl RemoteFetcher for SshTransport {
    fn fetch_file(&mut self, remote: &str, dest_dir: &Path) -> Result<PathBuf> {
        let sess = self.session()?;
        let local = dest_dir.join(remote_basename(remote));
        let fetch = || -> anyhow::Result<()> {
            let sftp = sess.sftp().context("open SFTP channel")?;
            Self::download(&sftp, remote, &local)
        };
        fetch().map_err(|source| DumperError::Fetch {
            remote: remote.to_string(),
            source,
        })?;
        Ok(local)
    }

    fn fetch_dir(&mut self, remote: &str, dest_dir: &Path) -> Result<PathBuf> {
        let sess = self.session()?;
        let local_root = dest_dir.join(remote_basename(remote));
        let fetch = || -> anyhow::Result<()> {
            let sftp = sess.sftp().context("open SFTP channel")?;

            let mut queue = VecDeque::new();
            queue.push_back((remote.trim_end_matches('/').to_string(), local_root.clone()));

            while let Some((cur_remote, cur_local)) = queue.pop_front() {
                std::fs::create_dir_all(&cur_local)
                    .with_context(|| format!("create {}", cur_local.display()))?;

                let entries = sftp
                    .readdir(Path::new(&cur_remote))
                    .with_context(|| format!("list remote dir {cur_remote}"))?;
                for (entry_path, stat) in entries {
                    let name = entry_path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .ok_or_else(|| anyhow!("unreadable entry name under {cur_remote}"))?;
                    if name == "." || name == ".." {
                        continue;
                    }
                    let entry_remote = format!("{cur_remote}/{name}");
                    let entry_local = cur_local.join(name);
                    if stat.is_dir() {
                        queue.push_back((entry_remote, entry_local));
                    } else {
                        Self::download(&sftp, &entry_remote, &entry_local)?;
                    }
                }
            }
            Ok(())
        };
        fetch().map_err(|source| DumperError::Fetch {
            remote: remote.to_string(),
            source,
        })?;
        Ok(local_root)
    }
}

fn remote_basename(remote: &str) -> &str {
    remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(remote)
}
