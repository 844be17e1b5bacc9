use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{APP_BOUNDARY, APP_DIR_MODE, SEGMENT_FILE_MODE};
use crate::error::{DumperError, Result};
use crate::manifest::Manifest;
use crate::transfer::RemoteFetcher;

/// Terminal outcome of the collection phase, delivered over the
/// completion channel exactly once.
#[derive(Debug)]
pub enum CollectionSignal {
    /// The agent posted its `done` marker.
    Done,
    /// A fetch failed inside the message handler; no retry is attempted.
    Fatal(DumperError),
}

/// Inner keys of an agent `payload` object. They are checked
/// independently and may co-occur in a single message.
#[derive(Debug, Deserialize)]
pub struct AgentPayload {
    /// Device path of a decrypted segment copy to fetch.
    pub dump: Option<String>,
    /// Original path of that segment inside the installed bundle.
    pub path: Option<String>,
    /// Device path of the application bundle root.
    pub app: Option<String>,
    /// Presence alone marks the end of collection.
    pub done: Option<Value>,
}

/// Consumes agent messages on the delivery thread, fetching announced
/// artifacts synchronously and building the reconstruction manifest.
/// Owns the completion latch the session controller blocks on.
pub struct EventCollector {
    payload_path: PathBuf,
    manifest: Mutex<Manifest>,
    signal: Mutex<Option<Sender<CollectionSignal>>>,
}

impl EventCollector {
    /// Create a collector downloading into `payload_path`, plus the
    /// receiving half of its completion latch.
    pub fn new(payload_path: PathBuf) -> (Arc<Self>, Receiver<CollectionSignal>) {
        let (tx, rx) = mpsc::channel();
        let collector = Arc::new(Self {
            payload_path,
            manifest: Mutex::new(Manifest::new()),
            signal: Mutex::new(Some(tx)),
        });
        (collector, rx)
    }

    /// Entry point for the delivery thread. Fetch failures are routed to
    /// the completion latch as [`CollectionSignal::Fatal`]; everything
    /// else that goes wrong in a message is ignored per protocol.
    pub fn handle_message(&self, fetcher: &mut dyn RemoteFetcher, message: &Value) {
        if let Err(err) = self.process(fetcher, message) {
            self.send_signal(CollectionSignal::Fatal(err));
        }
    }

    fn process(&self, fetcher: &mut dyn RemoteFetcher, message: &Value) -> Result<()> {
        if message.get("type").and_then(Value::as_str) == Some("error") {
            println!("[!]  Received error from the agent.");
            if let Some(stack) = message.get("stack").and_then(Value::as_str) {
                eprintln!("{stack}");
            }
        }

        let Some(raw_payload) = message.get("payload") else {
            return Ok(());
        };
        // Unrecognized shapes are intentionally ignored.
        let Ok(payload) = serde_json::from_value::<AgentPayload>(raw_payload.clone()) else {
            return Ok(());
        };

        if let Some(remote) = payload.dump.as_deref() {
            // A dump entry without its origin path has no destination.
            if let Some(dest) = payload
                .path
                .as_deref()
                .and_then(destination_relative_path)
            {
                println!("[*]  Downloading binary file {remote}.");
                let local = fetcher.fetch_file(remote, &self.payload_path)?;
                set_mode(&local, SEGMENT_FILE_MODE)?;
                self.lock_manifest()
                    .record_segment(file_name(&local), dest);
            }
        }

        if let Some(app) = payload.app.as_deref() {
            println!("[*]  Downloading app files.");
            let local = fetcher.fetch_dir(app, &self.payload_path)?;
            set_mode(&local, APP_DIR_MODE)?;
            self.lock_manifest().record_app_root(file_name(&local));
        }

        if payload.done.is_some() {
            println!("[*]  Finished downloading files.");
            self.send_signal(CollectionSignal::Done);
        }

        Ok(())
    }

    /// The manifest; only read by the controller after the completion
    /// signal has been observed.
    pub fn lock_manifest(&self) -> MutexGuard<'_, Manifest> {
        self.manifest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_signal(&self, signal: CollectionSignal) {
        let sender = self
            .signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        // The latch fires once; later signals are dropped.
        if let Some(tx) = sender {
            let _ = tx.send(signal);
        }
    }
}

/// Everything after the `.app/` boundary of the original device path.
fn destination_relative_path(origin: &str) -> Option<String> {
    origin
        .find(APP_BOUNDARY)
        .map(|idx| origin[idx + APP_BOUNDARY.len()..].to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let run = || -> anyhow::Result<()> {
        let mut perms = std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .permissions();
        perms.set_mode(mode);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("chmod {}", path.display()))?;
        Ok(())
    };
    run().map_err(DumperError::Other)
}
