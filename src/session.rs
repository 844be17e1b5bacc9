use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde_json::Value;

use crate::agent;
use crate::assemble;
use crate::collector::{CollectionSignal, EventCollector};
use crate::config::{DumpConfig, DUMP_COMMAND};
use crate::error::{DumperError, Result};
use crate::signals;
use crate::transfer::RemoteFetcher;

/// Poll interval of the completion wait; each tick also checks the
/// interrupt latch.
const WAIT_TICK: Duration = Duration::from_millis(250);

/// A process on the device the instrumentation can target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetProcess {
    pub pid: u32,
    pub name: String,
}

/// Device-side process control. Implemented by the frida backend and by
/// the in-memory doubles in the tests.
pub trait DeviceControl {
    type Session: AgentSession;

    /// Look the target up among running applications by bundle
    /// identifier or display name.
    fn find_running(&mut self, target: &str) -> Result<Option<TargetProcess>>;

    /// Spawn the target suspended so the agent is in place before any
    /// app code runs.
    fn spawn_suspended(&mut self, target: &str) -> Result<TargetProcess>;

    fn attach(&mut self, pid: u32) -> Result<Self::Session>;

    fn resume(&mut self, pid: u32) -> Result<()>;
}

/// An instrumentation session attached to the target process.
pub trait AgentSession {
    /// Inject the agent and route every message it sends into `sink`.
    /// The sink runs on the delivery thread.
    fn load_agent(&mut self, source: &str, sink: Box<dyn FnMut(Value) + Send>) -> Result<()>;

    /// Post a command string to the loaded agent.
    fn post(&mut self, command: &str) -> Result<()>;

    /// Whether the runtime has torn the session down underneath us.
    fn is_detached(&self) -> bool;

    /// Tear the session down.
    fn detach(&mut self) -> Result<()>;
}

/// Lifecycle of one dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Attached,
    PayloadLoaded,
    Collecting,
    Done,
    /// The runtime detached mid-dump; the session is unusable.
    DetachedError,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Attached => "attached",
            SessionState::PayloadLoaded => "payload loaded",
            SessionState::Collecting => "collecting",
            SessionState::Done => "done",
            SessionState::DetachedError => "detached",
        }
    }
}

/// Removes the transient download tree when the dump leaves scope,
/// success or not.
struct ScratchGuard {
    root: PathBuf,
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.root) {
            if err.kind() != std::io::ErrorKind::NotFound {
                println!("[!]  Failed to remove '{}': {err}.", self.root.display());
            }
        }
    }
}

/// Session controller: owns the device handle and drives one dump from
/// attach through collection to the assembled archive.
pub struct Dumper<D: DeviceControl> {
    device: D,
    config: DumpConfig,
    state: SessionState,
    target: Option<TargetProcess>,
    session: Option<D::Session>,
    detach_flag: Arc<AtomicBool>,
}

impl<D: DeviceControl> Dumper<D> {
    pub fn new(device: D, config: DumpConfig) -> Self {
        Self {
            device,
            config,
            state: SessionState::Idle,
            target: None,
            session: None,
            detach_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Attach to `target`. A running match is attached directly; an
    /// installed-but-stopped target is spawned suspended, attached and
    /// resumed. Failures are reported and leave the controller idle so
    /// the caller may retry with another target.
    pub fn launch(&mut self, target: &str) -> bool {
        if self.state != SessionState::Idle {
            let err = DumperError::InvalidState {
                expected: "idle",
                actual: self.state.name(),
            };
            println!("[!]  {err}");
            return false;
        }

        match self.attach_target(target) {
            Ok((process, session)) => {
                self.target = Some(process);
                self.session = Some(session);
                self.state = SessionState::Attached;
                true
            }
            Err(source) => {
                let err = DumperError::LaunchFailed {
                    target: target.to_string(),
                    source,
                };
                println!("[!]  {}", err.user_message());
                false
            }
        }
    }

    fn attach_target(&mut self, target: &str) -> anyhow::Result<(TargetProcess, D::Session)> {
        if let Some(process) = self.device.find_running(target)? {
            println!("[*]  The target app '{}' is running now.", process.name);
            let session = self.device.attach(process.pid)?;
            Ok((process, session))
        } else {
            println!("[*]  Start the target app '{target}'.");
            let process = self.device.spawn_suspended(target)?;
            let session = self.device.attach(process.pid)?;
            self.device.resume(process.pid)?;
            Ok((process, session))
        }
    }

    /// Run the dump over the attached session. Returns the archive path,
    /// or `None` when the user interrupted the wait. The download tree
    /// is removed on every exit path.
    pub fn execute<F>(&mut self, fetcher: F) -> Result<Option<PathBuf>>
    where
        F: RemoteFetcher + 'static,
    {
        if self.state != SessionState::Attached {
            return Err(DumperError::InvalidState {
                expected: "attached",
                actual: self.state.name(),
            });
        }
        let target = self.target.clone().ok_or(DumperError::InvalidState {
            expected: "attached",
            actual: "idle",
        })?;
        let mut session = self.session.take().ok_or(DumperError::InvalidState {
            expected: "attached",
            actual: "idle",
        })?;

        let result = self.run_dump(&mut session, &target, fetcher);

        if let Err(err) = session.detach() {
            println!("[!]  Failed to detach cleanly: {err}.");
        }
        self.state = match &result {
            Ok(Some(_)) => SessionState::Done,
            _ if self.detach_flag.load(Ordering::SeqCst) => SessionState::DetachedError,
            _ => SessionState::Idle,
        };
        result
    }

    fn run_dump<F>(
        &mut self,
        session: &mut D::Session,
        target: &TargetProcess,
        mut fetcher: F,
    ) -> Result<Option<PathBuf>>
    where
        F: RemoteFetcher + 'static,
    {
        let source = agent::load_agent_source(&self.config)?;

        self.detach_flag.store(false, Ordering::SeqCst);

        let payload_path = self.prepare_scratch()?;
        let _scratch = ScratchGuard {
            root: self.config.scratch_root.clone(),
        };

        let (collector, completion) = EventCollector::new(payload_path.clone());
        let sink_collector = Arc::clone(&collector);
        session.load_agent(
            &source,
            Box::new(move |message| sink_collector.handle_message(&mut fetcher, &message)),
        )?;
        self.state = SessionState::PayloadLoaded;

        println!(
            "[*]  Dumping '{}' to '{}'.",
            target.name,
            self.config.scratch_root.display()
        );
        session.post(DUMP_COMMAND)?;
        self.state = SessionState::Collecting;

        loop {
            match completion.recv_timeout(WAIT_TICK) {
                Ok(CollectionSignal::Done) => break,
                Ok(CollectionSignal::Fatal(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => {
                    // Notification only; a detach without a prior `done`
                    // leaves the wait in place.
                    if session.is_detached()
                        && !self.detach_flag.swap(true, Ordering::SeqCst)
                    {
                        println!("[!]  Session is detached.");
                    }
                    if signals::is_interrupted() {
                        println!("[!]  {}", DumperError::Interrupted.user_message());
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DumperError::Other(anyhow!(
                        "agent message sink dropped before completion"
                    )));
                }
            }
        }

        std::fs::create_dir_all(&self.config.output_dir)
            .with_context(|| format!("create {}", self.config.output_dir.display()))?;
        let manifest = collector.lock_manifest();
        let archive = assemble::build_archive(
            &manifest,
            &payload_path,
            &target.name,
            &self.config.output_dir,
        )?;
        Ok(Some(archive))
    }

    /// Destroy any stale download tree and create a fresh one.
    fn prepare_scratch(&self) -> Result<PathBuf> {
        let root = &self.config.scratch_root;
        if root.exists() {
            std::fs::remove_dir_all(root).map_err(|source| DumperError::ScratchDir {
                path: root.display().to_string(),
                source,
            })?;
        }
        let payload = self.config.payload_path();
        std::fs::create_dir_all(&payload).map_err(|source| DumperError::ScratchDir {
            path: payload.display().to_string(),
            source,
        })?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::testing::{FailingFetcher, LocalFetcher};
    use serde_json::json;
    use std::fs::File;
    use std::io::Read;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const INFO_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleShortVersionString</key>
    <string>1.2</string>
</dict>
</plist>
"#;

    #[derive(Clone, Default)]
    struct DeviceLog(Arc<Mutex<Vec<String>>>);

    impl DeviceLog {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakeSession {
        sink: Option<Box<dyn FnMut(Value) + Send>>,
        messages: Vec<Value>,
        log: DeviceLog,
        detached: bool,
    }

    impl AgentSession for FakeSession {
        fn load_agent(&mut self, _source: &str, sink: Box<dyn FnMut(Value) + Send>) -> Result<()> {
            self.sink = Some(sink);
            Ok(())
        }

        fn post(&mut self, command: &str) -> Result<()> {
            self.log.push(format!("post:{command}"));
            let mut sink = self
                .sink
                .take()
                .ok_or_else(|| DumperError::Other(anyhow!("agent not loaded")))?;
            // Synchronous stand-in for the runtime's delivery thread.
            for message in self.messages.drain(..) {
                sink(message);
            }
            Ok(())
        }

        fn is_detached(&self) -> bool {
            self.detached
        }

        fn detach(&mut self) -> Result<()> {
            self.log.push("detach");
            Ok(())
        }
    }

    struct FakeDevice {
        running: Option<TargetProcess>,
        messages: Vec<Value>,
        log: DeviceLog,
        fail_attach: bool,
        detached_session: bool,
    }

    impl FakeDevice {
        fn new(running: Option<TargetProcess>, messages: Vec<Value>) -> (Self, DeviceLog) {
            let log = DeviceLog::default();
            let device = Self {
                running,
                messages,
                log: log.clone(),
                fail_attach: false,
                detached_session: false,
            };
            (device, log)
        }
    }

    impl DeviceControl for FakeDevice {
        type Session = FakeSession;

        fn find_running(&mut self, target: &str) -> Result<Option<TargetProcess>> {
            self.log.push(format!("find:{target}"));
            Ok(self.running.clone())
        }

        fn spawn_suspended(&mut self, target: &str) -> Result<TargetProcess> {
            self.log.push(format!("spawn:{target}"));
            Ok(TargetProcess {
                pid: 4242,
                name: target.to_string(),
            })
        }

        fn attach(&mut self, pid: u32) -> Result<FakeSession> {
            self.log.push(format!("attach:{pid}"));
            if self.fail_attach {
                return Err(DumperError::Other(anyhow!("process died while attaching")));
            }
            Ok(FakeSession {
                sink: None,
                messages: std::mem::take(&mut self.messages),
                log: self.log.clone(),
                detached: self.detached_session,
            })
        }

        fn resume(&mut self, pid: u32) -> Result<()> {
            self.log.push(format!("resume:{pid}"));
            Ok(())
        }
    }

    struct RemoteTree {
        _dir: TempDir,
        app_dir: String,
        segment: String,
    }

    /// A fake device filesystem: Foo.app with an encrypted main binary
    /// and its decrypted copy parked under tmp.
    fn remote_tree() -> RemoteTree {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("Foo.app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("Foo"), b"encrypted main").unwrap();
        std::fs::write(app.join("Info.plist"), INFO_PLIST).unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("Foo"), b"decrypted main").unwrap();

        RemoteTree {
            app_dir: app.to_string_lossy().into_owned(),
            segment: tmp.join("Foo").to_string_lossy().into_owned(),
            _dir: dir,
        }
    }

    fn dump_messages(tree: &RemoteTree) -> Vec<Value> {
        vec![
            json!({ "type": "send", "payload": { "app": tree.app_dir } }),
            json!({
                "type": "send",
                "payload": { "dump": tree.segment, "path": format!("{}/Foo", tree.app_dir) }
            }),
            json!({ "type": "send", "payload": { "done": true } }),
        ]
    }

    fn test_config(scratch: &Path, out: &Path) -> DumpConfig {
        DumpConfig {
            scratch_root: scratch.to_path_buf(),
            output_dir: out.to_path_buf(),
            ..DumpConfig::default()
        }
    }

    fn read_entry(archive: &Path, name: &str) -> Vec<u8> {
        let file = File::open(archive).unwrap();
        let mut zip = zip::ZipArchive::new(file).unwrap();
        let mut entry = zip.by_name(name).unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn launch_attaches_running_target_without_resume() {
        let running = TargetProcess {
            pid: 7,
            name: "Foo".to_string(),
        };
        let (device, log) = FakeDevice::new(Some(running), Vec::new());
        let scratch = TempDir::new().unwrap();
        let mut dumper = Dumper::new(device, test_config(scratch.path(), scratch.path()));

        assert!(dumper.launch("com.example.foo"));
        assert_eq!(dumper.state(), SessionState::Attached);
        assert_eq!(log.entries(), vec!["find:com.example.foo", "attach:7"]);
    }

    #[test]
    fn launch_spawns_suspended_then_resumes() {
        let (device, log) = FakeDevice::new(None, Vec::new());
        let scratch = TempDir::new().unwrap();
        let mut dumper = Dumper::new(device, test_config(scratch.path(), scratch.path()));

        assert!(dumper.launch("com.example.foo"));
        assert_eq!(
            log.entries(),
            vec![
                "find:com.example.foo",
                "spawn:com.example.foo",
                "attach:4242",
                "resume:4242"
            ]
        );
    }

    #[test]
    fn failed_attach_reports_and_stays_idle() {
        let (mut device, _log) = FakeDevice::new(None, Vec::new());
        device.fail_attach = true;
        let scratch = TempDir::new().unwrap();
        let mut dumper = Dumper::new(device, test_config(scratch.path(), scratch.path()));

        assert!(!dumper.launch("com.example.foo"));
        assert_eq!(dumper.state(), SessionState::Idle);

        let err = dumper.execute(LocalFetcher).unwrap_err();
        assert!(matches!(err, DumperError::InvalidState { .. }));
    }

    #[test]
    fn dump_produces_archive_and_removes_scratch() {
        let tree = remote_tree();
        let (device, log) = FakeDevice::new(None, dump_messages(&tree));
        let dirs = TempDir::new().unwrap();
        let scratch = dirs.path().join("scratch");
        let out = dirs.path().join("out");
        let mut dumper = Dumper::new(device, test_config(&scratch, &out));

        assert!(dumper.launch("Foo"));
        let archive = dumper.execute(LocalFetcher).unwrap().unwrap();

        assert_eq!(archive, out.join("Foo_1.2.ipa"));
        assert_eq!(
            read_entry(&archive, "Payload/Foo.app/Foo"),
            b"decrypted main"
        );
        assert_eq!(dumper.state(), SessionState::Done);
        assert!(!scratch.exists());
        assert!(log.entries().contains(&"post:dump".to_string()));
        assert_eq!(log.entries().last().map(String::as_str), Some("detach"));
    }

    #[test]
    fn stale_scratch_is_destroyed_and_dumps_repeat() {
        let tree = remote_tree();
        let dirs = TempDir::new().unwrap();
        let scratch = dirs.path().join("scratch");
        let out = dirs.path().join("out");

        // Leftovers from an earlier aborted run.
        std::fs::create_dir_all(scratch.join("Payload")).unwrap();
        std::fs::write(scratch.join("Payload/stale"), b"old").unwrap();

        for _ in 0..2 {
            let (device, _log) = FakeDevice::new(None, dump_messages(&tree));
            let mut dumper = Dumper::new(device, test_config(&scratch, &out));
            assert!(dumper.launch("Foo"));
            let archive = dumper.execute(LocalFetcher).unwrap().unwrap();

            let file = File::open(&archive).unwrap();
            let zip = zip::ZipArchive::new(file).unwrap();
            let names: Vec<_> = zip.file_names().collect();
            assert!(!names.iter().any(|n| n.contains("stale")));
            assert!(!scratch.exists());
        }
    }

    #[test]
    fn fetch_failure_is_fatal_and_scratch_is_removed() {
        let tree = remote_tree();
        let (device, _log) = FakeDevice::new(None, dump_messages(&tree));
        let dirs = TempDir::new().unwrap();
        let scratch = dirs.path().join("scratch");
        let mut dumper = Dumper::new(device, test_config(&scratch, dirs.path()));

        assert!(dumper.launch("Foo"));
        let err = dumper.execute(FailingFetcher).unwrap_err();

        assert!(matches!(err, DumperError::Fetch { .. }));
        assert!(!scratch.exists());
        assert_eq!(dumper.state(), SessionState::Idle);
    }

    #[test]
    fn interrupt_aborts_without_archive() {
        let (device, _log) = FakeDevice::new(None, Vec::new());
        let dirs = TempDir::new().unwrap();
        let scratch = dirs.path().join("scratch");
        let out = dirs.path().join("out");
        let mut dumper = Dumper::new(device, test_config(&scratch, &out));

        let _latch = signals::TEST_LATCH_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        assert!(dumper.launch("Foo"));
        signals::interrupt_for_tests();
        let outcome = dumper.execute(LocalFetcher).unwrap();
        signals::reset_interrupt_flag();

        assert!(outcome.is_none());
        assert!(!scratch.exists());
        assert!(!out.exists());
        assert_eq!(dumper.state(), SessionState::Idle);
    }

    #[test]
    fn runtime_detach_is_observed_but_does_not_finish_the_dump() {
        let (mut device, _log) = FakeDevice::new(None, Vec::new());
        device.detached_session = true;
        let dirs = TempDir::new().unwrap();
        let scratch = dirs.path().join("scratch");
        let mut dumper = Dumper::new(device, test_config(&scratch, dirs.path()));

        let _latch = signals::TEST_LATCH_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        assert!(dumper.launch("Foo"));
        // The detached session never sends `done`; only the interrupt
        // releases the wait.
        signals::interrupt_for_tests();
        let outcome = dumper.execute(LocalFetcher).unwrap();
        signals::reset_interrupt_flag();

        assert!(outcome.is_none());
        assert_eq!(dumper.state(), SessionState::DetachedError);
    }
}
