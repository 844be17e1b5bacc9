use std::path::PathBuf;
use std::time::Duration;

/// Directory created under the scratch root; downloads land here and the
/// final archive is rooted at it.
pub const PAYLOAD_DIR: &str = "Payload";

/// Substring marking the application-bundle boundary in device paths.
pub const APP_BOUNDARY: &str = ".app/";

/// Command posted to the agent to start extraction.
pub const DUMP_COMMAND: &str = "dump";

/// Idle bound applied to every remote-copy operation.
pub const FETCH_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Mode bits for downloaded binary segments.
pub const SEGMENT_FILE_MODE: u32 = 0o655;

/// Mode bits for the downloaded application bundle directory.
pub const APP_DIR_MODE: u32 = 0o755;

/// Version label used when Info.plist is missing or unreadable.
pub const FALLBACK_VERSION: &str = "unknown";

/// Default device SSH port, as exposed by the usbmuxd proxy.
pub const DEFAULT_SSH_PORT: u16 = 2222;

#[derive(Clone, Debug)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_SSH_PORT,
            username: "root".to_string(),
            password: "alpine".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DumpConfig {
    /// Root of the transient download tree; recreated for every dump.
    pub scratch_root: PathBuf,
    /// Optional filesystem path to a custom agent script.
    pub agent_script: Option<PathBuf>,
    /// Directory receiving the finished archive.
    pub output_dir: PathBuf,
    /// Optional remote `<host>:<port>` descriptor for frida-server.
    pub remote_device: Option<String>,
    pub ssh: SshConfig,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir().join("ipadump"),
            agent_script: None,
            output_dir: PathBuf::from("."),
            remote_device: None,
            ssh: SshConfig::default(),
        }
    }
}

impl DumpConfig {
    /// The download root proper: `<scratch_root>/Payload`.
    pub fn payload_path(&self) -> PathBuf {
        self.scratch_root.join(PAYLOAD_DIR)
    }
}
