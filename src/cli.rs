use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::DumpConfig;

#[derive(Parser, Debug)]
#[command(
    name = "ipadump",
    about = "Decrypted IPA extractor for jailbroken iOS devices",
    version,
    propagate_version = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List processes running on the device.
    List(ListCommand),
    /// Dump a decrypted copy of the target app into an ipa file.
    Dump(DumpCommand),
}

#[derive(Args, Debug, Clone)]
pub struct ListCommand {
    /// Remote frida-server host:port instead of the USB device.
    #[arg(long = "remote", value_name = "HOST:PORT")]
    pub remote: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DumpCommand {
    /// Bundle identifier or display name of the target app.
    pub target: String,

    /// SSH hostname of the device.
    #[arg(short = 'H', long = "host", value_name = "HOST")]
    pub host: Option<String>,

    /// SSH port of the device.
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// SSH username.
    #[arg(short = 'u', long = "user", value_name = "USER")]
    pub user: Option<String>,

    /// SSH password.
    #[arg(short = 'P', long = "password", value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Directory receiving the ipa file.
    #[arg(short = 'o', long = "out", value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Path to a custom agent JavaScript file.
    #[arg(long = "script", value_name = "PATH")]
    pub script: Option<PathBuf>,

    /// Remote frida-server host:port instead of the USB device.
    #[arg(long = "remote", value_name = "HOST:PORT")]
    pub remote: Option<String>,
}

impl ListCommand {
    pub fn to_config(&self) -> DumpConfig {
        let mut cfg = DumpConfig::default();
        cfg.remote_device = self.remote.clone();
        cfg
    }
}

impl DumpCommand {
    pub fn to_config(&self) -> DumpConfig {
        let mut cfg = DumpConfig::default();

        if let Some(host) = &self.host {
            cfg.ssh.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.ssh.port = port;
        }
        if let Some(user) = &self.user {
            cfg.ssh.username = user.clone();
        }
        if let Some(password) = &self.password {
            cfg.ssh.password = password.clone();
        }
        if let Some(dir) = &self.out_dir {
            cfg.output_dir = dir.clone();
        }
        cfg.agent_script = self.script.clone();
        cfg.remote_device = self.remote.clone();
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::DEFAULT_SSH_PORT;
    use clap::Parser;

    fn parse_dump(args: &[&str]) -> (DumpCommand, DumpConfig) {
        let mut argv = vec!["ipadump", "dump"];
        argv.extend(args);
        let cli = Cli::try_parse_from(&argv).expect("parse dump command");
        match cli.command {
            Commands::Dump(cmd) => {
                let cfg = cmd.to_config();
                (cmd, cfg)
            }
            _ => panic!("expected dump command"),
        }
    }

    #[test]
    fn dump_defaults_use_device_ssh_endpoint() {
        let (cmd, cfg) = parse_dump(&["com.example.app"]);

        assert_eq!(cmd.target, "com.example.app");
        assert_eq!(cfg.ssh.host, "localhost");
        assert_eq!(cfg.ssh.port, DEFAULT_SSH_PORT);
        assert_eq!(cfg.ssh.username, "root");
        assert_eq!(cfg.ssh.password, "alpine");
        assert_eq!(cfg.output_dir, PathBuf::from("."));
        assert_eq!(cfg.agent_script, None);
        assert_eq!(cfg.remote_device, None);
    }

    #[test]
    fn dump_options_map_into_config() {
        let (_, cfg) = parse_dump(&[
            "com.example.app",
            "-H",
            "10.0.0.5",
            "-p",
            "22",
            "-u",
            "mobile",
            "-P",
            "hunter2",
            "-o",
            "/tmp/ipas",
            "--script",
            "/tmp/agent.js",
            "--remote",
            "127.0.0.1:27042",
        ]);

        assert_eq!(cfg.ssh.host, "10.0.0.5");
        assert_eq!(cfg.ssh.port, 22);
        assert_eq!(cfg.ssh.username, "mobile");
        assert_eq!(cfg.ssh.password, "hunter2");
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/ipas"));
        assert_eq!(cfg.agent_script, Some(PathBuf::from("/tmp/agent.js")));
        assert_eq!(cfg.remote_device.as_deref(), Some("127.0.0.1:27042"));
    }

    #[test]
    fn dump_requires_a_target() {
        assert!(Cli::try_parse_from(["ipadump", "dump"]).is_err());
    }

    #[test]
    fn list_accepts_remote_device() {
        let cli = Cli::try_parse_from(["ipadump", "list", "--remote", "192.168.1.7:27042"])
            .expect("parse list command");
        match cli.command {
            Commands::List(cmd) => {
                let cfg = cmd.to_config();
                assert_eq!(cfg.remote_device.as_deref(), Some("192.168.1.7:27042"));
            }
            _ => panic!("expected list command"),
        }
    }
}
