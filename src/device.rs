use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::config::DumpConfig;
use crate::transfer::SshTransport;

/// Run one dump against the connected device. `None` means the failure
/// was already reported (target not launchable, or the user aborted).
pub fn run_dump(target: &str, cfg: &DumpConfig, transport: SshTransport) -> Result<Option<PathBuf>> {
    #[cfg(feature = "frida")]
    {
        inner::run_dump(target, cfg, transport)
    }

    #[cfg(not(feature = "frida"))]
    {
        let _ = target;
        let _ = cfg;
        let _ = transport;
        bail!(
            "Instrumentation support is disabled. Rebuild ipadump with `--features frida` \
             to enable dumping."
        );
    }
}

/// Print the processes running on the device.
pub fn run_list(cfg: &DumpConfig) -> Result<()> {
    #[cfg(feature = "frida")]
    {
        inner::run_list(cfg)
    }

    #[cfg(not(feature = "frida"))]
    {
        let _ = cfg;
        bail!(
            "Instrumentation support is disabled. Rebuild ipadump with `--features frida` \
             to enable process listing."
        );
    }
}

#[cfg(feature = "frida")]
mod inner {
    use super::*;

    use anyhow::{anyhow, Context};
    use frida::{
        Device, DeviceManager, DeviceType, Frida, Message, Script, ScriptHandler, ScriptOption,
        Session, SpawnOptions,
    };
    use serde_json::{json, Value};

    use crate::error::DumperError;
    use crate::session::{AgentSession, DeviceControl, Dumper, TargetProcess};

    pub(super) fn run_dump(
        target: &str,
        cfg: &DumpConfig,
        transport: SshTransport,
    ) -> Result<Option<PathBuf>> {
        // The runtime handles are process-wide singletons in practice;
        // leaking them gives the sessions the 'static lifetime the
        // controller's ownership model needs.
        let frida_ctx: &'static Frida = Box::leak(Box::new(unsafe { Frida::obtain() }));
        let manager: &'static DeviceManager = Box::leak(Box::new(DeviceManager::obtain(frida_ctx)));
        let device: &'static Device<'static> =
            Box::leak(Box::new(select_device(manager, cfg).context("select device")?));

        let mut dumper = Dumper::new(FridaControl { device }, cfg.clone());
        if !dumper.launch(target) {
            return Ok(None);
        }
        Ok(dumper.execute(transport)?)
    }

    pub(super) fn run_list(cfg: &DumpConfig) -> Result<()> {
        let frida_ctx = unsafe { Frida::obtain() };
        let manager = DeviceManager::obtain(&frida_ctx);
        let device = select_device(&manager, cfg).context("select device")?;

        println!("{:>8}  {}", "PID", "Name");
        for process in device.enumerate_processes() {
            println!("{:>8}  {}", process.get_pid(), process.get_name());
        }
        Ok(())
    }

    fn select_device<'a>(manager: &'a DeviceManager, cfg: &DumpConfig) -> Result<Device<'a>> {
        if let Some(remote) = cfg.remote_device.as_ref() {
            return manager
                .get_remote_device(remote)
                .with_context(|| format!("connect remote device {remote}"));
        }
        manager
            .get_device_by_type(DeviceType::USB)
            .context("no iOS device found over USB")
    }

    struct FridaControl {
        device: &'static Device<'static>,
    }

    impl DeviceControl for FridaControl {
        type Session = FridaSession;

        fn find_running(&mut self, target: &str) -> crate::error::Result<Option<TargetProcess>> {
            let found = self
                .device
                .enumerate_processes()
                .iter()
                .find(|process| process.get_name() == target)
                .map(|process| TargetProcess {
                    pid: process.get_pid(),
                    name: process.get_name().to_string(),
                });
            Ok(found)
        }

        fn spawn_suspended(&mut self, target: &str) -> crate::error::Result<TargetProcess> {
            let options = SpawnOptions::default();
            let pid = self
                .device
                .spawn(target, &options)
                .with_context(|| format!("spawn {target}"))
                .map_err(DumperError::Other)?;
            Ok(TargetProcess {
                pid,
                name: target.to_string(),
            })
        }

        fn attach(&mut self, pid: u32) -> crate::error::Result<FridaSession> {
            let session = self
                .device
                .attach(pid)
                .with_context(|| format!("attach to pid {pid}"))
                .map_err(DumperError::Other)?;
            Ok(FridaSession {
                session: Box::leak(Box::new(session)),
                script: None,
            })
        }

        fn resume(&mut self, pid: u32) -> crate::error::Result<()> {
            self.device
                .resume(pid)
                .with_context(|| format!("resume pid {pid}"))
                .map_err(DumperError::Other)
        }
    }

    struct FridaSession {
        session: &'static Session<'static>,
        script: Option<Script<'static>>,
    }

    impl AgentSession for FridaSession {
        fn load_agent(
            &mut self,
            source: &str,
            sink: Box<dyn FnMut(Value) + Send>,
        ) -> crate::error::Result<()> {
            let session = self.session;
            let run = move || -> Result<Script<'static>> {
                let mut options = ScriptOption::default();
                let mut script = session
                    .create_script(source, &mut options)
                    .context("create agent script")?;
                script
                    .handle_message(MessageBridge { sink })
                    .context("register agent message handler")?;
                script.load().context("load agent script")?;
                Ok(script)
            };
            self.script = Some(run().map_err(DumperError::Other)?);
            Ok(())
        }

        fn post(&mut self, command: &str) -> crate::error::Result<()> {
            let script = self
                .script
                .as_mut()
                .ok_or_else(|| DumperError::Other(anyhow!("agent is not loaded")))?;
            script
                .post(command, None)
                .context("post command to agent")
                .map_err(DumperError::Other)?;
            Ok(())
        }

        fn is_detached(&self) -> bool {
            self.session.is_detached()
        }

        fn detach(&mut self) -> crate::error::Result<()> {
            if let Some(script) = self.script.take() {
                script.unload().ok();
            }
            self.session
                .detach()
                .context("detach session")
                .map_err(DumperError::Other)?;
            Ok(())
        }
    }

    /// Forwards runtime messages into the collector sink on the delivery
    /// thread, re-wrapped in the shape the agent protocol defines.
    struct MessageBridge {
        sink: Box<dyn FnMut(Value) + Send>,
    }

    impl ScriptHandler for MessageBridge {
        fn on_message(&mut self, message: &Message, _data: Option<Vec<u8>>) {
            let value = match message {
                Message::Send(send) => {
                    json!({ "type": "send", "payload": send.payload.returns.clone() })
                }
                Message::Error(err) => {
                    json!({ "type": "error", "stack": err.description.clone() })
                }
                Message::Log(log) => {
                    println!("[*]  Agent log: {}", log.payload);
                    return;
                }
                Message::Other(other) => other.clone(),
            };
            (self.sink)(value);
        }
    }
}
