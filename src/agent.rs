use anyhow::{Context, Result};

use crate::config::DumpConfig;

/// Resolve the agent source: a user-supplied script wins, otherwise the
/// embedded default is used.
pub fn load_agent_source(cfg: &DumpConfig) -> Result<String> {
    if let Some(path) = cfg.agent_script.as_ref() {
        return std::fs::read_to_string(path)
            .with_context(|| format!("read agent script {}", path.display()));
    }
    Ok(DUMP_AGENT.to_string())
}

/// Default in-process agent. Once told to start it walks the loaded
/// modules of the target, writes a decrypted copy of every encrypted
/// image to the device tmp directory, and reports progress through the
/// message protocol consumed by the collector:
///   { dump: <tmp copy>, path: <original image path> }  per segment,
///   { app: <bundle root> }                             once,
///   { done: true }                                     last.
pub const DUMP_AGENT: &str = r#"
'use strict';

function appBundlePath() {
  var mainBundle = ObjC.classes.NSBundle.mainBundle();
  return mainBundle.bundlePath().toString();
}

function tmpCopyPath(modulePath) {
  var name = modulePath.substring(modulePath.lastIndexOf('/') + 1);
  return '/tmp/' + name;
}

function isEncrypted(module) {
  var header = module.base;
  var ncmds = header.add(16).readU32();
  var cursor = header.add(32);
  for (var i = 0; i < ncmds; i++) {
    var cmd = cursor.readU32();
    var cmdsize = cursor.add(4).readU32();
    if (cmd === 0x21 || cmd === 0x2c) { // LC_ENCRYPTION_INFO(_64)
      return cursor.add(16).readU32() !== 0; // cryptid
    }
    cursor = cursor.add(cmdsize);
  }
  return false;
}

function dumpModule(module) {
  var out = tmpCopyPath(module.path);
  var dst = new File(out, 'wb');
  var decrypted = Memory.readByteArray(module.base, module.size);
  dst.write(decrypted);
  dst.flush();
  dst.close();
  send({ dump: out, path: module.path });
}

function dumpApp() {
  var bundle = appBundlePath();
  var marker = '.app';
  var appRoot = bundle.substring(0, bundle.indexOf(marker) + marker.length);

  Process.enumerateModules().forEach(function (module) {
    if (module.path.indexOf(appRoot) !== 0) {
      return;
    }
    try {
      if (isEncrypted(module)) {
        dumpModule(module);
      }
    } catch (e) {
      send({ error: e.message });
    }
  });

  send({ app: appRoot });
  send({ done: true });
}

function onCommand(command) {
  if (command === 'dump') {
    dumpApp();
  }
  recv(onCommand);
}

recv(onCommand);
"#;
