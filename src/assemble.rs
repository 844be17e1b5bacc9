use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::Context;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::{FALLBACK_VERSION, PAYLOAD_DIR};
use crate::error::{DumperError, Result};
use crate::manifest::Manifest;

/// Assemble the final archive from a completed manifest and the
/// populated download root.
///
/// Segments are relocated into their original place inside the app
/// directory, the bundle version is read for the artifact label, and the
/// whole `Payload/` tree is zipped into `<display_name>_<version>.ipa`
/// in `output_dir`.
pub fn build_archive(
    manifest: &Manifest,
    payload_path: &Path,
    display_name: &str,
    output_dir: &Path,
) -> Result<PathBuf> {
    let app_root = manifest.app_root().ok_or(DumperError::MissingAppRecord)?;
    let app_dir = payload_path.join(app_root);

    println!("[*]  Creating ipa file of downloaded files.");

    for (artifact_id, dest) in manifest.segments() {
        let from = payload_path.join(artifact_id);
        let to = app_dir.join(dest);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::rename(&from, &to)
            .with_context(|| format!("relocate {} -> {}", from.display(), to.display()))?;
    }

    let version = read_bundle_version(&app_dir.join("Info.plist"));
    let archive_path = output_dir.join(format!("{display_name}_{version}.ipa"));
    write_payload_zip(payload_path, &archive_path)?;

    Ok(archive_path)
}

/// Human-readable version from the bundle metadata; absent or unparsable
/// files yield the fixed placeholder instead of failing.
fn read_bundle_version(info_plist: &Path) -> String {
    plist::Value::from_file(info_plist)
        .ok()
        .and_then(|value| {
            value
                .as_dictionary()
                .and_then(|dict| dict.get("CFBundleShortVersionString"))
                .and_then(|version| version.as_string())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| FALLBACK_VERSION.to_string())
}

/// Zip the reconstructed download root with entries rooted at
/// `Payload/`, the distributable container layout.
fn write_payload_zip(payload_path: &Path, archive_path: &Path) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let run = || -> anyhow::Result<()> {
        let file = File::create(archive_path)
            .with_context(|| format!("create {}", archive_path.display()))?;
        let mut writer = ZipWriter::new(file);

        for entry in WalkDir::new(payload_path).min_depth(1) {
            let entry = entry.context("walk download root")?;
            let rel = entry
                .path()
                .strip_prefix(payload_path)
                .context("entry outside download root")?;
            let name = format!("{PAYLOAD_DIR}/{}", rel.display());
            let mode = entry.metadata().context("entry metadata")?.permissions().mode();
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(mode);

            if entry.file_type().is_dir() {
                writer.add_directory(name, options)?;
            } else {
                writer.start_file(name, options)?;
                let mut source = File::open(entry.path())
                    .with_context(|| format!("open {}", entry.path().display()))?;
                std::io::copy(&mut source, &mut writer)
                    .with_context(|| format!("deflate {}", entry.path().display()))?;
            }
        }

        writer.finish().context("finalize archive")?;
        Ok(())
    };

    run().map_err(DumperError::Other)?;
    Ok(archive_path.to_path_buf())
}
