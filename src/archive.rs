//! IPA and bundle archive handling
//!
//! An IPA is a zip whose bundle lives under `Payload/<Name>.app/`. App drop
//! goes the other way and packs a bundle directory as `<Name>.zip` with the
//! bundle as its single top-level entry, ready for `unzip` on the device.
//!
//! Everything here is blocking; async callers go through
//! `tokio::task::spawn_blocking`.

use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{IsyncError, Result};

const PAYLOAD: &str = "Payload/";
const BUNDLE_SUFFIX: &str = ".app";

/// Find the `Payload/<Name>.app/` prefix of an IPA.
///
/// An explicit directory entry wins; archives without directory entries are
/// handled by inferring the prefix from the first file inside a bundle.
pub fn find_bundle_prefix<R: Read + Seek>(archive: &ZipArchive<R>) -> Result<String> {
    let mut ordered: Vec<&str> = archive.file_names().collect();
    ordered.sort_unstable();

    let explicit = ordered.iter().find(|name| {
        name.strip_prefix(PAYLOAD)
            .and_then(|rest| rest.strip_suffix('/'))
            .is_some_and(|dir| dir.ends_with(BUNDLE_SUFFIX) && !dir.contains('/'))
    });
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }

    ordered
        .iter()
        .find_map(|name| {
            let rest = name.strip_prefix(PAYLOAD)?;
            let idx = rest.find(".app/")?;
            let dir = &rest[..idx + BUNDLE_SUFFIX.len()];
            (!dir.contains('/')).then(|| format!("{}{}/", PAYLOAD, dir))
        })
        .ok_or_else(|| IsyncError::archive("could not locate Payload/<Name>.app/ in archive"))
}

/// Bundle directory name (`App.app`) for a `Payload/App.app/` prefix
pub fn prefix_bundle_dir(prefix: &str) -> &str {
    prefix
        .trim_start_matches(PAYLOAD)
        .trim_end_matches('/')
}

/// Directory name of the bundle inside `ipa`, without extracting it
pub fn ipa_bundle_dir(ipa: &Path) -> Result<String> {
    let archive = ZipArchive::new(File::open(ipa)?)?;
    let prefix = find_bundle_prefix(&archive)?;
    Ok(prefix_bundle_dir(&prefix).to_string())
}

/// Extract the bundle of `ipa` into `dest`, returning `dest/<Name>.app`.
///
/// Entries whose names would escape `dest` are skipped. Unix modes stored
/// in the archive are restored.
pub fn extract_bundle(ipa: &Path, dest: &Path) -> Result<PathBuf> {
    let mut archive = ZipArchive::new(File::open(ipa)?)?;
    let prefix = find_bundle_prefix(&archive)?;
    let payload_root = Path::new(PAYLOAD);

    info!("Extracting {} from {}", prefix, ipa.display());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if !entry.name().starts_with(&prefix) {
            continue;
        }

        let Some(enclosed) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let relative = enclosed
            .strip_prefix(payload_root)
            .map_err(|e| IsyncError::archive(format!("{}: {}", entry.name(), e)))?
            .to_path_buf();
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
        }

        if let Some(mode) = entry.unix_mode() {
            restore_mode(&target, mode, entry.is_dir())?;
        }
    }

    let bundle = dest.join(prefix_bundle_dir(&prefix));
    if !bundle.is_dir() {
        return Err(IsyncError::archive(format!(
            "{} produced no bundle directory",
            ipa.display()
        )));
    }
    Ok(bundle)
}

#[cfg(unix)]
fn restore_mode(path: &Path, mode: u32, is_dir: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    // keep extracted directories traversable
    let mode = if is_dir { mode | 0o700 } else { mode };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

#[cfg(not(unix))]
fn restore_mode(_path: &Path, _mode: u32, _is_dir: bool) -> Result<()> {
    Ok(())
}

/// `App` for `.../App.app` (the suffix is matched case-insensitively)
pub fn bundle_base_name(bundle_dir: &Path) -> Result<String> {
    let name = bundle_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            IsyncError::invalid_params(format!("{} has no file name", bundle_dir.display()))
        })?;
    Ok(strip_bundle_suffix(&name).to_string())
}

/// Name a bundle is shown under: `CFBundleDisplayName`, else `CFBundleName`
/// from its `Info.plist`, else the folder name.
pub fn bundle_display_name(bundle_dir: &Path) -> String {
    let folder = || {
        bundle_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| bundle_dir.display().to_string())
    };

    let info = bundle_dir.join("Info.plist");
    if !info.is_file() {
        return folder();
    }
    let value = match plist::Value::from_file(&info) {
        Ok(value) => value,
        Err(e) => {
            debug!("Unreadable {}: {}", info.display(), e);
            return folder();
        }
    };

    value
        .as_dictionary()
        .and_then(|dict| {
            ["CFBundleDisplayName", "CFBundleName"].iter().find_map(|key| {
                dict.get(*key)
                    .and_then(plist::Value::as_string)
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
            })
        })
        .map(str::to_owned)
        .unwrap_or_else(folder)
}

/// Remove a trailing `.app`, if any
pub fn strip_bundle_suffix(name: &str) -> &str {
    let split = name.len().saturating_sub(BUNDLE_SUFFIX.len());
    match name.get(split..) {
        Some(tail) if tail.eq_ignore_ascii_case(BUNDLE_SUFFIX) => &name[..split],
        _ => name,
    }
}

/// Pack `bundle_dir` as `out_dir/<Name>.zip` with `<Name>.app/` at the top.
///
/// Directory entries are written too so empty directories survive.
pub fn pack_bundle(bundle_dir: &Path, out_dir: &Path) -> Result<PathBuf> {
    let dir_name = bundle_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            IsyncError::invalid_params(format!("{} has no file name", bundle_dir.display()))
        })?;
    let zip_path = out_dir.join(format!("{}.zip", strip_bundle_suffix(&dir_name)));

    let mut writer = ZipWriter::new(File::create(&zip_path)?);
    let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut files = 0usize;

    for entry in WalkDir::new(bundle_dir).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(bundle_dir)
            .map_err(IsyncError::archive)?;
        let mut name = dir_name.clone();
        for component in relative.components() {
            name.push('/');
            name.push_str(&component.as_os_str().to_string_lossy());
        }

        let options = with_mode(base, &entry.metadata()?);
        if entry.file_type().is_dir() {
            writer.add_directory(format!("{}/", name), options)?;
        } else {
            writer.start_file(name, options)?;
            let mut source = File::open(entry.path())?;
            io::copy(&mut source, &mut writer)?;
            files += 1;
        }
    }

    writer.finish()?;

    let size = std::fs::metadata(&zip_path)?.len();
    if size == 0 {
        return Err(IsyncError::archive(format!("{} is empty", zip_path.display())));
    }
    debug!("Packed {} files into {} ({} bytes)", files, zip_path.display(), size);
    Ok(zip_path)
}

#[cfg(unix)]
fn with_mode(options: SimpleFileOptions, metadata: &std::fs::Metadata) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    options.unix_permissions(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn with_mode(options: SimpleFileOptions, _metadata: &std::fs::Metadata) -> SimpleFileOptions {
    options
}

/// Find `.app` directories at most two levels below `root`, sorted.
///
/// Bundles are not searched for nested bundles.
pub fn scan_bundles(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(IsyncError::invalid_params(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut bundles = Vec::new();
    let mut walker = WalkDir::new(root).min_depth(1).max_depth(2).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if strip_bundle_suffix(&name).len() != name.len() {
            bundles.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }

    bundles.sort();
    Ok(bundles)
}
