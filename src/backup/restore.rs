//! Applies a chosen backup back onto disk.
//!
//! Dispatch is a single match on the payload shape: folder backups carrying
//! our manifest, compressed archives, and legacy foreign backups described
//! by a `mapping.yaml`. The destination is always overwritten, never merged,
//! and is recreated if it no longer exists.

use crate::backup::archive::{self, BackupManifest, ManifestFile};
use crate::error::{Result, SqobaError};
use crate::progress::{ProgressScope, Stage};
use lazy_static::lazy_static;
use rayon::prelude::*;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use zip::ZipArchive;

pub const LEGACY_MAPPING_NAME: &str = "mapping.yaml";

lazy_static! {
    static ref DRIVE_RE: Regex =
        Regex::new(r"^([A-Za-z]):[\\/](.*)$").expect("regex for drive prefix");
}

/// Restore one backup payload onto `save_path`.
pub fn restore_payload(
    backup_path: &Path,
    save_path: &Path,
    threads: usize,
    scope: &ProgressScope,
) -> Result<()> {
    if backup_path.is_dir() {
        if backup_path.join(archive::MANIFEST_NAME).exists() {
            let manifest = archive::read_manifest(backup_path)?;
            return restore_folder(backup_path, save_path, &manifest, threads, scope);
        }
        let mapping_path = backup_path.join(LEGACY_MAPPING_NAME);
        if mapping_path.exists() {
            return restore_legacy(backup_path, &mapping_path, scope);
        }
        return Err(SqobaError::ManifestCorrupt(format!(
            "no recognizable manifest in {}",
            backup_path.display()
        )));
    }

    if backup_path.is_file() {
        return restore_zip(backup_path, save_path, scope);
    }

    Err(SqobaError::NotFound(format!(
        "backup payload {}",
        backup_path.display()
    )))
}

/// Stamp the manifest mtime back onto a restored file so the change detector
/// sees the tree exactly as it was backed up.
fn restore_mtime(target: &Path, mtime: Option<i64>) {
    let Some(secs) = mtime.and_then(|m| u64::try_from(m).ok()) else {
        return;
    };
    let stamp = std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs);
    match File::options().write(true).open(target) {
        Ok(file) => {
            if let Err(e) = file.set_modified(stamp) {
                tracing::debug!("Could not restore mtime on {:?}: {}", target, e);
            }
        }
        Err(e) => tracing::debug!("Could not reopen {:?} for mtime: {}", target, e),
    }
}

/// Where the entry's payload lives inside the backup. Legacy entries carry
/// their own `files/<root-label>/...` location; current entries sit under
/// the `files/` root.
fn payload_entry_name(entry: &ManifestFile) -> String {
    match &entry.archive_path {
        Some(path) => path.clone(),
        None => format!("{}/{}", archive::FILES_PREFIX, entry.relative_path),
    }
}

fn target_for(entry: &ManifestFile, save_path: &Path) -> PathBuf {
    // Schema v1 entries carry absolute targets; v2 is relative to save_path.
    match &entry.original_path {
        Some(original) => PathBuf::from(original),
        None => save_path.join(&entry.relative_path),
    }
}

fn restore_folder(
    backup_path: &Path,
    save_path: &Path,
    manifest: &BackupManifest,
    threads: usize,
    scope: &ProgressScope,
) -> Result<()> {
    fs::create_dir_all(save_path)?;
    scope.emit(Stage::Scan, "Reading backup manifest", 0, manifest.files.len());

    let items: Vec<(PathBuf, PathBuf, Option<i64>)> = manifest
        .files
        .iter()
        .map(|entry| {
            let source = backup_path.join(path_from_rel(&payload_entry_name(entry)));
            (source, target_for(entry, save_path), entry.mtime)
        })
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|e| SqobaError::Other(e.to_string()))?;

    let total = items.len();
    let counter = AtomicUsize::new(0);
    let copied = AtomicUsize::new(0);

    let results: Vec<Result<()>> = pool.install(|| {
        items
            .par_iter()
            .map(|(source, target, mtime)| {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if source.exists() {
                    fs::copy(source, target)?;
                    restore_mtime(target, *mtime);
                    copied.fetch_add(1, Ordering::SeqCst);
                } else {
                    tracing::warn!("Backup entry missing on disk: {:?}", source);
                }
                let done = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if done == total || done % 50 == 0 {
                    scope.emit(Stage::Copy, target.to_string_lossy(), done, total);
                }
                Ok(())
            })
            .collect()
    });
    for r in results {
        r?;
    }
    // A manifest whose payload is entirely absent is a broken backup, not a
    // successful restore of nothing.
    if total > 0 && copied.load(Ordering::SeqCst) == 0 {
        return Err(SqobaError::ManifestCorrupt(format!(
            "no payload entries found in {}",
            backup_path.display()
        )));
    }
    Ok(())
}

fn restore_zip(backup_path: &Path, save_path: &Path, scope: &ProgressScope) -> Result<()> {
    let file = File::open(backup_path)?;
    let mut zip = ZipArchive::new(file)?;
    let manifest = match archive::read_manifest(backup_path) {
        Ok(manifest) => manifest,
        // Sidecar gone; fall back to the embedded copy.
        Err(_) => archive::read_manifest_from_zip(&mut zip)?,
    };

    fs::create_dir_all(save_path)?;
    let total = manifest.files.len();
    scope.emit(Stage::Scan, "Reading backup manifest", 0, total);

    for (index, entry) in manifest.files.iter().enumerate() {
        let entry_name = payload_entry_name(entry);
        let mut zipped = zip
            .by_name(&entry_name)
            .map_err(|e| SqobaError::ManifestCorrupt(format!("missing archive entry: {}", e)))?;

        let target = target_for(entry, save_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut zipped, &mut out)?;
        drop(out);
        restore_mtime(&target, entry.mtime);

        let done = index + 1;
        if done == total || done % 50 == 0 {
            scope.emit(Stage::Extract, target.to_string_lossy(), done, total);
        }
    }
    Ok(())
}

// --- Legacy foreign backups ---

#[derive(Debug, Deserialize)]
struct LegacyMapping {
    #[allow(dead_code)]
    name: String,
    #[serde(default)]
    drives: HashMap<String, String>,
    backups: Vec<LegacyBackup>,
}

#[derive(Debug, Deserialize)]
struct LegacyBackup {
    #[allow(dead_code)]
    name: String,
    files: HashMap<String, LegacyFile>,
}

#[derive(Debug, Deserialize)]
struct LegacyFile {
    #[allow(dead_code)]
    size: u64,
}

/// Restore from a foreign tool's layout: a `mapping.yaml` whose file keys are
/// original absolute paths and whose payload lives under drive-keyed folders.
fn restore_legacy(backup_root: &Path, mapping_path: &Path, scope: &ProgressScope) -> Result<()> {
    let text = fs::read_to_string(mapping_path)?;
    let mapping: LegacyMapping =
        serde_yaml::from_str(&text).map_err(|e| SqobaError::ManifestCorrupt(e.to_string()))?;
    let backup = mapping
        .backups
        .last()
        .ok_or_else(|| SqobaError::ManifestCorrupt("no backup entries in mapping".into()))?;

    let mut inverse: HashMap<String, String> = HashMap::new();
    for (key, prefix) in &mapping.drives {
        inverse.insert(prefix.clone(), key.clone());
    }

    let total = backup.files.len();
    scope.emit(Stage::Scan, "Reading legacy mapping", 0, total);

    for (index, original) in backup.files.keys().enumerate() {
        let (drive_key, rel) = split_drive(original, &inverse);
        let source = backup_root.join(path_from_rel(&format!("{}/{}", drive_key, rel)));
        let target = PathBuf::from(original);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if source.exists() {
            fs::copy(&source, &target)?;
        } else {
            tracing::warn!("Legacy backup entry missing on disk: {:?}", source);
        }
        scope.emit(Stage::Copy, target.to_string_lossy(), index + 1, total);
    }
    Ok(())
}

fn split_drive(original: &str, inverse_drives: &HashMap<String, String>) -> (String, String) {
    if let Some(caps) = DRIVE_RE.captures(original) {
        let letter = caps[1].to_uppercase();
        let rest = caps[2].replace('\\', "/");
        let prefix = format!("{}:", letter);
        if let Some(key) = inverse_drives.get(&prefix) {
            return (key.clone(), rest);
        }
        return (format!("drive-{}", letter), rest);
    }
    ("drive-0".to_string(), original.replace('\\', "/"))
}

fn path_from_rel(rel: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for part in rel.split('/') {
        if part.is_empty() {
            continue;
        }
        out.push(part);
    }
    out
}
