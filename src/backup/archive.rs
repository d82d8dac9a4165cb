//! Versioned backup archives: folder copies and compressed zip archives,
//! each carrying a per-backup manifest.
//!
//! The manifest is always written in the clear (a plain file in folder
//! backups, a sidecar plus an uncompressed Stored entry for archives) so
//! size/mtime lookups for decision-making never require decompression.

use crate::error::{Result, SqobaError};
use crate::progress::{ProgressScope, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_VERSION: u32 = 2;
pub const MANIFEST_NAME: &str = "__sqoba_manifest.json";
pub const README_NAME: &str = "__sqoba_readme.txt";
/// Subtree inside a backup that holds the copied save files.
pub const FILES_PREFIX: &str = "files";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    Folder,
    Compressed,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Folder => "folder",
            BackupMode::Compressed => "compressed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "folder" => Ok(BackupMode::Folder),
            "compressed" => Ok(BackupMode::Compressed),
            other => Err(SqobaError::Other(format!("unknown backup mode {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub schema_version: u32,
    pub created_at: String,
    pub mode: BackupMode,
    pub files: Vec<ManifestFile>,
    /// Logical (decompressed) size, regardless of mode or on-disk footprint.
    pub total_uncompressed_size: u64,
    pub original_save_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub relative_path: String,
    pub size: u64,
    #[serde(default)]
    pub mtime: Option<i64>,
    /// Absolute target carried only by schema v1 manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
    /// Payload location inside the backup for v1 entries, whose
    /// `files/<root-label>/` layout differs from the current `files/` root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
}

impl BackupManifest {
    pub fn max_mtime(&self) -> Option<i64> {
        self.files.iter().filter_map(|f| f.mtime).max()
    }
}

/// One file slated for backup, with metadata captured at scan time.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub abs: PathBuf,
    pub rel: PathBuf,
    pub size: u64,
    pub mtime: Option<i64>,
}

/// Enumerate the source tree. Best-effort: unreadable entries are logged and
/// skipped, never fatal.
pub fn enumerate_source(source: &Path) -> Result<Vec<SourceFile>> {
    if !source.exists() {
        return Err(SqobaError::NotFound(format!(
            "save path {}",
            source.display()
        )));
    }

    let mut out = Vec::new();
    for entry in WalkDir::new(source) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry in {:?}: {}", source, e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Skipping unreadable metadata for {:?}: {}", entry.path(), e);
                continue;
            }
        };
        let rel = entry
            .path()
            .strip_prefix(source)
            .unwrap_or(entry.path())
            .to_path_buf();
        out.push(SourceFile {
            abs: entry.path().to_path_buf(),
            rel,
            size: metadata.len(),
            mtime: metadata
                .modified()
                .ok()
                .and_then(crate::backup::epoch_seconds),
        });
    }
    Ok(out)
}

fn build_manifest(
    mode: BackupMode,
    files: &[SourceFile],
    original_save_path: &Path,
) -> BackupManifest {
    let manifest_files: Vec<ManifestFile> = files
        .iter()
        .map(|f| ManifestFile {
            relative_path: rel_path_string(&f.rel),
            size: f.size,
            mtime: f.mtime,
            original_path: None,
            archive_path: None,
        })
        .collect();
    let total = files.iter().map(|f| f.size).sum();
    BackupManifest {
        schema_version: MANIFEST_VERSION,
        created_at: chrono::Utc::now().to_rfc3339(),
        mode,
        files: manifest_files,
        total_uncompressed_size: total,
        original_save_path: original_save_path.to_string_lossy().to_string(),
    }
}

/// Copy the source tree verbatim into a fresh backup directory. Transfer is
/// distributed over a rayon pool; manifest order follows completion, not
/// traversal.
pub fn write_folder_backup(
    source: &Path,
    dest_dir: &Path,
    files: &[SourceFile],
    threads: usize,
    scope: &ProgressScope,
) -> Result<BackupManifest> {
    fs::create_dir_all(dest_dir)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|e| SqobaError::Other(e.to_string()))?;

    let total = files.len();
    let counter = AtomicUsize::new(0);

    let results: Vec<Result<()>> = pool.install(|| {
        files
            .par_iter()
            .map(|file| {
                let target = dest_dir.join(FILES_PREFIX).join(&file.rel);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&file.abs, &target)?;
                let done = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if done == total || done % 50 == 0 {
                    scope.emit(Stage::Copy, file.abs.to_string_lossy(), done, total);
                }
                Ok(())
            })
            .collect()
    });
    for r in results {
        r?;
    }

    let manifest = build_manifest(BackupMode::Folder, files, source);
    write_manifest_file(&dest_dir.join(MANIFEST_NAME), &manifest)?;
    fs::write(dest_dir.join(README_NAME), readme_text())?;
    Ok(manifest)
}

/// Stream all files into a single zip archive. The manifest goes into a
/// sidecar next to the archive and, uncompressed, into the archive itself.
pub fn write_zip_backup(
    source: &Path,
    dest_file: &Path,
    files: &[SourceFile],
    level: u8,
    scope: &ProgressScope,
) -> Result<BackupManifest> {
    if dest_file.exists() && dest_file.is_dir() {
        return Err(SqobaError::Other(
            "archive destination must be a file path".into(),
        ));
    }
    if let Some(parent) = dest_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let out = File::create(dest_file)?;
    let mut archive = ZipWriter::new(BufWriter::new(out));
    let data_options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(map_deflate_level(level)));
    let total = files.len();

    for (index, file) in files.iter().enumerate() {
        let mut reader = File::open(&file.abs)?;
        archive.start_file(zip_entry_name(&file.rel), data_options)?;
        std::io::copy(&mut reader, &mut archive)?;

        let done = index + 1;
        if done == total || done % 50 == 0 {
            scope.emit(Stage::Copy, file.abs.to_string_lossy(), done, total);
        }
    }

    let manifest = build_manifest(BackupMode::Compressed, files, source);
    let json = serde_json::to_vec_pretty(&manifest)?;
    let metadata_options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    archive.start_file(MANIFEST_NAME, metadata_options)?;
    archive.write_all(&json)?;
    archive.start_file(README_NAME, metadata_options)?;
    archive.write_all(readme_text().as_bytes())?;
    archive
        .finish()
        .map_err(|e| SqobaError::Compression(e.to_string()))?;

    write_manifest_file(&sidecar_path(dest_file), &manifest)?;
    Ok(manifest)
}

/// Clear-text manifest path for an archive backup.
pub fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "backup".to_string());
    name.push_str(".manifest.json");
    archive.with_file_name(name)
}

fn write_manifest_file(path: &Path, manifest: &BackupManifest) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest)?;
    fs::write(path, json)?;
    Ok(())
}

/// Read a backup's manifest without touching archive payload. Dispatches
/// strictly by schema version; an unknown version is corrupt, not guessed at.
pub fn read_manifest(backup_path: &Path) -> Result<BackupManifest> {
    if backup_path.is_dir() {
        let manifest_path = backup_path.join(MANIFEST_NAME);
        if !manifest_path.exists() {
            return Err(SqobaError::ManifestCorrupt(format!(
                "no manifest in {}",
                backup_path.display()
            )));
        }
        let text = fs::read_to_string(manifest_path)?;
        return parse_manifest(&text);
    }

    let sidecar = sidecar_path(backup_path);
    if sidecar.exists() {
        let text = fs::read_to_string(sidecar)?;
        return parse_manifest(&text);
    }

    // Older archives carry only the embedded (Stored, uncompressed) copy.
    let file = File::open(backup_path)?;
    let mut archive = ZipArchive::new(file)?;
    read_manifest_from_zip(&mut archive)
}

pub(crate) fn read_manifest_from_zip<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<BackupManifest> {
    let mut entry = archive
        .by_name(MANIFEST_NAME)
        .map_err(|_| SqobaError::ManifestCorrupt("manifest entry missing in archive".into()))?;
    let mut text = String::new();
    entry.read_to_string(&mut text)?;
    parse_manifest(&text)
}

pub fn parse_manifest(text: &str) -> Result<BackupManifest> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| SqobaError::ManifestCorrupt(e.to_string()))?;
    let version = value
        .get("schema_version")
        .or_else(|| value.get("version"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SqobaError::ManifestCorrupt("missing schema_version".into()))?;

    // Foreign manifests reuse version numbers with the legacy entry shape;
    // the entry shape decides, not the version alone.
    match version {
        2 if !has_legacy_entries(&value) => {
            serde_json::from_value(value).map_err(|e| SqobaError::ManifestCorrupt(e.to_string()))
        }
        1 | 2 => parse_manifest_v1(&value),
        other => Err(SqobaError::ManifestCorrupt(format!(
            "unsupported schema_version {}",
            other
        ))),
    }
}

fn has_legacy_entries(value: &serde_json::Value) -> bool {
    value
        .get("files")
        .and_then(|files| files.as_array())
        .and_then(|files| files.first())
        .map(|entry| entry.get("backup_path").is_some())
        .unwrap_or(false)
}

/// Schema v1: `{version, files: [{backup_path, original_path, size, mtime}]}`
/// with absolute targets and a `files/<label>/` prefix on backup paths.
fn parse_manifest_v1(value: &serde_json::Value) -> Result<BackupManifest> {
    #[derive(Deserialize)]
    struct V1Entry {
        backup_path: String,
        original_path: String,
        size: u64,
        #[serde(default)]
        mtime: Option<i64>,
    }
    #[derive(Deserialize)]
    struct V1Manifest {
        files: Vec<V1Entry>,
    }

    let v1: V1Manifest = serde_json::from_value(value.clone())
        .map_err(|e| SqobaError::ManifestCorrupt(e.to_string()))?;

    let files: Vec<ManifestFile> = v1
        .files
        .into_iter()
        .map(|entry| {
            let archive_path = entry
                .backup_path
                .split('/')
                .filter(|p| !p.is_empty())
                .collect::<Vec<&str>>()
                .join("/");
            ManifestFile {
                relative_path: strip_v1_prefix(&entry.backup_path),
                size: entry.size,
                mtime: entry.mtime,
                original_path: Some(entry.original_path),
                archive_path: Some(archive_path),
            }
        })
        .collect();
    let total = files.iter().map(|f| f.size).sum();

    Ok(BackupManifest {
        schema_version: 1,
        created_at: String::new(),
        mode: BackupMode::Folder,
        files,
        total_uncompressed_size: total,
        original_save_path: String::new(),
    })
}

/// Drop the `files/<root-label>/` prefix v1 backup paths carried.
fn strip_v1_prefix(backup_path: &str) -> String {
    let parts: Vec<&str> = backup_path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() >= 3 && parts[0] == FILES_PREFIX {
        parts[2..].join("/")
    } else {
        parts.join("/")
    }
}

pub(crate) fn rel_path_string(rel: &Path) -> String {
    let mut out = rel.to_string_lossy().replace('\\', "/");
    while out.starts_with('/') {
        out.remove(0);
    }
    out
}

pub(crate) fn zip_entry_name(rel: &Path) -> String {
    format!("{}/{}", FILES_PREFIX, rel_path_string(rel))
}

/// Map the user-facing 1-100 level monotonically onto deflate's 1-9.
pub fn map_deflate_level(level: u8) -> i64 {
    let clamped = level.clamp(1, 100) as i64;
    ((clamped - 1) * 8 / 99) + 1
}

fn readme_text() -> String {
    format!(
        "SQOBA backup format\n\
\n\
This backup contains raw save files plus a manifest.\n\
- {}: schema version, file list and original save path\n\
- {}/: backed up files, laid out as in the save directory\n\
\n\
To restore manually:\n\
1) Open {}\n\
2) Copy each {}/<relative_path> entry to <original_save_path>/<relative_path>\n",
        MANIFEST_NAME, FILES_PREFIX, MANIFEST_NAME, FILES_PREFIX
    )
}
