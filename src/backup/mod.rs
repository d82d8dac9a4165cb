//! SQOBA, the native save-backup engine.
//!
//! `BackupService` is the operation surface: it owns the database handle,
//! the progress channel and the in-flight registry, and orchestrates the
//! submodules (discovery, archive, decision, retention, restore). All state
//! lives on the service; nothing here is process-global.

pub mod archive;
pub mod decision;
pub mod locator;
pub mod reference;
pub mod restore;
pub mod retention;

use crate::catalog;
use crate::db::Database;
use crate::error::{Result, SqobaError};
use crate::progress::{ProgressReporter, ProgressScope, Stage};
use crate::settings;
use archive::BackupMode;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use decision::RestoreCheck;
use locator::{PlatformRoots, SavePathLookup};
use reference::ReferenceManifest;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) fn epoch_seconds(time: SystemTime) -> Option<i64> {
    time.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

const TIMESTAMP_FORMAT: &str = "%H%M%S_%d%m%Y";
const ARCHIVE_SUFFIX: &str = ".sqoba.zip";

/// One row in the `backups` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub game_id: String,
    pub backup_path: String,
    pub mode: BackupMode,
    /// Logical (uncompressed) size of the backed-up save data.
    pub total_size: u64,
    pub created_at: String,
    pub is_auto: bool,
    pub notes: Option<String>,
}

/// Discovery result handed back to callers of `find_game_saves`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub game_name: String,
    pub save_path: Option<String>,
    pub total_size: u64,
    pub files: Vec<String>,
}

pub struct BackupService {
    db: Database,
    progress: ProgressReporter,
    cache_path: PathBuf,
    reference: Mutex<Option<Arc<ReferenceManifest>>>,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes its game from the in-flight registry when the operation ends,
/// success or failure alike.
struct OpGuard<'a> {
    registry: &'a Mutex<HashSet<String>>,
    game_id: String,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.registry.lock() {
            guard.remove(&self.game_id);
        }
    }
}

impl BackupService {
    pub fn new(db: Database) -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::with_cache_path(db, base.join("ludoteca").join("reference_cache.json"))
    }

    pub fn with_cache_path(db: Database, cache_path: PathBuf) -> Self {
        Self {
            db,
            progress: ProgressReporter::default(),
            cache_path,
            reference: Mutex::new(None),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Reference manifest, loaded lazily from cache or the bundled snapshot.
    fn reference(&self) -> Option<Arc<ReferenceManifest>> {
        let mut guard = match self.reference.lock() {
            Ok(guard) => guard,
            Err(_) => return None,
        };
        if guard.is_none() {
            match reference::load(&self.cache_path) {
                Ok(manifest) => *guard = Some(Arc::new(manifest)),
                Err(e) => tracing::warn!("Reference manifest unavailable: {}", e),
            }
        }
        guard.clone()
    }

    /// Explicit upstream refresh; the only operation that touches the
    /// network. Returns the number of known titles after the refresh.
    pub fn refresh_reference_manifest(&self) -> Result<usize> {
        let manifest =
            reference::refresh_from_network(&self.cache_path).map_err(SqobaError::Other)?;
        let count = manifest.games.len();
        if let Ok(mut guard) = self.reference.lock() {
            *guard = Some(Arc::new(manifest));
        }
        Ok(count)
    }

    fn begin_op(&self, game_id: &str) -> Result<OpGuard<'_>> {
        let mut guard = self
            .in_flight
            .lock()
            .map_err(|_| SqobaError::Other("in-flight registry poisoned".into()))?;
        if !guard.insert(game_id.to_string()) {
            return Err(SqobaError::Busy(game_id.to_string()));
        }
        Ok(OpGuard {
            registry: &self.in_flight,
            game_id: game_id.to_string(),
        })
    }

    // --- Discovery ---

    /// Candidate save paths for a game, without enumerating files. A stored
    /// per-game path short-circuits; a newly discovered path is persisted.
    pub fn find_game_save_paths(
        &self,
        game_name: &str,
        game_id: Option<&str>,
    ) -> Result<SavePathLookup> {
        let manual_override = match game_id {
            Some(id) => catalog::get_save_path(&self.db, id)?,
            None => None,
        };
        let exe_path = game_id
            .and_then(|id| catalog::get_game(&self.db, id).ok())
            .and_then(|game| game.exe_path);

        let reference = self.reference();
        let lookup = locator::resolve(
            game_name,
            manual_override.as_deref(),
            exe_path.as_deref(),
            reference.as_deref(),
            &PlatformRoots::detect(),
            &CancellationToken::new(),
        );

        if manual_override.is_none() {
            if let (Some(id), Some(path)) = (game_id, &lookup.save_path) {
                catalog::set_save_path(&self.db, id, path)?;
            }
        }
        Ok(lookup)
    }

    /// Full discovery: resolved roots plus the files under them.
    /// `Ok(None)` means no save data was found.
    pub fn find_game_saves(
        &self,
        game_name: &str,
        game_id: Option<&str>,
    ) -> Result<Option<BackupInfo>> {
        let manual_override = match game_id {
            Some(id) => catalog::get_save_path(&self.db, id)?,
            None => None,
        };
        let exe_path = game_id
            .and_then(|id| catalog::get_game(&self.db, id).ok())
            .and_then(|game| game.exe_path);

        let reference = self.reference();
        let discovery = locator::locate_game_saves(
            game_name,
            manual_override.as_deref(),
            exe_path.as_deref(),
            reference.as_deref(),
            &PlatformRoots::detect(),
            &CancellationToken::new(),
        )?;

        let Some(discovery) = discovery else {
            return Ok(None);
        };

        let first_root = discovery
            .roots
            .first()
            .map(|root| root.path.to_string_lossy().to_string());
        let mut save_path = manual_override.clone().or_else(|| first_root.clone());

        // Persist only an unambiguous discovery; multiple roots need a
        // manual pick.
        if manual_override.is_none() && discovery.roots.len() == 1 {
            if let (Some(id), Some(candidate)) = (game_id, first_root) {
                catalog::set_save_path(&self.db, id, &candidate)?;
                save_path = Some(candidate);
            }
        }

        Ok(Some(BackupInfo {
            game_name: game_name.to_string(),
            save_path,
            total_size: discovery.total_size,
            files: discovery
                .files
                .iter()
                .map(|f| f.path.to_string_lossy().to_string())
                .collect(),
        }))
    }

    fn resolved_save_path(&self, game_id: &str, game_name: &str) -> Result<Option<String>> {
        if let Some(path) = catalog::get_save_path(&self.db, game_id)? {
            return Ok(Some(path));
        }
        Ok(self
            .find_game_save_paths(game_name, Some(game_id))?
            .save_path)
    }

    fn no_save_data_error(&self, game_name: &str) -> SqobaError {
        let mut message = format!("save data for {}", game_name);
        if let Some(reference) = self.reference() {
            let suggestions = reference.suggest_games(game_name, 3);
            if !suggestions.is_empty() {
                message.push_str(&format!(
                    " (closest known titles: {})",
                    suggestions.join(", ")
                ));
            }
        }
        SqobaError::NotFound(message)
    }

    // --- Backup ---

    pub fn create_backup(
        &self,
        game_id: &str,
        game_name: &str,
        is_auto: bool,
        notes: Option<String>,
    ) -> Result<BackupRecord> {
        let _guard = self.begin_op(game_id)?;
        let scope = self.progress.backup(game_id);
        match self.create_backup_inner(game_id, game_name, is_auto, notes, &scope) {
            Ok(record) => {
                scope.emit(Stage::Done, "Backup completed", 0, 0);
                Ok(record)
            }
            Err(e) => {
                scope.emit(Stage::Error, e.to_string(), 0, 0);
                Err(e)
            }
        }
    }

    fn create_backup_inner(
        &self,
        game_id: &str,
        game_name: &str,
        is_auto: bool,
        notes: Option<String>,
        scope: &ProgressScope,
    ) -> Result<BackupRecord> {
        let save_path = self
            .resolved_save_path(game_id, game_name)?
            .ok_or_else(|| self.no_save_data_error(game_name))?;
        let save_path = PathBuf::from(save_path);

        scope.emit(Stage::Scan, "Scanning save files", 0, 0);
        let files = archive::enumerate_source(&save_path).map_err(|e| match e {
            SqobaError::NotFound(_) => self.no_save_data_error(game_name),
            other => other,
        })?;
        if files.is_empty() {
            return Err(self.no_save_data_error(game_name));
        }

        let compression = settings::get_compression_settings(&self.db)?;
        let use_compression = compression.enabled && !compression.skip_once;
        if compression.skip_once {
            settings::clear_skip_compression_once(&self.db)?;
        }

        let backup_root = settings::get_backup_directory(&self.db)?;
        let game_dir = backup_root.join(game_folder_name(&self.db, game_id, game_name));
        fs::create_dir_all(&game_dir)?;

        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let backup_path = unique_backup_path(&game_dir, &timestamp, use_compression);

        let threads = transfer_threads();
        tracing::info!(
            "Backing up {} ({} files) to {:?}",
            game_name,
            files.len(),
            backup_path
        );

        let manifest = if use_compression {
            archive::write_zip_backup(&save_path, &backup_path, &files, compression.level, scope)
        } else {
            archive::write_folder_backup(&save_path, &backup_path, &files, threads, scope)
        };
        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = retention::remove_payload(&backup_path);
                return Err(e);
            }
        };

        if manifest.total_uncompressed_size == 0 && manifest.files.is_empty() {
            let _ = retention::remove_payload(&backup_path);
            return Err(self.no_save_data_error(game_name));
        }

        // Payload is complete on disk; only now does it become a record.
        let record = BackupRecord {
            id: Uuid::new_v4().to_string(),
            game_id: game_id.to_string(),
            backup_path: backup_path.to_string_lossy().to_string(),
            mode: if use_compression {
                BackupMode::Compressed
            } else {
                BackupMode::Folder
            },
            total_size: manifest.total_uncompressed_size,
            created_at: Utc::now().to_rfc3339(),
            is_auto,
            notes,
        };
        insert_backup_record(&self.db, &record)?;
        catalog::record_backup_created(&self.db, game_id, &record.created_at)?;

        retention::enforce(&self.db, game_id, settings::get_max_backups(&self.db)?)?;
        Ok(record)
    }

    pub fn get_game_backups(&self, game_id: &str) -> Result<Vec<BackupRecord>> {
        let rows: Vec<RawBackupRow> = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, game_id, backup_path, mode, total_size, created_at, is_auto, notes
                 FROM backups WHERE game_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![game_id], raw_backup_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(row_to_record).collect()
    }

    pub fn get_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        use rusqlite::OptionalExtension;
        let raw: Option<RawBackupRow> = self.db.with(|conn| {
            conn.query_row(
                "SELECT id, game_id, backup_path, mode, total_size, created_at, is_auto, notes
                 FROM backups WHERE id = ?1",
                rusqlite::params![backup_id],
                raw_backup_row,
            )
            .optional()
        })?;
        raw.map(row_to_record)
            .transpose()?
            .ok_or_else(|| SqobaError::NotFound(format!("backup {}", backup_id)))
    }

    fn latest_backup(&self, game_id: &str) -> Result<Option<BackupRecord>> {
        use rusqlite::OptionalExtension;
        let raw: Option<RawBackupRow> = self.db.with(|conn| {
            conn.query_row(
                "SELECT id, game_id, backup_path, mode, total_size, created_at, is_auto, notes
                 FROM backups WHERE game_id = ?1 ORDER BY created_at DESC LIMIT 1",
                rusqlite::params![game_id],
                raw_backup_row,
            )
            .optional()
        })?;
        raw.map(row_to_record).transpose()
    }

    // --- Restore ---

    pub fn restore_backup(&self, backup_id: &str) -> Result<()> {
        let record = self.get_backup(backup_id)?;
        let _guard = self.begin_op(&record.game_id)?;
        let scope = self.progress.restore(&record.game_id);
        match self.restore_backup_inner(&record, &scope) {
            Ok(()) => {
                scope.emit(Stage::Done, "Restore completed", 0, 0);
                Ok(())
            }
            Err(e) => {
                scope.emit(Stage::Error, e.to_string(), 0, 0);
                Err(e)
            }
        }
    }

    fn restore_backup_inner(&self, record: &BackupRecord, scope: &ProgressScope) -> Result<()> {
        let backup_path = Path::new(&record.backup_path);
        let save_path = match catalog::get_save_path(&self.db, &record.game_id)? {
            Some(path) => PathBuf::from(path),
            // Legacy payloads restore to the absolute paths in their mapping
            // and never consult the destination.
            None if backup_path.join(restore::LEGACY_MAPPING_NAME).exists() => PathBuf::new(),
            None => {
                let from_manifest = archive::read_manifest(backup_path)
                    .ok()
                    .map(|m| m.original_save_path)
                    .filter(|p| !p.trim().is_empty());
                match from_manifest {
                    Some(path) => PathBuf::from(path),
                    None => {
                        return Err(SqobaError::NotFound(format!(
                            "save path for game {}",
                            record.game_id
                        )))
                    }
                }
            }
        };

        tracing::info!("Restoring {:?} to {:?}", backup_path, save_path);
        restore::restore_payload(backup_path, &save_path, transfer_threads(), scope)
    }

    pub fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let record = self.get_backup(backup_id)?;
        retention::remove_payload(Path::new(&record.backup_path))?;
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM backups WHERE id = ?1",
                rusqlite::params![backup_id],
            )?;
            Ok(())
        })?;
        catalog::record_backup_deleted(&self.db, &record.game_id)
    }

    // --- Decision checks ---

    /// Whether the save tree has moved past the latest backup. No save data
    /// or no resolvable path both mean "no backup needed".
    pub fn check_backup_needed(&self, game_id: &str, game_name: &str) -> Result<bool> {
        let Some(save_path) = self.resolved_save_path(game_id, game_name)? else {
            return Ok(false);
        };
        let fingerprint = decision::fingerprint_tree(Path::new(&save_path));
        if fingerprint.file_count == 0 {
            return Ok(false);
        }

        let Some(latest) = self.latest_backup(game_id)? else {
            return Ok(true);
        };
        match archive::read_manifest(Path::new(&latest.backup_path)) {
            Ok(manifest) => Ok(decision::backup_needed(&fingerprint, Some(&manifest))),
            Err(e) => {
                tracing::warn!("Latest backup manifest unreadable, forcing backup: {}", e);
                Ok(true)
            }
        }
    }

    /// Whether the save tree shrank below the latest backup's logical size.
    pub fn check_restore_needed(&self, game_id: &str, game_name: &str) -> Result<RestoreCheck> {
        let Some(save_path) = self.resolved_save_path(game_id, game_name)? else {
            return Ok(RestoreCheck {
                should_restore: false,
                backup_id: None,
                current_size: 0,
                backup_size: 0,
            });
        };
        let fingerprint = decision::fingerprint_tree(Path::new(&save_path));

        let Some(latest) = self.latest_backup(game_id)? else {
            return Ok(RestoreCheck {
                should_restore: false,
                backup_id: None,
                current_size: fingerprint.total_size,
                backup_size: 0,
            });
        };
        Ok(decision::restore_needed(
            fingerprint.total_size,
            &latest.id,
            latest.total_size,
        ))
    }

    // --- Settings passthrough ---

    pub fn get_backup_settings(&self) -> Result<serde_json::Value> {
        settings::get_backup_settings(&self.db)
    }

    pub fn update_backup_settings(&self, value: &serde_json::Value) -> Result<()> {
        settings::update_backup_settings(&self.db, value)
    }

    pub fn set_backup_directory(&self, path: &str) -> Result<()> {
        settings::set_backup_directory(&self.db, path)
    }

    // --- Import of pre-existing backups ---

    /// Adopt backups already present under the configured backup directory:
    /// any folder or archive with a readable manifest in a matching game
    /// folder becomes a record. Timestamps are recovered from entry names
    /// where possible. Returns the number of records added.
    pub fn import_existing_backups(&self, game_id: &str, game_name: &str) -> Result<usize> {
        let backup_root = settings::get_backup_directory(&self.db)?;
        if !backup_root.exists() {
            return Ok(0);
        }

        let mut imported: Vec<(BackupRecord, DateTime<Utc>, String)> = Vec::new();
        for dir in matching_game_dirs(&backup_root, game_name) {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() && !is_archive_payload(&path) {
                    continue;
                }
                if self.backup_path_registered(&path)? {
                    continue;
                }
                let Ok(manifest) = archive::read_manifest(&path) else {
                    continue;
                };
                let created_at = entry_timestamp(&path);
                let mode = if path.is_dir() {
                    BackupMode::Folder
                } else {
                    BackupMode::Compressed
                };
                imported.push((
                    BackupRecord {
                        id: Uuid::new_v4().to_string(),
                        game_id: game_id.to_string(),
                        backup_path: path.to_string_lossy().to_string(),
                        mode,
                        total_size: manifest.total_uncompressed_size,
                        created_at: created_at.to_rfc3339(),
                        is_auto: false,
                        notes: None,
                    },
                    created_at,
                    manifest.original_save_path,
                ));
            }
        }

        if imported.is_empty() {
            return Ok(0);
        }
        imported.sort_by(|a, b| b.1.cmp(&a.1));

        let newest = imported[0].0.created_at.clone();
        let save_path = imported
            .iter()
            .map(|(_, _, root)| root)
            .find(|root| !root.trim().is_empty())
            .cloned();

        for (record, _, _) in &imported {
            insert_backup_record(&self.db, record)?;
        }
        self.db.with(|conn| {
            conn.execute(
                "UPDATE games SET last_backup = ?1,
                 backup_count = (SELECT COUNT(*) FROM backups WHERE game_id = ?2)
                 WHERE id = ?2",
                rusqlite::params![newest, game_id],
            )?;
            Ok(())
        })?;
        if let Some(path) = save_path {
            if catalog::get_save_path(&self.db, game_id)?.is_none() {
                catalog::set_save_path(&self.db, game_id, &path)?;
            }
        }
        Ok(imported.len())
    }

    fn backup_path_registered(&self, path: &Path) -> Result<bool> {
        let count: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM backups WHERE backup_path = ?1",
                rusqlite::params![path.to_string_lossy()],
                |row| row.get(0),
            )
        })?;
        Ok(count > 0)
    }
}

// --- Async wrappers ---

impl BackupService {
    pub async fn create_backup_async(
        self: &Arc<Self>,
        game_id: &str,
        game_name: &str,
        is_auto: bool,
        notes: Option<String>,
    ) -> Result<BackupRecord> {
        let service = Arc::clone(self);
        let game_id = game_id.to_string();
        let game_name = game_name.to_string();
        tokio::task::spawn_blocking(move || {
            service.create_backup(&game_id, &game_name, is_auto, notes)
        })
        .await
        .map_err(|e| SqobaError::Other(e.to_string()))?
    }

    pub async fn restore_backup_async(self: &Arc<Self>, backup_id: &str) -> Result<()> {
        let service = Arc::clone(self);
        let backup_id = backup_id.to_string();
        tokio::task::spawn_blocking(move || service.restore_backup(&backup_id))
            .await
            .map_err(|e| SqobaError::Other(e.to_string()))?
    }
}

// --- Row plumbing ---

type RawBackupRow = (
    String,
    String,
    String,
    String,
    i64,
    String,
    i64,
    Option<String>,
);

fn raw_backup_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawBackupRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn row_to_record(raw: RawBackupRow) -> Result<BackupRecord> {
    let (id, game_id, backup_path, mode, total_size, created_at, is_auto, notes) = raw;
    Ok(BackupRecord {
        id,
        game_id,
        backup_path,
        mode: BackupMode::parse(&mode)?,
        total_size: total_size.max(0) as u64,
        created_at,
        is_auto: is_auto == 1,
        notes,
    })
}

fn insert_backup_record(db: &Database, record: &BackupRecord) -> Result<()> {
    db.with(|conn| {
        conn.execute(
            "INSERT INTO backups (id, game_id, backup_path, mode, total_size, created_at, is_auto, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.id,
                record.game_id,
                record.backup_path,
                record.mode.as_str(),
                record.total_size as i64,
                record.created_at,
                if record.is_auto { 1 } else { 0 },
                record.notes,
            ],
        )?;
        Ok(())
    })
}

// --- Naming ---

fn sanitize_folder_name(name: &str) -> String {
    let invalid = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let cleaned: String = name.chars().filter(|c| !invalid.contains(c)).collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        "game".to_string()
    } else {
        cleaned
    }
}

/// Per-game folder under the backup root: sanitized name, with the release
/// year appended when the catalog knows it.
fn game_folder_name(db: &Database, game_id: &str, game_name: &str) -> String {
    let safe_name = sanitize_folder_name(game_name);
    match catalog::get_game(db, game_id)
        .ok()
        .and_then(|game| game.release_year)
    {
        Some(year) => format!("{}-{}", safe_name, year),
        None => safe_name,
    }
}

fn unique_backup_path(game_dir: &Path, timestamp: &str, compressed: bool) -> PathBuf {
    let make = |stem: &str| {
        if compressed {
            game_dir.join(format!("{}{}", stem, ARCHIVE_SUFFIX))
        } else {
            game_dir.join(stem)
        }
    };
    let mut candidate = make(timestamp);
    let mut suffix = 1;
    while candidate.exists() {
        candidate = make(&format!("{}-{}", timestamp, suffix));
        suffix += 1;
    }
    candidate
}

fn matching_game_dirs(backup_root: &Path, game_name: &str) -> Vec<PathBuf> {
    let base = sanitize_folder_name(game_name).to_lowercase();
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(backup_root) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name == base || name.starts_with(&format!("{}-", base)) {
            out.push(path);
        }
    }
    out
}

fn is_archive_payload(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

fn entry_timestamp(path: &Path) -> DateTime<Utc> {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
    if let Some(dt) = parse_backup_timestamp(name) {
        return dt;
    }
    if let Some(modified) = fs::metadata(path).ok().and_then(|m| m.modified().ok()) {
        return DateTime::<Utc>::from(modified);
    }
    Utc::now()
}

fn parse_backup_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let trimmed = name
        .strip_suffix(ARCHIVE_SUFFIX)
        .or_else(|| name.strip_suffix(".zip"))
        .unwrap_or(name);
    // Collision suffixes ("-1") are not part of the timestamp.
    let trimmed = trimmed.split('-').next().unwrap_or(trimmed);
    let naive = NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn transfer_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::GameRef;
    use tempfile::{tempdir, TempDir};

    fn service_with_root(dir: &TempDir) -> BackupService {
        let db = Database::open_in_memory().expect("db");
        let backup_root = dir.path().join("backups");
        settings::set_value(
            &db,
            settings::KEY_BACKUP_DIRECTORY,
            backup_root.to_string_lossy().as_ref(),
        )
        .expect("backup dir setting");
        BackupService::with_cache_path(db, dir.path().join("reference_cache.json"))
    }

    fn register_game(service: &BackupService, id: &str, name: &str, save_path: &Path) {
        catalog::upsert_game(
            &service.db,
            &GameRef {
                id: id.to_string(),
                name: name.to_string(),
                exe_path: None,
                save_path: Some(save_path.to_string_lossy().to_string()),
                release_year: None,
            },
        )
        .expect("upsert game");
    }

    fn fixture_saves(dir: &TempDir) -> PathBuf {
        let save_dir = dir.path().join("saves");
        fs::create_dir_all(save_dir.join("sub")).expect("mkdirs");
        fs::write(save_dir.join("slot0.sav"), b"alpha").expect("write");
        fs::write(save_dir.join("sub").join("slot1.sav"), b"beta").expect("write");
        save_dir
    }

    fn disable_compression(service: &BackupService) {
        settings::set_value(&service.db, settings::KEY_COMPRESSION_ENABLED, "false")
            .expect("setting");
    }

    #[test]
    fn test_backup_then_check_reports_no_change() {
        let dir = tempdir().expect("tempdir");
        let service = service_with_root(&dir);
        let save_dir = fixture_saves(&dir);
        register_game(&service, "g1", "Arcadia", &save_dir);
        disable_compression(&service);

        let record = service
            .create_backup("g1", "Arcadia", false, None)
            .expect("backup");
        assert_eq!(record.mode, BackupMode::Folder);
        assert!(Path::new(&record.backup_path).is_dir());
        assert_eq!(record.total_size, 9);

        assert!(!service.check_backup_needed("g1", "Arcadia").expect("check"));

        fs::write(save_dir.join("slot2.sav"), b"gamma").expect("new file");
        assert!(service.check_backup_needed("g1", "Arcadia").expect("check"));
    }

    #[test]
    fn test_skip_compression_once_is_one_shot() {
        let dir = tempdir().expect("tempdir");
        let service = service_with_root(&dir);
        let save_dir = fixture_saves(&dir);
        register_game(&service, "g1", "Arcadia", &save_dir);
        settings::set_value(&service.db, settings::KEY_SKIP_COMPRESSION_ONCE, "true")
            .expect("setting");

        let first = service
            .create_backup("g1", "Arcadia", false, None)
            .expect("first backup");
        assert_eq!(first.mode, BackupMode::Folder);
        assert!(
            !settings::get_compression_settings(&service.db)
                .expect("settings")
                .skip_once
        );

        let second = service
            .create_backup("g1", "Arcadia", false, None)
            .expect("second backup");
        assert_eq!(second.mode, BackupMode::Compressed);
        assert!(second.backup_path.ends_with(ARCHIVE_SUFFIX));
    }

    #[test]
    fn test_retention_caps_backups_oldest_first() {
        let dir = tempdir().expect("tempdir");
        let service = service_with_root(&dir);
        let save_dir = fixture_saves(&dir);
        register_game(&service, "g1", "Arcadia", &save_dir);
        disable_compression(&service);
        settings::set_value(&service.db, settings::KEY_MAX_BACKUPS, "2").expect("setting");

        let first = service
            .create_backup("g1", "Arcadia", false, None)
            .expect("backup 1");
        service
            .create_backup("g1", "Arcadia", false, None)
            .expect("backup 2");
        service
            .create_backup("g1", "Arcadia", false, None)
            .expect("backup 3");

        let remaining = service.get_game_backups("g1").expect("list");
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|b| b.id != first.id));
        assert!(!Path::new(&first.backup_path).exists());
    }

    #[test]
    fn test_concurrent_operation_on_same_game_is_busy() {
        let dir = tempdir().expect("tempdir");
        let service = service_with_root(&dir);
        let save_dir = fixture_saves(&dir);
        register_game(&service, "g1", "Arcadia", &save_dir);

        let _held = service.begin_op("g1").expect("first op");
        let err = service
            .create_backup("g1", "Arcadia", false, None)
            .unwrap_err();
        assert!(matches!(err, SqobaError::Busy(_)));

        // A different game is unaffected.
        assert!(service.begin_op("g2").is_ok());
    }

    #[test]
    fn test_restore_check_flags_emptied_save_dir() {
        let dir = tempdir().expect("tempdir");
        let service = service_with_root(&dir);
        let save_dir = fixture_saves(&dir);
        register_game(&service, "g1", "Arcadia", &save_dir);
        disable_compression(&service);

        let record = service
            .create_backup("g1", "Arcadia", false, None)
            .expect("backup");

        let before = service
            .check_restore_needed("g1", "Arcadia")
            .expect("check");
        assert!(!before.should_restore);

        fs::remove_dir_all(&save_dir).expect("wipe");
        fs::create_dir_all(&save_dir).expect("recreate");

        let check = service
            .check_restore_needed("g1", "Arcadia")
            .expect("check");
        assert!(check.should_restore);
        assert_eq!(check.backup_id.as_deref(), Some(record.id.as_str()));
        assert_eq!(check.backup_size, record.total_size);
    }

    #[test]
    fn test_restore_backup_roundtrip_through_service() {
        let dir = tempdir().expect("tempdir");
        let service = service_with_root(&dir);
        let save_dir = fixture_saves(&dir);
        register_game(&service, "g1", "Arcadia", &save_dir);
        disable_compression(&service);

        let record = service
            .create_backup("g1", "Arcadia", false, None)
            .expect("backup");

        fs::remove_dir_all(&save_dir).expect("wipe");
        service.restore_backup(&record.id).expect("restore");

        assert_eq!(fs::read(save_dir.join("slot0.sav")).expect("read"), b"alpha");
        assert!(!service.check_backup_needed("g1", "Arcadia").expect("check"));
    }

    #[test]
    fn test_import_adopts_existing_backup_tree() {
        let dir = tempdir().expect("tempdir");
        let service = service_with_root(&dir);
        let save_dir = fixture_saves(&dir);
        catalog::upsert_game(
            &service.db,
            &GameRef {
                id: "g1".into(),
                name: "Arcadia".into(),
                exe_path: None,
                save_path: None,
                release_year: None,
            },
        )
        .expect("upsert");

        // A backup written by an earlier installation, not yet in the db.
        let backup_root = settings::get_backup_directory(&service.db).expect("root");
        let dest = backup_root.join("Arcadia").join("120000_01012026");
        let files = archive::enumerate_source(&save_dir).expect("enumerate");
        archive::write_folder_backup(
            &save_dir,
            &dest,
            &files,
            1,
            &service.progress.backup("g1"),
        )
        .expect("seed backup");

        let added = service
            .import_existing_backups("g1", "Arcadia")
            .expect("import");
        assert_eq!(added, 1);

        let backups = service.get_game_backups("g1").expect("list");
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].mode, BackupMode::Folder);
        assert_eq!(backups[0].total_size, 9);
        // Timestamp recovered from the entry name, not from file mtimes.
        assert!(backups[0].created_at.starts_with("2026-01-01"));

        assert_eq!(
            catalog::get_save_path(&service.db, "g1").expect("save path"),
            Some(save_dir.to_string_lossy().to_string())
        );

        // Re-importing the same tree is a no-op.
        let again = service
            .import_existing_backups("g1", "Arcadia")
            .expect("re-import");
        assert_eq!(again, 0);
    }

    #[test]
    fn test_backup_timestamp_parse_roundtrip() {
        let stamp = parse_backup_timestamp("153045_25122025").expect("parse");
        let local = stamp.with_timezone(&Local);
        assert_eq!(local.format(TIMESTAMP_FORMAT).to_string(), "153045_25122025");

        assert!(parse_backup_timestamp("153045_25122025.sqoba.zip").is_some());
        assert!(parse_backup_timestamp("153045_25122025-1").is_some());
        assert!(parse_backup_timestamp("not-a-timestamp").is_none());
    }
}
