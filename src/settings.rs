//! Backup settings stored as key/value rows.
//!
//! Values are read fresh on every operation and handed to the engine as
//! plain config values; nothing here is cached process-wide.

use crate::db::Database;
use crate::error::Result;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const KEY_BACKUP_DIRECTORY: &str = "backup_directory";
pub const KEY_COMPRESSION_ENABLED: &str = "backup_compression_enabled";
pub const KEY_COMPRESSION_LEVEL: &str = "backup_compression_level";
pub const KEY_SKIP_COMPRESSION_ONCE: &str = "backup_skip_compression_once";
pub const KEY_MAX_BACKUPS: &str = "max_backups_per_game";

const DEFAULT_COMPRESSION_LEVEL: u8 = 60;
const DEFAULT_MAX_BACKUPS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// User-facing level, 1 (fastest) to 100 (best ratio).
    pub level: u8,
    /// One-shot override: forces the next backup to folder mode and is
    /// cleared by that backup call, never by anything else.
    pub skip_once: bool,
}

pub fn get_value(db: &Database, key: &str) -> Result<Option<String>> {
    db.with(|conn| {
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    })
}

pub fn set_value(db: &Database, key: &str, value: &str) -> Result<()> {
    db.with(|conn| {
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    })
}

fn get_bool(db: &Database, key: &str, default: bool) -> Result<bool> {
    Ok(get_value(db, key)?
        .map(|value| value == "true")
        .unwrap_or(default))
}

fn get_u32(db: &Database, key: &str, default: u32) -> Result<u32> {
    Ok(get_value(db, key)?
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default))
}

pub fn get_compression_settings(db: &Database) -> Result<CompressionSettings> {
    Ok(CompressionSettings {
        enabled: get_bool(db, KEY_COMPRESSION_ENABLED, true)?,
        level: get_u32(db, KEY_COMPRESSION_LEVEL, DEFAULT_COMPRESSION_LEVEL as u32)?
            .clamp(1, 100) as u8,
        skip_once: get_bool(db, KEY_SKIP_COMPRESSION_ONCE, false)?,
    })
}

pub fn clear_skip_compression_once(db: &Database) -> Result<()> {
    set_value(db, KEY_SKIP_COMPRESSION_ONCE, "false")
}

pub fn get_max_backups(db: &Database) -> Result<u32> {
    Ok(get_u32(db, KEY_MAX_BACKUPS, DEFAULT_MAX_BACKUPS)?.clamp(1, 100))
}

/// Configured backup root, falling back to the per-user data directory.
pub fn get_backup_directory(db: &Database) -> Result<PathBuf> {
    if let Some(custom) = get_value(db, KEY_BACKUP_DIRECTORY)? {
        if !custom.trim().is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    Ok(base.join("ludoteca").join("backups"))
}

pub fn set_backup_directory(db: &Database, path: &str) -> Result<()> {
    std::fs::create_dir_all(path)?;
    set_value(db, KEY_BACKUP_DIRECTORY, path)
}

/// All backup-related settings as a JSON object, for the settings surface.
pub fn get_backup_settings(db: &Database) -> Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    let rows: Vec<(String, String)> = db.with(|conn| {
        let mut stmt = conn.prepare(
            "SELECT key, value FROM settings WHERE key LIKE 'backup%' OR key = 'max_backups_per_game'",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;
    for (key, value) in rows {
        map.insert(key, serde_json::Value::String(value));
    }
    Ok(serde_json::Value::Object(map))
}

pub fn update_backup_settings(db: &Database, settings: &serde_json::Value) -> Result<()> {
    let obj = settings
        .as_object()
        .ok_or_else(|| crate::error::SqobaError::Other("settings must be an object".into()))?;
    for (key, value) in obj {
        if let Some(text) = value.as_str() {
            set_value(db, key, text)?;
        }
    }
    Ok(())
}
