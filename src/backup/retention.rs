//! Retention pruning: oldest backups beyond the per-game cap are removed,
//! payload and record together. No backup is exempt.

use crate::backup::archive;
use crate::db::Database;
use crate::error::Result;
use rusqlite::params;
use std::fs;
use std::path::Path;

/// Delete a backup's on-disk payload (folder or archive plus its sidecar
/// manifest). Missing payloads are tolerated; the record is stale either way.
pub fn remove_payload(backup_path: &Path) -> Result<()> {
    if !backup_path.exists() {
        return Ok(());
    }
    if backup_path.is_dir() {
        fs::remove_dir_all(backup_path)?;
    } else {
        fs::remove_file(backup_path)?;
        let sidecar = archive::sidecar_path(backup_path);
        if sidecar.exists() {
            fs::remove_file(sidecar)?;
        }
    }
    Ok(())
}

/// Prune a game's backups down to `max_backups`, oldest first. Runs after
/// every successful backup; also safe to call on demand.
pub fn enforce(db: &Database, game_id: &str, max_backups: u32) -> Result<()> {
    let rows: Vec<(String, String)> = db.with(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, backup_path FROM backups WHERE game_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![game_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;

    if rows.len() <= max_backups as usize {
        return Ok(());
    }

    let excess = rows.len() - max_backups as usize;
    for (backup_id, backup_path) in rows.into_iter().take(excess) {
        tracing::info!("Pruning backup {} for game {}", backup_id, game_id);
        if let Err(e) = remove_payload(Path::new(&backup_path)) {
            tracing::warn!("Failed to remove pruned payload {}: {}", backup_path, e);
        }
        db.with(|conn| {
            conn.execute("DELETE FROM backups WHERE id = ?1", params![backup_id])?;
            Ok(())
        })?;
    }

    db.with(|conn| {
        conn.execute(
            "UPDATE games SET backup_count = (SELECT COUNT(*) FROM backups WHERE game_id = ?1) WHERE id = ?1",
            params![game_id],
        )?;
        Ok(())
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn insert_backup(db: &Database, id: &str, game_id: &str, path: &Path, created_at: &str) {
        db.with(|conn| {
            conn.execute(
                "INSERT INTO backups (id, game_id, backup_path, mode, total_size, created_at, is_auto, notes)
                 VALUES (?1, ?2, ?3, 'folder', 100, ?4, 0, NULL)",
                params![id, game_id, path.to_string_lossy(), created_at],
            )?;
            Ok(())
        })
        .expect("insert");
    }

    #[test]
    fn test_prunes_oldest_beyond_cap() {
        let db = Database::open_in_memory().expect("db");
        let dir = tempdir().expect("tempdir");

        for i in 0..4 {
            let payload = dir.path().join(format!("backup-{}", i));
            fs::create_dir_all(&payload).expect("mkdir");
            insert_backup(
                &db,
                &format!("b{}", i),
                "g1",
                &payload,
                &format!("2026-01-0{}T00:00:00Z", i + 1),
            );
        }

        enforce(&db, "g1", 3).expect("enforce");

        let remaining: Vec<String> = db
            .with(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM backups WHERE game_id = 'g1' ORDER BY created_at ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .expect("query");

        assert_eq!(remaining, vec!["b1", "b2", "b3"]);
        assert!(!dir.path().join("backup-0").exists());
        assert!(dir.path().join("backup-1").exists());
    }

    #[test]
    fn test_under_cap_is_untouched() {
        let db = Database::open_in_memory().expect("db");
        let dir = tempdir().expect("tempdir");
        let payload = dir.path().join("backup-0");
        fs::create_dir_all(&payload).expect("mkdir");
        insert_backup(&db, "b0", "g1", &payload, "2026-01-01T00:00:00Z");

        enforce(&db, "g1", 3).expect("enforce");

        let count: i64 = db
            .with(|conn| conn.query_row("SELECT COUNT(*) FROM backups", [], |row| row.get(0)))
            .expect("count");
        assert_eq!(count, 1);
        assert!(payload.exists());
    }
}
