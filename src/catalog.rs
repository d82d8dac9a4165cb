//! Thin interface to the game catalog rows the backup engine consumes.
//!
//! The catalog itself (add/edit/launch, playtime, metadata) lives outside
//! this crate; the engine only needs `{game_id, name, exe_path}` plus the
//! persisted save path.

use crate::db::Database;
use crate::error::{Result, SqobaError};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRef {
    pub id: String,
    pub name: String,
    pub exe_path: Option<String>,
    pub save_path: Option<String>,
    /// Used to disambiguate per-game backup folder names across re-releases.
    pub release_year: Option<i32>,
}

pub fn get_game(db: &Database, game_id: &str) -> Result<GameRef> {
    db.with(|conn| {
        conn.query_row(
            "SELECT id, name, exe_path, save_path, release_year FROM games WHERE id = ?1",
            params![game_id],
            |row| {
                Ok(GameRef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    exe_path: row.get(2)?,
                    save_path: row.get(3)?,
                    release_year: row.get(4)?,
                })
            },
        )
        .optional()
    })?
    .ok_or_else(|| SqobaError::NotFound(format!("game {}", game_id)))
}

/// Registers or updates a catalog row. Used by the CLI and by tests; the
/// real catalog UI performs the same upsert from its own layer.
pub fn upsert_game(db: &Database, game: &GameRef) -> Result<()> {
    db.with(|conn| {
        conn.execute(
            "INSERT INTO games (id, name, exe_path, save_path, release_year)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = ?2, exe_path = ?3, release_year = ?5",
            params![
                game.id,
                game.name,
                game.exe_path,
                game.save_path,
                game.release_year
            ],
        )?;
        Ok(())
    })
}

/// Stored save path for a game, with blank values treated as unset.
pub fn get_save_path(db: &Database, game_id: &str) -> Result<Option<String>> {
    let value: Option<String> = db.with(|conn| {
        conn.query_row(
            "SELECT save_path FROM games WHERE id = ?1",
            params![game_id],
            |row| row.get(0),
        )
        .optional()
        .map(Option::flatten)
    })?;
    Ok(value.and_then(|path| {
        let trimmed = path.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }))
}

/// Persists a discovered save path so later operations skip re-discovery.
pub fn set_save_path(db: &Database, game_id: &str, save_path: &str) -> Result<()> {
    db.with(|conn| {
        conn.execute(
            "UPDATE games SET save_path = ?1 WHERE id = ?2",
            params![save_path, game_id],
        )?;
        Ok(())
    })
}

pub fn record_backup_created(db: &Database, game_id: &str, created_at: &str) -> Result<()> {
    db.with(|conn| {
        conn.execute(
            "UPDATE games SET last_backup = ?1, backup_count = backup_count + 1 WHERE id = ?2",
            params![created_at, game_id],
        )?;
        Ok(())
    })
}

pub fn record_backup_deleted(db: &Database, game_id: &str) -> Result<()> {
    db.with(|conn| {
        conn.execute(
            "UPDATE games SET backup_count = backup_count - 1 WHERE id = ?1 AND backup_count > 0",
            params![game_id],
        )?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_game_not_found() {
        let db = Database::open_in_memory().expect("db");
        let err = get_game(&db, "missing").unwrap_err();
        assert!(matches!(err, SqobaError::NotFound(_)));
    }

    #[test]
    fn test_save_path_roundtrip_and_blank_is_unset() {
        let db = Database::open_in_memory().expect("db");
        upsert_game(
            &db,
            &GameRef {
                id: "g1".into(),
                name: "Arcadia".into(),
                exe_path: None,
                save_path: None,
                release_year: None,
            },
        )
        .expect("upsert");

        assert_eq!(get_save_path(&db, "g1").expect("get"), None);

        set_save_path(&db, "g1", "/saves/arcadia").expect("set");
        assert_eq!(
            get_save_path(&db, "g1").expect("get"),
            Some("/saves/arcadia".to_string())
        );

        set_save_path(&db, "g1", "   ").expect("set blank");
        assert_eq!(get_save_path(&db, "g1").expect("get"), None);
    }
}
