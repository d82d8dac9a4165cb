//! ludoteca CLI
//!
//! Drives the SQOBA backup engine against a local library database. Every
//! subcommand maps onto one library operation; progress events are drained
//! from the broadcast channel and printed as they arrive.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ludoteca::backup::BackupService;
use ludoteca::catalog::{self, GameRef};
use ludoteca::db::Database;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ludoteca")]
#[command(about = "Game library save-backup tool")]
#[command(version)]
struct Cli {
    /// Library database path
    #[arg(long, env = "LUDOTECA_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register or update a game in the library
    AddGame {
        /// Stable game id
        id: String,
        /// Display name
        name: String,
        /// Game executable, used for install-relative save paths
        #[arg(long)]
        exe_path: Option<String>,
        /// Manual save directory override
        #[arg(long)]
        save_path: Option<String>,
        /// Release year, appended to the backup folder name
        #[arg(long)]
        year: Option<i32>,
    },

    /// Discover a game's save location and files
    FindSaves {
        game_name: String,
        /// Persist the discovered path on this game
        #[arg(long)]
        game_id: Option<String>,
    },

    /// Create a backup for a game
    Backup {
        game_id: String,
        /// Mark the backup as automatic
        #[arg(long)]
        auto: bool,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Restore a backup onto the save directory
    Restore { backup_id: String },

    /// List a game's backups, newest first
    Backups { game_id: String },

    /// Delete a backup (payload and record)
    Delete { backup_id: String },

    /// Report whether a backup or a restore looks warranted
    Check { game_id: String },

    /// Adopt pre-existing backups found under the backup directory
    Import { game_id: String },

    /// Show or update backup settings
    Settings {
        /// Set the backup root directory
        #[arg(long)]
        set_dir: Option<String>,
        /// Update settings from a JSON object, e.g. '{"max_backups_per_game":"7"}'
        #[arg(long)]
        set: Option<String>,
    },

    /// Refresh the save-location reference from upstream
    RefreshManifest,
}

fn default_db_path() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("ludoteca").join("library.db")
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ludoteca=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let db = Database::open(&db_path).context("opening library database")?;
    let service = Arc::new(BackupService::new(db.clone()));

    match cli.command {
        Commands::AddGame {
            id,
            name,
            exe_path,
            save_path,
            year,
        } => {
            catalog::upsert_game(
                &db,
                &GameRef {
                    id: id.clone(),
                    name: name.clone(),
                    exe_path,
                    save_path,
                    release_year: year,
                },
            )?;
            let imported = service.import_existing_backups(&id, &name)?;
            if imported > 0 {
                println!("Registered {} and adopted {} existing backup(s)", name, imported);
            } else {
                println!("Registered {}", name);
            }
        }

        Commands::FindSaves { game_name, game_id } => {
            match service.find_game_saves(&game_name, game_id.as_deref())? {
                Some(info) => {
                    println!(
                        "Save path: {}",
                        info.save_path.as_deref().unwrap_or("(ambiguous)")
                    );
                    println!("Files: {} ({} bytes)", info.files.len(), info.total_size);
                    for file in info.files.iter().take(20) {
                        println!("  {}", file);
                    }
                    if info.files.len() > 20 {
                        println!("  ... and {} more", info.files.len() - 20);
                    }
                }
                None => println!("No save data found for {}", game_name),
            }
        }

        Commands::Backup {
            game_id,
            auto,
            notes,
        } => {
            let game = catalog::get_game(&db, &game_id)?;
            let printer = spawn_progress_printer(&service);
            let record = service
                .create_backup_async(&game_id, &game.name, auto, notes)
                .await?;
            printer.abort();
            println!(
                "Backup {} created ({}, {} bytes) at {}",
                record.id,
                record.mode.as_str(),
                record.total_size,
                record.backup_path
            );
        }

        Commands::Restore { backup_id } => {
            let printer = spawn_progress_printer(&service);
            service.restore_backup_async(&backup_id).await?;
            printer.abort();
            println!("Backup {} restored", backup_id);
        }

        Commands::Backups { game_id } => {
            let backups = service.get_game_backups(&game_id)?;
            if backups.is_empty() {
                println!("No backups for game {}", game_id);
            }
            for backup in backups {
                println!(
                    "{}  {}  {:>12} bytes  {}  {}",
                    backup.id,
                    backup.created_at,
                    backup.total_size,
                    backup.mode.as_str(),
                    backup.backup_path
                );
            }
        }

        Commands::Delete { backup_id } => {
            service.delete_backup(&backup_id)?;
            println!("Backup {} deleted", backup_id);
        }

        Commands::Check { game_id } => {
            let game = catalog::get_game(&db, &game_id)?;
            let backup_needed = service.check_backup_needed(&game_id, &game.name)?;
            let restore = service.check_restore_needed(&game_id, &game.name)?;
            println!("Backup needed: {}", backup_needed);
            println!(
                "Restore suggested: {} (current {} bytes, backup {} bytes)",
                restore.should_restore, restore.current_size, restore.backup_size
            );
        }

        Commands::Import { game_id } => {
            let game = catalog::get_game(&db, &game_id)?;
            let added = service.import_existing_backups(&game_id, &game.name)?;
            println!("Adopted {} backup(s) for {}", added, game.name);
        }

        Commands::Settings { set_dir, set } => {
            if let Some(dir) = set_dir {
                service.set_backup_directory(&dir)?;
            }
            if let Some(json) = set {
                let value: serde_json::Value =
                    serde_json::from_str(&json).context("parsing settings JSON")?;
                service.update_backup_settings(&value)?;
            }
            let view = service.get_backup_settings()?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }

        Commands::RefreshManifest => {
            // The refresh uses a blocking HTTP client; keep it off the
            // async runtime threads.
            let svc = Arc::clone(&service);
            let count = tokio::task::spawn_blocking(move || svc.refresh_reference_manifest())
                .await
                .context("refresh task panicked")??;
            println!("Reference manifest refreshed: {} known titles", count);
        }
    }

    Ok(())
}

/// Prints progress events until aborted. Backup and restore share the
/// subscriber; events carry their channel name.
fn spawn_progress_printer(service: &Arc<BackupService>) -> tokio::task::JoinHandle<()> {
    let mut rx = service.progress().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if event.total > 0 {
                println!(
                    "[{}] {} {}/{} {}",
                    event.channel,
                    event.stage.as_str(),
                    event.done,
                    event.total,
                    event.message
                );
            } else {
                println!("[{}] {} {}", event.channel, event.stage.as_str(), event.message);
            }
        }
    })
}
