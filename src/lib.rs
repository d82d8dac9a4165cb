//! ludoteca - personal game-library manager with a native save-backup
//! engine (SQOBA).
//!
//! The engine is exposed as a library; the bundled CLI binary drives the
//! same operation surface. Backup payloads are self-describing (manifest in
//! the clear), so they stay restorable without this program.

pub mod backup;
pub mod catalog;
pub mod db;
pub mod error;
pub mod progress;
pub mod settings;

pub use backup::{BackupInfo, BackupRecord, BackupService};
pub use db::Database;
pub use error::{Result, SqobaError};
