//! Cheap change detection for backup and restore decisions.
//!
//! Fingerprints are max mtime + file count over a directory listing, never a
//! content hash: the check stays O(listing), not O(data). The restore check
//! compares logical sizes only; it cannot see same-size corruption or an
//! equal-size overwrite, and that limitation is intentional.

use crate::backup::archive::BackupManifest;
use serde::{Deserialize, Serialize};
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeFingerprint {
    pub file_count: usize,
    pub max_mtime: Option<i64>,
    pub total_size: u64,
}

pub fn fingerprint_tree(root: &Path) -> TreeFingerprint {
    let mut fp = TreeFingerprint::default();
    if !root.exists() {
        return fp;
    }

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        fp.file_count += 1;
        fp.total_size += metadata.len();
        if let Some(mtime) = metadata
            .modified()
            .ok()
            .and_then(crate::backup::epoch_seconds)
        {
            fp.max_mtime = Some(fp.max_mtime.map_or(mtime, |m| m.max(mtime)));
        }
    }
    fp
}

/// A new backup is needed when the tree moved past the last manifest: newer
/// max mtime, or a different file count. No prior backup always needs one.
pub fn backup_needed(current: &TreeFingerprint, last_manifest: Option<&BackupManifest>) -> bool {
    let Some(manifest) = last_manifest else {
        return true;
    };

    if current.file_count != manifest.files.len() {
        return true;
    }
    match (current.max_mtime, manifest.max_mtime()) {
        (Some(current_mtime), Some(stored_mtime)) => current_mtime > stored_mtime,
        // Missing mtimes on either side leave us unable to compare; treat an
        // unchanged count as unchanged.
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreCheck {
    pub should_restore: bool,
    pub backup_id: Option<String>,
    pub current_size: u64,
    pub backup_size: u64,
}

/// Restore looks warranted when the tree shrank below the latest backup's
/// recorded logical size (save data regressed, e.g. after a reinstall).
pub fn restore_needed(
    current_size: u64,
    backup_id: &str,
    backup_total_size: u64,
) -> RestoreCheck {
    RestoreCheck {
        should_restore: current_size < backup_total_size,
        backup_id: Some(backup_id.to_string()),
        current_size,
        backup_size: backup_total_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{BackupMode, ManifestFile};
    use std::fs;
    use tempfile::tempdir;

    fn manifest_with(files: Vec<ManifestFile>) -> BackupManifest {
        let total = files.iter().map(|f| f.size).sum();
        BackupManifest {
            schema_version: 2,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            mode: BackupMode::Folder,
            files,
            total_uncompressed_size: total,
            original_save_path: "/saves".to_string(),
        }
    }

    fn entry(rel: &str, size: u64, mtime: i64) -> ManifestFile {
        ManifestFile {
            relative_path: rel.to_string(),
            size,
            mtime: Some(mtime),
            original_path: None,
            archive_path: None,
        }
    }

    #[test]
    fn test_fingerprint_is_idempotent_without_changes() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("a.sav"), b"alpha").expect("write");
        fs::write(dir.path().join("b.sav"), b"beta").expect("write");

        let first = fingerprint_tree(dir.path());
        let second = fingerprint_tree(dir.path());
        assert_eq!(first, second);
        assert_eq!(first.file_count, 2);
        assert_eq!(first.total_size, 9);
    }

    #[test]
    fn test_no_backup_yet_means_needed() {
        let fp = TreeFingerprint {
            file_count: 1,
            max_mtime: Some(100),
            total_size: 10,
        };
        assert!(backup_needed(&fp, None));
    }

    #[test]
    fn test_newer_mtime_triggers_backup() {
        let manifest = manifest_with(vec![entry("a.sav", 10, 1000)]);
        let unchanged = TreeFingerprint {
            file_count: 1,
            max_mtime: Some(1000),
            total_size: 10,
        };
        let touched = TreeFingerprint {
            max_mtime: Some(1001),
            ..unchanged
        };

        assert!(!backup_needed(&unchanged, Some(&manifest)));
        assert!(backup_needed(&touched, Some(&manifest)));
    }

    #[test]
    fn test_file_count_change_triggers_backup() {
        let manifest = manifest_with(vec![entry("a.sav", 10, 1000), entry("b.sav", 5, 900)]);
        let fewer = TreeFingerprint {
            file_count: 1,
            max_mtime: Some(1000),
            total_size: 10,
        };
        assert!(backup_needed(&fewer, Some(&manifest)));
    }

    #[test]
    fn test_restore_needed_when_tree_shrank() {
        let check = restore_needed(0, "backup-1", 24576);
        assert!(check.should_restore);
        assert_eq!(check.backup_id.as_deref(), Some("backup-1"));
        assert_eq!(check.backup_size, 24576);

        let check = restore_needed(24576, "backup-1", 24576);
        assert!(!check.should_restore);
    }
}
