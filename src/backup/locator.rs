//! Save-location discovery.
//!
//! Resolution order: manual override (no scanning), reference-manifest
//! templates, then heuristic probing of well-known roots. Finding nothing is
//! not an error; the caller prompts for a manual path.

use crate::backup::reference::{normalize_name, similarity_score, ReferenceGame, ReferenceManifest};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Placeholder in stored templates for the game's install directory. It is
/// substituted at use time, so moving the game does not invalidate the path.
pub const RELOCATION_TOKEN: &str = "<base>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavePathLookup {
    pub save_path: Option<String>,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SaveRoot {
    pub label: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SaveFile {
    pub path: PathBuf,
    pub root_label: String,
    pub relative_path: PathBuf,
    pub size: u64,
    pub mtime: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SaveDiscovery {
    pub roots: Vec<SaveRoot>,
    pub files: Vec<SaveFile>,
    pub total_size: u64,
}

/// Platform directories the path templates are rooted in. Detected once per
/// call; tests construct this directly against fixture trees.
#[derive(Debug, Clone, Default)]
pub struct PlatformRoots {
    pub home: Option<PathBuf>,
    pub documents: Option<PathBuf>,
    pub app_data: Option<PathBuf>,
    pub local_app_data: Option<PathBuf>,
    pub local_low: Option<PathBuf>,
    pub saved_games: Option<PathBuf>,
    pub steam: Option<PathBuf>,
}

impl PlatformRoots {
    pub fn detect() -> Self {
        let home = dirs::home_dir();
        let local_app_data = dirs::data_local_dir();
        let local_low = local_app_data
            .as_ref()
            .and_then(|local| local.parent().map(|p| p.join("LocalLow")));
        let saved_games = home.as_ref().map(|h| h.join("Saved Games"));
        Self {
            home,
            documents: dirs::document_dir(),
            app_data: dirs::data_dir(),
            local_app_data,
            local_low,
            saved_games,
            steam: find_steam_path(),
        }
    }
}

/// Resolve a game's save directory. Returns the best existing candidate plus
/// the full candidate list so the caller can disambiguate manually.
pub fn resolve(
    game_name: &str,
    manual_override: Option<&str>,
    exe_path: Option<&str>,
    manifest: Option<&ReferenceManifest>,
    roots: &PlatformRoots,
    cancel: &CancellationToken,
) -> SavePathLookup {
    // Steady state after first discovery: trust the stored path, no scanning.
    if let Some(path) = manual_override {
        return SavePathLookup {
            save_path: Some(path.to_string()),
            candidates: vec![path.to_string()],
        };
    }

    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(manifest) = manifest {
        if let Some((_, entry)) = manifest.find_game_entry(game_name) {
            candidates = manifest_candidates(&entry, exe_path, roots);
        }
    }

    // Fall back to probing when the reference gave nothing, or when none of
    // its expanded templates exist on this machine.
    if !candidates.iter().any(|path| path.exists()) && !cancel.is_cancelled() {
        candidates.extend(heuristic_candidates(game_name, roots, cancel));
    }

    let candidates = dedup_paths(candidates);
    let save_path = candidates
        .iter()
        .find(|path| path.exists())
        .map(|path| path.to_string_lossy().to_string());

    SavePathLookup {
        save_path,
        candidates: candidates
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect(),
    }
}

/// Full discovery: resolve candidate roots and enumerate their files.
/// `Ok(None)` means no save data was found anywhere.
pub fn locate_game_saves(
    game_name: &str,
    manual_override: Option<&str>,
    exe_path: Option<&str>,
    manifest: Option<&ReferenceManifest>,
    roots: &PlatformRoots,
    cancel: &CancellationToken,
) -> crate::error::Result<Option<SaveDiscovery>> {
    let lookup = resolve(game_name, manual_override, exe_path, manifest, roots, cancel);

    let existing: Vec<PathBuf> = lookup
        .candidates
        .iter()
        .map(PathBuf::from)
        .filter(|path| path.exists())
        .collect();
    if existing.is_empty() {
        return Ok(None);
    }

    let save_roots = label_roots(existing);
    let discovery = collect_files(&save_roots, cancel);
    if discovery.files.is_empty() {
        return Ok(None);
    }
    Ok(Some(discovery))
}

fn label_roots(paths: Vec<PathBuf>) -> Vec<SaveRoot> {
    paths
        .into_iter()
        .enumerate()
        .map(|(index, path)| SaveRoot {
            label: format!("root-{}", index),
            path,
        })
        .collect()
}

fn dedup_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// Enumerate files under the resolved roots. Unreadable entries are skipped
/// and logged; a partially enumerable tree still yields a discovery.
pub fn collect_files(roots: &[SaveRoot], cancel: &CancellationToken) -> SaveDiscovery {
    let mut files = Vec::new();
    let mut total_size = 0u64;
    let mut seen = HashSet::new();

    for root in roots {
        if cancel.is_cancelled() {
            break;
        }
        if root.path.is_file() {
            let metadata = fs::metadata(&root.path).ok();
            let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);
            let mtime = metadata
                .and_then(|m| m.modified().ok())
                .and_then(crate::backup::epoch_seconds);
            let name = root
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            if seen.insert(root.path.clone()) {
                files.push(SaveFile {
                    path: root.path.clone(),
                    root_label: root.label.clone(),
                    relative_path: PathBuf::from(name),
                    size,
                    mtime,
                });
                total_size += size;
            }
        } else if root.path.is_dir() {
            for entry in WalkDir::new(&root.path) {
                if cancel.is_cancelled() {
                    break;
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!("Skipping unreadable entry under {:?}: {}", root.path, e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root.path)
                    .unwrap_or(entry.path())
                    .to_path_buf();
                let metadata = entry.metadata().ok();
                let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);
                let mtime = metadata
                    .and_then(|m| m.modified().ok())
                    .and_then(crate::backup::epoch_seconds);
                let entry_path = entry.path().to_path_buf();
                if seen.insert(entry_path.clone()) {
                    files.push(SaveFile {
                        path: entry_path,
                        root_label: root.label.clone(),
                        relative_path: relative,
                        size,
                        mtime,
                    });
                    total_size += size;
                }
            }
        }
    }

    SaveDiscovery {
        roots: roots.to_vec(),
        files,
        total_size,
    }
}

// --- Template expansion ---

fn manifest_candidates(
    entry: &ReferenceGame,
    exe_path: Option<&str>,
    roots: &PlatformRoots,
) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(files_map) = &entry.files {
        for templates in files_map.values() {
            for template in templates {
                out.extend(expand_template(template, exe_path, roots));
            }
        }
    }
    out
}

/// Expand one path template: root tokens, relocation token, `%VAR%`, `~`,
/// then glob. A template whose token has no value on this machine expands
/// to nothing.
pub fn expand_template(
    template: &str,
    exe_path: Option<&str>,
    roots: &PlatformRoots,
) -> Vec<PathBuf> {
    let install_dir = exe_path
        .map(Path::new)
        .and_then(|p| p.parent())
        .map(|p| p.to_path_buf());
    let steam_userdata = roots.steam.as_ref().map(|p| p.join("userdata"));

    let mut path = template.to_string();
    let mut missing = false;

    path = replace_token(path, "<home>", &roots.home, &mut missing);
    path = replace_token(path, "<winDocuments>", &roots.documents, &mut missing);
    path = replace_token(path, "<documents>", &roots.documents, &mut missing);
    path = replace_token(path, "<winAppData>", &roots.app_data, &mut missing);
    path = replace_token(path, "<winLocalAppData>", &roots.local_app_data, &mut missing);
    path = replace_token(path, "<winLocalAppDataLow>", &roots.local_low, &mut missing);
    path = replace_token(path, "<winSavedGames>", &roots.saved_games, &mut missing);
    path = replace_token(path, "<steamUserData>", &steam_userdata, &mut missing);
    path = replace_token(path, RELOCATION_TOKEN, &install_dir, &mut missing);

    if missing {
        return Vec::new();
    }

    let path = expand_env_vars(&path);
    let path = expand_tilde(&path, roots.home.as_deref());

    if path.contains('*') || path.contains('?') {
        let mut out = Vec::new();
        if let Ok(paths) = glob(&path) {
            for item in paths.flatten() {
                out.push(item);
            }
        }
        return out;
    }

    vec![PathBuf::from(path)]
}

fn replace_token(
    mut base: String,
    token: &str,
    value: &Option<PathBuf>,
    missing: &mut bool,
) -> String {
    if base.contains(token) {
        if let Some(val) = value {
            base = base.replace(token, &val.to_string_lossy());
        } else {
            *missing = true;
        }
    }
    base
}

fn expand_env_vars(path: &str) -> String {
    let mut out = String::new();
    let mut chars = path.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '%' {
            let mut key = String::new();
            for next in chars.by_ref() {
                if next == '%' {
                    break;
                }
                key.push(next);
            }
            if key.is_empty() {
                out.push('%');
            } else if let Ok(val) = env::var(&key) {
                out.push_str(&val);
            } else {
                out.push('%');
                out.push_str(&key);
                out.push('%');
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn expand_tilde(path: &str, home: Option<&Path>) -> String {
    if let Some(home) = home {
        if let Some(stripped) = path.strip_prefix('~') {
            let mut out = home.to_string_lossy().to_string();
            out.push_str(stripped);
            return out;
        }
    }
    path.to_string()
}

// --- Heuristic probing ---

fn heuristic_candidates(
    game_name: &str,
    roots: &PlatformRoots,
    cancel: &CancellationToken,
) -> Vec<PathBuf> {
    let variants = candidate_names(game_name);
    let mut out = Vec::new();

    let probe_bases: Vec<PathBuf> = [
        roots.documents.as_ref().map(|d| d.join("My Games")),
        roots.documents.as_ref().map(|d| d.join("Saved Games")),
        roots.documents.clone(),
        roots.saved_games.clone(),
        roots.app_data.clone(),
        roots.local_app_data.clone(),
        roots.local_low.clone(),
    ]
    .into_iter()
    .flatten()
    .collect();

    for base in probe_bases {
        if cancel.is_cancelled() {
            return out;
        }
        out.extend(matching_subdirs(&base, &variants));
    }

    if let Some(steam) = &roots.steam {
        if !cancel.is_cancelled() {
            out.extend(steam_userdata_candidates(game_name, steam));
        }
    }

    out
}

/// Name variants tried against directory names: sanitized display name,
/// normalized form, and both with spaces collapsed.
fn candidate_names(game_name: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    push_unique(&mut out, &mut seen, sanitize_name(game_name));
    push_unique(&mut out, &mut seen, sanitize_name(&normalize_name(game_name)));

    let collapsed: Vec<String> = out.iter().map(|s| s.replace(' ', "")).collect();
    for item in collapsed {
        push_unique(&mut out, &mut seen, item);
    }

    out.retain(|name| !name.is_empty());
    out
}

fn sanitize_name(name: &str) -> String {
    let invalid = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let cleaned: String = name.chars().filter(|c| !invalid.contains(c)).collect();
    cleaned.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, value: String) {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        return;
    }
    if seen.insert(trimmed.clone()) {
        out.push(trimmed);
    }
}

/// Subdirectories of `base` whose name loosely matches one of the variants
/// (case-insensitive, punctuation-insensitive).
fn matching_subdirs(base: &Path, variants: &[String]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(base) else {
        return out;
    };

    let normalized_variants: Vec<String> = variants
        .iter()
        .map(|v| normalize_name(v).replace(' ', ""))
        .filter(|v| !v.is_empty())
        .collect();

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().to_string();
        let dir_norm = normalize_name(&dir_name).replace(' ', "");
        if dir_norm.is_empty() {
            continue;
        }
        if normalized_variants.iter().any(|v| *v == dir_norm) {
            out.push(path);
        }
    }
    out
}

// --- Steam per-title userdata ---

fn steam_userdata_candidates(game_name: &str, steam_path: &Path) -> Vec<PathBuf> {
    let app_ids = find_steam_app_ids(game_name, steam_path);
    if app_ids.is_empty() {
        return Vec::new();
    }

    let userdata_root = steam_path.join("userdata");
    let Ok(users) = fs::read_dir(userdata_root) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for user in users.flatten() {
        let user_path = user.path();
        if !user_path.is_dir() {
            continue;
        }
        for app_id in &app_ids {
            let app_root = user_path.join(app_id);
            if !app_root.exists() {
                continue;
            }
            // Cloud saves live under remote/; fall back to the app root.
            let remote = app_root.join("remote");
            if remote.exists() {
                out.push(remote);
            } else {
                out.push(app_root);
            }
        }
    }
    out
}

fn find_steam_app_ids(game_name: &str, steam_path: &Path) -> Vec<String> {
    let target = normalize_name(game_name);
    let steamapps = steam_path.join("steamapps");
    let Ok(entries) = fs::read_dir(&steamapps) else {
        return Vec::new();
    };

    let mut app_ids = Vec::new();
    let mut seen = HashSet::new();

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("acf") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(app_id) = stem.strip_prefix("appmanifest_") else {
            continue;
        };
        let Some(name) = fs::read_to_string(&path)
            .ok()
            .and_then(|text| find_acf_value(&text, "name"))
        else {
            continue;
        };
        if similarity_score(&target, &normalize_name(&name)) >= 0.7
            && seen.insert(app_id.to_string())
        {
            app_ids.push(app_id.to_string());
        }
    }
    app_ids
}

fn find_acf_value(text: &str, key: &str) -> Option<String> {
    for line in text.lines() {
        let parts: Vec<&str> = line.split('"').collect();
        if parts.len() >= 4 && parts[1] == key {
            return Some(parts[3].to_string());
        }
    }
    None
}

fn find_steam_path() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(dir) = env::var("STEAM_DIR") {
        candidates.push(PathBuf::from(dir));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".steam").join("steam"));
        candidates.push(home.join(".local/share/Steam"));
    }
    candidates.push(PathBuf::from("C:\\Program Files (x86)\\Steam"));
    candidates.push(PathBuf::from("C:\\Program Files\\Steam"));

    candidates.into_iter().find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn roots_with_documents(documents: PathBuf) -> PlatformRoots {
        PlatformRoots {
            documents: Some(documents),
            ..PlatformRoots::default()
        }
    }

    #[test]
    fn test_manual_override_short_circuits() {
        let lookup = resolve(
            "Whatever",
            Some("/saves/manual"),
            None,
            None,
            &PlatformRoots::default(),
            &CancellationToken::new(),
        );
        assert_eq!(lookup.save_path.as_deref(), Some("/saves/manual"));
        assert_eq!(lookup.candidates, vec!["/saves/manual".to_string()]);
    }

    #[test]
    fn test_arcadia_resolved_from_my_games_fixture() {
        let dir = tempdir().expect("tempdir");
        let documents = dir.path().join("Documents");
        let save_dir = documents.join("My Games").join("Arcadia");
        fs::create_dir_all(&save_dir).expect("mkdirs");
        fs::write(save_dir.join("save.dat"), b"data").expect("write");

        let roots = roots_with_documents(documents);
        let lookup = resolve("Arcadia", None, None, None, &roots, &CancellationToken::new());

        let expected = save_dir.to_string_lossy().to_string();
        assert_eq!(lookup.save_path.as_deref(), Some(expected.as_str()));
        assert!(lookup.candidates.contains(&expected));
    }

    #[test]
    fn test_loose_directory_match_ignores_punctuation_and_case() {
        let dir = tempdir().expect("tempdir");
        let documents = dir.path().join("Documents");
        let save_dir = documents.join("my-cool-game");
        fs::create_dir_all(&save_dir).expect("mkdirs");

        let roots = roots_with_documents(documents);
        let lookup = resolve(
            "My Cool Game",
            None,
            None,
            None,
            &roots,
            &CancellationToken::new(),
        );
        assert_eq!(
            lookup.save_path.as_deref(),
            Some(save_dir.to_string_lossy().as_ref())
        );
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let dir = tempdir().expect("tempdir");
        let roots = roots_with_documents(dir.path().join("Documents"));
        let lookup = resolve(
            "Nonexistent Game",
            None,
            None,
            None,
            &roots,
            &CancellationToken::new(),
        );
        assert!(lookup.save_path.is_none());
    }

    #[test]
    fn test_relocation_token_expands_to_install_dir() {
        let dir = tempdir().expect("tempdir");
        let install = dir.path().join("SteamLibrary").join("Portable Example");
        let saves = install.join("savegames");
        fs::create_dir_all(&saves).expect("mkdirs");
        fs::write(saves.join("slot0.sav"), b"x").expect("write");
        let exe = install.join("game.exe");

        let mut files = HashMap::new();
        files.insert(
            "save".to_string(),
            vec![format!("{}/savegames", RELOCATION_TOKEN)],
        );
        let mut games = HashMap::new();
        games.insert(
            "Portable Example".to_string(),
            ReferenceGame { files: Some(files) },
        );
        let manifest = ReferenceManifest::from_games(games);

        let lookup = resolve(
            "Portable Example",
            None,
            Some(exe.to_string_lossy().as_ref()),
            Some(&manifest),
            &PlatformRoots::default(),
            &CancellationToken::new(),
        );
        assert_eq!(
            lookup.save_path.as_deref(),
            Some(saves.to_string_lossy().as_ref())
        );
    }

    #[test]
    fn test_template_with_unavailable_root_expands_to_nothing() {
        let expanded = expand_template(
            "<winSavedGames>/Game/saves",
            None,
            &PlatformRoots::default(),
        );
        assert!(expanded.is_empty());
    }

    #[test]
    fn test_collect_files_totals_and_relative_paths() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("saves");
        fs::create_dir_all(root.join("sub")).expect("mkdirs");
        fs::write(root.join("a.sav"), vec![0u8; 100]).expect("write");
        fs::write(root.join("sub").join("b.sav"), vec![0u8; 50]).expect("write");

        let roots = vec![SaveRoot {
            label: "root-0".to_string(),
            path: root.clone(),
        }];
        let discovery = collect_files(&roots, &CancellationToken::new());

        assert_eq!(discovery.files.len(), 2);
        assert_eq!(discovery.total_size, 150);
        assert!(discovery
            .files
            .iter()
            .any(|f| f.relative_path == PathBuf::from("a.sav")));
    }

    #[test]
    fn test_cancelled_walk_stops_early() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("saves");
        fs::create_dir_all(&root).expect("mkdirs");
        fs::write(root.join("a.sav"), b"x").expect("write");

        let token = CancellationToken::new();
        token.cancel();
        let roots = vec![SaveRoot {
            label: "root-0".to_string(),
            path: root,
        }];
        let discovery = collect_files(&roots, &token);
        assert!(discovery.files.is_empty());
    }
}
