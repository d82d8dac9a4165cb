//! Community-sourced save-location reference.
//!
//! The store is offline-first: a local JSON cache is preferred, the bundled
//! snapshot rebuilds the cache when it is missing, and the network is only
//! touched on an explicit user-triggered refresh. Reference data changes
//! rarely, so there is no automatic expiry.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

const BUNDLED_SNAPSHOT: &str = include_str!("../../resources/reference_manifest.yaml");

const REFRESH_URLS: [&str; 2] = [
    "https://raw.githubusercontent.com/mtkennerly/ludusavi-manifest/main/data/manifest.yaml",
    "https://raw.githubusercontent.com/mtkennerly/ludusavi-manifest/master/data/manifest.yaml",
];

lazy_static! {
    static ref NORMALIZE_RE: Regex = Regex::new(r"[^a-z0-9]+").expect("regex for normalize_name");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceManifest {
    pub games: HashMap<String, ReferenceGame>,

    // Derived lookup index; never serialized.
    #[serde(skip)]
    index: ReferenceIndex,
}

#[derive(Debug, Clone, Default)]
struct ReferenceIndex {
    normalized_keys: Vec<(String, String)>,
    normalized_exact: HashMap<String, String>,
}

/// One game's candidate save-path templates, grouped by tag ("save",
/// "config", ...). Templates may carry platform-root or relocation tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceGame {
    pub files: Option<HashMap<String, Vec<String>>>,
}

impl ReferenceManifest {
    pub fn from_games(games: HashMap<String, ReferenceGame>) -> Self {
        let mut manifest = Self {
            games,
            index: ReferenceIndex::default(),
        };
        manifest.rebuild_index();
        manifest
    }

    fn rebuild_index(&mut self) {
        self.index.normalized_keys.clear();
        self.index.normalized_exact.clear();
        self.index.normalized_keys.reserve(self.games.len());

        for key in self.games.keys() {
            let normalized = normalize_name(key);
            self.index
                .normalized_exact
                .entry(normalized.clone())
                .or_insert_with(|| key.clone());
            self.index.normalized_keys.push((key.clone(), normalized));
        }
    }

    /// Best entry for a display name: exact key, then normalized key, then
    /// the highest-scoring fuzzy match above threshold.
    pub fn find_game_entry(&self, name: &str) -> Option<(String, ReferenceGame)> {
        if let Some(entry) = self.games.get(name) {
            return Some((name.to_string(), entry.clone()));
        }

        let normalized = normalize_name(name);
        if let Some(key) = self.index.normalized_exact.get(&normalized) {
            return self
                .games
                .get(key)
                .cloned()
                .map(|entry| (key.clone(), entry));
        }

        let mut best: Option<(String, f32)> = None;
        for (key, key_norm) in &self.index.normalized_keys {
            let score = similarity_score(&normalized, key_norm);
            if best.as_ref().map(|b| score > b.1).unwrap_or(true) {
                best = Some((key.clone(), score));
            }
        }

        if let Some((best_key, best_score)) = best {
            if best_score >= 0.6 {
                return self
                    .games
                    .get(&best_key)
                    .cloned()
                    .map(|entry| (best_key, entry));
            }
        }

        None
    }

    pub fn suggest_games(&self, name: &str, limit: usize) -> Vec<String> {
        let normalized = normalize_name(name);
        let mut scored: Vec<(String, f32)> = self
            .index
            .normalized_keys
            .iter()
            .map(|(key, key_norm)| (key.clone(), similarity_score(&normalized, key_norm)))
            .filter(|(_, score)| *score >= 0.4)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(limit).map(|(k, _)| k).collect()
    }
}

/// Loads the reference manifest: cache file first, bundled snapshot as the
/// rebuild source. Never touches the network.
pub fn load(cache_path: &Path) -> Result<ReferenceManifest, String> {
    if let Some(manifest) = load_from_cache(cache_path) {
        return Ok(manifest);
    }

    let manifest = manifest_from_yaml(BUNDLED_SNAPSHOT)?;
    if let Err(e) = write_cache(cache_path, &manifest) {
        tracing::warn!("Failed to write reference cache: {}", e);
    }
    Ok(manifest)
}

fn load_from_cache(cache_path: &Path) -> Option<ReferenceManifest> {
    if !cache_path.exists() {
        return None;
    }
    let file = fs::File::open(cache_path).ok()?;
    let reader = std::io::BufReader::new(file);
    let mut manifest: ReferenceManifest = serde_json::from_reader(reader).ok()?;
    manifest.rebuild_index();
    Some(manifest)
}

fn write_cache(cache_path: &Path, manifest: &ReferenceManifest) -> Result<(), String> {
    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let json = serde_json::to_vec(manifest).map_err(|e| e.to_string())?;
    fs::write(cache_path, json).map_err(|e| e.to_string())?;
    Ok(())
}

/// Explicit refresh from the upstream manifest. This is the only code path
/// that goes online.
pub fn refresh_from_network(cache_path: &Path) -> Result<ReferenceManifest, String> {
    let text =
        download_manifest_yaml()?.ok_or_else(|| "Reference manifest download failed".to_string())?;
    let manifest = manifest_from_yaml(&text)?;
    write_cache(cache_path, &manifest)?;
    Ok(manifest)
}

fn download_manifest_yaml() -> Result<Option<String>, String> {
    let client = match reqwest::blocking::Client::builder()
        .user_agent("ludoteca (SQOBA)")
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(15))
        .build()
    {
        Ok(client) => client,
        Err(_) => return Ok(None),
    };

    for url in REFRESH_URLS {
        let resp = match client.get(url).send() {
            Ok(r) => r,
            Err(_) => continue,
        };
        if !resp.status().is_success() {
            continue;
        }
        let text = match resp.text() {
            Ok(text) => text,
            Err(_) => continue,
        };
        if text.trim().is_empty() {
            continue;
        }
        return Ok(Some(text));
    }

    Ok(None)
}

/// Parses the upstream YAML shape (game -> files -> template -> meta) into
/// our manifest, keeping only templates applicable to this platform.
pub fn manifest_from_yaml(text: &str) -> Result<ReferenceManifest, String> {
    let root: YamlValue = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    let mapping = root
        .as_mapping()
        .ok_or_else(|| "Reference manifest is not a mapping".to_string())?;

    let mut games: HashMap<String, ReferenceGame> = HashMap::new();

    for (game_name, game_val) in mapping {
        let name = match game_name.as_str() {
            Some(n) => n.to_string(),
            None => continue,
        };

        let mut files_map: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(files) = game_val
            .as_mapping()
            .and_then(|m| m.get(YamlValue::from("files")))
            .and_then(|v| v.as_mapping())
        {
            for (path_key, meta_val) in files {
                let path = match path_key.as_str() {
                    Some(p) => p.to_string(),
                    None => continue,
                };
                if !is_path_applicable(meta_val) {
                    continue;
                }
                for tag in extract_tags(meta_val) {
                    files_map.entry(tag).or_default().push(path.clone());
                }
            }
        }

        games.insert(
            name,
            ReferenceGame {
                files: if files_map.is_empty() {
                    None
                } else {
                    Some(files_map)
                },
            },
        );
    }

    Ok(ReferenceManifest::from_games(games))
}

fn extract_tags(meta: &YamlValue) -> Vec<String> {
    if let Some(tags) = meta
        .as_mapping()
        .and_then(|m| m.get(YamlValue::from("tags")))
        .and_then(|v| v.as_sequence())
    {
        let out: Vec<String> = tags
            .iter()
            .filter_map(|t| t.as_str().map(|s| s.to_string()))
            .collect();
        if !out.is_empty() {
            return out;
        }
    }
    vec!["save".to_string()]
}

fn is_path_applicable(meta: &YamlValue) -> bool {
    let when = meta
        .as_mapping()
        .and_then(|m| m.get(YamlValue::from("when")))
        .and_then(|v| v.as_sequence());
    let Some(when) = when else {
        return true;
    };

    for cond in when {
        if let Some(map) = cond.as_mapping() {
            match map.get(YamlValue::from("os")).and_then(|v| v.as_str()) {
                Some(os_val) => {
                    if os_matches(&os_val.to_lowercase()) {
                        return true;
                    }
                }
                None => return true,
            }
        }
    }
    false
}

fn os_matches(os: &str) -> bool {
    match os {
        "windows" | "win" => cfg!(target_os = "windows"),
        "linux" => cfg!(target_os = "linux"),
        "mac" | "macos" => cfg!(target_os = "macos"),
        _ => false,
    }
}

/// Lowercase, strip punctuation, drop marketing stop-words. Used both for
/// manifest keys and for directory-name matching during discovery.
pub fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let cleaned = NORMALIZE_RE.replace_all(&lower, " ");
    let stop_words = [
        "the",
        "a",
        "an",
        "edition",
        "definitive",
        "remastered",
        "goty",
        "game",
        "of",
        "year",
        "ultimate",
        "complete",
        "collection",
        "bundle",
        "deluxe",
        "enhanced",
        "hd",
    ];
    let tokens: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|t| !stop_words.contains(t))
        .collect();
    tokens.join(" ")
}

/// Cheap token-set similarity in [0, 1]; containment scores just below exact.
pub fn similarity_score(a: &str, b: &str) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if a.contains(b) || b.contains(a) {
        return 0.9;
    }
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let inter = set_a.intersection(&set_b).count() as f32;
    let union = set_a.union(&set_b).count() as f32;
    inter / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_prefers_cache_over_bundled_snapshot() {
        let dir = tempdir().expect("tempdir");
        let cache_path = dir.path().join("cache.json");

        let mut games = HashMap::new();
        games.insert("Cached Game".to_string(), ReferenceGame { files: None });
        let manifest = ReferenceManifest::from_games(games);
        let json = serde_json::to_string(&manifest).expect("serialize");
        fs::write(&cache_path, json).expect("write cache");

        let loaded = load(&cache_path).expect("load");
        assert!(loaded.games.contains_key("Cached Game"));
        // Bundled entries must not be merged over a valid cache.
        assert!(!loaded.games.contains_key("Stardew Valley"));
    }

    #[test]
    fn test_load_rebuilds_cache_from_bundled_snapshot() {
        let dir = tempdir().expect("tempdir");
        let cache_path = dir.path().join("cache.json");

        let loaded = load(&cache_path).expect("load");
        assert!(loaded.games.contains_key("Stardew Valley"));
        assert!(cache_path.exists());
    }

    #[test]
    fn test_yaml_parse_filters_by_platform() {
        let yaml = r#"
Example Game:
  files:
    "<winLocalAppData>/Example/save.dat":
      tags: ["save"]
    "/somewhere/never/applicable":
      tags: ["save"]
      when:
        - os: beos
"#;
        let manifest = manifest_from_yaml(yaml).expect("parse");
        let entry = manifest.games.get("Example Game").expect("entry");
        let saves = entry
            .files
            .as_ref()
            .and_then(|f| f.get("save"))
            .expect("save tag");
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0], "<winLocalAppData>/Example/save.dat");
    }

    #[test]
    fn test_find_game_entry_matches_normalized_name() {
        let mut games = HashMap::new();
        games.insert(
            "The Witcher 3: Game of the Year Edition".to_string(),
            ReferenceGame { files: None },
        );
        let manifest = ReferenceManifest::from_games(games);

        let found = manifest.find_game_entry("witcher 3").expect("find game");
        assert_eq!(found.0, "The Witcher 3: Game of the Year Edition");
    }

    #[test]
    fn test_suggestions_ranked_by_similarity() {
        let mut games = HashMap::new();
        games.insert("Dark Souls III".to_string(), ReferenceGame { files: None });
        games.insert("Dark Souls II".to_string(), ReferenceGame { files: None });
        games.insert("Factorio".to_string(), ReferenceGame { files: None });
        let manifest = ReferenceManifest::from_games(games);

        let suggestions = manifest.suggest_games("dark souls iii", 5);
        assert_eq!(suggestions.first().map(String::as_str), Some("Dark Souls III"));
        assert!(!suggestions.contains(&"Factorio".to_string()));
    }

    #[test]
    fn test_normalize_strips_punctuation_and_stop_words() {
        assert_eq!(
            normalize_name("The Witcher 3: Game of the Year Edition"),
            "witcher 3"
        );
        assert_eq!(normalize_name("S.T.A.L.K.E.R."), "s t l k e r");
    }
}
