//! Environment dictionary and its on-disk cache.
//!
//! Discovered toolchain and library facts accumulate in a flat key-value
//! map as prerequisites resolve. The map is persisted to
//! `<build-base>/environ-cache.json` after every successful step so that
//! recursively spawned sub-package builds share discoveries without
//! re-probing. Only the top-level process (sublevel 0) writes the cache;
//! children read it, and every write is atomic (tmp + rename).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current schema version. Bump when the cache format changes.
const CACHE_VERSION: u32 = 1;

/// Cache filename within the build directory.
const CACHE_FILE: &str = "environ-cache.json";

/// Environment variable through which the top-level process shares its
/// cache location with nested invocations (read-only for children).
pub const CACHE_DIR_VAR: &str = "BARYON_CACHE_DIR";

/// A single discovered fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvValue {
    Str(String),
    Path(PathBuf),
    List(Vec<String>),
}

impl EnvValue {
    /// Render the value for template substitution and display.
    pub fn render(&self) -> String {
        match self {
            EnvValue::Str(s) => s.clone(),
            EnvValue::Path(p) => p.display().to_string(),
            EnvValue::List(items) => items.join(" "),
        }
    }
}

/// Flat mapping from fact keys (`CC`, `GSL_INCLUDE_DIR`, ...) to values.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    facts: BTreeMap<String, EnvValue>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: EnvValue) {
        self.facts.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&EnvValue> {
        self.facts.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.facts.get(key) {
            Some(EnvValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_path(&self, key: &str) -> Option<&Path> {
        match self.facts.get(key) {
            Some(EnvValue::Path(p)) => Some(p),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.facts.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EnvValue)> {
        self.facts.iter()
    }

    /// Merge `later` into this environment. Precedence is deterministic:
    /// the most recently resolved facts win, so every key present in
    /// `later` overwrites any earlier value.
    pub fn merge(&mut self, later: Environment) {
        for (key, value) in later.facts {
            self.facts.insert(key, value);
        }
    }
}

/// On-disk cache of the environment plus resolution bookkeeping.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnvCache {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// SHA-256 hash of the host C compiler's `--version` output —
    /// detects toolchain changes between invocations.
    pub toolchain_hash: String,
    /// Accumulated environment facts.
    pub environment: Environment,
    /// Names of resolved prerequisites, de-duplicated, in resolution order.
    pub prerequisites: Vec<String>,
    /// Extra directories to search for locally installed prerequisites.
    pub local_search_paths: Vec<PathBuf>,
}

impl EnvCache {
    /// Create an empty cache for the current toolchain.
    pub fn new(toolchain_hash: String) -> Self {
        Self {
            version: CACHE_VERSION,
            toolchain_hash,
            environment: Environment::new(),
            prerequisites: Vec::new(),
            local_search_paths: Vec::new(),
        }
    }

    /// Load the cache from `<build_base>/environ-cache.json`.
    ///
    /// Returns `None` if the file is missing, corrupt, or has a version
    /// mismatch — callers start fresh in that case.
    pub fn load(build_base: &Path) -> Option<Self> {
        let path = build_base.join(CACHE_FILE);
        let data = fs::read_to_string(&path).ok()?;
        let cache: Self = serde_json::from_str(&data).ok()?;
        if cache.version != CACHE_VERSION {
            return None;
        }
        Some(cache)
    }

    /// Save the cache atomically (write to tmp, then rename).
    pub fn save(&self, build_base: &Path) -> Result<()> {
        fs::create_dir_all(build_base)?;

        let path = build_base.join(CACHE_FILE);
        let tmp_path = build_base.join(format!("{CACHE_FILE}.tmp"));

        let json = serde_json::to_string_pretty(self)
            .context("failed to serialize environment cache")?;
        fs::write(&tmp_path, json)
            .context("failed to write temporary environment cache")?;
        fs::rename(&tmp_path, &path)
            .context("failed to atomically replace environment cache")?;

        Ok(())
    }

    /// Record a resolved prerequisite. Set semantics: repeated names from
    /// diamond dependencies are recorded once, in first-resolution order.
    pub fn record_prerequisite(&mut self, name: &str) {
        if !self.prerequisites.iter().any(|p| p == name) {
            self.prerequisites.push(name.to_string());
        }
    }

    /// Add a local search path, de-duplicated.
    pub fn add_search_path(&mut self, path: PathBuf) {
        if !self.local_search_paths.contains(&path) {
            self.local_search_paths.push(path);
        }
    }
}

/// Compute a SHA-256 hash identifying the host C toolchain.
///
/// Tries `$CC`, then `cc`, `gcc`, `clang`; the hash covers the compiler
/// name and its `--version` output. A host with no C compiler at all
/// hashes a fixed marker so the cache stays usable for pure orchestration.
pub fn toolchain_hash() -> String {
    let mut candidates: Vec<String> = Vec::new();
    if let Ok(cc) = std::env::var("CC") {
        if !cc.is_empty() {
            candidates.push(cc);
        }
    }
    candidates.extend(["cc", "gcc", "clang"].map(String::from));

    for cand in &candidates {
        if let Ok(output) = Command::new(cand).arg("--version").output() {
            if output.status.success() {
                let mut hasher = Sha256::new();
                hasher.update(cand.as_bytes());
                hasher.update(&output.stdout);
                return format!("{:x}", hasher.finalize());
            }
        }
    }
    format!("{:x}", Sha256::digest(b"no-c-toolchain"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_env() -> Environment {
        let mut env = Environment::new();
        env.insert("PACKAGE", EnvValue::Str("demo".into()));
        env.insert("CC", EnvValue::Path("/usr/bin/cc".into()));
        env.insert(
            "GSL_LIBRARIES",
            EnvValue::List(vec!["gsl".into(), "gslcblas".into()]),
        );
        env
    }

    #[test]
    fn merge_later_wins() {
        let mut base = sample_env();
        let mut later = Environment::new();
        later.insert("PACKAGE", EnvValue::Str("other".into()));
        later.insert("NEW", EnvValue::Str("x".into()));
        base.merge(later);
        assert_eq!(base.get_str("PACKAGE"), Some("other"));
        assert_eq!(base.get_str("NEW"), Some("x"));
        assert_eq!(base.get_path("CC"), Some(Path::new("/usr/bin/cc")));
    }

    #[test]
    fn cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EnvCache::new("abc123".into());
        cache.environment = sample_env();
        cache.record_prerequisite("gsl");
        cache.add_search_path(dir.path().join("prereqs"));
        cache.save(dir.path()).unwrap();

        let loaded = EnvCache::load(dir.path()).unwrap();
        assert_eq!(loaded.toolchain_hash, "abc123");
        assert_eq!(loaded.environment, cache.environment);
        assert_eq!(loaded.prerequisites, ["gsl"]);
        assert_eq!(loaded.local_search_paths, cache.local_search_paths);
    }

    #[test]
    fn missing_or_corrupt_cache_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EnvCache::load(dir.path()).is_none());
        std::fs::write(dir.path().join(CACHE_FILE), "{ not json").unwrap();
        assert!(EnvCache::load(dir.path()).is_none());
    }

    #[test]
    fn version_mismatch_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EnvCache::new("abc".into());
        cache.version = CACHE_VERSION + 1;
        let json = serde_json::to_string(&cache).unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), json).unwrap();
        assert!(EnvCache::load(dir.path()).is_none());
    }

    #[test]
    fn prerequisites_deduplicate() {
        let mut cache = EnvCache::new("abc".into());
        cache.record_prerequisite("gsl");
        cache.record_prerequisite("hdf5");
        cache.record_prerequisite("gsl");
        assert_eq!(cache.prerequisites, ["gsl", "hdf5"]);
    }

}
