//! Discovery cache for kb plugin manifests.
//!
//! Rescanning a large monorepo on every invocation is the slowest part of
//! dispatch, so discovery output is cached under
//! `.kb/cache/cli-manifests.json`, keyed by a workspace fingerprint. The
//! cache is strictly advisory: a missing, stale, or corrupt cache file is a
//! miss, never an error surfaced to the user.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use kb_types::{CliFailure, CommandSource, ErrorKind, Manifest, ModuleKind};

/// Cache file name inside the workspace cache directory.
pub const CACHE_FILE: &str = "cli-manifests.json";

/// Get the cache directory for a workspace root.
pub fn cache_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".kb").join("cache")
}

/// Get the manifest cache file path for a workspace root.
pub fn cache_path(workspace_root: &Path) -> PathBuf {
    cache_dir(workspace_root).join(CACHE_FILE)
}

/// One cached package: enough to rehydrate a registered command without
/// touching the package's files again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPackage {
    pub package: String,
    pub pkg_root: PathBuf,
    pub source: CommandSource,
    /// Module system the package declares for itself; preflight re-checks
    /// `engine.module` against this after a cache hit.
    pub module_kind: ModuleKind,
    pub manifest: Manifest,
}

/// The cached discovery output for one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Epoch milliseconds of the write.
    pub timestamp: i64,
    /// Fingerprint of the workspace the entry was computed from.
    pub fingerprint: String,
    pub packages: BTreeMap<String, CachedPackage>,
}

impl CacheEntry {
    pub fn new(fingerprint: String, packages: BTreeMap<String, CachedPackage>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            fingerprint,
            packages,
        }
    }
}

/// Store for the manifest discovery cache.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    path: PathBuf,
}

impl CacheStore {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            dir: cache_dir(workspace_root),
            path: cache_path(workspace_root),
        }
    }

    /// Read the cache. Missing file → `Ok(None)`. Unreadable or unparsable
    /// content is a [`ErrorKind::CacheCorrupt`] failure so the caller can
    /// log it before degrading to a miss.
    pub fn read(&self) -> Result<Option<CacheEntry>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path).map_err(|e| {
            anyhow::Error::new(CliFailure::new(
                ErrorKind::CacheCorrupt,
                format!("failed to read cache file {}: {e}", self.path.display()),
            ))
        })?;

        let entry: CacheEntry = serde_json::from_str(&content).map_err(|e| {
            anyhow::Error::new(CliFailure::new(
                ErrorKind::CacheCorrupt,
                format!("cache file {} is corrupt: {e}", self.path.display()),
            ))
        })?;

        Ok(Some(entry))
    }

    /// Write the cache through a temp file + rename so concurrent readers
    /// never observe a partial document.
    pub fn write(&self, entry: &CacheEntry) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))?;

        let tmp_path = self.path.with_extension("tmp");
        let json =
            serde_json::to_string_pretty(entry).context("failed to serialize cache to JSON")?;

        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write cache file {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename cache file to {}", self.path.display()))?;

        Ok(())
    }

    /// Remove manifest- and plugin-related files under the cache directory.
    /// Other tools' cache files are left alone. Returns how many files were
    /// removed.
    pub fn clear(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read cache dir {}", self.dir.display()))?;

        for entry in entries {
            let entry = entry.context("failed to read cache dir entry")?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if name.contains("manifest") || name.contains("plugin") {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove cache file {}", path.display()))?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Compute the workspace fingerprint over `(package name, package.json
/// mtime-ms, size)` tuples. Input order does not matter; the tuples are
/// sorted by package name before hashing, so the fingerprint is stable for
/// a given workspace shape and changes whenever a package manifest is
/// touched, added, or removed.
pub fn workspace_fingerprint(packages: &[(String, PathBuf)]) -> String {
    let mut tuples: Vec<(String, i64, u64)> = packages
        .iter()
        .map(|(name, pkg_root)| {
            let (mtime_ms, size) = manifest_stat(pkg_root);
            (name.clone(), mtime_ms, size)
        })
        .collect();
    tuples.sort();

    let mut hasher = Sha256::new();
    for (name, mtime_ms, size) in &tuples {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(mtime_ms.to_le_bytes());
        hasher.update(size.to_le_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn manifest_stat(pkg_root: &Path) -> (i64, u64) {
    let manifest_path = pkg_root.join("package.json");
    let Ok(meta) = fs::metadata(&manifest_path) else {
        return (0, 0);
    };
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    (mtime_ms, meta.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn sample_entry(fingerprint: &str) -> CacheEntry {
        let manifest = Manifest {
            id: "devlink:plan".to_string(),
            package: "@kb/devlink".to_string(),
            ..Manifest::default()
        };
        let mut packages = BTreeMap::new();
        packages.insert(
            "@kb/devlink".to_string(),
            CachedPackage {
                package: "@kb/devlink".to_string(),
                pkg_root: PathBuf::from("/ws/packages/devlink"),
                source: CommandSource::Workspace,
                module_kind: ModuleKind::Esm,
                manifest,
            },
        );
        CacheEntry::new(fingerprint.to_string(), packages)
    }

    #[test]
    fn read_missing_cache_is_a_miss() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());
        assert!(store.read().expect("read").is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());

        let entry = sample_entry("fp-1");
        store.write(&entry).expect("write");

        let loaded = store.read().expect("read").expect("entry");
        assert_eq!(loaded, entry);
    }

    #[test]
    fn corrupt_cache_is_a_typed_failure() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());
        fs::create_dir_all(cache_dir(td.path())).expect("mkdir");
        fs::write(store.path(), "][").expect("write");

        let err = store.read().expect_err("must fail");
        let failure = err.downcast_ref::<CliFailure>().expect("typed failure");
        assert_eq!(failure.kind, ErrorKind::CacheCorrupt);
    }

    #[test]
    fn clear_removes_only_manifest_and_plugin_files() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());
        let dir = cache_dir(td.path());
        fs::create_dir_all(&dir).expect("mkdir");

        fs::write(dir.join("cli-manifests.json"), "{}").expect("write");
        fs::write(dir.join("plugin-index.json"), "{}").expect("write");
        fs::write(dir.join("profiles.json"), "{}").expect("write");

        let removed = store.clear().expect("clear");
        assert_eq!(removed, 2);
        assert!(!dir.join("cli-manifests.json").exists());
        assert!(!dir.join("plugin-index.json").exists());
        assert!(dir.join("profiles.json").exists());
    }

    #[test]
    fn clear_on_missing_dir_is_a_noop() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());
        assert_eq!(store.clear().expect("clear"), 0);
    }

    #[test]
    fn fingerprint_ignores_input_order() {
        let td = tempdir().expect("tempdir");
        let a = td.path().join("a");
        let b = td.path().join("b");
        fs::create_dir_all(&a).expect("mkdir");
        fs::create_dir_all(&b).expect("mkdir");
        fs::write(a.join("package.json"), r#"{"name": "a"}"#).expect("write");
        fs::write(b.join("package.json"), r#"{"name": "b"}"#).expect("write");

        let forward = workspace_fingerprint(&[
            ("a".to_string(), a.clone()),
            ("b".to_string(), b.clone()),
        ]);
        let reverse = workspace_fingerprint(&[
            ("b".to_string(), b),
            ("a".to_string(), a),
        ]);
        assert_eq!(forward, reverse);
        assert_eq!(forward.len(), 64);
    }

    #[test]
    fn fingerprint_changes_when_a_package_is_added() {
        let td = tempdir().expect("tempdir");
        let a = td.path().join("a");
        fs::create_dir_all(&a).expect("mkdir");
        fs::write(a.join("package.json"), r#"{"name": "a"}"#).expect("write");

        let one = workspace_fingerprint(&[("a".to_string(), a.clone())]);
        let two = workspace_fingerprint(&[
            ("a".to_string(), a),
            ("b".to_string(), td.path().join("b")),
        ]);
        assert_ne!(one, two);
    }

    #[test]
    fn fingerprint_changes_when_manifest_size_changes() {
        let td = tempdir().expect("tempdir");
        let a = td.path().join("a");
        fs::create_dir_all(&a).expect("mkdir");

        fs::write(a.join("package.json"), r#"{"name": "a"}"#).expect("write");
        let before = workspace_fingerprint(&[("a".to_string(), a.clone())]);

        fs::write(a.join("package.json"), r#"{"name": "a", "version": "1.0.0"}"#).expect("write");
        let after = workspace_fingerprint(&[("a".to_string(), a)]);
        assert_ne!(before, after);
    }

    proptest! {
        #[test]
        fn fingerprint_is_deterministic(
            names in prop::collection::vec("[a-z]{1,8}", 0..6),
        ) {
            let packages: Vec<(String, PathBuf)> = names
                .iter()
                .map(|n| (n.clone(), PathBuf::from("/nonexistent").join(n)))
                .collect();
            let first = workspace_fingerprint(&packages);
            let second = workspace_fingerprint(&packages);
            prop_assert_eq!(&first, &second);
            prop_assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
