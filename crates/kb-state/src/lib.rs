//! State persistence for kb plugin management.
//!
//! This crate owns the `.kb/plugins.json` document: which packages are
//! enabled, disabled, or linked, which capabilities each package has been
//! granted, integrity hashes, and crash counters driving auto-quarantine.
//!
//! # Example
//!
//! ```
//! use kb_state::{PluginState, StateStore};
//! use tempfile::tempdir;
//!
//! let workspace = tempdir().expect("tempdir");
//! let store = StateStore::new(workspace.path());
//!
//! let mut state = store.load().expect("load");
//! state.enable("@kb/devlink");
//! store.save(&mut state).expect("save");
//!
//! let loaded = store.load().expect("reload");
//! assert!(loaded.is_enabled("@kb/devlink", false));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use kb_types::{CliFailure, ErrorKind};

/// Directory under the workspace root that holds all host-owned artifacts.
pub const STATE_DIR: &str = ".kb";

/// State file name inside [`STATE_DIR`].
pub const STATE_FILE: &str = "plugins.json";

/// Crash count at which a package is automatically disabled.
pub const QUARANTINE_THRESHOLD: u32 = 3;

/// Get the state directory for a workspace root.
pub fn state_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join(STATE_DIR)
}

/// Get the state file path for a workspace root.
pub fn state_path(workspace_root: &Path) -> PathBuf {
    state_dir(workspace_root).join(STATE_FILE)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Per-workspace plugin state.
///
/// `enabled` and `disabled` are kept mutually exclusive by the mutators;
/// when a stored document mentions a package in both, `disabled` wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginState {
    pub enabled: BTreeSet<String>,
    pub disabled: BTreeSet<String>,
    pub linked: BTreeSet<PathBuf>,
    pub permissions: BTreeMap<String, BTreeSet<String>>,
    pub integrity: BTreeMap<String, String>,
    pub crashes: BTreeMap<String, u32>,
    /// Epoch milliseconds of the last save.
    pub last_updated: i64,
}

impl PluginState {
    /// Whether a package is enabled. `disabled` always wins; an explicit
    /// `enabled` entry wins over the default.
    pub fn is_enabled(&self, package: &str, default_enabled: bool) -> bool {
        if self.disabled.contains(package) {
            return false;
        }
        if self.enabled.contains(package) {
            return true;
        }
        default_enabled
    }

    /// Enable a package, removing any disablement.
    pub fn enable(&mut self, package: &str) {
        self.disabled.remove(package);
        self.enabled.insert(package.to_string());
    }

    /// Disable a package, removing any explicit enablement.
    pub fn disable(&mut self, package: &str) {
        self.enabled.remove(package);
        self.disabled.insert(package.to_string());
    }

    /// Register a linked plugin path. Paths are stored as given; callers
    /// canonicalize before linking.
    pub fn link(&mut self, path: &Path) {
        self.linked.insert(path.to_path_buf());
    }

    /// Remove a linked plugin path. Returns true when something was
    /// removed.
    pub fn unlink(&mut self, path: &Path) -> bool {
        self.linked.remove(path)
    }

    /// Union capabilities into the package's granted set.
    pub fn grant_permissions<I, S>(&mut self, package: &str, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let granted = self.permissions.entry(package.to_string()).or_default();
        for capability in capabilities {
            granted.insert(capability.into());
        }
    }

    /// Capabilities explicitly granted to a package (defaults excluded).
    pub fn granted_permissions(&self, package: &str) -> BTreeSet<String> {
        self.permissions.get(package).cloned().unwrap_or_default()
    }

    /// Record one crash for a package and return the new count. Reaching
    /// [`QUARANTINE_THRESHOLD`] moves the package into `disabled`.
    pub fn record_crash(&mut self, package: &str) -> u32 {
        let count = self.crashes.entry(package.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        if count >= QUARANTINE_THRESHOLD {
            self.disable(package);
        }
        count
    }

    /// Current crash count for a package.
    pub fn crash_count(&self, package: &str) -> u32 {
        self.crashes.get(package).copied().unwrap_or(0)
    }

    /// Manual quarantine reset: clear the crash counter and lift the
    /// disablement it caused.
    pub fn reset_crashes(&mut self, package: &str) {
        self.crashes.remove(package);
        self.disabled.remove(package);
    }

    /// True when the package has crossed the quarantine threshold.
    pub fn is_quarantined(&self, package: &str) -> bool {
        self.crash_count(package) >= QUARANTINE_THRESHOLD && self.disabled.contains(package)
    }
}

/// Persistent store for [`PluginState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store for the given workspace root.
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            path: state_path(workspace_root),
        }
    }

    /// Load state from disk. A missing file yields defaults; a file that
    /// exists but does not parse is a [`ErrorKind::StateCorrupt`] failure —
    /// the only recovery is an explicit reset by the caller.
    pub fn load(&self) -> Result<PluginState> {
        if !self.path.exists() {
            return Ok(PluginState::default());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state file {}", self.path.display()))?;

        let mut state: PluginState = serde_json::from_str(&content).map_err(|e| {
            anyhow::Error::new(CliFailure::new(
                ErrorKind::StateCorrupt,
                format!("state file {} is corrupt: {e}", self.path.display()),
            ))
        })?;

        // Stored documents may predate the exclusivity rule; disabled wins.
        let both: Vec<String> = state
            .enabled
            .intersection(&state.disabled)
            .cloned()
            .collect();
        for package in both {
            state.enabled.remove(&package);
        }

        Ok(state)
    }

    /// Save state to disk, stamping `last_updated`. The write goes through
    /// a temp file and rename so concurrent readers never observe a partial
    /// document.
    pub fn save(&self, state: &mut PluginState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }

        state.last_updated = now_ms();

        let tmp_path = self.path.with_extension("tmp");
        let json =
            serde_json::to_string_pretty(state).context("failed to serialize state to JSON")?;

        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write state file {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename state file to {}", self.path.display()))?;

        Ok(())
    }

    /// Check if a state file exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Delete the state file (explicit reset).
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to delete state file {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Integrity hash of a package: sha256 over its `package.json` bytes,
/// base64, prefixed `sha256-`. Returns an empty string when the file
/// cannot be read — an unreadable package is not an error at this layer.
pub fn compute_integrity(pkg_root: &Path) -> String {
    let manifest_path = pkg_root.join("package.json");
    match fs::read(&manifest_path) {
        Ok(bytes) => {
            let digest = Sha256::digest(&bytes);
            format!("sha256-{}", BASE64.encode(digest))
        }
        Err(_) => String::new(),
    }
}
