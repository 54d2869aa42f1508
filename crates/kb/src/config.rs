//! Workspace configuration file support (`.kb/config.toml`).
//!
//! The config file sets workspace-level defaults for output and discovery.
//! Merge order is: CLI flags > environment > config file > built-in
//! defaults; this module only supplies the config-file layer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use kb_types::GlobalFlags;

/// Config file name inside the workspace state directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Get the config file path for a workspace root.
pub fn config_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".kb").join(CONFIG_FILE)
}

/// Plugin discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Additional directories whose children are scanned as packages.
    pub extra_roots: Vec<PathBuf>,
    /// Whether discovered packages are enabled unless explicitly disabled.
    pub default_enabled: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            extra_roots: Vec::new(),
            default_enabled: true,
        }
    }
}

/// Output defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub json: bool,
    pub quiet: bool,
}

/// Discovery defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub no_cache: bool,
}

/// Workspace configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KbConfig {
    pub plugins: PluginsConfig,
    pub output: OutputConfig,
    pub discovery: DiscoveryConfig,
}

impl KbConfig {
    /// Apply config-file defaults to flags the user did not provide. Flags
    /// only ever gain a true value here; an explicit CLI flag always wins
    /// because it was already true.
    pub fn apply_to_globals(&self, globals: &mut GlobalFlags) {
        globals.json |= self.output.json;
        globals.quiet |= self.output.quiet;
        globals.no_cache |= self.discovery.no_cache;
    }
}

/// Load the workspace config. A missing file yields defaults; a file that
/// does not parse is surfaced — a broken config is an operator error, not
/// a plugin failure.
pub fn load_config(workspace_root: &Path) -> Result<KbConfig> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(KbConfig::default());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}
