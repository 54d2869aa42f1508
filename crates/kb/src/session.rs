//! Per-invocation session wiring.
//!
//! A session is the explicitly constructed object the dispatch path runs
//! against: state, config, registry (built-ins first, then discovered
//! plugins), telemetry recorders, and the shared shutdown hook registry.
//! Nothing here is process-global; tests build a fresh session per case.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use kb_state::{PluginState, QUARANTINE_THRESHOLD, StateStore, state_dir};
use kb_telemetry::{ExecutionRecorder, JsonlRecorder, MemoryRecorder, telemetry_path};
use kb_types::{GlobalFlags, RegisteredCommand, SkippedManifest};

use crate::builtins;
use crate::config::{self, KbConfig};
use crate::discovery::{self, DiscoveryOptions};
use crate::dispatch::{COMMAND_TIMEOUT, LoaderCache, SharedReporter};
use crate::hooks::ShutdownHooks;
use crate::preflight::{self, PreflightEnv, PreflightVerdict};
use crate::registry::Registry;

/// Inputs for building a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub workspace_root: PathBuf,
    pub globals: GlobalFlags,
    /// Host version used for engine checks and reports.
    pub host_version: String,
    pub profile: Option<String>,
    pub no_cache: bool,
    pub command_timeout: Duration,
}

impl SessionOptions {
    pub fn new(workspace_root: PathBuf, globals: GlobalFlags) -> Self {
        Self {
            workspace_root,
            globals,
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            profile: None,
            no_cache: false,
            command_timeout: COMMAND_TIMEOUT,
        }
    }

    /// Resolve environment overrides: `CLI_VERSION` replaces the host
    /// version, `KB_PLUGIN_NO_CACHE=1` is equivalent to `--no-cache`, and
    /// `KB_PROFILE` names the default profile for resolver collaborators.
    pub fn from_env(workspace_root: PathBuf, globals: GlobalFlags) -> Self {
        let mut opts = Self::new(workspace_root, globals);
        if let Ok(version) = std::env::var("CLI_VERSION")
            && !version.is_empty()
        {
            opts.host_version = version;
        }
        if std::env::var("KB_PLUGIN_NO_CACHE").as_deref() == Ok("1") {
            opts.no_cache = true;
        }
        if let Ok(profile) = std::env::var("KB_PROFILE")
            && !profile.is_empty()
        {
            opts.profile = Some(profile);
        }
        opts
    }
}

/// What discovery did for this session, for diagnostics.
#[derive(Debug, Clone)]
pub struct DiscoverySummary {
    pub cache_hit: bool,
    pub fingerprint: String,
    pub candidates: usize,
}

/// One invocation's worth of wired-up host services.
pub struct Session {
    pub workspace_root: PathBuf,
    pub globals: GlobalFlags,
    pub config: KbConfig,
    pub registry: Registry,
    pub state: PluginState,
    pub state_store: StateStore,
    pub skipped: Vec<SkippedManifest>,
    pub host_version: String,
    pub runtime_version: String,
    pub profile: Option<String>,
    pub loader_cache: LoaderCache,
    pub hooks: ShutdownHooks,
    pub reporter: SharedReporter,
    pub recorders: Vec<Arc<dyn ExecutionRecorder>>,
    pub stats: Arc<MemoryRecorder>,
    pub command_timeout: Duration,
    pub discovery: DiscoverySummary,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("workspace_root", &self.workspace_root)
            .field("globals", &self.globals)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("state", &self.state)
            .field("skipped", &self.skipped)
            .field("host_version", &self.host_version)
            .field("runtime_version", &self.runtime_version)
            .field("profile", &self.profile)
            .field("command_timeout", &self.command_timeout)
            .field("discovery", &self.discovery)
            .finish_non_exhaustive()
    }
}

/// Build a session: load state, register built-ins, discover and preflight
/// plugins, and register the survivors.
pub fn build_session(opts: SessionOptions, reporter: SharedReporter) -> Result<Session> {
    let workspace_root = opts.workspace_root.clone();
    let config = config::load_config(&workspace_root)?;

    let mut globals = opts.globals.clone();
    config.apply_to_globals(&mut globals);
    let no_cache = opts.no_cache || globals.no_cache;

    let state_store = StateStore::new(&workspace_root);
    let state = state_store.load()?;

    let mut registry = Registry::new();
    builtins::register_builtins(&mut registry);

    let mut discovery_reporter = reporter.clone();
    let outcome = discovery::discover(
        &workspace_root,
        &state,
        &DiscoveryOptions {
            no_cache,
            extra_roots: config.plugins.extra_roots.clone(),
            ..DiscoveryOptions::default()
        },
        &mut discovery_reporter,
    )?;

    let env = PreflightEnv::from_process(&opts.host_version);
    let mut skipped = outcome.load_failures.clone();

    // Preflight in discovery order, so the registry sees conflicts in a
    // deterministic order.
    for candidate in &outcome.candidates {
        match preflight::preflight(candidate, &env) {
            PreflightVerdict::Valid => {
                let mut rc = RegisteredCommand::new(
                    candidate.manifest.clone(),
                    candidate.source,
                    Some(candidate.pkg_root.clone()),
                );
                apply_availability(&mut rc, &state, config.plugins.default_enabled);
                registry.register_manifest(rc);
            }
            PreflightVerdict::Skipped(skip) => {
                reporter.warn(&format!(
                    "skipping {}: {} ({})",
                    skip.package,
                    skip.reason.code(),
                    skip.detail
                ));
                skipped.push(skip);
            }
        }
    }
    registry.mark_partial(!skipped.is_empty());

    let stats = Arc::new(MemoryRecorder::new());
    let recorders: Vec<Arc<dyn ExecutionRecorder>> = vec![
        stats.clone(),
        Arc::new(JsonlRecorder::new(telemetry_path(&state_dir(
            &workspace_root,
        )))),
    ];

    Ok(Session {
        workspace_root,
        globals,
        config,
        registry,
        state,
        state_store,
        skipped,
        host_version: opts.host_version,
        runtime_version: env.runtime_version.to_string(),
        profile: opts.profile,
        loader_cache: LoaderCache::new(),
        hooks: ShutdownHooks::new(),
        reporter,
        recorders,
        stats,
        command_timeout: opts.command_timeout,
        discovery: DiscoverySummary {
            cache_hit: outcome.cache_hit,
            fingerprint: outcome.fingerprint,
            candidates: outcome.candidates.len(),
        },
    })
}

/// Availability is a state question, not a preflight question: disabled
/// (or quarantined) packages stay discoverable but are never executable,
/// and a manifest without an executable entry can only be listed.
fn apply_availability(rc: &mut RegisteredCommand, state: &PluginState, default_enabled: bool) {
    let package = rc.package_name().to_string();
    if package.is_empty() {
        return;
    }

    if !state.is_enabled(&package, default_enabled) {
        let crashes = state.crash_count(&package);
        if crashes >= QUARANTINE_THRESHOLD {
            rc.mark_unavailable(
                format!("package disabled after {crashes} crashes"),
                Some(format!("run: kb plugins:reset-crashes {package}")),
            );
        } else {
            rc.mark_unavailable(
                "package disabled",
                Some(format!("run: kb plugins:enable {package}")),
            );
        }
    } else if rc.manifest.loader.is_none() {
        rc.mark_unavailable(
            "manifest provides no executable entry",
            Some("add a loader entry to the plugin manifest".to_string()),
        );
    }
}
