//! Workspace scanning and manifest candidate probing.
//!
//! Discovery enumerates candidate packages (workspace patterns from
//! `pnpm-workspace.yaml`, `node_modules`, linked paths) and probes each for
//! a CLI manifest. Probing fans out across bounded worker threads, but the
//! final candidate sequence is sorted by `(id, package)` so the output
//! never depends on I/O completion order.
//!
//! Manifest descriptor files referenced from `package.json` (and the
//! conventional `manifest.v2.*` paths, which keep the names of the
//! ecosystem they come from) are parsed as JSON documents.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use kb_cache::{CacheEntry, CacheStore, CachedPackage, workspace_fingerprint};
use kb_state::PluginState;
use kb_types::{CommandSource, Manifest, ModuleKind, SkipReason, SkippedManifest};

use crate::dispatch::Reporter;

/// Bound on concurrent package inspections, to avoid filesystem
/// saturation on large monorepos.
pub const MAX_PARALLEL_PROBES: usize = 16;

/// Workspace manifest file consulted for package patterns.
pub const WORKSPACE_MANIFEST: &str = "pnpm-workspace.yaml";

/// Patterns used when no workspace manifest is found.
const DEFAULT_PATTERNS: &[&str] = &["packages/*", "apps/*"];

/// How many parent directories the enumerator may ascend looking for a
/// workspace manifest.
const ASCEND_LIMIT: usize = 3;

/// Conventional manifest paths, in priority order.
const CONVENTIONAL_PATHS: &[&str] = &[
    "dist/manifest.v2.js",
    "dist/manifest.v2.ts",
    "src/manifest.v2.ts",
    "manifest.v2.ts",
    "manifest.v2.js",
];

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub no_cache: bool,
    /// Extra directories whose children are scanned as packages.
    pub extra_roots: Vec<PathBuf>,
    pub max_parallel: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            no_cache: false,
            extra_roots: Vec::new(),
            max_parallel: MAX_PARALLEL_PROBES,
        }
    }
}

/// A package that advertises a manifest, ready for preflight.
#[derive(Debug, Clone)]
pub struct CandidateManifest {
    pub package: String,
    pub pkg_root: PathBuf,
    pub source: CommandSource,
    pub module_kind: ModuleKind,
    pub manifest: Manifest,
}

/// Everything one discovery pass produced.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub candidates: Vec<CandidateManifest>,
    /// Manifest files that existed but could not be loaded.
    pub load_failures: Vec<SkippedManifest>,
    pub fingerprint: String,
    pub cache_hit: bool,
}

#[derive(Debug, Deserialize)]
struct PnpmWorkspace {
    #[serde(default)]
    packages: Vec<String>,
}

#[derive(Debug)]
struct PackageInfo {
    name: String,
    pkg_root: PathBuf,
    source: CommandSource,
    module_kind: ModuleKind,
    pkg_json: Value,
}

#[derive(Debug)]
enum ManifestProbe {
    Found(Manifest),
    LoadError(String),
    None,
}

/// Run discovery for a workspace.
pub fn discover(
    workspace_root: &Path,
    state: &PluginState,
    opts: &DiscoveryOptions,
    reporter: &mut dyn Reporter,
) -> Result<DiscoveryOutcome> {
    let roots = enumerate_package_roots(workspace_root, state, opts, reporter);
    let infos = read_packages(&roots, opts.max_parallel.max(1), reporter);

    // Same package reachable through several sources occupies one slot;
    // a linked checkout overrides both workspace and node_modules copies.
    let mut slots: BTreeMap<String, PackageInfo> = BTreeMap::new();
    for info in infos {
        match slots.get(&info.name) {
            Some(existing) if slot_rank(existing.source) >= slot_rank(info.source) => {}
            _ => {
                slots.insert(info.name.clone(), info);
            }
        }
    }

    let stat_inputs: Vec<(String, PathBuf)> = slots
        .values()
        .map(|info| (info.name.clone(), info.pkg_root.clone()))
        .collect();
    let fingerprint = workspace_fingerprint(&stat_inputs);

    let store = CacheStore::new(workspace_root);
    if !opts.no_cache {
        match store.read() {
            Ok(Some(entry)) if entry.fingerprint == fingerprint => {
                return Ok(DiscoveryOutcome {
                    candidates: hydrate_cache(entry),
                    load_failures: Vec::new(),
                    fingerprint,
                    cache_hit: true,
                });
            }
            Ok(_) => {}
            Err(e) => {
                reporter.warn(&format!("discovery cache unreadable, rescanning: {e:#}"));
            }
        }
    }

    let probed = probe_manifests(slots, opts.max_parallel.max(1));

    let mut candidates = Vec::new();
    let mut load_failures = Vec::new();
    for (info, probe) in probed {
        match probe {
            ManifestProbe::Found(mut manifest) => {
                if manifest.package.is_empty() {
                    manifest.package = info.name.clone();
                }
                candidates.push(CandidateManifest {
                    package: info.name,
                    pkg_root: info.pkg_root,
                    source: info.source,
                    module_kind: info.module_kind,
                    manifest,
                });
            }
            ManifestProbe::LoadError(detail) => {
                load_failures.push(SkippedManifest {
                    id: None,
                    package: info.name,
                    group: None,
                    pkg_root: Some(info.pkg_root),
                    reason: SkipReason::LoadFailed,
                    detail,
                    hint: Some("fix or remove the package's CLI manifest".to_string()),
                });
            }
            ManifestProbe::None => {}
        }
    }

    candidates.sort_by(|a, b| {
        (a.manifest.id.as_str(), a.package.as_str())
            .cmp(&(b.manifest.id.as_str(), b.package.as_str()))
    });
    load_failures.sort_by(|a, b| a.package.cmp(&b.package));

    // Do not grow a `.kb/` directory in a workspace that has nothing to
    // cache and no state yet.
    if !opts.no_cache && (!candidates.is_empty() || workspace_root.join(".kb").exists()) {
        let packages = candidates
            .iter()
            .map(|c| {
                (
                    c.package.clone(),
                    CachedPackage {
                        package: c.package.clone(),
                        pkg_root: c.pkg_root.clone(),
                        source: c.source,
                        module_kind: c.module_kind,
                        manifest: c.manifest.clone(),
                    },
                )
            })
            .collect();
        if let Err(e) = store.write(&CacheEntry::new(fingerprint.clone(), packages)) {
            reporter.warn(&format!("failed to write discovery cache: {e:#}"));
        }
    }

    Ok(DiscoveryOutcome {
        candidates,
        load_failures,
        fingerprint,
        cache_hit: false,
    })
}

fn slot_rank(source: CommandSource) -> u8 {
    match source {
        CommandSource::Linked => 3,
        CommandSource::Workspace => 2,
        CommandSource::NodeModules => 1,
        CommandSource::Builtin => 0,
    }
}

fn hydrate_cache(entry: CacheEntry) -> Vec<CandidateManifest> {
    let mut candidates: Vec<CandidateManifest> = entry
        .packages
        .into_values()
        .map(|cached| CandidateManifest {
            package: cached.package,
            pkg_root: cached.pkg_root,
            source: cached.source,
            module_kind: cached.module_kind,
            manifest: cached.manifest,
        })
        .collect();
    candidates.sort_by(|a, b| {
        (a.manifest.id.as_str(), a.package.as_str())
            .cmp(&(b.manifest.id.as_str(), b.package.as_str()))
    });
    candidates
}

/// Enumerate candidate package roots in a stable order: workspace
/// patterns, extra roots, node_modules, linked paths.
fn enumerate_package_roots(
    workspace_root: &Path,
    state: &PluginState,
    opts: &DiscoveryOptions,
    reporter: &mut dyn Reporter,
) -> Vec<(PathBuf, CommandSource)> {
    let mut roots: Vec<(PathBuf, CommandSource)> = Vec::new();

    let (scan_root, patterns) = workspace_patterns(workspace_root);
    for pattern in &patterns {
        for dir in expand_pattern(&scan_root, pattern) {
            if dir.join("package.json").is_file() {
                roots.push((dir, CommandSource::Workspace));
            }
        }
    }

    for extra in &opts.extra_roots {
        let extra = if extra.is_absolute() {
            extra.clone()
        } else {
            workspace_root.join(extra)
        };
        if extra.join("package.json").is_file() {
            roots.push((extra, CommandSource::Workspace));
        } else {
            for dir in sorted_subdirs(&extra) {
                if dir.join("package.json").is_file() {
                    roots.push((dir, CommandSource::Workspace));
                }
            }
        }
    }

    let node_modules = workspace_root.join("node_modules");
    for dir in sorted_subdirs(&node_modules) {
        let name = dir.file_name().map(|n| n.to_string_lossy().into_owned());
        match name.as_deref() {
            Some(name) if name.starts_with('@') => {
                for scoped in sorted_subdirs(&dir) {
                    if scoped.join("package.json").is_file() {
                        roots.push((scoped, CommandSource::NodeModules));
                    }
                }
            }
            Some(_) => {
                if dir.join("package.json").is_file() {
                    roots.push((dir, CommandSource::NodeModules));
                }
            }
            None => {}
        }
    }

    for linked in &state.linked {
        if linked.join("package.json").is_file() {
            roots.push((linked.clone(), CommandSource::Linked));
        } else {
            reporter.warn(&format!(
                "linked path {} has no package.json; skipping",
                linked.display()
            ));
        }
    }

    roots
}

/// Locate the workspace manifest, ascending up to [`ASCEND_LIMIT`] parents,
/// and return the directory to scan plus its package patterns.
fn workspace_patterns(workspace_root: &Path) -> (PathBuf, Vec<String>) {
    let mut dir = workspace_root.to_path_buf();
    for _ in 0..=ASCEND_LIMIT {
        let manifest = dir.join(WORKSPACE_MANIFEST);
        if manifest.is_file() {
            let patterns = fs::read_to_string(&manifest)
                .ok()
                .and_then(|content| serde_yaml::from_str::<PnpmWorkspace>(&content).ok())
                .map(|ws| ws.packages)
                .filter(|patterns| !patterns.is_empty());
            if let Some(patterns) = patterns {
                return (dir, patterns);
            }
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }

    (
        workspace_root.to_path_buf(),
        DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
    )
}

/// Expand one workspace pattern. Supports literal directories and
/// single-level globs (`dir/*`, `dir/**`); negations are ignored.
/// `node_modules`, `.kb`, and hidden directories are never matched.
fn expand_pattern(scan_root: &Path, pattern: &str) -> Vec<PathBuf> {
    if pattern.starts_with('!') {
        return Vec::new();
    }
    if pattern == "*" || pattern == "**" {
        return sorted_subdirs(scan_root);
    }

    let trimmed = pattern
        .strip_suffix("/**")
        .or_else(|| pattern.strip_suffix("/*"));

    match trimmed {
        Some(base) => sorted_subdirs(&scan_root.join(base)),
        None => {
            let dir = scan_root.join(pattern);
            if dir.is_dir() { vec![dir] } else { Vec::new() }
        }
    }
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut subdirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .map(|n| {
                    let name = n.to_string_lossy();
                    name != "node_modules" && name != ".kb" && !name.starts_with('.')
                })
                .unwrap_or(false)
        })
        .collect();
    subdirs.sort();
    subdirs
}

/// Read `package.json` for every enumerated root, fanning out over bounded
/// worker threads. Results keep enumeration order.
fn read_packages(
    roots: &[(PathBuf, CommandSource)],
    max_parallel: usize,
    reporter: &mut dyn Reporter,
) -> Vec<PackageInfo> {
    let mut infos = Vec::with_capacity(roots.len());

    for chunk in roots.chunks(max_parallel) {
        let results: Vec<Result<PackageInfo, String>> = thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|(root, source)| scope.spawn(move || read_package(root, *source)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("package probe thread panicked"))
                .collect()
        });

        for result in results {
            match result {
                Ok(info) => infos.push(info),
                Err(warning) => reporter.warn(&warning),
            }
        }
    }

    infos
}

fn read_package(pkg_root: &Path, source: CommandSource) -> Result<PackageInfo, String> {
    let manifest_path = pkg_root.join("package.json");
    let content = fs::read_to_string(&manifest_path)
        .map_err(|e| format!("failed to read {}: {e}", manifest_path.display()))?;
    let pkg_json: Value = serde_json::from_str(&content)
        .map_err(|e| format!("unparsable {}: {e}", manifest_path.display()))?;

    let name = pkg_json
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            pkg_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string())
        });

    let module_kind = match pkg_json.get("type").and_then(Value::as_str) {
        Some("module") => ModuleKind::Esm,
        _ => ModuleKind::Cjs,
    };

    Ok(PackageInfo {
        name,
        pkg_root: pkg_root.to_path_buf(),
        source,
        module_kind,
        pkg_json,
    })
}

/// Probe every package slot for a manifest, bounded fan-out, stable order.
fn probe_manifests(
    slots: BTreeMap<String, PackageInfo>,
    max_parallel: usize,
) -> Vec<(PackageInfo, ManifestProbe)> {
    let infos: Vec<PackageInfo> = slots.into_values().collect();
    let mut probed = Vec::with_capacity(infos.len());

    for chunk in infos.chunks(max_parallel) {
        let probes: Vec<ManifestProbe> = thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|info| scope.spawn(move || extract_manifest(info)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("manifest probe thread panicked"))
                .collect()
        });
        probed.extend(probes);
    }

    // chunks() borrowed `infos`; re-pair in order now that probing is done.
    infos.into_iter().zip(probed).collect()
}

/// Apply the manifest strategies in priority order; first hit wins.
fn extract_manifest(info: &PackageInfo) -> ManifestProbe {
    for pointer in ["/kbLabs/manifest", "/kb/manifest"] {
        if let Some(value) = info.pkg_json.pointer(pointer) {
            return load_manifest_ref(&info.pkg_root, value);
        }
    }

    for pointer in ["/kbLabs/plugins", "/kb/plugins"] {
        if let Some(paths) = info.pkg_json.pointer(pointer).and_then(Value::as_array) {
            for path in paths.iter().filter_map(Value::as_str) {
                let full = info.pkg_root.join(path);
                if full.is_file() {
                    return load_manifest_file(&full);
                }
            }
        }
    }

    let plugins_dir = info.pkg_root.join(".kblabs").join("plugins");
    if let Ok(entries) = fs::read_dir(&plugins_dir) {
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "js" || ext == "ts")
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        if let Some(first) = files.first() {
            return load_manifest_file(first);
        }
    }

    for rel in CONVENTIONAL_PATHS {
        let full = info.pkg_root.join(rel);
        if full.is_file() {
            return load_manifest_file(&full);
        }
    }

    ManifestProbe::None
}

fn load_manifest_ref(pkg_root: &Path, value: &Value) -> ManifestProbe {
    match value {
        Value::String(path) => {
            let full = pkg_root.join(path);
            if full.is_file() {
                load_manifest_file(&full)
            } else {
                ManifestProbe::LoadError(format!(
                    "declared manifest {} does not exist",
                    full.display()
                ))
            }
        }
        Value::Object(_) => match serde_json::from_value::<Manifest>(value.clone()) {
            Ok(manifest) => ManifestProbe::Found(manifest),
            Err(e) => ManifestProbe::LoadError(format!("inline manifest is invalid: {e}")),
        },
        other => ManifestProbe::LoadError(format!(
            "manifest field must be a path or an object, got {other}"
        )),
    }
}

fn load_manifest_file(path: &Path) -> ManifestProbe {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            return ManifestProbe::LoadError(format!("failed to read {}: {e}", path.display()));
        }
    };
    match serde_json::from_str::<Manifest>(&content) {
        Ok(manifest) => ManifestProbe::Found(manifest),
        Err(e) => ManifestProbe::LoadError(format!("failed to parse {}: {e}", path.display())),
    }
}
