//! The built-in command bundle.
//!
//! Registered unconditionally before discovery runs, so the CLI stays
//! usable when a workspace has no plugins or discovery fails. Built-ins
//! satisfy the same handler contract as plugins; the `plugins:*` group
//! mutates plugin state and caches through the same stores the session
//! uses.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use kb_cache::CacheStore;
use kb_state::{StateStore, compute_integrity};
use kb_types::{
    FlagSpec, FlagType, HandlerOutcome, KNOWN_CAPABILITIES, Manifest, is_known_capability,
};

use crate::dispatch::{CommandContext, CommandHandler};
use crate::registry::{Command, CommandGroup, Registry};

/// Greeting printed by `kb hello`.
pub const HELLO_MESSAGE: &str = "Hello, KB Labs!";

type HandlerFn = fn(&mut CommandContext, &[String], &mut BTreeMap<String, Value>) -> Result<HandlerOutcome>;

struct FnHandler(HandlerFn);

impl CommandHandler for FnHandler {
    fn run(
        &self,
        ctx: &mut CommandContext,
        argv: &[String],
        flags: &mut BTreeMap<String, Value>,
    ) -> Result<HandlerOutcome> {
        (self.0)(ctx, argv, flags)
    }
}

fn manifest(id: &str, describe: &str) -> Manifest {
    Manifest {
        id: id.to_string(),
        describe: Some(describe.to_string()),
        ..Manifest::default()
    }
}

fn builtin(m: Manifest, f: HandlerFn) -> Command {
    Command::builtin(m, Arc::new(FnHandler(f)))
}

/// Register the full built-in bundle.
pub fn register_builtins(registry: &mut Registry) {
    registry.register(builtin(manifest("hello", "Print a hello message"), hello));
    registry.register(builtin(
        manifest("version", "Print the host version"),
        version,
    ));

    let mut diagnose_manifest = manifest("diagnose", "Inspect workspace and plugin health");
    diagnose_manifest.aliases = vec!["health".to_string(), "diag".to_string()];
    registry.register(builtin(diagnose_manifest, diagnose));

    let mut group = CommandGroup::with_describe("plugins", "Manage workspace plugins");
    let mut add = |m: Manifest, f: HandlerFn| {
        let cmd = builtin(m, f);
        group.commands.insert(cmd.name().to_string(), cmd);
    };

    add(
        manifest("plugins:list", "List discovered plugins and their status"),
        plugins_list,
    );
    add(
        manifest("plugins:enable", "Enable a plugin package"),
        plugins_enable,
    );
    add(
        manifest("plugins:disable", "Disable a plugin package"),
        plugins_disable,
    );
    add(
        manifest("plugins:link", "Link a local plugin checkout"),
        plugins_link,
    );
    add(
        manifest("plugins:unlink", "Remove a linked plugin checkout"),
        plugins_unlink,
    );
    add(
        manifest("plugins:grant", "Grant capabilities to a plugin package"),
        plugins_grant,
    );
    add(
        manifest(
            "plugins:reset-crashes",
            "Clear a package's crash counter and lift quarantine",
        ),
        plugins_reset_crashes,
    );

    let mut cache_clear = manifest("plugins:cache-clear", "Clear the manifest discovery cache");
    cache_clear.flags = vec![FlagSpec {
        name: "deep".to_string(),
        flag_type: FlagType::Boolean,
        describe: Some("Also drop resolved handler loaders".to_string()),
        ..FlagSpec::default()
    }];
    add(cache_clear, plugins_cache_clear);

    registry.register_group(group);
}

fn hello(
    _ctx: &mut CommandContext,
    _argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    Ok(HandlerOutcome::with_data(json!({"message": HELLO_MESSAGE})).line(HELLO_MESSAGE))
}

fn version(
    ctx: &mut CommandContext,
    _argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    Ok(
        HandlerOutcome::with_data(json!({"version": ctx.host_version}))
            .line(ctx.host_version.clone()),
    )
}

fn diagnose(
    ctx: &mut CommandContext,
    _argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    let state_store = StateStore::new(&ctx.workspace_root);
    let cache_path = kb_cache::cache_path(&ctx.workspace_root);
    let snapshot = &ctx.introspection;

    let available = snapshot.manifests.iter().filter(|m| m.available).count();
    let data = json!({
        "workspaceRoot": ctx.workspace_root.to_string_lossy(),
        "version": ctx.host_version,
        "platform": format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        "statePresent": state_store.exists(),
        "cachePresent": cache_path.is_file(),
        "partial": snapshot.partial,
        "groups": snapshot.groups.len(),
        "manifests": snapshot.manifests.len(),
        "available": available,
        "skipped": snapshot.skipped.len(),
    });

    let mut outcome = HandlerOutcome::with_data(data)
        .line(format!("workspace_root: {}", ctx.workspace_root.display()))
        .line(format!("version: {}", ctx.host_version))
        .line(format!(
            "platform: {}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        ))
        .line(format!("state: {}", presence(state_store.exists())))
        .line(format!("cache: {}", presence(cache_path.is_file())))
        .line(format!(
            "plugins: {} manifests ({available} available), {} groups, {} skipped",
            snapshot.manifests.len(),
            snapshot.groups.len(),
            snapshot.skipped.len()
        ));
    if snapshot.partial {
        outcome = outcome.warn("registry is partial: some plugins were skipped");
    }
    Ok(outcome)
}

fn presence(present: bool) -> &'static str {
    if present { "present" } else { "absent" }
}

fn plugins_list(
    ctx: &mut CommandContext,
    _argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    let snapshot = &ctx.introspection;
    let mut outcome = HandlerOutcome::with_data(json!({
        "manifests": snapshot.manifests,
        "skipped": snapshot.skipped,
        "partial": snapshot.partial,
    }));

    if snapshot.manifests.is_empty() && snapshot.skipped.is_empty() {
        outcome = outcome.line("no plugins discovered");
        return Ok(outcome);
    }

    for entry in &snapshot.manifests {
        let mut line = format!("{} ({}) [{}]", entry.id, entry.package, entry.source.label());
        if entry.shadowed {
            line.push_str(" shadowed");
        }
        if !entry.available {
            let reason = entry.unavailable_reason.as_deref().unwrap_or("unavailable");
            line.push_str(&format!(" unavailable: {reason}"));
        }
        if entry.crashes > 0 {
            line.push_str(&format!(" crashes={}", entry.crashes));
        }
        outcome = outcome.line(line);
    }

    for skip in &snapshot.skipped {
        outcome = outcome.line(format!(
            "{} skipped: {} ({})",
            skip.package,
            skip.reason.code(),
            skip.detail
        ));
    }
    Ok(outcome)
}

fn require_package(argv: &[String], usage: &str) -> Result<String> {
    match argv.first() {
        Some(pkg) if !pkg.is_empty() => Ok(pkg.clone()),
        _ => bail!("usage: {usage}"),
    }
}

fn plugins_enable(
    ctx: &mut CommandContext,
    argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    let package = require_package(argv, "kb plugins:enable <package>")?;
    let store = StateStore::new(&ctx.workspace_root);
    let mut state = store.load()?;
    state.enable(&package);
    store.save(&mut state)?;
    Ok(HandlerOutcome::with_data(json!({"enabled": package})).line(format!("enabled {package}")))
}

fn plugins_disable(
    ctx: &mut CommandContext,
    argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    let package = require_package(argv, "kb plugins:disable <package>")?;
    let store = StateStore::new(&ctx.workspace_root);
    let mut state = store.load()?;
    state.disable(&package);
    store.save(&mut state)?;
    Ok(HandlerOutcome::with_data(json!({"disabled": package})).line(format!("disabled {package}")))
}

fn plugins_link(
    ctx: &mut CommandContext,
    argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    let raw = require_package(argv, "kb plugins:link <path>")?;
    let path = ctx.workspace_root.join(&raw);
    let path = std::fs::canonicalize(&path)
        .with_context(|| format!("cannot link {}: path does not resolve", path.display()))?;
    if !path.join("package.json").is_file() {
        bail!("cannot link {}: no package.json found", path.display());
    }

    let store = StateStore::new(&ctx.workspace_root);
    let mut state = store.load()?;
    state.link(&path);

    // Stamp the integrity hash so later listings can show drift.
    let package_name = std::fs::read_to_string(path.join("package.json"))
        .ok()
        .and_then(|content| serde_json::from_str::<Value>(&content).ok())
        .and_then(|json| json.get("name").and_then(Value::as_str).map(str::to_string));
    if let Some(name) = package_name {
        state.integrity.insert(name, compute_integrity(&path));
    }

    store.save(&mut state)?;
    Ok(
        HandlerOutcome::with_data(json!({"linked": path.to_string_lossy()}))
            .line(format!("linked {}", path.display())),
    )
}

fn plugins_unlink(
    ctx: &mut CommandContext,
    argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    let raw = require_package(argv, "kb plugins:unlink <path>")?;
    let joined = ctx.workspace_root.join(&raw);
    let canonical = std::fs::canonicalize(&joined).unwrap_or(joined);

    let store = StateStore::new(&ctx.workspace_root);
    let mut state = store.load()?;
    let removed = state.unlink(&canonical) || state.unlink(std::path::Path::new(&raw));
    if !removed {
        bail!("{} is not a linked plugin path", canonical.display());
    }
    store.save(&mut state)?;
    Ok(
        HandlerOutcome::with_data(json!({"unlinked": canonical.to_string_lossy()}))
            .line(format!("unlinked {}", canonical.display())),
    )
}

fn plugins_grant(
    ctx: &mut CommandContext,
    argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    let package = require_package(argv, "kb plugins:grant <package> <capability>...")?;
    let capabilities = &argv[1..];
    if capabilities.is_empty() {
        bail!("usage: kb plugins:grant <package> <capability>...");
    }
    for capability in capabilities {
        if !is_known_capability(capability) {
            bail!(
                "unknown capability '{capability}' (known: {})",
                KNOWN_CAPABILITIES.join(", ")
            );
        }
    }

    let store = StateStore::new(&ctx.workspace_root);
    let mut state = store.load()?;
    state.grant_permissions(&package, capabilities.iter().cloned());
    store.save(&mut state)?;
    Ok(HandlerOutcome::with_data(json!({
        "package": package,
        "granted": capabilities,
    }))
    .line(format!("granted {} to {package}", capabilities.join(", "))))
}

fn plugins_reset_crashes(
    ctx: &mut CommandContext,
    argv: &[String],
    _flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    let package = require_package(argv, "kb plugins:reset-crashes <package>")?;
    let store = StateStore::new(&ctx.workspace_root);
    let mut state = store.load()?;
    state.reset_crashes(&package);
    store.save(&mut state)?;
    Ok(
        HandlerOutcome::with_data(json!({"reset": package}))
            .line(format!("crash counter cleared for {package}")),
    )
}

fn plugins_cache_clear(
    ctx: &mut CommandContext,
    _argv: &[String],
    flags: &mut BTreeMap<String, Value>,
) -> Result<HandlerOutcome> {
    let removed = CacheStore::new(&ctx.workspace_root).clear()?;
    let deep = flags.get("deep").and_then(Value::as_bool).unwrap_or(false);
    if deep {
        ctx.loader_cache.clear();
    }
    Ok(HandlerOutcome::with_data(json!({
        "removed": removed,
        "deep": deep,
    }))
    .line(format!(
        "removed {removed} cache file(s){}",
        if deep { ", dropped resolved loaders" } else { "" }
    )))
}
