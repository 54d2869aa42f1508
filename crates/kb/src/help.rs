//! Help and introspection.
//!
//! Pure functions over registry snapshots. Every builder returns a
//! serializable structure so the text renderer and the `--json` presenter
//! always carry the same information.

use serde::Serialize;

use kb_state::PluginState;
use kb_types::{CommandSource, EngineSpec, FlagSpec, SkippedManifest};

use crate::registry::{Command, CommandGroup, Registry};

/// Global flags recognized by the dispatcher, with their help lines.
pub const GLOBAL_OPTIONS: &[(&str, &str)] = &[
    ("--help", "Show help and exit"),
    ("--version", "Print the host version and exit"),
    ("--json", "Emit a single JSON document on stdout"),
    ("--quiet", "Suppress non-summary output"),
    ("--verbose", "Include timing and diagnostic output"),
    ("--debug", "Maximum verbosity"),
    ("--log-level=<name>", "Set the log level explicitly"),
    ("--no-cache", "Bypass the manifest discovery cache"),
    ("--only-available", "Filter listings to available commands"),
    ("--dry-run", "Advisory; propagated to the handler"),
];

/// One group line in the global help.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub describe: Option<String>,
    pub command_count: usize,
    pub available_count: usize,
    /// Manifest version badge derived from `manifestV2.schema`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    pub partial: bool,
}

/// One command line in a listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub describe: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub available: bool,
    pub source: CommandSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

/// An unavailable command with the reason preflight or state attached.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnavailableEntry {
    pub id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionHelp {
    pub flag: String,
    pub describe: String,
}

/// The global help document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHelp {
    pub version: String,
    pub groups: Vec<GroupSummary>,
    pub system_commands: Vec<CommandSummary>,
    pub options: Vec<OptionHelp>,
    pub partial: bool,
}

/// The per-group help document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHelp {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub describe: Option<String>,
    pub commands: Vec<CommandSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<UnavailableEntry>,
}

/// Where a command came from, for the command help footer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginInfo {
    pub package: String,
    pub source: CommandSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkg_root: Option<String>,
}

/// The per-command help document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHelp {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub describe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<FlagSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<UnavailableEntry>,
}

/// One manifest line in the introspection snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    pub id: String,
    pub package: String,
    pub source: CommandSource,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub shadowed: bool,
    pub crashes: u32,
}

/// The read-only registry view handed to handlers through the dispatch
/// context.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionSnapshot {
    pub partial: bool,
    pub groups: Vec<GroupSummary>,
    pub manifests: Vec<ManifestSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedManifest>,
}

fn command_available(registry: &Registry, cmd: &Command) -> bool {
    registry
        .manifest(cmd.id())
        .map(|rc| rc.available)
        .unwrap_or(true)
}

fn summarize_command(registry: &Registry, cmd: &Command) -> CommandSummary {
    CommandSummary {
        id: cmd.id().to_string(),
        name: cmd.name().to_string(),
        describe: cmd.manifest.describe.clone(),
        aliases: cmd.manifest.aliases.clone(),
        available: command_available(registry, cmd),
        source: cmd.source,
        example: cmd.manifest.examples.first().cloned(),
    }
}

fn summarize_group(
    registry: &Registry,
    group: &CommandGroup,
    skipped: &[SkippedManifest],
) -> GroupSummary {
    let available_count = group
        .commands
        .values()
        .filter(|cmd| command_available(registry, cmd))
        .count();
    let badge = group
        .commands
        .values()
        .find_map(|cmd| cmd.manifest.manifest_v2.as_ref().and_then(|v2| v2.version_badge()));
    let partial = skipped
        .iter()
        .any(|s| s.group.as_deref() == Some(group.name.as_str()));

    GroupSummary {
        name: group.name.clone(),
        describe: group.describe.clone(),
        command_count: group.commands.len(),
        available_count,
        badge,
        partial,
    }
}

/// Build the global help document.
pub fn build_global_help(
    registry: &Registry,
    skipped: &[SkippedManifest],
    version: &str,
    only_available: bool,
) -> GlobalHelp {
    let mut groups: Vec<GroupSummary> = registry
        .list_groups()
        .into_iter()
        .map(|g| summarize_group(registry, g, skipped))
        .collect();

    // Groups whose every candidate was skipped still appear, flagged
    // partial, so the operator can see what is missing and why.
    for skip in skipped {
        if let Some(group) = skip.group.as_deref()
            && !groups.iter().any(|g| g.name == group)
        {
            groups.push(GroupSummary {
                name: group.to_string(),
                describe: None,
                command_count: 0,
                available_count: 0,
                badge: None,
                partial: true,
            });
        }
    }
    groups.sort_by(|a, b| a.name.cmp(&b.name));

    let mut system_commands: Vec<CommandSummary> = registry
        .list_standalone_commands()
        .into_iter()
        .map(|cmd| summarize_command(registry, cmd))
        .filter(|c| !only_available || c.available)
        .collect();
    system_commands.sort_by(|a, b| a.name.cmp(&b.name));

    GlobalHelp {
        version: version.to_string(),
        groups,
        system_commands,
        options: GLOBAL_OPTIONS
            .iter()
            .map(|(flag, describe)| OptionHelp {
                flag: flag.to_string(),
                describe: describe.to_string(),
            })
            .collect(),
        partial: registry.is_partial(),
    }
}

/// Build the help document for one group.
pub fn build_group_help(
    registry: &Registry,
    group: &CommandGroup,
    skipped: &[SkippedManifest],
    only_available: bool,
) -> GroupHelp {
    let mut commands = Vec::new();
    let mut unavailable = Vec::new();

    for cmd in group.commands.values() {
        let summary = summarize_command(registry, cmd);
        if summary.available {
            commands.push(summary);
        } else {
            let rc = registry.manifest(cmd.id());
            unavailable.push(UnavailableEntry {
                id: cmd.id().to_string(),
                reason: rc
                    .and_then(|rc| rc.unavailable_reason.clone())
                    .unwrap_or_else(|| "unavailable".to_string()),
                hint: rc.and_then(|rc| rc.hint.clone()),
            });
            if !only_available {
                commands.push(summary);
            }
        }
    }

    for skip in skipped {
        if skip.group.as_deref() == Some(group.name.as_str()) {
            unavailable.push(UnavailableEntry {
                id: skip.id.clone().unwrap_or_else(|| skip.package.clone()),
                reason: format!("{}: {}", skip.reason.code(), skip.detail),
                hint: skip.hint.clone(),
            });
        }
    }

    GroupHelp {
        name: group.name.clone(),
        describe: group.describe.clone(),
        commands,
        unavailable: if only_available { Vec::new() } else { unavailable },
    }
}

/// Build the help document for one command.
pub fn build_command_help(registry: &Registry, cmd: &Command) -> CommandHelp {
    let rc = registry.manifest(cmd.id());
    let availability = rc.and_then(|rc| {
        if rc.available {
            None
        } else {
            Some(UnavailableEntry {
                id: cmd.id().to_string(),
                reason: rc
                    .unavailable_reason
                    .clone()
                    .unwrap_or_else(|| "unavailable".to_string()),
                hint: rc.hint.clone(),
            })
        }
    });

    let origin = if cmd.manifest.package.is_empty() {
        None
    } else {
        Some(OriginInfo {
            package: cmd.manifest.package.clone(),
            source: cmd.source,
            pkg_root: rc
                .and_then(|rc| rc.pkg_root.as_ref())
                .map(|p| p.to_string_lossy().into_owned()),
        })
    };

    CommandHelp {
        id: cmd.id().to_string(),
        describe: cmd.manifest.describe.clone(),
        long_description: cmd.manifest.long_description.clone(),
        aliases: cmd.manifest.aliases.clone(),
        examples: cmd.manifest.examples.clone(),
        flags: cmd.manifest.flags.clone(),
        engine: cmd.manifest.engine.clone(),
        permissions: cmd.manifest.permissions.clone(),
        origin,
        availability,
    }
}

/// Build the read-only registry view for handlers.
pub fn build_snapshot(
    registry: &Registry,
    skipped: &[SkippedManifest],
    state: &PluginState,
) -> IntrospectionSnapshot {
    let mut manifests: Vec<ManifestSummary> = registry
        .list_manifests()
        .into_iter()
        .chain(registry.shadowed_manifests().iter())
        .map(|rc| ManifestSummary {
            id: rc.id().to_string(),
            package: rc.package_name().to_string(),
            source: rc.source,
            available: rc.available,
            unavailable_reason: rc.unavailable_reason.clone(),
            hint: rc.hint.clone(),
            shadowed: rc.shadowed,
            crashes: state.crash_count(rc.package_name()),
        })
        .collect();
    manifests.sort_by(|a, b| (&a.id, a.shadowed).cmp(&(&b.id, b.shadowed)));

    IntrospectionSnapshot {
        partial: registry.is_partial(),
        groups: registry
            .list_groups()
            .into_iter()
            .map(|g| summarize_group(registry, g, skipped))
            .collect(),
        manifests,
        skipped: skipped.to_vec(),
    }
}

/// Render the global help as text lines.
pub fn render_global_help(help: &GlobalHelp) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!("kb v{}", help.version));
    if help.partial {
        lines.push("(some plugins were skipped; run `kb plugins:list` for details)".to_string());
    }

    if !help.groups.is_empty() {
        lines.push(String::new());
        lines.push("Groups:".to_string());
        for group in &help.groups {
            let mut line = format!("  {} ({} commands)", group.name, group.command_count);
            if let Some(badge) = &group.badge {
                line.push_str(&format!(" [{badge}]"));
            }
            if group.partial {
                line.push_str(" (partial)");
            }
            if let Some(describe) = &group.describe {
                line.push_str(&format!(" - {describe}"));
            }
            lines.push(line);
        }
    }

    if !help.system_commands.is_empty() {
        lines.push(String::new());
        lines.push("Commands:".to_string());
        for cmd in &help.system_commands {
            lines.push(render_command_line(cmd));
        }
    }

    lines.push(String::new());
    lines.push("Global options:".to_string());
    for option in &help.options {
        lines.push(format!("  {:<22} {}", option.flag, option.describe));
    }
    lines
}

/// Render a group help document as text lines.
pub fn render_group_help(help: &GroupHelp) -> Vec<String> {
    let mut lines = Vec::new();
    match &help.describe {
        Some(describe) => lines.push(format!("{} - {describe}", help.name)),
        None => lines.push(help.name.clone()),
    }

    if !help.commands.is_empty() {
        lines.push(String::new());
        lines.push("Commands:".to_string());
        for cmd in &help.commands {
            let mut line = render_command_line(cmd);
            if let Some(example) = &cmd.example {
                line.push_str(&format!(" (e.g. {example})"));
            }
            lines.push(line);
        }
    }

    if !help.unavailable.is_empty() {
        lines.push(String::new());
        lines.push("Unavailable:".to_string());
        for entry in &help.unavailable {
            lines.push(format!("  {} - {}", entry.id, entry.reason));
            if let Some(hint) = &entry.hint {
                lines.push(format!("    hint: {hint}"));
            }
        }
    }
    lines
}

/// Render a command help document as text lines.
pub fn render_command_help(help: &CommandHelp) -> Vec<String> {
    let mut lines = Vec::new();
    match &help.describe {
        Some(describe) => lines.push(format!("{} - {describe}", help.id)),
        None => lines.push(help.id.clone()),
    }
    if let Some(availability) = &help.availability {
        lines.push(format!("UNAVAILABLE: {}", availability.reason));
        if let Some(hint) = &availability.hint {
            lines.push(format!("hint: {hint}"));
        }
    }
    if let Some(long) = &help.long_description {
        lines.push(String::new());
        lines.push(long.clone());
    }
    if !help.aliases.is_empty() {
        lines.push(format!("aliases: {}", help.aliases.join(", ")));
    }

    if !help.examples.is_empty() {
        lines.push(String::new());
        lines.push("Examples:".to_string());
        for example in &help.examples {
            lines.push(format!("  {example}"));
        }
    }

    if !help.flags.is_empty() {
        lines.push(String::new());
        lines.push("Flags:".to_string());
        for flag in &help.flags {
            let mut line = format!("  --{}", flag.name);
            if let Some(alias) = &flag.alias {
                line.push_str(&format!(", -{alias}"));
            }
            line.push_str(&format!(" <{}>", flag_type_label(flag)));
            if flag.required {
                line.push_str(" (required)");
            }
            if let Some(default) = &flag.default {
                line.push_str(&format!(" (default: {default})"));
            }
            if let Some(choices) = &flag.choices {
                line.push_str(&format!(" (choices: {})", choices.join(", ")));
            }
            if let Some(describe) = &flag.describe {
                line.push_str(&format!(" - {describe}"));
            }
            lines.push(line);
        }
    }

    if let Some(engine) = &help.engine {
        let mut parts = Vec::new();
        if let Some(node) = &engine.node {
            parts.push(format!("node {node}"));
        }
        if let Some(kb_cli) = &engine.kb_cli {
            parts.push(format!("kb-cli {kb_cli}"));
        }
        if !parts.is_empty() {
            lines.push(String::new());
            lines.push(format!("engine: {}", parts.join(", ")));
        }
    }

    if !help.permissions.is_empty() {
        lines.push(format!("permissions: {}", help.permissions.join(", ")));
    }

    if let Some(origin) = &help.origin {
        lines.push(format!(
            "from: {} ({})",
            origin.package,
            origin.source.label()
        ));
    }
    lines
}

fn render_command_line(cmd: &CommandSummary) -> String {
    let mut line = format!("  {}", cmd.name);
    if let Some(describe) = &cmd.describe {
        line.push_str(&format!(" - {describe}"));
    }
    if !cmd.aliases.is_empty() {
        line.push_str(&format!(" (aliases: {})", cmd.aliases.join(", ")));
    }
    if !cmd.available {
        line.push_str(" [unavailable]");
    }
    line
}

fn flag_type_label(flag: &FlagSpec) -> &'static str {
    match flag.flag_type {
        kb_types::FlagType::Boolean => "boolean",
        kb_types::FlagType::String => "string",
        kb_types::FlagType::Number => "number",
        kb_types::FlagType::Array => "array",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use kb_types::{
        HandlerOutcome, Manifest, ManifestV2, RegisteredCommand, SkipReason,
    };

    use crate::dispatch::{CommandContext, CommandHandler};

    struct NoopHandler;

    impl CommandHandler for NoopHandler {
        fn run(
            &self,
            _ctx: &mut CommandContext,
            _argv: &[String],
            _flags: &mut std::collections::BTreeMap<String, serde_json::Value>,
        ) -> anyhow::Result<HandlerOutcome> {
            Ok(HandlerOutcome::ok())
        }
    }

    fn registry_with_plugin() -> Registry {
        let mut registry = Registry::new();

        let hello = Manifest {
            id: "hello".to_string(),
            describe: Some("Print a hello message".to_string()),
            ..Manifest::default()
        };
        registry.register(crate::registry::Command::builtin(hello, Arc::new(NoopHandler)));

        let manifest = Manifest {
            id: "devlink:plan".to_string(),
            package: "@kb/devlink".to_string(),
            describe: Some("Plan workspace links".to_string()),
            examples: vec!["kb devlink:plan --json".to_string()],
            manifest_v2: Some(ManifestV2 {
                schema: Some("kb.dev/manifest.v2".to_string()),
                ..ManifestV2::default()
            }),
            ..Manifest::default()
        };
        registry.register_manifest(RegisteredCommand::new(
            manifest,
            kb_types::CommandSource::Workspace,
            Some(PathBuf::from("/ws/packages/devlink")),
        ));
        registry
    }

    fn skipped_entry(group: &str) -> SkippedManifest {
        SkippedManifest {
            id: Some(format!("{group}:old")),
            package: format!("@kb/{group}-old"),
            group: Some(group.to_string()),
            pkg_root: None,
            reason: SkipReason::CliVersionMismatch,
            detail: "requires kb CLI ^2, host is 1.5.0".to_string(),
            hint: Some("upgrade kb".to_string()),
        }
    }

    #[test]
    fn global_help_lists_groups_and_standalone_commands() {
        let registry = registry_with_plugin();
        let help = build_global_help(&registry, &[], "1.5.0", false);

        assert_eq!(help.version, "1.5.0");
        assert_eq!(help.groups.len(), 1);
        assert_eq!(help.groups[0].name, "devlink");
        assert_eq!(help.groups[0].command_count, 1);
        assert_eq!(help.groups[0].badge.as_deref(), Some("v2"));
        assert!(!help.groups[0].partial);
        assert_eq!(help.system_commands.len(), 1);
        assert_eq!(help.system_commands[0].name, "hello");
        assert_eq!(help.options.len(), GLOBAL_OPTIONS.len());
    }

    #[test]
    fn global_help_shows_skipped_only_groups_as_partial() {
        let registry = registry_with_plugin();
        let skipped = vec![skipped_entry("mind")];
        let help = build_global_help(&registry, &skipped, "1.5.0", false);

        let mind = help
            .groups
            .iter()
            .find(|g| g.name == "mind")
            .expect("mind group listed");
        assert!(mind.partial);
        assert_eq!(mind.command_count, 0);
    }

    #[test]
    fn group_help_splits_unavailable_commands_out() {
        let mut registry = registry_with_plugin();
        let mut broken = RegisteredCommand::new(
            Manifest {
                id: "devlink:apply".to_string(),
                package: "@kb/devlink".to_string(),
                ..Manifest::default()
            },
            kb_types::CommandSource::Workspace,
            None,
        );
        broken.mark_unavailable("package disabled", Some("kb plugins:enable @kb/devlink".to_string()));
        registry.register_manifest(broken);

        let group = registry
            .list_groups()
            .into_iter()
            .find(|g| g.name == "devlink")
            .expect("group")
            .clone();

        let help = build_group_help(&registry, &group, &[], false);
        assert_eq!(help.commands.len(), 2);
        assert_eq!(help.unavailable.len(), 1);
        assert_eq!(help.unavailable[0].id, "devlink:apply");
        assert!(help.unavailable[0].reason.contains("disabled"));

        let filtered = build_group_help(&registry, &group, &[], true);
        assert_eq!(filtered.commands.len(), 1);
        assert!(filtered.unavailable.is_empty());
    }

    #[test]
    fn group_help_includes_skipped_candidates() {
        let registry = registry_with_plugin();
        let group = registry
            .list_groups()
            .into_iter()
            .find(|g| g.name == "devlink")
            .expect("group")
            .clone();
        let skipped = vec![skipped_entry("devlink")];

        let help = build_group_help(&registry, &group, &skipped, false);
        assert_eq!(help.unavailable.len(), 1);
        assert!(help.unavailable[0].reason.starts_with("CLI_VERSION_MISMATCH"));
    }

    #[test]
    fn command_help_carries_origin_and_flags() {
        let registry = registry_with_plugin();
        let Some(crate::registry::Resolved::Command(cmd)) = registry.lookup_key("devlink:plan")
        else {
            panic!("expected command");
        };

        let help = build_command_help(&registry, cmd);
        assert_eq!(help.id, "devlink:plan");
        let origin = help.origin.expect("origin");
        assert_eq!(origin.package, "@kb/devlink");
        assert_eq!(origin.source, CommandSource::Workspace);
        assert!(help.availability.is_none());
    }

    #[test]
    fn snapshot_counts_crashes_and_includes_shadowed() {
        let mut registry = registry_with_plugin();
        registry.register_manifest(RegisteredCommand::new(
            Manifest {
                id: "devlink:plan".to_string(),
                package: "@other/devlink".to_string(),
                ..Manifest::default()
            },
            kb_types::CommandSource::NodeModules,
            None,
        ));
        registry.mark_partial(true);

        let mut state = PluginState::default();
        state.record_crash("@kb/devlink");

        let snapshot = build_snapshot(&registry, &[], &state);
        assert!(snapshot.partial);
        assert_eq!(snapshot.manifests.len(), 2);

        let authoritative = snapshot
            .manifests
            .iter()
            .find(|m| !m.shadowed)
            .expect("authoritative");
        assert_eq!(authoritative.package, "@kb/devlink");
        assert_eq!(authoritative.crashes, 1);

        assert!(snapshot.manifests.iter().any(|m| m.shadowed));
    }

    #[test]
    fn rendered_text_matches_structured_content() {
        let registry = registry_with_plugin();
        let help = build_global_help(&registry, &[skipped_entry("mind")], "1.5.0", false);
        let lines = render_global_help(&help);

        let listing = lines[..8].join("\n");
        insta::assert_snapshot!(listing, @r#"
kb v1.5.0

Groups:
  devlink (1 commands) [v2]
  mind (0 commands) (partial)

Commands:
  hello - Print a hello message
"#);

        assert_eq!(lines[9], "Global options:");
        for (flag, describe) in GLOBAL_OPTIONS {
            assert!(
                lines
                    .iter()
                    .any(|l| l.contains(flag) && l.contains(describe)),
                "missing option line for {flag}"
            );
        }
    }
}
