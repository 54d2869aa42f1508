//! The in-memory command registry.
//!
//! One registry is built per invocation: built-ins first, then every
//! manifest that survived preflight. Keys in the name map cover all the
//! spellings a user can type — canonical id (`devlink:plan`), space form
//! (`devlink plan`), bare name (`plan`), and aliases — while the manifest
//! map keeps exactly one authoritative entry per id.
//!
//! Shadowing: when two manifests claim the same id, the higher-precedence
//! source wins (`workspace > linked > node_modules`); the loser is kept for
//! introspection with `shadowed = true` and is never consulted by
//! dispatch. Built-ins always win over plugins with the same name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kb_types::{CommandSource, Manifest, RegisteredCommand};

use crate::dispatch::CommandHandler;

/// How a command's implementation is reached.
#[derive(Clone)]
pub enum HandlerRef {
    /// In-process built-in handler.
    Builtin(Arc<dyn CommandHandler>),
    /// Plugin command: resolved lazily from the manifest with this id.
    Manifest(String),
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerRef::Builtin(_) => f.write_str("HandlerRef::Builtin"),
            HandlerRef::Manifest(id) => write!(f, "HandlerRef::Manifest({id})"),
        }
    }
}

/// An executable entry in the namespace.
#[derive(Debug, Clone)]
pub struct Command {
    pub manifest: Manifest,
    pub source: CommandSource,
    pub handler: HandlerRef,
}

impl Command {
    pub fn builtin(manifest: Manifest, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            manifest,
            source: CommandSource::Builtin,
            handler: HandlerRef::Builtin(handler),
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn name(&self) -> &str {
        self.manifest.command_name()
    }
}

/// A named bag of commands sharing a group.
#[derive(Debug, Clone, Default)]
pub struct CommandGroup {
    pub name: String,
    pub describe: Option<String>,
    pub commands: BTreeMap<String, Command>,
}

impl CommandGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            describe: None,
            commands: BTreeMap::new(),
        }
    }

    pub fn with_describe(name: &str, describe: &str) -> Self {
        Self {
            name: name.to_string(),
            describe: Some(describe.to_string()),
            commands: BTreeMap::new(),
        }
    }
}

/// What a name key points at.
#[derive(Debug, Clone)]
enum NameBinding {
    Command(Command),
    /// Indirection into the group map so group contents never go stale.
    Group(String),
}

/// Result of a namespace lookup.
#[derive(Debug)]
pub enum Resolved<'a> {
    Command(&'a Command),
    Group(&'a CommandGroup),
}

/// The per-invocation command namespace.
#[derive(Debug, Default)]
pub struct Registry {
    by_name: BTreeMap<String, NameBinding>,
    groups: BTreeMap<String, CommandGroup>,
    manifests: BTreeMap<String, RegisteredCommand>,
    shadowed: Vec<RegisteredCommand>,
    partial: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain command (built-ins use this). The command is bound
    /// under its id, space form, bare name, and aliases; a command whose
    /// category names a group joins that group.
    pub fn register(&mut self, cmd: Command) {
        if let Some(group_name) = cmd.manifest.group_name().map(str::to_string) {
            let group = self
                .groups
                .entry(group_name.clone())
                .or_insert_with(|| CommandGroup::new(&group_name));
            group.commands.insert(cmd.name().to_string(), cmd.clone());
            self.bind_group_key(&group_name);
        }
        self.bind_keys(&cmd);
    }

    /// Register a named collection of commands. Each member must carry a
    /// full `group:name` id.
    pub fn register_group(&mut self, group: CommandGroup) {
        let name = group.name.clone();
        let commands: Vec<Command> = group.commands.values().cloned().collect();

        let entry = self
            .groups
            .entry(name.clone())
            .or_insert_with(|| CommandGroup::new(&name));
        if entry.describe.is_none() {
            entry.describe = group.describe.clone();
        }
        for cmd in &commands {
            entry.commands.insert(cmd.name().to_string(), cmd.clone());
        }

        self.bind_group_key(&name);
        for cmd in &commands {
            self.bind_keys(cmd);
        }
    }

    /// Register a manifest that survived preflight. Handles the precedence
    /// fight for its id; the loser is kept as shadowed.
    pub fn register_manifest(&mut self, mut rc: RegisteredCommand) {
        let id = rc.manifest.id.clone();

        if let Some(current) = self.manifests.get(&id) {
            if beats(&rc, current) {
                let mut old = self
                    .manifests
                    .remove(&id)
                    .expect("checked entry must exist");
                old.shadowed = true;
                self.shadowed.push(old);
            } else {
                rc.shadowed = true;
                self.shadowed.push(rc);
                return;
            }
        }

        let cmd = Command {
            manifest: rc.manifest.clone(),
            source: rc.source,
            handler: HandlerRef::Manifest(id.clone()),
        };

        if let Some(group_name) = cmd.manifest.group_name().map(str::to_string) {
            let group = self
                .groups
                .entry(group_name.clone())
                .or_insert_with(|| CommandGroup::new(&group_name));
            group.commands.insert(cmd.name().to_string(), cmd.clone());
            self.bind_group_key(&group_name);
        }
        self.bind_keys(&cmd);

        self.manifests.insert(id, rc);
    }

    /// Resolve a single key: id, space form, bare name, or alias.
    pub fn lookup_key(&self, key: &str) -> Option<Resolved<'_>> {
        match self.by_name.get(key)? {
            NameBinding::Command(cmd) => Some(Resolved::Command(cmd)),
            NameBinding::Group(name) => self.groups.get(name).map(Resolved::Group),
        }
    }

    /// Resolve a normalized command path. Returns the match plus how many
    /// path tokens it consumed; unconsumed tokens are the command's argv.
    ///
    /// Longest paths are tried first so `devlink plan` resolves the command
    /// rather than stopping at the `devlink` group, and the legacy dotted
    /// form (`init.profile`) is the last resort.
    pub fn resolve_path(&self, tokens: &[String]) -> Option<(Resolved<'_>, usize)> {
        if tokens.is_empty() {
            return None;
        }

        let max = tokens.len().min(3);
        for take in (1..=max).rev() {
            let colon = tokens[..take].join(":");
            if self.by_name.contains_key(&colon) {
                return self.lookup_key(&colon).map(|r| (r, take));
            }
            let space = tokens[..take].join(" ");
            if self.by_name.contains_key(&space) {
                return self.lookup_key(&space).map(|r| (r, take));
            }
        }

        let first = tokens[0].as_str();
        if first.contains('.') {
            let dotted = first.replace('.', ":");
            if self.by_name.contains_key(&dotted) {
                return self.lookup_key(&dotted).map(|r| (r, 1));
            }
        }

        None
    }

    /// Convenience lookup for a single path string (space separated).
    pub fn get(&self, path: &str) -> Option<Resolved<'_>> {
        let tokens: Vec<String> = path.split_whitespace().map(str::to_string).collect();
        self.resolve_path(&tokens).map(|(resolved, _)| resolved)
    }

    /// The authoritative manifest for an id, if any.
    pub fn manifest(&self, id: &str) -> Option<&RegisteredCommand> {
        self.manifests.get(id)
    }

    /// Authoritative manifests in id order.
    pub fn list_manifests(&self) -> Vec<&RegisteredCommand> {
        self.manifests.values().collect()
    }

    /// Manifests that lost a precedence fight.
    pub fn shadowed_manifests(&self) -> &[RegisteredCommand] {
        &self.shadowed
    }

    /// All groups in name order.
    pub fn list_groups(&self) -> Vec<&CommandGroup> {
        self.groups.values().collect()
    }

    /// Groups carrying at least one plugin-backed command. Purely built-in
    /// groups (`plugins`) are host machinery, not products.
    pub fn list_product_groups(&self) -> Vec<&CommandGroup> {
        self.groups
            .values()
            .filter(|g| {
                g.commands
                    .values()
                    .any(|c| c.source != CommandSource::Builtin)
            })
            .collect()
    }

    /// Standalone commands: bare-name entries that belong to no group.
    pub fn list_standalone_commands(&self) -> Vec<&Command> {
        self.by_name
            .iter()
            .filter_map(|(key, binding)| match binding {
                NameBinding::Command(cmd)
                    if cmd.manifest.is_bare() && key == &cmd.manifest.id =>
                {
                    Some(cmd)
                }
                _ => None,
            })
            .collect()
    }

    /// Commands of one group, in name order.
    pub fn commands_by_group(&self, group: &str) -> Vec<&Command> {
        self.groups
            .get(group)
            .map(|g| g.commands.values().collect())
            .unwrap_or_default()
    }

    pub fn mark_partial(&mut self, partial: bool) {
        self.partial = partial;
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    fn bind_keys(&mut self, cmd: &Command) {
        self.bind_command(cmd.manifest.id.clone(), cmd);
        if cmd.manifest.id.contains(':') {
            self.bind_command(cmd.manifest.space_form(), cmd);
            self.bind_command(cmd.name().to_string(), cmd);
        }
        for alias in cmd.manifest.aliases.clone() {
            self.bind_command(alias, cmd);
        }
    }

    fn bind_command(&mut self, key: String, cmd: &Command) {
        match self.by_name.get(&key) {
            None => {
                self.by_name.insert(key, NameBinding::Command(cmd.clone()));
            }
            // Group traversal owns its key.
            Some(NameBinding::Group(_)) => {}
            Some(NameBinding::Command(existing)) => {
                if cmd.source.precedence() > existing.source.precedence() {
                    self.by_name.insert(key, NameBinding::Command(cmd.clone()));
                }
            }
        }
    }

    fn bind_group_key(&mut self, name: &str) {
        if !self.by_name.contains_key(name) {
            self.by_name
                .insert(name.to_string(), NameBinding::Group(name.to_string()));
        }
    }
}

/// Precedence fight between two manifests with the same id. Equal
/// precedence keeps the incumbent: discovery emits candidates ordered by
/// id then package name, so the first-seen entry is the lexicographically
/// smallest package.
fn beats(challenger: &RegisteredCommand, incumbent: &RegisteredCommand) -> bool {
    challenger.source.precedence() > incumbent.source.precedence()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Flags;
    use std::path::PathBuf;

    use anyhow::Result;
    use kb_types::HandlerOutcome;
    use serde_json::Value;

    use crate::dispatch::CommandContext;

    struct NoopHandler;

    impl CommandHandler for NoopHandler {
        fn run(
            &self,
            _ctx: &mut CommandContext,
            _argv: &[String],
            _flags: &mut Flags<String, Value>,
        ) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::ok())
        }
    }

    fn manifest(id: &str, package: &str) -> Manifest {
        Manifest {
            id: id.to_string(),
            package: package.to_string(),
            ..Manifest::default()
        }
    }

    fn registered(id: &str, package: &str, source: CommandSource) -> RegisteredCommand {
        RegisteredCommand::new(
            manifest(id, package),
            source,
            Some(PathBuf::from(format!("/ws/{package}"))),
        )
    }

    fn builtin(id: &str, aliases: &[&str]) -> Command {
        let mut m = manifest(id, "");
        m.aliases = aliases.iter().map(|a| a.to_string()).collect();
        Command::builtin(m, Arc::new(NoopHandler))
    }

    #[test]
    fn manifest_registration_binds_all_key_forms() {
        let mut registry = Registry::new();
        let mut rc = registered("devlink:plan", "@kb/devlink", CommandSource::Workspace);
        rc.manifest.aliases = vec!["dp".to_string()];
        registry.register_manifest(rc);

        for key in ["devlink:plan", "devlink plan", "plan", "dp"] {
            match registry.lookup_key(key) {
                Some(Resolved::Command(cmd)) => assert_eq!(cmd.id(), "devlink:plan"),
                other => panic!("expected command for {key}, got {other:?}"),
            }
        }
        match registry.lookup_key("devlink") {
            Some(Resolved::Group(group)) => assert_eq!(group.name, "devlink"),
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn workspace_shadows_node_modules_for_the_same_id() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("plan:run", "@b/plan-cli", CommandSource::NodeModules));
        registry.register_manifest(registered("plan:run", "@a/plan-cli", CommandSource::Workspace));

        let authoritative = registry.manifest("plan:run").expect("manifest");
        assert_eq!(authoritative.package_name(), "@a/plan-cli");
        assert!(!authoritative.shadowed);

        let shadowed = registry.shadowed_manifests();
        assert_eq!(shadowed.len(), 1);
        assert_eq!(shadowed[0].package_name(), "@b/plan-cli");
        assert_eq!(shadowed[0].source, CommandSource::NodeModules);
        assert!(shadowed[0].shadowed);

        match registry.lookup_key("plan:run") {
            Some(Resolved::Command(cmd)) => assert_eq!(cmd.source, CommandSource::Workspace),
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn lower_precedence_challenger_is_shadowed_without_rebinding() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("plan:run", "@a/plan-cli", CommandSource::Workspace));
        registry.register_manifest(registered("plan:run", "@b/plan-cli", CommandSource::NodeModules));

        assert_eq!(
            registry.manifest("plan:run").expect("manifest").package_name(),
            "@a/plan-cli"
        );
        assert_eq!(registry.shadowed_manifests().len(), 1);
    }

    #[test]
    fn linked_beats_node_modules_but_not_workspace() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("x:y", "@nm/x", CommandSource::NodeModules));
        registry.register_manifest(registered("x:y", "@linked/x", CommandSource::Linked));
        assert_eq!(
            registry.manifest("x:y").expect("manifest").package_name(),
            "@linked/x"
        );

        registry.register_manifest(registered("x:y", "@ws/x", CommandSource::Workspace));
        assert_eq!(
            registry.manifest("x:y").expect("manifest").package_name(),
            "@ws/x"
        );
        assert_eq!(registry.shadowed_manifests().len(), 2);
    }

    #[test]
    fn equal_precedence_keeps_first_seen() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("x:y", "@a/first", CommandSource::Workspace));
        registry.register_manifest(registered("x:y", "@b/second", CommandSource::Workspace));

        assert_eq!(
            registry.manifest("x:y").expect("manifest").package_name(),
            "@a/first"
        );
    }

    #[test]
    fn builtin_wins_over_plugin_with_the_same_name() {
        let mut registry = Registry::new();
        registry.register(builtin("hello", &[]));
        registry.register_manifest(registered("hello", "@evil/hello", CommandSource::Workspace));

        match registry.lookup_key("hello") {
            Some(Resolved::Command(cmd)) => assert_eq!(cmd.source, CommandSource::Builtin),
            other => panic!("expected builtin, got {other:?}"),
        }
    }

    #[test]
    fn alias_lookup_resolves() {
        let mut registry = Registry::new();
        registry.register(builtin("diagnose", &["health", "diag"]));

        for key in ["diagnose", "health", "diag"] {
            assert!(matches!(
                registry.lookup_key(key),
                Some(Resolved::Command(_))
            ));
        }
    }

    #[test]
    fn resolve_path_handles_colon_space_and_bare_forms() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("devlink:plan", "@kb/devlink", CommandSource::Workspace));

        let colon = vec!["devlink".to_string(), "plan".to_string()];
        let (resolved, consumed) = registry.resolve_path(&colon).expect("resolve");
        assert!(matches!(resolved, Resolved::Command(_)));
        assert_eq!(consumed, 2);

        let bare = vec!["plan".to_string(), "extra-arg".to_string()];
        let (resolved, consumed) = registry.resolve_path(&bare).expect("resolve");
        assert!(matches!(resolved, Resolved::Command(_)));
        assert_eq!(consumed, 1);
    }

    #[test]
    fn resolve_path_matches_three_segment_ids_only_as_such() {
        let mut registry = Registry::new();
        registry.register_manifest(registered(
            "mind:index:rebuild",
            "@kb/mind",
            CommandSource::Workspace,
        ));

        let full = vec![
            "mind".to_string(),
            "index".to_string(),
            "rebuild".to_string(),
        ];
        let (resolved, consumed) = registry.resolve_path(&full).expect("resolve");
        assert!(matches!(resolved, Resolved::Command(_)));
        assert_eq!(consumed, 3);

        let partial = vec!["mind".to_string(), "index".to_string()];
        match registry.resolve_path(&partial) {
            Some((Resolved::Group(_), 1)) => {}
            other => panic!("expected group fallback, got {other:?}"),
        }
    }

    #[test]
    fn resolve_path_supports_legacy_dotted_form() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("init:profile", "@kb/init", CommandSource::Workspace));

        let dotted = vec!["init.profile".to_string()];
        let (resolved, consumed) = registry.resolve_path(&dotted).expect("resolve");
        assert!(matches!(resolved, Resolved::Command(_)));
        assert_eq!(consumed, 1);
    }

    #[test]
    fn group_only_match_returns_the_group() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("devlink:plan", "@kb/devlink", CommandSource::Workspace));
        registry.register_manifest(registered("devlink:apply", "@kb/devlink", CommandSource::Workspace));

        match registry.resolve_path(&["devlink".to_string()]) {
            Some((Resolved::Group(group), 1)) => {
                assert_eq!(group.commands.len(), 2);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn bare_manifest_registers_standalone() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("scaffold", "@kb/scaffold", CommandSource::Workspace));

        assert!(matches!(
            registry.lookup_key("scaffold"),
            Some(Resolved::Command(_))
        ));
        assert!(registry.list_groups().is_empty());
    }

    #[test]
    fn plain_command_with_matching_category_joins_the_group() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("devlink:plan", "@kb/devlink", CommandSource::Workspace));

        let mut m = manifest("devlink:status", "");
        m.group = Some("devlink".to_string());
        registry.register(Command::builtin(m, Arc::new(NoopHandler)));

        let commands = registry.commands_by_group("devlink");
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn product_groups_exclude_builtin_only_groups() {
        let mut registry = Registry::new();
        let mut group = CommandGroup::with_describe("plugins", "Plugin management");
        group
            .commands
            .insert("list".to_string(), builtin("plugins:list", &[]));
        registry.register_group(group);
        registry.register_manifest(registered("devlink:plan", "@kb/devlink", CommandSource::Workspace));

        let product: Vec<&str> = registry
            .list_product_groups()
            .iter()
            .map(|g| g.name.as_str())
            .collect();
        assert_eq!(product, vec!["devlink"]);
        assert_eq!(registry.list_groups().len(), 2);
    }

    #[test]
    fn exactly_one_non_shadowed_manifest_per_id() {
        let mut registry = Registry::new();
        registry.register_manifest(registered("x:y", "@a/one", CommandSource::NodeModules));
        registry.register_manifest(registered("x:y", "@b/two", CommandSource::Workspace));
        registry.register_manifest(registered("x:y", "@c/three", CommandSource::Linked));

        let authoritative: Vec<_> = registry
            .list_manifests()
            .into_iter()
            .filter(|rc| !rc.shadowed)
            .collect();
        assert_eq!(authoritative.len(), 1);
        assert_eq!(authoritative[0].package_name(), "@b/two");
        assert!(registry.shadowed_manifests().iter().all(|rc| rc.shadowed));
    }

    #[test]
    fn partial_flag_round_trips() {
        let mut registry = Registry::new();
        assert!(!registry.is_partial());
        registry.mark_partial(true);
        assert!(registry.is_partial());
    }
}
