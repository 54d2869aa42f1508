//! # Types
//!
//! Core domain types for the kb CLI plugin system: manifests, registered
//! commands, skip reasons, error kinds, and the JSON output envelope.
//!
//! This crate defines the data structures shared by every layer of the CLI:
//! - [`Manifest`] - A command descriptor contributed by a package
//! - [`RegisteredCommand`] - A manifest combined with runtime classification
//! - [`SkipReason`] / [`SkippedManifest`] - Preflight rejection accounting
//! - [`ErrorKind`] / [`CliFailure`] - The stable error taxonomy
//! - [`JsonEnvelope`] - The `--json` output contract
//! - [`GlobalFlags`] - Host-level flags merged into every handler invocation
//!
//! ## Serialization
//!
//! Manifest shapes mirror the `package.json` world they are loaded from and
//! therefore use camelCase field names on the wire. Everything that lands on
//! disk or on stdout round-trips through `serde`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capability names the host understands. A manifest requesting anything
/// outside this list is rejected during preflight with
/// [`SkipReason::UnknownPermission`].
pub const KNOWN_CAPABILITIES: &[&str] = &[
    "fs.read",
    "fs.write",
    "net.fetch",
    "proc.spawn",
    "env.read",
    "workspace.write",
];

/// Capabilities every command receives without an explicit grant.
pub const DEFAULT_CAPABILITIES: &[&str] = &["fs.read"];

/// Returns true when `name` is a capability the host understands.
pub fn is_known_capability(name: &str) -> bool {
    KNOWN_CAPABILITIES.contains(&name)
}

/// Value type of a declared command flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    Boolean,
    String,
    Number,
    Array,
}

/// A flag declaration carried by a manifest.
///
/// Declarations drive both help rendering and value coercion: a flag
/// declared as `number` whose argument does not parse is an invalid flag
/// value (parser-layer exit code 3), not a handler error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlagSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub describe: Option<String>,
}

impl Default for FlagSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            flag_type: FlagType::String,
            alias: None,
            default: None,
            required: false,
            choices: None,
            describe: None,
        }
    }
}

/// Module system a package declares for itself (`"type": "module"` → esm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Esm,
    Cjs,
}

/// Compatibility constraints a manifest may declare.
///
/// `node` is checked as `>=X.Y.Z` against the runtime baseline major;
/// `kb_cli` is checked as `^X.Y.Z` against the host version major. Other
/// range shapes are ignored rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kb_cli: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<ModuleKind>,
}

/// Entry point for a plugin-provided command implementation.
///
/// The host never loads plugin code in-process: a loader names a program
/// (resolved relative to the package root when not absolute) that speaks the
/// line-delimited JSON handler protocol on stdio. See [`ProtocolRequest`]
/// and [`ProtocolResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoaderSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for LoaderSpec {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
        }
    }
}

/// A single subcommand inside a v2 manifest's `cli.commands[]` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct V2Command {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub describe: Option<String>,
    pub aliases: Vec<String>,
    pub flags: Vec<FlagSpec>,
    pub examples: Vec<String>,
}

/// The CLI block of a v2 manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct V2Cli {
    pub commands: Vec<V2Command>,
}

/// Optional richer descriptor some packages ship alongside the flat
/// manifest fields. The `rest` blob preserves sections this host does not
/// interpret (REST surfaces, capability metadata for other tooling).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestV2 {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli: Option<V2Cli>,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rest: Option<Value>,
}

impl ManifestV2 {
    /// Short version badge derived from the schema identifier suffix, e.g.
    /// `"kb.dev/schemas/manifest.v2"` → `"v2"`.
    pub fn version_badge(&self) -> Option<String> {
        let schema = self.schema.as_deref()?;
        let tail = schema.rsplit(['/', '.']).next()?;
        if tail.is_empty() {
            None
        } else {
            Some(tail.to_string())
        }
    }
}

/// A command descriptor contributed by a package (or by the host itself for
/// built-ins).
///
/// The `id` is the canonical identity: colon-separated, typically
/// `group:command` (e.g. `devlink:plan`), occasionally deeper
/// (`group:sub:command`) or a bare name for standalone commands.
///
/// # Example
///
/// ```rust
/// use kb_types::Manifest;
///
/// let manifest: Manifest = serde_json::from_str(
///     r#"{"id": "devlink:plan", "describe": "Plan workspace links"}"#,
/// ).expect("parse");
/// assert_eq!(manifest.group_name(), Some("devlink"));
/// assert_eq!(manifest.command_name(), "plan");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub package: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub describe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    pub examples: Vec<String>,
    pub aliases: Vec<String>,
    pub flags: Vec<FlagSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSpec>,
    pub permissions: Vec<String>,
    pub requires: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader: Option<LoaderSpec>,
    #[serde(rename = "manifestV2", skip_serializing_if = "Option::is_none")]
    pub manifest_v2: Option<ManifestV2>,
}

impl Manifest {
    /// Colon-separated segments of the id. Empty segments are preserved so
    /// validation can reject malformed ids rather than silently repairing
    /// them.
    pub fn id_segments(&self) -> Vec<&str> {
        self.id.split(':').collect()
    }

    /// The group this command belongs to: the explicit `group` field, or
    /// the id prefix for colon-form ids. Bare-name commands have no group.
    pub fn group_name(&self) -> Option<&str> {
        if let Some(group) = self.group.as_deref()
            && !group.is_empty()
        {
            return Some(group);
        }
        let segments = self.id_segments();
        if segments.len() >= 2 {
            Some(segments[0])
        } else {
            None
        }
    }

    /// The name the command answers to inside its group (last id segment).
    pub fn command_name(&self) -> &str {
        self.id.rsplit(':').next().unwrap_or(self.id.as_str())
    }

    /// True for standalone commands whose id carries no group prefix.
    pub fn is_bare(&self) -> bool {
        !self.id.contains(':')
    }

    /// Space form of the id (`"devlink plan"` for `devlink:plan`).
    pub fn space_form(&self) -> String {
        self.id.replace(':', " ")
    }
}

/// Where a registered command came from. Order matters: this drives the
/// shadowing precedence `workspace > linked > node_modules`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Workspace,
    NodeModules,
    Linked,
    Builtin,
}

impl CommandSource {
    /// Shadowing rank; higher wins. Built-ins sit above every plugin
    /// source.
    pub fn precedence(&self) -> u8 {
        match self {
            CommandSource::Builtin => 4,
            CommandSource::Workspace => 3,
            CommandSource::Linked => 2,
            CommandSource::NodeModules => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CommandSource::Workspace => "workspace",
            CommandSource::NodeModules => "node_modules",
            CommandSource::Linked => "linked",
            CommandSource::Builtin => "builtin",
        }
    }
}

/// A manifest that survived preflight, combined with runtime
/// classification computed during registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredCommand {
    pub manifest: Manifest,
    pub source: CommandSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkg_root: Option<PathBuf>,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub shadowed: bool,
}

impl RegisteredCommand {
    pub fn new(manifest: Manifest, source: CommandSource, pkg_root: Option<PathBuf>) -> Self {
        Self {
            manifest,
            source,
            pkg_root,
            available: true,
            unavailable_reason: None,
            hint: None,
            shadowed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn package_name(&self) -> &str {
        &self.manifest.package
    }

    /// Mark the command discoverable-but-not-executable.
    pub fn mark_unavailable(&mut self, reason: impl Into<String>, hint: Option<String>) {
        self.available = false;
        self.unavailable_reason = Some(reason.into());
        self.hint = hint;
    }
}

/// Stable reason codes for manifests rejected before registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    MalformedId,
    NodeVersionMismatch,
    CliVersionMismatch,
    ModuleTypeMismatch,
    MissingPeerDep,
    UnknownPermission,
    #[serde(rename = "MANIFEST_LOAD_FAILED")]
    LoadFailed,
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::MalformedId => "MALFORMED_ID",
            SkipReason::NodeVersionMismatch => "NODE_VERSION_MISMATCH",
            SkipReason::CliVersionMismatch => "CLI_VERSION_MISMATCH",
            SkipReason::ModuleTypeMismatch => "MODULE_TYPE_MISMATCH",
            SkipReason::MissingPeerDep => "MISSING_PEER_DEP",
            SkipReason::UnknownPermission => "UNKNOWN_PERMISSION",
            SkipReason::LoadFailed => "MANIFEST_LOAD_FAILED",
        }
    }
}

/// A candidate manifest that preflight (or manifest loading) rejected.
/// Skipped candidates are never registered but are always reported, so the
/// CLI can show why a group is partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedManifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub package: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkg_root: Option<PathBuf>,
    pub reason: SkipReason,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// The dispatcher-layer error taxonomy. Codes are stable and travel inside
/// the JSON envelope; exit codes follow the external interface contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    CmdNotFound,
    CmdUnavailable,
    PermissionDenied,
    ManifestSkipped,
    HandlerLoadFailed,
    ExecutionTimeout,
    HandlerFailed,
    StateCorrupt,
    CacheCorrupt,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::CmdNotFound => "CMD_NOT_FOUND",
            ErrorKind::CmdUnavailable => "CMD_UNAVAILABLE",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::ManifestSkipped => "MANIFEST_SKIPPED",
            ErrorKind::HandlerLoadFailed => "HANDLER_LOAD_FAILED",
            ErrorKind::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorKind::HandlerFailed => "HANDLER_FAILED",
            ErrorKind::StateCorrupt => "STATE_CORRUPT",
            ErrorKind::CacheCorrupt => "CACHE_CORRUPT",
        }
    }

    /// Process exit code for a failure of this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::CmdUnavailable | ErrorKind::PermissionDenied => 2,
            _ => 1,
        }
    }
}

/// A typed dispatcher failure.
///
/// Handlers and stores return `anyhow::Error`; the dispatch layer wraps
/// taxonomy-relevant failures in this type so presenters can recover the
/// kind (and therefore the exit code and envelope error code) by
/// downcasting the chain.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CliFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: Option<String>,
    pub details: Option<Value>,
}

impl CliFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: None,
            details: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Error body of a failed JSON envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Timing block attached to JSON output when requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// The single JSON document every `--json` invocation emits on stdout.
///
/// `ok` is the only required key. Handler results that already carry a
/// top-level `ok` pass through unwrapped; anything else lands under `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonEnvelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub diagnostics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
}

impl JsonEnvelope {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            ok: true,
            data,
            error: None,
            warnings: Vec::new(),
            diagnostics: Vec::new(),
            timing: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: kind.code().to_string(),
                message: message.into(),
                details,
            }),
            warnings: Vec::new(),
            diagnostics: Vec::new(),
            timing: None,
        }
    }

    /// Wrap an arbitrary handler result. Objects that already carry a
    /// boolean `ok` at the top level are trusted as pre-built envelopes.
    pub fn wrap(value: Value) -> Self {
        if let Value::Object(ref map) = value
            && map.get("ok").is_some_and(Value::is_boolean)
            && let Ok(envelope) = serde_json::from_value::<JsonEnvelope>(value.clone())
        {
            return envelope;
        }
        Self::success(Some(value))
    }
}

/// Host-level flags recognized on any invocation and merged into every
/// handler's flag map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalFlags {
    pub json: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub debug: bool,
    pub help: bool,
    pub version: bool,
    pub only_available: bool,
    pub no_cache: bool,
    pub dry_run: bool,
    pub log_level: Option<String>,
}

impl GlobalFlags {
    /// Merge user-provided globals into a handler flag map. Only flags the
    /// user actually provided are inserted; nothing is invented and nothing
    /// the handler already has is overwritten with a default.
    pub fn merge_into(&self, flags: &mut BTreeMap<String, Value>) {
        let bools = [
            ("json", self.json),
            ("quiet", self.quiet),
            ("verbose", self.verbose),
            ("debug", self.debug),
            ("help", self.help),
            ("version", self.version),
            ("onlyAvailable", self.only_available),
            ("noCache", self.no_cache),
            ("dryRun", self.dry_run),
        ];
        for (name, provided) in bools {
            if provided {
                flags.insert(name.to_string(), Value::Bool(true));
            }
        }
        if let Some(level) = &self.log_level {
            flags.insert("logLevel".to_string(), Value::String(level.clone()));
        }
    }
}

/// Result of one in-process handler invocation.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub exit_code: i32,
    pub data: Option<Value>,
    pub lines: Vec<String>,
    pub warnings: Vec<String>,
    pub diagnostics: Vec<String>,
}

impl HandlerOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn warn(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Request line written to a subprocess handler's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolRequest {
    pub argv: Vec<String>,
    pub flags: BTreeMap<String, Value>,
    pub env: BTreeMap<String, String>,
}

/// Result line a subprocess handler prints on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolResult {
    pub exit_code: i32,
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One telemetry record per supervised execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub command_id: String,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Structured crash report emitted when a handler fails, times out, or
/// cannot be loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashReport {
    pub command_id: String,
    pub package: String,
    pub cli_version: String,
    pub runtime_version: String,
    pub platform: String,
    pub error_code: String,
    pub frames: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub occurred_at: DateTime<Utc>,
}
