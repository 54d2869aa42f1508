//! Supervised command dispatch.
//!
//! `run` is the public contract: resolve argv against the registry, gate
//! on availability and permissions, lazily load the handler, race it
//! against the per-command timeout, and account the outcome (telemetry on
//! success, crash counters and a structured report on failure).
//!
//! Handlers never see the registry itself; everything they may touch
//! arrives through [`CommandContext`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;

use kb_state::QUARANTINE_THRESHOLD;
use kb_types::{
    CliFailure, CommandSource, CrashReport, DEFAULT_CAPABILITIES, ErrorBody, ErrorKind,
    ExecutionRecord, FlagSpec, FlagType, GlobalFlags, HandlerOutcome, JsonEnvelope,
    ProtocolRequest, RegisteredCommand, Timing,
};

use crate::help::{self, IntrospectionSnapshot};
use crate::hooks::ShutdownHooks;
use crate::process;
use crate::registry::{Command, HandlerRef, Resolved};
use crate::session::Session;

/// Hard wall-clock limit for one handler invocation.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Progress/diagnostic sink threaded through discovery and dispatch.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Thread-safe wrapper so a reporter can cross the handler thread
/// boundary.
#[derive(Clone)]
pub struct SharedReporter {
    inner: Arc<Mutex<Box<dyn Reporter + Send>>>,
}

impl SharedReporter {
    pub fn new(reporter: Box<dyn Reporter + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(reporter)),
        }
    }

    pub fn info(&self, msg: &str) {
        if let Ok(mut r) = self.inner.lock() {
            r.info(msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        if let Ok(mut r) = self.inner.lock() {
            r.warn(msg);
        }
    }

    pub fn error(&self, msg: &str) {
        if let Ok(mut r) = self.inner.lock() {
            r.error(msg);
        }
    }
}

impl Reporter for SharedReporter {
    fn info(&mut self, msg: &str) {
        SharedReporter::info(self, msg);
    }

    fn warn(&mut self, msg: &str) {
        SharedReporter::warn(self, msg);
    }

    fn error(&mut self, msg: &str) {
        SharedReporter::error(self, msg);
    }
}

/// Everything a handler may reach. Handlers access host services only
/// through this bag; in particular the registry is visible solely as the
/// read-only introspection snapshot.
#[derive(Clone)]
pub struct CommandContext {
    pub workspace_root: PathBuf,
    pub globals: GlobalFlags,
    pub reporter: SharedReporter,
    /// Cooperative deadline; the hard race at the handler boundary fires
    /// regardless of whether the handler honors it.
    pub deadline: Option<Instant>,
    pub host_version: String,
    pub profile: Option<String>,
    pub introspection: IntrospectionSnapshot,
    pub loader_cache: LoaderCache,
    pub hooks: ShutdownHooks,
}

/// The contract every command satisfies, built-in or plugin-backed.
pub trait CommandHandler: Send + Sync {
    fn run(
        &self,
        ctx: &mut CommandContext,
        argv: &[String],
        flags: &mut BTreeMap<String, Value>,
    ) -> Result<HandlerOutcome>;
}

/// A lazily resolved plugin entry point.
#[derive(Debug, Clone)]
pub struct ResolvedLoader {
    pub command_id: String,
    pub package: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// Cache of resolved plugin loaders, shared for the process lifetime and
/// clearable via `plugins:cache-clear --deep`.
#[derive(Clone, Default)]
pub struct LoaderCache {
    inner: Arc<Mutex<BTreeMap<String, Arc<ResolvedLoader>>>>,
}

impl LoaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, command_id: &str) -> Option<Arc<ResolvedLoader>> {
        self.inner
            .lock()
            .ok()
            .and_then(|cache| cache.get(command_id).cloned())
    }

    pub fn insert(&self, loader: Arc<ResolvedLoader>) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.insert(loader.command_id.clone(), loader);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one invocation produced, ready for the presenter.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub exit_code: i32,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub envelope: JsonEnvelope,
}

impl DispatchOutcome {
    fn new(exit_code: i32, envelope: JsonEnvelope) -> Self {
        Self {
            exit_code,
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            envelope,
        }
    }
}

/// Normalize the command path. A first token containing `:` that splits
/// into two or more non-empty segments becomes those segments; anything
/// else passes through unchanged.
pub fn normalize_tokens(tokens: &[String]) -> Vec<String> {
    let Some(first) = tokens.first() else {
        return Vec::new();
    };
    if first.contains(':') {
        let parts: Vec<&str> = first.split(':').collect();
        if parts.len() >= 2 && parts.iter().all(|p| !p.is_empty()) {
            let mut out: Vec<String> = parts.into_iter().map(str::to_string).collect();
            out.extend(tokens[1..].iter().cloned());
            return out;
        }
    }
    tokens.to_vec()
}

/// Parser-layer flag error (exit code 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagError {
    pub flag: String,
    pub message: String,
}

fn kebab_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Parse command-level flags against the manifest's declarations. Unknown
/// flags pass through (boolean, or string when given as `--flag=value`);
/// declared flags are coerced to their declared type. Returns the flag map
/// and the positional argv.
pub fn parse_flags(
    specs: &[FlagSpec],
    args: &[String],
) -> Result<(BTreeMap<String, Value>, Vec<String>), FlagError> {
    let mut flags: BTreeMap<String, Value> = BTreeMap::new();
    let mut positionals: Vec<String> = Vec::new();

    let find_by_name = |name: &str| {
        specs
            .iter()
            .find(|s| s.name == name || s.name == kebab_to_camel(name))
    };
    let find_by_alias =
        |alias: &str| specs.iter().find(|s| s.alias.as_deref() == Some(alias));

    let mut idx = 0;
    while idx < args.len() {
        let arg = &args[idx];
        idx += 1;

        if arg == "--" {
            positionals.extend(args[idx..].iter().cloned());
            break;
        }

        let (spec, raw_name, inline) = if let Some(rest) = arg.strip_prefix("--") {
            let (name, inline) = match rest.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (rest, None),
            };
            (find_by_name(name), name.to_string(), inline)
        } else if let Some(rest) = arg.strip_prefix('-') {
            if rest.is_empty() {
                positionals.push(arg.clone());
                continue;
            }
            (find_by_alias(rest), rest.to_string(), None)
        } else {
            positionals.push(arg.clone());
            continue;
        };

        match spec {
            Some(spec) => {
                let value = match spec.flag_type {
                    FlagType::Boolean => match inline.as_deref() {
                        None => Value::Bool(true),
                        Some("true") => Value::Bool(true),
                        Some("false") => Value::Bool(false),
                        Some(other) => {
                            return Err(FlagError {
                                flag: spec.name.clone(),
                                message: format!(
                                    "invalid boolean value '{other}' for --{raw_name}"
                                ),
                            });
                        }
                    },
                    FlagType::String | FlagType::Number | FlagType::Array => {
                        let raw = match inline {
                            Some(v) => v,
                            None => {
                                let Some(next) = args.get(idx) else {
                                    return Err(FlagError {
                                        flag: spec.name.clone(),
                                        message: format!("missing value for --{raw_name}"),
                                    });
                                };
                                idx += 1;
                                next.clone()
                            }
                        };
                        coerce_value(spec, &raw_name, raw)?
                    }
                };

                if let Some(choices) = &spec.choices
                    && let Value::String(s) = &value
                    && !choices.contains(s)
                {
                    return Err(FlagError {
                        flag: spec.name.clone(),
                        message: format!(
                            "invalid value '{s}' for --{raw_name} (choices: {})",
                            choices.join(", ")
                        ),
                    });
                }

                if spec.flag_type == FlagType::Array {
                    let entry = flags
                        .entry(spec.name.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(items) = entry {
                        items.push(value);
                    }
                } else {
                    flags.insert(spec.name.clone(), value);
                }
            }
            None => {
                let name = kebab_to_camel(&raw_name);
                match inline {
                    Some(v) => flags.insert(name, Value::String(v)),
                    None => flags.insert(name, Value::Bool(true)),
                };
            }
        }
    }

    for spec in specs {
        if !flags.contains_key(&spec.name) {
            if let Some(default) = &spec.default {
                flags.insert(spec.name.clone(), default.clone());
            } else if spec.required {
                return Err(FlagError {
                    flag: spec.name.clone(),
                    message: format!("missing required flag --{}", spec.name),
                });
            }
        }
    }

    Ok((flags, positionals))
}

fn coerce_value(spec: &FlagSpec, raw_name: &str, raw: String) -> Result<Value, FlagError> {
    match spec.flag_type {
        FlagType::Number => {
            if let Ok(int) = raw.parse::<i64>() {
                Ok(Value::from(int))
            } else if let Ok(float) = raw.parse::<f64>() {
                Ok(Value::from(float))
            } else {
                Err(FlagError {
                    flag: spec.name.clone(),
                    message: format!("invalid number '{raw}' for --{raw_name}"),
                })
            }
        }
        _ => Ok(Value::String(raw)),
    }
}

enum LoadedHandler {
    Builtin(Arc<dyn CommandHandler>),
    Subprocess(Arc<ResolvedLoader>),
}

/// Dispatch one invocation. This is the `run(argv, ctx) → exit code`
/// contract; the returned outcome additionally carries the presenter
/// payloads.
pub fn run(session: &mut Session, raw_tokens: &[String]) -> DispatchOutcome {
    let started = Instant::now();
    let started_at = Utc::now();
    let globals = session.globals.clone();

    if globals.version {
        let envelope = JsonEnvelope::success(Some(
            serde_json::json!({"version": session.host_version}),
        ));
        let mut outcome = DispatchOutcome::new(0, envelope);
        outcome.stdout_lines.push(session.host_version.clone());
        return outcome;
    }

    let tokens = normalize_tokens(raw_tokens);

    if globals.help || tokens.is_empty() {
        return help_outcome(session, &tokens);
    }

    // Resolve, then immediately detach from the registry borrow so crash
    // accounting can mutate state below.
    let resolved: Option<(Command, Option<RegisteredCommand>, usize)> =
        match session.registry.resolve_path(&tokens) {
            None => None,
            Some((Resolved::Group(group), consumed)) => {
                let rest = &tokens[consumed..];
                if let Some(next) = rest.first()
                    && !next.starts_with('-')
                {
                    let path = format!("{} {next}", group.name);
                    return not_found(&path);
                }
                let group_help = help::build_group_help(
                    &session.registry,
                    group,
                    &session.skipped,
                    globals.only_available,
                );
                let envelope =
                    JsonEnvelope::success(serde_json::to_value(&group_help).ok());
                let mut outcome = DispatchOutcome::new(0, envelope);
                outcome.stdout_lines = help::render_group_help(&group_help);
                return outcome;
            }
            Some((Resolved::Command(cmd), consumed)) => {
                let rc = session.registry.manifest(cmd.id()).cloned();
                Some((cmd.clone(), rc, consumed))
            }
        };

    let Some((cmd, rc, consumed)) = resolved else {
        return not_found(&tokens.join(" "));
    };

    // Availability gate.
    if let Some(rc) = &rc
        && !rc.available
    {
        let reason = rc
            .unavailable_reason
            .clone()
            .unwrap_or_else(|| "command unavailable".to_string());
        let message = format!("{}: {reason}", cmd.id());
        let mut outcome = DispatchOutcome::new(
            ErrorKind::CmdUnavailable.exit_code(),
            JsonEnvelope::failure(ErrorKind::CmdUnavailable, &message, None),
        );
        outcome.stderr_lines.push(format!("error: {message}"));
        if let Some(hint) = &rc.hint {
            outcome.stderr_lines.push(format!("hint: {hint}"));
        }
        return outcome;
    }

    // Permission gate. Built-ins are host code and carry no grants.
    if cmd.source != CommandSource::Builtin {
        let required = &cmd.manifest.permissions;
        let granted = session
            .state
            .granted_permissions(cmd.manifest.package.as_str());
        let missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|cap| !DEFAULT_CAPABILITIES.contains(cap) && !granted.contains(*cap))
            .collect();
        if !missing.is_empty() {
            let message = format!(
                "{} requires capabilities not granted to {}: {}",
                cmd.id(),
                cmd.manifest.package,
                missing.join(", ")
            );
            let hint = format!(
                "run: kb plugins:grant {} {}",
                cmd.manifest.package,
                missing.join(" ")
            );
            let mut outcome = DispatchOutcome::new(
                ErrorKind::PermissionDenied.exit_code(),
                JsonEnvelope::failure(ErrorKind::PermissionDenied, &message, None),
            );
            outcome.stderr_lines.push(format!("error: {message}"));
            outcome.stderr_lines.push(format!("hint: {hint}"));
            return outcome;
        }
    }

    // Parser layer: coerce command flags against the declarations.
    let specs = effective_flag_specs(&cmd);
    let rest = &tokens[consumed..];
    let (mut flags, argv) = match parse_flags(&specs, rest) {
        Ok(parsed) => parsed,
        Err(e) => {
            let mut outcome = DispatchOutcome::new(
                3,
                JsonEnvelope {
                    ok: false,
                    data: None,
                    error: Some(ErrorBody {
                        code: "INVALID_FLAG".to_string(),
                        message: e.message.clone(),
                        details: None,
                    }),
                    warnings: Vec::new(),
                    diagnostics: Vec::new(),
                    timing: None,
                },
            );
            outcome.stderr_lines.push(format!("error: {}", e.message));
            return outcome;
        }
    };
    globals.merge_into(&mut flags);

    // Lazy handler load.
    let handler = match load_handler(session, &cmd, rc.as_ref()) {
        Ok(handler) => handler,
        Err(e) => {
            return fail_dispatch(session, &cmd, e, started, started_at);
        }
    };

    // Supervised run: race the handler against the hard timeout.
    let ctx = CommandContext {
        workspace_root: session.workspace_root.clone(),
        globals: globals.clone(),
        reporter: session.reporter.clone(),
        deadline: Some(started + session.command_timeout),
        host_version: session.host_version.clone(),
        profile: session.profile.clone(),
        introspection: help::build_snapshot(&session.registry, &session.skipped, &session.state),
        loader_cache: session.loader_cache.clone(),
        hooks: session.hooks.clone(),
    };

    let timeout = session.command_timeout;
    let (tx, rx) = mpsc::channel::<Result<HandlerOutcome>>();
    match handler {
        LoadedHandler::Builtin(handler) => {
            let mut ctx = ctx;
            let argv = argv.clone();
            let mut flags = flags.clone();
            thread::spawn(move || {
                let result = handler.run(&mut ctx, &argv, &mut flags);
                let _ = tx.send(result);
            });
        }
        LoadedHandler::Subprocess(loader) => {
            let request = ProtocolRequest {
                argv: argv.clone(),
                flags: flags.clone(),
                env: subprocess_env(&ctx),
            };
            thread::spawn(move || {
                let result = run_subprocess(&loader, &request, timeout);
                let _ = tx.send(result);
            });
        }
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(outcome)) => {
            record_telemetry(session, &cmd, started.elapsed(), outcome.exit_code == 0, None);
            success_outcome(&globals, outcome, started, started_at)
        }
        Ok(Err(e)) => fail_dispatch(session, &cmd, e, started, started_at),
        Err(RecvTimeoutError::Timeout) => {
            // The race is lost; an in-process handler thread may still be
            // running, which is acceptable for a short-lived CLI process.
            let e = anyhow::Error::new(
                CliFailure::new(
                    ErrorKind::ExecutionTimeout,
                    format!(
                        "{} did not finish within {}",
                        cmd.id(),
                        humantime::format_duration(timeout)
                    ),
                )
                .with_hint("re-run with --verbose for handler output"),
            );
            fail_dispatch(session, &cmd, e, started, started_at)
        }
        Err(RecvTimeoutError::Disconnected) => {
            let e = anyhow::Error::new(CliFailure::new(
                ErrorKind::HandlerFailed,
                format!("{} handler terminated without a result", cmd.id()),
            ));
            fail_dispatch(session, &cmd, e, started, started_at)
        }
    }
}

fn help_outcome(session: &Session, tokens: &[String]) -> DispatchOutcome {
    if !tokens.is_empty() {
        match session.registry.resolve_path(tokens) {
            Some((Resolved::Command(cmd), _)) => {
                let cmd_help = help::build_command_help(&session.registry, cmd);
                let envelope = JsonEnvelope::success(serde_json::to_value(&cmd_help).ok());
                let mut outcome = DispatchOutcome::new(0, envelope);
                outcome.stdout_lines = help::render_command_help(&cmd_help);
                return outcome;
            }
            Some((Resolved::Group(group), _)) => {
                let group_help = help::build_group_help(
                    &session.registry,
                    group,
                    &session.skipped,
                    session.globals.only_available,
                );
                let envelope = JsonEnvelope::success(serde_json::to_value(&group_help).ok());
                let mut outcome = DispatchOutcome::new(0, envelope);
                outcome.stdout_lines = help::render_group_help(&group_help);
                return outcome;
            }
            None => {}
        }
    }

    let global_help = help::build_global_help(
        &session.registry,
        &session.skipped,
        &session.host_version,
        session.globals.only_available,
    );
    let envelope = JsonEnvelope::success(serde_json::to_value(&global_help).ok());
    let mut outcome = DispatchOutcome::new(0, envelope);
    outcome.stdout_lines = help::render_global_help(&global_help);
    outcome
}

fn not_found(path: &str) -> DispatchOutcome {
    let message = format!("Unknown command: {path}");
    let mut outcome = DispatchOutcome::new(
        ErrorKind::CmdNotFound.exit_code(),
        JsonEnvelope::failure(ErrorKind::CmdNotFound, &message, None),
    );
    outcome.stderr_lines.push(message);
    outcome
        .stderr_lines
        .push("hint: run `kb --help` to list available commands".to_string());
    outcome
}

/// Flag declarations that apply to this dispatch. A v2 manifest's
/// subcommand entry overrides the flat manifest flags when present.
fn effective_flag_specs(cmd: &Command) -> Vec<FlagSpec> {
    if let Some(v2) = &cmd.manifest.manifest_v2
        && let Some(cli) = &v2.cli
        && let Some(sub) = cli.commands.iter().find(|c| c.name == cmd.name())
        && !sub.flags.is_empty()
    {
        return sub.flags.clone();
    }
    cmd.manifest.flags.clone()
}

fn load_handler(
    session: &Session,
    cmd: &Command,
    rc: Option<&RegisteredCommand>,
) -> Result<LoadedHandler> {
    match &cmd.handler {
        HandlerRef::Builtin(handler) => Ok(LoadedHandler::Builtin(handler.clone())),
        HandlerRef::Manifest(id) => {
            if let Some(cached) = session.loader_cache.get(id) {
                return Ok(LoadedHandler::Subprocess(cached));
            }

            let rc = rc.ok_or_else(|| {
                anyhow::Error::new(CliFailure::new(
                    ErrorKind::HandlerLoadFailed,
                    format!("no manifest registered for {id}"),
                ))
            })?;

            // v2 manifests route through the subcommand table; a manifest
            // that advertises a CLI block without this command is broken.
            if let Some(v2) = &rc.manifest.manifest_v2
                && let Some(cli) = &v2.cli
                && !cli.commands.iter().any(|c| c.name == cmd.name())
            {
                return Err(anyhow::Error::new(
                    CliFailure::new(
                        ErrorKind::HandlerLoadFailed,
                        format!(
                            "v2 manifest of {} declares no cli command named {}",
                            rc.manifest.package,
                            cmd.name()
                        ),
                    )
                    .with_hint("the plugin's manifest.v2 cli.commands[] is incomplete"),
                ));
            }

            let loader = rc.manifest.loader.as_ref().ok_or_else(|| {
                anyhow::Error::new(
                    CliFailure::new(
                        ErrorKind::HandlerLoadFailed,
                        format!("{} provides no executable entry", rc.manifest.package),
                    )
                    .with_hint("the package manifest is missing a loader"),
                )
            })?;

            let pkg_root = rc
                .pkg_root
                .clone()
                .unwrap_or_else(|| session.workspace_root.clone());
            let program = if loader.program.contains('/') {
                let p = PathBuf::from(&loader.program);
                if p.is_absolute() {
                    loader.program.clone()
                } else {
                    pkg_root.join(&loader.program).to_string_lossy().into_owned()
                }
            } else {
                loader.program.clone()
            };

            let resolved = Arc::new(ResolvedLoader {
                command_id: id.clone(),
                package: rc.manifest.package.clone(),
                program,
                args: loader.args.clone(),
                working_dir: pkg_root,
            });
            session.loader_cache.insert(resolved.clone());
            Ok(LoadedHandler::Subprocess(resolved))
        }
    }
}

fn subprocess_env(ctx: &CommandContext) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("CLI_VERSION".to_string(), ctx.host_version.clone());
    env.insert(
        "KB_WORKSPACE_ROOT".to_string(),
        ctx.workspace_root.to_string_lossy().into_owned(),
    );
    if let Some(profile) = &ctx.profile {
        env.insert("KB_PROFILE".to_string(), profile.clone());
    }
    env
}

fn run_subprocess(
    loader: &ResolvedLoader,
    request: &ProtocolRequest,
    timeout: Duration,
) -> Result<HandlerOutcome> {
    let output = process::run_protocol_handler(
        &loader.program,
        &loader.args,
        &loader.working_dir,
        request,
        timeout,
    )
    .map_err(|e| {
        e.context(CliFailure::new(
            ErrorKind::HandlerLoadFailed,
            format!("failed to start handler for {}", loader.command_id),
        ))
    })?;

    if output.timed_out {
        return Err(anyhow::Error::new(CliFailure::new(
            ErrorKind::ExecutionTimeout,
            format!(
                "{} handler killed after {}",
                loader.command_id,
                humantime::format_duration(timeout)
            ),
        )));
    }

    let mut outcome = HandlerOutcome::ok();
    outcome.lines = output.lines;
    outcome
        .diagnostics
        .extend(output.stderr.lines().map(str::to_string));

    match output.result {
        Some(result) => {
            outcome.exit_code = result.exit_code;
            outcome.data = result.data;
            outcome.diagnostics.extend(
                result
                    .events
                    .iter()
                    .filter_map(|e| serde_json::to_string(e).ok()),
            );
            Ok(outcome)
        }
        None if output.exit_code == 0 => Ok(outcome),
        None => Err(anyhow::Error::new(CliFailure::new(
            ErrorKind::HandlerFailed,
            format!(
                "{} handler exited with code {} without a result",
                loader.command_id, output.exit_code
            ),
        ))),
    }
}

fn success_outcome(
    globals: &GlobalFlags,
    outcome: HandlerOutcome,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
) -> DispatchOutcome {
    let mut envelope = match outcome.data {
        Some(data) => JsonEnvelope::wrap(data),
        None => JsonEnvelope::success(None),
    };
    if outcome.exit_code != 0 {
        envelope.ok = false;
    }
    envelope.warnings.extend(outcome.warnings.iter().cloned());
    envelope
        .diagnostics
        .extend(outcome.diagnostics.iter().cloned());
    if globals.verbose || globals.debug {
        envelope.timing = Some(Timing {
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    let mut dispatch = DispatchOutcome::new(outcome.exit_code, envelope);
    dispatch.stdout_lines = outcome.lines;
    dispatch
        .stderr_lines
        .extend(outcome.warnings.iter().map(|w| format!("warning: {w}")));
    if globals.verbose || globals.debug {
        dispatch
            .stderr_lines
            .extend(outcome.diagnostics.iter().cloned());
    }
    dispatch
}

fn fail_dispatch(
    session: &mut Session,
    cmd: &Command,
    error: anyhow::Error,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
) -> DispatchOutcome {
    let (kind, hint) = match error.downcast_ref::<CliFailure>() {
        Some(failure) => (failure.kind, failure.hint.clone()),
        None => (ErrorKind::HandlerFailed, None),
    };

    let frames: Vec<String> = error.chain().map(|cause| cause.to_string()).collect();
    let message = frames.first().cloned().unwrap_or_else(|| "unknown error".to_string());

    record_telemetry(
        session,
        cmd,
        started.elapsed(),
        false,
        Some(kind.code().to_string()),
    );

    let package = cmd.manifest.package.clone();
    let mut crash_hint = hint.clone();
    if !package.is_empty() {
        let count = session.state.record_crash(&package);
        if let Err(e) = session.state_store.save(&mut session.state) {
            session
                .reporter
                .warn(&format!("failed to persist crash state: {e:#}"));
        }
        if count == QUARANTINE_THRESHOLD {
            session.reporter.warn(&format!(
                "{package} disabled after {count} crashes; run `kb plugins:reset-crashes {package}` to restore it"
            ));
            crash_hint.get_or_insert_with(|| {
                format!("run: kb plugins:reset-crashes {package}")
            });
        }

        let report = CrashReport {
            command_id: cmd.id().to_string(),
            package: package.clone(),
            cli_version: session.host_version.clone(),
            runtime_version: session.runtime_version.clone(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            error_code: kind.code().to_string(),
            frames: frames.iter().take(8).cloned().collect(),
            hint: crash_hint.clone(),
            occurred_at: started_at,
        };
        persist_crash_report(session, &report);
    }

    let mut envelope = JsonEnvelope::failure(kind, &message, None);
    if session.globals.verbose || session.globals.debug {
        envelope.timing = Some(Timing {
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        envelope.diagnostics = frames.clone();
    }

    let mut outcome = DispatchOutcome::new(kind.exit_code(), envelope);
    outcome.stderr_lines.push(format!("error: {message}"));
    if let Some(hint) = crash_hint {
        outcome.stderr_lines.push(format!("hint: {hint}"));
    }
    // The full frame listing is longer than a screen for deep chains;
    // keep it behind --verbose/--debug.
    if (session.globals.verbose || session.globals.debug) && frames.len() > 1 {
        for frame in &frames[1..] {
            outcome.stderr_lines.push(format!("  caused by: {frame}"));
        }
    }
    outcome
}

fn persist_crash_report(session: &Session, report: &CrashReport) {
    let dir = kb_state::state_dir(&session.workspace_root).join("crashes");
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let name: String = report
        .package
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let Ok(json) = serde_json::to_string_pretty(report) else {
        return;
    };
    let _ = std::fs::write(dir.join(format!("{name}.json")), json);
}

fn record_telemetry(
    session: &Session,
    cmd: &Command,
    duration: Duration,
    success: bool,
    error_code: Option<String>,
) {
    let record = ExecutionRecord {
        command_id: cmd.id().to_string(),
        duration_ms: duration.as_millis() as u64,
        success,
        error_code,
        timestamp: Utc::now(),
    };
    for recorder in &session.recorders {
        recorder.record_execution(&record);
    }
}
