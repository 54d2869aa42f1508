use std::path::PathBuf;

use clap::Parser;

use kb::dispatch::{self, Reporter, SharedReporter};
use kb::session::{self, SessionOptions};
use kb_types::{CliFailure, ErrorKind, GlobalFlags, JsonEnvelope};

#[derive(Parser, Debug)]
#[command(name = "kb", disable_help_flag = true, disable_version_flag = true)]
#[command(about = "Extensible command-line dispatcher for KB Labs workspaces")]
struct Cli {
    /// Workspace root (defaults to the current directory)
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Show help and exit
    #[arg(long)]
    help: bool,

    /// Print the host version and exit
    #[arg(long)]
    version: bool,

    /// Emit a single JSON document on stdout
    #[arg(long)]
    json: bool,

    /// Suppress non-summary output
    #[arg(long)]
    quiet: bool,

    /// Include timing and diagnostic output
    #[arg(long)]
    verbose: bool,

    /// Maximum verbosity
    #[arg(long)]
    debug: bool,

    /// Set the log level explicitly
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Bypass the manifest discovery cache
    #[arg(long = "no-cache")]
    no_cache: bool,

    /// Filter listings to available commands
    #[arg(long = "only-available")]
    only_available: bool,

    /// Advisory; propagated to the handler
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Command path and arguments (`group:cmd` or `group cmd`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

struct CliReporter {
    quiet: bool,
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        if !self.quiet {
            eprintln!("[info] {msg}");
        }
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let mut globals = GlobalFlags {
        json: cli.json,
        quiet: cli.quiet,
        verbose: cli.verbose,
        debug: cli.debug,
        help: cli.help,
        version: cli.version,
        only_available: cli.only_available,
        no_cache: cli.no_cache,
        dry_run: cli.dry_run,
        log_level: cli.log_level.clone(),
    };
    // Users put global flags after the command path at least as often as
    // before it; pull them out wherever they appear.
    let tokens = extract_globals(cli.rest, &mut globals);

    let workspace_root = if cli.workspace.is_absolute() {
        cli.workspace.clone()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&cli.workspace))
            .unwrap_or(cli.workspace.clone())
    };

    let reporter = SharedReporter::new(Box::new(CliReporter { quiet: globals.quiet }));
    let json_mode = globals.json;

    let opts = SessionOptions::from_env(workspace_root, globals);
    let mut session = match session::build_session(opts, reporter.clone()) {
        Ok(session) => session,
        Err(e) => return present_fatal(e, json_mode),
    };

    // One shutdown path: SIGINT/SIGTERM run the registered disposers once
    // and exit. Handlers that never return (watchers, REPLs) are
    // terminated through this hook only.
    let signal_hooks = session.hooks.clone();
    let _ = ctrlc::set_handler(move || {
        for err in signal_hooks.run() {
            eprintln!("[warn] shutdown hook failed: {err:#}");
        }
        std::process::exit(130);
    });

    let outcome = dispatch::run(&mut session, &tokens);

    if json_mode {
        match serde_json::to_string(&outcome.envelope) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("[error] failed to serialize output: {e}");
                return 1;
            }
        }
    } else {
        for line in &outcome.stdout_lines {
            println!("{line}");
        }
        for line in &outcome.stderr_lines {
            eprintln!("{line}");
        }
    }

    for err in session.hooks.run() {
        reporter.warn(&format!("shutdown hook failed: {err:#}"));
    }

    outcome.exit_code
}

fn present_fatal(error: anyhow::Error, json_mode: bool) -> i32 {
    let (kind, hint) = match error.downcast_ref::<CliFailure>() {
        Some(failure) => (failure.kind, failure.hint.clone()),
        None => (ErrorKind::HandlerFailed, None),
    };

    if json_mode {
        let envelope = JsonEnvelope::failure(kind, format!("{error:#}"), None);
        match serde_json::to_string(&envelope) {
            Ok(json) => println!("{json}"),
            Err(_) => eprintln!("[error] {error:#}"),
        }
    } else {
        eprintln!("[error] {error:#}");
        if let Some(hint) = hint {
            eprintln!("hint: {hint}");
        }
    }
    kind.exit_code()
}

/// Strip recognized global flags out of the trailing tokens, merging them
/// into `globals`. Everything after a literal `--` belongs to the handler.
fn extract_globals(tokens: Vec<String>, globals: &mut GlobalFlags) -> Vec<String> {
    let mut rest = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter();
    let mut passthrough = false;

    while let Some(token) = iter.next() {
        if passthrough {
            rest.push(token);
            continue;
        }
        match token.as_str() {
            "--" => {
                passthrough = true;
                rest.push(token);
            }
            "--help" => globals.help = true,
            "--version" => globals.version = true,
            "--json" => globals.json = true,
            "--quiet" => globals.quiet = true,
            "--verbose" => globals.verbose = true,
            "--debug" => globals.debug = true,
            "--no-cache" => globals.no_cache = true,
            "--only-available" => globals.only_available = true,
            "--dry-run" => globals.dry_run = true,
            "--log-level" => {
                globals.log_level = iter.next();
            }
            other => match other.strip_prefix("--log-level=") {
                Some(level) => globals.log_level = Some(level.to_string()),
                None => rest.push(token),
            },
        }
    }

    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extract_globals_pulls_flags_from_any_position() {
        let mut globals = GlobalFlags::default();
        let rest = extract_globals(
            strings(&["hello", "--json", "--verbose", "arg"]),
            &mut globals,
        );

        assert!(globals.json);
        assert!(globals.verbose);
        assert_eq!(rest, strings(&["hello", "arg"]));
    }

    #[test]
    fn extract_globals_handles_log_level_forms() {
        let mut globals = GlobalFlags::default();
        extract_globals(strings(&["--log-level", "debug"]), &mut globals);
        assert_eq!(globals.log_level.as_deref(), Some("debug"));

        let mut globals = GlobalFlags::default();
        extract_globals(strings(&["--log-level=trace"]), &mut globals);
        assert_eq!(globals.log_level.as_deref(), Some("trace"));
    }

    #[test]
    fn extract_globals_stops_at_double_dash() {
        let mut globals = GlobalFlags::default();
        let rest = extract_globals(
            strings(&["run", "--", "--json", "--quiet"]),
            &mut globals,
        );

        assert!(!globals.json);
        assert!(!globals.quiet);
        assert_eq!(rest, strings(&["run", "--", "--json", "--quiet"]));
    }

    #[test]
    fn extract_globals_leaves_handler_flags_alone() {
        let mut globals = GlobalFlags::default();
        let rest = extract_globals(
            strings(&["devlink:plan", "--depth", "3", "--json"]),
            &mut globals,
        );

        assert!(globals.json);
        assert_eq!(rest, strings(&["devlink:plan", "--depth", "3"]));
    }

    #[test]
    fn cli_reporter_levels_are_callable() {
        let mut reporter = CliReporter { quiet: false };
        reporter.info("i");
        reporter.warn("w");
        reporter.error("e");

        let mut quiet = CliReporter { quiet: true };
        quiet.info("suppressed");
    }
}
