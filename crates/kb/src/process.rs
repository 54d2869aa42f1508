//! Subprocess handler execution.
//!
//! Plugin commands never run in the host process. A manifest's loader
//! names a program; the dispatcher spawns it with the package root as the
//! working directory, writes a single [`ProtocolRequest`] line to its
//! stdin, and waits — bounded by the per-command timeout — for the process
//! to exit. The last stdout line that parses as a [`ProtocolResult`] is
//! the handler's result; every other stdout line is passed through as
//! handler output.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use kb_types::{ProtocolRequest, ProtocolResult};

/// Output of one subprocess handler invocation.
#[derive(Debug, Clone)]
pub struct ProtocolOutput {
    /// The parsed protocol result, when the handler produced one.
    pub result: Option<ProtocolResult>,
    /// Non-protocol stdout lines, in order.
    pub lines: Vec<String>,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Run a protocol handler to completion or until `timeout` elapses. On
/// timeout the child is killed; unlike in-process handlers there is no
/// abandoned work left behind.
pub fn run_protocol_handler(
    program: &str,
    args: &[String],
    working_dir: &Path,
    request: &ProtocolRequest,
    timeout: Duration,
) -> Result<ProtocolOutput> {
    let start = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn handler process {program}"))?;

    let request_line =
        serde_json::to_string(request).context("failed to serialize handler request")?;
    if let Some(mut stdin) = child.stdin.take() {
        // A handler that exits without reading its stdin closes the pipe;
        // the write error is irrelevant at that point.
        let _ = writeln!(stdin, "{request_line}");
    }

    let deadline = Instant::now() + timeout;
    let (exit_code, timed_out) = loop {
        match child.try_wait().context("failed to poll handler process")? {
            Some(status) => break (status.code().unwrap_or(-1), false),
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break (-1, true);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }

    let stdout = String::from_utf8_lossy(&stdout_bytes).to_string();
    let (result, lines) = split_protocol_output(&stdout);

    Ok(ProtocolOutput {
        result,
        lines,
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Separate the protocol result line from passthrough output. The result
/// is the last parseable line so handlers can stream progress before it.
fn split_protocol_output(stdout: &str) -> (Option<ProtocolResult>, Vec<String>) {
    let mut result = None;
    let mut result_idx = None;

    for (idx, line) in stdout.lines().enumerate() {
        if let Ok(parsed) = serde_json::from_str::<ProtocolResult>(line) {
            result = Some(parsed);
            result_idx = Some(idx);
        }
    }

    let lines = stdout
        .lines()
        .enumerate()
        .filter(|(idx, line)| Some(*idx) != result_idx && !line.is_empty())
        .map(|(_, line)| line.to_string())
        .collect();

    (result, lines)
}
