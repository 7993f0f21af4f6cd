//! Command execution for the local protocol
//!
//! Handles:
//! - shell-free argument splitting (`shell-words`)
//! - execution with a time limit, terminating the child on expiry
//! - turning command output into table rows

use anyhow::{anyhow, Context, Result};
use process_control::{ChildExt, Control};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

/// Command execution result
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub exit_code: Option<i64>,
    pub execution_time_ms: u128,
}

/// Runs `command` without a shell. Stderr is appended to stdout.
pub fn execute(command: &str, timeout: Duration) -> Result<ExecutionResult> {
    let start_time = Instant::now();
    let words = shell_words::split(command).with_context(|| format!("cannot split command line: {command}"))?;
    let (program, args) = words.split_first().ok_or_else(|| anyhow!("empty command line"))?;

    debug!("Executing command: {} (timeout: {:?})", command, timeout);
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("cannot start {program}"))?;

    let output = child
        .controlled_with_output()
        .time_limit(timeout)
        .terminate_for_timeout()
        .wait()?
        .ok_or_else(|| anyhow!("command timed out after {}s: {}", timeout.as_secs(), command))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ExecutionResult {
        success: output.status.success(),
        output: text,
        exit_code: output.status.code(),
        execution_time_ms: start_time.elapsed().as_millis(),
    })
}

/// Splits command output into rows.
///
/// Lines before `begin_at` (1-based) and after `end_at` are dropped, then
/// each line is split on any character of `separators` and only the
/// `select_columns` (1-based, all when empty) are kept.
pub fn output_to_rows(
    output: &str,
    begin_at: Option<usize>,
    end_at: Option<usize>,
    separators: Option<&str>,
    select_columns: &[usize],
) -> Vec<Vec<String>> {
    let first = begin_at.unwrap_or(1).max(1);
    let last = end_at.unwrap_or(usize::MAX);

    output
        .lines()
        .enumerate()
        .filter(|(i, _)| (first..=last).contains(&(i + 1)))
        .map(|(_, line)| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let cells: Vec<String> = match separators {
                Some(separators) if !separators.is_empty() => {
                    line.split(|c| separators.contains(c)).map(|s| s.trim().to_string()).collect()
                }
                _ => vec![line.to_string()],
            };
            if select_columns.is_empty() {
                cells
            } else {
                select_columns
                    .iter()
                    .map(|column| column.checked_sub(1).and_then(|i| cells.get(i)).cloned().unwrap_or_default())
                    .collect()
            }
        })
        .collect()
}
