//! Subprocess execution with captured output.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use super::env::Environment;
use super::SystemError;

/// Result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Stdout followed by stderr.
    pub output: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `argv` to completion. With `env` set, the child sees exactly that
/// environment; otherwise it inherits the harness environment.
pub async fn run_command(
    argv: &[String],
    env: Option<&Environment>,
    cwd: Option<&Path>,
) -> Result<CommandOutput, SystemError> {
    let mut cmd = build_command(argv, env, cwd)?;
    // Callers may abandon a run on timeout or interrupt.
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let started = Instant::now();
    let out = cmd.output().await.map_err(|source| SystemError::Spawn {
        command: display_command(argv),
        source,
    })?;

    let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&out.stderr));

    Ok(CommandOutput {
        code: out.status.code(),
        output,
        elapsed: started.elapsed(),
    })
}

/// Build a command without running it.
pub fn build_command(
    argv: &[String],
    env: Option<&Environment>,
    cwd: Option<&Path>,
) -> Result<Command, SystemError> {
    let (program, args) = argv.split_first().ok_or(SystemError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(env) = env {
        cmd.env_clear();
        cmd.envs(env);
    }
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    Ok(cmd)
}

pub fn display_command(argv: &[String]) -> String {
    argv.join(" ")
}
