//! Cleanup mode: runs no cases. It releases port reservations left by dead
//! harness processes and stops servers whose pid files remain under the
//! workdir.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::{CaseContext, Mode, ModeHandler};
use crate::ports::process_alive;
use crate::system::env::Environment;
use crate::system::{SystemError, SystemManager};
use crate::testing::{Execution, TestCase, TestStatus};

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupMode;

/// Every `*.pid` file under `root`.
fn pid_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping unreadable workdir entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("pid"))
        .collect()
}

fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// SIGTERM every live process named by a pid file under `root`.
/// Returns the pids signalled.
fn stop_leftover_servers(root: &Path) -> Vec<i32> {
    let mut stopped = Vec::new();
    for path in pid_files(root) {
        let Some(pid) = read_pid(&path) else {
            warn!(file = %path.display(), "pid file holds no pid");
            continue;
        };
        if !process_alive(pid) {
            continue;
        }
        // SAFETY: plain kill(2) on a pid read from a server pid file.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            info!(pid, file = %path.display(), "stopped leftover server");
            stopped.push(pid);
        } else {
            warn!(pid, error = %std::io::Error::last_os_error(), "failed to signal leftover server");
        }
    }
    stopped
}

#[async_trait]
impl ModeHandler for CleanupMode {
    fn mode(&self) -> Mode {
        Mode::Cleanup
    }

    async fn prepare_run(&self, system: &SystemManager) -> anyhow::Result<()> {
        let purged = system
            .port_manager
            .purge_stale()
            .context("failed to purge stale port reservations")?;
        let stopped = stop_leftover_servers(system.workdir());
        info!(ports = purged.len(), servers = stopped.len(), "cleanup complete");
        Ok(())
    }

    fn discover(&self, _system: &SystemManager) -> anyhow::Result<Vec<TestCase>> {
        Ok(Vec::new())
    }

    async fn execute_case(&self, _ctx: &CaseContext<'_>, _env: &Environment) -> Result<Execution, SystemError> {
        Ok(Execution::default())
    }

    fn classify_result(&self, _case: &TestCase, _execution: &Execution) -> TestStatus {
        TestStatus::Pass
    }
}
