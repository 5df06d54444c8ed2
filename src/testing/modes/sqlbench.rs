//! sql-bench and crash-me. Both run a script from the tree's `sql-bench`
//! directory and judge the result from a report file the script names in
//! its output, not from the exit code alone.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{load_case_files, run_logged_command, split_command, CaseContext, Mode, ModeHandler, ModeSettings};
use crate::system::env::Environment;
use crate::system::{SystemError, SystemManager};
use crate::testing::{CaseBody, Execution, TestCase, TestStatus};

/// Settings crash-me needs to get through a run against drizzled.
const CRASHME_CONFIG: &str = "\
func_extra_concat_as_+=no
max_text_size=1048576
where_string_size=1048576
select_string_size=1048576
";

fn sql_bench_dir(system: &SystemManager) -> PathBuf {
    system.code_tree.testdir.join("sql-bench")
}

fn command_cases(
    settings: &ModeSettings,
    system: &SystemManager,
    dirname: &str,
) -> anyhow::Result<Vec<TestCase>> {
    let mut roots = settings.suite_paths.clone();
    roots.push(system.code_tree.testdir.join(dirname));
    Ok(load_case_files(&roots, &settings.suites)?
        .iter()
        .map(|loaded| {
            loaded.to_case(CaseBody::Command {
                argv: loaded.file.test.command.split_whitespace().map(str::to_string).collect(),
            })
        })
        .collect())
}

/// The `index`th output line, trimmed, as a path.
fn named_report(output: &str, index: usize) -> Option<PathBuf> {
    let line = output.lines().nth(index)?.trim();
    (!line.is_empty()).then(|| PathBuf::from(line))
}

fn read_report(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!(report = %path.display(), error = %e, "could not read benchmark report");
            None
        }
    }
}

#[derive(Debug)]
pub struct SqlbenchMode {
    settings: ModeSettings,
}

impl SqlbenchMode {
    pub fn new(settings: ModeSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ModeHandler for SqlbenchMode {
    fn mode(&self) -> Mode {
        Mode::Sqlbench
    }

    fn discover(&self, system: &SystemManager) -> anyhow::Result<Vec<TestCase>> {
        let cases = command_cases(&self.settings, system, "sqlbench_tests")?;
        info!(count = cases.len(), "found sql-bench tests");
        Ok(cases)
    }

    /// The second output line names the run's report. Its contents are
    /// appended to the output so classification can look for failures.
    async fn execute_case(&self, ctx: &CaseContext<'_>, env: &Environment) -> Result<Execution, SystemError> {
        let CaseBody::Command { argv } = &ctx.case.body else {
            return Ok(Execution::default());
        };
        let argv = split_command(&argv.join(" "), env);
        let log = ctx.logdir.join("sqlbench.out");
        let mut exec = run_logged_command(&argv, env, Some(&sql_bench_dir(ctx.system)), &log).await?;

        match named_report(&exec.output, 1).and_then(|report| read_report(&report)) {
            Some(report) => {
                for line in report.lines().filter(|l| l.contains("Failed")) {
                    info!(test = %ctx.case.fullname(), "{}", line.trim());
                }
                exec.output.push_str(&report);
            }
            None => warn!(test = %ctx.case.fullname(), "sql-bench output names no readable report"),
        }
        Ok(exec)
    }

    fn classify_result(&self, _case: &TestCase, execution: &Execution) -> TestStatus {
        if execution.retcode == Some(0) && !execution.output.contains("Failed") {
            TestStatus::Pass
        } else {
            TestStatus::Fail
        }
    }

    fn resets_servers_after_case(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct CrashmeMode {
    settings: ModeSettings,
}

impl CrashmeMode {
    pub fn new(settings: ModeSettings) -> Self {
        Self { settings }
    }

    /// Write a fresh `drizzle.cfg` into the run's workdir.
    fn write_config(&self, system: &SystemManager) -> Result<PathBuf, SystemError> {
        let path = system.workdir().join("drizzle.cfg");
        if path.exists() {
            info!(path = %path.display(), "removing old crash-me config");
        }
        std::fs::write(&path, CRASHME_CONFIG).map_err(|e| SystemError::io(&path, e))?;
        Ok(path)
    }
}

/// Lines of every `=error` section in a crash-me report. A section runs
/// from the `=error` line through the `#` comment lines that follow it.
fn error_sections(report: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut in_section = false;
    for line in report.lines() {
        if in_section && !line.trim().starts_with('#') {
            in_section = false;
        }
        if line.contains("=error") {
            in_section = true;
        }
        if in_section {
            sections.push(line);
        }
    }
    sections
}

#[async_trait]
impl ModeHandler for CrashmeMode {
    fn mode(&self) -> Mode {
        Mode::Crashme
    }

    fn discover(&self, system: &SystemManager) -> anyhow::Result<Vec<TestCase>> {
        let cases = command_cases(&self.settings, system, "crashme_tests")?;
        info!(count = cases.len(), "found crash-me tests");
        Ok(cases)
    }

    /// crash-me is chatty. Unless verbose, the output kept is only the
    /// `=error` sections of the report named on the fourth output line.
    async fn execute_case(&self, ctx: &CaseContext<'_>, env: &Environment) -> Result<Execution, SystemError> {
        let CaseBody::Command { argv } = &ctx.case.body else {
            return Ok(Execution::default());
        };
        let config = self.write_config(ctx.system)?;
        let mut argv = split_command(&argv.join(" "), env);
        argv.push(format!("--config-file={}", config.display()));

        let log = ctx.logdir.join("crashme.out");
        let mut exec = run_logged_command(&argv, env, Some(&sql_bench_dir(ctx.system)), &log).await?;
        if exec.retcode != Some(0) {
            return Ok(exec);
        }

        let report = exec
            .output
            .lines()
            .nth(3)
            .and_then(|line| line.split(':').nth(1))
            .map(|name| PathBuf::from(name.trim()))
            .and_then(|path| read_report(&path));
        let Some(report) = report else {
            warn!(test = %ctx.case.fullname(), "crash-me output names no readable report");
            exec.retcode = None;
            return Ok(exec);
        };

        if !self.settings.verbose {
            exec.output.clear();
        }
        for line in error_sections(&report) {
            exec.output.push_str(line);
            exec.output.push('\n');
        }
        Ok(exec)
    }

    fn classify_result(&self, _case: &TestCase, execution: &Execution) -> TestStatus {
        if execution.retcode == Some(0) && !execution.output.contains("=error") {
            TestStatus::Pass
        } else {
            TestStatus::Fail
        }
    }

    fn resets_servers_after_case(&self) -> bool {
        true
    }
}
