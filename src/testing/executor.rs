//! The execution engine. One executor pulls cases from the [`TestManager`],
//! reconciles its server pool for each, runs the mode's case body, and
//! records the classified result.
//!
//! Per case: acquiring, environment-setup, server-provisioning, running,
//! classifying, recorded. A failed case halts the run unless `force` is set.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use super::manager::TestManager;
use super::modes::{CaseContext, ModeHandler};
use super::{Execution, TestCase, TestResult, TestStatus};
use crate::server::pool::ServerManager;
use crate::system::fs::DirSpec;
use crate::system::{SystemError, SystemManager};

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Keep going after a failed case.
    pub force: bool,
    /// Capture new expected output instead of comparing.
    pub record: bool,
    /// Provision the first case's servers, then exit leaving them running.
    pub start_and_exit: bool,
    /// Server options appended to every case's own options.
    pub extra_server_options: Vec<String>,
}

/// How a call to [`TestExecutor::execute`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The queue ran dry.
    Completed,
    /// A case failed without `force`.
    Halted { failed: String },
    /// Servers were left running for the operator.
    StartedAndExited,
    /// The operator interrupted the run.
    Interrupted,
}

enum CaseStep {
    Recorded(TestResult),
    StartedAndExited,
}

pub struct TestExecutor {
    name: String,
    workdir: PathBuf,
    logdir: PathBuf,
    system: Arc<SystemManager>,
    handler: Arc<dyn ModeHandler>,
    options: ExecutorOptions,
    initial_run: bool,
}

impl std::fmt::Debug for TestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestExecutor")
            .field("name", &self.name)
            .field("mode", &self.handler.mode())
            .field("workdir", &self.workdir)
            .finish()
    }
}

impl TestExecutor {
    /// Create the executor's `<workdir>/<name>/log` tree.
    pub fn new(
        name: &str,
        system: Arc<SystemManager>,
        handler: Arc<dyn ModeHandler>,
        options: ExecutorOptions,
    ) -> Result<Self, SystemError> {
        let workdir = system.create_dirset(system.workdir(), name, &DirSpec::dir([("log", DirSpec::empty())]))?;
        let logdir = workdir.join("log");
        Ok(Self {
            name: name.to_string(),
            workdir,
            logdir,
            system,
            handler,
            options,
            initial_run: true,
        })
    }

    /// The requester name this executor's servers are tracked under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workdir(&self) -> &std::path::Path {
        &self.workdir
    }

    /// Run cases until the queue is empty or a failure halts the run.
    ///
    /// Case-local problems become `Fail` records. Only infrastructure
    /// failures (ports, schema initialization, snapshots) are errors.
    pub async fn execute(
        &mut self,
        tests: &mut TestManager,
        servers: &mut ServerManager,
    ) -> anyhow::Result<RunOutcome> {
        info!(executor = %self.name, mode = %self.handler.mode(), queued = tests.remaining(), "beginning test execution");

        while let Some(case) = tests.next_case() {
            debug!(executor = %self.name, test = %case.fullname(), phase = "acquiring", "assigned test");
            let result = match self.run_case(&case, servers).await? {
                CaseStep::Recorded(result) => result,
                CaseStep::StartedAndExited => return Ok(RunOutcome::StartedAndExited),
            };

            let failed = result.status == TestStatus::Fail;
            if failed {
                servers.mark_failed(&self.name);
            }
            if self.handler.resets_servers_after_case() && servers.server_count(&self.name) > 0 {
                servers
                    .reset_servers(&self.name)
                    .await
                    .with_context(|| format!("failed to reset servers after {}", case.fullname()))?;
            }
            debug!(executor = %self.name, test = %case.fullname(), phase = "recorded", status = %result.status);
            tests.record_test_result(result);

            if failed && !self.options.force {
                error!("Failed test. Use --force to execute beyond the first test failure");
                return Ok(RunOutcome::Halted {
                    failed: case.fullname(),
                });
            }
        }
        info!(executor = %self.name, "test execution complete");
        Ok(RunOutcome::Completed)
    }

    async fn run_case(&mut self, case: &TestCase, servers: &mut ServerManager) -> anyhow::Result<CaseStep> {
        let fullname = case.fullname();
        if let Some(reason) = &case.disabled {
            info!(test = %fullname, %reason, "test disabled");
            return Ok(CaseStep::Recorded(TestResult::new(
                case,
                TestStatus::Skip,
                Execution {
                    output: format!("disabled: {reason}"),
                    ..Execution::default()
                },
            )));
        }

        let ctx = CaseContext {
            case,
            servers: &[],
            system: &self.system,
            workdir: &self.workdir,
            logdir: &self.logdir,
            record: self.options.record,
        };

        debug!(test = %fullname, phase = "environment-setup");
        if let Err(e) = self.handler.handle_system_requirements(&ctx).await {
            warn!(test = %fullname, error = %e, "system requirements failed, failing test case");
            return Ok(CaseStep::Recorded(fail_without_running(case, e.to_string())));
        }

        debug!(test = %fullname, phase = "server-provisioning");
        let mut options = case.server_options.clone();
        options.extend(self.options.extra_server_options.iter().cloned());
        let (infos, bad_start) = servers
            .request_servers(
                &self.name,
                &self.workdir,
                case.master_count,
                case.slave_count,
                &options,
                case.expect_server_fail,
            )
            .await
            .with_context(|| format!("failed to provision servers for {fullname}"))?;

        if infos.is_empty() || bad_start > 0 {
            warn!(test = %fullname, bad_start, "problem starting server(s) for test, failing test case");
            return Ok(CaseStep::Recorded(fail_without_running(
                case,
                format!("{bad_start} server(s) failed to start"),
            )));
        }
        if self.options.start_and_exit {
            servers.report(&self.name);
            info!("--start-and-exit given, exiting and leaving servers running");
            return Ok(CaseStep::StartedAndExited);
        }
        if self.initial_run {
            self.initial_run = false;
            servers.report(&self.name);
        }

        let ctx = CaseContext {
            servers: &infos,
            ..ctx
        };
        let env = self.handler.compose_environment(&ctx);

        debug!(test = %fullname, phase = "running");
        let execution = match self.handler.execute_case(&ctx, &env).await {
            Ok(execution) => execution,
            Err(e) => {
                warn!(test = %fullname, error = %e, "test body could not run");
                Execution {
                    output: e.to_string(),
                    ..Execution::default()
                }
            }
        };

        debug!(test = %fullname, phase = "classifying", retcode = ?execution.retcode);
        let status = self.handler.classify_result(case, &execution);
        Ok(CaseStep::Recorded(TestResult::new(case, status, execution)))
    }
}

fn fail_without_running(case: &TestCase, output: String) -> TestResult {
    TestResult::new(
        case,
        TestStatus::Fail,
        Execution {
            output,
            ..Execution::default()
        },
    )
}
