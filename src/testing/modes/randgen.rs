//! Random query generator mode: `gentest.pl` runs against the master.

use std::path::PathBuf;

use anyhow::bail;
use async_trait::async_trait;
use tracing::info;

use super::{
    classify_exit, load_case_files, run_logged_command, split_command, standard_environment,
    CaseContext, Mode, ModeHandler, ModeSettings,
};
use crate::system::env::{EnvRequirement, Environment};
use crate::system::{SystemError, SystemManager};
use crate::testing::{CaseBody, Execution, TestCase, TestStatus};

#[derive(Debug)]
pub struct RandgenMode {
    settings: ModeSettings,
}

impl RandgenMode {
    pub fn new(settings: ModeSettings) -> Self {
        Self { settings }
    }

    fn randgen_path(&self) -> anyhow::Result<&PathBuf> {
        match &self.settings.randgen_path {
            Some(path) => Ok(path),
            None => bail!("randgen mode needs --randgen-path pointing at a randgen checkout"),
        }
    }
}

/// DSN for the master's drizzle protocol port.
fn dsn(port: u16) -> String {
    format!("dbi:drizzle:host=localhost:port={port}:user=root:password=\"\":database=test")
}

#[async_trait]
impl ModeHandler for RandgenMode {
    fn mode(&self) -> Mode {
        Mode::Randgen
    }

    fn discover(&self, system: &SystemManager) -> anyhow::Result<Vec<TestCase>> {
        self.randgen_path()?;
        let mut roots = self.settings.suite_paths.clone();
        roots.push(system.code_tree.testdir.join("randgen_tests"));

        let cases: Vec<TestCase> = load_case_files(&roots, &self.settings.suites)?
            .iter()
            .map(|loaded| {
                let mut case = loaded.to_case(CaseBody::Randgen {
                    args: loaded.file.test.command.split_whitespace().map(str::to_string).collect(),
                });
                if let Some(engine) = &self.settings.default_storage_engine {
                    case.server_options.push(format!("--default-storage-engine={engine}"));
                }
                case
            })
            .collect();
        info!(count = cases.len(), "found randgen tests");
        Ok(cases)
    }

    fn compose_environment(&self, ctx: &CaseContext<'_>) -> Environment {
        let mut reqs = standard_environment(ctx);
        if let Some(path) = &self.settings.randgen_path {
            reqs.push(EnvRequirement::prepend("PERL5LIB", &[path.join("lib").display().to_string()]));
        }
        ctx.system.working_environment(&reqs)
    }

    async fn execute_case(&self, ctx: &CaseContext<'_>, env: &Environment) -> Result<Execution, SystemError> {
        let (CaseBody::Randgen { args }, Some(randgen)) = (&ctx.case.body, &self.settings.randgen_path) else {
            return Ok(Execution::default());
        };
        let mut argv = vec![randgen.join("gentest.pl").display().to_string()];
        argv.extend(split_command(&args.join(" "), env));
        if let Some(master) = ctx.master() {
            argv.push(format!("--dsn={}", dsn(master.ports.master)));
        }
        let log = ctx.logdir.join("randgen.out");
        run_logged_command(&argv, env, Some(randgen), &log).await
    }

    fn classify_result(&self, _case: &TestCase, execution: &Execution) -> TestStatus {
        classify_exit(execution.retcode, &[])
    }
}
