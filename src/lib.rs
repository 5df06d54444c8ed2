//! qprunner -- test-execution harness for database server builds.
//!
//! This crate provides the library behind the `qprunner` binary: port
//! allocation shared across harness processes, server lifecycle and
//! per-requester pools, and pluggable test modes driven by a sequential
//! execution engine.

pub mod config;
pub mod ports;
pub mod server;
pub mod system;
pub mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::RunOptions;
use crate::ports::PortManager;
use crate::server::pool::ServerManager;
use crate::system::code_tree::{CodeTree, TreeLocations};
use crate::system::instrument::{find_libtool, Instrumentation};
use crate::system::{SystemManager, SystemSettings};
use crate::testing::{
    handler_for, ExecutorOptions, ModeHandler, ModeSettings, RunOutcome, RunSummary, TestExecutor,
    TestManager, TestSelection,
};

/// Requester name of the run's executor.
const EXECUTOR_NAME: &str = "bot0";

/// What a finished run hands back to the CLI.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.summary.has_failures() || self.outcome == RunOutcome::Interrupted
    }
}

/// Discover the tree, run the selected mode's cases, and tear everything
/// down. Servers are stopped and ports released on every exit path
/// except `--start-and-exit`, which leaves the servers running.
pub async fn run(mut options: RunOptions) -> Result<RunReport> {
    options.normalize();
    let config = options.config.clone();

    // 1. Code tree
    let locations = TreeLocations {
        basedir: options.basedir.clone(),
        testdir: options.testdir.clone(),
        top_srcdir: options.top_srcdir.clone(),
        top_builddir: options.top_builddir.clone(),
        clientbindir: options.clientbindir.clone(),
        serverpath: options.serverpath.clone(),
    };
    let tree = CodeTree::discover(&locations)
        .await
        .context("failed to discover the server code tree")?;
    tree.report();

    // 2. System context
    let instrumentation = if options.valgrind {
        let libtool = find_libtool(&tree.testdir);
        Instrumentation::valgrind(options.valgrind_options.clone(), &tree.testdir, libtool)
    } else if options.gdb {
        Instrumentation::Gdb
    } else {
        Instrumentation::None
    };
    let settings = SystemSettings {
        workdir: options.workdir(),
        start_dirty: options.start_dirty,
        no_shm: options.no_shm,
        instrumentation,
    };
    let port_manager = PortManager::new(&config.ports.catalog_path);
    let system = Arc::new(SystemManager::new(settings, tree, port_manager));
    system
        .prepare_workdir()
        .with_context(|| format!("failed to prepare workdir {}", system.workdir().display()))?;

    // 3. Mode and cases
    let handler: Arc<dyn ModeHandler> = Arc::from(handler_for(
        options.mode,
        ModeSettings {
            suites: options.suites.clone(),
            suite_paths: options.suite_paths.clone(),
            randgen_path: options.randgen_path.clone(),
            default_storage_engine: options.default_storage_engine.clone(),
            skip_codes: config.modes.dtr_skip_codes.clone(),
            verbose: options.verbose,
        },
    ));
    handler
        .prepare_run(&system)
        .await
        .with_context(|| format!("{} mode setup failed", options.mode))?;

    let cases = handler
        .discover(&system)
        .with_context(|| format!("failed to discover {} tests", options.mode))?;
    let mut tests = TestManager::new(options.mode);
    let selection = TestSelection {
        tests: options.tests.clone(),
        do_test: options.do_test.clone(),
        skip_test: options.skip_test.clone(),
        reorder: options.reorder,
        repeat: options.repeat_count(),
    };
    tests.add_test_cases(cases, &selection);
    info!(run_id = %tests.run_id(), mode = %options.mode, queued = tests.remaining(), "starting run");

    // 4. Execution
    let mut servers = ServerManager::new(system.clone(), config.server_settings(options.no_secure_file_priv));
    let mut executor = TestExecutor::new(
        EXECUTOR_NAME,
        system.clone(),
        handler,
        ExecutorOptions {
            force: options.force,
            record: options.record,
            start_and_exit: options.start_and_exit,
            extra_server_options: options.server_options.clone(),
        },
    )
    .context("failed to create executor workdir")?;

    let outcome = tokio::select! {
        result = executor.execute(&mut tests, &mut servers) => result,
        _ = interrupted() => {
            warn!("interrupted, cleaning up");
            Ok(RunOutcome::Interrupted)
        }
    };

    // 5. Teardown, whatever happened above
    match &outcome {
        Ok(RunOutcome::StartedAndExited) => servers.release_ports(),
        _ => servers.cleanup().await,
    }

    let outcome = outcome?;
    let summary = tests.summary();
    info!(
        run_id = %summary.run_id,
        total = summary.total,
        passed = summary.passed,
        failed = summary.failed,
        skipped = summary.skipped,
        elapsed_secs = summary.elapsed_secs,
        "run finished"
    );
    Ok(RunReport { outcome, summary })
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for interrupts");
        std::future::pending::<()>().await;
    }
}
