//! Test cases, results, and the machinery that runs them.

pub mod executor;
pub mod manager;
pub mod modes;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

pub use self::executor::{ExecutorOptions, RunOutcome, TestExecutor};
pub use self::manager::{RunSummary, TestManager, TestSelection};
pub use self::modes::{handler_for, Mode, ModeHandler, ModeSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Pass => write!(f, "pass"),
            TestStatus::Fail => write!(f, "fail"),
            TestStatus::Skip => write!(f, "skip"),
        }
    }
}

/// What running a case actually means for its mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseBody {
    /// Protocol replay of a `.test` file, compared against `.result`.
    Replay {
        test_file: PathBuf,
        result_file: Option<PathBuf>,
    },
    /// Random query generator arguments.
    Randgen { args: Vec<String> },
    /// Load generator: optional prepare phase, then the measured run.
    Sysbench {
        prepare: Option<Vec<String>>,
        run: Vec<String>,
    },
    /// A benchmark script run from the sql-bench directory.
    Command { argv: Vec<String> },
    None,
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub suite: String,
    pub name: String,
    pub master_count: usize,
    pub slave_count: usize,
    pub server_options: Vec<String>,
    pub expect_server_fail: bool,
    /// `(source, link)` pairs created before the case runs.
    pub symlinks: Vec<(PathBuf, PathBuf)>,
    /// Shell script run before the servers are requested.
    pub master_sh: Option<PathBuf>,
    /// Reason the case is disabled, if it is.
    pub disabled: Option<String>,
    pub body: CaseBody,
}

impl TestCase {
    pub fn new(suite: impl Into<String>, name: impl Into<String>, body: CaseBody) -> Self {
        Self {
            suite: suite.into(),
            name: name.into(),
            master_count: 1,
            slave_count: 0,
            server_options: Vec::new(),
            expect_server_fail: false,
            symlinks: Vec::new(),
            master_sh: None,
            disabled: None,
            body,
        }
    }

    /// `suite.name`
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.suite, self.name)
    }
}

/// Raw outcome of running a case body.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub retcode: Option<i32>,
    pub output: String,
    pub elapsed: Duration,
}

/// Recorded, immutable outcome of one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub fullname: String,
    pub status: TestStatus,
    pub retcode: Option<i32>,
    pub exec_time_ms: u64,
    pub output: String,
}

impl TestResult {
    pub fn new(case: &TestCase, status: TestStatus, execution: Execution) -> Self {
        Self {
            fullname: case.fullname(),
            status,
            retcode: execution.retcode,
            exec_time_ms: execution.elapsed.as_millis() as u64,
            output: execution.output,
        }
    }
}
