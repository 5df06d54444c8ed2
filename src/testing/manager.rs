//! The case queue and result recorder shared by every mode.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::modes::Mode;
use super::{TestCase, TestResult, TestStatus};
use crate::server::options::filter_server_options;

/// Which discovered cases run, in what order, and how often.
#[derive(Debug, Clone)]
pub struct TestSelection {
    /// Explicit case names (`name` or `suite.name`). Empty means all.
    pub tests: Vec<String>,
    pub do_test: Option<String>,
    pub skip_test: Option<String>,
    pub reorder: bool,
    pub repeat: u32,
}

impl Default for TestSelection {
    fn default() -> Self {
        Self {
            tests: Vec::new(),
            do_test: None,
            skip_test: None,
            reorder: false,
            repeat: 1,
        }
    }
}

/// A do-test / skip-test pattern: a name prefix or a regex.
#[derive(Debug, Clone)]
pub struct NamePattern {
    prefix: String,
    regex: Option<Regex>,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Self {
        let regex = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                debug!(%pattern, error = %e, "pattern is not a regex, matching as prefix only");
                None
            }
        };
        Self {
            prefix: pattern.to_string(),
            regex,
        }
    }

    pub fn matches(&self, case: &TestCase) -> bool {
        let fullname = case.fullname();
        [case.name.as_str(), fullname.as_str()].iter().any(|name| {
            name.starts_with(&self.prefix) || self.regex.as_ref().is_some_and(|re| re.is_match(name))
        })
    }
}

/// Summary of a finished (or halted) run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_tests: Vec<String>,
    pub results: Vec<TestResult>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug)]
pub struct TestManager {
    mode: Mode,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    queue: VecDeque<TestCase>,
    results: Vec<TestResult>,
}

impl TestManager {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            queue: VecDeque::new(),
            results: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Filter, order, and enqueue discovered cases. Each case is repeated
    /// consecutively `repeat` times. Returns the number enqueued.
    pub fn add_test_cases(&mut self, cases: Vec<TestCase>, selection: &TestSelection) -> usize {
        let discovered = cases.len();
        let do_test = selection.do_test.as_deref().map(NamePattern::new);
        let skip_test = selection.skip_test.as_deref().map(NamePattern::new);

        let mut selected: Vec<TestCase> = cases
            .into_iter()
            .filter(|case| {
                selection.tests.is_empty()
                    || selection
                        .tests
                        .iter()
                        .any(|t| *t == case.name || *t == case.fullname())
            })
            .filter(|case| do_test.as_ref().map_or(true, |p| p.matches(case)))
            .filter(|case| !skip_test.as_ref().is_some_and(|p| p.matches(case)))
            .collect();

        if selection.reorder {
            selected.sort_by_cached_key(|case| {
                let mut options = filter_server_options(&case.server_options);
                options.sort();
                (case.master_count + case.slave_count, options)
            });
        }

        let repeat = selection.repeat.max(1) as usize;
        let before = self.queue.len();
        for case in selected {
            for _ in 1..repeat {
                self.queue.push_back(case.clone());
            }
            self.queue.push_back(case);
        }
        let enqueued = self.queue.len() - before;
        info!(mode = %self.mode, discovered, enqueued, repeat, "test cases queued");
        enqueued
    }

    pub fn has_tests(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn next_case(&mut self) -> Option<TestCase> {
        self.queue.pop_front()
    }

    pub fn record_test_result(&mut self, result: TestResult) {
        match result.status {
            TestStatus::Pass => info!(test = %result.fullname, ms = result.exec_time_ms, "pass"),
            TestStatus::Skip => info!(test = %result.fullname, "skip"),
            TestStatus::Fail => warn!(
                test = %result.fullname,
                retcode = ?result.retcode,
                ms = result.exec_time_ms,
                "fail"
            ),
        }
        self.results.push(result);
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn summary(&self) -> RunSummary {
        let count = |status| self.results.iter().filter(|r| r.status == status).count();
        RunSummary {
            run_id: self.run_id,
            mode: self.mode,
            started_at: self.started_at,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            total: self.results.len(),
            passed: count(TestStatus::Pass),
            failed: count(TestStatus::Fail),
            skipped: count(TestStatus::Skip),
            failed_tests: self
                .results
                .iter()
                .filter(|r| r.status == TestStatus::Fail)
                .map(|r| r.fullname.clone())
                .collect(),
            results: self.results.clone(),
        }
    }
}
