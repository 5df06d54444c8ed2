//! sysbench mode: an optional prepare phase followed by the measured run.
//! The run's throughput and latency figures are appended to the output.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use super::{
    classify_exit, load_case_files, run_logged_command, split_command, CaseContext, Mode,
    ModeHandler, ModeSettings,
};
use crate::system::env::Environment;
use crate::system::{SystemError, SystemManager};
use crate::testing::{CaseBody, Execution, TestCase, TestStatus};

#[derive(Debug)]
pub struct SysbenchMode {
    settings: ModeSettings,
}

impl SysbenchMode {
    pub fn new(settings: ModeSettings) -> Self {
        Self { settings }
    }
}

/// Figures pulled from a sysbench OLTP report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SysbenchMetrics {
    pub transactions: Option<u64>,
    pub tps: Option<f64>,
    pub rw_requests_per_sec: Option<f64>,
    pub deadlocks: Option<u64>,
    pub min_ms: Option<f64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub p95_ms: Option<f64>,
}

struct Patterns {
    transactions: Regex,
    rw_requests: Regex,
    deadlocks: Regex,
    min: Regex,
    avg: Regex,
    max: Regex,
    p95: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("Invalid sysbench pattern");
        Patterns {
            transactions: re(r"transactions:\s+(\d+)\s+\(([\d.]+) per sec"),
            rw_requests: re(r"read/write requests:\s+\d+\s+\(([\d.]+) per sec"),
            deadlocks: re(r"deadlocks:\s+(\d+)"),
            min: re(r"min:\s+([\d.]+)ms"),
            avg: re(r"avg:\s+([\d.]+)ms"),
            max: re(r"max:\s+([\d.]+)ms"),
            p95: re(r"approx\.\s+95 percentile:\s+([\d.]+)ms"),
        }
    })
}

fn capture<T: std::str::FromStr>(re: &Regex, text: &str, group: usize) -> Option<T> {
    re.captures(text)?.get(group)?.as_str().parse().ok()
}

/// Parse the figures sysbench prints at the end of a run. Missing lines
/// leave their field unset.
pub fn parse_sysbench_output(output: &str) -> SysbenchMetrics {
    let p = patterns();
    SysbenchMetrics {
        transactions: capture(&p.transactions, output, 1),
        tps: capture(&p.transactions, output, 2),
        rw_requests_per_sec: capture(&p.rw_requests, output, 1),
        deadlocks: capture(&p.deadlocks, output, 1),
        min_ms: capture(&p.min, output, 1),
        avg_ms: capture(&p.avg, output, 1),
        max_ms: capture(&p.max, output, 1),
        p95_ms: capture(&p.p95, output, 1),
    }
}

#[async_trait]
impl ModeHandler for SysbenchMode {
    fn mode(&self) -> Mode {
        Mode::Sysbench
    }

    fn discover(&self, system: &SystemManager) -> anyhow::Result<Vec<TestCase>> {
        let mut roots = self.settings.suite_paths.clone();
        roots.push(system.code_tree.testdir.join("sysbench_tests"));

        let cases: Vec<TestCase> = load_case_files(&roots, &self.settings.suites)?
            .iter()
            .map(|loaded| {
                let words = |s: &str| s.split_whitespace().map(str::to_string).collect::<Vec<_>>();
                loaded.to_case(CaseBody::Sysbench {
                    prepare: loaded.file.test.prepare.as_deref().map(words),
                    run: words(&loaded.file.test.command),
                })
            })
            .collect();
        info!(count = cases.len(), "found sysbench tests");
        Ok(cases)
    }

    async fn execute_case(&self, ctx: &CaseContext<'_>, env: &Environment) -> Result<Execution, SystemError> {
        let CaseBody::Sysbench { prepare, run } = &ctx.case.body else {
            return Ok(Execution::default());
        };

        let mut prep_elapsed = Duration::ZERO;
        if let Some(prepare) = prepare {
            let argv = split_command(&prepare.join(" "), env);
            let prep = run_logged_command(&argv, env, Some(ctx.workdir), &ctx.logdir.join("sysbench_prepare.out")).await?;
            prep_elapsed = prep.elapsed;
            if prep.retcode != Some(0) {
                warn!(test = %ctx.case.fullname(), code = ?prep.retcode, "sysbench prepare failed");
                return Ok(prep);
            }
        }

        let argv = split_command(&run.join(" "), env);
        let mut exec = run_logged_command(&argv, env, Some(ctx.workdir), &ctx.logdir.join("sysbench.out")).await?;
        exec.elapsed += prep_elapsed;
        if exec.retcode == Some(0) {
            let metrics = parse_sysbench_output(&exec.output);
            info!(test = %ctx.case.fullname(), tps = ?metrics.tps, p95_ms = ?metrics.p95_ms, "sysbench run complete");
            if let Ok(json) = serde_json::to_string(&metrics) {
                exec.output.push_str(&format!("\nsysbench metrics: {json}\n"));
            }
        }
        Ok(exec)
    }

    fn classify_result(&self, _case: &TestCase, execution: &Execution) -> TestStatus {
        classify_exit(execution.retcode, &[])
    }
}
