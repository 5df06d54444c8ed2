use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use qprunner::config::{HarnessConfig, LogFormat, RunOptions};
use qprunner::testing::{Mode, RunOutcome, TestStatus};
use qprunner::RunReport;

#[derive(Parser)]
#[command(
    name = "qprunner",
    about = "Run database server test suites against a source or binary tree",
    version,
    long_about = None
)]
struct Cli {
    /// Tests to run (`name` or `suite.name`). Empty runs everything found.
    tests: Vec<String>,

    /// Test mode
    #[arg(long, value_enum, default_value_t = Mode::Dtr)]
    mode: Mode,

    /// Suites to run, comma separated. May be repeated.
    #[arg(long = "suite", value_delimiter = ',')]
    suites: Vec<String>,

    /// Extra directory searched for suites. May be repeated.
    #[arg(long = "suitepath")]
    suite_paths: Vec<PathBuf>,

    /// Run only tests matching this prefix or regex
    #[arg(long)]
    do_test: Option<String>,

    /// Skip tests matching this prefix or regex
    #[arg(long)]
    skip_test: Option<String>,

    /// Group tests by server requirements to reduce restarts
    #[arg(long)]
    reorder: bool,

    /// Run each test this many times in a row
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    repeat: i64,

    /// Keep going after a test fails
    #[arg(long)]
    force: bool,

    /// Record new expected results instead of comparing
    #[arg(long)]
    record: bool,

    /// Start the first test's servers, then exit leaving them running
    #[arg(long)]
    start_and_exit: bool,

    /// Root of the server tree [default: parent of testdir]
    #[arg(long)]
    basedir: Option<PathBuf>,

    /// Path to the server executable
    #[arg(long)]
    serverpath: Option<PathBuf>,

    /// Directory holding the client utilities
    #[arg(long)]
    clientbindir: Option<PathBuf>,

    /// Test directory [default: current directory]
    #[arg(long)]
    testdir: Option<PathBuf>,

    /// Working directory for servers and logs [default: <testdir>/workdir]
    #[arg(long)]
    workdir: Option<PathBuf>,

    #[arg(long)]
    top_srcdir: Option<PathBuf>,

    #[arg(long)]
    top_builddir: Option<PathBuf>,

    /// Do not link the workdir into /dev/shm
    #[arg(long)]
    no_shm: bool,

    /// Reuse the existing workdir instead of recreating it
    #[arg(long)]
    start_dirty: bool,

    /// Start servers without --secure-file-priv
    #[arg(long)]
    no_secure_file_priv: bool,

    /// Option passed to every server. May be repeated.
    #[arg(long = "drizzled", allow_hyphen_values = true)]
    server_options: Vec<String>,

    /// Run servers under valgrind
    #[arg(long)]
    valgrind: bool,

    /// Extra valgrind argument. May be repeated.
    #[arg(long = "valgrind-option", allow_hyphen_values = true)]
    valgrind_options: Vec<String>,

    /// Start servers under gdb
    #[arg(long)]
    gdb: bool,

    /// Randgen checkout used by randgen mode
    #[arg(long)]
    randgen_path: Option<PathBuf>,

    /// Storage engine passed to every server
    #[arg(long)]
    default_storage_engine: Option<String>,

    /// Port catalog shared between harness runs
    #[arg(long)]
    port_catalog: Option<PathBuf>,

    /// Harness config file [default: $QPRUNNER_CONFIG]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the run summary as JSON to this file
    #[arg(long)]
    json_report: Option<PathBuf>,

    /// Log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Chatty output, including full crash-me reports
    #[arg(long)]
    verbose: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn run_options(&self, config: HarnessConfig) -> Result<RunOptions> {
        let testdir = match &self.testdir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("failed to read current directory")?,
        };
        let mut opts = RunOptions::new(self.mode, testdir);
        if let Some(basedir) = &self.basedir {
            opts.basedir = basedir.clone();
        }
        opts.tests = self.tests.clone();
        opts.suites = self.suites.clone();
        opts.suite_paths = self.suite_paths.clone();
        opts.do_test = self.do_test.clone();
        opts.skip_test = self.skip_test.clone();
        opts.reorder = self.reorder;
        opts.repeat = self.repeat;
        opts.force = self.force;
        opts.record = self.record;
        opts.start_and_exit = self.start_and_exit;
        opts.workdir = self.workdir.clone();
        opts.serverpath = self.serverpath.clone();
        opts.clientbindir = self.clientbindir.clone();
        opts.top_srcdir = self.top_srcdir.clone();
        opts.top_builddir = self.top_builddir.clone();
        opts.no_shm = self.no_shm;
        opts.start_dirty = self.start_dirty;
        opts.no_secure_file_priv = self.no_secure_file_priv;
        opts.server_options = self.server_options.clone();
        opts.valgrind = self.valgrind;
        opts.valgrind_options = self.valgrind_options.clone();
        opts.gdb = self.gdb;
        opts.randgen_path = self.randgen_path.clone();
        opts.default_storage_engine = self.default_storage_engine.clone();
        opts.verbose = self.verbose;
        opts.config = config;
        if let Some(catalog) = &self.port_catalog {
            opts.config.ports.catalog_path = catalog.clone();
        }
        Ok(opts)
    }
}

fn init_tracing(cli: &Cli, config: &HarnessConfig) {
    let default_level = if cli.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match cli.log_format.unwrap_or(config.logging.format) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn print_summary(report: &RunReport) {
    let summary = &report.summary;
    println!();
    println!("{:<40} | {:<6} | {:>10}", "Test", "Status", "Time (ms)");
    println!("{:-<40}-|-{:-<6}-|-{:->10}", "", "", "");
    for result in &summary.results {
        let status = match result.status {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Skip => "SKIP",
        };
        println!("{:<40} | {:<6} | {:>10}", result.fullname, status, result.exec_time_ms);
    }
    println!();
    println!(
        "Run {}: {} tests, {} passed, {} failed, {} skipped in {:.1}s",
        summary.run_id, summary.total, summary.passed, summary.failed, summary.skipped, summary.elapsed_secs
    );
    if !summary.failed_tests.is_empty() {
        println!("Failed: {}", summary.failed_tests.join(" "));
    }
    match &report.outcome {
        RunOutcome::Halted { failed } => println!("Stopped after {failed}. Use --force to run past failures."),
        RunOutcome::StartedAndExited => println!("Servers left running."),
        RunOutcome::Interrupted => println!("Interrupted."),
        RunOutcome::Completed => {}
    }
}

async fn run(cli: Cli, config: HarnessConfig) -> Result<bool> {
    let json_report = cli.json_report.clone();
    let report = qprunner::run(cli.run_options(config)?).await?;
    print_summary(&report);
    if let Some(path) = json_report {
        let json = serde_json::to_string_pretty(&report.summary)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote JSON report");
    }
    Ok(!report.has_failures())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match HarnessConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("qprunner: {e:#}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&cli, &config);

    match run(cli, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(2)
        }
    }
}
