//! Test modes. Each mode is a [`ModeHandler`]; [`handler_for`] is the
//! dispatch table from [`Mode`] to its handler.

pub mod cleanup;
pub mod dtr;
pub mod randgen;
pub mod sqlbench;
pub mod sysbench;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Execution, TestCase, TestStatus};
use crate::server::ServerInfo;
use crate::system::env::{self, EnvRequirement, Environment};
use crate::system::process::{build_command, display_command};
use crate::system::{fs, SystemError, SystemManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Protocol-replay tests driven by the replay client
    Dtr,
    /// Random query generator
    Randgen,
    /// sysbench load tests
    Sysbench,
    /// sql-bench suite
    Sqlbench,
    /// crash-me limits probe
    Crashme,
    /// Release stale ports and stop leftover servers
    Cleanup,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Dtr => "dtr",
            Mode::Randgen => "randgen",
            Mode::Sysbench => "sysbench",
            Mode::Sqlbench => "sqlbench",
            Mode::Crashme => "crashme",
            Mode::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Run-wide inputs handlers need for discovery and execution.
#[derive(Debug, Clone, Default)]
pub struct ModeSettings {
    /// Suites to run. Empty means every suite found.
    pub suites: Vec<String>,
    /// Extra directories searched for suites.
    pub suite_paths: Vec<PathBuf>,
    pub randgen_path: Option<PathBuf>,
    pub default_storage_engine: Option<String>,
    /// Exit codes classified as skip, for modes that have one.
    pub skip_codes: Vec<i32>,
    pub verbose: bool,
}

/// Everything a mode sees while handling one case.
#[derive(Debug, Clone, Copy)]
pub struct CaseContext<'a> {
    pub case: &'a TestCase,
    pub servers: &'a [ServerInfo],
    pub system: &'a SystemManager,
    /// The executor's private working directory.
    pub workdir: &'a Path,
    pub logdir: &'a Path,
    pub record: bool,
}

impl CaseContext<'_> {
    pub fn master(&self) -> Option<&ServerInfo> {
        self.servers.first()
    }
}

/// Mode-specific behavior plugged into the executor.
#[async_trait]
pub trait ModeHandler: Send + Sync {
    fn mode(&self) -> Mode;

    /// Run-wide work done once, before any case.
    async fn prepare_run(&self, _system: &SystemManager) -> anyhow::Result<()> {
        Ok(())
    }

    /// Find this mode's cases.
    fn discover(&self, system: &SystemManager) -> anyhow::Result<Vec<TestCase>>;

    /// Filesystem prerequisites: declared symlinks and `master.sh`.
    async fn handle_system_requirements(&self, ctx: &CaseContext<'_>) -> Result<(), SystemError> {
        fs::create_symlinks(&ctx.case.symlinks)?;
        if let Some(script) = &ctx.case.master_sh {
            let argv = vec!["/bin/sh".to_string(), script.display().to_string()];
            let out = ctx.system.execute_cmd(&argv, false).await?;
            debug!(script = %script.display(), code = ?out.code, output = %out.output.trim(), "ran master.sh");
        }
        Ok(())
    }

    /// Environment for the case body.
    fn compose_environment(&self, ctx: &CaseContext<'_>) -> Environment {
        ctx.system.working_environment(&standard_environment(ctx))
    }

    async fn execute_case(&self, ctx: &CaseContext<'_>, env: &Environment) -> Result<Execution, SystemError>;

    fn classify_result(&self, case: &TestCase, execution: &Execution) -> TestStatus;

    /// Reset the requester's servers after every case.
    fn resets_servers_after_case(&self) -> bool {
        false
    }
}

pub fn handler_for(mode: Mode, settings: ModeSettings) -> Box<dyn ModeHandler> {
    match mode {
        Mode::Dtr => Box::new(dtr::DtrMode::new(settings)),
        Mode::Randgen => Box::new(randgen::RandgenMode::new(settings)),
        Mode::Sysbench => Box::new(sysbench::SysbenchMode::new(settings)),
        Mode::Sqlbench => Box::new(sqlbench::SqlbenchMode::new(settings)),
        Mode::Crashme => Box::new(sqlbench::CrashmeMode::new(settings)),
        Mode::Cleanup => Box::new(cleanup::CleanupMode),
    }
}

/// Variables describing the master server and client tools.
pub fn standard_environment(ctx: &CaseContext<'_>) -> Vec<EnvRequirement> {
    let tree = &ctx.system.code_tree;
    let mut reqs = vec![
        EnvRequirement::set("DRIZZLE_BASEDIR", tree.basedir.display().to_string()),
        EnvRequirement::set(
            "DRIZZLE_TRX_READER",
            tree.trx_reader
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
        EnvRequirement::set("DRIZZLE_TEST_WORKDIR", ctx.system.workdir().display().to_string()),
        EnvRequirement::set("EXE_DRIZZLE", tree.client.display().to_string()),
    ];

    if let Some(master) = ctx.master() {
        let port = master.ports.master;
        let tool = |path: &Path, extra: &str| format!("{}{} -uroot -p{}", path.display(), extra, port);
        reqs.extend([
            EnvRequirement::set("DRIZZLETEST_VARDIR", master.paths.vardir.display().to_string()),
            EnvRequirement::set("DRIZZLE_TMP_DIR", master.paths.tmpdir.display().to_string()),
            EnvRequirement::set("MASTER_MYSOCK", master.paths.socket_file.display().to_string()),
            EnvRequirement::set("MASTER_MYPORT", port.to_string()),
            EnvRequirement::set("MC_PORT", master.ports.mc.to_string()),
            EnvRequirement::set("PBMS_PORT", master.ports.pbms.to_string()),
            EnvRequirement::set("RABBITMQ_NODE_PORT", master.ports.rabbitmq.to_string()),
            EnvRequirement::set("DRIZZLE_TCP_PORT", master.ports.drizzle_tcp.to_string()),
            EnvRequirement::set("DRIZZLE_DUMP", tool(tree.dump.as_path(), " --no-defaults")),
            EnvRequirement::set("DRIZZLE_SLAP", tool(tree.slap.as_path(), "")),
            EnvRequirement::set("DRIZZLE_IMPORT", tool(tree.import.as_path(), "")),
            EnvRequirement::set("DRIZZLE", tool(tree.client.as_path(), "")),
        ]);
    }
    reqs
}

/// Exit code classification: 0 passes, codes in `skip_codes` skip,
/// everything else (including death by signal) fails.
pub fn classify_exit(retcode: Option<i32>, skip_codes: &[i32]) -> TestStatus {
    match retcode {
        Some(0) => TestStatus::Pass,
        Some(code) if skip_codes.contains(&code) => TestStatus::Skip,
        _ => TestStatus::Fail,
    }
}

/// Split a command line from a case file, expanding `${VAR}` references
/// against `env` first.
pub fn split_command(command: &str, env: &Environment) -> Vec<String> {
    env::expand(command, env)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Run `argv` with stdout and stderr appended to `log_file`, then read the
/// log back as the execution output.
pub async fn run_logged_command(
    argv: &[String],
    env: &Environment,
    cwd: Option<&Path>,
    log_file: &Path,
) -> Result<Execution, SystemError> {
    info!(command = %display_command(argv), log = %log_file.display(), "executing");
    let log = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_file)
        .map_err(|e| SystemError::io(log_file, e))?;
    let log_err = log.try_clone().map_err(|e| SystemError::io(log_file, e))?;

    let mut cmd = build_command(argv, Some(env), cwd)?;
    cmd.stdin(Stdio::null()).stdout(Stdio::from(log)).stderr(Stdio::from(log_err));

    let started = Instant::now();
    let status = cmd
        .status()
        .await
        .map_err(|source| SystemError::Spawn {
            command: display_command(argv),
            source,
        })?;
    let elapsed = started.elapsed();

    let output = match std::fs::read(log_file) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(log = %log_file.display(), error = %e, "could not read command output");
            String::new()
        }
    };
    Ok(Execution {
        retcode: status.code(),
        output,
        elapsed,
    })
}

/// Shared TOML case-file layout used by the randgen, sysbench, sqlbench,
/// and crashme modes.
///
/// ```toml
/// [test]
/// command = "--grammar=conf/drizzle/drizzle.yy --queries=1000"
///
/// [server]
/// master_count = 1
/// options = ["--innodb.buffer-pool-size=64M"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaseFile {
    pub test: CaseFileTest,
    pub server: CaseFileServer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaseFileTest {
    pub command: String,
    pub prepare: Option<String>,
    pub disabled: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaseFileServer {
    pub master_count: usize,
    pub slave_count: usize,
    pub options: Vec<String>,
    pub expect_fail: bool,
}

impl Default for CaseFileServer {
    fn default() -> Self {
        Self {
            master_count: 1,
            slave_count: 0,
            options: Vec::new(),
            expect_fail: false,
        }
    }
}

/// A parsed case file and where it came from.
#[derive(Debug, Clone)]
pub struct LoadedCase {
    pub suite: String,
    pub name: String,
    pub path: PathBuf,
    pub file: CaseFile,
}

impl LoadedCase {
    /// A [`TestCase`] carrying this file's server requirements.
    pub fn to_case(&self, body: super::CaseBody) -> TestCase {
        let mut case = TestCase::new(&self.suite, &self.name, body);
        case.master_count = self.file.server.master_count;
        case.slave_count = self.file.server.slave_count;
        case.server_options = self.file.server.options.clone();
        case.expect_server_fail = self.file.server.expect_fail;
        case.disabled = self.file.test.disabled.clone();
        case
    }
}

/// Load `<root>/<suite>/*.toml` for every suite under each root, honoring
/// the suite filter. Unreadable files are fatal.
pub fn load_case_files(roots: &[PathBuf], suites: &[String]) -> anyhow::Result<Vec<LoadedCase>> {
    use anyhow::Context;

    let mut loaded = Vec::new();
    for root in roots {
        for suite_dir in sorted_entries(root)? {
            if !suite_dir.is_dir() {
                continue;
            }
            let suite = file_name(&suite_dir);
            if !suites.is_empty() && !suites.contains(&suite) {
                continue;
            }
            for path in sorted_entries(&suite_dir)? {
                if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                    continue;
                }
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read case file: {}", path.display()))?;
                let file: CaseFile = toml::from_str(&content)
                    .with_context(|| format!("failed to parse case file: {}", path.display()))?;
                loaded.push(LoadedCase {
                    suite: suite.clone(),
                    name: path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    path,
                    file,
                });
            }
        }
    }
    Ok(loaded)
}

/// Directory entries sorted by name. A missing directory yields nothing.
pub(crate) fn sorted_entries(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    use anyhow::Context;

    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to list {}", dir.display()))?;
    entries.sort();
    Ok(entries)
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::server::{ServerPaths, ServerPorts, ServerStatus};

    pub fn master_info(root: &Path) -> ServerInfo {
        let vardir = root.join("server0/var");
        ServerInfo {
            name: "server0".into(),
            owner: "exec0".into(),
            ports: ServerPorts {
                master: 9306,
                drizzle_tcp: 9307,
                mc: 9308,
                pbms: 9309,
                rabbitmq: 9310,
            },
            paths: ServerPaths {
                workdir: root.join("server0"),
                datadir: vardir.join("master-data"),
                tmpdir: vardir.join("tmp"),
                logdir: vardir.join("log"),
                rundir: vardir.join("run"),
                socket_file: vardir.join("server0.sock"),
                pid_file: vardir.join("run/server0.pid"),
                error_log: vardir.join("log/server0.err"),
                snapshot: vardir.join("tmp/snapshot_9306"),
                vardir,
            },
            options: Vec::new(),
            status: ServerStatus::Running,
            tainted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::testutil::fake_system;
    use crate::testing::CaseBody;

    #[test]
    fn test_classify_exit_codes() {
        assert_eq!(classify_exit(Some(0), &[62]), TestStatus::Pass);
        assert_eq!(classify_exit(Some(62), &[62]), TestStatus::Skip);
        assert_eq!(classify_exit(Some(1), &[62]), TestStatus::Fail);
        assert_eq!(classify_exit(Some(62), &[]), TestStatus::Fail);
        assert_eq!(classify_exit(None, &[62]), TestStatus::Fail);
    }

    #[test]
    fn test_dispatch_table_covers_every_mode() {
        use clap::ValueEnum;
        for mode in Mode::value_variants() {
            assert_eq!(handler_for(*mode, ModeSettings::default()).mode(), *mode);
        }
    }

    #[test]
    fn test_standard_environment_describes_master() {
        let dir = tempfile::TempDir::new().unwrap();
        let system = fake_system(dir.path(), 0);
        let case = TestCase::new("main", "alias", CaseBody::None);
        let servers = [testutil::master_info(dir.path())];
        let ctx = CaseContext {
            case: &case,
            servers: &servers,
            system: &system,
            workdir: dir.path(),
            logdir: dir.path(),
            record: false,
        };

        let env = system.working_environment(&standard_environment(&ctx));
        assert_eq!(env["MASTER_MYPORT"], "9306");
        assert_eq!(env["DRIZZLE_TCP_PORT"], "9307");
        assert_eq!(env["RABBITMQ_NODE_PORT"], "9310");
        assert!(env["MASTER_MYSOCK"].ends_with("server0.sock"));
        assert!(env["DRIZZLE"].ends_with("drizzle -uroot -p9306"));
        assert!(env["DRIZZLE_DUMP"].ends_with("drizzledump --no-defaults -uroot -p9306"));
        assert_eq!(env["DRIZZLE_TRX_READER"], "");
        assert_eq!(env["LC_ALL"], "C");

        let bare = CaseContext { servers: &[], ..ctx };
        let env = system.working_environment(&standard_environment(&bare));
        assert!(env.contains_key("EXE_DRIZZLE"));
        assert!(!env.contains_key("MASTER_MYPORT"));
    }

    #[test]
    fn test_split_command_expands_first() {
        let mut env = Environment::new();
        env.insert("MASTER_MYPORT".into(), "9306".into());
        assert_eq!(
            split_command("run-all-tests  --connect-options=port=${MASTER_MYPORT} --log", &env),
            ["run-all-tests", "--connect-options=port=9306", "--log"]
        );
    }

    #[tokio::test]
    async fn test_run_logged_command_captures_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("out.log");
        let mut env = Environment::new();
        env.insert("GREETING".into(), "hello".into());
        let argv: Vec<String> = ["/bin/sh", "-c", "echo $GREETING; echo oops >&2; exit 2"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let exec = run_logged_command(&argv, &env, Some(dir.path()), &log).await.unwrap();
        assert_eq!(exec.retcode, Some(2));
        assert!(exec.output.contains("hello"));
        assert!(exec.output.contains("oops"));
        assert_eq!(std::fs::read_to_string(&log).unwrap(), exec.output);
    }

    #[test]
    fn test_load_case_files_filters_suites() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("cases");
        std::fs::create_dir_all(root.join("basic")).unwrap();
        std::fs::create_dir_all(root.join("other")).unwrap();
        std::fs::write(
            root.join("basic/select.toml"),
            "[test]\ncommand = \"--queries=10\"\n[server]\noptions = [\"--x\"]\n",
        )
        .unwrap();
        std::fs::write(root.join("basic/notes.txt"), "ignored").unwrap();
        std::fs::write(root.join("other/insert.toml"), "[test]\ncommand = \"x\"\n").unwrap();

        let all = load_case_files(&[root.clone()], &[]).unwrap();
        assert_eq!(all.len(), 2);

        let basic = load_case_files(&[root.clone(), dir.path().join("missing")], &["basic".to_string()]).unwrap();
        assert_eq!(basic.len(), 1);
        let case = basic[0].to_case(CaseBody::None);
        assert_eq!(case.fullname(), "basic.select");
        assert_eq!(case.master_count, 1);
        assert_eq!(case.server_options, ["--x"]);

        std::fs::write(root.join("basic/broken.toml"), "[test\n").unwrap();
        assert!(load_case_files(&[root], &[]).is_err());
    }
}
