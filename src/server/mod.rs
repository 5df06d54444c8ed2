//! Server lifecycle: one ephemeral database server process, its ports,
//! its directory tree, and the data-directory snapshot used for resets.

pub mod options;
pub mod pool;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use crate::ports::{PortError, PortLease};
use crate::system::fs::{self, DirSpec};
use crate::system::instrument::Instrumentation;
use crate::system::process::{build_command, display_command};
use crate::system::{SystemError, SystemManager};

pub use self::pool::ServerManager;

/// Ports per server: master, drizzle protocol, memcached, pbms, rabbitmq.
pub const PORTS_PER_SERVER: usize = 5;

/// Schemas initialized in every fresh data directory.
const SYSTEM_SCHEMAS: &[&str] = &["test", "mysql"];

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server {name} did not answer ping within {timeout:?}")]
    StartTimeout { name: String, timeout: Duration },

    #[error("server {name} exited during startup with code {code:?}")]
    ExitedEarly { name: String, code: Option<i32> },

    #[error("server {name} started but was expected to fail")]
    UnexpectedStart { name: String },

    #[error("server {name} needs {needed} ports but its block has {got}")]
    ShortPortBlock { name: String, needed: usize, got: usize },

    #[error(transparent)]
    System(#[from] SystemError),

    #[error(transparent)]
    Ports(#[from] PortError),
}

/// Tunables shared by every server a pool creates.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub base_port: u16,
    pub block_size: usize,
    pub start_timeout: Duration,
    /// Start timeout factor under valgrind.
    pub valgrind_multiplier: u32,
    pub poll_interval: Duration,
    pub shutdown_wait: Duration,
    pub no_secure_file_priv: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_port: 9306,
            block_size: PORTS_PER_SERVER,
            start_timeout: Duration::from_secs(60),
            valgrind_multiplier: 10,
            poll_interval: Duration::from_secs(1),
            shutdown_wait: Duration::from_secs(30),
            no_secure_file_priv: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Running,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Running => write!(f, "running"),
        }
    }
}

/// Named roles within a server's port block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerPorts {
    pub master: u16,
    pub drizzle_tcp: u16,
    pub mc: u16,
    pub pbms: u16,
    pub rabbitmq: u16,
}

impl ServerPorts {
    fn from_block(block: &[u16]) -> Option<Self> {
        match block {
            [master, drizzle_tcp, mc, pbms, rabbitmq, ..] => Some(Self {
                master: *master,
                drizzle_tcp: *drizzle_tcp,
                mc: *mc,
                pbms: *pbms,
                rabbitmq: *rabbitmq,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerPaths {
    pub workdir: PathBuf,
    pub vardir: PathBuf,
    pub datadir: PathBuf,
    pub tmpdir: PathBuf,
    pub logdir: PathBuf,
    pub rundir: PathBuf,
    pub socket_file: PathBuf,
    pub pid_file: PathBuf,
    pub error_log: PathBuf,
    pub snapshot: PathBuf,
}

impl ServerPaths {
    fn new(workdir: PathBuf, name: &str, master_port: u16) -> Self {
        let vardir = workdir.join("var");
        let tmpdir = vardir.join("tmp");
        let logdir = vardir.join("log");
        let rundir = vardir.join("run");
        Self {
            datadir: vardir.join("master-data"),
            socket_file: vardir.join(format!("{name}.sock")),
            pid_file: rundir.join(format!("{name}.pid")),
            error_log: logdir.join(format!("{name}.err")),
            snapshot: tmpdir.join(format!("snapshot_{master_port}")),
            workdir,
            vardir,
            tmpdir,
            logdir,
            rundir,
        }
    }
}

/// Plain-data view of a server, handed to test bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub owner: String,
    pub ports: ServerPorts,
    pub paths: ServerPaths,
    pub options: Vec<String>,
    pub status: ServerStatus,
    pub tainted: bool,
}

/// One server instance owned by a requester.
#[derive(Debug)]
pub struct Server {
    name: String,
    owner: String,
    system: Arc<SystemManager>,
    settings: ServerSettings,
    lease: PortLease,
    ports: ServerPorts,
    paths: ServerPaths,
    options: Vec<String>,
    status: ServerStatus,
    tainted: bool,
    child: Option<Child>,
}

impl Server {
    /// Reserve ports, build the directory tree, initialize the system
    /// schemas, and capture the clean snapshot.
    pub async fn provision(
        name: &str,
        owner: &str,
        options: Vec<String>,
        workdir_root: &Path,
        system: Arc<SystemManager>,
        settings: ServerSettings,
    ) -> Result<Self, ServerError> {
        let lease = system.port_manager.get_port_block(
            &format!("{owner}.{name}"),
            settings.base_port,
            settings.block_size,
        )?;
        let ports = ServerPorts::from_block(lease.ports()).ok_or_else(|| ServerError::ShortPortBlock {
            name: name.to_string(),
            needed: PORTS_PER_SERVER,
            got: lease.ports().len(),
        })?;

        let workdir = system.create_dirset(workdir_root, name, &dirset(&system.code_tree.testdir))?;
        let paths = ServerPaths::new(workdir, name, ports.master);

        let server = Self {
            name: name.to_string(),
            owner: owner.to_string(),
            system,
            settings,
            lease,
            ports,
            paths,
            options,
            status: ServerStatus::Stopped,
            tainted: false,
            child: None,
        };
        server.initialize_databases().await?;
        server.take_db_snapshot()?;
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Whether a launched process is still held (and not yet waited on).
    pub fn has_process(&self) -> bool {
        self.child.is_some()
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn ports(&self) -> &ServerPorts {
        &self.ports
    }

    pub fn paths(&self) -> &ServerPaths {
        &self.paths
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            owner: self.owner.clone(),
            ports: self.ports,
            paths: self.paths.clone(),
            options: self.options.clone(),
            status: self.status,
            tainted: self.tainted,
        }
    }

    /// Effective start timeout including the instrumentation factor.
    pub fn start_timeout(&self) -> Duration {
        self.settings.start_timeout
            * self
                .system
                .instrumentation()
                .timeout_multiplier(self.settings.valgrind_multiplier)
    }

    /// Full argv used to launch the server.
    pub fn start_command(&self) -> Vec<String> {
        let tree = &self.system.code_tree;
        let mut argv = self.system.command_prefix();
        argv.push(tree.server.display().to_string());
        argv.extend(self.options.iter().cloned());
        argv.extend([
            format!("--mysql-protocol.port={}", self.ports.master),
            "--mysql-protocol.connect-timeout=60".to_string(),
            "--innodb.data-file-path=ibdata1:20M:autoextend".to_string(),
            "--sort-buffer-size=256K".to_string(),
            "--max-heap-table-size=1M".to_string(),
            format!("--mysql-unix-socket-protocol.path={}", self.paths.socket_file.display()),
            format!("--pid-file={}", self.paths.pid_file.display()),
            format!("--drizzle-protocol.port={}", self.ports.drizzle_tcp),
            format!("--datadir={}", self.paths.datadir.display()),
            format!("--tmpdir={}", self.paths.tmpdir.display()),
        ]);
        if !self.settings.no_secure_file_priv {
            argv.push(format!("--secure-file-priv={}", self.paths.vardir.display()));
        }
        argv.push("--user=root".to_string());
        if matches!(self.system.instrumentation(), Instrumentation::Gdb) {
            argv.push("--gdb".to_string());
        }
        argv
    }

    fn client_command(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.system.code_tree.client.display().to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv.push(format!("--port={}", self.ports.master));
        argv.push("--user=root".to_string());
        argv
    }

    /// Launch the server and wait for it to answer pings.
    ///
    /// With `expect_fail`, a server that never comes up is the expected
    /// outcome and one that does is an error.
    pub async fn start(&mut self, expect_fail: bool) -> Result<(), ServerError> {
        if self.has_process() {
            self.stop().await;
        }
        let argv = self.start_command();
        info!(server = %self.name, owner = %self.owner, command = %display_command(&argv), "starting server");

        let log_path = &self.paths.error_log;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| SystemError::io(log_path, e))?;
        let log_err = log.try_clone().map_err(|e| SystemError::io(log_path, e))?;

        let mut cmd = build_command(&argv, Some(self.system.base_environment()), None)?;
        cmd.stdin(Stdio::null()).stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        let child = cmd.spawn().map_err(|source| SystemError::Spawn {
            command: display_command(&argv),
            source,
        })?;
        self.child = Some(child);

        let readiness = self.wait_until_ready().await;
        match (readiness, expect_fail) {
            (Readiness::Up, false) => {
                self.status = ServerStatus::Running;
                info!(server = %self.name, port = self.ports.master, "server started");
                Ok(())
            }
            (Readiness::Up, true) => {
                self.status = ServerStatus::Running;
                error!(server = %self.name, "server started but was expected to fail");
                Err(ServerError::UnexpectedStart { name: self.name.clone() })
            }
            (outcome, true) => {
                self.status = ServerStatus::Stopped;
                info!(server = %self.name, ?outcome, "server failed to start, as expected");
                Ok(())
            }
            (outcome, false) => {
                self.status = ServerStatus::Stopped;
                error!(
                    server = %self.name,
                    ?outcome,
                    error_log = %self.paths.error_log.display(),
                    "server failed to start"
                );
                Err(match outcome {
                    Readiness::Exited(code) => ServerError::ExitedEarly {
                        name: self.name.clone(),
                        code,
                    },
                    _ => ServerError::StartTimeout {
                        name: self.name.clone(),
                        timeout: self.start_timeout(),
                    },
                })
            }
        }
    }

    async fn wait_until_ready(&mut self) -> Readiness {
        let timeout = self.start_timeout();
        let started = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, self.ping(true)).await {
                Ok(true) => return Readiness::Up,
                Ok(false) => {}
                Err(_) => return Readiness::TimedOut,
            }
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    if !status.success() {
                        self.child = None;
                        return Readiness::Exited(status.code());
                    }
                }
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Readiness::TimedOut;
            }
            tokio::time::sleep(self.settings.poll_interval.min(timeout - waited)).await;
        }
    }

    /// Graceful shutdown through the client. Never kills the process.
    ///
    /// A process left over from a start that never answered a ping is
    /// shut down and waited on as well.
    pub async fn stop(&mut self) {
        if self.status != ServerStatus::Running && !self.has_process() {
            return;
        }
        let argv = self.client_command(&["--shutdown"]);
        match self.system.execute_cmd(&argv, false).await {
            Ok(out) if !out.success() => {
                warn!(server = %self.name, code = ?out.code, output = %out.output.trim(), "shutdown command failed")
            }
            Ok(_) => debug!(server = %self.name, "shutdown requested"),
            Err(e) => warn!(server = %self.name, error = %e, "could not run shutdown command"),
        }

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(self.settings.shutdown_wait, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.name, code = ?status.code(), "server exited"),
                Ok(Err(e)) => warn!(server = %self.name, error = %e, "could not wait for server"),
                Err(_) => warn!(
                    server = %self.name,
                    wait = ?self.settings.shutdown_wait,
                    "server still running after shutdown request"
                ),
            }
        }
        self.status = ServerStatus::Stopped;
        info!(server = %self.name, "server stopped");
    }

    /// Liveness check. Never fails hard.
    pub async fn ping(&self, quiet: bool) -> bool {
        let argv = self.client_command(&["--ping"]);
        match self.system.execute_cmd(&argv, false).await {
            Ok(out) => {
                if !quiet {
                    debug!(server = %self.name, code = ?out.code, "ping");
                }
                out.success()
            }
            Err(e) => {
                if !quiet {
                    warn!(server = %self.name, error = %e, "ping could not run");
                }
                false
            }
        }
    }

    async fn initialize_databases(&self) -> Result<(), ServerError> {
        let writer = self.system.code_tree.schema_writer.display().to_string();
        for schema in SYSTEM_SCHEMAS {
            let db_opt = self.paths.datadir.join("local").join(schema).join("db.opt");
            let argv = vec![writer.clone(), schema.to_string(), db_opt.display().to_string()];
            self.system.execute_cmd(&argv, true).await?;
        }
        Ok(())
    }

    /// Capture the data directory for later restores.
    pub fn take_db_snapshot(&self) -> Result<(), SystemError> {
        info!(server = %self.name, snapshot = %self.paths.snapshot.display(), "taking clean data snapshot");
        fs::copy_dir(&self.paths.datadir, &self.paths.snapshot)
    }

    /// Replace the data directory with the stored snapshot. A missing
    /// snapshot is logged and leaves the data directory alone.
    pub fn restore_snapshot(&self) -> Result<(), SystemError> {
        if !self.paths.snapshot.exists() {
            error!(server = %self.name, snapshot = %self.paths.snapshot.display(), "could not find snapshot");
            return Ok(());
        }
        debug!(server = %self.name, "restoring data snapshot");
        fs::copy_dir(&self.paths.snapshot, &self.paths.datadir)
    }

    pub fn reset(&mut self) {
        self.tainted = false;
    }

    pub fn mark_failed(&mut self) {
        self.tainted = true;
    }

    pub fn set_options(&mut self, options: Vec<String>) {
        debug!(server = %self.name, from = ?self.options, to = ?options, "updating server options");
        self.options = options;
    }

    /// Release this server's ports.
    pub fn cleanup(&mut self) -> Result<(), PortError> {
        self.lease.release()
    }

    pub fn report(&self) {
        info!(
            owner = %self.owner,
            server = %self.name,
            master_port = self.ports.master,
            drizzle_tcp_port = self.ports.drizzle_tcp,
            mc_port = self.ports.mc,
            pbms_port = self.ports.pbms,
            rabbitmq_node_port = self.ports.rabbitmq,
            vardir = %self.paths.vardir.display(),
            status = %self.status,
            "server"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Up,
    Exited(Option<i32>),
    TimedOut,
}

fn dirset(testdir: &Path) -> DirSpec {
    DirSpec::dir([(
        "var",
        DirSpec::dir([
            ("std_data_ln", DirSpec::Symlink(testdir.join("std_data"))),
            ("log", DirSpec::empty()),
            ("run", DirSpec::empty()),
            ("tmp", DirSpec::empty()),
            (
                "master-data",
                DirSpec::dir([(
                    "local",
                    DirSpec::dir([("test", DirSpec::empty()), ("mysql", DirSpec::empty())]),
                )]),
            ),
        ]),
    )])
}

#[cfg(test)]
pub(crate) fn fast_settings() -> ServerSettings {
    ServerSettings {
        start_timeout: Duration::from_millis(400),
        poll_interval: Duration::from_millis(20),
        shutdown_wait: Duration::from_secs(5),
        ..ServerSettings::default()
    }
}
