//! Harness configuration.
//!
//! Two layers: [`HarnessConfig`] holds tunables read from a TOML file
//! (ports, server timing, mode exit codes, logging), and [`RunOptions`] is
//! the fully resolved description of one invocation built from the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::server::{ServerSettings, PORTS_PER_SERVER};
use crate::testing::modes::dtr::DTR_SKIP_CODE;
use crate::testing::Mode;

/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_ENV: &str = "QPRUNNER_CONFIG";

// ---------------------------------------------------------------------------
// File configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub servers: ServersConfig,
    #[serde(default)]
    pub modes: ModesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HarnessConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded harness configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit` (a `--config` argument). Errors here are fatal.
    /// 2. The file named by `QPRUNNER_CONFIG`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "QPRUNNER_CONFIG set but file could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file given, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.block_size < PORTS_PER_SERVER {
            bail!(
                "ports.block_size must be at least {PORTS_PER_SERVER}, got {}",
                self.ports.block_size
            );
        }
        if self.servers.start_timeout_secs == 0 {
            bail!("servers.start_timeout_secs must be positive");
        }
        if self.servers.poll_interval_ms == 0 {
            bail!("servers.poll_interval_ms must be positive");
        }
        Ok(())
    }

    pub fn server_settings(&self, no_secure_file_priv: bool) -> ServerSettings {
        ServerSettings {
            base_port: self.ports.base_port,
            block_size: self.ports.block_size,
            start_timeout: Duration::from_secs(self.servers.start_timeout_secs),
            valgrind_multiplier: self.servers.valgrind_multiplier,
            poll_interval: Duration::from_millis(self.servers.poll_interval_ms),
            shutdown_wait: Duration::from_secs(self.servers.shutdown_wait_secs),
            no_secure_file_priv,
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Port allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First port tried for each server's block.
    pub base_port: u16,
    /// Ports reserved per server.
    pub block_size: usize,
    /// Catalog shared by every harness on this machine.
    pub catalog_path: PathBuf,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base_port: 9306,
            block_size: PORTS_PER_SERVER,
            catalog_path: PathBuf::from("/tmp/qprunner_ports.catalog"),
        }
    }
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersConfig {
    pub start_timeout_secs: u64,
    /// Start timeout multiplier under valgrind.
    pub valgrind_multiplier: u32,
    pub poll_interval_ms: u64,
    pub shutdown_wait_secs: u64,
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: 60,
            valgrind_multiplier: 10,
            poll_interval_ms: 1000,
            shutdown_wait_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModesConfig {
    /// Replay client exit codes recorded as skip.
    pub dtr_skip_codes: Vec<i32>,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            dtr_skip_codes: vec![DTR_SKIP_CODE],
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing level when neither `RUST_LOG` nor a flag sets one.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Run options
// ---------------------------------------------------------------------------

/// Everything one invocation needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: Mode,
    /// Explicit case names to run.
    pub tests: Vec<String>,
    pub suites: Vec<String>,
    pub suite_paths: Vec<PathBuf>,
    pub do_test: Option<String>,
    pub skip_test: Option<String>,
    pub reorder: bool,
    /// As given; see [`RunOptions::normalize`].
    pub repeat: i64,
    pub force: bool,
    pub record: bool,
    pub start_and_exit: bool,

    pub basedir: PathBuf,
    pub testdir: PathBuf,
    /// Defaults to `<testdir>/workdir`.
    pub workdir: Option<PathBuf>,
    pub serverpath: Option<PathBuf>,
    pub clientbindir: Option<PathBuf>,
    pub top_srcdir: Option<PathBuf>,
    pub top_builddir: Option<PathBuf>,

    pub no_shm: bool,
    pub start_dirty: bool,
    pub no_secure_file_priv: bool,
    /// Options passed through to every server.
    pub server_options: Vec<String>,

    pub valgrind: bool,
    pub valgrind_options: Vec<String>,
    pub gdb: bool,

    pub randgen_path: Option<PathBuf>,
    pub default_storage_engine: Option<String>,
    pub verbose: bool,

    pub config: HarnessConfig,
}

impl RunOptions {
    /// Options for `mode` with every path rooted at `testdir`.
    pub fn new(mode: Mode, testdir: impl Into<PathBuf>) -> Self {
        let testdir = testdir.into();
        Self {
            mode,
            tests: Vec::new(),
            suites: Vec::new(),
            suite_paths: Vec::new(),
            do_test: None,
            skip_test: None,
            reorder: false,
            repeat: 1,
            force: false,
            record: false,
            start_and_exit: false,
            basedir: testdir.parent().map(Path::to_path_buf).unwrap_or_else(|| testdir.clone()),
            testdir,
            workdir: None,
            serverpath: None,
            clientbindir: None,
            top_srcdir: None,
            top_builddir: None,
            no_shm: false,
            start_dirty: false,
            no_secure_file_priv: false,
            server_options: Vec::new(),
            valgrind: false,
            valgrind_options: Vec::new(),
            gdb: false,
            randgen_path: None,
            default_storage_engine: None,
            verbose: false,
            config: HarnessConfig::default(),
        }
    }

    /// Apply the cross-option rules: a repeat below 1 runs once, randgen
    /// needs unrestricted file access, and cleanup must not wipe the
    /// workdir it is cleaning.
    pub fn normalize(&mut self) {
        if self.repeat < 1 {
            warn!(repeat = self.repeat, "repeat must be at least 1, running each test once");
            self.repeat = 1;
        }
        match self.mode {
            Mode::Randgen if !self.no_secure_file_priv => {
                debug!("randgen mode, disabling secure-file-priv");
                self.no_secure_file_priv = true;
            }
            Mode::Cleanup if !self.start_dirty => {
                debug!("cleanup mode, keeping the existing workdir");
                self.start_dirty = true;
            }
            _ => {}
        }
    }

    pub fn workdir(&self) -> PathBuf {
        self.workdir.clone().unwrap_or_else(|| self.testdir.join("workdir"))
    }

    pub fn repeat_count(&self) -> u32 {
        u32::try_from(self.repeat.max(1)).unwrap_or(u32::MAX)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.ports.base_port, 9306);
        assert_eq!(cfg.ports.block_size, 5);
        assert_eq!(cfg.ports.catalog_path, PathBuf::from("/tmp/qprunner_ports.catalog"));
        assert_eq!(cfg.servers.start_timeout_secs, 60);
        assert_eq!(cfg.servers.valgrind_multiplier, 10);
        assert_eq!(cfg.modes.dtr_skip_codes, [62]);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);
        assert!(cfg.validate().is_ok());

        let settings = cfg.server_settings(true);
        assert_eq!(settings.start_timeout, Duration::from_secs(60));
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert!(settings.no_secure_file_priv);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[ports]
base_port = 12000
block_size = 6
catalog_path = "/var/tmp/ports.catalog"

[servers]
start_timeout_secs = 120
valgrind_multiplier = 20
poll_interval_ms = 250
shutdown_wait_secs = 10

[modes]
dtr_skip_codes = [62, 63]

[logging]
level = "debug"
format = "json"
"#;
        let cfg: HarnessConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.ports.base_port, 12000);
        assert_eq!(cfg.ports.block_size, 6);
        assert_eq!(cfg.ports.catalog_path, PathBuf::from("/var/tmp/ports.catalog"));
        assert_eq!(cfg.servers.start_timeout_secs, 120);
        assert_eq!(cfg.servers.valgrind_multiplier, 20);
        assert_eq!(cfg.servers.poll_interval_ms, 250);
        assert_eq!(cfg.servers.shutdown_wait_secs, 10);
        assert_eq!(cfg.modes.dtr_skip_codes, [62, 63]);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: HarnessConfig = toml::from_str("[ports]\nbase_port = 10000\n").unwrap();
        assert_eq!(cfg.ports.base_port, 10000);
        assert_eq!(cfg.ports.block_size, 5);
        assert_eq!(cfg.servers.start_timeout_secs, 60);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let cfg: HarnessConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.ports.base_port, 9306);
        assert_eq!(cfg.modes.dtr_skip_codes, [62]);
    }

    #[test]
    fn test_small_block_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("qprunner.toml");
        std::fs::write(&path, "[ports]\nblock_size = 4\n").unwrap();
        let err = HarnessConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("block_size"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("qprunner.toml");
        std::fs::write(&path, "[servers]\nstart_timeout_secs = 5\n").unwrap();
        let cfg = HarnessConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(cfg.servers.start_timeout_secs, 5);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(HarnessConfig::load_or_default(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_normalize_rules() {
        let mut opts = RunOptions::new(Mode::Randgen, "/src/tests");
        opts.repeat = 0;
        opts.normalize();
        assert_eq!(opts.repeat_count(), 1);
        assert!(opts.no_secure_file_priv);
        assert!(!opts.start_dirty);
        assert_eq!(opts.workdir(), PathBuf::from("/src/tests/workdir"));
        assert_eq!(opts.basedir, PathBuf::from("/src"));

        let mut opts = RunOptions::new(Mode::Cleanup, "/src/tests");
        opts.repeat = 3;
        opts.normalize();
        assert_eq!(opts.repeat_count(), 3);
        assert!(opts.start_dirty);
        assert!(!opts.no_secure_file_priv);
    }
}
