//! Locating the server build under test: binaries, client tools, test dir,
//! and the version banner reported by the server executable.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::fs::find_path;
use super::process::run_command;

#[derive(Debug, Error)]
pub enum CodeTreeError {
    #[error("required {what} not found; searched: {searched}")]
    NotFound { what: &'static str, searched: String },

    #[error("could not run {path} --version: {reason}")]
    VersionCommand { path: PathBuf, reason: String },

    #[error("unrecognized server version banner: {banner:?}")]
    MalformedVersion { banner: String },
}

/// Where to look for the tree. Unset entries are derived from `basedir`.
#[derive(Debug, Clone)]
pub struct TreeLocations {
    pub basedir: PathBuf,
    pub testdir: PathBuf,
    pub top_srcdir: Option<PathBuf>,
    pub top_builddir: Option<PathBuf>,
    pub clientbindir: Option<PathBuf>,
    pub serverpath: Option<PathBuf>,
}

/// Parsed `<exe> Ver <version> for <os> on <platform> <comment>` banner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerVersion {
    pub executable: String,
    pub version: String,
    pub compile_os: String,
    pub platform: String,
    pub comment: String,
}

/// Resolved paths for the build under test.
#[derive(Debug, Clone)]
pub struct CodeTree {
    pub basedir: PathBuf,
    pub builddir: PathBuf,
    pub srcdir: PathBuf,
    pub testdir: PathBuf,
    pub clientbindir: PathBuf,
    pub source_dist: bool,
    pub suite_paths: Vec<PathBuf>,

    pub server: PathBuf,
    pub client: PathBuf,
    pub dump: PathBuf,
    pub import: PathBuf,
    pub slap: PathBuf,
    pub schema_writer: PathBuf,
    pub replay_client: PathBuf,
    pub trx_reader: Option<PathBuf>,

    pub version: Option<ServerVersion>,
    pub ld_lib_paths: Vec<PathBuf>,
}

impl CodeTree {
    /// Resolve every required path and read the server version.
    /// Any missing required path or an unparseable banner is fatal.
    pub async fn discover(loc: &TreeLocations) -> Result<Self, CodeTreeError> {
        let basedir = absolute(&loc.basedir);
        let testdir = require("test directory", &[absolute(&loc.testdir)])?;
        let basedir = require("base directory", &[basedir])?;
        let builddir = loc
            .top_builddir
            .as_deref()
            .map(absolute)
            .unwrap_or_else(|| basedir.clone());
        let source_dist = basedir.join("drizzled").is_dir();

        let clientbindir = match &loc.clientbindir {
            Some(dir) => require("client bin directory", &[absolute(dir)])?,
            None => require(
                "client bin directory",
                &[builddir.join("client"), basedir.join("client"), basedir.join("bin")],
            )?,
        };

        let server = match &loc.serverpath {
            Some(path) => require("server executable", &[absolute(path)])?,
            None => require(
                "server executable",
                &[
                    basedir.join("drizzled/drizzled"),
                    clientbindir.join("drizzled"),
                    basedir.join("libexec/drizzled"),
                    basedir.join("bin/drizzled"),
                    basedir.join("sbin/drizzled"),
                    builddir.join("drizzled/drizzled"),
                ],
            )?,
        };

        let mut tree = CodeTree {
            srcdir: loc
                .top_srcdir
                .as_deref()
                .map(absolute)
                .unwrap_or_else(|| basedir.clone()),
            suite_paths: vec![basedir.join("plugin"), testdir.join("suite")],
            client: require("client", &[clientbindir.join("drizzle")])?,
            dump: require("dump utility", &[clientbindir.join("drizzledump")])?,
            import: require("import utility", &[clientbindir.join("drizzleimport")])?,
            slap: require("load generator", &[clientbindir.join("drizzleslap")])?,
            replay_client: require("replay client", &[clientbindir.join("drizzletest")])?,
            schema_writer: require(
                "schema writer",
                &[
                    basedir.join("drizzled/message/schema_writer"),
                    builddir.join("drizzled/message/schema_writer"),
                ],
            )?,
            trx_reader: find_path(&[basedir.join("plugin/transaction_log/utilities/drizzletrx")]),
            ld_lib_paths: ld_lib_paths(&basedir, source_dist),
            version: None,
            basedir,
            builddir,
            testdir,
            clientbindir,
            source_dist,
            server,
        };

        tree.version = Some(read_server_version(&tree.server).await?);
        Ok(tree)
    }

    pub fn report(&self) {
        let version = self.version.as_ref();
        info!(
            basedir = %self.basedir.display(),
            clientbindir = %self.clientbindir.display(),
            testdir = %self.testdir.display(),
            server_version = version.map(|v| v.version.as_str()).unwrap_or("unknown"),
            server_compile_os = version.map(|v| v.compile_os.as_str()).unwrap_or("unknown"),
            server_platform = version.map(|v| v.platform.as_str()).unwrap_or("unknown"),
            server_comment = version.map(|v| v.comment.as_str()).unwrap_or(""),
            "using server source tree"
        );
    }
}

async fn read_server_version(server: &Path) -> Result<ServerVersion, CodeTreeError> {
    let argv = vec![
        server.display().to_string(),
        "--no-defaults".to_string(),
        "--version".to_string(),
    ];
    let out = run_command(&argv, None, None)
        .await
        .map_err(|e| CodeTreeError::VersionCommand {
            path: server.to_path_buf(),
            reason: e.to_string(),
        })?;
    parse_version_banner(&out.output)
}

/// Split a `--version` banner into its parts.
pub fn parse_version_banner(banner: &str) -> Result<ServerVersion, CodeTreeError> {
    let malformed = || CodeTreeError::MalformedVersion {
        banner: banner.to_string(),
    };
    let banner_line = banner.trim();

    let (executable, rest) = banner_line.split_once("Ver ").ok_or_else(malformed)?;
    let (version, rest) = rest.split_once("for ").ok_or_else(malformed)?;
    let (compile_os, rest) = rest.split_once(" on ").ok_or_else(malformed)?;
    let rest = rest.trim();
    let platform = rest.split(' ').next().unwrap_or("").trim();
    if executable.trim().is_empty() || version.trim().is_empty() || platform.is_empty() {
        return Err(malformed());
    }

    Ok(ServerVersion {
        executable: executable.trim().to_string(),
        version: version.trim().to_string(),
        compile_os: compile_os.trim().to_string(),
        platform: platform.to_string(),
        comment: rest[platform.len()..].trim().to_string(),
    })
}

fn ld_lib_paths(basedir: &Path, source_dist: bool) -> Vec<PathBuf> {
    if !source_dist {
        return vec![basedir.join("lib")];
    }
    [
        "libdrizzleclient/.libs/",
        "libdrizzle-2.0/libdrizzle.libs",
        "libdrizzle/.libs",
        "libdrizzle-2.0/libdrizzle/.libs",
        "libdrizzle-1.0/libdrizzle/.libs",
        "mysys/.libs/",
        "mystrings/.libs/",
        "drizzled/.libs/",
    ]
    .iter()
    .map(|p| basedir.join(p))
    .chain(std::iter::once(PathBuf::from("/usr/local/lib")))
    .collect()
}

fn require(what: &'static str, candidates: &[PathBuf]) -> Result<PathBuf, CodeTreeError> {
    find_path(candidates).ok_or_else(|| CodeTreeError::NotFound {
        what,
        searched: candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
