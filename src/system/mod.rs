//! System-level plumbing shared by every other component: the working
//! directory, the child-process environment, command execution, and the
//! resolved code tree.

pub mod code_tree;
pub mod env;
pub mod fs;
pub mod instrument;
pub mod process;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::ports::PortManager;

use self::code_tree::CodeTree;
use self::env::{EnvRequirement, Environment};
use self::fs::DirSpec;
use self::instrument::Instrumentation;
use self::process::{display_command, run_command, CommandOutput};

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}` failed with code {code:?}: {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("empty command line")]
    EmptyCommand,
}

impl SystemError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        SystemError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Harness-wide knobs the system layer needs.
#[derive(Debug, Clone)]
pub struct SystemSettings {
    pub workdir: PathBuf,
    pub start_dirty: bool,
    pub no_shm: bool,
    pub instrumentation: Instrumentation,
}

/// Context object handed to servers, executors, and modes.
#[derive(Debug)]
pub struct SystemManager {
    pub settings: SystemSettings,
    pub code_tree: CodeTree,
    pub port_manager: PortManager,
    shm_path: Option<PathBuf>,
    base_environment: Environment,
}

impl SystemManager {
    pub fn new(settings: SystemSettings, code_tree: CodeTree, port_manager: PortManager) -> Self {
        let mut base_environment = env::from_process();
        env::apply(&mut base_environment, &system_requirements(&code_tree));
        env::apply(&mut base_environment, &settings.instrumentation.environment());

        Self {
            shm_path: fs::find_path(&["/dev/shm", "/tmp"]),
            settings,
            code_tree,
            port_manager,
            base_environment,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.settings.workdir
    }

    pub fn start_dirty(&self) -> bool {
        self.settings.start_dirty
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.settings.instrumentation
    }

    pub fn command_prefix(&self) -> Vec<String> {
        self.settings.instrumentation.command_prefix()
    }

    /// Environment every child starts from.
    pub fn base_environment(&self) -> &Environment {
        &self.base_environment
    }

    /// Base environment with `requirements` applied on top.
    pub fn working_environment(&self, requirements: &[EnvRequirement]) -> Environment {
        let mut environment = self.base_environment.clone();
        env::apply(&mut environment, requirements);
        environment
    }

    /// Create (or, with start-dirty, reuse) the working directory. Unless
    /// disabled, the workdir is a symlink into shared memory.
    pub fn prepare_workdir(&self) -> Result<(), SystemError> {
        let workdir = self.workdir();
        if std::fs::symlink_metadata(workdir).is_ok() {
            if self.start_dirty() {
                info!(workdir = %workdir.display(), "start-dirty set, leaving working directory untouched");
                return Ok(());
            }
            fs::remove_dir(workdir)?;
        }

        match (&self.shm_path, self.settings.no_shm) {
            (_, true) => {
                info!("no-shm set, not linking workdir to shared memory");
                fs::create_dir(workdir, false)
            }
            (None, false) => {
                info!("no shared memory path found, not linking workdir to shared memory");
                fs::create_dir(workdir, false)
            }
            (Some(shm), false) => {
                let shm_workdir = shm.join(shm_dir_name(workdir));
                fs::create_dir(&shm_workdir, false)?;
                info!(workdir = %workdir.display(), target = %shm_workdir.display(), "linking workdir to shared memory");
                fs::create_symlink(&shm_workdir, workdir)
            }
        }
    }

    /// Realize a directory tree at `root/name`, honoring start-dirty.
    pub fn create_dirset(&self, root: &Path, name: &str, spec: &DirSpec) -> Result<PathBuf, SystemError> {
        fs::create_dirset(root, name, spec, self.start_dirty())
    }

    /// Run a utility command with the base environment. With `must_pass`,
    /// a nonzero exit is an error.
    pub async fn execute_cmd(&self, argv: &[String], must_pass: bool) -> Result<CommandOutput, SystemError> {
        debug!(command = %display_command(argv), "executing command");
        let out = run_command(argv, Some(&self.base_environment), None).await?;
        if must_pass && !out.success() {
            error!(command = %display_command(argv), code = ?out.code, output = %out.output, "command failed");
            return Err(SystemError::CommandFailed {
                command: display_command(argv),
                code: out.code,
                output: out.output,
            });
        }
        Ok(out)
    }
}

fn system_requirements(tree: &CodeTree) -> Vec<EnvRequirement> {
    let lib_paths: Vec<String> = tree
        .ld_lib_paths
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    vec![
        EnvRequirement::set("UMASK", "0660"),
        EnvRequirement::set("UMASK_DIR", "0770"),
        EnvRequirement::set("LC_ALL", "C"),
        EnvRequirement::set("LC_CTYPE", "C"),
        EnvRequirement::set("LC_COLLATE", "C"),
        EnvRequirement::set("USE_RUNNING_SERVER", "0"),
        EnvRequirement::set("TOP_SRCDIR", tree.srcdir.display().to_string()),
        EnvRequirement::set("TOP_BUILDDIR", tree.builddir.display().to_string()),
        EnvRequirement::set("DRIZZLE_TEST_DIR", tree.testdir.display().to_string()),
        EnvRequirement::set("DTR_BUILD_THREAD", "-69.5"),
        EnvRequirement::append("LD_LIBRARY_PATH", &lib_paths),
        EnvRequirement::append("DYLD_LIBRARY_PATH", &lib_paths),
    ]
}

/// Stable per-workdir directory name inside shared memory.
fn shm_dir_name(workdir: &Path) -> String {
    let flattened: String = workdir
        .display()
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("qprunner{}", flattened)
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Fake code trees built from shell scripts.

    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::*;
    use crate::ports::PortProbe;

    pub struct AlwaysFree;

    impl PortProbe for AlwaysFree {
        fn is_free(&self, _port: u16) -> bool {
            true
        }
    }

    pub fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// A code tree whose client answers pings with `client_exit`.
    pub fn fake_tree(root: &Path, client_exit: i32) -> CodeTree {
        let bin = root.join("bin");
        let testdir = root.join("tests");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(testdir.join("std_data")).unwrap();

        write_script(&bin.join("drizzled"), "exit 0");
        write_script(&bin.join("drizzle"), &format!("exit {client_exit}"));
        write_script(&bin.join("schema_writer"), "mkdir -p \"$(dirname \"$2\")\" && echo \"$1\" > \"$2\"");
        for tool in ["drizzledump", "drizzleimport", "drizzleslap", "drizzletest"] {
            write_script(&bin.join(tool), "exit 0");
        }

        CodeTree {
            basedir: root.to_path_buf(),
            builddir: root.to_path_buf(),
            srcdir: root.to_path_buf(),
            testdir: testdir.clone(),
            clientbindir: bin.clone(),
            source_dist: false,
            suite_paths: vec![testdir.join("suite")],
            server: bin.join("drizzled"),
            client: bin.join("drizzle"),
            dump: bin.join("drizzledump"),
            import: bin.join("drizzleimport"),
            slap: bin.join("drizzleslap"),
            schema_writer: bin.join("schema_writer"),
            replay_client: bin.join("drizzletest"),
            trx_reader: None,
            version: None,
            ld_lib_paths: vec![root.join("lib")],
        }
    }

    pub fn fake_system(root: &Path, client_exit: i32) -> Arc<SystemManager> {
        let tree = fake_tree(root, client_exit);
        let workdir: PathBuf = root.join("workdir");
        std::fs::create_dir_all(&workdir).unwrap();
        let settings = SystemSettings {
            workdir,
            start_dirty: false,
            no_shm: true,
            instrumentation: Instrumentation::None,
        };
        let ports = PortManager::with_probe(root.join("ports.catalog"), Box::new(AlwaysFree));
        Arc::new(SystemManager::new(settings, tree, ports))
    }
}
