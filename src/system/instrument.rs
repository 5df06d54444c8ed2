//! Wrapping server processes in valgrind or gdb.

use std::path::{Path, PathBuf};

use super::env::EnvRequirement;

/// Default valgrind options, replaced wholesale by user-supplied ones.
pub const DEFAULT_VALGRIND_ARGS: &[&str] = &[
    "--show-reachable=yes",
    "--malloc-fill=0xDEADBEEF",
    "--free-fill=0xDEADBEEF",
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Instrumentation {
    #[default]
    None,
    Valgrind {
        args: Vec<String>,
        suppressions: Option<PathBuf>,
        libtool: Option<PathBuf>,
    },
    Gdb,
}

impl Instrumentation {
    /// Valgrind with the suppressions file from `testdir` when present.
    /// An empty `user_args` keeps [`DEFAULT_VALGRIND_ARGS`].
    pub fn valgrind(user_args: Vec<String>, testdir: &Path, libtool: Option<PathBuf>) -> Self {
        let args = if user_args.is_empty() {
            DEFAULT_VALGRIND_ARGS.iter().map(|s| s.to_string()).collect()
        } else {
            user_args
        };
        let supp = testdir.join("valgrind.supp");
        Instrumentation::Valgrind {
            args,
            suppressions: supp.exists().then_some(supp),
            libtool,
        }
    }

    /// Arguments placed before the server executable.
    pub fn command_prefix(&self) -> Vec<String> {
        match self {
            Instrumentation::None => Vec::new(),
            Instrumentation::Valgrind {
                args,
                suppressions,
                libtool,
            } => {
                let mut prefix = Vec::new();
                if let Some(libtool) = libtool {
                    prefix.push(libtool.display().to_string());
                    prefix.push("--mode=execute".to_string());
                }
                prefix.extend(
                    ["valgrind", "--tool=memcheck", "--leak-check=yes", "--num-callers=16"]
                        .iter()
                        .map(|s| s.to_string()),
                );
                if let Some(supp) = suppressions {
                    prefix.push(format!("--suppressions={}", supp.display()));
                }
                prefix.extend(args.iter().cloned());
                prefix
            }
            Instrumentation::Gdb => ["gdb", "-batch", "-ex", "run", "-ex", "bt", "--args"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Factor applied to the server start timeout.
    pub fn timeout_multiplier(&self, valgrind_multiplier: u32) -> u32 {
        match self {
            Instrumentation::Valgrind { .. } => valgrind_multiplier.max(1),
            _ => 1,
        }
    }

    pub fn environment(&self) -> Vec<EnvRequirement> {
        match self {
            Instrumentation::Valgrind { .. } => {
                let mut reqs = vec![EnvRequirement::set("VALGRIND_RUN", "1")];
                let debug_libs = Path::new("/usr/lib/debug");
                if debug_libs.exists() {
                    reqs.push(EnvRequirement::append("LD_LIBRARY_PATH", &["/usr/lib/debug"]));
                    reqs.push(EnvRequirement::append("DYLD_LIBRARY_PATH", &["/usr/lib/debug"]));
                }
                reqs
            }
            _ => Vec::new(),
        }
    }
}

/// `../libtool` relative to the test dir, if executable. Used to run
/// valgrind and gdb against libtool wrapper scripts in a source build.
pub fn find_libtool(testdir: &Path) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let candidate = testdir.join("../libtool");
    let meta = std::fs::metadata(&candidate).ok()?;
    (meta.is_file() && meta.permissions().mode() & 0o111 != 0).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valgrind_prefix_uses_defaults_and_suppressions() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("valgrind.supp"), b"").unwrap();

        let inst = Instrumentation::valgrind(Vec::new(), dir.path(), None);
        let prefix = inst.command_prefix();
        assert_eq!(prefix[0], "valgrind");
        assert!(prefix.contains(&"--leak-check=yes".to_string()));
        assert!(prefix.iter().any(|a| a.starts_with("--suppressions=")));
        assert_eq!(prefix.last().unwrap(), "--free-fill=0xDEADBEEF");
        assert_eq!(inst.timeout_multiplier(10), 10);
    }

    #[test]
    fn test_user_valgrind_args_replace_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let inst = Instrumentation::valgrind(
            vec!["--track-origins=yes".into()],
            dir.path(),
            Some(PathBuf::from("../libtool")),
        );
        let prefix = inst.command_prefix();
        assert_eq!(&prefix[..3], &["../libtool", "--mode=execute", "valgrind"]);
        assert!(!prefix.contains(&"--show-reachable=yes".to_string()));
        assert_eq!(prefix.last().unwrap(), "--track-origins=yes");
    }

    #[test]
    fn test_plain_and_gdb() {
        assert!(Instrumentation::None.command_prefix().is_empty());
        assert_eq!(Instrumentation::None.timeout_multiplier(10), 1);
        assert_eq!(Instrumentation::Gdb.command_prefix().last().unwrap(), "--args");
        assert!(Instrumentation::Gdb.environment().is_empty());
    }
}
