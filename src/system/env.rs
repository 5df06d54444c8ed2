//! Environment composition for child processes.
//!
//! The harness never mutates its own environment. Requirements are applied
//! to an owned map which is handed to each spawned process.

use std::collections::BTreeMap;

/// Environment handed to a child process.
pub type Environment = BTreeMap<String, String>;

/// Separator used when appending to path-like variables.
pub const ENV_DELIMITER: &str = ":";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    /// Overwrite any existing value.
    Set,
    /// Add after the existing value.
    Append,
    /// Add before the existing value.
    Prepend,
}

/// One variable the harness wants set in a child environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRequirement {
    pub name: String,
    pub value: String,
    pub mode: EnvMode,
}

impl EnvRequirement {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            mode: EnvMode::Set,
        }
    }

    /// Append several values joined with [`ENV_DELIMITER`].
    pub fn append<S: AsRef<str>>(name: impl Into<String>, values: &[S]) -> Self {
        Self {
            name: name.into(),
            value: join_values(values),
            mode: EnvMode::Append,
        }
    }

    pub fn prepend<S: AsRef<str>>(name: impl Into<String>, values: &[S]) -> Self {
        Self {
            name: name.into(),
            value: join_values(values),
            mode: EnvMode::Prepend,
        }
    }
}

pub fn join_values<S: AsRef<str>>(values: &[S]) -> String {
    values
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(ENV_DELIMITER)
}

/// Apply requirements in order on top of `env`.
pub fn apply(env: &mut Environment, requirements: &[EnvRequirement]) {
    for req in requirements {
        let combined = match (req.mode, env.get(&req.name)) {
            (EnvMode::Set, _) => req.value.clone(),
            (_, None) => req.value.clone(),
            (_, Some(current)) if current.is_empty() => req.value.clone(),
            (EnvMode::Append, Some(current)) => format!("{current}{ENV_DELIMITER}{}", req.value),
            (EnvMode::Prepend, Some(current)) => format!("{}{ENV_DELIMITER}{current}", req.value),
        };
        env.insert(req.name.clone(), combined);
    }
}

/// The harness's own environment as a starting point.
pub fn from_process() -> Environment {
    std::env::vars().collect()
}

/// Expand `${NAME}` references in `input` from `env`. Unknown names expand
/// to the empty string; text without references is returned unchanged.
pub fn expand(input: &str, env: &Environment) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Some(value) = env.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_modes() {
        let mut env = Environment::new();
        env.insert("LD_LIBRARY_PATH".into(), "/usr/lib".into());
        env.insert("LC_ALL".into(), "en_US.UTF-8".into());

        apply(
            &mut env,
            &[
                EnvRequirement::set("LC_ALL", "C"),
                EnvRequirement::append("LD_LIBRARY_PATH", &["/opt/a", "/opt/b"]),
                EnvRequirement::prepend("PERL5LIB", &["/rqg/lib"]),
                EnvRequirement::prepend("PATH", &["/first"]),
            ],
        );

        assert_eq!(env["LC_ALL"], "C");
        assert_eq!(env["LD_LIBRARY_PATH"], "/usr/lib:/opt/a:/opt/b");
        assert_eq!(env["PERL5LIB"], "/rqg/lib");
        assert_eq!(env["PATH"], "/first");
    }

    #[test]
    fn test_prepend_keeps_existing_after() {
        let mut env = Environment::new();
        env.insert("PERL5LIB".into(), "/old".into());
        apply(&mut env, &[EnvRequirement::prepend("PERL5LIB", &["/new"])]);
        assert_eq!(env["PERL5LIB"], "/new:/old");
    }

    #[test]
    fn test_expand_references() {
        let mut env = Environment::new();
        env.insert("MASTER_MYPORT".into(), "9306".into());
        assert_eq!(
            expand("--connect-options=port=${MASTER_MYPORT}", &env),
            "--connect-options=port=9306"
        );
        assert_eq!(expand("${MISSING}x", &env), "x");
        assert_eq!(expand("plain", &env), "plain");
        assert_eq!(expand("open ${NAME", &env), "open ${NAME");
    }
}
