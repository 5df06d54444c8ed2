//! Protocol-replay mode: `.test` scripts replayed by the replay client and
//! compared against recorded `.result` files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{classify_exit, file_name, sorted_entries, CaseContext, Mode, ModeHandler, ModeSettings};
use crate::system::env::Environment;
use crate::system::process::run_command;
use crate::system::{SystemError, SystemManager};
use crate::testing::{CaseBody, Execution, TestCase, TestStatus};

/// Replay client exit code for a skipped test.
pub const DTR_SKIP_CODE: i32 = 62;

#[derive(Debug)]
pub struct DtrMode {
    settings: ModeSettings,
    skip_codes: Vec<i32>,
}

impl DtrMode {
    pub fn new(settings: ModeSettings) -> Self {
        let skip_codes = if settings.skip_codes.is_empty() {
            vec![DTR_SKIP_CODE]
        } else {
            settings.skip_codes.clone()
        };
        Self { settings, skip_codes }
    }

    fn suite_dirs(&self, system: &SystemManager) -> anyhow::Result<Vec<(String, PathBuf)>> {
        let roots = self
            .settings
            .suite_paths
            .iter()
            .chain(system.code_tree.suite_paths.iter());

        let mut found = Vec::new();
        for root in roots {
            for dir in sorted_entries(root)? {
                let suite_dir = if dir.join("t").is_dir() {
                    dir.clone()
                } else if dir.join("tests/t").is_dir() {
                    dir.join("tests")
                } else {
                    continue;
                };
                let suite = file_name(&dir);
                if self.settings.suites.is_empty() || self.settings.suites.contains(&suite) {
                    found.push((suite, suite_dir));
                }
            }
        }
        Ok(found)
    }

    fn suite_cases(&self, suite: &str, suite_dir: &Path) -> anyhow::Result<Vec<TestCase>> {
        let tdir = suite_dir.join("t");
        let rdir = suite_dir.join("r");
        let disabled = read_disabled(&tdir.join("disabled.def"))?;

        let mut cases = Vec::new();
        for test_file in sorted_entries(&tdir)? {
            if test_file.extension().and_then(|e| e.to_str()) != Some("test") {
                continue;
            }
            let name = test_file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();

            let result_file = rdir.join(format!("{name}.result"));
            let mut case = TestCase::new(
                suite,
                &name,
                CaseBody::Replay {
                    result_file: result_file.exists().then_some(result_file),
                    test_file: test_file.clone(),
                },
            );

            let opt_file = tdir.join(format!("{name}-master.opt"));
            if opt_file.is_file() {
                let content = std::fs::read_to_string(&opt_file)
                    .with_context(|| format!("failed to read {}", opt_file.display()))?;
                case.server_options = content.split_whitespace().map(str::to_string).collect();
            }
            if let Some(engine) = &self.settings.default_storage_engine {
                case.server_options.push(format!("--default-storage-engine={engine}"));
            }

            let master_sh = tdir.join(format!("{name}-master.sh"));
            case.master_sh = master_sh.is_file().then_some(master_sh);
            case.disabled = disabled.get(&name).cloned();
            cases.push(case);
        }
        debug!(%suite, count = cases.len(), "discovered suite");
        Ok(cases)
    }

    fn replay_command(&self, ctx: &CaseContext<'_>, test_file: &Path, result_file: Option<&Path>) -> Vec<String> {
        let tree = &ctx.system.code_tree;
        let mut argv = vec![
            tree.replay_client.display().to_string(),
            "--no-defaults".to_string(),
            "--silent".to_string(),
            format!("--logdir={}", ctx.logdir.display()),
            "--database=test".to_string(),
            "--user=root".to_string(),
            "--password=".to_string(),
            format!("--testdir={}", tree.testdir.display()),
            format!("--test-file={}", test_file.display()),
            "--tail-lines=20".to_string(),
            format!("--timer-file={}", ctx.logdir.join("timer").display()),
        ];
        if let Some(master) = ctx.master() {
            argv.push(format!("--tmpdir={}", master.paths.tmpdir.display()));
            argv.push(format!("--port={}", master.ports.master));
        }
        // Recording a new test writes r/<name>.result next to t/.
        let result_file = match result_file {
            Some(path) => Some(path.to_path_buf()),
            None if ctx.record => test_file
                .parent()
                .and_then(Path::parent)
                .map(|suite| suite.join("r").join(format!("{}.result", ctx.case.name))),
            None => None,
        };
        if let Some(result) = result_file {
            argv.push(format!("--result-file={}", result.display()));
        }
        if ctx.record {
            argv.push("--record".to_string());
        }
        argv
    }
}

#[async_trait]
impl ModeHandler for DtrMode {
    fn mode(&self) -> Mode {
        Mode::Dtr
    }

    fn discover(&self, system: &SystemManager) -> anyhow::Result<Vec<TestCase>> {
        let mut cases = Vec::new();
        for (suite, dir) in self.suite_dirs(system)? {
            cases.extend(self.suite_cases(&suite, &dir)?);
        }
        info!(count = cases.len(), "found replay tests");
        Ok(cases)
    }

    async fn execute_case(&self, ctx: &CaseContext<'_>, env: &Environment) -> Result<Execution, SystemError> {
        let CaseBody::Replay { test_file, result_file } = &ctx.case.body else {
            return Ok(Execution::default());
        };
        let argv = self.replay_command(ctx, test_file, result_file.as_deref());
        let out = run_command(&argv, Some(env), Some(&ctx.system.code_tree.testdir)).await?;
        Ok(Execution {
            retcode: out.code,
            output: out.output,
            elapsed: out.elapsed,
        })
    }

    fn classify_result(&self, _case: &TestCase, execution: &Execution) -> TestStatus {
        classify_exit(execution.retcode, &self.skip_codes)
    }
}

/// `name : reason` lines; `#` starts a comment.
fn read_disabled(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_disabled(&content))
}

fn parse_disabled(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once(':') {
            Some((name, reason)) => (name.trim().to_string(), reason.trim().to_string()),
            None => (line.to_string(), "disabled".to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::testutil::{fake_system, write_script};
    use crate::testing::modes::testutil::master_info;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_disabled() {
        let parsed = parse_disabled("# comment\nalias : Bug#1234\n\nbool\n");
        assert_eq!(parsed["alias"], "Bug#1234");
        assert_eq!(parsed["bool"], "disabled");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_discovers_suites_and_plugin_tests() {
        let dir = tempfile::TempDir::new().unwrap();
        let system = fake_system(dir.path(), 0);
        let suite = dir.path().join("tests/suite/main");
        write(&suite.join("t/alias.test"), "SELECT 1;\n");
        write(&suite.join("t/alias-master.opt"), "--restart --innodb.buffer-pool-size=16M\n");
        write(&suite.join("r/alias.result"), "1\n");
        write(&suite.join("t/bool.test"), "SELECT TRUE;\n");
        write(&suite.join("t/bool-master.sh"), "true\n");
        write(&suite.join("t/disabled.def"), "bool : flaky\n");
        write(&suite.join("t/README"), "not a test\n");
        let plugins = dir.path().join("plugin");
        write(&plugins.join("auth_file/tests/t/basic.test"), "SELECT 1;\n");

        let mode = DtrMode::new(ModeSettings {
            suite_paths: vec![plugins],
            default_storage_engine: Some("myisam".into()),
            ..ModeSettings::default()
        });
        let cases = mode.discover(&system).unwrap();
        let names: Vec<_> = cases.iter().map(TestCase::fullname).collect();
        assert_eq!(names, ["auth_file.basic", "main.alias", "main.bool"]);

        let alias = &cases[1];
        assert_eq!(
            alias.server_options,
            ["--restart", "--innodb.buffer-pool-size=16M", "--default-storage-engine=myisam"]
        );
        assert!(matches!(&alias.body, CaseBody::Replay { result_file: Some(_), .. }));
        assert!(alias.disabled.is_none());

        let bool_case = &cases[2];
        assert_eq!(bool_case.disabled.as_deref(), Some("flaky"));
        assert!(bool_case.master_sh.is_some());
        assert!(matches!(&bool_case.body, CaseBody::Replay { result_file: None, .. }));
    }

    #[test]
    fn test_suite_filter() {
        let dir = tempfile::TempDir::new().unwrap();
        let system = fake_system(dir.path(), 0);
        write(&dir.path().join("tests/suite/main/t/a.test"), "");
        write(&dir.path().join("tests/suite/jp/t/b.test"), "");

        let mode = DtrMode::new(ModeSettings {
            suites: vec!["jp".into()],
            ..ModeSettings::default()
        });
        let cases = mode.discover(&system).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].fullname(), "jp.b");
    }

    #[tokio::test]
    async fn test_execute_passes_record_and_classifies_skip() {
        let dir = tempfile::TempDir::new().unwrap();
        let system = fake_system(dir.path(), 0);
        write_script(&system.code_tree.replay_client, "echo \"$@\"\necho port=$MASTER_MYPORT\nexit 62");
        let test_file = dir.path().join("tests/suite/main/t/alias.test");
        write(&test_file, "");

        let mode = DtrMode::new(ModeSettings::default());
        let case = TestCase::new(
            "main",
            "alias",
            CaseBody::Replay {
                test_file,
                result_file: None,
            },
        );
        let servers = [master_info(dir.path())];
        let ctx = CaseContext {
            case: &case,
            servers: &servers,
            system: &system,
            workdir: dir.path(),
            logdir: dir.path(),
            record: true,
        };
        let env = mode.compose_environment(&ctx);
        let exec = mode.execute_case(&ctx, &env).await.unwrap();

        assert_eq!(exec.retcode, Some(62));
        assert!(exec.output.contains("--record"));
        assert!(exec.output.contains("--port=9306"));
        assert!(exec.output.contains("main/r/alias.result"));
        assert!(exec.output.contains("port=9306"));
        assert_eq!(mode.classify_result(&case, &exec), TestStatus::Skip);
        assert_eq!(
            mode.classify_result(&case, &Execution { retcode: Some(1), ..Execution::default() }),
            TestStatus::Fail
        );
    }
}
