//! Per-requester server pools and the reconciliation run before each case.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::options::{compare_options, filter_server_options, wants_restart};
use super::{Server, ServerError, ServerInfo, ServerSettings, ServerStatus};
use crate::system::SystemManager;

const SERVER_BASE_NAME: &str = "server";

/// Tracks every server the harness owns, keyed by requester.
#[derive(Debug)]
pub struct ServerManager {
    system: Arc<SystemManager>,
    settings: ServerSettings,
    servers: BTreeMap<String, Vec<Server>>,
}

impl ServerManager {
    pub fn new(system: Arc<SystemManager>, settings: ServerSettings) -> Self {
        Self {
            system,
            settings,
            servers: BTreeMap::new(),
        }
    }

    /// Bring the requester's pool to the requested shape and start it.
    ///
    /// Returns the servers and the number that failed to start (relative
    /// to `expect_fail`). Errors are infrastructure failures and are fatal
    /// for the run.
    pub async fn request_servers(
        &mut self,
        requester: &str,
        workdir: &Path,
        master_count: usize,
        slave_count: usize,
        options: &[String],
        expect_fail: bool,
    ) -> Result<(Vec<ServerInfo>, usize), ServerError> {
        self.check_server_status(requester).await?;
        self.process_server_count(requester, master_count + slave_count, workdir, options)
            .await?;
        self.evaluate_existing_servers(requester, options).await?;
        let bad_start = self.start_servers(requester, expect_fail).await;
        Ok((self.server_infos(requester), bad_start))
    }

    /// Reset every tainted server before it is reused.
    pub async fn check_server_status(&mut self, requester: &str) -> Result<(), ServerError> {
        for server in self.pool_mut(requester).iter_mut() {
            if server.is_tainted() {
                debug!(server = %server.name(), "server tainted by a failed case, resetting");
                reset_server(server).await?;
            }
        }
        Ok(())
    }

    /// Grow the pool with fresh servers or retire servers from its tail.
    pub async fn process_server_count(
        &mut self,
        requester: &str,
        desired: usize,
        workdir: &Path,
        options: &[String],
    ) -> Result<(), ServerError> {
        let options = filter_server_options(options);
        let current = self.server_count(requester);

        if desired > current {
            for index in current..desired {
                let name = format!("{SERVER_BASE_NAME}{index}");
                let server = Server::provision(
                    &name,
                    requester,
                    options.clone(),
                    workdir,
                    self.system.clone(),
                    self.settings.clone(),
                )
                .await?;
                self.pool_mut(requester).push(server);
            }
        } else if desired < current {
            let retired = self.pool_mut(requester).split_off(desired);
            for mut server in retired {
                info!(server = %server.name(), %requester, "retiring server");
                server.stop().await;
                if let Err(e) = server.cleanup() {
                    warn!(server = %server.name(), error = %e, "failed to release ports of retired server");
                }
            }
        }
        Ok(())
    }

    /// Reset and reconfigure servers whose options differ from the
    /// requested set, or when a restart is requested.
    pub async fn evaluate_existing_servers(
        &mut self,
        requester: &str,
        options: &[String],
    ) -> Result<(), ServerError> {
        let restart = wants_restart(options);
        let desired = filter_server_options(options);
        for server in self.pool_mut(requester).iter_mut() {
            if compare_options(server.options(), &desired) && !restart {
                continue;
            }
            reset_server(server).await?;
            server.set_options(desired.clone());
        }
        Ok(())
    }

    /// Start every stopped server. Returns the number of bad starts.
    pub async fn start_servers(&mut self, requester: &str, expect_fail: bool) -> usize {
        let mut bad_start = 0;
        for server in self.pool_mut(requester).iter_mut() {
            if server.status() == ServerStatus::Running {
                continue;
            }
            if let Err(e) = server.start(expect_fail).await {
                warn!(server = %server.name(), error = %e, "bad server start");
                bad_start += 1;
            }
        }
        bad_start
    }

    /// Taint the requester's servers after a failed case.
    pub fn mark_failed(&mut self, requester: &str) {
        for server in self.pool_mut(requester).iter_mut() {
            server.mark_failed();
        }
    }

    pub async fn reset_servers(&mut self, requester: &str) -> Result<(), ServerError> {
        for server in self.pool_mut(requester).iter_mut() {
            reset_server(server).await?;
        }
        Ok(())
    }

    pub async fn stop_servers(&mut self, requester: &str) {
        for server in self.pool_mut(requester).iter_mut() {
            server.stop().await;
        }
    }

    pub async fn stop_all_servers(&mut self) {
        info!("stopping all running servers");
        for server in self.servers.values_mut().flatten() {
            server.stop().await;
        }
    }

    /// Stop everything and release every port. Errors are logged.
    pub async fn cleanup(&mut self) {
        self.stop_all_servers().await;
        self.release_ports();
    }

    /// Release catalog entries without touching running processes.
    pub fn release_ports(&mut self) {
        for server in self.servers.values_mut().flatten() {
            if let Err(e) = server.cleanup() {
                warn!(server = %server.name(), error = %e, "failed to release server ports");
            }
        }
    }

    pub fn server_count(&self, requester: &str) -> usize {
        self.servers.get(requester).map_or(0, Vec::len)
    }

    pub fn total_server_count(&self) -> usize {
        self.servers.values().map(Vec::len).sum()
    }

    pub fn server_infos(&self, requester: &str) -> Vec<ServerInfo> {
        self.servers
            .get(requester)
            .map(|pool| pool.iter().map(Server::info).collect())
            .unwrap_or_default()
    }

    pub fn report(&self, requester: &str) {
        if let Some(pool) = self.servers.get(requester) {
            pool.iter().for_each(Server::report);
        }
    }

    fn pool_mut(&mut self, requester: &str) -> &mut Vec<Server> {
        self.servers.entry(requester.to_string()).or_default()
    }
}

/// stop -> restore snapshot -> clear taint
async fn reset_server(server: &mut Server) -> Result<(), ServerError> {
    server.stop().await;
    server.restore_snapshot()?;
    server.reset();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{fast_settings, PORTS_PER_SERVER};
    use crate::system::testutil::fake_system;
    use std::collections::HashSet;

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn manager(root: &Path, client_exit: i32) -> ServerManager {
        ServerManager::new(fake_system(root, client_exit), fast_settings())
    }

    #[tokio::test]
    async fn test_pool_grows_and_shrinks_from_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = manager(dir.path(), 0);
        let workdir = dir.path().join("workdir/exec0");

        let (servers, bad) = pool
            .request_servers("exec0", &workdir, 1, 2, &[], false)
            .await
            .unwrap();
        assert_eq!(bad, 0);
        assert_eq!(pool.server_count("exec0"), 3);
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["server0", "server1", "server2"]);
        let ports: HashSet<u16> = servers
            .iter()
            .flat_map(|s| [s.ports.master, s.ports.drizzle_tcp, s.ports.mc, s.ports.pbms, s.ports.rabbitmq])
            .collect();
        assert_eq!(ports.len(), 3 * PORTS_PER_SERVER);
        assert!(servers.iter().all(|s| s.status == ServerStatus::Running));

        let (servers, _) = pool
            .request_servers("exec0", &workdir, 1, 0, &[], false)
            .await
            .unwrap();
        assert_eq!(pool.server_count("exec0"), 1);
        assert_eq!(servers[0].name, "server0");
        assert_eq!(
            pool.system.port_manager.reserved_ports().unwrap().len(),
            PORTS_PER_SERVER
        );

        pool.cleanup().await;
        assert!(pool.system.port_manager.reserved_ports().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_option_mismatch_reconfigures() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = manager(dir.path(), 0);
        let workdir = dir.path().join("workdir/exec0");

        pool.request_servers("exec0", &workdir, 1, 0, &opts(&["--a", "--b"]), false)
            .await
            .unwrap();
        let (servers, _) = pool
            .request_servers("exec0", &workdir, 1, 0, &opts(&["--b", "--a"]), false)
            .await
            .unwrap();
        assert_eq!(servers[0].options, opts(&["--a", "--b"]));

        let (servers, _) = pool
            .request_servers("exec0", &workdir, 1, 0, &opts(&["--c", "--skip-core-file"]), false)
            .await
            .unwrap();
        assert_eq!(servers[0].options, opts(&["--c"]));
        assert_eq!(servers[0].status, ServerStatus::Running);
        pool.cleanup().await;
    }

    #[tokio::test]
    async fn test_tainted_servers_are_reset() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = manager(dir.path(), 0);
        let workdir = dir.path().join("workdir/exec0");

        let (servers, _) = pool
            .request_servers("exec0", &workdir, 1, 0, &[], false)
            .await
            .unwrap();
        let stray = servers[0].paths.datadir.join("local/test/t1.dfe");
        std::fs::write(&stray, b"rows").unwrap();

        pool.mark_failed("exec0");
        assert!(pool.server_infos("exec0")[0].tainted);

        let (servers, _) = pool
            .request_servers("exec0", &workdir, 1, 0, &[], false)
            .await
            .unwrap();
        assert!(!servers[0].tainted);
        assert!(!stray.exists());
        pool.cleanup().await;
    }

    #[tokio::test]
    async fn test_bad_starts_are_counted() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = manager(dir.path(), 1);
        let workdir = dir.path().join("workdir/exec0");

        let (_, bad) = pool
            .request_servers("exec0", &workdir, 2, 0, &[], false)
            .await
            .unwrap();
        assert_eq!(bad, 2);
        assert_eq!(pool.server_count("exec0"), 2);

        let (_, bad) = pool
            .request_servers("exec0", &workdir, 2, 0, &[], true)
            .await
            .unwrap();
        assert_eq!(bad, 0);
        pool.cleanup().await;
    }

    #[tokio::test]
    async fn test_requesters_are_isolated() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = manager(dir.path(), 0);

        pool.request_servers("exec0", &dir.path().join("workdir/exec0"), 1, 0, &[], false)
            .await
            .unwrap();
        pool.request_servers("exec1", &dir.path().join("workdir/exec1"), 2, 0, &[], false)
            .await
            .unwrap();
        assert_eq!(pool.server_count("exec0"), 1);
        assert_eq!(pool.server_count("exec1"), 2);
        assert_eq!(pool.total_server_count(), 3);
        assert_eq!(pool.server_count("nobody"), 0);
        pool.cleanup().await;
    }
}
