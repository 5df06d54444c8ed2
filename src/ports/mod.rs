//! Port allocation for server instances.
//!
//! Ports are handed out in blocks, one block per server. A port is only
//! assigned if it is absent from the shared catalog and the OS does not
//! report it as bound. Assignments are written to the catalog immediately.

pub mod catalog;

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

pub use self::catalog::Catalog;

/// Lowest port the allocator wraps around to.
pub const MIN_PORT: u16 = 5001;
/// Highest port the allocator will probe before wrapping.
pub const MAX_PORT: u16 = 32767;
/// Failed probes tolerated for a single block request.
pub const MAX_PROBE_ATTEMPTS: u32 = 100;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("could not assign a block of {block_size} ports for {requester} after {attempts} attempts (last tried {last_port})")]
    Exhausted {
        requester: String,
        block_size: usize,
        attempts: u32,
        last_port: u16,
    },

    #[error("port catalog {path}: {source}")]
    Catalog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Asks the OS whether a port can be used.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding a listener. The standard library sets `SO_REUSEADDR`
/// on Unix, so sockets lingering in TIME_WAIT do not block the bind.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortProbe;

impl PortProbe for SystemPortProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

/// Hands out and releases port blocks against the shared catalog.
pub struct PortManager {
    catalog: Catalog,
    probe: Box<dyn PortProbe>,
}

impl std::fmt::Debug for PortManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortManager")
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl PortManager {
    pub fn new(catalog_path: impl Into<PathBuf>) -> Self {
        Self::with_probe(catalog_path, Box::new(SystemPortProbe))
    }

    pub fn with_probe(catalog_path: impl Into<PathBuf>, probe: Box<dyn PortProbe>) -> Self {
        Self {
            catalog: Catalog::new(catalog_path),
            probe,
        }
    }

    pub fn catalog_path(&self) -> &Path {
        self.catalog.path()
    }

    /// Reserve `block_size` ports for `requester`, probing upward from `base_port`.
    ///
    /// Ports in the block need not be contiguous. Running out of probe
    /// attempts is fatal for the run: no test can execute without ports.
    pub fn get_port_block(
        &self,
        requester: &str,
        base_port: u16,
        block_size: usize,
    ) -> Result<PortLease, PortError> {
        let owner = owner_label(requester);
        let mut guard = self.catalog.lock()?;
        let mut ports = Vec::with_capacity(block_size);
        let mut candidate = base_port;
        let mut failures = 0u32;

        while ports.len() < block_size {
            if !guard.contains(candidate) && self.probe.is_free(candidate) {
                guard.insert(candidate, &owner);
                ports.push(candidate);
            } else {
                failures += 1;
                if failures >= MAX_PROBE_ATTEMPTS {
                    return Err(PortError::Exhausted {
                        requester: requester.to_string(),
                        block_size,
                        attempts: failures,
                        last_port: candidate,
                    });
                }
            }
            candidate = next_candidate(candidate);
        }

        // The whole block lands in one write, or none of it does.
        if let Err(e) = guard.commit() {
            for port in &ports {
                guard.remove(*port);
            }
            if let Err(restore) = guard.commit() {
                warn!(path = %self.catalog_path().display(), error = %restore, "could not restore port catalog");
            }
            return Err(e);
        }

        info!(%requester, ports = ?ports, "assigned port block");
        Ok(PortLease {
            ports,
            catalog: self.catalog.clone(),
            released: false,
        })
    }

    pub fn free_port(&self, port: u16) -> Result<(), PortError> {
        self.free_ports(&[port])
    }

    /// Remove ports from the catalog. Absent ports are ignored.
    pub fn free_ports(&self, ports: &[u16]) -> Result<(), PortError> {
        release(&self.catalog, ports)
    }

    pub fn reserved_ports(&self) -> Result<BTreeMap<u16, String>, PortError> {
        self.catalog.entries()
    }

    /// Drop catalog entries whose owning harness process is gone.
    /// Returns the ports that were released.
    pub fn purge_stale(&self) -> Result<Vec<u16>, PortError> {
        let mut guard = self.catalog.lock()?;
        let mut purged = Vec::new();
        guard.retain(|port, owner| {
            let alive = owner_pid(owner).map(process_alive).unwrap_or(false);
            if !alive {
                purged.push(port);
            }
            alive
        });
        if !purged.is_empty() {
            guard.commit()?;
            info!(ports = ?purged, "purged stale port reservations");
        }
        Ok(purged)
    }
}

/// A block of reserved ports. Dropping the lease releases any ports it
/// still holds.
#[derive(Debug)]
pub struct PortLease {
    ports: Vec<u16>,
    catalog: Catalog,
    released: bool,
}

impl PortLease {
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn get(&self, index: usize) -> Option<u16> {
        self.ports.get(index).copied()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Remove this block from the catalog. Calling it again is a no-op.
    pub fn release(&mut self) -> Result<(), PortError> {
        if self.released {
            return Ok(());
        }
        release(&self.catalog, &self.ports)?;
        self.released = true;
        Ok(())
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(ports = ?self.ports, error = %e, "failed to release port block");
        }
    }
}

fn release(catalog: &Catalog, ports: &[u16]) -> Result<(), PortError> {
    let mut guard = catalog.lock()?;
    let mut changed = false;
    for port in ports {
        changed |= guard.remove(*port);
    }
    if changed {
        guard.commit()?;
        debug!(ports = ?ports, "released ports");
    }
    Ok(())
}

fn next_candidate(port: u16) -> u16 {
    if port >= MAX_PORT {
        MIN_PORT
    } else {
        port + 1
    }
}

/// Catalog owner label: `<requester>@<pid>`.
fn owner_label(requester: &str) -> String {
    format!("{}@{}", requester, std::process::id())
}

fn owner_pid(owner: &str) -> Option<i32> {
    owner.rsplit_once('@')?.1.parse().ok()
}

pub(crate) fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
