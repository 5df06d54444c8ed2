//! On-disk port reservation catalog shared between harness processes.
//!
//! The catalog is a plain text file of `port:owner` lines. Every
//! read-modify-write happens under an exclusive `flock(2)` so that two
//! harness invocations on the same machine never hand out the same port.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::PortError;

/// Handle on the catalog file. Cheap to clone; holds only the path.
#[derive(Debug, Clone)]
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the catalog (creating it if needed) and take the exclusive lock.
    /// The lock is held until the returned guard is dropped.
    pub fn lock(&self) -> Result<CatalogGuard, PortError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;

        flock(&file, libc::LOCK_EX).map_err(|e| self.io_error(e))?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| self.io_error(e))?;

        Ok(CatalogGuard {
            path: self.path.clone(),
            entries: parse_catalog(&content),
            file,
        })
    }

    /// Snapshot of the current reservations.
    pub fn entries(&self) -> Result<BTreeMap<u16, String>, PortError> {
        Ok(self.lock()?.entries.clone())
    }

    fn io_error(&self, source: io::Error) -> PortError {
        PortError::Catalog {
            path: self.path.clone(),
            source,
        }
    }
}

/// Locked view of the catalog. Mutations are persisted by [`CatalogGuard::commit`].
#[derive(Debug)]
pub struct CatalogGuard {
    path: PathBuf,
    entries: BTreeMap<u16, String>,
    file: File,
}

impl CatalogGuard {
    pub fn contains(&self, port: u16) -> bool {
        self.entries.contains_key(&port)
    }

    pub fn owner(&self, port: u16) -> Option<&str> {
        self.entries.get(&port).map(String::as_str)
    }

    pub fn insert(&mut self, port: u16, owner: &str) {
        self.entries.insert(port, owner.to_string());
    }

    /// Returns whether the port was present.
    pub fn remove(&mut self, port: u16) -> bool {
        self.entries.remove(&port).is_some()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(u16, &str) -> bool) {
        self.entries.retain(|port, owner| keep(*port, owner.as_str()));
    }

    pub fn entries(&self) -> &BTreeMap<u16, String> {
        &self.entries
    }

    /// Rewrite the catalog file with the current entries.
    pub fn commit(&mut self) -> Result<(), PortError> {
        let rendered = render_catalog(&self.entries);
        rewrite(&mut self.file, &rendered).map_err(|source| PortError::Catalog {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "port catalog written");
        Ok(())
    }
}

impl Drop for CatalogGuard {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, libc::LOCK_UN) {
            warn!(path = %self.path.display(), error = %e, "failed to unlock port catalog");
        }
    }
}

fn rewrite(file: &mut File, content: &str) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(content.as_bytes())?;
    file.flush()
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor belongs to `file`, which outlives this call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Parse `port:owner` lines. Malformed lines are dropped with a warning.
pub fn parse_catalog(content: &str) -> BTreeMap<u16, String> {
    let mut entries = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((port, owner)) => match port.trim().parse::<u16>() {
                Ok(port) => {
                    entries.insert(port, owner.trim().to_string());
                }
                Err(_) => warn!(%line, "ignoring port catalog line with invalid port"),
            },
            None => warn!(%line, "ignoring malformed port catalog line"),
        }
    }
    entries
}

pub fn render_catalog(entries: &BTreeMap<u16, String>) -> String {
    entries
        .iter()
        .map(|(port, owner)| format!("{port}:{owner}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_garbage() {
        let entries = parse_catalog("9306:exec0.server0@12\nnot a line\nabc:owner\n\n9307:x@1\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[&9306], "exec0.server0@12");
        assert_eq!(entries[&9307], "x@1");
    }

    #[test]
    fn test_commit_persists_and_relocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let catalog = Catalog::new(dir.path().join("nested").join("ports.catalog"));

        {
            let mut guard = catalog.lock().unwrap();
            guard.insert(9306, "exec0.server0@1");
            guard.insert(9400, "exec0.server1@1");
            guard.commit().unwrap();
        }

        let content = std::fs::read_to_string(catalog.path()).unwrap();
        assert_eq!(content, "9306:exec0.server0@1\n9400:exec0.server1@1\n");

        let mut guard = catalog.lock().unwrap();
        assert!(guard.contains(9306));
        assert!(guard.remove(9306));
        assert!(!guard.remove(9306));
        guard.commit().unwrap();
        drop(guard);

        let entries = catalog.entries().unwrap();
        assert_eq!(entries.keys().copied().collect::<Vec<_>>(), vec![9400]);
    }
}
