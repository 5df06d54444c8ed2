//! Directory provisioning, recursive copies, and symlinks.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use super::SystemError;

/// Declarative directory tree used to provision working directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirSpec {
    /// A directory with named children (possibly none).
    Dir(Vec<(String, DirSpec)>),
    /// A symlink pointing at the given target.
    Symlink(PathBuf),
}

impl DirSpec {
    pub fn empty() -> Self {
        DirSpec::Dir(Vec::new())
    }

    pub fn dir<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = (S, DirSpec)>,
        S: Into<String>,
    {
        DirSpec::Dir(children.into_iter().map(|(n, s)| (n.into(), s)).collect())
    }
}

/// Realize `spec` as `root/name`. Existing directories are wiped first
/// unless `keep_existing` is set. Returns the full path of `root/name`.
pub fn create_dirset(
    root: &Path,
    name: &str,
    spec: &DirSpec,
    keep_existing: bool,
) -> Result<PathBuf, SystemError> {
    let full_path = root.join(name);
    match spec {
        DirSpec::Symlink(target) => create_symlink(target, &full_path)?,
        DirSpec::Dir(children) => {
            create_dir(&full_path, keep_existing)?;
            for (child, child_spec) in children {
                create_dirset(&full_path, child, child_spec, keep_existing)?;
            }
        }
    }
    Ok(full_path)
}

/// Create `path`, removing whatever was there unless `keep_existing`.
pub fn create_dir(path: &Path, keep_existing: bool) -> Result<(), SystemError> {
    if exists_or_link(path) {
        if keep_existing {
            return Ok(());
        }
        remove_dir(path)?;
    }
    debug!(path = %path.display(), "creating directory");
    fs::create_dir_all(path).map_err(|e| SystemError::io(path, e))
}

/// Remove a directory tree, or just the link if `path` is a symlink.
/// A missing path is not an error.
pub fn remove_dir(path: &Path) -> Result<(), SystemError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SystemError::io(path, e)),
    };
    debug!(path = %path.display(), "removing directory");
    let result = if meta.file_type().is_symlink() || meta.is_file() {
        fs::remove_file(path)
    } else {
        fs::remove_dir_all(path)
    };
    result.map_err(|e| SystemError::io(path, e))
}

/// Recursively copy `src` to `dst`, replacing `dst`. Symlinks are copied
/// as links, not followed.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<(), SystemError> {
    debug!(from = %src.display(), to = %dst.display(), "copying directory");
    remove_dir(dst)?;

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            SystemError::io(&path, io::Error::other(e.to_string()))
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| SystemError::io(entry.path(), io::Error::other(e.to_string())))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| SystemError::io(entry.path(), e))?;
            std::os::unix::fs::symlink(&link, &target).map_err(|e| SystemError::io(&target, e))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| SystemError::io(&target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| SystemError::io(&target, e))?;
        }
    }
    Ok(())
}

/// Point `link_name` at `source`, replacing anything already at `link_name`.
pub fn create_symlink(source: &Path, link_name: &Path) -> Result<(), SystemError> {
    debug!(source = %source.display(), link = %link_name.display(), "creating symlink");
    remove_dir(link_name)?;
    if let Some(parent) = link_name.parent() {
        fs::create_dir_all(parent).map_err(|e| SystemError::io(parent, e))?;
    }
    std::os::unix::fs::symlink(source, link_name).map_err(|e| SystemError::io(link_name, e))
}

pub fn create_symlinks(links: &[(PathBuf, PathBuf)]) -> Result<(), SystemError> {
    for (source, link_name) in links {
        create_symlink(source, link_name)?;
    }
    Ok(())
}

/// First candidate that exists, in order of preference.
pub fn find_path<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(AsRef::as_ref)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

fn exists_or_link(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_listing(root: &Path) -> Vec<(String, Option<Vec<u8>>)> {
        let mut listing: Vec<_> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().display().to_string();
                let content = if e.file_type().is_file() {
                    Some(fs::read(e.path()).unwrap())
                } else if e.file_type().is_symlink() {
                    Some(fs::read_link(e.path()).unwrap().display().to_string().into_bytes())
                } else {
                    None
                };
                (rel, content)
            })
            .collect();
        listing.sort();
        listing
    }

    #[test]
    fn test_create_dirset_builds_tree_and_links() {
        let dir = tempfile::TempDir::new().unwrap();
        let fixture = dir.path().join("std_data");
        fs::create_dir(&fixture).unwrap();

        let spec = DirSpec::dir([(
            "var",
            DirSpec::dir([
                ("std_data_ln", DirSpec::Symlink(fixture.clone())),
                ("log", DirSpec::empty()),
                ("master-data", DirSpec::dir([("local", DirSpec::dir([("test", DirSpec::empty())]))])),
            ]),
        )]);

        let root = create_dirset(dir.path(), "server0", &spec, false).unwrap();
        assert_eq!(root, dir.path().join("server0"));
        assert!(root.join("var/log").is_dir());
        assert!(root.join("var/master-data/local/test").is_dir());
        assert_eq!(fs::read_link(root.join("var/std_data_ln")).unwrap(), fixture);
    }

    #[test]
    fn test_create_dir_wipes_unless_kept() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("work");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("stale"), b"x").unwrap();

        create_dir(&target, true).unwrap();
        assert!(target.join("stale").exists());

        create_dir(&target, false).unwrap();
        assert!(target.is_dir());
        assert!(!target.join("stale").exists());
    }

    #[test]
    fn test_copy_dir_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("data");
        fs::create_dir_all(src.join("local/test")).unwrap();
        fs::write(src.join("local/test/db.opt"), b"schema-test").unwrap();
        fs::write(src.join("ibdata1"), vec![7u8; 4096]).unwrap();
        std::os::unix::fs::symlink("ibdata1", src.join("alias")).unwrap();

        let snapshot = dir.path().join("snapshot");
        copy_dir(&src, &snapshot).unwrap();
        let captured = tree_listing(&src);

        fs::write(src.join("ibdata1"), b"mutated").unwrap();
        fs::write(src.join("local/test/new_table.dfe"), b"t").unwrap();
        fs::remove_file(src.join("local/test/db.opt")).unwrap();

        copy_dir(&snapshot, &src).unwrap();
        assert_eq!(tree_listing(&src), captured);
        assert!(fs::symlink_metadata(src.join("alias")).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_remove_dir_on_symlink_keeps_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("real");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), b"1").unwrap();
        let link = dir.path().join("link");
        create_symlink(&target, &link).unwrap();

        remove_dir(&link).unwrap();
        assert!(!link.exists());
        assert!(target.join("keep").exists());
        remove_dir(&link).unwrap();
    }

    #[test]
    fn test_find_path_prefers_first_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&b, b"").unwrap();
        fs::write(&c, b"").unwrap();
        let found = find_path(&[dir.path().join("a"), b.clone(), c]);
        assert_eq!(found, Some(b));
        assert_eq!(find_path::<PathBuf>(&[]), None);
    }
}
