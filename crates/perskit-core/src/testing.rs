//! Isolated test environment for the persistence trees.
//!
//! The library addresses storage through the process-global data root
//! (see [`crate::org`]), so tests that touch it must not run interleaved.
//! [`TestEnvironment::new`] takes a global lock for the lifetime of the
//! environment and redirects the root into a fresh `TempDir`; dropping the
//! environment releases the lock and removes the tree.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use tempfile::TempDir;

use crate::org;

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Hold the global environment lock without building a tree. For tests that
/// touch the process-global root directly.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// An isolated `/Data`-style tree under a temporary directory.
pub struct TestEnvironment {
    _temp_dir: TempDir,
    _guard: MutexGuard<'static, ()>,
    /// The redirected data root (`<tmp>/Data`).
    pub root: PathBuf,
}

impl TestEnvironment {
    /// Create the tree, redirect the data root to it and hold the global
    /// environment lock until drop.
    pub fn new() -> std::io::Result<Self> {
        let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("Data");

        std::fs::create_dir_all(root.join(org::CACHE_TREE_LABEL))?;
        std::fs::create_dir_all(root.join(org::WT_TREE_LABEL))?;
        std::fs::create_dir_all(root.join(org::BACKUP_TREE_LABEL))?;

        org::set_root_path(&root);

        Ok(Self {
            _temp_dir: temp_dir,
            _guard: guard,
            root,
        })
    }

    /// Cache tree of `app` inside this environment, created on demand.
    pub fn cache_tree(&self, app: &str) -> PathBuf {
        let dir = org::cache_tree(app);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    /// Write-through tree of `app` inside this environment.
    pub fn wt_tree(&self, app: &str) -> PathBuf {
        let dir = org::wt_tree(app);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    /// Create a file (and its parent directories) below the root.
    pub fn create_file<P: AsRef<Path>>(&self, path: P, content: &[u8]) -> std::io::Result<PathBuf> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        // Point the root back at the default so a leaked reference cannot
        // write into a removed TempDir.
        org::set_root_path("/Data");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirects_and_restores_root() {
        {
            let env = TestEnvironment::new().unwrap();
            assert_eq!(org::root_path(), env.root);
            assert!(env.cache_tree("app").ends_with("mnt-c/app"));
        }
        assert_eq!(org::root_path(), PathBuf::from("/Data"));
    }
}
