//! On-disk data organization.
//!
//! Two parallel directory hierarchies hold all key/value stores and file
//! resources: the cache tree (`<root>/mnt-c`) for write-cached data and the
//! write-through tree (`<root>/mnt-wt`). Backup sidecars live in a third
//! tree (`<root>/mnt-backup`) that mirrors the subpaths of the other two.
//!
//! The root defaults to `/Data` and may be redirected through the
//! `PERS_ROOT_PATH` environment variable (read at library init) or
//! [`set_root_path`] (used by the test environment).

use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Maximum number of concurrently open persistence handles.
pub const MAX_PERS_HANDLE: usize = 128;

/// Default per-key data ceiling: 16 KiB.
pub const DEFAULT_MAX_KEY_VAL_DATA_SIZE: usize = 16 * 1024;

/// Maximum length of a store key name.
pub const MAX_KEY_NAME_LEN: usize = 128;

/// Method-call timeout towards the admin and lifecycle peers.
pub const TIMEOUT_MS: u64 = 5000;

/// Maximum number of honored shutdown cancel requests per lifecycle.
pub const SHUTDOWN_MAX_COUNT: u32 = 3;

/// Local cached key/value store, one per application.
pub const CACHED_DB_NAME: &str = "cached.itz";
/// Local write-through key/value store, one per application.
pub const WT_DB_NAME: &str = "wt.itz";
/// Configurable-default store (read path; written via the default-data user).
pub const CONF_DEFAULT_DB_NAME: &str = "configurable-default-data.itz";
/// Factory-default store, read-only.
pub const FACTORY_DEFAULT_DB_NAME: &str = "default-data.itz";
/// Resource configuration table, one per application or group.
pub const RCT_DB_NAME: &str = "resource-table-cfg.itz";
/// Backup blacklist file under the application's cache tree.
pub const BACKUP_FILELIST_NAME: &str = "BackupFileList.info";

/// Postfix of the backup sidecar.
pub const BACKUP_POSTFIX: &str = "~";
/// Postfix of the checksum sidecar.
pub const BACKUP_CSUM_POSTFIX: &str = "~.crc";

/// Key prefixes of the internal store keys.
pub const NODE_PREFIX: &str = "/Node";
pub const USER_PREFIX: &str = "/User/";
pub const SEAT_PREFIX: &str = "/Seat/";

/// Directory names used in file-resource storage paths.
pub const NODE_FOLDER: &str = "node";
pub const USER_FOLDER: &str = "user";
pub const SEAT_FOLDER: &str = "seat";

/// Directory labels of the two data trees, also used in blacklist entries.
pub const CACHE_TREE_LABEL: &str = "mnt-c";
pub const WT_TREE_LABEL: &str = "mnt-wt";
pub const BACKUP_TREE_LABEL: &str = "mnt-backup";

static ROOT: Lazy<RwLock<PathBuf>> = Lazy::new(|| RwLock::new(PathBuf::from("/Data")));

static MAX_KEY_VAL_DATA_SIZE: Lazy<RwLock<usize>> =
    Lazy::new(|| RwLock::new(DEFAULT_MAX_KEY_VAL_DATA_SIZE));

/// Re-read the redirectable settings from the environment.
///
/// Called once per real library init; later env changes are ignored until
/// the next init.
pub fn refresh_from_env() {
    if let Ok(root) = std::env::var("PERS_ROOT_PATH") {
        if !root.is_empty() {
            *ROOT.write().unwrap_or_else(|e| e.into_inner()) = PathBuf::from(root);
        }
    }
    let size = std::env::var("PERS_MAX_KEY_VAL_DATA_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_MAX_KEY_VAL_DATA_SIZE);
    *MAX_KEY_VAL_DATA_SIZE
        .write()
        .unwrap_or_else(|e| e.into_inner()) = size;
}

/// The data root (default `/Data`).
pub fn root_path() -> PathBuf {
    ROOT.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Redirect the data root. Intended for the test environment.
pub fn set_root_path<P: AsRef<Path>>(path: P) {
    *ROOT.write().unwrap_or_else(|e| e.into_inner()) = path.as_ref().to_path_buf();
}

/// Current per-key data ceiling.
pub fn max_key_val_data_size() -> usize {
    *MAX_KEY_VAL_DATA_SIZE
        .read()
        .unwrap_or_else(|e| e.into_inner())
}

/// `<root>/mnt-c/<app>` — write-cached tree of an application.
pub fn cache_tree(app: &str) -> PathBuf {
    root_path().join(CACHE_TREE_LABEL).join(app)
}

/// `<root>/mnt-wt/<app>` — write-through tree of an application.
pub fn wt_tree(app: &str) -> PathBuf {
    root_path().join(WT_TREE_LABEL).join(app)
}

/// `<root>/mnt-backup/<app>` — backup sidecar tree of an application.
pub fn backup_tree(app: &str) -> PathBuf {
    root_path().join(BACKUP_TREE_LABEL).join(app)
}

/// Tree of an application for a storage policy.
pub fn policy_tree(app: &str, write_through: bool) -> PathBuf {
    if write_through {
        wt_tree(app)
    } else {
        cache_tree(app)
    }
}

/// Directory name of a shared group store: `shared_group_<hex>`.
pub fn shared_group_folder(group: u32) -> String {
    format!("shared_group_{group:x}")
}

/// Directory name of the shared public store.
pub const SHARED_PUBLIC_FOLDER: &str = "shared_public";

/// Strip the data root and tree label from an absolute storage path,
/// yielding the `<app>/<subpath>` part used to place backup sidecars.
pub fn tree_relative(path: &Path) -> Option<PathBuf> {
    let root = root_path();
    let rel = path.strip_prefix(&root).ok()?;
    let mut comps = rel.components();
    let label = comps.next()?;
    let label = label.as_os_str().to_str()?;
    if label != CACHE_TREE_LABEL && label != WT_TREE_LABEL {
        return None;
    }
    Some(comps.as_path().to_path_buf())
}
