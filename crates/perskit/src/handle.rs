//! Handle tables.
//!
//! Handles are small positive integers bounded by
//! [`org::MAX_PERS_HANDLE`], allocated monotonically with a freelist so a
//! closed handle's id becomes reusable. Three tables share the allocator:
//! open files, open keys and open paths; each table keeps its records in an
//! ordered map behind its own mutex.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::warn;

use perskit_core::{org, Permission, PersError, PersResult};

pub type Handle = usize;

struct Allocator {
    next: Handle,
    free: Vec<Handle>,
}

impl Allocator {
    const fn new() -> Self {
        Self {
            next: 1,
            free: Vec::new(),
        }
    }
}

static ALLOCATOR: Lazy<Mutex<Allocator>> = Lazy::new(|| Mutex::new(Allocator::new()));

/// Allocate a handle. The freelist is consulted before the monotonic
/// counter; exhaustion is `MaxHandle`.
pub(crate) fn allocate() -> PersResult<Handle> {
    let mut alloc = ALLOCATOR.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = alloc.free.pop() {
        return Ok(handle);
    }
    if alloc.next <= org::MAX_PERS_HANDLE {
        let handle = alloc.next;
        alloc.next += 1;
        Ok(handle)
    } else {
        warn!("all {} handles in use", org::MAX_PERS_HANDLE);
        Err(PersError::MaxHandle)
    }
}

/// Return a closed handle to the freelist.
pub(crate) fn release(handle: Handle) {
    let mut alloc = ALLOCATOR.lock().unwrap_or_else(|e| e.into_inner());
    if alloc.free.len() < org::MAX_PERS_HANDLE {
        alloc.free.push(handle);
    }
}

/// Per-handle state of an open file resource.
pub(crate) struct FileHandleEntry {
    pub permission: Permission,
    pub backup_created: bool,
    /// False when the resource is blacklisted; sidecars are never created.
    pub needs_backup: bool,
    #[allow(dead_code)]
    pub cache_status: Option<bool>,
    #[allow(dead_code)]
    pub user_id: u32,
    pub backup_path: PathBuf,
    pub csum_path: PathBuf,
    pub file_path: PathBuf,
    pub file: File,
}

/// Per-handle state of an open key resource: the tuple echo.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyHandleEntry {
    pub ldbid: u32,
    pub user: u32,
    pub seat: u32,
    pub resource_id: String,
}

/// Per-handle state of an open-path resource. The application owns the fd;
/// the library only tracks the sidecars it must clean up on release.
pub(crate) struct PathHandleEntry {
    pub permission: Permission,
    pub backup_path: PathBuf,
    pub csum_path: PathBuf,
    #[allow(dead_code)]
    pub file_path: PathBuf,
}

static FILE_TABLE: Lazy<Mutex<BTreeMap<Handle, FileHandleEntry>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));
static KEY_TABLE: Lazy<Mutex<BTreeMap<Handle, KeyHandleEntry>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));
static PATH_TABLE: Lazy<Mutex<BTreeMap<Handle, PathHandleEntry>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

pub(crate) fn insert_file_entry(handle: Handle, entry: FileHandleEntry) {
    FILE_TABLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(handle, entry);
}

pub(crate) fn remove_file_entry(handle: Handle) -> Option<FileHandleEntry> {
    FILE_TABLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&handle)
}

/// Run `f` on the live file entry for `handle`.
pub(crate) fn with_file_entry<R>(
    handle: Handle,
    f: impl FnOnce(&mut FileHandleEntry) -> PersResult<R>,
) -> PersResult<R> {
    let mut table = FILE_TABLE.lock().unwrap_or_else(|e| e.into_inner());
    let entry = table.get_mut(&handle).ok_or(PersError::InvalidHandle)?;
    f(entry)
}

pub(crate) fn insert_key_entry(handle: Handle, entry: KeyHandleEntry) {
    KEY_TABLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(handle, entry);
}

pub(crate) fn remove_key_entry(handle: Handle) -> Option<KeyHandleEntry> {
    KEY_TABLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&handle)
}

pub(crate) fn key_entry(handle: Handle) -> PersResult<KeyHandleEntry> {
    KEY_TABLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&handle)
        .cloned()
        .ok_or(PersError::InvalidHandle)
}

pub(crate) fn insert_path_entry(handle: Handle, entry: PathHandleEntry) {
    PATH_TABLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(handle, entry);
}

pub(crate) fn remove_path_entry(handle: Handle) -> Option<PathHandleEntry> {
    PATH_TABLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&handle)
}

/// Flush or close every open file, depending on the shutdown depth.
///
/// Partial shutdown syncs file contents to disk but keeps the handles
/// usable; full shutdown closes and drops everything.
pub(crate) fn flush_open_files(full: bool) {
    let mut table = FILE_TABLE.lock().unwrap_or_else(|e| e.into_inner());
    if full {
        table.clear();
    } else {
        for (handle, entry) in table.iter() {
            if let Err(e) = entry.file.sync_all() {
                warn!("failed to sync file handle {handle}: {e}");
            }
        }
    }
}

/// Drop all per-handle state and restart the allocator. Full-shutdown path.
pub(crate) fn reset_all() {
    FILE_TABLE.lock().unwrap_or_else(|e| e.into_inner()).clear();
    KEY_TABLE.lock().unwrap_or_else(|e| e.into_inner()).clear();
    PATH_TABLE.lock().unwrap_or_else(|e| e.into_inner()).clear();
    *ALLOCATOR.lock().unwrap_or_else(|e| e.into_inner()) = Allocator::new();
}
