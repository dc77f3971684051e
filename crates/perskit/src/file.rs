//! File operations with crash-safe overwrites.
//!
//! Opening a writable file resource runs the recovery check and arms the
//! handle for backup creation; the first write stages the `~` and `~.crc`
//! sidecars before any byte changes, and close removes them again. The
//! open-path variants hand the resolved path to applications that manage
//! the fd themselves, with the same sidecar bookkeeping on release.

use std::fs::OpenOptions;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use perskit_core::{org, Permission, PersError, PersResult, ResourceType, StoragePolicy};
use perskit_rct::db_context;

pub use std::io::SeekFrom;

use crate::handle::{self, FileHandleEntry, Handle, PathHandleEntry};
use crate::{backup, pas};

struct OpenedFile {
    permission: Permission,
    needs_backup: bool,
    backup_path: PathBuf,
    csum_path: PathBuf,
    file_path: PathBuf,
    user: u32,
}

/// Resolution and recovery shared by [`open`] and [`create_path`].
fn prepare_open(
    ldbid: u32,
    resource_id: &str,
    user: u32,
    seat: u32,
) -> PersResult<OpenedFile> {
    let app = crate::app_id();
    let ctx = db_context(&app, ldbid, resource_id, user, seat, ResourceType::File)?;
    if ctx.config.res_type != ResourceType::File {
        return Err(PersError::ResourceNoFile);
    }

    let file_path = ctx.path.db_path.clone();
    let (backup_path, csum_path) = backup::sidecar_paths(&file_path)?;

    let tree_label = match ctx.config.policy {
        StoragePolicy::WriteThrough => org::WT_TREE_LABEL,
        _ => org::CACHE_TREE_LABEL,
    };
    let canonical =
        backup::canonical_backup_id(tree_label, ctx.config.policy, user, &app, resource_id);

    let writable = ctx.config.permission != Permission::ReadOnly;
    let needs_backup = writable && backup::need_backup(&canonical);

    if needs_backup {
        backup::verify_consistency(&file_path, &backup_path, &csum_path);
    }

    Ok(OpenedFile {
        permission: ctx.config.permission,
        needs_backup,
        backup_path,
        csum_path,
        file_path,
        user,
    })
}

fn create_missing(path: &Path) -> PersResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|_| PersError::OpenFile)?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| {
            warn!("failed to create {path:?}: {e}");
            PersError::OpenFile
        })?;
    Ok(())
}

/// Open a file resource and return its handle.
pub fn open(ldbid: u32, resource_id: &str, user: u32, seat: u32) -> PersResult<Handle> {
    crate::ensure_initialized()?;

    let opened = prepare_open(ldbid, resource_id, user, seat)?;
    let file = match backup::open_options(opened.permission).open(&opened.file_path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_missing(&opened.file_path)?;
            backup::open_options(opened.permission)
                .open(&opened.file_path)
                .map_err(|_| PersError::OpenFile)?
        }
        Err(e) => {
            warn!("failed to open {:?}: {e}", opened.file_path);
            return Err(PersError::OpenFile);
        }
    };

    let handle = handle::allocate()?;
    handle::insert_file_entry(
        handle,
        FileHandleEntry {
            permission: opened.permission,
            backup_created: false,
            needs_backup: opened.needs_backup,
            cache_status: None,
            user_id: opened.user,
            backup_path: opened.backup_path,
            csum_path: opened.csum_path,
            file_path: opened.file_path,
            file,
        },
    );
    Ok(handle)
}

/// Close a file handle. Sidecars of writable handles are removed
/// best-effort.
pub fn close(handle: Handle) -> PersResult<()> {
    crate::ensure_initialized()?;
    let entry = handle::remove_file_entry(handle).ok_or(PersError::InvalidHandle)?;
    if entry.permission != Permission::ReadOnly {
        backup::remove_sidecars(&entry.backup_path, &entry.csum_path);
    }
    handle::release(handle);
    Ok(())
}

/// Read from the handle's current position into `buffer`; returns the
/// number of bytes read (short only at end of file).
pub fn read_data(handle: Handle, buffer: &mut [u8]) -> PersResult<usize> {
    crate::ensure_initialized()?;
    handle::with_file_entry(handle, |entry| {
        let mut total = 0;
        while total < buffer.len() {
            let n = entry
                .file
                .read(&mut buffer[total..])
                .map_err(|_| PersError::Common)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    })
}

/// Write at the handle's current position.
///
/// The first write on a writable handle stages the backup sidecars before
/// anything is modified, so an interrupted session can be recovered on the
/// next open.
pub fn write_data(handle: Handle, data: &[u8]) -> PersResult<usize> {
    crate::ensure_initialized()?;
    pas::check_access()?;
    handle::with_file_entry(handle, |entry| {
        if entry.permission == Permission::ReadOnly {
            return Err(PersError::ResourceReadOnly);
        }
        if entry.needs_backup && !entry.backup_created {
            backup::create_backup(&mut entry.file, &entry.backup_path, &entry.csum_path)?;
            entry.backup_created = true;
        }
        entry.file.write_all(data).map_err(|e| {
            warn!("write to {:?} failed: {e}", entry.file_path);
            PersError::Common
        })?;
        Ok(data.len())
    })
}

/// Reposition the handle.
pub fn seek(handle: Handle, pos: SeekFrom) -> PersResult<u64> {
    crate::ensure_initialized()?;
    pas::check_access()?;
    handle::with_file_entry(handle, |entry| {
        entry.file.seek(pos).map_err(|_| PersError::Common)
    })
}

/// Current size of the open file.
pub fn get_size(handle: Handle) -> PersResult<usize> {
    crate::ensure_initialized()?;
    handle::with_file_entry(handle, |entry| {
        entry
            .file
            .metadata()
            .map(|m| m.len() as usize)
            .map_err(|_| PersError::Common)
    })
}

/// Remove a file resource from disk.
pub fn remove(ldbid: u32, resource_id: &str, user: u32, seat: u32) -> PersResult<()> {
    crate::ensure_initialized()?;
    pas::check_access()?;

    let app = crate::app_id();
    let ctx = db_context(&app, ldbid, resource_id, user, seat, ResourceType::File)?;
    if ctx.config.res_type != ResourceType::File {
        return Err(PersError::ResourceNoFile);
    }
    std::fs::remove_file(&ctx.path.db_path).map_err(|e| {
        warn!("failed to remove {:?}: {e}", ctx.path.db_path);
        PersError::FileRemove
    })
}

/// Resolve a file resource to its path for an application that opens the
/// fd itself. The file is created when missing; the returned handle must
/// be released with [`release_path`].
pub fn create_path(
    ldbid: u32,
    resource_id: &str,
    user: u32,
    seat: u32,
) -> PersResult<(Handle, PathBuf)> {
    crate::ensure_initialized()?;

    let opened = prepare_open(ldbid, resource_id, user, seat)?;
    if !opened.file_path.is_file() {
        create_missing(&opened.file_path)?;
    }

    let handle = handle::allocate()?;
    handle::insert_path_entry(
        handle,
        PathHandleEntry {
            permission: opened.permission,
            backup_path: opened.backup_path,
            csum_path: opened.csum_path,
            file_path: opened.file_path.clone(),
        },
    );
    Ok((handle, opened.file_path))
}

/// Release an open-path handle, dropping the sidecars of writable
/// resources.
pub fn release_path(handle: Handle) -> PersResult<()> {
    crate::ensure_initialized()?;
    let entry = handle::remove_path_entry(handle).ok_or(PersError::InvalidHandle)?;
    if entry.permission != Permission::ReadOnly {
        backup::remove_sidecars(&entry.backup_path, &entry.csum_path);
    }
    handle::release(handle);
    Ok(())
}
