//! Crash-safe file updates: backup blacklist, sidecar creation and
//! recovery.
//!
//! Before the first modification in an open session, a writable file is
//! copied to `<backup-tree>/<subpath>~` together with a `~.crc` sidecar
//! holding the CRC32 of the copied content as lower-case hex. On open the
//! sidecars are inspected: a backup whose checksum verifies replaces the
//! original (the previous session crashed mid-update); a torn backup is
//! discarded in favor of the original; a lone sidecar is deleted.
//!
//! The blacklist (`BackupFileList.info`) names resources that never get
//! sidecars, as CRC32 hashes of canonical five-field identifiers.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::Mmap;
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use perskit_core::crc32::crc32;
use perskit_core::{org, Permission, PersError, PersResult, StoragePolicy};

/// `None` until a blacklist was successfully loaded; lookups then report
/// "unknown" and callers fall back to creating backups.
static BLACKLIST: Lazy<Mutex<Option<BTreeSet<u32>>>> = Lazy::new(|| Mutex::new(None));

/// Canonical identifier of a file resource for blacklist matching:
/// `/<storage-type>/<policy-id>/<profile-id>/<application-id>/<filename>.pers`.
///
/// The same form is assembled from the five tokens of a blacklist row and
/// from the resolved context of an open, so matching is independent of the
/// data root.
pub(crate) fn canonical_backup_id(
    tree_label: &str,
    policy: StoragePolicy,
    profile: u32,
    app: &str,
    resource_id: &str,
) -> String {
    let policy_id = match policy {
        StoragePolicy::WriteCached => 0,
        StoragePolicy::WriteThrough => 1,
        StoragePolicy::Na => 0,
    };
    format!("/{tree_label}/{policy_id}/{profile}/{app}/{resource_id}.pers")
}

fn is_token_byte(b: u8) -> bool {
    (0x21..=0x7E).contains(&b)
}

/// Load the blacklist file. Rows are five whitespace-separated tokens; a
/// trailing partial row is rejected with a log message rather than read
/// past the end.
pub(crate) fn load_blacklist(path: &Path) -> PersResult<()> {
    let file = File::open(path).map_err(|e| {
        info!("no backup blacklist at {path:?}: {e}");
        PersError::Common
    })?;
    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        warn!("backup blacklist {path:?} is empty");
        return Err(PersError::Common);
    }
    let map = unsafe { Mmap::map(&file) }.map_err(|e| {
        warn!("failed to map backup blacklist {path:?}: {e}");
        PersError::Common
    })?;

    let mut tokens: Vec<&str> = Vec::new();
    let mut start = None;
    for (i, &b) in map.iter().enumerate() {
        match (is_token_byte(b), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if let Ok(token) = std::str::from_utf8(&map[s..i]) {
                    tokens.push(token);
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if let Ok(token) = std::str::from_utf8(&map[s..]) {
            tokens.push(token);
        }
    }

    let mut set = BTreeSet::new();
    let mut rows = tokens.chunks_exact(5);
    for row in &mut rows {
        let id = format!("/{}/{}/{}/{}/{}.pers", row[0], row[1], row[2], row[3], row[4]);
        set.insert(crc32(0, id.as_bytes()));
    }
    if !rows.remainder().is_empty() {
        warn!(
            "backup blacklist {path:?} ends with a malformed row of {} tokens; row rejected",
            rows.remainder().len()
        );
    }

    debug!("loaded {} blacklist entries from {path:?}", set.len());
    *BLACKLIST.lock().unwrap_or_else(|e| e.into_inner()) = Some(set);
    Ok(())
}

/// Does the file behind `canonical_id` need a backup before modification?
///
/// True unless the blacklist is loaded and contains the id; an unloaded
/// blacklist means "unknown", and the safe default is to back up.
pub(crate) fn need_backup(canonical_id: &str) -> bool {
    match &*BLACKLIST.lock().unwrap_or_else(|e| e.into_inner()) {
        Some(set) => !set.contains(&crc32(0, canonical_id.as_bytes())),
        None => true,
    }
}

pub(crate) fn clear_blacklist() {
    *BLACKLIST.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

/// Sidecar locations for a file in one of the data trees:
/// `<backup-tree>/<app>/<subpath>~` and `…~.crc`.
pub(crate) fn sidecar_paths(file_path: &Path) -> PersResult<(PathBuf, PathBuf)> {
    let rel = org::tree_relative(file_path).ok_or(PersError::Common)?;
    let base = org::root_path().join(org::BACKUP_TREE_LABEL).join(rel);
    let mut backup = base.clone().into_os_string();
    backup.push(org::BACKUP_POSTFIX);
    let mut csum = base.into_os_string();
    csum.push(org::BACKUP_CSUM_POSTFIX);
    Ok((PathBuf::from(backup), PathBuf::from(csum)))
}

/// CRC32 over the full contents of an open file; the cursor is restored.
pub(crate) fn calc_crc32_of_file(file: &mut File) -> PersResult<u32> {
    let pos = file.stream_position().map_err(|_| PersError::Common)?;
    file.seek(SeekFrom::Start(0)).map_err(|_| PersError::Common)?;
    let mut crc = 0u32;
    let mut chunk = [0u8; 4096];
    loop {
        let n = file.read(&mut chunk).map_err(|_| PersError::Common)?;
        if n == 0 {
            break;
        }
        crc = crc32(crc, &chunk[..n]);
    }
    file.seek(SeekFrom::Start(pos)).map_err(|_| PersError::Common)?;
    Ok(crc)
}

/// Stage the backup and checksum sidecars from the current file contents.
///
/// The checksum is written first so that a crash between the two writes
/// leaves a lone sidecar, which recovery discards.
pub(crate) fn create_backup(
    file: &mut File,
    backup_path: &Path,
    csum_path: &Path,
) -> PersResult<()> {
    let crc = calc_crc32_of_file(file)?;

    if let Some(parent) = backup_path.parent() {
        std::fs::create_dir_all(parent).map_err(|_| PersError::Common)?;
    }
    std::fs::write(csum_path, format!("{crc:x}")).map_err(|e| {
        warn!("failed to write checksum sidecar {csum_path:?}: {e}");
        PersError::Common
    })?;

    let pos = file.stream_position().map_err(|_| PersError::Common)?;
    file.seek(SeekFrom::Start(0)).map_err(|_| PersError::Common)?;
    let mut content = Vec::new();
    file.read_to_end(&mut content).map_err(|_| PersError::Common)?;
    file.seek(SeekFrom::Start(pos)).map_err(|_| PersError::Common)?;

    std::fs::write(backup_path, &content).map_err(|e| {
        warn!("failed to write backup sidecar {backup_path:?}: {e}");
        PersError::Common
    })?;
    debug!("staged backup for {backup_path:?}");
    Ok(())
}

/// Remove both sidecars. Close path; errors are logged, not returned.
pub(crate) fn remove_sidecars(backup_path: &Path, csum_path: &Path) {
    for path in [backup_path, csum_path] {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove sidecar {path:?}: {e}");
            }
        }
    }
}

/// Recovery check on open.
///
/// With both sidecars present and the backup hash matching the stored hex,
/// the previous write session crashed mid-update and the backup replaces
/// the original. A mismatch means the backup itself is torn and the
/// original stands. A lone sidecar is deleted.
pub(crate) fn verify_consistency(orig: &Path, backup_path: &Path, csum_path: &Path) {
    match (backup_path.is_file(), csum_path.is_file()) {
        (true, true) => {
            let stored = std::fs::read_to_string(csum_path)
                .ok()
                .and_then(|s| u32::from_str_radix(s.trim(), 16).ok());
            let actual = File::open(backup_path)
                .ok()
                .and_then(|mut f| calc_crc32_of_file(&mut f).ok());
            match (stored, actual) {
                (Some(stored), Some(actual)) if stored == actual => {
                    if let Some(parent) = orig.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    match std::fs::copy(backup_path, orig) {
                        Ok(_) => info!("recovered {orig:?} from backup"),
                        Err(e) => warn!("failed to restore {orig:?} from backup: {e}"),
                    }
                }
                _ => {
                    warn!("backup for {orig:?} is torn; keeping the original");
                }
            }
        }
        (true, false) => {
            let _ = std::fs::remove_file(backup_path);
        }
        (false, true) => {
            let _ = std::fs::remove_file(csum_path);
        }
        (false, false) => {}
    }
}

/// Open options matching a resource permission. Creation and truncation are
/// handled separately by the open path so that existing data is never
/// destroyed before the backup is staged.
pub(crate) fn open_options(permission: Permission) -> OpenOptions {
    let mut options = OpenOptions::new();
    match permission {
        Permission::ReadWrite => options.read(true).write(true),
        Permission::ReadOnly => options.read(true),
        Permission::WriteOnly => options.write(true),
    };
    options
}
