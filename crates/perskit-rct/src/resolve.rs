//! Path resolution: tuple + configuration → backend, storage path, store key.

use std::path::PathBuf;

use perskit_core::types::{PCL_LDBID_LOCAL, PCL_LDBID_PUBLIC};
use perskit_core::{org, PersResult, ResourceConfig, ResourceType, StorageKind, StoragePolicy};

use crate::store::{resource_cfg_table, table_id};

/// Result of resolving a resource: the backend class, the storage path and
/// the internal store key. Transient; recomputed per operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub storage: StorageKind,
    /// For key-type resources the directory holding the store; for
    /// file-type resources the file path itself. For custom resources the
    /// plugin name.
    pub db_path: PathBuf,
    /// The key inside the store (`/Node/...`, `/User/...`); the bare
    /// resource id for custom resources.
    pub db_key: String,
}

/// A resolved resource: its configuration plus the computed paths.
#[derive(Debug, Clone)]
pub struct DbContext {
    pub config: ResourceConfig,
    pub path: ResolvedPath,
}

/// Build the internal store key for a tuple.
///
/// For local and shared namespaces the key encodes node/user/seat scope;
/// other ldbid values form a hex-prefixed namespace inside the local store.
pub fn build_db_key(ldbid: u32, resource_id: &str, user: u32, seat: u32) -> String {
    if ldbid < 0x80 || ldbid == PCL_LDBID_LOCAL {
        if user == 0 && seat == 0 {
            format!("{}/{resource_id}", org::NODE_PREFIX)
        } else if seat == 0 {
            format!("{}{user}/{resource_id}", org::USER_PREFIX)
        } else {
            format!(
                "{}{user}{}{seat}/{resource_id}",
                org::USER_PREFIX,
                org::SEAT_PREFIX
            )
        }
    } else if seat != 0 {
        format!(
            "/{ldbid:x}{}{user}{}{seat}/{resource_id}",
            org::USER_PREFIX,
            org::SEAT_PREFIX
        )
    } else {
        format!("/{ldbid:x}{}{user}/{resource_id}", org::USER_PREFIX)
    }
}

/// Relative path of a file-type resource below its store directory.
///
/// File trees use lowercase `node`/`user`/`seat` directories, unlike the
/// store keys.
fn file_subpath(ldbid: u32, resource_id: &str, user: u32, seat: u32) -> PathBuf {
    let mut path = PathBuf::new();
    if ldbid >= 0x80 && ldbid != PCL_LDBID_LOCAL {
        path.push(format!("{ldbid:x}"));
        path.push(org::USER_FOLDER);
        path.push(user.to_string());
        if seat != 0 {
            path.push(org::SEAT_FOLDER);
            path.push(seat.to_string());
        }
    } else if user == 0 && seat == 0 {
        path.push(org::NODE_FOLDER);
    } else {
        path.push(org::USER_FOLDER);
        path.push(user.to_string());
        if seat != 0 {
            path.push(org::SEAT_FOLDER);
            path.push(seat.to_string());
        }
    }
    path.push(resource_id);
    path
}

/// Directory of the key/value store (or file tree) selected by the tuple's
/// scope and the resource's policy.
fn store_dir(app: &str, ldbid: u32, policy: StoragePolicy) -> PathBuf {
    let write_through = policy == StoragePolicy::WriteThrough;
    let base = org::policy_tree(app, write_through);
    if ldbid < 0x80 {
        if ldbid != PCL_LDBID_PUBLIC {
            base.join(org::shared_group_folder(ldbid))
        } else {
            base.join(org::SHARED_PUBLIC_FOLDER)
        }
    } else {
        base
    }
}

/// Compute the resolved path for a tuple under a known configuration.
pub fn resolve(
    app: &str,
    ldbid: u32,
    resource_id: &str,
    user: u32,
    seat: u32,
    config: &ResourceConfig,
) -> ResolvedPath {
    if config.storage == StorageKind::Custom {
        // The plugin name is the "path"; the key stays the resource id.
        return ResolvedPath {
            storage: StorageKind::Custom,
            db_path: PathBuf::from(&config.custom_name),
            db_key: resource_id.to_string(),
        };
    }

    let storage = if ldbid < 0x80 {
        StorageKind::Shared
    } else {
        StorageKind::Local
    };
    let dir = store_dir(app, ldbid, config.policy);
    let db_key = build_db_key(ldbid, resource_id, user, seat);
    let db_path = match config.res_type {
        ResourceType::Key => dir,
        ResourceType::File => dir.join(file_subpath(ldbid, resource_id, user, seat)),
    };

    ResolvedPath {
        storage,
        db_path,
        db_key,
    }
}

/// Resolve a tuple through the RCT.
///
/// Local resources (`ldbid == 0xFF`) missing from the table (or lacking a
/// table altogether) get the synthesized write-cached default entry, typed
/// after the requesting operation. Shared namespaces never synthesize.
pub fn db_context(
    app: &str,
    ldbid: u32,
    resource_id: &str,
    user: u32,
    seat: u32,
    res_type: ResourceType,
) -> PersResult<DbContext> {
    let (kind, group) = table_id(ldbid);

    let looked_up = match resource_cfg_table(app, kind, group) {
        Ok(table) => table.lookup(resource_id),
        Err(e) => Err(e),
    };

    let config = match looked_up {
        Ok(config) => config,
        Err(e) if ldbid == PCL_LDBID_LOCAL && e.is_not_found() => {
            ResourceConfig::default_local(res_type)
        }
        Err(e) => return Err(e),
    };

    let path = resolve(app, ldbid, resource_id, user, seat, &config);
    Ok(DbContext { config, path })
}

/// Key string handed to a custom plugin for a resource.
pub fn custom_path_key(ldbid: u32, config: &ResourceConfig, db_key: &str) -> String {
    if config.custom_id.is_empty() {
        format!("0x{ldbid:08X}/{}/{db_key}", config.custom_name)
    } else {
        format!("0x{ldbid:08X}/{}", config.custom_id)
    }
}
