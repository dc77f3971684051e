//! RCT storage: LMDB-backed, read-only tables cached per process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use heed::types::{SerdeBincode, Str};
use heed::{Database, Env, EnvOpenOptions};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use perskit_core::{org, PersError, PersResult, ResourceConfig};

/// LMDB map size for a configuration table. Entries are tiny; 16 MiB leaves
/// ample headroom.
const RCT_MAP_SIZE: usize = 16 * 1024 * 1024;

/// Which RCT a logical database id selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RctKind {
    /// Local table of the application.
    Local,
    /// Table of the shared public namespace.
    SharedPublic,
    /// Table of a shared group.
    SharedGroup,
}

/// Classify an ldbid into the RCT kind and group number.
pub fn table_id(ldbid: u32) -> (RctKind, u32) {
    if ldbid < 0x80 {
        if ldbid != 0 {
            (RctKind::SharedGroup, ldbid)
        } else {
            (RctKind::SharedPublic, 0)
        }
    } else {
        (RctKind::Local, 0)
    }
}

/// Path of the table selected by `(kind, group)` for an application.
///
/// All tables live in the write-through tree: the local table directly under
/// the application directory, shared tables inside the shared store folders.
pub fn table_path(app: &str, kind: RctKind, group: u32) -> PathBuf {
    let base = org::wt_tree(app);
    match kind {
        RctKind::Local => base.join(org::RCT_DB_NAME),
        RctKind::SharedPublic => base.join(org::SHARED_PUBLIC_FOLDER).join(org::RCT_DB_NAME),
        RctKind::SharedGroup => base
            .join(org::shared_group_folder(group))
            .join(org::RCT_DB_NAME),
    }
}

/// An open resource configuration table.
pub struct RctTable {
    env: Env,
    db: Database<Str, SerdeBincode<ResourceConfig>>,
}

impl RctTable {
    /// Open an existing table read-only. A missing table is `NoPrctTable`.
    pub fn open(path: &Path) -> PersResult<Self> {
        if !path.is_dir() {
            return Err(PersError::NoPrctTable);
        }
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(RCT_MAP_SIZE)
                .max_dbs(1)
                .open(path)
                .map_err(|e| {
                    warn!("failed to open RCT at {path:?}: {e}");
                    PersError::NoPrctTable
                })?
        };
        let rtxn = env.read_txn().map_err(|_| PersError::NoPrctTable)?;
        let db = env
            .open_database(&rtxn, None)
            .map_err(|_| PersError::NoPrctTable)?
            .ok_or(PersError::NoPrctTable)?;
        drop(rtxn);
        debug!("opened RCT at {path:?}");
        Ok(Self { env, db })
    }

    /// Look up the configuration of a resource. A present table without the
    /// entry is `NoKeyData`.
    pub fn lookup(&self, resource_id: &str) -> PersResult<ResourceConfig> {
        let rtxn = self.env.read_txn().map_err(|_| PersError::DbErrorInternal)?;
        match self.db.get(&rtxn, resource_id) {
            Ok(Some(cfg)) => Ok(cfg),
            Ok(None) => Err(PersError::NoKeyData),
            Err(e) => {
                warn!("RCT lookup failed for {resource_id}: {e}");
                Err(PersError::DbErrorInternal)
            }
        }
    }

    /// All resource ids in the table, in key order.
    pub fn resource_ids(&self) -> PersResult<Vec<String>> {
        let rtxn = self.env.read_txn().map_err(|_| PersError::DbErrorInternal)?;
        let mut ids = Vec::new();
        let iter = self.db.iter(&rtxn).map_err(|_| PersError::DbErrorInternal)?;
        for entry in iter {
            let (id, _) = entry.map_err(|_| PersError::DbErrorInternal)?;
            ids.push(id.to_string());
        }
        Ok(ids)
    }
}

/// Builder half of the RCT: used by provisioning tools and tests to create
/// tables that the library itself only ever reads.
pub struct RctWriter {
    env: Env,
    db: Database<Str, SerdeBincode<ResourceConfig>>,
}

impl RctWriter {
    /// Open or create the table at `path`.
    pub fn open(path: &Path) -> PersResult<Self> {
        std::fs::create_dir_all(path).map_err(|_| PersError::OpenFile)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(RCT_MAP_SIZE)
                .max_dbs(1)
                .open(path)
                .map_err(|_| PersError::OpenFile)?
        };
        let mut wtxn = env.write_txn().map_err(|_| PersError::DbErrorInternal)?;
        let db = env
            .create_database(&mut wtxn, None)
            .map_err(|_| PersError::DbErrorInternal)?;
        wtxn.commit().map_err(|_| PersError::DbErrorInternal)?;
        Ok(Self { env, db })
    }

    /// Open or create the table for `(app, kind, group)` at its canonical
    /// location.
    pub fn open_for(app: &str, kind: RctKind, group: u32) -> PersResult<Self> {
        Self::open(&table_path(app, kind, group))
    }

    /// Insert one entry. Field length limits are enforced here so that no
    /// oversized entry can ever reach a reader.
    pub fn insert(&self, resource_id: &str, cfg: &ResourceConfig) -> PersResult<()> {
        cfg.validate()?;
        if resource_id.len() > org::MAX_KEY_NAME_LEN {
            return Err(PersError::DbKeySize);
        }
        let mut wtxn = self.env.write_txn().map_err(|_| PersError::DbErrorInternal)?;
        self.db
            .put(&mut wtxn, resource_id, cfg)
            .map_err(|_| PersError::DbErrorInternal)?;
        wtxn.commit().map_err(|_| PersError::DbErrorInternal)
    }
}

static TABLES: Lazy<Mutex<HashMap<(RctKind, u32), Arc<RctTable>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Table for `(kind, group)`, opened on first demand and cached.
///
/// Two workers may race to open the same table; the second one finds the
/// entry inserted by the first under the cache lock and drops its own.
pub fn resource_cfg_table(app: &str, kind: RctKind, group: u32) -> PersResult<Arc<RctTable>> {
    let mut tables = TABLES.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(table) = tables.get(&(kind, group)) {
        return Ok(Arc::clone(table));
    }
    let table = Arc::new(RctTable::open(&table_path(app, kind, group))?);
    tables.insert((kind, group), Arc::clone(&table));
    Ok(table)
}

/// Close every cached table and invalidate the entries. Called from the
/// shutdown path; the caches repopulate on the next demand after re-init.
pub fn close_all_tables() {
    let mut tables = TABLES.lock().unwrap_or_else(|e| e.into_inner());
    let count = tables.len();
    tables.clear();
    if count > 0 {
        debug!("closed {count} resource configuration tables");
    }
}
