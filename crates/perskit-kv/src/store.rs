//! A single open key/value store.

use std::path::{Path, PathBuf};

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use tracing::warn;

use perskit_core::{org, PersError, PersResult};

/// Map size per store. Values are capped at the per-key ceiling, so even a
/// fully loaded store stays far below this.
const STORE_MAP_SIZE: usize = 64 * 1024 * 1024;

/// One key/value store on disk.
#[derive(Debug)]
pub struct KvStore {
    env: Env,
    db: Database<Str, Bytes>,
    path: PathBuf,
}

impl KvStore {
    /// Open the store at `path`.
    ///
    /// With `create` the store (and its parent directories) is created when
    /// missing; without it a missing store is `NoKey`, so probing reads on
    /// default stores never materialize empty databases.
    pub fn open(path: &Path, create: bool) -> PersResult<Self> {
        if create {
            std::fs::create_dir_all(path).map_err(|e| {
                warn!("cannot create store directory {path:?}: {e}");
                PersError::OpenFile
            })?;
        } else if !path.is_dir() {
            return Err(PersError::NoKey);
        }

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(STORE_MAP_SIZE)
                .max_dbs(1)
                .open(path)
                .map_err(|e| {
                    warn!("failed to open store {path:?}: {e}");
                    PersError::DbErrorInternal
                })?
        };

        let db = if create {
            let mut wtxn = env.write_txn().map_err(|_| PersError::DbErrorInternal)?;
            let db = env
                .create_database(&mut wtxn, None)
                .map_err(|_| PersError::DbErrorInternal)?;
            wtxn.commit().map_err(|_| PersError::DbErrorInternal)?;
            db
        } else {
            let rtxn = env.read_txn().map_err(|_| PersError::DbErrorInternal)?;
            let db = env
                .open_database(&rtxn, None)
                .map_err(|_| PersError::DbErrorInternal)?
                .ok_or(PersError::NoKey)?;
            drop(rtxn);
            db
        };

        Ok(Self {
            env,
            db,
            path: path.to_path_buf(),
        })
    }

    /// Location of this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_key(key: &str) -> PersResult<()> {
        if key.len() > org::MAX_KEY_NAME_LEN {
            return Err(PersError::DbKeySize);
        }
        Ok(())
    }

    /// Read the value of `key` into `buf`, returning the number of bytes
    /// copied (at most `buf.len()`).
    pub fn read(&self, key: &str, buf: &mut [u8]) -> PersResult<usize> {
        Self::check_key(key)?;
        let rtxn = self.env.read_txn().map_err(|_| PersError::DbErrorInternal)?;
        match self.db.get(&rtxn, key) {
            Ok(Some(value)) => {
                let n = value.len().min(buf.len());
                buf[..n].copy_from_slice(&value[..n]);
                Ok(n)
            }
            Ok(None) => Err(PersError::NoKey),
            Err(e) => {
                warn!("read of {key} failed in {:?}: {e}", self.path);
                Err(PersError::DbErrorInternal)
            }
        }
    }

    /// Store `data` under `key`, returning the number of bytes written.
    ///
    /// Oversized keys and values are rejected outright; a failed write
    /// leaves the previous value untouched (single LMDB transaction).
    pub fn write(&self, key: &str, data: &[u8]) -> PersResult<usize> {
        Self::check_key(key)?;
        if data.len() > org::max_key_val_data_size() {
            return Err(PersError::DbValueSize);
        }
        let mut wtxn = self.env.write_txn().map_err(|_| PersError::DbErrorInternal)?;
        self.db
            .put(&mut wtxn, key, data)
            .map_err(|_| PersError::DbErrorInternal)?;
        wtxn.commit().map_err(|_| PersError::DbErrorInternal)?;
        Ok(data.len())
    }

    /// Size in bytes of the value stored under `key`.
    pub fn size(&self, key: &str) -> PersResult<usize> {
        Self::check_key(key)?;
        let rtxn = self.env.read_txn().map_err(|_| PersError::DbErrorInternal)?;
        match self.db.get(&rtxn, key) {
            Ok(Some(value)) => Ok(value.len()),
            Ok(None) => Err(PersError::NoKey),
            Err(_) => Err(PersError::DbErrorInternal),
        }
    }

    /// Delete `key`. Deleting an absent key is `NoKey`.
    pub fn delete(&self, key: &str) -> PersResult<()> {
        Self::check_key(key)?;
        let mut wtxn = self.env.write_txn().map_err(|_| PersError::DbErrorInternal)?;
        let existed = self
            .db
            .delete(&mut wtxn, key)
            .map_err(|_| PersError::DbErrorInternal)?;
        wtxn.commit().map_err(|_| PersError::DbErrorInternal)?;
        if existed {
            Ok(())
        } else {
            Err(PersError::NoKey)
        }
    }

    /// All keys in the store, in order.
    pub fn list_keys(&self) -> PersResult<Vec<String>> {
        let rtxn = self.env.read_txn().map_err(|_| PersError::DbErrorInternal)?;
        let iter = self.db.iter(&rtxn).map_err(|_| PersError::DbErrorInternal)?;
        let mut keys = Vec::new();
        for entry in iter {
            let (key, _) = entry.map_err(|_| PersError::DbErrorInternal)?;
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}
