//! The process-wide store handle cache.
//!
//! One backend handle exists per `(class, directory)`, created lazily on
//! first use and drained during shutdown. Concurrent workers may race to
//! create the same handle; creation is double-checked under the cache lock
//! so the loser discards its own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::debug;

use perskit_core::{org, PersResult};

use crate::store::KvStore;

/// Which store inside a storage directory a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbClass {
    /// Write-cached user store.
    Cached,
    /// Write-through user store.
    WriteThrough,
    /// Configurable-default store.
    ConfDefault,
    /// Factory-default store.
    FactoryDefault,
}

impl DbClass {
    /// File name of the store for this class.
    pub fn db_name(self) -> &'static str {
        match self {
            DbClass::Cached => org::CACHED_DB_NAME,
            DbClass::WriteThrough => org::WT_DB_NAME,
            DbClass::ConfDefault => org::CONF_DEFAULT_DB_NAME,
            DbClass::FactoryDefault => org::FACTORY_DEFAULT_DB_NAME,
        }
    }

    /// User stores are created on demand; default stores are only ever
    /// opened if they already exist, except when the default-data write
    /// path asks for creation explicitly.
    fn create_on_open(self) -> bool {
        matches!(self, DbClass::Cached | DbClass::WriteThrough)
    }
}

static STORES: Lazy<Mutex<HashMap<(DbClass, PathBuf), Arc<KvStore>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The store for `class` inside `dir`, opened on first use.
pub fn store_for(class: DbClass, dir: &Path) -> PersResult<Arc<KvStore>> {
    open_cached(class, dir, class.create_on_open())
}

/// Like [`store_for`], but creates the store when missing regardless of
/// class. Used by writes with the default-data user id, which target the
/// configurable-default store.
pub fn store_for_create(class: DbClass, dir: &Path) -> PersResult<Arc<KvStore>> {
    open_cached(class, dir, true)
}

fn open_cached(class: DbClass, dir: &Path, create: bool) -> PersResult<Arc<KvStore>> {
    let key = (class, dir.to_path_buf());
    let mut stores = STORES.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(store) = stores.get(&key) {
        return Ok(Arc::clone(store));
    }
    let store = Arc::new(KvStore::open(&dir.join(class.db_name()), create)?);
    stores.insert(key, Arc::clone(&store));
    Ok(store)
}

/// Drain the cache, closing every open store. Called during shutdown.
pub fn close_all() {
    let mut stores = STORES.lock().unwrap_or_else(|e| e.into_inner());
    let count = stores.len();
    stores.clear();
    if count > 0 {
        debug!("closed {count} key/value stores");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cache_returns_same_handle() {
        let dir = TempDir::new().unwrap();
        close_all();
        let a = store_for(DbClass::Cached, dir.path()).unwrap();
        let b = store_for(DbClass::Cached, dir.path()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        drop((a, b));
        close_all();
    }

    #[test]
    fn default_store_probe_does_not_create() {
        let dir = TempDir::new().unwrap();
        close_all();
        assert!(store_for(DbClass::FactoryDefault, dir.path()).is_err());
        assert!(!dir.path().join(org::FACTORY_DEFAULT_DB_NAME).exists());

        // Explicit creation is still possible for the configurable store.
        let store = store_for_create(DbClass::ConfDefault, dir.path()).unwrap();
        store.write("k", b"v").unwrap();
        drop(store);
        close_all();
    }

    #[test]
    fn classes_map_to_distinct_stores() {
        let dir = TempDir::new().unwrap();
        close_all();
        let cached = store_for(DbClass::Cached, dir.path()).unwrap();
        let wt = store_for(DbClass::WriteThrough, dir.path()).unwrap();
        cached.write("k", b"cached").unwrap();
        let mut buf = [0u8; 8];
        assert!(wt.read("k", &mut buf).is_err());
        drop((cached, wt));
        close_all();
    }
}
