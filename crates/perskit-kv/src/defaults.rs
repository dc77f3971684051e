//! Default-data fallback.
//!
//! When a read (or size query) on a user resource misses, the same lookup
//! is retried against the configurable-default store and then the
//! factory-default store; the first hit wins. Default stores are keyed by
//! the bare resource id, without the node/user/seat scope prefix.

use std::path::Path;

use tracing::debug;

use perskit_core::{PersError, PersResult};

use crate::cache::{store_for, DbClass};

/// What the fallback is asked to produce.
#[derive(Debug)]
pub enum DefaultJob<'a> {
    /// Read the default payload into the buffer.
    Data(&'a mut [u8]),
    /// Report the size of the default payload.
    Size,
}

/// Consult the two default stores in `dir` for `resource_id`.
///
/// Returns the byte count read (or the stored size), `NoKey` when neither
/// store has the resource.
pub fn get_defaults(dir: &Path, resource_id: &str, job: DefaultJob<'_>) -> PersResult<usize> {
    let mut job = job;
    for class in [DbClass::ConfDefault, DbClass::FactoryDefault] {
        let store = match store_for(class, dir) {
            Ok(store) => store,
            // A missing default store is an expected miss, not an error.
            Err(_) => continue,
        };
        let result = match &mut job {
            DefaultJob::Data(buf) => store.read(resource_id, buf),
            DefaultJob::Size => store.size(resource_id),
        };
        match result {
            Ok(n) => {
                debug!("default data used for {resource_id} from {class:?}");
                return Ok(n);
            }
            Err(PersError::NoKey) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(PersError::NoKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{close_all, store_for_create};
    use tempfile::TempDir;

    #[test]
    fn fallback_order_configurable_first() {
        let dir = TempDir::new().unwrap();
        close_all();

        let conf = store_for_create(DbClass::ConfDefault, dir.path()).unwrap();
        let factory = store_for_create(DbClass::FactoryDefault, dir.path()).unwrap();
        conf.write("media/a", b"configurable").unwrap();
        factory.write("media/a", b"factory").unwrap();
        factory.write("media/b", b"factory-only").unwrap();
        drop((conf, factory));

        let mut buf = [0u8; 32];
        let n = get_defaults(dir.path(), "media/a", DefaultJob::Data(&mut buf)).unwrap();
        assert_eq!(&buf[..n], b"configurable");

        let n = get_defaults(dir.path(), "media/b", DefaultJob::Data(&mut buf)).unwrap();
        assert_eq!(&buf[..n], b"factory-only");

        assert_eq!(
            get_defaults(dir.path(), "media/b", DefaultJob::Size).unwrap(),
            b"factory-only".len()
        );

        assert_eq!(
            get_defaults(dir.path(), "media/absent", DefaultJob::Size),
            Err(PersError::NoKey)
        );
        close_all();
    }

    #[test]
    fn no_default_stores_is_a_miss() {
        let dir = TempDir::new().unwrap();
        close_all();
        let mut buf = [0u8; 8];
        assert_eq!(
            get_defaults(dir.path(), "anything", DefaultJob::Data(&mut buf)),
            Err(PersError::NoKey)
        );
        close_all();
    }
}
