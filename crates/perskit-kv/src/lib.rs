//! # perskit-kv
//!
//! Access to the key/value backends. The disk-level engine is LMDB (via
//! `heed`), treated as an opaque ordered store with open, read, write,
//! delete and list. This crate owns:
//!
//! - [`KvStore`]: one open store (an LMDB environment with a single
//!   unnamed database)
//! - the process-wide handle cache, one entry per `(class, directory)`
//! - the default-data fallback consulted when a read misses

pub mod cache;
pub mod defaults;
pub mod store;

pub use cache::{close_all, store_for, store_for_create, DbClass};
pub use defaults::{get_defaults, DefaultJob};
pub use store::KvStore;
