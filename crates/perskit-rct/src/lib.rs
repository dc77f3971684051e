//! # perskit-rct
//!
//! Resource Configuration Tables (RCTs) and the resolution of a
//! `(ldbid, resource_id, user, seat)` tuple into a backend, a storage path
//! and an internal store key.
//!
//! RCTs are read-only LMDB tables living under the write-through tree,
//! opened on first demand and cached process-wide until deinit.

pub mod resolve;
pub mod store;

pub use resolve::{custom_path_key, db_context, resolve, DbContext, ResolvedPath};
pub use store::{close_all_tables, resource_cfg_table, table_id, RctKind, RctTable, RctWriter};
