//! # perskit-core
//!
//! Shared foundation for the perskit persistence client library:
//!
//! - the public error taxonomy ([`PersError`]) with its stable negative
//!   code namespace
//! - resource addressing and configuration types ([`ResourceKey`],
//!   [`ResourceConfig`])
//! - the IEEE 802.3 CRC32 used for file checksums and key hashing
//! - the on-disk data organization (directory trees, store names, limits)
//! - logging setup and an isolated test environment helper

pub mod crc32;
pub mod error;
pub mod logging;
pub mod org;
pub mod testing;
pub mod types;

pub use error::{PersError, PersResult};
pub use types::{
    Notification, NotifyStatus, Permission, ResourceConfig, ResourceKey, ResourceType,
    ShutdownMode, StorageKind, StoragePolicy,
};
