//! Resource addressing and configuration types.

use serde::{Deserialize, Serialize};

/// Logical database id addressing data local to the application.
pub const PCL_LDBID_LOCAL: u32 = 0xFF;

/// Logical database id addressing shared public data.
pub const PCL_LDBID_PUBLIC: u32 = 0;

/// Sentinel user id: writes go to the configurable-default store.
pub const PCL_USER_DEFAULTDATA: u32 = 0xFFFF_FFFF;

/// The addressing tuple for a persistent resource.
///
/// `ldbid == 0xFF` is local to the application, `ldbid == 0` is shared
/// public, `0 < ldbid < 0x80` addresses the shared group `ldbid`; all other
/// values form their own namespaces inside the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey<'a> {
    pub ldbid: u32,
    pub resource_id: &'a str,
    pub user: u32,
    pub seat: u32,
}

impl<'a> ResourceKey<'a> {
    pub fn new(ldbid: u32, resource_id: &'a str, user: u32, seat: u32) -> Self {
        Self {
            ldbid,
            resource_id,
            user,
            seat,
        }
    }

    /// True if the tuple addresses a shared (public or group) namespace.
    pub fn is_shared(&self) -> bool {
        self.ldbid < 0x80
    }
}

/// Storage policy of a resource: which directory tree it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StoragePolicy {
    /// Cached tree, written back on shutdown or admin request.
    WriteCached = 0,
    /// Write-through tree, persisted immediately.
    WriteThrough = 1,
    /// Policy not applicable (custom plugins).
    Na = 2,
}

/// Backend class a resource is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StorageKind {
    /// Application-local key/value store or file tree.
    Local = 0,
    /// Shared (public or group) store.
    Shared = 1,
    /// Application-supplied plugin.
    Custom = 2,
}

/// Whether a resource is a key/value entry or a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceType {
    Key = 0,
    File = 1,
}

/// Access permission of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Permission {
    ReadWrite = 0,
    ReadOnly = 1,
    WriteOnly = 2,
}

/// Maximum length of the `responsible` field of an RCT entry.
pub const MAX_RESPONSIBLE_LEN: usize = 32;
/// Maximum length of the `custom_name` field of an RCT entry.
pub const MAX_CUSTOM_NAME_LEN: usize = 32;
/// Maximum length of the `custom_id` field of an RCT entry.
pub const MAX_CUSTOM_ID_LEN: usize = 64;

/// One entry of a Resource Configuration Table.
///
/// Immutable once the table is built; consumed read-only by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub policy: StoragePolicy,
    pub storage: StorageKind,
    pub res_type: ResourceType,
    pub permission: Permission,
    pub max_size: u32,
    pub responsible: String,
    pub custom_name: String,
    pub custom_id: String,
}

impl ResourceConfig {
    /// The entry synthesized for local resources absent from the RCT:
    /// write-cached, local, read-write, 16 KiB. The resource type follows
    /// the operation that triggered the synthesis.
    pub fn default_local(res_type: ResourceType) -> Self {
        Self {
            policy: StoragePolicy::WriteCached,
            storage: StorageKind::Local,
            res_type,
            permission: Permission::ReadWrite,
            max_size: crate::org::DEFAULT_MAX_KEY_VAL_DATA_SIZE as u32,
            responsible: "default".into(),
            custom_name: "default".into(),
            custom_id: String::new(),
        }
    }

    /// Check the fixed field length limits.
    pub fn validate(&self) -> Result<(), crate::PersError> {
        if self.responsible.len() > MAX_RESPONSIBLE_LEN
            || self.custom_name.len() > MAX_CUSTOM_NAME_LEN
            || self.custom_id.len() > MAX_CUSTOM_ID_LEN
        {
            return Err(crate::PersError::DbValueSize);
        }
        Ok(())
    }
}

/// Reason carried by a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NotifyStatus {
    NoChange = 0,
    Created = 1,
    Changed = 2,
    Deleted = 3,
}

/// Record handed to the registered change-notification callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub resource_id: String,
    pub ldbid: u32,
    pub user: u32,
    pub seat: u32,
    pub status: NotifyStatus,
}

/// Lifecycle participation selected at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ShutdownMode {
    /// No lifecycle registration; the application drives shutdown itself
    /// through `lifecycle_set`.
    None = 0,
    /// Register for normal lifecycle shutdown.
    Normal = 1,
    /// Register for fast lifecycle shutdown.
    Fast = 2,
}

impl ShutdownMode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ShutdownMode::None),
            1 => Some(ShutdownMode::Normal),
            2 => Some(ShutdownMode::Fast),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_classification() {
        assert!(ResourceKey::new(0, "r", 0, 0).is_shared());
        assert!(ResourceKey::new(0x20, "r", 0, 0).is_shared());
        assert!(!ResourceKey::new(0xFF, "r", 0, 0).is_shared());
        assert!(!ResourceKey::new(0x80, "r", 0, 0).is_shared());
    }

    #[test]
    fn default_local_entry_shape() {
        let cfg = ResourceConfig::default_local(ResourceType::Key);
        assert_eq!(cfg.policy, StoragePolicy::WriteCached);
        assert_eq!(cfg.storage, StorageKind::Local);
        assert_eq!(cfg.permission, Permission::ReadWrite);
        assert_eq!(cfg.max_size, 16 * 1024);
        assert_eq!(cfg.res_type, ResourceType::Key);
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_rejects_oversized_fields() {
        let mut cfg = ResourceConfig::default_local(ResourceType::Key);
        cfg.responsible = "x".repeat(MAX_RESPONSIBLE_LEN + 1);
        assert!(cfg.validate().is_err());
    }
}
