//! Error taxonomy of the persistence client library.
//!
//! Every backend error (storage engine, filesystem, wire) is translated into
//! [`PersError`] at the crate boundary where it occurs; raw engine codes never
//! escape. Each variant maps to a stable negative integer via
//! [`PersError::code`], mirroring the error namespace spoken by the
//! administration service and existing tooling.

use thiserror::Error;

/// Result alias used across all perskit crates.
pub type PersResult<T> = std::result::Result<T, PersError>;

/// Errors surfaced by the persistence client library.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersError {
    /// Unspecified failure; details are in the log.
    #[error("common error")]
    Common,

    /// Access to persistent data is blocked by the administration service.
    #[error("persistence layer is locked")]
    LockFs,

    /// The storage policy of the resource is invalid for this operation.
    #[error("bad storage policy")]
    BadPolicy,

    /// All handles are in use.
    #[error("maximum number of open handles reached")]
    MaxHandle,

    /// Payload exceeds the configured per-key data ceiling.
    #[error("buffer exceeds maximum data size")]
    BufLimit,

    /// No resource configuration table is available.
    #[error("no resource configuration table found")]
    NoPrctTable,

    /// The key does not exist.
    #[error("key not found")]
    NoKey,

    /// The resource table exists but holds no entry for the resource.
    #[error("no data for key")]
    NoKeyData,

    /// Opening a file failed.
    #[error("failed to open file")]
    OpenFile,

    /// The plugin slot is unconfigured or the capability is absent.
    #[error("no plugin function")]
    NoPluginFunction,

    /// Removing a file failed.
    #[error("failed to remove file")]
    FileRemove,

    /// The storage engine reported an internal error.
    #[error("internal database error")]
    DbErrorInternal,

    /// The key name exceeds the engine's key size limit.
    #[error("database key size exceeded")]
    DbKeySize,

    /// The value exceeds the engine's value size limit.
    #[error("database value size exceeded")]
    DbValueSize,

    /// The resource is configured as a file, not a key.
    #[error("resource is not a key")]
    ResourceNoKey,

    /// Sending the change notification signal failed.
    #[error("failed to emit notification signal")]
    NotifySig,

    /// The library has not been initialized.
    #[error("library not initialized")]
    NotInitialized,

    /// Change notifications are not possible for this resource, or a second
    /// callback was supplied.
    #[error("notification not allowed")]
    NotifyNotAllowed,

    /// A shared resource was written by an application that is not
    /// responsible for it.
    #[error("application is not responsible for this resource")]
    NotRespApp,

    /// The application is not trusted (no resource table present).
    #[error("application not trusted")]
    ShutdownNoTrusted,

    /// The shutdown cancel budget is exhausted for this lifecycle.
    #[error("maximum number of shutdown cancels reached")]
    ShutdownMaxCancel,

    /// `lifecycle_set` is only permitted with shutdown mode `none`.
    #[error("shutdown request not permitted")]
    ShutdownNoPermit,

    /// The resource is read-only.
    #[error("resource is read only")]
    ResourceReadOnly,

    /// The resource is configured as a key, not a file.
    #[error("resource is not a file")]
    ResourceNoFile,

    /// The handle does not refer to a live entry.
    #[error("invalid handle")]
    InvalidHandle,
}

impl PersError {
    /// Stable negative code of this error.
    ///
    /// The namespace is shared with the C-era tooling, so codes must not be
    /// renumbered.
    pub fn code(&self) -> i32 {
        match self {
            PersError::Common => -1,
            PersError::LockFs => -2,
            PersError::BadPolicy => -3,
            PersError::MaxHandle => -4,
            PersError::BufLimit => -5,
            PersError::NoPrctTable => -6,
            PersError::NoKey => -7,
            PersError::NoKeyData => -8,
            PersError::OpenFile => -10,
            PersError::NoPluginFunction => -24,
            PersError::FileRemove => -25,
            PersError::DbErrorInternal => -27,
            PersError::DbKeySize => -28,
            PersError::DbValueSize => -29,
            PersError::ResourceNoKey => -30,
            PersError::NotifySig => -31,
            PersError::NotInitialized => -32,
            PersError::NotifyNotAllowed => -37,
            PersError::NotRespApp => -38,
            PersError::ShutdownNoTrusted => -39,
            PersError::ShutdownMaxCancel => -40,
            PersError::ShutdownNoPermit => -41,
            PersError::ResourceReadOnly => -42,
            PersError::ResourceNoFile => -43,
            PersError::InvalidHandle => -44,
        }
    }

    /// True for the addressing errors that are expected during probes.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PersError::NoKey | PersError::NoKeyData | PersError::NoPrctTable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> Vec<PersError> {
        vec![
            PersError::Common,
            PersError::LockFs,
            PersError::BadPolicy,
            PersError::MaxHandle,
            PersError::BufLimit,
            PersError::NoPrctTable,
            PersError::NoKey,
            PersError::NoKeyData,
            PersError::OpenFile,
            PersError::NoPluginFunction,
            PersError::FileRemove,
            PersError::DbErrorInternal,
            PersError::DbKeySize,
            PersError::DbValueSize,
            PersError::ResourceNoKey,
            PersError::NotifySig,
            PersError::NotInitialized,
            PersError::NotifyNotAllowed,
            PersError::NotRespApp,
            PersError::ShutdownNoTrusted,
            PersError::ShutdownMaxCancel,
            PersError::ShutdownNoPermit,
            PersError::ResourceReadOnly,
            PersError::ResourceNoFile,
            PersError::InvalidHandle,
        ]
    }

    #[test]
    fn codes_are_negative_and_distinct() {
        let mut seen = std::collections::BTreeSet::new();
        for err in all() {
            let code = err.code();
            assert!(code < 0, "{err:?} has non-negative code {code}");
            assert!(seen.insert(code), "duplicate code {code} for {err:?}");
        }
    }

    #[test]
    fn not_found_classification() {
        assert!(PersError::NoKey.is_not_found());
        assert!(PersError::NoPrctTable.is_not_found());
        assert!(!PersError::LockFs.is_not_found());
    }
}
