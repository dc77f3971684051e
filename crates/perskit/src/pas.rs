//! Access lock and admin-service request handling.
//!
//! The administration service blocks all data operations while it stages a
//! sync-to-disk. The lock is a process-wide counter touched only with
//! atomics; every public data operation consults it before touching
//! storage.

use std::sync::atomic::{AtomicU32, Ordering};

use perskit_ipc::{
    PAS_MSG_BLOCK, PAS_MSG_UNBLOCK, PAS_MSG_WRITE_BACK, PAS_STATUS_FAIL, PAS_STATUS_OK,
    PAS_STATUS_RESP_PEND,
};
use tracing::warn;

use perskit_core::{PersError, PersResult};

use crate::event_loop::{self, MainLoopData, CMD_PAS_BLOCK_AND_WRITE_BACK};

static ACCESS_LOCK: AtomicU32 = AtomicU32::new(0);

/// Raise the access lock.
pub(crate) fn lock_access() {
    ACCESS_LOCK.fetch_add(1, Ordering::SeqCst);
}

/// Lower the access lock. Saturates at zero.
pub(crate) fn unlock_access() {
    let _ = ACCESS_LOCK.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
}

/// Is data access currently blocked?
pub fn is_access_locked() -> bool {
    ACCESS_LOCK.load(Ordering::SeqCst) > 0
}

/// Reset the lock at init time.
pub(crate) fn reset_access_lock() {
    ACCESS_LOCK.store(0, Ordering::SeqCst);
}

/// Fail with `LockFs` while the lock is raised.
pub(crate) fn check_access() -> PersResult<()> {
    if is_access_locked() {
        Err(PersError::LockFs)
    } else {
        Ok(())
    }
}

/// Handle an incoming `PersistenceAdminRequest`.
///
/// Runs on the event-loop thread, so the block request is queued through
/// the non-blocking pipe variant and answered `RespPend`; the completion
/// reply follows once the queued command is processed.
pub(crate) fn check_pas_request(request: u32, request_id: u32) -> i32 {
    if request & (PAS_MSG_BLOCK | PAS_MSG_WRITE_BACK) == (PAS_MSG_BLOCK | PAS_MSG_WRITE_BACK) {
        let data = MainLoopData::new(
            CMD_PAS_BLOCK_AND_WRITE_BACK,
            [request, request_id, 0, 0],
        );
        match event_loop::deliver_nb(&data) {
            Ok(()) => PAS_STATUS_RESP_PEND,
            Err(e) => {
                warn!("failed to queue block-and-write-back: {e}");
                PAS_STATUS_FAIL
            }
        }
    } else if request == PAS_MSG_UNBLOCK {
        unlock_access();
        PAS_STATUS_OK
    } else {
        warn!("unknown admin request {request:#x}");
        PAS_STATUS_FAIL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_counts_and_saturates() {
        let _guard = perskit_core::testing::env_lock();
        reset_access_lock();
        assert!(!is_access_locked());
        lock_access();
        lock_access();
        assert!(is_access_locked());
        assert_eq!(check_access(), Err(PersError::LockFs));
        unlock_access();
        assert!(is_access_locked());
        unlock_access();
        assert!(!is_access_locked());
        // Extra unlocks must not wrap around into a locked state.
        unlock_access();
        assert!(!is_access_locked());
        assert_eq!(check_access(), Ok(()));
    }
}
