//! Lifecycle core: shutdown modes, application-driven shutdown and the
//! cancel budget.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use perskit_core::{org, PersError, PersResult, ShutdownMode};
use perskit_ipc::{NSM_ERROR_STATUS_FAIL, NSM_ERROR_STATUS_OK, NSM_SHUTDOWN_NORMAL};

use crate::event_loop::{
    self, MainLoopData, CMD_LC_PREPARE_SHUTDOWN, SHUTDOWN_FULL, SHUTDOWN_PARTIAL,
};
use crate::pas;

/// `lifecycle_set` request: write back data, shutdown is coming.
pub const PCL_SHUTDOWN: u32 = 1;
/// `lifecycle_set` request: a pending shutdown was cancelled.
pub const PCL_SHUTDOWN_CANCEL: u32 = 0;

static MODE: AtomicU32 = AtomicU32::new(ShutdownMode::None as u32);
static CANCEL_COUNTER: AtomicU32 = AtomicU32::new(0);

pub(crate) fn set_mode(mode: ShutdownMode) {
    MODE.store(mode as u32, Ordering::SeqCst);
}

pub(crate) fn mode() -> ShutdownMode {
    ShutdownMode::from_u32(MODE.load(Ordering::SeqCst)).unwrap_or(ShutdownMode::None)
}

/// A new lifecycle begins at init: the cancel budget is restored.
pub(crate) fn reset_cancel_counter() {
    CANCEL_COUNTER.store(0, Ordering::SeqCst);
}

/// Application-driven shutdown handling. Only available when the library
/// was initialized with shutdown mode `none`; otherwise the lifecycle peer
/// drives shutdown and the call is refused.
pub(crate) fn lifecycle_set(request: u32) -> PersResult<()> {
    if mode() != ShutdownMode::None {
        warn!("lifecycle_set refused: library registered for lifecycle shutdown");
        return Err(PersError::ShutdownNoPermit);
    }
    match request {
        PCL_SHUTDOWN => {
            let data = MainLoopData::new(CMD_LC_PREPARE_SHUTDOWN, [SHUTDOWN_PARTIAL, 0, 0, 0]);
            event_loop::deliver_nb(&data)
        }
        PCL_SHUTDOWN_CANCEL => {
            if CANCEL_COUNTER.load(Ordering::SeqCst) >= org::SHUTDOWN_MAX_COUNT {
                return Err(PersError::ShutdownMaxCancel);
            }
            CANCEL_COUNTER.fetch_add(1, Ordering::SeqCst);
            pas::unlock_access();
            Ok(())
        }
        _ => Err(PersError::Common),
    }
}

/// Handle an incoming `LifecycleRequest` from the node state manager.
/// Runs on the event-loop thread.
pub(crate) fn check_lc_request(request: u32, request_id: u32) -> i32 {
    match request {
        NSM_SHUTDOWN_NORMAL => {
            let data =
                MainLoopData::new(CMD_LC_PREPARE_SHUTDOWN, [SHUTDOWN_FULL, request_id, 0, 0]);
            match event_loop::deliver_nb(&data) {
                Ok(()) => NSM_ERROR_STATUS_OK,
                Err(e) => {
                    warn!("failed to queue prepare-shutdown: {e}");
                    NSM_ERROR_STATUS_FAIL
                }
            }
        }
        other => {
            debug!("unknown lifecycle request {other}");
            NSM_ERROR_STATUS_FAIL
        }
    }
}
