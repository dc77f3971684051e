//! Change-notification registry.
//!
//! The application registers interest per key; the registry stores the
//! CRC32 of the store key and a single callback shared by all
//! registrations. The callback slot is written by workers under its lock
//! and read by the event loop, which gives the required release/acquire
//! publication.

use std::collections::BTreeSet;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::warn;

use perskit_core::{Notification, PersError, PersResult};

/// Callback invoked from the event loop for matching change signals.
///
/// A plain function pointer: the library supports exactly one callback, and
/// re-registration with the same pointer must be recognizable.
pub type NotifyCallback = fn(&Notification);

static REGISTERED: Lazy<Mutex<BTreeSet<u32>>> = Lazy::new(|| Mutex::new(BTreeSet::new()));
static CALLBACK: Lazy<Mutex<Option<NotifyCallback>>> = Lazy::new(|| Mutex::new(None));

/// Add a key hash and install the callback.
///
/// A second registration with a different callback is rejected.
pub(crate) fn register(key_hash: u32, callback: NotifyCallback) -> PersResult<()> {
    let mut slot = CALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = *slot {
        if existing != callback {
            warn!("only one change-notification callback is supported");
            return Err(PersError::NotifyNotAllowed);
        }
    }
    REGISTERED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key_hash);
    *slot = Some(callback);
    Ok(())
}

/// Remove a key hash; the callback is cleared with the last registration.
pub(crate) fn unregister(key_hash: u32) {
    let mut set = REGISTERED.lock().unwrap_or_else(|e| e.into_inner());
    set.remove(&key_hash);
    if set.is_empty() {
        *CALLBACK.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Invoke the callback for an incoming signal. Event-loop side.
pub(crate) fn dispatch(notification: &Notification) {
    let callback = *CALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    match callback {
        Some(callback) => callback(notification),
        None => warn!(
            "change signal for {} without a registered callback",
            notification.resource_id
        ),
    }
}

#[cfg(test)]
pub(crate) fn is_registered(key_hash: u32) -> bool {
    REGISTERED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(&key_hash)
}

/// Drop all registrations. Deinit path.
pub(crate) fn clear() {
    REGISTERED.lock().unwrap_or_else(|e| e.into_inner()).clear();
    *CALLBACK.lock().unwrap_or_else(|e| e.into_inner()) = None;
}
