//! # perskit
//!
//! Client-side persistence for automotive and embedded applications: store
//! and retrieve per-application state across power cycles.
//!
//! Applications address resources by a logical tuple
//! `(ldbid, resource_id, user, seat)`; a per-application Resource
//! Configuration Table maps each resource to a local or shared key/value
//! store, a file on disk, or an application-supplied plugin. File updates
//! are crash-safe (backup plus CRC32 sidecar with recovery on open), and a
//! single event-loop thread owns all IPC towards the administration
//! service and the lifecycle peer.
//!
//! ```ignore
//! perskit::init_library("navigation", perskit::ShutdownMode::Normal)?;
//! let n = perskit::key::write(0xFF, "pos/last", 1, 1, b"52.5,13.4")?;
//! let mut buf = [0u8; 64];
//! let n = perskit::key::read(0xFF, "pos/last", 1, 1, &mut buf)?;
//! perskit::deinit_library()?;
//! ```

mod backup;
pub mod custom;
mod event_loop;
pub mod file;
mod handle;
pub mod key;
mod lifecycle;
mod notify;
mod pas;

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

pub use perskit_core::{
    Notification, NotifyStatus, Permission, PersError, PersResult, ResourceConfig, ResourceType,
    ShutdownMode, StorageKind, StoragePolicy,
};

pub use custom::{
    register_provider, AsyncInitCallback, InitKind, LoadPolicy, PluginCapabilities, PluginSlot,
    PLUGIN_CONFIG_PATH,
};
pub use handle::Handle;
pub use lifecycle::{PCL_SHUTDOWN, PCL_SHUTDOWN_CANCEL};
pub use notify::NotifyCallback;
pub use pas::is_access_locked;

struct InitState {
    counter: u32,
}

static INIT: Lazy<Mutex<InitState>> = Lazy::new(|| Mutex::new(InitState { counter: 0 }));

/// Open fd on the application's cache tree, used to commit the buffer
/// cache during shutdown preparation. Lives outside [`INIT`] because the
/// event-loop thread touches it while deinit holds the init lock.
static SYNC_FD: Lazy<Mutex<Option<File>>> = Lazy::new(|| Mutex::new(None));

/// Flush the application folder to disk. Shutdown path.
pub(crate) fn sync_app_folder() {
    let guard = SYNC_FD.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(fd) = guard.as_ref() {
        if let Err(e) = fd.sync_all() {
            warn!("failed to sync the application folder: {e}");
        }
    }
}

/// Fast-path init counter mirrored from [`INIT`] for lock-free checks on
/// the data path.
static INIT_COUNT: AtomicU32 = AtomicU32::new(0);

static APP_ID: Lazy<RwLock<String>> = Lazy::new(|| RwLock::new(String::new()));

/// Recorded RCT location when the trusted-application check is enabled.
static TRUSTED_RCT: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

pub(crate) fn app_id() -> String {
    APP_ID.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Completion callback handed to plugins with asynchronous init.
pub(crate) fn default_async_cb(errcode: i32) -> i32 {
    debug!("async plugin init completed with {errcode}");
    1
}

/// Data-path admission: initialized, and (when enabled) still trusted.
pub(crate) fn ensure_initialized() -> PersResult<()> {
    if INIT_COUNT.load(Ordering::SeqCst) == 0 {
        return Err(PersError::NotInitialized);
    }
    let trusted = TRUSTED_RCT.read().unwrap_or_else(|e| e.into_inner());
    if let Some(rct_path) = trusted.as_ref() {
        if !rct_path.is_dir() {
            return Err(PersError::ShutdownNoTrusted);
        }
    }
    Ok(())
}

/// Initialize the library for an application.
///
/// Reference-counted: only the first call brings the backends up (event
/// loop, peer registration, blacklist, plugins); later calls just count.
pub fn init_library(app_name: &str, mode: ShutdownMode) -> PersResult<()> {
    if app_name.is_empty() || app_name.len() >= 256 {
        return Err(PersError::Common);
    }

    let mut state = INIT.lock().unwrap_or_else(|e| e.into_inner());
    if state.counter > 0 {
        state.counter += 1;
        INIT_COUNT.store(state.counter, Ordering::SeqCst);
        debug!("init counter incremented to {}", state.counter);
        return Ok(());
    }

    perskit_core::org::refresh_from_env();
    perskit_core::logging::init_logging();
    info!("initializing persistence client for {app_name}");

    *APP_ID.write().unwrap_or_else(|e| e.into_inner()) = app_name.to_string();
    lifecycle::set_mode(mode);
    lifecycle::reset_cancel_counter();
    pas::reset_access_lock();
    notify::clear();

    event_loop::start()?;

    // Register with the administration service. Failure keeps the data
    // path usable; only the admin-driven sync features are lost.
    let register = event_loop::MainLoopData::new(event_loop::CMD_SEND_PAS_REGISTER, [1, 0, 0, 0]);
    if let Err(e) = event_loop::deliver(&register) {
        warn!("admin service registration failed: {e}");
    }

    let cache_tree = perskit_core::org::cache_tree(app_name);
    *SYNC_FD.lock().unwrap_or_else(|e| e.into_inner()) = match File::open(&cache_tree) {
        Ok(fd) => Some(fd),
        Err(e) => {
            warn!("failed to open sync fd for {cache_tree:?}: {e}");
            None
        }
    };

    let blacklist = cache_tree.join(perskit_core::org::BACKUP_FILELIST_NAME);
    if backup::load_blacklist(&blacklist).is_err() {
        info!("no backup blacklist loaded for {app_name}");
    }

    if mode != ShutdownMode::None {
        let register =
            event_loop::MainLoopData::new(event_loop::CMD_SEND_LC_REGISTER, [1, mode as u32, 0, 0]);
        if let Err(e) = event_loop::deliver(&register) {
            warn!("lifecycle registration failed: {e}");
        }
    }

    if let Err(e) = custom::load_config(&custom::plugin_config_path()) {
        warn!("plugin configuration unusable: {e}");
    }
    custom::load_at_init(default_async_cb);

    if std::env::var("PERS_APPCHECK").map(|v| v == "1").unwrap_or(false) {
        let rct_path = perskit_core::org::wt_tree(app_name).join(perskit_core::org::RCT_DB_NAME);
        let trusted = rct_path.is_dir();
        info!(
            "application check enabled for {app_name}: {}",
            if trusted { "trusted" } else { "not trusted" }
        );
        *TRUSTED_RCT.write().unwrap_or_else(|e| e.into_inner()) = Some(rct_path);
    } else {
        *TRUSTED_RCT.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    state.counter = 1;
    INIT_COUNT.store(1, Ordering::SeqCst);
    Ok(())
}

/// Tear the library down.
///
/// Only the final matched call performs the real shutdown: the event loop
/// is asked to prepare shutdown and quit, then joined, and all in-memory
/// tables are drained.
pub fn deinit_library() -> PersResult<()> {
    let mut state = INIT.lock().unwrap_or_else(|e| e.into_inner());
    match state.counter {
        0 => Err(PersError::NotInitialized),
        1 => {
            info!("deinitializing persistence client for {}", app_id());

            if lifecycle::mode() != ShutdownMode::None {
                let unregister = event_loop::MainLoopData::new(
                    event_loop::CMD_SEND_LC_REGISTER,
                    [0, lifecycle::mode() as u32, 0, 0],
                );
                let _ = event_loop::deliver(&unregister);
            }
            let unregister =
                event_loop::MainLoopData::new(event_loop::CMD_SEND_PAS_REGISTER, [0, 0, 0, 0]);
            let _ = event_loop::deliver(&unregister);

            event_loop::stop_and_join();

            notify::clear();
            backup::clear_blacklist();
            handle::reset_all();
            perskit_rct::close_all_tables();
            perskit_kv::close_all();
            *TRUSTED_RCT.write().unwrap_or_else(|e| e.into_inner()) = None;

            *SYNC_FD.lock().unwrap_or_else(|e| e.into_inner()) = None;
            state.counter = 0;
            INIT_COUNT.store(0, Ordering::SeqCst);
            Ok(())
        }
        _ => {
            state.counter -= 1;
            INIT_COUNT.store(state.counter, Ordering::SeqCst);
            debug!("init counter decremented to {}", state.counter);
            Ok(())
        }
    }
}

/// Application-driven shutdown control; the request is [`PCL_SHUTDOWN`] or
/// [`PCL_SHUTDOWN_CANCEL`]. Only permitted when the library was
/// initialized with [`ShutdownMode::None`].
pub fn lifecycle_set(request: u32) -> PersResult<()> {
    ensure_initialized()?;
    lifecycle::lifecycle_set(request)
}
