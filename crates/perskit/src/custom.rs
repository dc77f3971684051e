//! Plugin gateway: custom storage behind eight predefined slots.
//!
//! A resource configured with `storage = custom` is served by the plugin
//! bound to the slot named by its `custom_name`. Each slot carries a
//! capability record; a missing capability (or an unbound slot) makes the
//! operation fail with `NoPluginFunction` instead of being a per-call-site
//! null check.
//!
//! Dynamic library loading is out of scope: providers register a
//! constructor per library name through [`register_provider`], and the
//! config file decides which slot binds which library, whether it loads at
//! init or on demand, and whether its init runs synchronously or
//! asynchronously with a completion callback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use perskit_core::{PersError, PersResult};

/// Default location of the plugin configuration file.
pub const PLUGIN_CONFIG_PATH: &str = "/etc/pclCustomLibConfigFile.cfg";

/// Completion callback passed to asynchronous plugin inits.
pub type AsyncInitCallback = fn(errcode: i32) -> i32;

/// Capability record of one plugin. Every field is optional; call sites
/// treat absence as `NoPluginFunction`.
#[derive(Clone, Copy, Default)]
pub struct PluginCapabilities {
    pub init: Option<fn() -> i32>,
    pub init_async: Option<fn(AsyncInitCallback) -> i32>,
    pub deinit: Option<fn() -> i32>,
    pub open: Option<fn(path: &str, flags: u32, mode: u32) -> i32>,
    pub close: Option<fn(handle: i32) -> i32>,
    pub read: Option<fn(path_key: &str, buf: &mut [u8]) -> i32>,
    pub write: Option<fn(path_key: &str, data: &[u8]) -> i32>,
    pub size: Option<fn(path_key: &str) -> i32>,
    pub delete: Option<fn(path_key: &str) -> i32>,
    pub clear_all: Option<fn() -> i32>,
    pub sync: Option<fn() -> i32>,
    pub create_backup: Option<fn(backup_id: &str, tag: &str) -> i32>,
    pub restore_backup: Option<fn(backup_id: &str, tag: &str) -> i32>,
    pub get_backup: Option<fn(buf: &mut [u8]) -> i32>,
    pub status_notify: Option<fn(status: u32) -> i32>,
}

/// The eight predefined plugin slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginSlot {
    Default,
    Early,
    Secure,
    Emergency,
    HwInfo,
    Custom1,
    Custom2,
    Custom3,
}

impl PluginSlot {
    pub const ALL: [PluginSlot; 8] = [
        PluginSlot::Default,
        PluginSlot::Early,
        PluginSlot::Secure,
        PluginSlot::Emergency,
        PluginSlot::HwInfo,
        PluginSlot::Custom1,
        PluginSlot::Custom2,
        PluginSlot::Custom3,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PluginSlot::Default => "default",
            PluginSlot::Early => "early",
            PluginSlot::Secure => "secure",
            PluginSlot::Emergency => "emergency",
            PluginSlot::HwInfo => "hwinfo",
            PluginSlot::Custom1 => "custom1",
            PluginSlot::Custom2 => "custom2",
            PluginSlot::Custom3 => "custom3",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.name() == name)
    }

    fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

/// When a slot's library is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Resolved and initialized during library init.
    AtInit,
    /// Resolved by the first operation that needs it.
    OnDemand,
}

/// How a plugin's init runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitKind {
    Sync,
    Async,
}

#[derive(Debug, Clone)]
struct SlotConfig {
    library: String,
    load: LoadPolicy,
    init: InitKind,
}

static SLOT_CONFIG: Lazy<Mutex<[Option<SlotConfig>; 8]>> =
    Lazy::new(|| Mutex::new(Default::default()));
static SLOTS: Lazy<Mutex<[Option<PluginCapabilities>; 8]>> =
    Lazy::new(|| Mutex::new(Default::default()));
static PROVIDERS: Lazy<Mutex<HashMap<String, fn() -> PluginCapabilities>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register the constructor for a plugin library.
///
/// Applications call this before `init_library`; the name must match the
/// library column of the configuration file. Registrations survive
/// init/deinit cycles.
pub fn register_provider(library: &str, build: fn() -> PluginCapabilities) {
    PROVIDERS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(library.to_string(), build);
}

/// Configuration file location: env override or the fixed default.
pub(crate) fn plugin_config_path() -> PathBuf {
    match std::env::var("PERS_CLIENT_LIB_CUSTOM_LOAD") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(PLUGIN_CONFIG_PATH),
    }
}

/// Parse the plugin configuration file. Rows are
/// `slot-name library-name {init|od} {sync|async}`; malformed rows are
/// logged and skipped. A missing file simply configures no plugins.
pub(crate) fn load_config(path: &Path) -> PersResult<usize> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            info!("no plugin configuration at {path:?}: {e}");
            return Ok(0);
        }
    };

    let mut config = SLOT_CONFIG.lock().unwrap_or_else(|e| e.into_inner());
    let mut rows = 0;
    for line in content.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() != 4 {
            warn!("malformed plugin config row: {line:?}");
            continue;
        }
        let Some(slot) = PluginSlot::from_name(tokens[0]) else {
            warn!("unknown plugin slot {:?}", tokens[0]);
            continue;
        };
        let load = match tokens[2] {
            "init" => LoadPolicy::AtInit,
            "od" => LoadPolicy::OnDemand,
            other => {
                warn!("unknown load policy {other:?} for slot {}", slot.name());
                continue;
            }
        };
        let init = match tokens[3] {
            "sync" => InitKind::Sync,
            "async" => InitKind::Async,
            other => {
                warn!("unknown init kind {other:?} for slot {}", slot.name());
                continue;
            }
        };
        config[slot.index()] = Some(SlotConfig {
            library: tokens[1].to_string(),
            load,
            init,
        });
        rows += 1;
    }
    debug!("configured {rows} plugin slots from {path:?}");
    Ok(rows)
}

fn run_init(slot: PluginSlot, caps: &PluginCapabilities, kind: InitKind, cb: AsyncInitCallback) {
    let rc = match kind {
        InitKind::Sync => caps.init.map(|f| f()),
        InitKind::Async => caps.init_async.map(|f| f(cb)),
    };
    match rc {
        Some(rc) if rc < 0 => warn!("plugin {} init returned {rc}", slot.name()),
        Some(_) => {}
        None => debug!("plugin {} has no init entry", slot.name()),
    }
}

fn load_slot(slot: PluginSlot, cb: AsyncInitCallback) -> PersResult<PluginCapabilities> {
    let config = {
        let configs = SLOT_CONFIG.lock().unwrap_or_else(|e| e.into_inner());
        configs[slot.index()].clone()
    };
    let Some(config) = config else {
        return Err(PersError::NoPluginFunction);
    };
    let build = {
        let providers = PROVIDERS.lock().unwrap_or_else(|e| e.into_inner());
        providers.get(&config.library).copied()
    };
    let Some(build) = build else {
        warn!(
            "no provider registered for plugin library {:?} (slot {})",
            config.library,
            slot.name()
        );
        return Err(PersError::NoPluginFunction);
    };
    let caps = build();
    SLOTS.lock().unwrap_or_else(|e| e.into_inner())[slot.index()] = Some(caps);
    run_init(slot, &caps, config.init, cb);
    Ok(caps)
}

/// Load and initialize every slot configured with the at-init policy.
///
/// Resolution failures are logged per slot; the library still comes up and
/// operations on the broken slot fail individually.
pub(crate) fn load_at_init(cb: AsyncInitCallback) {
    for slot in PluginSlot::ALL {
        let at_init = {
            let configs = SLOT_CONFIG.lock().unwrap_or_else(|e| e.into_inner());
            matches!(
                configs[slot.index()],
                Some(SlotConfig {
                    load: LoadPolicy::AtInit,
                    ..
                })
            )
        };
        if at_init {
            if let Err(e) = load_slot(slot, cb) {
                warn!("failed to load plugin slot {}: {e}", slot.name());
            }
        }
    }
}

/// Capability record for the slot named `custom_name`, loading on-demand
/// slots on first use.
pub(crate) fn capabilities(custom_name: &str, cb: AsyncInitCallback) -> PersResult<PluginCapabilities> {
    let slot = PluginSlot::from_name(custom_name).ok_or(PersError::NoPluginFunction)?;
    {
        let slots = SLOTS.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(caps) = slots[slot.index()] {
            return Ok(caps);
        }
    }
    let on_demand = {
        let configs = SLOT_CONFIG.lock().unwrap_or_else(|e| e.into_inner());
        matches!(
            configs[slot.index()],
            Some(SlotConfig {
                load: LoadPolicy::OnDemand,
                ..
            })
        )
    };
    if on_demand {
        load_slot(slot, cb)
    } else {
        Err(PersError::NoPluginFunction)
    }
}

fn map_rc(rc: i32) -> PersResult<usize> {
    if rc < 0 {
        Err(PersError::Common)
    } else {
        Ok(rc as usize)
    }
}

pub(crate) fn plugin_read(
    custom_name: &str,
    cb: AsyncInitCallback,
    path_key: &str,
    buf: &mut [u8],
) -> PersResult<usize> {
    let caps = capabilities(custom_name, cb)?;
    let read = caps.read.ok_or(PersError::NoPluginFunction)?;
    map_rc(read(path_key, buf))
}

pub(crate) fn plugin_write(
    custom_name: &str,
    cb: AsyncInitCallback,
    path_key: &str,
    data: &[u8],
) -> PersResult<usize> {
    let caps = capabilities(custom_name, cb)?;
    let write = caps.write.ok_or(PersError::NoPluginFunction)?;
    let written = map_rc(write(path_key, data))?;
    if written != data.len() {
        warn!("plugin {custom_name} wrote {written} of {} bytes", data.len());
        return Err(PersError::Common);
    }
    Ok(written)
}

pub(crate) fn plugin_size(
    custom_name: &str,
    cb: AsyncInitCallback,
    path_key: &str,
) -> PersResult<usize> {
    let caps = capabilities(custom_name, cb)?;
    let size = caps.size.ok_or(PersError::NoPluginFunction)?;
    map_rc(size(path_key))
}

pub(crate) fn plugin_delete(
    custom_name: &str,
    cb: AsyncInitCallback,
    path_key: &str,
) -> PersResult<()> {
    let caps = capabilities(custom_name, cb)?;
    let delete = caps.delete.ok_or(PersError::NoPluginFunction)?;
    map_rc(delete(path_key)).map(|_| ())
}

/// Deinitialize and unbind every loaded slot. Full-shutdown path; the slot
/// configuration is dropped as well and re-read on the next init.
pub(crate) fn deinit_all() {
    let mut slots = SLOTS.lock().unwrap_or_else(|e| e.into_inner());
    for (slot, entry) in PluginSlot::ALL.iter().zip(slots.iter_mut()) {
        if let Some(caps) = entry.take() {
            if let Some(deinit) = caps.deinit {
                let rc = deinit();
                if rc < 0 {
                    warn!("plugin {} deinit returned {rc}", slot.name());
                }
            }
        }
    }
    *SLOT_CONFIG.lock().unwrap_or_else(|e| e.into_inner()) = Default::default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use perskit_core::testing::TestEnvironment;
    use std::sync::atomic::{AtomicU32, Ordering};

    static INIT_CALLS: AtomicU32 = AtomicU32::new(0);
    static DEINIT_CALLS: AtomicU32 = AtomicU32::new(0);

    fn test_plugin() -> PluginCapabilities {
        PluginCapabilities {
            init: Some(|| {
                INIT_CALLS.fetch_add(1, Ordering::SeqCst);
                1
            }),
            deinit: Some(|| {
                DEINIT_CALLS.fetch_add(1, Ordering::SeqCst);
                1
            }),
            read: Some(|_key, buf| {
                let payload = b"plugin-data";
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                n as i32
            }),
            write: Some(|_key, data| data.len() as i32),
            size: Some(|_key| 11),
            ..Default::default()
        }
    }

    fn async_cb(_err: i32) -> i32 {
        1
    }

    fn configure(env: &TestEnvironment, rows: &str) {
        let path = env
            .create_file(env.root.join("plugins.cfg"), rows.as_bytes())
            .unwrap();
        load_config(&path).unwrap();
    }

    #[test]
    fn at_init_slot_loads_and_inits() {
        let env = TestEnvironment::new().unwrap();
        deinit_all();
        register_provider("libhw.so", test_plugin);
        configure(&env, "hwinfo libhw.so init sync\n");

        let before = INIT_CALLS.load(Ordering::SeqCst);
        load_at_init(async_cb);
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), before + 1);

        let mut buf = [0u8; 16];
        let n = plugin_read("hwinfo", async_cb, "0x000000FF/hwinfo/serial", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"plugin-data");

        let before_deinit = DEINIT_CALLS.load(Ordering::SeqCst);
        deinit_all();
        assert_eq!(DEINIT_CALLS.load(Ordering::SeqCst), before_deinit + 1);
    }

    #[test]
    fn on_demand_slot_loads_on_first_use() {
        let env = TestEnvironment::new().unwrap();
        deinit_all();
        register_provider("libearly.so", test_plugin);
        configure(&env, "early libearly.so od sync\n");

        let before = INIT_CALLS.load(Ordering::SeqCst);
        load_at_init(async_cb);
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), before);

        assert_eq!(plugin_size("early", async_cb, "0x00000000/early/x").unwrap(), 11);
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), before + 1);
        deinit_all();
    }

    #[test]
    fn unconfigured_slot_has_no_plugin_function() {
        let _env = TestEnvironment::new().unwrap();
        deinit_all();
        let mut buf = [0u8; 4];
        assert_eq!(
            plugin_read("secure", async_cb, "k", &mut buf),
            Err(PersError::NoPluginFunction)
        );
    }

    #[test]
    fn missing_capability_is_no_plugin_function() {
        let env = TestEnvironment::new().unwrap();
        deinit_all();
        register_provider("libnodelete.so", || PluginCapabilities {
            write: Some(|_k, d| d.len() as i32),
            ..Default::default()
        });
        configure(&env, "custom1 libnodelete.so init sync\n");
        load_at_init(async_cb);

        assert_eq!(plugin_write("custom1", async_cb, "k", b"ab").unwrap(), 2);
        assert_eq!(
            plugin_delete("custom1", async_cb, "k"),
            Err(PersError::NoPluginFunction)
        );
        deinit_all();
    }

    #[test]
    fn async_init_receives_the_completion_callback() {
        static ASYNC_DONE: AtomicU32 = AtomicU32::new(0);

        let env = TestEnvironment::new().unwrap();
        deinit_all();
        register_provider("libasync.so", || PluginCapabilities {
            init_async: Some(|cb| {
                // Plugins report completion through the library callback.
                ASYNC_DONE.fetch_add(1, Ordering::SeqCst);
                cb(0)
            }),
            ..Default::default()
        });
        configure(&env, "emergency libasync.so init async\n");

        load_at_init(async_cb);
        assert_eq!(ASYNC_DONE.load(Ordering::SeqCst), 1);
        deinit_all();
    }

    #[test]
    fn malformed_config_rows_are_skipped() {
        let env = TestEnvironment::new().unwrap();
        deinit_all();
        register_provider("libok.so", test_plugin);
        configure(
            &env,
            "bogus-slot libx.so init sync\nearly libok.so maybe sync\nhwinfo libok.so od sync\n",
        );
        // Only the well-formed hwinfo row survives.
        assert!(plugin_size("hwinfo", async_cb, "k").is_ok());
        assert_eq!(
            plugin_size("early", async_cb, "k"),
            Err(PersError::NoPluginFunction)
        );
        deinit_all();
    }
}
