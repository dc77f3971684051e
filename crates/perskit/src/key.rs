//! Key/value operations.
//!
//! Thin parameter checks around resolution, the KV backends and the plugin
//! gateway. All operations consult the init counter and the access lock
//! before touching storage; shared-storage mutations emit exactly one
//! change notification through the event loop per successful call.

use tracing::warn;

use perskit_core::crc32::crc32;
use perskit_core::types::PCL_USER_DEFAULTDATA;
use perskit_core::{
    org, NotifyStatus, PersError, PersResult, ResourceConfig, ResourceType, StorageKind,
    StoragePolicy,
};
use perskit_kv::{DbClass, DefaultJob};
use perskit_rct::{custom_path_key, db_context, resolve, DbContext};

use crate::event_loop::{self, MainLoopData, CMD_REG_NOTIFY_SIGNAL, CMD_SEND_NOTIFY_SIGNAL};
use crate::handle::{self, Handle, KeyHandleEntry};
use crate::{custom, notify, pas};

fn class_for(policy: StoragePolicy) -> PersResult<DbClass> {
    match policy {
        StoragePolicy::WriteCached => Ok(DbClass::Cached),
        StoragePolicy::WriteThrough => Ok(DbClass::WriteThrough),
        StoragePolicy::Na => Err(PersError::BadPolicy),
    }
}

fn key_context(ldbid: u32, resource_id: &str, user: u32, seat: u32) -> PersResult<DbContext> {
    let app = crate::app_id();
    let ctx = db_context(&app, ldbid, resource_id, user, seat, ResourceType::Key)?;
    if ctx.config.res_type != ResourceType::Key {
        return Err(PersError::ResourceNoKey);
    }
    Ok(ctx)
}

/// Directory holding the default stores consulted when a read misses: the
/// write-cached location of the same scope.
fn defaults_dir(ldbid: u32, resource_id: &str, user: u32, seat: u32, config: &ResourceConfig) -> std::path::PathBuf {
    let mut cfg = config.clone();
    cfg.policy = StoragePolicy::WriteCached;
    cfg.res_type = ResourceType::Key;
    cfg.storage = StorageKind::Local;
    let app = crate::app_id();
    resolve(&app, ldbid, resource_id, user, seat, &cfg).db_path
}

fn send_notify_signal(
    resource_id: &str,
    ldbid: u32,
    user: u32,
    seat: u32,
    status: NotifyStatus,
) -> PersResult<()> {
    let data = MainLoopData::new(
        CMD_SEND_NOTIFY_SIGNAL,
        [ldbid, user, seat, status as u32],
    )
    .with_string(resource_id);
    event_loop::deliver(&data).map_err(|_| PersError::NotifySig)
}

/// Write `data` under the resource. Returns the number of bytes stored.
pub fn write(
    ldbid: u32,
    resource_id: &str,
    user: u32,
    seat: u32,
    data: &[u8],
) -> PersResult<usize> {
    crate::ensure_initialized()?;
    pas::check_access()?;
    if data.len() > org::max_key_val_data_size() {
        warn!(
            "write of {} bytes exceeds the {}-byte ceiling",
            data.len(),
            org::max_key_val_data_size()
        );
        return Err(PersError::BufLimit);
    }

    let ctx = key_context(ldbid, resource_id, user, seat)?;
    if ctx.config.permission == perskit_core::Permission::ReadOnly {
        return Err(PersError::ResourceReadOnly);
    }

    match ctx.path.storage {
        StorageKind::Custom => {
            let path_key = custom_path_key(ldbid, &ctx.config, &ctx.path.db_key);
            let written = custom::plugin_write(
                &ctx.config.custom_name,
                crate::default_async_cb,
                &path_key,
                data,
            )?;
            send_notify_signal(resource_id, ldbid, user, seat, NotifyStatus::Changed)?;
            Ok(written)
        }
        _ => {
            let app = crate::app_id();
            if ctx.path.storage == StorageKind::Shared && ctx.config.responsible != app {
                return Err(PersError::NotRespApp);
            }
            let written = if user == PCL_USER_DEFAULTDATA {
                // Default-data writes land in the configurable-default
                // store under the bare resource id.
                let store = perskit_kv::store_for_create(DbClass::ConfDefault, &ctx.path.db_path)?;
                store.write(resource_id, data)?
            } else {
                let class = class_for(ctx.config.policy)?;
                let store = perskit_kv::store_for(class, &ctx.path.db_path)?;
                store.write(&ctx.path.db_key, data)?
            };
            if ctx.path.storage == StorageKind::Shared {
                send_notify_signal(resource_id, ldbid, user, seat, NotifyStatus::Changed)?;
            }
            Ok(written)
        }
    }
}

/// Read the resource into `buffer`; misses fall back to the default
/// stores. Returns the number of bytes copied.
pub fn read(
    ldbid: u32,
    resource_id: &str,
    user: u32,
    seat: u32,
    buffer: &mut [u8],
) -> PersResult<usize> {
    crate::ensure_initialized()?;
    pas::check_access()?;

    let ctx = key_context(ldbid, resource_id, user, seat)?;
    match ctx.path.storage {
        StorageKind::Custom => {
            let path_key = custom_path_key(ldbid, &ctx.config, &ctx.path.db_key);
            let plugin_result = custom::plugin_read(
                &ctx.config.custom_name,
                crate::default_async_cb,
                &path_key,
                buffer,
            );
            match plugin_result {
                Ok(n) if n > 0 => Ok(n),
                other => {
                    let dir = defaults_dir(ldbid, resource_id, user, seat, &ctx.config);
                    match perskit_kv::get_defaults(&dir, resource_id, DefaultJob::Data(buffer)) {
                        Ok(n) => Ok(n),
                        Err(_) => other,
                    }
                }
            }
        }
        _ => {
            let class = class_for(ctx.config.policy)?;
            let store = perskit_kv::store_for(class, &ctx.path.db_path)?;
            match store.read(&ctx.path.db_key, buffer) {
                Ok(n) => Ok(n),
                Err(PersError::NoKey) => {
                    perskit_kv::get_defaults(&ctx.path.db_path, resource_id, DefaultJob::Data(buffer))
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Size in bytes of the stored resource, with the same default fallback as
/// [`read`].
pub fn get_size(ldbid: u32, resource_id: &str, user: u32, seat: u32) -> PersResult<usize> {
    crate::ensure_initialized()?;

    let ctx = key_context(ldbid, resource_id, user, seat)?;
    match ctx.path.storage {
        StorageKind::Custom => {
            let path_key = custom_path_key(ldbid, &ctx.config, &ctx.path.db_key);
            let plugin_result =
                custom::plugin_size(&ctx.config.custom_name, crate::default_async_cb, &path_key);
            match plugin_result {
                Ok(n) if n > 0 => Ok(n),
                other => {
                    let dir = defaults_dir(ldbid, resource_id, user, seat, &ctx.config);
                    match perskit_kv::get_defaults(&dir, resource_id, DefaultJob::Size) {
                        Ok(n) => Ok(n),
                        Err(_) => other,
                    }
                }
            }
        }
        _ => {
            let class = class_for(ctx.config.policy)?;
            let store = perskit_kv::store_for(class, &ctx.path.db_path)?;
            match store.size(&ctx.path.db_key) {
                Ok(n) => Ok(n),
                Err(PersError::NoKey) => {
                    perskit_kv::get_defaults(&ctx.path.db_path, resource_id, DefaultJob::Size)
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Delete the resource. Shared deletes emit a `deleted` notification.
pub fn delete(ldbid: u32, resource_id: &str, user: u32, seat: u32) -> PersResult<()> {
    crate::ensure_initialized()?;
    pas::check_access()?;

    let ctx = key_context(ldbid, resource_id, user, seat)?;
    match ctx.path.storage {
        StorageKind::Custom => {
            let path_key = custom_path_key(ldbid, &ctx.config, &ctx.path.db_key);
            custom::plugin_delete(&ctx.config.custom_name, crate::default_async_cb, &path_key)?;
            if let Err(e) =
                send_notify_signal(resource_id, ldbid, user, seat, NotifyStatus::Deleted)
            {
                warn!("failed to emit delete notification for {resource_id}: {e}");
            }
            Ok(())
        }
        _ => {
            let class = class_for(ctx.config.policy)?;
            let store = perskit_kv::store_for(class, &ctx.path.db_path)?;
            store.delete(&ctx.path.db_key)?;
            if ctx.path.storage == StorageKind::Shared {
                if let Err(e) =
                    send_notify_signal(resource_id, ldbid, user, seat, NotifyStatus::Deleted)
                {
                    warn!("failed to emit delete notification for {resource_id}: {e}");
                }
            }
            Ok(())
        }
    }
}

/// Open a key handle: validate the resource and remember the tuple.
pub fn handle_open(ldbid: u32, resource_id: &str, user: u32, seat: u32) -> PersResult<Handle> {
    crate::ensure_initialized()?;
    let _ctx = key_context(ldbid, resource_id, user, seat)?;
    let handle = handle::allocate()?;
    handle::insert_key_entry(
        handle,
        KeyHandleEntry {
            ldbid,
            user,
            seat,
            resource_id: resource_id.to_string(),
        },
    );
    Ok(handle)
}

/// Close a key handle.
pub fn handle_close(handle: Handle) -> PersResult<()> {
    crate::ensure_initialized()?;
    handle::remove_key_entry(handle).ok_or(PersError::InvalidHandle)?;
    handle::release(handle);
    Ok(())
}

pub fn handle_read(handle: Handle, buffer: &mut [u8]) -> PersResult<usize> {
    let entry = handle::key_entry(handle)?;
    read(entry.ldbid, &entry.resource_id, entry.user, entry.seat, buffer)
}

pub fn handle_write(handle: Handle, data: &[u8]) -> PersResult<usize> {
    let entry = handle::key_entry(handle)?;
    write(entry.ldbid, &entry.resource_id, entry.user, entry.seat, data)
}

pub fn handle_get_size(handle: Handle) -> PersResult<usize> {
    let entry = handle::key_entry(handle)?;
    get_size(entry.ldbid, &entry.resource_id, entry.user, entry.seat)
}

fn reg_notify(
    ldbid: u32,
    resource_id: &str,
    user: u32,
    seat: u32,
    callback: notify::NotifyCallback,
    register: bool,
) -> PersResult<()> {
    crate::ensure_initialized()?;

    let ctx = key_context(ldbid, resource_id, user, seat)?;
    // Local keys and files cannot be observed; shared and custom keys can.
    if ctx.path.storage == StorageKind::Local {
        return Err(PersError::NotifyNotAllowed);
    }

    let key_hash = crc32(0, ctx.path.db_key.as_bytes());
    if register {
        notify::register(key_hash, callback)?;
    } else {
        notify::unregister(key_hash);
    }

    let data = MainLoopData::new(
        CMD_REG_NOTIFY_SIGNAL,
        [ldbid, user, seat, if register { 0 } else { 1 }],
    )
    .with_string(resource_id);
    event_loop::deliver(&data).map_err(|_| PersError::Common)
}

/// Register for change notifications on a shared key resource.
pub fn register_notify_on_change(
    ldbid: u32,
    resource_id: &str,
    user: u32,
    seat: u32,
    callback: notify::NotifyCallback,
) -> PersResult<()> {
    reg_notify(ldbid, resource_id, user, seat, callback, true)
}

/// Remove a change-notification registration.
pub fn unregister_notify_on_change(
    ldbid: u32,
    resource_id: &str,
    user: u32,
    seat: u32,
    callback: notify::NotifyCallback,
) -> PersResult<()> {
    reg_notify(ldbid, resource_id, user, seat, callback, false)
}

pub fn handle_register_notify_on_change(
    handle: Handle,
    callback: notify::NotifyCallback,
) -> PersResult<()> {
    let entry = handle::key_entry(handle)?;
    register_notify_on_change(entry.ldbid, &entry.resource_id, entry.user, entry.seat, callback)
}

pub fn handle_unregister_notify_on_change(
    handle: Handle,
    callback: notify::NotifyCallback,
) -> PersResult<()> {
    let entry = handle::key_entry(handle)?;
    unregister_notify_on_change(entry.ldbid, &entry.resource_id, entry.user, entry.seat, callback)
}
