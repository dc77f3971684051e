#![allow(dead_code)]

//! Shared scaffolding for the integration suites: an isolated data tree
//! with the bus pointed at a dead socket, plus provisioning helpers.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use perskit_core::testing::TestEnvironment;
use perskit_core::{
    Permission, ResourceConfig, ResourceType, ShutdownMode, StorageKind, StoragePolicy,
};
use perskit_rct::{RctKind, RctWriter};

/// An isolated environment with no bus peer. Holds the global environment
/// lock for the duration of the test.
pub struct Harness {
    pub env: TestEnvironment,
}

impl Harness {
    pub fn new() -> Self {
        let env = TestEnvironment::new().expect("test environment");
        // Point the bus at a socket that does not exist; the library runs
        // unregistered.
        std::env::set_var(
            "PERS_CLIENT_DBUS_ADDRESS",
            env.root.join("no-bus.sock").display().to_string(),
        );
        Self { env }
    }

    pub fn init(&self, app: &str, mode: ShutdownMode) {
        perskit::init_library(app, mode).expect("init_library");
    }

    /// Local RCT of `app`, for seeding resource entries before init.
    pub fn write_local_rct(&self, app: &str, entries: &[(&str, ResourceConfig)]) {
        let writer = RctWriter::open_for(app, RctKind::Local, 0).expect("rct writer");
        for (resource_id, cfg) in entries {
            writer.insert(resource_id, cfg).expect("rct insert");
        }
    }

    /// Shared-group RCT for `group`.
    pub fn write_group_rct(&self, app: &str, group: u32, entries: &[(&str, ResourceConfig)]) {
        let writer = RctWriter::open_for(app, RctKind::SharedGroup, group).expect("rct writer");
        for (resource_id, cfg) in entries {
            writer.insert(resource_id, cfg).expect("rct insert");
        }
    }

    pub fn backup_tree(&self, app: &str) -> PathBuf {
        self.env.root.join("mnt-backup").join(app)
    }
}

/// A write-cached local key entry owned by `responsible`.
pub fn cached_key(responsible: &str) -> ResourceConfig {
    ResourceConfig {
        policy: StoragePolicy::WriteCached,
        storage: StorageKind::Local,
        res_type: ResourceType::Key,
        permission: Permission::ReadWrite,
        max_size: 16 * 1024,
        responsible: responsible.into(),
        custom_name: String::new(),
        custom_id: String::new(),
    }
}

/// A write-cached shared key entry.
pub fn shared_key(responsible: &str) -> ResourceConfig {
    ResourceConfig {
        storage: StorageKind::Shared,
        ..cached_key(responsible)
    }
}

/// A read-only variant of [`cached_key`].
pub fn read_only_key(responsible: &str) -> ResourceConfig {
    ResourceConfig {
        permission: Permission::ReadOnly,
        ..cached_key(responsible)
    }
}

/// Poll `pred` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

/// Count all regular files below a directory.
pub fn files_below(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found
}
