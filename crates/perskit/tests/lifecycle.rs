//! Init/deinit pairing, application-driven shutdown and the access lock.

mod common;

use std::time::Duration;

use common::{wait_until, Harness};
use perskit::{PersError, ShutdownMode, PCL_SHUTDOWN, PCL_SHUTDOWN_CANCEL};

const APP: &str = "lifecycle-app";

#[test]
fn init_deinit_are_reference_counted() {
    let h = Harness::new();
    h.init(APP, ShutdownMode::None);
    h.init(APP, ShutdownMode::None);
    h.init(APP, ShutdownMode::None);

    perskit::deinit_library().unwrap();
    perskit::deinit_library().unwrap();

    // Still initialized: data operations keep working.
    perskit::key::write(0xFF, "cfg/rc", 0, 0, b"alive").unwrap();

    perskit::deinit_library().unwrap();
    assert_eq!(perskit::deinit_library(), Err(PersError::NotInitialized));

    // A fresh lifecycle after full teardown.
    h.init(APP, ShutdownMode::None);
    let mut buf = [0u8; 16];
    let n = perskit::key::read(0xFF, "cfg/rc", 0, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"alive");
    perskit::deinit_library().unwrap();
}

#[test]
fn invalid_app_names_are_rejected() {
    let _h = Harness::new();
    assert_eq!(
        perskit::init_library("", ShutdownMode::None),
        Err(PersError::Common)
    );
    let long = "x".repeat(300);
    assert_eq!(
        perskit::init_library(&long, ShutdownMode::None),
        Err(PersError::Common)
    );
}

#[test]
fn shutdown_locks_and_cancel_unlocks() {
    let h = Harness::new();
    h.init(APP, ShutdownMode::None);

    perskit::key::write(0xFF, "cfg/s", 1, 0, b"before").unwrap();

    perskit::lifecycle_set(PCL_SHUTDOWN).unwrap();

    // The prepare command travels through the loop; wait for the lock.
    assert!(wait_until(Duration::from_secs(2), || {
        perskit::key::write(0xFF, "cfg/s", 1, 0, b"blocked") == Err(PersError::LockFs)
    }));
    assert!(perskit::is_access_locked());

    perskit::lifecycle_set(PCL_SHUTDOWN_CANCEL).unwrap();
    assert!(!perskit::is_access_locked());
    perskit::key::write(0xFF, "cfg/s", 1, 0, b"after").unwrap();

    let mut buf = [0u8; 16];
    let n = perskit::key::read(0xFF, "cfg/s", 1, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"after");

    perskit::deinit_library().unwrap();
}

#[test]
fn cancel_budget_is_exhausted_after_three() {
    let h = Harness::new();
    h.init(APP, ShutdownMode::None);

    for _ in 0..3 {
        assert_eq!(perskit::lifecycle_set(PCL_SHUTDOWN_CANCEL), Ok(()));
    }
    assert_eq!(
        perskit::lifecycle_set(PCL_SHUTDOWN_CANCEL),
        Err(PersError::ShutdownMaxCancel)
    );
    assert_eq!(
        perskit::lifecycle_set(PCL_SHUTDOWN_CANCEL),
        Err(PersError::ShutdownMaxCancel)
    );

    perskit::deinit_library().unwrap();

    // The budget is per lifecycle: a new init restores it.
    h.init(APP, ShutdownMode::None);
    assert_eq!(perskit::lifecycle_set(PCL_SHUTDOWN_CANCEL), Ok(()));
    perskit::deinit_library().unwrap();
}

#[test]
fn app_check_gates_operations_on_the_rct() {
    let h = Harness::new();
    std::env::set_var("PERS_APPCHECK", "1");
    h.init(APP, ShutdownMode::None);

    // No resource table on disk: the application is not trusted.
    assert_eq!(
        perskit::key::write(0xFF, "cfg/t", 0, 0, b"x"),
        Err(PersError::ShutdownNoTrusted)
    );

    // Provisioning the table makes the application trusted without a
    // re-init.
    h.write_local_rct(APP, &[("cfg/t", common::cached_key(APP))]);
    perskit::key::write(0xFF, "cfg/t", 0, 0, b"x").unwrap();

    perskit::deinit_library().unwrap();
    std::env::remove_var("PERS_APPCHECK");
}

#[test]
fn registered_mode_refuses_lifecycle_set() {
    let h = Harness::new();
    h.init(APP, ShutdownMode::Normal);

    assert_eq!(
        perskit::lifecycle_set(PCL_SHUTDOWN),
        Err(PersError::ShutdownNoPermit)
    );

    perskit::deinit_library().unwrap();
}
