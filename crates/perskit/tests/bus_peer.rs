//! End-to-end tests against a scripted bus peer playing the admin service
//! and the node state manager.

mod common;

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{shared_key, wait_until, Harness};
use perskit::{Notification, PersError, ShutdownMode};
use perskit_ipc::{
    read_frame, write_frame, BusMessage, ResSignal, NSM_SHUTDOWN_NORMAL, PAS_MSG_BLOCK,
    PAS_MSG_UNBLOCK, PAS_MSG_WRITE_BACK, PAS_STATUS_RESP_PEND,
};

const APP: &str = "bus-app";
const GROUP: u32 = 0x20;

/// A bus peer: accepts the library's connection, records every frame, and
/// replies to the register/unregister method calls.
struct FakeBus {
    frames: Arc<Mutex<Vec<BusMessage>>>,
    accepted: Receiver<UnixStream>,
    stream: Option<UnixStream>,
}

impl FakeBus {
    fn start(socket_path: &Path) -> Self {
        let listener = UnixListener::bind(socket_path).expect("bind bus socket");
        let frames = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&frames);
        let (tx, accepted) = channel();

        std::thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let _ = tx.send(stream.try_clone().expect("clone bus stream"));
            loop {
                match read_frame(&mut &stream) {
                    Ok(frame) => {
                        let reply = matches!(
                            frame,
                            BusMessage::RegisterPersAdminNotification { .. }
                                | BusMessage::UnRegisterPersAdminNotification { .. }
                                | BusMessage::RegisterShutdownClient { .. }
                                | BusMessage::UnRegisterShutdownClient { .. }
                        );
                        recorded.lock().unwrap().push(frame);
                        if reply {
                            let _ = write_frame(&mut &stream, &BusMessage::MethodReturn {
                                status: 1,
                            });
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            frames,
            accepted,
            stream: None,
        }
    }

    fn send(&mut self, frame: &BusMessage) {
        if self.stream.is_none() {
            self.stream = Some(
                self.accepted
                    .recv_timeout(Duration::from_secs(5))
                    .expect("library did not connect"),
            );
        }
        let stream = self.stream.as_ref().unwrap();
        write_frame(&mut &*stream, frame).expect("send frame to library");
    }

    fn count(&self, pred: impl Fn(&BusMessage) -> bool) -> usize {
        self.frames.lock().unwrap().iter().filter(|f| pred(f)).count()
    }

    fn wait_for(&self, timeout: Duration, pred: impl Fn(&BusMessage) -> bool) -> bool {
        wait_until(timeout, || self.count(&pred) > 0)
    }
}

fn bus_harness() -> (Harness, FakeBus) {
    let h = Harness::new();
    let socket = h.env.root.join("bus.sock");
    std::env::set_var("PERS_CLIENT_DBUS_ADDRESS", socket.display().to_string());
    let bus = FakeBus::start(&socket);
    (h, bus)
}

#[test]
fn registration_calls_reach_the_peer() {
    let (h, bus) = bus_harness();
    h.init(APP, ShutdownMode::Normal);

    assert!(bus.wait_for(Duration::from_secs(2), |f| matches!(
        f,
        BusMessage::RegisterPersAdminNotification { .. }
    )));
    assert!(bus.wait_for(Duration::from_secs(2), |f| matches!(
        f,
        BusMessage::RegisterShutdownClient { mode: 1, .. }
    )));

    perskit::deinit_library().unwrap();

    assert!(bus.wait_for(Duration::from_secs(2), |f| matches!(
        f,
        BusMessage::UnRegisterShutdownClient { .. }
    )));
    assert!(bus.wait_for(Duration::from_secs(2), |f| matches!(
        f,
        BusMessage::UnRegisterPersAdminNotification { .. }
    )));
}

#[test]
fn shared_writes_emit_exactly_one_signal_each() {
    let (h, bus) = bus_harness();
    h.write_group_rct(APP, GROUP, &[("status/doc", shared_key(APP))]);
    h.init(APP, ShutdownMode::Normal);

    let is_change = |f: &BusMessage| {
        matches!(
            f,
            BusMessage::ResourceSignal {
                member: ResSignal::Change,
                key,
                ldbid: GROUP,
                user: 1,
                seat: 1,
            } if key == "status/doc"
        )
    };

    perskit::key::write(GROUP, "status/doc", 1, 1, b"v1").unwrap();
    assert!(bus.wait_for(Duration::from_secs(2), is_change));
    assert_eq!(bus.count(is_change), 1);

    perskit::key::write(GROUP, "status/doc", 1, 1, b"v2").unwrap();
    assert!(wait_until(Duration::from_secs(2), || bus.count(is_change) == 2));

    perskit::key::delete(GROUP, "status/doc", 1, 1).unwrap();
    let is_delete = |f: &BusMessage| {
        matches!(
            f,
            BusMessage::ResourceSignal {
                member: ResSignal::Delete,
                key,
                ..
            } if key == "status/doc"
        )
    };
    assert!(bus.wait_for(Duration::from_secs(2), is_delete));
    assert_eq!(bus.count(is_delete), 1);
    assert_eq!(bus.count(is_change), 2);

    perskit::deinit_library().unwrap();
}

static RECEIVED: Mutex<Vec<Notification>> = Mutex::new(Vec::new());

fn record_notification(n: &Notification) {
    RECEIVED.lock().unwrap().push(n.clone());
}

#[test]
fn incoming_signal_dispatches_registered_callback() {
    let (h, mut bus) = bus_harness();
    h.write_group_rct(APP, GROUP, &[("status/doc", shared_key(APP))]);
    h.init(APP, ShutdownMode::Normal);
    RECEIVED.lock().unwrap().clear();

    perskit::key::register_notify_on_change(GROUP, "status/doc", 1, 1, record_notification)
        .unwrap();
    assert!(bus.wait_for(Duration::from_secs(2), |f| matches!(
        f,
        BusMessage::AddMatch { .. }
    )));

    bus.send(&BusMessage::ResourceSignal {
        member: ResSignal::Change,
        key: "status/doc".into(),
        ldbid: GROUP,
        user: 1,
        seat: 1,
    });
    assert!(wait_until(Duration::from_secs(2), || {
        !RECEIVED.lock().unwrap().is_empty()
    }));
    {
        let received = RECEIVED.lock().unwrap();
        assert_eq!(received[0].resource_id, "status/doc");
        assert_eq!(received[0].ldbid, GROUP);
        assert_eq!(received[0].status, perskit::NotifyStatus::Changed);
    }

    // A signal for a tuple nobody registered is filtered out.
    bus.send(&BusMessage::ResourceSignal {
        member: ResSignal::Change,
        key: "status/doc".into(),
        ldbid: GROUP,
        user: 2,
        seat: 1,
    });

    perskit::key::unregister_notify_on_change(GROUP, "status/doc", 1, 1, record_notification)
        .unwrap();
    assert!(bus.wait_for(Duration::from_secs(2), |f| matches!(
        f,
        BusMessage::RemoveMatch { .. }
    )));

    bus.send(&BusMessage::ResourceSignal {
        member: ResSignal::Change,
        key: "status/doc".into(),
        ldbid: GROUP,
        user: 1,
        seat: 1,
    });
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(RECEIVED.lock().unwrap().len(), 1);

    perskit::deinit_library().unwrap();
}

#[test]
fn admin_block_request_locks_until_unblock() {
    let (h, mut bus) = bus_harness();
    h.init(APP, ShutdownMode::Normal);

    perskit::key::write(0xFF, "cfg/a", 1, 0, b"before").unwrap();

    bus.send(&BusMessage::PersistenceAdminRequest {
        request: PAS_MSG_BLOCK | PAS_MSG_WRITE_BACK,
        request_id: 42,
    });

    assert!(bus.wait_for(Duration::from_secs(2), |f| matches!(
        f,
        BusMessage::MethodReturn {
            status: PAS_STATUS_RESP_PEND
        }
    )));
    assert!(bus.wait_for(Duration::from_secs(2), |f| matches!(
        f,
        BusMessage::PersistenceAdminRequestCompleted { request_id: 42, .. }
    )));

    assert!(wait_until(Duration::from_secs(2), || {
        perskit::key::write(0xFF, "cfg/a", 1, 0, b"blocked") == Err(PersError::LockFs)
    }));

    bus.send(&BusMessage::PersistenceAdminRequest {
        request: PAS_MSG_UNBLOCK,
        request_id: 43,
    });
    assert!(wait_until(Duration::from_secs(2), || {
        perskit::key::write(0xFF, "cfg/a", 1, 0, b"after").is_ok()
    }));

    perskit::deinit_library().unwrap();
}

#[test]
fn lifecycle_request_prepares_shutdown_and_replies() {
    let (h, mut bus) = bus_harness();
    h.init(APP, ShutdownMode::Normal);

    perskit::key::write(0xFF, "cfg/l", 0, 0, b"data").unwrap();

    bus.send(&BusMessage::LifecycleRequest {
        request: NSM_SHUTDOWN_NORMAL,
        request_id: 7,
    });

    assert!(bus.wait_for(Duration::from_secs(2), |f| matches!(
        f,
        BusMessage::LifecycleRequestComplete { request_id: 7, .. }
    )));

    // Data access stays blocked after the shutdown preparation.
    assert!(wait_until(Duration::from_secs(2), || {
        perskit::key::write(0xFF, "cfg/l", 0, 0, b"late") == Err(PersError::LockFs)
    }));

    perskit::deinit_library().unwrap();
}
