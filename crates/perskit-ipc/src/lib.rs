//! # perskit-ipc
//!
//! Wire protocol spoken between the persistence client library and its two
//! bus peers: the persistence administration service
//! (`persistence.admin`) and the node state manager
//! (`NodeStateManager.Consumer`).
//!
//! Frames are a fixed 8-byte header followed by a bincode-encoded
//! [`BusMessage`]:
//!
//! ```text
//! ┌──────────┬───────────┬───────────┬─────────────┐
//! │Magic (2B)│Version(1B)│Flags (1B) │ Length (4B) │
//! │  "PB"    │     1     │ reserved  │   LE u32    │
//! └──────────┴───────────┴───────────┴─────────────┘
//! ```

use std::io::{Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic number of a bus frame: "PB" (persistence bus).
pub const BUS_MAGIC: [u8; 2] = *b"PB";

/// Protocol version; bump on breaking changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on an encoded message. Messages carry at most a key name and
/// a handful of integers.
pub const MAX_FRAME_LEN: usize = 4096;

/// Default bus socket consulted when `PERS_CLIENT_DBUS_ADDRESS` is unset.
pub const DEFAULT_BUS_PATH: &str = "/run/persistence/bus.sock";

/// Interface consumed on the admin side.
pub const ADMIN_INTERFACE: &str = "persistence.admin";
/// Interface consumed on the lifecycle side.
pub const CONSUMER_INTERFACE: &str = "NodeStateManager.Consumer";

/// Admin request bits.
pub const PAS_MSG_BLOCK: u32 = 0x0001;
pub const PAS_MSG_UNBLOCK: u32 = 0x0002;
pub const PAS_MSG_WRITE_BACK: u32 = 0x0010;

/// Admin reply status values.
pub const PAS_STATUS_RESP_PEND: i32 = 0x0001;
pub const PAS_STATUS_OK: i32 = 0x0002;
pub const PAS_STATUS_FAIL: i32 = 0x8000;

/// Lifecycle request and status values.
pub const NSM_SHUTDOWN_NORMAL: u32 = 1;
pub const NSM_ERROR_STATUS_OK: i32 = 1;
pub const NSM_ERROR_STATUS_FAIL: i32 = -1;

/// Bus address: `PERS_CLIENT_DBUS_ADDRESS` override or the default socket.
pub fn bus_address() -> PathBuf {
    match std::env::var("PERS_CLIENT_DBUS_ADDRESS") {
        Ok(addr) if !addr.is_empty() => PathBuf::from(addr),
        _ => PathBuf::from(DEFAULT_BUS_PATH),
    }
}

/// Wire-level failures. These never reach data-path callers; the event loop
/// logs and demotes them.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame magic")]
    BadMagic,

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("encode/decode error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Signal members announcing resource changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResSignal {
    /// `PersistenceResCreate`
    Create,
    /// `PersistenceResChange`
    Change,
    /// `PersistenceResDelete`
    Delete,
}

impl ResSignal {
    pub fn member(self) -> &'static str {
        match self {
            ResSignal::Create => "PersistenceResCreate",
            ResSignal::Change => "PersistenceResChange",
            ResSignal::Delete => "PersistenceResDelete",
        }
    }
}

/// A client-side match rule for resource signals.
///
/// The bus only forwards (and the loop only dispatches) signals whose
/// key/tuple match a registered rule, so the application callback sees
/// exactly the keys it registered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    pub key: String,
    pub ldbid: u32,
    pub user: u32,
    pub seat: u32,
}

impl MatchRule {
    /// Does a signal with these arguments fall under the rule?
    pub fn matches(&self, key: &str, ldbid: u32, user: u32, seat: u32) -> bool {
        self.key == key && self.ldbid == ldbid && self.user == user && self.seat == seat
    }
}

/// Everything that travels over the bus connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusMessage {
    // -- method calls issued by the library --
    /// `persistence.admin.RegisterPersAdminNotification`
    RegisterPersAdminNotification { notify_flag: u32, timeout_ms: u32 },
    /// `persistence.admin.UnRegisterPersAdminNotification`
    UnRegisterPersAdminNotification { notify_flag: u32 },
    /// `persistence.admin.PersistenceAdminRequestCompleted`
    PersistenceAdminRequestCompleted { request_id: u32, status: i32 },
    /// `NodeStateManager.Consumer.RegisterShutdownClient`
    RegisterShutdownClient { mode: u32, timeout_ms: u32 },
    /// `NodeStateManager.Consumer.UnRegisterShutdownClient`
    UnRegisterShutdownClient { mode: u32 },
    /// `NodeStateManager.Consumer.LifecycleRequestComplete`
    LifecycleRequestComplete { request_id: u32, status: i32 },

    /// Reply to any method call.
    MethodReturn { status: i32 },

    // -- method calls received from peers --
    /// `LifecycleRequest` from the node state manager.
    LifecycleRequest { request: u32, request_id: u32 },
    /// `PersistenceAdminRequest` from the admin service.
    PersistenceAdminRequest { request: u32, request_id: u32 },

    // -- signals --
    /// `PersistenceModeChanged` broadcast by the admin service.
    PersistenceModeChanged { mode: u32 },
    /// Resource change/create/delete signal, in either direction.
    ResourceSignal {
        member: ResSignal,
        key: String,
        ldbid: u32,
        user: u32,
        seat: u32,
    },

    // -- match-rule management --
    AddMatch { rule: MatchRule },
    RemoveMatch { rule: MatchRule },
}

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, message: &BusMessage) -> Result<(), WireError> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    let mut header = [0u8; 8];
    header[..2].copy_from_slice(&BUS_MAGIC);
    header[2] = PROTOCOL_VERSION;
    header[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<BusMessage, WireError> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;
    if header[..2] != BUS_MAGIC {
        return Err(WireError::BadMagic);
    }
    if header[2] != PROTOCOL_VERSION {
        return Err(WireError::BadVersion(header[2]));
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn frame_round_trip_over_socket() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let msg = BusMessage::ResourceSignal {
            member: ResSignal::Change,
            key: "status/open_document".into(),
            ldbid: 0x20,
            user: 1,
            seat: 1,
        };
        write_frame(&mut a, &msg).unwrap();
        assert_eq!(read_frame(&mut b).unwrap(), msg);
    }

    #[test]
    fn several_frames_in_sequence() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let first = BusMessage::RegisterShutdownClient {
            mode: 1,
            timeout_ms: 5000,
        };
        let second = BusMessage::MethodReturn { status: 1 };
        write_frame(&mut a, &first).unwrap();
        write_frame(&mut a, &second).unwrap();
        assert_eq!(read_frame(&mut b).unwrap(), first);
        assert_eq!(read_frame(&mut b).unwrap(), second);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf: &[u8] = &[b'X', b'X', 1, 0, 0, 0, 0, 0];
        assert!(matches!(read_frame(&mut buf), Err(WireError::BadMagic)));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut buf: &[u8] = &[b'P', b'B', 99, 0, 0, 0, 0, 0];
        assert!(matches!(read_frame(&mut buf), Err(WireError::BadVersion(99))));
    }

    #[test]
    fn match_rule_filters_on_all_fields() {
        let rule = MatchRule {
            key: "k".into(),
            ldbid: 0x20,
            user: 1,
            seat: 2,
        };
        assert!(rule.matches("k", 0x20, 1, 2));
        assert!(!rule.matches("k", 0x20, 1, 3));
        assert!(!rule.matches("other", 0x20, 1, 2));
    }
}
