//! The event loop: one thread owning all external IPC.
//!
//! A single thread per process lifetime multiplexes the bus connection and
//! a command pipe fed by worker threads. All bus side effects (register and
//! unregister calls, notification emission, shutdown-complete replies) and
//! all global state transitions driven by peers happen on this thread.
//!
//! Workers enqueue fixed-size command records through
//! [`deliver`] (blocking until the loop processed the command) or
//! [`deliver_nb`] (fire-and-forget, used on the teardown path where the
//! loop itself may be exiting). Records are processed in pipe order; bus
//! frames interleave only at the poll boundary.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use perskit_core::{org, Notification, NotifyStatus, PersError, PersResult};
use perskit_ipc::{
    bus_address, read_frame, write_frame, BusMessage, MatchRule, ResSignal, NSM_ERROR_STATUS_OK,
    PAS_MSG_BLOCK, PAS_MSG_UNBLOCK, PAS_MSG_WRITE_BACK, PAS_STATUS_OK,
};

use crate::{custom, handle, lifecycle, notify, pas};

pub(crate) const CMD_PAS_BLOCK_AND_WRITE_BACK: u32 = 1;
pub(crate) const CMD_LC_PREPARE_SHUTDOWN: u32 = 2;
pub(crate) const CMD_SEND_NOTIFY_SIGNAL: u32 = 3;
pub(crate) const CMD_REG_NOTIFY_SIGNAL: u32 = 4;
pub(crate) const CMD_SEND_PAS_REGISTER: u32 = 5;
pub(crate) const CMD_SEND_LC_REGISTER: u32 = 6;
pub(crate) const CMD_QUIT: u32 = 7;

/// `params[0]` of `CMD_LC_PREPARE_SHUTDOWN`: sync files, keep state.
pub(crate) const SHUTDOWN_PARTIAL: u32 = 0;
/// `params[0]` of `CMD_LC_PREPARE_SHUTDOWN`: close and free everything.
pub(crate) const SHUTDOWN_FULL: u32 = 1;

pub(crate) const CMD_STRING_SIZE: usize = 128;
const RECORD_SIZE: usize = 4 + 4 + 16 + CMD_STRING_SIZE;

/// Fixed-size command record traveling over the pipe.
#[derive(Clone, Copy)]
pub(crate) struct MainLoopData {
    pub cmd: u32,
    /// Nonzero when the sender blocks on the reply channel.
    ack: u32,
    pub params: [u32; 4],
    pub string: [u8; CMD_STRING_SIZE],
}

impl MainLoopData {
    pub fn new(cmd: u32, params: [u32; 4]) -> Self {
        Self {
            cmd,
            ack: 0,
            params,
            string: [0; CMD_STRING_SIZE],
        }
    }

    /// Attach a key string; truncated at the record's fixed capacity.
    pub fn with_string(mut self, s: &str) -> Self {
        let bytes = s.as_bytes();
        let n = bytes.len().min(CMD_STRING_SIZE - 1);
        self.string[..n].copy_from_slice(&bytes[..n]);
        self.string[n..].fill(0);
        self
    }

    fn string_str(&self) -> &str {
        let end = self
            .string
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CMD_STRING_SIZE);
        std::str::from_utf8(&self.string[..end]).unwrap_or("")
    }

    fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.cmd.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ack.to_le_bytes());
        for (i, p) in self.params.iter().enumerate() {
            buf[8 + i * 4..12 + i * 4].copy_from_slice(&p.to_le_bytes());
        }
        buf[24..].copy_from_slice(&self.string);
        buf
    }

    fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let mut string = [0u8; CMD_STRING_SIZE];
        string.copy_from_slice(&buf[24..]);
        Self {
            cmd: u32_at(0),
            ack: u32_at(4),
            params: [u32_at(8), u32_at(12), u32_at(16), u32_at(20)],
            string,
        }
    }
}

struct LoopShared {
    pipe_w: Mutex<File>,
    ack_rx: Receiver<()>,
}

impl LoopShared {
    fn write_record(&self, record: &MainLoopData) -> PersResult<()> {
        let mut pipe = self.pipe_w.lock().unwrap_or_else(|e| e.into_inner());
        pipe.write_all(&record.to_bytes()).map_err(|e| {
            warn!("failed to write to the mainloop pipe: {e}");
            PersError::Common
        })
    }
}

static LOOP: Lazy<Mutex<Option<Arc<LoopShared>>>> = Lazy::new(|| Mutex::new(None));
static JOIN: Lazy<Mutex<Option<JoinHandle<()>>>> = Lazy::new(|| Mutex::new(None));
/// Serializes blocking senders so acks pair with their own command.
static DELIVER: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn shared() -> PersResult<Arc<LoopShared>> {
    LOOP.lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .cloned()
        .ok_or(PersError::NotInitialized)
}

/// Post a command and block until the loop has processed it.
pub(crate) fn deliver(data: &MainLoopData) -> PersResult<()> {
    let shared = shared()?;
    let _serial = DELIVER.lock().unwrap_or_else(|e| e.into_inner());
    let mut record = *data;
    record.ack = 1;
    shared.write_record(&record)?;
    shared.ack_rx.recv().map_err(|_| PersError::Common)
}

/// Post a command without waiting. Teardown path, and the only variant the
/// loop thread itself may use.
pub(crate) fn deliver_nb(data: &MainLoopData) -> PersResult<()> {
    let shared = shared()?;
    let mut record = *data;
    record.ack = 0;
    shared.write_record(&record)
}

/// Spawn the loop thread and block until it is ready.
pub(crate) fn start() -> PersResult<()> {
    let mut guard = LOOP.lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_some() {
        return Ok(());
    }

    let (pipe_r, pipe_w) = nix::unistd::pipe().map_err(|e| {
        warn!("failed to create the mainloop pipe: {e}");
        PersError::Common
    })?;
    let pipe_r = File::from(pipe_r);
    let pipe_w = File::from(pipe_w);

    let (ack_tx, ack_rx) = bounded(1);
    let (ready_tx, ready_rx) = bounded(1);

    let address = bus_address();
    let bus = match UnixStream::connect(&address) {
        Ok(stream) => Some(stream),
        Err(e) => {
            info!("no bus at {address:?} ({e}); running unregistered");
            None
        }
    };

    let join = std::thread::Builder::new()
        .name("pers-mainloop".into())
        .spawn(move || {
            EventLoop {
                pipe_r,
                bus,
                rules: Vec::new(),
                pending: VecDeque::new(),
                ack_tx,
            }
            .run(ready_tx)
        })
        .map_err(|e| {
            warn!("failed to spawn the mainloop thread: {e}");
            PersError::Common
        })?;

    *guard = Some(Arc::new(LoopShared {
        pipe_w: Mutex::new(pipe_w),
        ack_rx,
    }));
    *JOIN.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);
    drop(guard);

    ready_rx
        .recv_timeout(Duration::from_millis(org::TIMEOUT_MS))
        .map_err(|_| PersError::Common)
}

/// Queue a full prepare-shutdown plus quit and join the loop thread.
pub(crate) fn stop_and_join() {
    let _ = deliver_nb(&MainLoopData::new(
        CMD_LC_PREPARE_SHUTDOWN,
        [SHUTDOWN_FULL, 0, 0, 0],
    ));
    let _ = deliver_nb(&MainLoopData::new(CMD_QUIT, [0; 4]));
    if let Some(join) = JOIN.lock().unwrap_or_else(|e| e.into_inner()).take() {
        let _ = join.join();
    }
    *LOOP.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

/// Close or flush everything that holds storage open.
///
/// Partial shutdown keeps handle state alive so a cancelled shutdown can
/// resume; full shutdown drops it all.
pub(crate) fn prepare_shutdown(full: bool) {
    pas::lock_access();
    handle::flush_open_files(full);
    perskit_rct::close_all_tables();
    perskit_kv::close_all();
    crate::sync_app_folder();
    if full {
        handle::reset_all();
        custom::deinit_all();
    }
}

enum CallFailure {
    Io,
    Timeout,
}

struct EventLoop {
    pipe_r: File,
    bus: Option<UnixStream>,
    rules: Vec<MatchRule>,
    /// Frames that arrived while a method call was awaiting its return.
    pending: VecDeque<BusMessage>,
    ack_tx: Sender<()>,
}

impl EventLoop {
    fn run(mut self, ready_tx: Sender<()>) {
        let _ = ready_tx.send(());
        debug!("mainloop running");

        loop {
            while let Some(frame) = self.pending.pop_front() {
                self.dispatch_frame(frame);
            }

            let (pipe_ready, bus_ready) = match self.poll_inputs() {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("mainloop poll failed: {e}");
                    break;
                }
            };

            if bus_ready {
                self.read_bus_frame();
            }

            if pipe_ready {
                let Some(record) = self.read_command() else {
                    // All pipe writers are gone.
                    break;
                };
                let quit = self.process_command(&record);
                if record.ack != 0 {
                    let _ = self.ack_tx.send(());
                }
                if quit {
                    break;
                }
            }
        }
        debug!("mainloop exited");
    }

    fn poll_inputs(&self) -> nix::Result<(bool, bool)> {
        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(self.pipe_r.as_fd(), PollFlags::POLLIN));
        if let Some(bus) = &self.bus {
            fds.push(PollFd::new(bus.as_fd(), PollFlags::POLLIN));
        }
        poll(&mut fds, PollTimeout::NONE)?;
        let ready = |fd: Option<&PollFd>| {
            fd.and_then(|f| f.revents())
                .map(|r| !r.is_empty())
                .unwrap_or(false)
        };
        Ok((ready(fds.first()), ready(fds.get(1))))
    }

    fn read_command(&mut self) -> Option<MainLoopData> {
        let mut buf = [0u8; RECORD_SIZE];
        match self.pipe_r.read_exact(&mut buf) {
            Ok(()) => Some(MainLoopData::from_bytes(&buf)),
            Err(e) => {
                debug!("command pipe closed: {e}");
                None
            }
        }
    }

    fn read_bus_frame(&mut self) {
        let Some(bus) = &self.bus else { return };
        match read_frame(&mut &*bus) {
            Ok(frame) => self.dispatch_frame(frame),
            Err(e) => {
                info!("bus connection lost: {e}");
                self.bus = None;
            }
        }
    }

    fn send_bus(&mut self, message: BusMessage) {
        if let Some(bus) = &self.bus {
            if let Err(e) = write_frame(&mut &*bus, &message) {
                warn!("failed to send on the bus: {e}");
                self.bus = None;
            }
        }
    }

    /// Issue a method call and wait for its return, bounded by the method
    /// timeout. Frames other than the return are queued for dispatch at
    /// the next loop iteration.
    fn call_method(&mut self, message: BusMessage) -> PersResult<i32> {
        let bus = match &self.bus {
            Some(bus) => bus.try_clone().map_err(|_| PersError::Common)?,
            None => {
                debug!("not connected to a bus; method call skipped");
                return Err(PersError::Common);
            }
        };
        match self.call_method_on(&bus, message) {
            Ok(status) => Ok(status),
            Err(CallFailure::Timeout) => {
                warn!("method call timed out after {} ms", org::TIMEOUT_MS);
                Err(PersError::Common)
            }
            Err(CallFailure::Io) => {
                info!("bus connection lost during method call");
                self.bus = None;
                Err(PersError::Common)
            }
        }
    }

    fn call_method_on(
        &mut self,
        bus: &UnixStream,
        message: BusMessage,
    ) -> Result<i32, CallFailure> {
        write_frame(&mut &*bus, &message).map_err(|_| CallFailure::Io)?;

        let timer =
            TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::empty()).map_err(|_| CallFailure::Io)?;
        timer
            .set(
                Expiration::OneShot(TimeSpec::from_duration(Duration::from_millis(
                    org::TIMEOUT_MS,
                ))),
                TimerSetTimeFlags::empty(),
            )
            .map_err(|_| CallFailure::Io)?;

        loop {
            let mut fds = [
                PollFd::new(bus.as_fd(), PollFlags::POLLIN),
                PollFd::new(timer.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(_) => return Err(CallFailure::Io),
            }
            let bus_ready = fds[0].revents().map(|r| !r.is_empty()).unwrap_or(false);
            let timer_ready = fds[1].revents().map(|r| !r.is_empty()).unwrap_or(false);

            if bus_ready {
                match read_frame(&mut &*bus) {
                    Ok(BusMessage::MethodReturn { status }) => return Ok(status),
                    Ok(other) => self.pending.push_back(other),
                    Err(_) => return Err(CallFailure::Io),
                }
            }
            if timer_ready {
                let _ = timer.wait();
                return Err(CallFailure::Timeout);
            }
        }
    }

    fn process_command(&mut self, record: &MainLoopData) -> bool {
        match record.cmd {
            CMD_PAS_BLOCK_AND_WRITE_BACK => {
                pas::lock_access();
                self.send_bus(BusMessage::PersistenceAdminRequestCompleted {
                    request_id: record.params[1],
                    status: PAS_STATUS_OK,
                });
            }
            CMD_LC_PREPARE_SHUTDOWN => {
                prepare_shutdown(record.params[0] == SHUTDOWN_FULL);
                let request_id = record.params[1];
                if request_id != 0 {
                    self.send_bus(BusMessage::LifecycleRequestComplete {
                        request_id,
                        status: NSM_ERROR_STATUS_OK,
                    });
                }
            }
            CMD_SEND_NOTIFY_SIGNAL => {
                let member = match record.params[3] {
                    1 => Some(ResSignal::Create),
                    2 => Some(ResSignal::Change),
                    3 => Some(ResSignal::Delete),
                    _ => None,
                };
                match member {
                    Some(member) => self.send_bus(BusMessage::ResourceSignal {
                        member,
                        key: record.string_str().to_string(),
                        ldbid: record.params[0],
                        user: record.params[1],
                        seat: record.params[2],
                    }),
                    None => warn!("invalid notification reason {}", record.params[3]),
                }
            }
            CMD_REG_NOTIFY_SIGNAL => {
                let rule = MatchRule {
                    key: record.string_str().to_string(),
                    ldbid: record.params[0],
                    user: record.params[1],
                    seat: record.params[2],
                };
                if record.params[3] == 0 {
                    if !self.rules.contains(&rule) {
                        self.rules.push(rule.clone());
                    }
                    self.send_bus(BusMessage::AddMatch { rule });
                } else {
                    self.rules.retain(|r| r != &rule);
                    self.send_bus(BusMessage::RemoveMatch { rule });
                }
            }
            CMD_SEND_PAS_REGISTER => {
                let flags = PAS_MSG_BLOCK | PAS_MSG_UNBLOCK | PAS_MSG_WRITE_BACK;
                let message = if record.params[0] != 0 {
                    BusMessage::RegisterPersAdminNotification {
                        notify_flag: flags,
                        timeout_ms: org::TIMEOUT_MS as u32,
                    }
                } else {
                    BusMessage::UnRegisterPersAdminNotification { notify_flag: flags }
                };
                if let Err(e) = self.call_method(message) {
                    debug!("admin registration call failed: {e}");
                }
            }
            CMD_SEND_LC_REGISTER => {
                let message = if record.params[0] != 0 {
                    BusMessage::RegisterShutdownClient {
                        mode: record.params[1],
                        timeout_ms: org::TIMEOUT_MS as u32,
                    }
                } else {
                    BusMessage::UnRegisterShutdownClient {
                        mode: record.params[1],
                    }
                };
                if let Err(e) = self.call_method(message) {
                    debug!("lifecycle registration call failed: {e}");
                }
            }
            CMD_QUIT => return true,
            other => warn!("unhandled mainloop command {other}"),
        }
        false
    }

    fn dispatch_frame(&mut self, frame: BusMessage) {
        match frame {
            BusMessage::LifecycleRequest {
                request,
                request_id,
            } => {
                let status = lifecycle::check_lc_request(request, request_id);
                self.send_bus(BusMessage::MethodReturn { status });
            }
            BusMessage::PersistenceAdminRequest {
                request,
                request_id,
            } => {
                let status = pas::check_pas_request(request, request_id);
                self.send_bus(BusMessage::MethodReturn { status });
            }
            BusMessage::PersistenceModeChanged { mode } => {
                debug!("persistence mode changed to {mode}");
            }
            BusMessage::ResourceSignal {
                member,
                key,
                ldbid,
                user,
                seat,
            } => {
                let matched = self
                    .rules
                    .iter()
                    .any(|rule| rule.matches(&key, ldbid, user, seat));
                if matched {
                    let status = match member {
                        ResSignal::Create => NotifyStatus::Created,
                        ResSignal::Change => NotifyStatus::Changed,
                        ResSignal::Delete => NotifyStatus::Deleted,
                    };
                    notify::dispatch(&Notification {
                        resource_id: key,
                        ldbid,
                        user,
                        seat,
                        status,
                    });
                }
            }
            BusMessage::MethodReturn { status } => {
                debug!("stray method return with status {status}");
            }
            other => {
                debug!("ignoring unexpected bus frame: {other:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_encoding_round_trip() {
        let record = MainLoopData::new(CMD_SEND_NOTIFY_SIGNAL, [0xFF, 1, 2, 3])
            .with_string("status/open_document");
        let decoded = MainLoopData::from_bytes(&record.to_bytes());
        assert_eq!(decoded.cmd, CMD_SEND_NOTIFY_SIGNAL);
        assert_eq!(decoded.params, [0xFF, 1, 2, 3]);
        assert_eq!(decoded.string_str(), "status/open_document");
    }

    #[test]
    fn record_string_is_truncated_at_capacity() {
        let long = "k".repeat(CMD_STRING_SIZE * 2);
        let record = MainLoopData::new(CMD_REG_NOTIFY_SIGNAL, [0; 4]).with_string(&long);
        assert_eq!(record.string_str().len(), CMD_STRING_SIZE - 1);
    }

    #[test]
    fn deliver_without_loop_is_not_initialized() {
        let _guard = perskit_core::testing::env_lock();
        if LOOP.lock().unwrap_or_else(|e| e.into_inner()).is_none() {
            let record = MainLoopData::new(CMD_QUIT, [0; 4]);
            assert_eq!(deliver(&record), Err(PersError::NotInitialized));
            assert_eq!(deliver_nb(&record), Err(PersError::NotInitialized));
        }
    }
}
