//! Readiness backends
//!
//! A backend owns one native event context. The manager picks one from
//! `ManagerSetting::mode` at construction and drives it from the reactor
//! thread:
//!
//! ```text
//!   reactor thread
//!   ──────────────
//!   prepare(listen fd → token id 0, control fd → token id u32::MAX)
//!   loop {
//!       work(sink, poll_timeout)        one bounded wait
//!         └─ handle_input(sink, ready)  shared event policy
//!   }
//!   off()
//! ```
//!
//! | Mode     | Module     | Availability          |
//! |----------|------------|-----------------------|
//! | Epoll    | `epoll`    | Linux / Android       |
//! | Select   | `select`   | every unix target     |
//! | Kqueue   | `kqueue`   | BSD family and Apple  |
//! | IoUring  | `uring`    | Linux                 |
//! | Iocp     | -          | never (unix-only crate) |
//!
//! Unavailable modes still construct; `prepare()` fails with
//! `NetError::Unsupported` so `Manager::start()` returns `false`.

use std::os::fd::RawFd;
use std::time::Duration;

use netcore_core::constants::ACCEPT_BUDGET;
use netcore_core::{ktrace, kwarn, ConnId, Mode, NetError, NetResult, Token};

use crate::control;

pub mod select;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub mod epoll;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod uring;
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))] {
        pub mod kqueue;
    }
}

/// What `prepare()` registers up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Table ceiling; sizes the native event buffer
    pub max_count: u32,
    pub listen_fd: Option<RawFd>,
    pub control_fd: RawFd,
}

/// One ready descriptor reported by a backend wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    /// Socket error condition
    pub error: bool,
    /// Peer hung up (read side still drained by `work()`)
    pub hangup: bool,
}

impl Readiness {
    pub fn readable(token: Token) -> Self {
        Self { token, error: false, hangup: false }
    }
}

/// Counters for one `work()` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub events: usize,
    pub accepted: usize,
    pub enqueued: usize,
    pub removed: usize,
    pub stale: usize,
    pub stop_requested: bool,
}

/// Manager side of the event policy, as seen by `handle_input`.
pub trait EventSink {
    /// Accept one pending peer. `false` when nothing more can be accepted.
    fn accept(&self) -> bool;

    /// Schedule a work pass for `id`.
    fn enqueue(&self, id: ConnId);

    /// Remove `id` after a socket error.
    fn remove(&self, id: ConnId);

    /// `id` is live and still holds `fd`.
    fn owns_fd(&self, id: ConnId, fd: RawFd) -> bool;

    /// Read pending control bytes into `out`.
    fn drain_control(&self, out: &mut Vec<u8>) -> usize;

    /// A kill command arrived.
    fn request_stop(&self);
}

pub trait Backend: Send + Sync {
    fn mode(&self) -> Mode;

    /// Create the native context and register the listen socket (if any)
    /// and the control pipe.
    fn prepare(&self, opts: &PrepareOptions) -> NetResult<()>;

    /// Wait at most `timeout` for readiness and apply the event policy.
    /// EINTR is a pass with no events.
    fn work(&self, sink: &dyn EventSink, timeout: Duration) -> NetResult<PassStats>;

    /// Release the native context. Idempotent.
    fn off(&self);

    fn sock_add(&self, fd: RawFd, id: ConnId) -> NetResult<()>;

    fn sock_remove(&self, fd: RawFd, id: ConnId) -> NetResult<()>;

    /// Start (`on`) or stop watching `fd` for writability. A writable event
    /// is reported like a readable one, so `handle_input` schedules a pass
    /// that retries the stalled flush. Unknown descriptors are not an error.
    fn sock_want_write(&self, fd: RawFd, id: ConnId, on: bool) -> NetResult<()>;
}

/// Backend for a mode the build target cannot provide.
#[derive(Debug)]
pub struct Unavailable {
    mode: Mode,
}

impl Backend for Unavailable {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn prepare(&self, _opts: &PrepareOptions) -> NetResult<()> {
        Err(NetError::Unsupported(self.mode.as_str()))
    }

    fn work(&self, _sink: &dyn EventSink, _timeout: Duration) -> NetResult<PassStats> {
        Err(NetError::Unsupported(self.mode.as_str()))
    }

    fn off(&self) {}

    fn sock_add(&self, _fd: RawFd, _id: ConnId) -> NetResult<()> {
        Err(NetError::Unsupported(self.mode.as_str()))
    }

    fn sock_remove(&self, _fd: RawFd, _id: ConnId) -> NetResult<()> {
        Ok(())
    }

    fn sock_want_write(&self, _fd: RawFd, _id: ConnId, _on: bool) -> NetResult<()> {
        Ok(())
    }
}

/// Backend for `mode` on this build target.
pub fn create(mode: Mode) -> Box<dyn Backend> {
    match mode {
        Mode::Select => Box::new(select::SelectBackend::new()),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Mode::Epoll => Box::new(epoll::EpollBackend::new()),
        #[cfg(target_os = "linux")]
        Mode::IoUring => Box::new(uring::UringBackend::new()),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ))]
        Mode::Kqueue => Box::new(kqueue::KqueueBackend::new()),
        #[allow(unreachable_patterns)]
        other => Box::new(Unavailable { mode: other }),
    }
}

/// Shared event policy applied to every ready descriptor of one pass.
pub fn handle_input(sink: &dyn EventSink, ready: &[Readiness]) -> PassStats {
    let mut stats = PassStats { events: ready.len(), ..PassStats::default() };

    for r in ready {
        let token = r.token;
        if token.is_listen() {
            while stats.accepted < ACCEPT_BUDGET && sink.accept() {
                stats.accepted += 1;
            }
        } else if token.is_control() {
            let mut cmds = Vec::new();
            sink.drain_control(&mut cmds);
            for cmd in cmds {
                match cmd {
                    control::CMD_WAKE => {}
                    control::CMD_KILL => {
                        sink.request_stop();
                        stats.stop_requested = true;
                    }
                    other => kwarn!("ignoring unknown control byte {:#04x}", other),
                }
            }
        } else if let Some(id) = token.conn_id() {
            if !sink.owns_fd(id, token.fd()) {
                ktrace!("stale event for {} fd={}", id, token.fd());
                stats.stale += 1;
            } else if r.error {
                sink.remove(id);
                stats.removed += 1;
            } else {
                sink.enqueue(id);
                stats.enqueued += 1;
            }
        }
    }

    stats
}

/// Clamp a wait to whole milliseconds for `c_int` timeouts, never 0.
pub(crate) fn timeout_ms(timeout: Duration) -> libc::c_int {
    timeout.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct MockSink {
        pending_peers: Cell<usize>,
        accepted: Cell<usize>,
        enqueued: RefCell<Vec<ConnId>>,
        removed: RefCell<Vec<ConnId>>,
        control: RefCell<Vec<u8>>,
        stopped: Cell<bool>,
        owned: RefCell<Vec<(ConnId, RawFd)>>,
    }

    impl EventSink for MockSink {
        fn accept(&self) -> bool {
            if self.pending_peers.get() == 0 {
                return false;
            }
            self.pending_peers.set(self.pending_peers.get() - 1);
            self.accepted.set(self.accepted.get() + 1);
            true
        }
        fn enqueue(&self, id: ConnId) {
            self.enqueued.borrow_mut().push(id);
        }
        fn remove(&self, id: ConnId) {
            self.removed.borrow_mut().push(id);
        }
        fn owns_fd(&self, id: ConnId, fd: RawFd) -> bool {
            self.owned.borrow().contains(&(id, fd))
        }
        fn drain_control(&self, out: &mut Vec<u8>) -> usize {
            let mut c = self.control.borrow_mut();
            let n = c.len();
            out.append(&mut c);
            n
        }
        fn request_stop(&self) {
            self.stopped.set(true);
        }
    }

    fn id(n: u32) -> ConnId {
        ConnId::new(n).unwrap()
    }

    #[test]
    fn test_accept_budget_per_pass() {
        let sink = MockSink::default();
        sink.pending_peers.set(100);
        let stats = handle_input(&sink, &[Readiness::readable(Token::listen(3))]);
        assert_eq!(stats.accepted, ACCEPT_BUDGET);
        assert_eq!(sink.accepted.get(), 64);
        assert_eq!(sink.pending_peers.get(), 36);

        let stats = handle_input(&sink, &[Readiness::readable(Token::listen(3))]);
        assert_eq!(stats.accepted, 36);
    }

    #[test]
    fn test_control_bytes() {
        let sink = MockSink::default();
        sink.control.borrow_mut().extend_from_slice(b"wzw");
        let stats = handle_input(&sink, &[Readiness::readable(Token::control(4))]);
        assert!(!stats.stop_requested);
        assert!(!sink.stopped.get());

        sink.control.borrow_mut().extend_from_slice(b"wk");
        let stats = handle_input(&sink, &[Readiness::readable(Token::control(4))]);
        assert!(stats.stop_requested);
        assert!(sink.stopped.get());
    }

    #[test]
    fn test_connection_events() {
        let sink = MockSink::default();
        sink.owned.borrow_mut().push((id(1), 10));
        sink.owned.borrow_mut().push((id(2), 11));

        let ready = [
            Readiness::readable(Token::conn(10, id(1))),
            Readiness { token: Token::conn(11, id(2)), error: true, hangup: false },
            // fd 12 no longer belongs to id 1
            Readiness::readable(Token::conn(12, id(1))),
            Readiness { token: Token::conn(10, id(1)), error: false, hangup: true },
        ];
        let stats = handle_input(&sink, &ready);
        assert_eq!(stats.events, 4);
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.stale, 1);
        assert_eq!(sink.enqueued.borrow().as_slice(), &[id(1), id(1)]);
        assert_eq!(sink.removed.borrow().as_slice(), &[id(2)]);
    }

    #[test]
    fn test_create_reports_mode() {
        assert_eq!(create(Mode::Select).mode(), Mode::Select);
        let iocp = create(Mode::Iocp);
        assert_eq!(iocp.mode(), Mode::Iocp);
        let opts = PrepareOptions { max_count: 1, listen_fd: None, control_fd: 0 };
        assert_eq!(iocp.prepare(&opts), Err(NetError::Unsupported("iocp")));
    }
}
