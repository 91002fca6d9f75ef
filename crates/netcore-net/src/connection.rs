//! One managed connection
//!
//! A `Connection` is an arena slot: the manager allocates it once and
//! reuses the same `Arc` for every peer that later lands on its id, bumping
//! `generation` each time. Buffers are only touched by the thread running
//! `work()`, and the scheduler guarantees at most one such thread per id.
//!
//! ```text
//!   work():  recv (≤ READ_BUDGET) → decode all → dispatch (no locks) → flush
//!               │                      │                                │
//!               EOF / fatal            framing error                    fatal
//!               └──────────────────────┴─────── return false ──────────┘
//! ```

use std::net::Shutdown;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use nix::errno::Errno;

use netcore_core::constants::{READ_BUDGET, READ_CHUNK};
use netcore_core::{kdebug, kwarn, Codec, ConnId, NetError, NetResult, Packet};

use crate::address::Address;
use crate::manager::Core;
use crate::socket::Socket;

/// Application packet handler. Returning `false` is logged, not fatal.
pub type Dispatcher = Arc<dyn Fn(&Arc<Connection>, Packet) -> bool + Send + Sync>;

/// Connect/disconnect notification.
pub type ConnCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Closing,
            _ => ConnState::Disconnected,
        }
    }
}

static REENTRY_VIOLATIONS: AtomicUsize = AtomicUsize::new(0);

/// Times `work()` was entered while already running on the same connection.
/// Stays 0 unless the scheduler is broken.
pub fn reentry_violations() -> usize {
    REENTRY_VIOLATIONS.load(Ordering::Relaxed)
}

pub struct Connection {
    id: ConnId,
    manager: Weak<Core>,
    generation: AtomicU32,
    state: AtomicU8,
    socket: RwLock<Socket>,
    input: Mutex<Vec<u8>>,
    output: Mutex<Vec<u8>>,
    keep_alive: AtomicBool,
    in_work: AtomicBool,
    /// Last read pass stopped at READ_BUDGET with data possibly left
    budget_hit: AtomicBool,
    /// Last flush stopped on a full send buffer
    flush_stalled: AtomicBool,
    /// Backend is watching for writability on our behalf
    write_armed: AtomicBool,
    peer: Mutex<Option<Address>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

struct WorkGuard<'a>(&'a AtomicBool);

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Connection {
    pub(crate) fn new(id: ConnId, manager: Weak<Core>) -> Self {
        Self {
            id,
            manager,
            generation: AtomicU32::new(0),
            state: AtomicU8::new(ConnState::Disconnected as u8),
            socket: RwLock::new(Socket::invalid()),
            input: Mutex::new(Vec::new()),
            output: Mutex::new(Vec::new()),
            keep_alive: AtomicBool::new(false),
            in_work: AtomicBool::new(false),
            budget_hit: AtomicBool::new(false),
            flush_stalled: AtomicBool::new(false),
            write_armed: AtomicBool::new(false),
            peer: Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Reset transient state for a new lifecycle on this slot.
    pub(crate) fn init(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.store(ConnState::Disconnected as u8, Ordering::Release);
        self.socket.write().unwrap().close();
        self.input.lock().unwrap().clear();
        self.output.lock().unwrap().clear();
        self.keep_alive.store(false, Ordering::Release);
        self.budget_hit.store(false, Ordering::Relaxed);
        self.flush_stalled.store(false, Ordering::Relaxed);
        self.write_armed.store(false, Ordering::Relaxed);
        *self.peer.lock().unwrap() = None;
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Bumped every time the slot is handed to a new peer.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move to `Closing`. Returns the previous state, or `None` if another
    /// thread is already closing this connection.
    pub(crate) fn begin_close(&self) -> Option<ConnState> {
        let prev = ConnState::from_u8(self.state.swap(ConnState::Closing as u8, Ordering::AcqRel));
        if prev == ConnState::Closing {
            None
        } else {
            Some(prev)
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.read().unwrap().fd()
    }

    pub fn peer(&self) -> Option<Address> {
        self.peer.lock().unwrap().clone()
    }

    pub(crate) fn set_peer(&self, peer: Option<Address>) {
        *self.peer.lock().unwrap() = peer;
    }

    /// Keep-alive slots survive `remove`; they belong to a `Connector`.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub fn set_keep_alive(&self, on: bool) {
        self.keep_alive.store(on, Ordering::Release);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub(crate) fn with_socket<R>(&self, f: impl FnOnce(&Socket) -> R) -> R {
        f(&self.socket.read().unwrap())
    }

    pub(crate) fn with_socket_mut<R>(&self, f: impl FnOnce(&mut Socket) -> R) -> R {
        f(&mut self.socket.write().unwrap())
    }

    /// No undecoded backlog left by a budget-limited read and no pending
    /// output.
    pub fn idle(&self) -> bool {
        !self.budget_hit.load(Ordering::Acquire) && self.output.lock().unwrap().is_empty()
    }

    /// Pending output is waiting for the socket to become writable. Such a
    /// connection is not idle, but another pass before a writable event
    /// would only hit the full send buffer again.
    pub fn flush_stalled(&self) -> bool {
        self.flush_stalled.load(Ordering::Acquire)
    }

    /// Record whether write interest is registered; returns the old value.
    pub(crate) fn swap_write_armed(&self, on: bool) -> bool {
        self.write_armed.swap(on, Ordering::AcqRel)
    }

    /// One read/decode/dispatch/flush pass.
    ///
    /// Returns `false` when the connection must be removed: peer EOF, fatal
    /// socket error or a framing violation.
    pub fn work(self: &Arc<Self>, codec: &dyn Codec, dispatcher: Option<&Dispatcher>) -> bool {
        if self.in_work.swap(true, Ordering::AcqRel) {
            REENTRY_VIOLATIONS.fetch_add(1, Ordering::Relaxed);
            debug_assert!(false, "work() re-entered on {}", self.id);
            return true;
        }
        let _guard = WorkGuard(&self.in_work);

        let eof = match self.fill_input() {
            Ok(eof) => eof,
            Err(e) => {
                kdebug!("{} read failed: {}", self.id, e);
                return false;
            }
        };

        let packets = match self.decode_all(codec) {
            Ok(p) => p,
            Err(e) => {
                kwarn!("{} framing error: {}", self.id, e);
                return false;
            }
        };

        for packet in packets {
            if let Some(dispatch) = dispatcher {
                if !dispatch(self, packet) {
                    kwarn!("{} dispatcher rejected a packet", self.id);
                }
            }
        }

        if let Err(e) = self.flush() {
            kdebug!("{} write failed: {}", self.id, e);
            return false;
        }

        !eof
    }

    /// Encode `packet` into the output buffer and schedule a flush pass.
    pub fn send(&self, packet: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(core) = self.manager.upgrade() else {
            return false;
        };
        let codec = core.codec();
        if let Err(e) = codec.encode(packet, &mut self.output.lock().unwrap()) {
            kwarn!("{} encode failed: {}", self.id, e);
            return false;
        }
        self.flush_stalled.store(false, Ordering::Release);
        core.enqueue(self.id);
        true
    }

    /// Half-close both directions. The slot stays allocated until `close`.
    pub fn shutdown(&self) {
        let _ = self.socket.read().unwrap().shutdown(Shutdown::Both);
    }

    /// Remove from the owning manager (fires `on_disconnect` once).
    pub fn close(self: &Arc<Self>) {
        match self.manager.upgrade() {
            Some(core) => {
                core.remove_conn(self, None, false);
            }
            None => {
                self.socket.write().unwrap().close();
            }
        }
    }

    /// Read until would-block, EOF or the per-pass budget. Returns `true` on EOF.
    fn fill_input(&self) -> NetResult<bool> {
        let socket = self.socket.read().unwrap();
        let mut input = self.input.lock().unwrap();
        let mut total = 0usize;
        let mut eof = false;

        while total < READ_BUDGET {
            let start = input.len();
            input.resize(start + READ_CHUNK, 0);
            match socket.recv(&mut input[start..]) {
                Ok(0) => {
                    input.truncate(start);
                    eof = true;
                    break;
                }
                Ok(n) => {
                    input.truncate(start + n);
                    total += n;
                    if n < READ_CHUNK {
                        break;
                    }
                }
                Err(NetError::Os(Errno::EINTR)) => input.truncate(start),
                Err(NetError::WouldBlock) => {
                    input.truncate(start);
                    break;
                }
                Err(e) => {
                    input.truncate(start);
                    return Err(e);
                }
            }
        }

        self.bytes_in.fetch_add(total as u64, Ordering::Relaxed);
        self.budget_hit.store(total >= READ_BUDGET, Ordering::Release);
        Ok(eof)
    }

    fn decode_all(&self, codec: &dyn Codec) -> Result<Vec<Packet>, netcore_core::CodecError> {
        codec.decode_all(&mut self.input.lock().unwrap())
    }

    fn flush(&self) -> NetResult<()> {
        let socket = self.socket.read().unwrap();
        let mut out = self.output.lock().unwrap();
        let mut sent = 0usize;
        let mut stalled = false;

        while sent < out.len() {
            match socket.send(&out[sent..]) {
                Ok(n) => sent += n,
                Err(NetError::Os(Errno::EINTR)) => {}
                Err(NetError::WouldBlock) => {
                    stalled = true;
                    break;
                }
                Err(e) => {
                    out.drain(..sent);
                    return Err(e);
                }
            }
        }

        out.drain(..sent);
        self.bytes_out.fetch_add(sent as u64, Ordering::Relaxed);
        self.flush_stalled.store(stalled, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("generation", &self.generation())
            .field("state", &self.state())
            .field("keep_alive", &self.keep_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_core::{LengthPrefixedCodec, RawCodec};
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Arc<Connection>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let conn = Arc::new(Connection::new(ConnId::new(1).unwrap(), Weak::new()));
        conn.init();
        conn.with_socket_mut(|s| s.reset(a.into_raw_fd()));
        conn.set_state(ConnState::Connected);
        (conn, b)
    }

    fn collector() -> (Dispatcher, Arc<Mutex<Vec<Packet>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let d: Dispatcher = Arc::new(move |_c: &Arc<Connection>, p: Packet| {
            s.lock().unwrap().push(p);
            true
        });
        (d, seen)
    }

    #[test]
    fn test_work_dispatches_and_idles() {
        use std::io::Write;
        let (conn, mut peer) = pair();
        let (d, seen) = collector();

        peer.write_all(b"hello").unwrap();
        assert!(conn.work(&RawCodec, Some(&d)));
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
        assert!(conn.idle());
        assert_eq!(conn.bytes_in(), 5);
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        use std::io::Write;
        let (conn, mut peer) = pair();
        let (d, seen) = collector();
        let codec = LengthPrefixedCodec::default();

        let mut wire = Vec::new();
        codec.encode(b"abcdef", &mut wire).unwrap();
        peer.write_all(&wire[..5]).unwrap();
        assert!(conn.work(&codec, Some(&d)));
        assert!(seen.lock().unwrap().is_empty());

        peer.write_all(&wire[5..]).unwrap();
        assert!(conn.work(&codec, Some(&d)));
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"abcdef".to_vec()]);
    }

    #[test]
    fn test_eof_and_framing_error_end_connection() {
        use std::io::Write;
        let (conn, peer) = pair();
        drop(peer);
        assert!(!conn.work(&RawCodec, None));

        let (conn, mut peer) = pair();
        let codec = LengthPrefixedCodec::new(4);
        peer.write_all(&100u32.to_be_bytes()).unwrap();
        assert!(!conn.work(&codec, None));
        assert_eq!(reentry_violations(), 0);
    }

    #[test]
    fn test_full_send_buffer_is_stalled_not_idle() {
        use std::io::Read;
        let (conn, mut peer) = pair();
        conn.output.lock().unwrap().resize(8 * 1024 * 1024, 7);
        assert!(conn.work(&RawCodec, None));
        assert!(conn.flush_stalled());
        assert!(!conn.idle());

        // Drain what the peer can see, then let the flush finish
        peer.set_nonblocking(true).unwrap();
        let mut buf = vec![0u8; 1 << 20];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while !conn.idle() && std::time::Instant::now() < deadline {
            while let Ok(n) = peer.read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
            assert!(conn.work(&RawCodec, None));
        }
        assert!(conn.idle());
        assert!(!conn.flush_stalled());
    }

    #[test]
    fn test_send_without_manager_fails() {
        let (conn, _peer) = pair();
        assert!(!conn.send(b"x"));
    }

    #[test]
    fn test_init_bumps_generation_and_resets() {
        let (conn, _peer) = pair();
        conn.set_keep_alive(true);
        let g = conn.generation();
        conn.init();
        assert_eq!(conn.generation(), g + 1);
        assert!(!conn.keep_alive());
        assert_eq!(conn.state(), ConnState::Disconnected);
        assert_eq!(conn.fd(), crate::socket::INVALID_SOCKET);
    }

    #[test]
    fn test_begin_close_once() {
        let (conn, _peer) = pair();
        assert_eq!(conn.begin_close(), Some(ConnState::Connected));
        assert_eq!(conn.begin_close(), None);
    }
}
