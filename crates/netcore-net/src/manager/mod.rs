//! Connection manager
//!
//! One reactor thread per manager drives the backend; per-connection work
//! runs on the executor.
//!
//! ```text
//!   reactor thread                         executor threads
//!   ──────────────                         ────────────────
//!   backend.work(poll_timeout)
//!     listen  → accept (≤ 64 per pass)
//!     control → 'w' wake / 'k' stop
//!     conn    → enqueue(id) ───────────►   run_slot(id)
//!   top_up(): launch waiting ids             begin → conn.work() → complete
//!                                            next waiting id, ≤ 32 passes
//! ```
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`. A manager
//! is started at most once; `stop()` is idempotent and safe from any thread,
//! including the reactor and executor threads.

mod schedule;
mod table;

pub use schedule::ScheduleStats;

use std::collections::BTreeSet;
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use netcore_core::constants::WORK_PASS_BUDGET;
use netcore_core::{
    kdebug, kerror, kinfo, ktrace, kwarn, task, Codec, ConnId, CowIdSet, Executor, ManagerSetting, NetError,
    NetResult, RawCodec, SocketType,
};

use crate::address::{Address, Family};
use crate::backend::{self, Backend, EventSink, PrepareOptions};
use crate::connection::{ConnCallback, ConnState, Connection, Dispatcher};
use crate::control::ControlPipe;
use crate::listener::Listener;
use crate::socket::{Socket, INVALID_SOCKET};

use schedule::{Admit, WorkQueue};
use table::ConnTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ManagerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ManagerState::Starting,
            2 => ManagerState::Running,
            3 => ManagerState::Stopping,
            _ => ManagerState::Stopped,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub live: usize,
    pub max_id: u32,
    pub accepted: u64,
    /// Peers accepted and dropped because the table was full
    pub rejected: u64,
    pub removed: u64,
    pub schedule: ScheduleStats,
}

struct Handlers {
    dispatcher: Option<Dispatcher>,
    codec: Arc<dyn Codec>,
    on_connect: Option<ConnCallback>,
    on_disconnect: Option<ConnCallback>,
}

pub(crate) struct Core {
    setting: ManagerSetting,
    listen_addr: Option<Address>,
    backend: Box<dyn Backend>,
    executor: Arc<dyn Executor>,
    table: Mutex<ConnTable>,
    ids: CowIdSet,
    queue: Mutex<WorkQueue>,
    handlers: RwLock<Handlers>,
    listener: RwLock<Option<Listener>>,
    control: RwLock<Option<ControlPipe>>,
    state: AtomicU8,
    running: AtomicBool,
    started: AtomicBool,
    stopping: AtomicBool,
    reactor: Mutex<Option<JoinHandle<()>>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    removed: AtomicU64,
    me: Weak<Core>,
}

impl Core {
    fn set_state(&self, state: ManagerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn codec(&self) -> Arc<dyn Codec> {
        self.handlers.read().unwrap().codec.clone()
    }

    pub(crate) fn get_live(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.table.lock().unwrap().get_live(id)
    }

    pub(crate) fn wake(&self) {
        if let Some(control) = self.control.read().unwrap().as_ref() {
            let _ = control.wake();
        }
    }

    // ---- table ----

    pub(crate) fn new_conn(&self) -> Option<Arc<Connection>> {
        let mut table = self.table.lock().unwrap();
        let me = self.me.clone();
        let conn = table.allocate(|id| Connection::new(id, me))?;
        conn.init();
        self.ids.insert(conn.id());
        ktrace!("[{}] allocated {}", self.setting.name, conn.id());
        Some(conn)
    }

    /// Tear down `conn`. With `expected_gen`, nothing happens if the slot has
    /// since been reused. Keep-alive slots stay allocated.
    pub(crate) fn remove_conn(&self, conn: &Arc<Connection>, expected_gen: Option<u32>, no_event: bool) -> bool {
        let generation = conn.generation();
        if expected_gen.is_some_and(|g| g != generation) {
            return false;
        }
        let Some(prev) = conn.begin_close() else {
            return false;
        };

        let fd = conn.fd();
        if fd != INVALID_SOCKET {
            if let Err(e) = self.backend.sock_remove(fd, conn.id()) {
                kdebug!("[{}] unregister {} failed: {}", self.setting.name, conn.id(), e);
            }
        }
        conn.with_socket_mut(|s| {
            let _ = s.shutdown(Shutdown::Both);
            s.close();
        });

        if prev == ConnState::Connected && !no_event {
            let cb = self.handlers.read().unwrap().on_disconnect.clone();
            if let Some(cb) = cb {
                cb(conn);
            }
        }

        let mut table = self.table.lock().unwrap();
        conn.set_state(ConnState::Disconnected);
        if !conn.keep_alive() && table.retire(conn.id(), generation) {
            self.ids.remove(conn.id());
            self.removed.fetch_add(1, Ordering::Relaxed);
            // A pass still holding the id reclaims it when it completes
            if self.queue.lock().unwrap().retire(conn.id()) {
                ktrace!("[{}] retired {}, busy", self.setting.name, conn.id());
            } else {
                table.reclaim(conn.id());
                ktrace!("[{}] released {}", self.setting.name, conn.id());
            }
        }
        true
    }

    /// Free a retired id once no work pass holds it.
    fn reclaim(&self, id: ConnId) {
        self.table.lock().unwrap().reclaim(id);
        ktrace!("[{}] released {}", self.setting.name, id);
    }

    fn fire_connect(&self, conn: &Arc<Connection>) {
        let cb = self.handlers.read().unwrap().on_connect.clone();
        if let Some(cb) = cb {
            cb(conn);
        }
    }

    /// Socket options and backend registration for a freshly connected peer.
    fn configure(&self, conn: &Connection, family: Family) -> NetResult<()> {
        let nodelay = self.setting.socket_type == SocketType::Stream && family != Family::Unix;
        conn.with_socket(|s| -> NetResult<()> {
            s.set_nonblocking(true)?;
            s.set_linger(Some(0))?;
            if nodelay {
                s.set_nodelay(true)?;
            }
            Ok(())
        })?;
        conn.set_state(ConnState::Connected);
        self.backend.sock_add(conn.fd(), conn.id())
    }

    // ---- accept / connect ----

    fn accept(&self) -> bool {
        let (conn, result, family) = {
            let guard = self.listener.read().unwrap();
            let Some(listener) = guard.as_ref() else {
                return false;
            };
            let family = listener.address().family();
            match self.new_conn() {
                Some(conn) => {
                    conn.set_state(ConnState::Connecting);
                    let result = conn.with_socket_mut(|s| listener.accept_into(s));
                    (conn, result, family)
                }
                None => return self.reject_pending(listener),
            }
        };

        let peer = match result {
            Ok(peer) => peer,
            Err(e) => {
                if !e.is_transient() {
                    kwarn!("[{}] accept failed: {}", self.setting.name, e);
                }
                self.remove_conn(&conn, None, true);
                return false;
            }
        };

        if let Err(e) = self.configure(&conn, family) {
            kdebug!("[{}] setup of {} failed: {}", self.setting.name, conn.id(), e);
            conn.with_socket(|s| s.drain());
            self.remove_conn(&conn, None, true);
            return true;
        }

        kdebug!("[{}] accepted {} from {}", self.setting.name, conn.id(), peer);
        conn.set_peer(Some(peer));
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.fire_connect(&conn);
        true
    }

    /// Table full: take one peer off the backlog and drop it abortively.
    fn reject_pending(&self, listener: &Listener) -> bool {
        match listener.accept_raw() {
            Ok((fd, peer)) => {
                let socket = Socket::from_raw(fd);
                let _ = socket.set_linger(Some(0));
                drop(socket);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                kdebug!("[{}] table full, dropped {}", self.setting.name, peer);
                true
            }
            Err(_) => false,
        }
    }

    /// Connect an allocated slot and register it. The slot is left
    /// `Disconnected` (still allocated) on failure.
    pub(crate) fn connect_slot(&self, conn: &Arc<Connection>, addr: &Address, timeout: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        conn.set_state(ConnState::Connecting);
        if !conn.with_socket_mut(|s| s.connect(addr, timeout)) {
            conn.set_state(ConnState::Disconnected);
            return false;
        }
        if let Err(e) = self.configure(conn, addr.family()) {
            kdebug!("[{}] setup of {} failed: {}", self.setting.name, conn.id(), e);
            conn.with_socket_mut(|s| s.close());
            conn.set_state(ConnState::Disconnected);
            return false;
        }
        conn.set_peer(Some(addr.clone()));
        kdebug!("[{}] connected {} to {}", self.setting.name, conn.id(), addr);
        // Queued registrations (io_uring) are applied by the reactor
        self.wake();
        self.fire_connect(conn);
        true
    }

    // ---- scheduling ----

    pub(crate) fn enqueue(&self, id: ConnId) {
        if !self.is_running() {
            return;
        }
        let admit = self.queue.lock().unwrap().admit(id);
        if admit == Admit::Launch {
            self.launch(id);
        }
    }

    fn launch(&self, id: ConnId) {
        let Some(core) = self.me.upgrade() else {
            self.abort(id);
            return;
        };
        if let Err(e) = self.executor.enqueue(task(move || core.run_slot(id))) {
            kerror!("[{}] cannot schedule {}: {}", self.setting.name, id, e);
            self.abort(id);
        }
    }

    fn abort(&self, id: ConnId) {
        let retired = self.queue.lock().unwrap().abort(id);
        if retired {
            self.reclaim(id);
        }
    }

    /// Body of one executor task: work `id`, then keep the slot for waiting
    /// ids until the pass budget runs out.
    fn run_slot(&self, id: ConnId) {
        let mut current = id;
        let mut passes = 0;
        loop {
            self.queue.lock().unwrap().begin(current);
            let again = self.work_one(current);
            passes += 1;
            let may_continue = passes < WORK_PASS_BUDGET && self.is_running();
            let done = self.queue.lock().unwrap().complete(current, again, may_continue);
            if let Some(id) = done.reclaim {
                self.reclaim(id);
            }
            match done.next {
                Some(next) => current = next,
                None => break,
            }
        }
    }

    /// One pass on `id`. Returns `true` if more work is pending.
    fn work_one(&self, id: ConnId) -> bool {
        let Some(conn) = self.get_live(id) else {
            return false;
        };
        if !conn.is_connected() {
            return false;
        }
        let generation = conn.generation();
        let (codec, dispatcher) = {
            let h = self.handlers.read().unwrap();
            (h.codec.clone(), h.dispatcher.clone())
        };
        if conn.work(&*codec, dispatcher.as_ref()) {
            self.sync_write_interest(&conn);
            !conn.idle() && !conn.flush_stalled()
        } else {
            self.remove_conn(&conn, Some(generation), false);
            false
        }
    }

    /// Watch for writability while `conn` has output stuck behind a full
    /// send buffer; the writable event schedules the pass that resumes the
    /// flush. Dropped again once a pass gets unstuck.
    fn sync_write_interest(&self, conn: &Connection) {
        let fd = conn.fd();
        if fd == INVALID_SOCKET {
            return;
        }
        if conn.flush_stalled() {
            conn.swap_write_armed(true);
            if let Err(e) = self.backend.sock_want_write(fd, conn.id(), true) {
                kdebug!("[{}] write interest for {} failed: {}", self.setting.name, conn.id(), e);
            }
            // Select and io_uring pick up the change on their next pass
            self.wake();
        } else if conn.swap_write_armed(false) {
            if let Err(e) = self.backend.sock_want_write(fd, conn.id(), false) {
                kdebug!("[{}] write interest for {} failed: {}", self.setting.name, conn.id(), e);
            }
        }
    }

    fn top_up(&self) {
        let ids = self.queue.lock().unwrap().take_launchable();
        for id in ids {
            self.launch(id);
        }
    }

    // ---- lifecycle ----

    fn start(&self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            kwarn!("[{}] start() called twice", self.setting.name);
            return false;
        }
        self.set_state(ManagerState::Starting);
        match self.try_start() {
            Ok(()) => {
                self.set_state(ManagerState::Running);
                kinfo!(
                    "[{}] running mode={} address={:?}",
                    self.setting.name,
                    self.backend.mode(),
                    self.setting.address
                );
                true
            }
            Err(e) => {
                kerror!("[{}] start failed: {}", self.setting.name, e);
                self.running.store(false, Ordering::Release);
                self.backend.off();
                *self.listener.write().unwrap() = None;
                *self.control.write().unwrap() = None;
                self.set_state(ManagerState::Stopped);
                false
            }
        }
    }

    fn try_start(&self) -> NetResult<()> {
        let core = self.me.upgrade().ok_or(NetError::NotRunning)?;

        let listener = match &self.listen_addr {
            Some(addr) => Some(Listener::bind(addr, self.setting.backlog, self.setting.socket_type)?),
            None => None,
        };
        let control = ControlPipe::new()?;
        self.backend.prepare(&PrepareOptions {
            max_count: self.setting.max_count,
            listen_fd: listener.as_ref().map(Listener::fd),
            control_fd: control.reader_fd(),
        })?;
        *self.listener.write().unwrap() = listener;
        *self.control.write().unwrap() = Some(control);

        self.running.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name(self.setting.name.clone())
            .spawn(move || reactor_loop(core))
            .map_err(NetError::from)?;
        *self.reactor.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ManagerState::Stopping);
        self.running.store(false, Ordering::Release);

        let live = self.table.lock().unwrap().live_connections();
        for conn in &live {
            conn.shutdown();
        }

        if let Some(control) = self.control.read().unwrap().as_ref() {
            let _ = control.kill();
        }
        let handle = self.reactor.lock().unwrap().take();
        if let Some(h) = handle {
            if h.thread().id() != thread::current().id() {
                let _ = h.join();
            }
        }

        self.backend.off();
        let cancelled = self.executor.shutdown();
        let retired = self.queue.lock().unwrap().clear();
        for id in retired {
            self.reclaim(id);
        }

        let remaining = self.table.lock().unwrap().live_connections();
        for conn in &remaining {
            conn.set_keep_alive(false);
            self.remove_conn(conn, None, false);
        }

        *self.listener.write().unwrap() = None;
        *self.control.write().unwrap() = None;
        self.set_state(ManagerState::Stopped);
        kinfo!(
            "[{}] stopped ({} connections closed, {} tasks cancelled)",
            self.setting.name,
            remaining.len(),
            cancelled
        );
    }
}

impl EventSink for Core {
    fn accept(&self) -> bool {
        Core::accept(self)
    }

    fn enqueue(&self, id: ConnId) {
        Core::enqueue(self, id);
    }

    fn remove(&self, id: ConnId) {
        if let Some(conn) = self.get_live(id) {
            self.remove_conn(&conn, None, false);
        }
    }

    fn owns_fd(&self, id: ConnId, fd: RawFd) -> bool {
        self.get_live(id).is_some_and(|c| c.fd() == fd)
    }

    fn drain_control(&self, out: &mut Vec<u8>) -> usize {
        self.control.read().unwrap().as_ref().map_or(0, |c| c.drain(out))
    }

    fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

fn reactor_loop(core: Arc<Core>) {
    kdebug!("[{}] reactor up", core.setting.name);
    while core.is_running() {
        match core.backend.work(&*core, core.setting.poll_timeout) {
            Ok(stats) if stats.stop_requested => break,
            Ok(_) => {}
            Err(e) => {
                kerror!("[{}] backend {} failed: {}", core.setting.name, core.backend.mode(), e);
                core.running.store(false, Ordering::Release);
                break;
            }
        }
        core.top_up();
    }
    kdebug!("[{}] reactor down", core.setting.name);
}

/// Connection manager: listener, connection table and reactor thread.
///
/// ```rust,ignore
/// let pool = Arc::new(ThreadPool::with_workers(4));
/// let manager = Manager::new(ManagerSetting::new("echo").address("127.0.0.1:9000"), pool)?;
/// manager.set_dispatcher(|conn, packet| conn.send(&packet));
/// assert!(manager.start());
/// // ...
/// manager.stop();
/// ```
pub struct Manager {
    core: Arc<Core>,
}

impl Manager {
    /// Validate `setting` and pick the backend for `setting.mode`.
    pub fn new(setting: ManagerSetting, executor: Arc<dyn Executor>) -> NetResult<Self> {
        let backend = backend::create(setting.mode);
        Self::with_backend(setting, executor, backend)
    }

    /// Same as `new` with an explicit backend.
    pub fn with_backend(
        setting: ManagerSetting,
        executor: Arc<dyn Executor>,
        backend: Box<dyn Backend>,
    ) -> NetResult<Self> {
        setting.validate()?;
        let listen_addr = if setting.listens() {
            Some(Address::listen(&setting.address)?)
        } else {
            None
        };
        let max_working = executor.max_concurrency_level().saturating_mul(2);
        let table = ConnTable::new(setting.default_count, setting.max_count);

        let core = Arc::new_cyclic(|me| Core {
            setting,
            listen_addr,
            backend,
            executor,
            table: Mutex::new(table),
            ids: CowIdSet::new(),
            queue: Mutex::new(WorkQueue::new(max_working)),
            handlers: RwLock::new(Handlers {
                dispatcher: None,
                codec: Arc::new(RawCodec),
                on_connect: None,
                on_disconnect: None,
            }),
            listener: RwLock::new(None),
            control: RwLock::new(None),
            state: AtomicU8::new(ManagerState::Stopped as u8),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            reactor: Mutex::new(None),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            me: me.clone(),
        });
        Ok(Self { core })
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn set_dispatcher<F>(&self, f: F)
    where
        F: Fn(&Arc<Connection>, netcore_core::Packet) -> bool + Send + Sync + 'static,
    {
        self.core.handlers.write().unwrap().dispatcher = Some(Arc::new(f));
    }

    pub fn set_codec(&self, codec: Arc<dyn Codec>) {
        self.core.handlers.write().unwrap().codec = codec;
    }

    pub fn set_connect_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.core.handlers.write().unwrap().on_connect = Some(Arc::new(f));
    }

    pub fn set_disconnect_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.core.handlers.write().unwrap().on_disconnect = Some(Arc::new(f));
    }

    /// Bind, prepare the backend and spawn the reactor thread.
    /// Returns `false` on any failure or on a second call.
    pub fn start(&self) -> bool {
        self.core.start()
    }

    /// Idempotent. After return the reactor has exited, the executor is shut
    /// down and every connection is closed.
    pub fn stop(&self) {
        self.core.stop()
    }

    /// Allocate a slot without a socket. `None` when the table is full.
    pub fn new_conn(&self) -> Option<Arc<Connection>> {
        self.core.new_conn()
    }

    /// Remove `id`, firing `on_disconnect` if it was connected.
    pub fn remove(&self, id: ConnId) -> bool {
        match self.core.get_live(id) {
            Some(conn) => self.core.remove_conn(&conn, None, false),
            None => false,
        }
    }

    /// Remove without firing `on_disconnect`.
    pub fn remove_silent(&self, id: ConnId) -> bool {
        match self.core.get_live(id) {
            Some(conn) => self.core.remove_conn(&conn, None, true),
            None => false,
        }
    }

    pub fn get_conn(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.core.get_live(id)
    }

    pub fn is_full(&self) -> bool {
        self.core.table.lock().unwrap().is_full()
    }

    /// Live connections.
    pub fn size(&self) -> usize {
        self.core.table.lock().unwrap().len()
    }

    /// Published id set; stable while the caller holds it.
    pub fn ids(&self) -> Arc<BTreeSet<ConnId>> {
        self.core.ids.snapshot()
    }

    /// Send `packet` to every connected peer. Returns how many accepted it.
    pub fn broadcast(&self, packet: &[u8]) -> usize {
        let mut sent = 0;
        for id in self.core.ids.snapshot().iter() {
            if let Some(conn) = self.core.get_live(*id) {
                if conn.send(packet) {
                    sent += 1;
                }
            }
        }
        sent
    }

    pub fn foreach<F: FnMut(&Arc<Connection>)>(&self, mut f: F) {
        for id in self.core.ids.snapshot().iter() {
            if let Some(conn) = self.core.get_live(*id) {
                f(&conn);
            }
        }
    }

    /// Schedule a work pass for `id`.
    pub fn enqueue(&self, id: ConnId) {
        self.core.enqueue(id)
    }

    /// Outbound connection through the same table and backend.
    pub fn connect(&self, addr: &Address, timeout: Duration) -> Option<Arc<Connection>> {
        let conn = self.core.new_conn()?;
        if self.core.connect_slot(&conn, addr, timeout) {
            Some(conn)
        } else {
            self.core.remove_conn(&conn, None, true);
            None
        }
    }

    /// Interrupt the reactor's current wait.
    pub fn wake(&self) {
        self.core.wake()
    }

    /// Actual bound address (port 0 resolved) while running.
    pub fn local_address(&self) -> Option<Address> {
        self.core.listener.read().unwrap().as_ref().map(|l| l.address().clone())
    }

    pub fn name(&self) -> &str {
        &self.core.setting.name
    }

    pub fn setting(&self) -> &ManagerSetting {
        &self.core.setting
    }

    pub fn state(&self) -> ManagerState {
        self.core.state()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn stats(&self) -> ManagerStats {
        let (live, max_id) = {
            let t = self.core.table.lock().unwrap();
            (t.len(), t.max_id())
        };
        ManagerStats {
            live,
            max_id,
            accepted: self.core.accepted.load(Ordering::Relaxed),
            rejected: self.core.rejected.load(Ordering::Relaxed),
            removed: self.core.removed.load(Ordering::Relaxed),
            schedule: self.core.queue.lock().unwrap().stats(),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.core.stop();
    }
}
