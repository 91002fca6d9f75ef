//! # netcore - non-blocking connection manager
//!
//! A reactor thread multiplexes many sockets over an OS readiness backend
//! (epoll, select, kqueue, io_uring) and hands per-connection work to an
//! executor (inline, manual, ad-hoc thread, worker thread, thread pool).
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use netcore::{Manager, ManagerSetting, ThreadPool};
//!
//! let pool = Arc::new(ThreadPool::with_workers(4)?);
//! let manager = Manager::new(ManagerSetting::from_env("echo").address("0.0.0.0:9000"), pool)?;
//! manager.set_dispatcher(|conn, packet| conn.send(&packet));
//! manager.set_connect_callback(|conn| netcore::kinfo!("connected {}", conn.id()));
//! assert!(manager.start());
//! // ...
//! manager.stop();
//! ```
//!
//! ## Crates
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ netcore (this crate): re-exports                          │
//! ├───────────────────┬──────────────────┬───────────────────┤
//! │ netcore-net       │ netcore-exec     │ netcore-core      │
//! │ Socket, Address   │ Inline, Manual   │ ConnId, Token     │
//! │ Manager, Backend  │ Thread, Worker   │ Task, Executor    │
//! │ Engine, Connector │ ThreadPool       │ Codec, errors     │
//! │                   │ Semaphore        │ kprint, env       │
//! └───────────────────┴──────────────────┴───────────────────┘
//! ```
//!
//! ## Environment
//!
//! - `NETCORE_LOG_LEVEL` - off|error|warn|info|debug|trace (or 0-5)
//! - `NETCORE_FLUSH_EPRINT` - flush stderr after every log line
//! - `NETCORE_<NAME>_*` - `ManagerSetting::from_env(name)` overrides
//! - `NETCORE_POOL_*` - `PoolConfig::from_env()` overrides

pub use netcore_core::{
    constants, env, kprint, task, CodecError, Codec, ConfigError, ConnId, CowIdSet, ExecError, ExecResult,
    Executor, LengthPrefixedCodec, ManagerSetting, Mode, NetError, NetResult, Packet, RawCodec, SocketType, Task,
    Token,
};
pub use netcore_core::{kdebug, kerror, kinfo, kprintln, ktrace, kwarn};

pub use netcore_exec::{
    IdleWorkerSet, InlineExecutor, ManualExecutor, PoolConfig, Semaphore, ThreadExecutor, ThreadPool, WorkerThread,
};

pub use netcore_net::{
    backend, reentry_violations, Address, Backend, ConnState, Connection, Connector, ControlPipe, Dispatcher, Engine,
    EventSink, Family, Listener, Manager, ManagerState, ManagerStats, Socket,
};

/// Settings submodule, for `netcore::setting::defaults`.
pub mod setting {
    pub use netcore_core::setting::*;
}
