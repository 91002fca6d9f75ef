//! # netcore-net
//!
//! Sockets, addresses, readiness backends and the connection manager.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Manager (one reactor thread)                                  │
//! │   Listener ──► accept ──► ConnTable (arena, lowest free id)   │
//! │   ControlPipe ('w' wake, 'k' stop)                            │
//! │   Backend: epoll | select | kqueue | io_uring                 │
//! │        │ readiness (fd, id) token                             │
//! │        ▼                                                      │
//! │   WorkQueue (one item per id, in-flight cap) ──► Executor     │
//! │                                                  │            │
//! │                                  Connection::work()           │
//! │                                  recv → decode → dispatch → flush
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `address` - Native socket address (inet, inet6, unix)
//! - `socket` - Owned non-blocking socket handle
//! - `listener` - Bound listening socket
//! - `control` - Self-pipe for waking/stopping the reactor
//! - `connection` - Per-peer buffers, state and the work pass
//! - `manager` - Connection table, scheduling and the reactor
//! - `backend` - Pluggable readiness backends and the shared event policy
//! - `engine` - Named registry of managers
//! - `connector` - Reconnectable outbound connection
//!
//! Unix targets only.

pub mod address;
pub mod socket;
pub mod listener;
pub mod control;
pub mod connection;
pub mod manager;
pub mod backend;
pub mod engine;
pub mod connector;

pub use address::{is_valid_addr, Address, Family};
pub use socket::{Socket, INVALID_SOCKET};
pub use listener::Listener;
pub use control::ControlPipe;
pub use connection::{reentry_violations, ConnCallback, ConnState, Connection, Dispatcher};
pub use manager::{Manager, ManagerState, ManagerStats, ScheduleStats};
pub use backend::{Backend, EventSink, PassStats, PrepareOptions, Readiness};
pub use engine::Engine;
pub use connector::Connector;
