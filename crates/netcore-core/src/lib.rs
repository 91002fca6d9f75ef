//! # netcore-core
//!
//! Core types and traits for the netcore connection manager.
//!
//! This crate is platform-agnostic and contains no socket code.
//! Executors live in `netcore-exec`, sockets/backends/manager in `netcore-net`.
//!
//! ## Modules
//!
//! - `id` - Connection identifier and backend event token
//! - `task` - Move-only work item and the `Executor` trait
//! - `codec` - Packet framing boundary (`Codec`, `RawCodec`, `LengthPrefixedCodec`)
//! - `setting` - `ManagerSetting`, backend `Mode`, `SocketType`
//! - `idset` - Copy-on-write connection id set
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod task;
pub mod codec;
pub mod setting;
pub mod idset;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{ConnId, Token};
pub use task::{task, Executor, Task};
pub use codec::{Codec, LengthPrefixedCodec, Packet, RawCodec};
pub use setting::{ManagerSetting, Mode, SocketType};
pub use idset::CowIdSet;
pub use error::{CodecError, ConfigError, ExecError, ExecResult, NetError, NetResult};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_str, env_is_set, env_key};

/// Constants shared by the reactor and its backends
pub mod constants {
    /// Accepts performed for one listen-readiness event in a single pass.
    pub const ACCEPT_BUDGET: usize = 64;

    /// Work passes one executor slot runs before handing its slot back.
    pub const WORK_PASS_BUDGET: usize = 32;

    /// Bytes read from one connection in a single `work()` pass.
    pub const READ_BUDGET: usize = 256 * 1024;

    /// Size of one `recv` into the input buffer.
    pub const READ_CHUNK: usize = 16 * 1024;

    /// Hard ceiling on connection ids (`u32::MAX` is the control-pipe token).
    pub const MAX_CONN_ID: u32 = u32::MAX - 1;
}
