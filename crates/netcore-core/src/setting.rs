//! Manager settings
//!
//! Compile-time defaults with runtime environment overrides, same as every
//! other config struct in the workspace.
//!
//! ```rust,ignore
//! use netcore_core::setting::{ManagerSetting, Mode};
//!
//! // Defaults plus NETCORE_ECHO_* overrides
//! let setting = ManagerSetting::from_env("echo");
//!
//! // Or fully programmatic
//! let setting = ManagerSetting::new("echo")
//!     .address("127.0.0.1:9000")
//!     .mode(Mode::Epoll)
//!     .max_count(1024);
//! setting.validate()?;
//! ```

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use nix::sys::socket::SockType;

use crate::constants::MAX_CONN_ID;
use crate::env::{env_get, env_get_millis, env_get_opt, env_get_str, env_key};
use crate::error::ConfigError;

/// Library defaults
pub mod defaults {
    /// Empty address: no listening socket (client-only manager)
    pub const ADDRESS: &str = "";

    /// Connection table capacity reserved up front
    pub const DEFAULT_COUNT: u32 = 64;

    /// Connection table ceiling
    pub const MAX_COUNT: u32 = 4096;

    /// listen(2) backlog
    pub const BACKLOG: i32 = 1024;

    /// Upper bound of one backend wait
    pub const POLL_TIMEOUT_MS: u64 = 100;
}

/// Readiness/completion backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Epoll,
    Select,
    Kqueue,
    Iocp,
    IoUring,
}

impl Mode {
    /// Best backend for the build target.
    pub fn platform_default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                Mode::Epoll
            } else if #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd",
                target_os = "netbsd"
            ))] {
                Mode::Kqueue
            } else {
                Mode::Select
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Epoll => "epoll",
            Mode::Select => "select",
            Mode::Kqueue => "kqueue",
            Mode::Iocp => "iocp",
            Mode::IoUring => "io_uring",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "epoll" => Ok(Mode::Epoll),
            "select" => Ok(Mode::Select),
            "kqueue" => Ok(Mode::Kqueue),
            "iocp" => Ok(Mode::Iocp),
            "io_uring" | "iouring" | "uring" => Ok(Mode::IoUring),
            _ => Err(ConfigError::InvalidValue(
                "mode must be one of epoll|select|kqueue|iocp|io_uring",
            )),
        }
    }
}

/// Transport socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// `SOCK_STREAM`
    Stream,
    /// `SOCK_SEQPACKET` (unix-domain only)
    SeqPacket,
}

impl SocketType {
    /// `SOCK_*` value for socket(2).
    pub fn as_raw(&self) -> i32 {
        match self {
            SocketType::Stream => SockType::Stream as i32,
            SocketType::SeqPacket => SockType::SeqPacket as i32,
        }
    }
}

impl FromStr for SocketType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(SocketType::Stream),
            "seqpacket" => Ok(SocketType::SeqPacket),
            _ => Err(ConfigError::InvalidValue("socket_type must be stream|seqpacket")),
        }
    }
}

/// Settings consumed when a `Manager` is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSetting {
    /// Manager name; also names the reactor thread
    pub name: String,
    /// `"host:port"`, `"host"`, `"[v6]:port"` or a unix path; empty = no listener
    pub address: String,
    pub mode: Mode,
    /// Table capacity reserved at construction
    pub default_count: u32,
    /// Table ceiling
    pub max_count: u32,
    pub socket_type: SocketType,
    pub backlog: i32,
    /// Upper bound of one backend wait
    pub poll_timeout: Duration,
}

impl ManagerSetting {
    /// Library defaults, no environment lookups.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: defaults::ADDRESS.to_string(),
            mode: Mode::platform_default(),
            default_count: defaults::DEFAULT_COUNT,
            max_count: defaults::MAX_COUNT,
            socket_type: SocketType::Stream,
            backlog: defaults::BACKLOG,
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional, `<NAME>` is the upper-cased name):
    /// - `NETCORE_<NAME>_ADDRESS`
    /// - `NETCORE_<NAME>_MODE` - epoll|select|kqueue|iocp|io_uring
    /// - `NETCORE_<NAME>_DEFAULT_COUNT`
    /// - `NETCORE_<NAME>_MAX_COUNT`
    /// - `NETCORE_<NAME>_BACKLOG`
    /// - `NETCORE_<NAME>_POLL_TIMEOUT_MS`
    ///
    /// An unparsable mode keeps the platform default.
    pub fn from_env(name: &str) -> Self {
        let base = Self::new(name);
        Self {
            address: env_get_str(&env_key(name, "ADDRESS"), &base.address),
            mode: env_get_opt(&env_key(name, "MODE")).unwrap_or(base.mode),
            default_count: env_get(&env_key(name, "DEFAULT_COUNT"), base.default_count),
            max_count: env_get(&env_key(name, "MAX_COUNT"), base.max_count),
            backlog: env_get(&env_key(name, "BACKLOG"), base.backlog),
            poll_timeout: env_get_millis(&env_key(name, "POLL_TIMEOUT_MS"), base.poll_timeout),
            ..base
        }
    }

    // Builder methods

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn default_count(mut self, n: u32) -> Self {
        self.default_count = n;
        self
    }

    pub fn max_count(mut self, n: u32) -> Self {
        self.max_count = n;
        self
    }

    pub fn socket_type(mut self, t: SocketType) -> Self {
        self.socket_type = t;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    /// Whether a listening socket is bound on start.
    pub fn listens(&self) -> bool {
        !self.address.trim().is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue("name must not be empty"));
        }
        if self.default_count == 0 {
            return Err(ConfigError::InvalidValue("default_count must be > 0"));
        }
        if self.default_count > self.max_count {
            return Err(ConfigError::InvalidValue("default_count must be <= max_count"));
        }
        if self.max_count > MAX_CONN_ID {
            return Err(ConfigError::InvalidValue("max_count exceeds the connection id space"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::InvalidValue("backlog must be > 0"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("poll_timeout must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("Manager [{}] Configuration:", self.name);
        eprintln!("  address:        {:?}", self.address);
        eprintln!("  mode:           {}", self.mode);
        eprintln!("  default_count:  {}", self.default_count);
        eprintln!("  max_count:      {}", self.max_count);
        eprintln!("  socket_type:    {:?}", self.socket_type);
        eprintln!("  backlog:        {}", self.backlog);
        eprintln!("  poll_timeout:   {:?}", self.poll_timeout);
    }
}
