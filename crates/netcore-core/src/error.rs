//! Error types for netcore

use core::fmt;
use nix::errno::Errno;

/// Result type for socket, address and manager operations
pub type NetResult<T> = Result<T, NetError>;

/// Result type for executor operations
pub type ExecResult<T> = Result<T, ExecError>;

/// Errors from sockets, addresses, backends and the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Operation would block (EAGAIN/EWOULDBLOCK). Not a failure.
    WouldBlock,

    /// Socket handle is closed or invalid
    Closed,

    /// Connect or wait timed out
    Timeout,

    /// Address text or buffer could not be used
    InvalidAddress(String),

    /// Facility not available on this platform
    Unsupported(&'static str),

    /// Connection table is full
    Full,

    /// Backend or manager is not running
    NotRunning,

    /// OS error with errno
    Os(Errno),

    /// Framing violation
    Codec(CodecError),

    /// Invalid setting
    Config(ConfigError),
}

impl NetError {
    /// Map the calling thread's errno, folding EAGAIN into `WouldBlock`.
    pub fn last_os() -> Self {
        Self::from_errno(Errno::last())
    }

    pub fn from_errno(e: Errno) -> Self {
        if e == Errno::EAGAIN || e == Errno::EWOULDBLOCK {
            NetError::WouldBlock
        } else {
            NetError::Os(e)
        }
    }

    /// Would-block and EINTR mean "no progress this pass", not failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::WouldBlock | NetError::Os(Errno::EINTR))
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::WouldBlock => write!(f, "operation would block"),
            NetError::Closed => write!(f, "socket closed"),
            NetError::Timeout => write!(f, "operation timed out"),
            NetError::InvalidAddress(s) => write!(f, "invalid address: {}", s),
            NetError::Unsupported(what) => write!(f, "{} not supported on this platform", what),
            NetError::Full => write!(f, "connection table full"),
            NetError::NotRunning => write!(f, "not running"),
            NetError::Os(e) => write!(f, "OS error: {} ({})", e, *e as i32),
            NetError::Codec(e) => write!(f, "codec error: {}", e),
            NetError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<Errno> for NetError {
    fn from(e: Errno) -> Self {
        NetError::from_errno(e)
    }
}

impl From<CodecError> for NetError {
    fn from(e: CodecError) -> Self {
        NetError::Codec(e)
    }
}

impl From<ConfigError> for NetError {
    fn from(e: ConfigError) -> Self {
        NetError::Config(e)
    }
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => NetError::from_errno(Errno::from_raw(code)),
            None if e.kind() == std::io::ErrorKind::WouldBlock => NetError::WouldBlock,
            None => NetError::Os(Errno::EIO),
        }
    }
}

/// Errors from executors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// Executor was shut down; the task was dropped without running
    ShutDown,

    /// OS thread could not be spawned
    SpawnFailed,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::ShutDown => write!(f, "executor shut down"),
            ExecError::SpawnFailed => write!(f, "failed to spawn executor thread"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Framing errors reported by a `Codec`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Declared frame length exceeds the codec's limit
    FrameTooLarge { len: usize, max: usize },

    /// Byte stream does not follow the framing format
    Malformed(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::FrameTooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds limit {}", len, max)
            }
            CodecError::Malformed(why) => write!(f, "malformed frame: {}", why),
        }
    }
}

impl std::error::Error for CodecError {}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", NetError::Full), "connection table full");
        assert_eq!(
            format!("{}", NetError::Codec(CodecError::FrameTooLarge { len: 10, max: 4 })),
            "codec error: frame of 10 bytes exceeds limit 4"
        );
        assert_eq!(
            format!("{}", ConfigError::InvalidValue("max_count must be > 0")),
            "Invalid config: max_count must be > 0"
        );
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(NetError::from(Errno::EAGAIN), NetError::WouldBlock);
        assert_eq!(NetError::from(Errno::ECONNRESET), NetError::Os(Errno::ECONNRESET));
        assert!(NetError::Os(Errno::EINTR).is_transient());
        assert!(!NetError::Closed.is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from_raw_os_error(libc_econnrefused());
        assert_eq!(NetError::from(io), NetError::Os(Errno::ECONNREFUSED));
    }

    fn libc_econnrefused() -> i32 {
        Errno::ECONNREFUSED as i32
    }
}
