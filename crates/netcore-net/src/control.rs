//! Self-pipe used to interrupt the reactor's backend wait
//!
//! A non-blocking unix stream socket pair. Any thread writes a one-byte
//! command to the writer end; the read end is registered with the backend
//! under the control token, so the write makes the reactor's wait return.

use std::os::fd::{IntoRawFd, RawFd};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use netcore_core::{NetError, NetResult};

use crate::socket::{set_cloexec, Socket};

/// Wake only: the reactor re-polls.
pub const CMD_WAKE: u8 = b'w';

/// Stop the reactor loop.
pub const CMD_KILL: u8 = b'k';

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "dragonfly", target_os = "openbsd", target_os = "netbsd"))] {
        /// Set atomically with creation; nothing can fork in between.
        const PAIR_FLAGS: SockFlag = SockFlag::SOCK_CLOEXEC.union(SockFlag::SOCK_NONBLOCK);
    } else {
        const PAIR_FLAGS: SockFlag = SockFlag::empty();
    }
}

#[derive(Debug)]
pub struct ControlPipe {
    reader: Socket,
    writer: Socket,
}

impl ControlPipe {
    pub fn new() -> NetResult<Self> {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, PAIR_FLAGS).map_err(NetError::from)?;
        let reader = Socket::from_raw(a.into_raw_fd());
        let writer = Socket::from_raw(b.into_raw_fd());
        if PAIR_FLAGS.is_empty() {
            for s in [&reader, &writer] {
                set_cloexec(s.fd())?;
                s.set_nonblocking(true)?;
            }
        }
        Ok(Self { reader, writer })
    }

    #[inline]
    pub fn reader_fd(&self) -> RawFd {
        self.reader.fd()
    }

    /// Send one command byte. A full pipe already guarantees a wakeup, so
    /// would-block counts as success.
    pub fn send(&self, cmd: u8) -> NetResult<()> {
        match self.writer.send(&[cmd]) {
            Ok(_) | Err(NetError::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn wake(&self) -> NetResult<()> {
        self.send(CMD_WAKE)
    }

    pub fn kill(&self) -> NetResult<()> {
        self.send(CMD_KILL)
    }

    /// Read every pending command byte into `out`.
    pub fn drain(&self, out: &mut Vec<u8>) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        while let Ok(n) = self.reader.recv(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
        total
    }
}
