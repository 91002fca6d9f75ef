//! Owned OS socket handle
//!
//! `Socket` owns exactly one descriptor (or none). Closing is idempotent and
//! `Drop` closes whatever is still held. All data-path calls are
//! non-blocking once `set_nonblocking(true)` has been applied: they return
//! `Err(NetError::WouldBlock)` instead of parking the thread.

use std::mem;
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::time::Duration;

use netcore_core::{kdebug, NetError, NetResult};

use crate::address::Address;

/// Sentinel for "no descriptor".
pub const INVALID_SOCKET: RawFd = -1;

#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    pub const fn invalid() -> Self {
        Self { fd: INVALID_SOCKET }
    }

    /// Take ownership of `fd`.
    pub const fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    /// New close-on-exec socket.
    pub fn new(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> NetResult<Self> {
        let mut s = Self::invalid();
        s.create(domain, ty, protocol)?;
        Ok(s)
    }

    /// Replace the held descriptor (closing it first) with a new socket.
    pub fn create(&mut self, domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> NetResult<()> {
        self.close();
        let fd = open_socket(domain, ty, protocol)?;
        self.fd = fd;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            // No MSG_NOSIGNAL on Apple targets
            let _ = self.set_opt(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1 as libc::c_int);
        }
        Ok(())
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd != INVALID_SOCKET
    }

    /// Adopt `fd`, closing the previous descriptor.
    pub fn reset(&mut self, fd: RawFd) {
        if fd != self.fd {
            self.close();
        }
        self.fd = fd;
    }

    /// Give up ownership without closing.
    pub fn into_raw(mut self) -> RawFd {
        mem::replace(&mut self.fd, INVALID_SOCKET)
    }

    /// Close the descriptor. Returns `false` if nothing was open.
    pub fn close(&mut self) -> bool {
        let fd = mem::replace(&mut self.fd, INVALID_SOCKET);
        if fd == INVALID_SOCKET {
            return false;
        }
        unsafe { libc::close(fd) };
        true
    }

    pub fn bind(&self, addr: &Address) -> NetResult<()> {
        self.check()?;
        cvt(unsafe { libc::bind(self.fd, addr.as_ptr(), addr.socklen()) })?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> NetResult<()> {
        self.check()?;
        cvt(unsafe { libc::listen(self.fd, backlog) })?;
        Ok(())
    }

    /// Accept one pending peer. The returned descriptor is close-on-exec
    /// and unowned; wrap it with `Socket::from_raw` or `reset`.
    pub fn accept(&self) -> NetResult<(RawFd, Address)> {
        self.check()?;
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = accept_cloexec(self.fd, &mut storage, &mut len);
            if fd < 0 {
                let err = NetError::last_os();
                if err == NetError::Os(nix::errno::Errno::EINTR) {
                    continue;
                }
                return Err(err);
            }
            return match Address::from_raw(&storage, len) {
                Ok(addr) => Ok((fd, addr)),
                Err(e) => {
                    unsafe { libc::close(fd) };
                    Err(e)
                }
            };
        }
    }

    /// Non-blocking connect bounded by `timeout`.
    ///
    /// Creates a stream socket for the address family if none is held.
    /// On refusal, error or timeout the descriptor is closed and `false`
    /// returned; on success the socket is left non-blocking.
    pub fn connect(&mut self, addr: &Address, timeout: Duration) -> bool {
        match self.try_connect(addr, timeout) {
            Ok(()) => true,
            Err(e) => {
                kdebug!("connect {} failed: {}", addr, e);
                self.close();
                false
            }
        }
    }

    fn try_connect(&mut self, addr: &Address, timeout: Duration) -> NetResult<()> {
        if !self.is_valid() {
            self.create(addr.family().domain(), libc::SOCK_STREAM, 0)?;
        }
        self.set_nonblocking(true)?;

        let rc = unsafe { libc::connect(self.fd, addr.as_ptr(), addr.socklen()) };
        if rc == 0 {
            return Ok(());
        }
        match NetError::last_os() {
            NetError::Os(nix::errno::Errno::EINPROGRESS)
            | NetError::Os(nix::errno::Errno::EINTR)
            | NetError::WouldBlock => {}
            e => return Err(e),
        }

        let mut pfd = libc::pollfd { fd: self.fd, events: libc::POLLOUT, revents: 0 };
        let ms = poll_millis(timeout);
        let n = loop {
            let n = unsafe { libc::poll(&mut pfd, 1, ms) };
            if n < 0 && NetError::last_os() == NetError::Os(nix::errno::Errno::EINTR) {
                continue;
            }
            break n;
        };
        if n < 0 {
            return Err(NetError::last_os());
        }
        if n == 0 {
            return Err(NetError::Timeout);
        }
        match self.take_error()? {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Resolve `host` then `connect`.
    pub fn connect_host(&mut self, host: &str, port: u16, timeout: Duration) -> bool {
        match Address::new(host, port, false) {
            Ok(addr) => self.connect(&addr, timeout),
            Err(e) => {
                kdebug!("connect {}:{} failed: {}", host, port, e);
                false
            }
        }
    }

    pub fn send(&self, buf: &[u8]) -> NetResult<usize> {
        self.check()?;
        let n = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS) };
        if n < 0 {
            return Err(NetError::last_os());
        }
        Ok(n as usize)
    }

    /// `Ok(0)` means the peer closed its side.
    pub fn recv(&self, buf: &mut [u8]) -> NetResult<usize> {
        self.check()?;
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(NetError::last_os());
        }
        Ok(n as usize)
    }

    /// Read and discard until the socket would block or reports EOF/error.
    /// Returns the number of bytes thrown away.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 4096];
        let mut total = 0;
        while let Ok(n) = self.recv(&mut buf) {
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    pub fn set_nonblocking(&self, on: bool) -> NetResult<()> {
        self.check()?;
        let flags = cvt(unsafe { libc::fcntl(self.fd, libc::F_GETFL) })?;
        let next = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
        if next != flags {
            cvt(unsafe { libc::fcntl(self.fd, libc::F_SETFL, next) })?;
        }
        Ok(())
    }

    /// `Some(0)` makes `close` abortive (RST instead of FIN).
    pub fn set_linger(&self, secs: Option<u16>) -> NetResult<()> {
        let l = libc::linger {
            l_onoff: secs.is_some() as libc::c_int,
            l_linger: secs.unwrap_or(0) as libc::c_int,
        };
        self.set_opt(libc::SOL_SOCKET, libc::SO_LINGER, l)
    }

    pub fn set_reuse_addr(&self, on: bool) -> NetResult<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub fn set_nodelay(&self, on: bool) -> NetResult<()> {
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    pub fn send_buffer_size(&self) -> NetResult<usize> {
        self.get_opt::<libc::c_int>(libc::SOL_SOCKET, libc::SO_SNDBUF).map(|v| v as usize)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> NetResult<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_SNDBUF, size.min(libc::c_int::MAX as usize) as libc::c_int)
    }

    pub fn recv_buffer_size(&self) -> NetResult<usize> {
        self.get_opt::<libc::c_int>(libc::SOL_SOCKET, libc::SO_RCVBUF).map(|v| v as usize)
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> NetResult<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_RCVBUF, size.min(libc::c_int::MAX as usize) as libc::c_int)
    }

    /// Pending `SO_ERROR`, cleared by the read.
    pub fn take_error(&self) -> NetResult<Option<NetError>> {
        let code = self.get_opt::<libc::c_int>(libc::SOL_SOCKET, libc::SO_ERROR)?;
        if code == 0 {
            Ok(None)
        } else {
            Ok(Some(NetError::from_errno(nix::errno::Errno::from_raw(code))))
        }
    }

    /// `ENOTCONN` (peer already gone) counts as success.
    pub fn shutdown(&self, how: Shutdown) -> NetResult<()> {
        self.check()?;
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        match cvt(unsafe { libc::shutdown(self.fd, how) }) {
            Ok(_) | Err(NetError::Os(nix::errno::Errno::ENOTCONN)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn local_address(&self) -> NetResult<Address> {
        self.name_with(|fd, sa, len| unsafe { libc::getsockname(fd, sa, len) })
    }

    pub fn peer_address(&self) -> NetResult<Address> {
        self.name_with(|fd, sa, len| unsafe { libc::getpeername(fd, sa, len) })
    }

    fn name_with(
        &self,
        f: impl FnOnce(RawFd, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
    ) -> NetResult<Address> {
        self.check()?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(f(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
        Address::from_raw(&storage, len)
    }

    fn set_opt<T>(&self, level: libc::c_int, name: libc::c_int, value: T) -> NetResult<()> {
        self.check()?;
        cvt(unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    fn get_opt<T: Copy>(&self, level: libc::c_int, name: libc::c_int) -> NetResult<T> {
        self.check()?;
        let mut value: T = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<T>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(self.fd, level, name, &mut value as *mut T as *mut libc::c_void, &mut len)
        })?;
        Ok(value)
    }

    #[inline]
    fn check(&self) -> NetResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(NetError::Closed)
        }
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[inline]
fn cvt(rc: libc::c_int) -> NetResult<libc::c_int> {
    if rc < 0 {
        Err(NetError::last_os())
    } else {
        Ok(rc)
    }
}

/// `poll(2)` timeout for `d`, rounded up so a sub-millisecond wait is not
/// turned into an immediate return.
pub(crate) fn poll_millis(d: Duration) -> libc::c_int {
    d.as_nanos().div_ceil(1_000_000).min(libc::c_int::MAX as u128) as libc::c_int
}

/// Set `FD_CLOEXEC` on a descriptor.
pub(crate) fn set_cloexec(fd: RawFd) -> NetResult<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "dragonfly", target_os = "openbsd", target_os = "netbsd"))] {
        fn open_socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> NetResult<RawFd> {
            cvt(unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, protocol) })
        }

        fn accept_cloexec(fd: RawFd, storage: &mut libc::sockaddr_storage, len: &mut libc::socklen_t) -> RawFd {
            unsafe { libc::accept4(fd, storage as *mut _ as *mut libc::sockaddr, len, libc::SOCK_CLOEXEC) }
        }
    } else {
        fn open_socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> NetResult<RawFd> {
            let fd = cvt(unsafe { libc::socket(domain, ty, protocol) })?;
            if let Err(e) = set_cloexec(fd) {
                unsafe { libc::close(fd) };
                return Err(e);
            }
            Ok(fd)
        }

        fn accept_cloexec(fd: RawFd, storage: &mut libc::sockaddr_storage, len: &mut libc::socklen_t) -> RawFd {
            let new_fd = unsafe { libc::accept(fd, storage as *mut _ as *mut libc::sockaddr, len) };
            if new_fd >= 0 && set_cloexec(new_fd).is_err() {
                unsafe { libc::close(new_fd) };
                return -1;
            }
            new_fd
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_listener() -> (Socket, Address) {
        let s = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        s.set_reuse_addr(true).unwrap();
        s.bind(&Address::parse("127.0.0.1:0").unwrap()).unwrap();
        s.listen(16).unwrap();
        let addr = s.local_address().unwrap();
        (s, addr)
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut s = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        assert!(s.is_valid());
        assert!(s.close());
        assert!(!s.close());
        assert_eq!(s.fd(), INVALID_SOCKET);
        assert_eq!(s.send(b"x"), Err(NetError::Closed));
    }

    #[test]
    fn test_connect_accept_send_recv() {
        let (listener, addr) = loopback_listener();
        assert_ne!(addr.port(), 0);

        let mut client = Socket::invalid();
        assert!(client.connect(&addr, Duration::from_secs(2)));

        let (fd, peer) = listener.accept().unwrap();
        let server = Socket::from_raw(fd);
        assert_eq!(peer.host(), "127.0.0.1");
        server.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.recv(&mut buf), Err(NetError::WouldBlock));

        assert_eq!(client.send(b"ping").unwrap(), 4);
        // Loopback delivery is effectively immediate, but poll to be safe
        let mut got = 0;
        for _ in 0..200 {
            match server.recv(&mut buf) {
                Ok(n) => {
                    got = n;
                    break;
                }
                Err(NetError::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("recv: {}", e),
            }
        }
        assert_eq!(&buf[..got], b"ping");

        assert_eq!(client.peer_address().unwrap(), addr);
        client.shutdown(Shutdown::Write).unwrap();
        let mut eof = false;
        for _ in 0..200 {
            match server.recv(&mut buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => {}
                Err(NetError::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("recv: {}", e),
            }
        }
        assert!(eof);
    }

    #[test]
    fn test_connect_refused_fails_closed() {
        // Bind then drop to get a port with no listener
        let addr = {
            let (s, a) = loopback_listener();
            drop(s);
            a
        };
        let mut client = Socket::invalid();
        assert!(!client.connect(&addr, Duration::from_secs(2)));
        assert!(!client.is_valid());
    }

    #[test]
    fn test_poll_millis_rounds_up() {
        assert_eq!(poll_millis(Duration::ZERO), 0);
        assert_eq!(poll_millis(Duration::from_micros(1)), 1);
        assert_eq!(poll_millis(Duration::from_micros(1500)), 2);
        assert_eq!(poll_millis(Duration::from_millis(250)), 250);
        assert_eq!(poll_millis(Duration::from_secs(u64::MAX)), libc::c_int::MAX);
    }

    #[test]
    fn test_options() {
        let s = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        s.set_nodelay(true).unwrap();
        s.set_linger(Some(0)).unwrap();
        s.set_recv_buffer_size(64 * 1024).unwrap();
        assert!(s.recv_buffer_size().unwrap() > 0);
        assert!(s.send_buffer_size().unwrap() > 0);
        assert_eq!(s.take_error().unwrap(), None);
    }

    #[test]
    fn test_create_replaces_handle() {
        let mut s = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        s.create(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
        assert!(s.is_valid());
        assert!(s.local_address().unwrap().unix_path().is_some());
        let raw = s.into_raw();
        assert!(raw >= 0);
        unsafe { libc::close(raw) };
    }
}
