//! Portable select(2) backend
//!
//! The read and write sets are rebuilt every pass from a snapshot of the
//! registration map, so changes from other threads only take effect on the
//! next pass. Descriptors at or above `FD_SETSIZE` cannot be watched.

use std::collections::BTreeMap;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;

use netcore_core::{kdebug, ConnId, Mode, NetError, NetResult, Token};

use super::{handle_input, Backend, EventSink, PassStats, PrepareOptions, Readiness};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reg {
    token: Token,
    write: bool,
}

pub struct SelectBackend {
    regs: Mutex<BTreeMap<RawFd, Reg>>,
    running: AtomicBool,
}

impl SelectBackend {
    pub fn new() -> Self {
        Self { regs: Mutex::new(BTreeMap::new()), running: AtomicBool::new(false) }
    }

    fn register(&self, fd: RawFd, token: Token) -> NetResult<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
            return Err(NetError::Unsupported("select: descriptor beyond FD_SETSIZE"));
        }
        self.regs.lock().unwrap().insert(fd, Reg { token, write: false });
        Ok(())
    }

    pub fn registered(&self) -> usize {
        self.regs.lock().unwrap().len()
    }

    /// Registrations currently watched for writability.
    pub fn write_watched(&self) -> usize {
        self.regs.lock().unwrap().values().filter(|r| r.write).count()
    }
}

impl Default for SelectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SelectBackend {
    fn mode(&self) -> Mode {
        Mode::Select
    }

    fn prepare(&self, opts: &PrepareOptions) -> NetResult<()> {
        self.regs.lock().unwrap().clear();
        if let Some(listen) = opts.listen_fd {
            self.register(listen, Token::listen(listen))?;
        }
        self.register(opts.control_fd, Token::control(opts.control_fd))?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn work(&self, sink: &dyn EventSink, timeout: Duration) -> NetResult<PassStats> {
        if !self.running.load(Ordering::Acquire) {
            return Err(NetError::NotRunning);
        }

        let snapshot: Vec<(RawFd, Reg)> = self.regs.lock().unwrap().iter().map(|(f, r)| (*f, *r)).collect();
        let mut rset: libc::fd_set = unsafe { mem::zeroed() };
        let mut wset: libc::fd_set = unsafe { mem::zeroed() };
        let mut max_fd = -1;
        unsafe {
            libc::FD_ZERO(&mut rset);
            libc::FD_ZERO(&mut wset);
        }
        for (fd, reg) in &snapshot {
            unsafe { libc::FD_SET(*fd, &mut rset) };
            if reg.write {
                unsafe { libc::FD_SET(*fd, &mut wset) };
            }
            max_fd = max_fd.max(*fd);
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as _,
            tv_usec: timeout.subsec_micros() as _,
        };
        let n = unsafe {
            libc::select(max_fd + 1, &mut rset, &mut wset, std::ptr::null_mut(), &mut tv)
        };
        if n < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok(PassStats::default()),
                // A descriptor was closed between snapshot and wait
                Errno::EBADF => {
                    kdebug!("select: stale descriptor in fd set");
                    Ok(PassStats::default())
                }
                e => Err(NetError::Os(e)),
            };
        }

        let ready: Vec<Readiness> = snapshot
            .into_iter()
            .filter(|(fd, _)| unsafe { libc::FD_ISSET(*fd, &rset) || libc::FD_ISSET(*fd, &wset) })
            .map(|(_, reg)| Readiness::readable(reg.token))
            .collect();

        Ok(handle_input(sink, &ready))
    }

    fn off(&self) {
        self.running.store(false, Ordering::Release);
        self.regs.lock().unwrap().clear();
    }

    fn sock_add(&self, fd: RawFd, id: ConnId) -> NetResult<()> {
        self.register(fd, Token::conn(fd, id))
    }

    fn sock_remove(&self, fd: RawFd, id: ConnId) -> NetResult<()> {
        let mut regs = self.regs.lock().unwrap();
        if regs.get(&fd).map(|r| r.token) == Some(Token::conn(fd, id)) {
            regs.remove(&fd);
        }
        Ok(())
    }

    fn sock_want_write(&self, fd: RawFd, id: ConnId, on: bool) -> NetResult<()> {
        let mut regs = self.regs.lock().unwrap();
        if let Some(reg) = regs.get_mut(&fd).filter(|r| r.token == Token::conn(fd, id)) {
            reg.write = on;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_descriptor_beyond_setsize() {
        let b = SelectBackend::new();
        let id = ConnId::new(1).unwrap();
        let big = libc::FD_SETSIZE as RawFd;
        assert!(matches!(b.sock_add(big, id), Err(NetError::Unsupported(_))));
        assert!(b.sock_add(5, id).is_ok());
        assert_eq!(b.registered(), 1);
    }

    #[test]
    fn test_remove_only_matching_token() {
        let b = SelectBackend::new();
        let one = ConnId::new(1).unwrap();
        let two = ConnId::new(2).unwrap();
        b.sock_add(7, two).unwrap();
        b.sock_remove(7, one).unwrap();
        assert_eq!(b.registered(), 1);
        b.sock_remove(7, two).unwrap();
        assert_eq!(b.registered(), 0);
    }

    #[test]
    fn test_write_interest_follows_token() {
        let b = SelectBackend::new();
        let one = ConnId::new(1).unwrap();
        let two = ConnId::new(2).unwrap();
        b.sock_add(9, two).unwrap();
        b.sock_want_write(9, one, true).unwrap();
        assert_eq!(b.write_watched(), 0);
        b.sock_want_write(9, two, true).unwrap();
        assert_eq!(b.write_watched(), 1);
        b.sock_want_write(9, two, false).unwrap();
        assert_eq!(b.write_watched(), 0);
        b.sock_want_write(11, two, true).unwrap();
        assert_eq!(b.registered(), 1);
    }

    #[test]
    fn test_writable_socket_is_reported() {
        use crate::control::ControlPipe;
        use std::cell::RefCell;
        use std::os::fd::AsRawFd;
        use std::os::unix::net::UnixStream;

        struct Sink<'a>(&'a ControlPipe, RefCell<Vec<ConnId>>);
        impl EventSink for Sink<'_> {
            fn accept(&self) -> bool {
                false
            }
            fn enqueue(&self, id: ConnId) {
                self.1.borrow_mut().push(id);
            }
            fn remove(&self, _: ConnId) {}
            fn owns_fd(&self, _: ConnId, _: RawFd) -> bool {
                true
            }
            fn drain_control(&self, out: &mut Vec<u8>) -> usize {
                self.0.drain(out)
            }
            fn request_stop(&self) {}
        }

        let pipe = ControlPipe::new().unwrap();
        let b = SelectBackend::new();
        b.prepare(&PrepareOptions { max_count: 4, listen_fd: None, control_fd: pipe.reader_fd() }).unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        let id = ConnId::new(4).unwrap();
        b.sock_add(local.as_raw_fd(), id).unwrap();

        let sink = Sink(&pipe, RefCell::new(Vec::new()));
        b.work(&sink, Duration::from_millis(10)).unwrap();
        assert!(sink.1.borrow().is_empty());

        b.sock_want_write(local.as_raw_fd(), id, true).unwrap();
        b.work(&sink, Duration::from_secs(5)).unwrap();
        assert_eq!(sink.1.borrow().as_slice(), &[id]);
    }

    #[test]
    fn test_not_running_before_prepare() {
        struct Nop;
        impl EventSink for Nop {
            fn accept(&self) -> bool {
                false
            }
            fn enqueue(&self, _: ConnId) {}
            fn remove(&self, _: ConnId) {}
            fn owns_fd(&self, _: ConnId, _: RawFd) -> bool {
                false
            }
            fn drain_control(&self, _: &mut Vec<u8>) -> usize {
                0
            }
            fn request_stop(&self) {}
        }
        let b = SelectBackend::new();
        assert_eq!(b.work(&Nop, Duration::from_millis(1)), Err(NetError::NotRunning));
    }
}
