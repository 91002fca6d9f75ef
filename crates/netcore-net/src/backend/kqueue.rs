//! kqueue backend (BSD family and Apple targets)
//!
//! One `EVFILT_READ` filter per descriptor with the packed token in `udata`,
//! plus a one-shot `EVFILT_WRITE` filter while a flush is stalled.

use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;

use netcore_core::{kdebug, ConnId, Mode, NetError, NetResult, Token};

use super::{handle_input, Backend, EventSink, PassStats, PrepareOptions, Readiness};

const MAX_EVENTS: usize = 1024;

pub struct KqueueBackend {
    kq: AtomicI32,
    events: Mutex<Vec<libc::kevent>>,
}

fn change(fd: RawFd, filter: i16, flags: u32, token: Token) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.udata = token.0 as usize as _;
    ev
}

impl KqueueBackend {
    pub fn new() -> Self {
        Self { kq: AtomicI32::new(-1), events: Mutex::new(Vec::new()) }
    }

    fn apply(&self, ev: libc::kevent) -> NetResult<()> {
        let kq = self.kq.load(Ordering::Acquire);
        if kq < 0 {
            return Err(NetError::NotRunning);
        }
        let rc = unsafe { libc::kevent(kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            return Err(NetError::last_os());
        }
        Ok(())
    }

    fn add(&self, fd: RawFd, token: Token) -> NetResult<()> {
        self.apply(change(fd, libc::EVFILT_READ as i16, (libc::EV_ADD | libc::EV_ENABLE) as u32, token))
    }

    /// Delete one filter; a descriptor that already lost it is fine.
    fn delete(&self, fd: RawFd, filter: i16, token: Token) -> NetResult<()> {
        match self.apply(change(fd, filter, libc::EV_DELETE as u32, token)) {
            Err(NetError::Os(Errno::ENOENT)) | Err(NetError::Os(Errno::EBADF)) => Ok(()),
            r => r,
        }
    }
}

impl Default for KqueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for KqueueBackend {
    fn mode(&self) -> Mode {
        Mode::Kqueue
    }

    fn prepare(&self, opts: &PrepareOptions) -> NetResult<()> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(NetError::last_os());
        }
        crate::socket::set_cloexec(fd)?;
        let old = self.kq.swap(fd, Ordering::AcqRel);
        if old >= 0 {
            unsafe { libc::close(old) };
        }

        let cap = (opts.max_count as usize + 2).min(MAX_EVENTS);
        *self.events.lock().unwrap() = vec![unsafe { std::mem::zeroed() }; cap];

        if let Some(listen) = opts.listen_fd {
            self.add(listen, Token::listen(listen))?;
        }
        self.add(opts.control_fd, Token::control(opts.control_fd))?;
        kdebug!("kqueue prepared fd={} events={}", fd, cap);
        Ok(())
    }

    fn work(&self, sink: &dyn EventSink, timeout: Duration) -> NetResult<PassStats> {
        let kq = self.kq.load(Ordering::Acquire);
        if kq < 0 {
            return Err(NetError::NotRunning);
        }
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };

        let ready: Vec<Readiness> = {
            let mut events = self.events.lock().unwrap();
            let n = unsafe {
                libc::kevent(kq, ptr::null(), 0, events.as_mut_ptr(), events.len() as _, &ts)
            };
            if n < 0 {
                return match Errno::last() {
                    Errno::EINTR => Ok(PassStats::default()),
                    e => Err(NetError::Os(e)),
                };
            }
            events[..n as usize]
                .iter()
                .map(|ev| {
                    let flags = ev.flags as u32;
                    Readiness {
                        token: Token(ev.udata as usize as u64),
                        error: flags & libc::EV_ERROR as u32 != 0,
                        hangup: flags & libc::EV_EOF as u32 != 0,
                    }
                })
                .collect()
        };

        Ok(handle_input(sink, &ready))
    }

    fn off(&self) {
        let fd = self.kq.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }

    fn sock_add(&self, fd: RawFd, id: ConnId) -> NetResult<()> {
        self.add(fd, Token::conn(fd, id))
    }

    fn sock_remove(&self, fd: RawFd, id: ConnId) -> NetResult<()> {
        let token = Token::conn(fd, id);
        self.delete(fd, libc::EVFILT_WRITE as i16, token)?;
        self.delete(fd, libc::EVFILT_READ as i16, token)
    }

    fn sock_want_write(&self, fd: RawFd, id: ConnId, on: bool) -> NetResult<()> {
        let token = Token::conn(fd, id);
        if !on {
            return self.delete(fd, libc::EVFILT_WRITE as i16, token);
        }
        let flags = (libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT) as u32;
        match self.apply(change(fd, libc::EVFILT_WRITE as i16, flags, token)) {
            Err(NetError::Os(Errno::EBADF)) => Ok(()),
            r => r,
        }
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        self.off();
    }
}
