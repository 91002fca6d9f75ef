//! Level-triggered epoll backend

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;

use netcore_core::{kdebug, ConnId, Mode, NetError, NetResult, Token};

use super::{handle_input, timeout_ms, Backend, EventSink, PassStats, PrepareOptions, Readiness};

/// Upper bound on events fetched by one `epoll_wait`.
const MAX_EVENTS: usize = 1024;

const INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;

/// `INTEREST` plus writability, while a flush is stalled.
const INTEREST_WRITE: u32 = INTEREST | libc::EPOLLOUT as u32;

pub struct EpollBackend {
    epfd: AtomicI32,
    events: Mutex<Vec<libc::epoll_event>>,
}

impl EpollBackend {
    pub fn new() -> Self {
        Self { epfd: AtomicI32::new(-1), events: Mutex::new(Vec::new()) }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, events: u32) -> NetResult<()> {
        let epfd = self.epfd.load(Ordering::Acquire);
        if epfd < 0 {
            return Err(NetError::NotRunning);
        }
        let mut ev = libc::epoll_event { events, u64: token.0 };
        if unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) } < 0 {
            return Err(NetError::last_os());
        }
        Ok(())
    }
}

impl Default for EpollBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for EpollBackend {
    fn mode(&self) -> Mode {
        Mode::Epoll
    }

    fn prepare(&self, opts: &PrepareOptions) -> NetResult<()> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(NetError::last_os());
        }
        let old = self.epfd.swap(fd, Ordering::AcqRel);
        if old >= 0 {
            unsafe { libc::close(old) };
        }

        let cap = (opts.max_count as usize + 2).min(MAX_EVENTS);
        *self.events.lock().unwrap() = vec![libc::epoll_event { events: 0, u64: 0 }; cap];

        if let Some(listen) = opts.listen_fd {
            self.ctl(libc::EPOLL_CTL_ADD, listen, Token::listen(listen), INTEREST)?;
        }
        self.ctl(libc::EPOLL_CTL_ADD, opts.control_fd, Token::control(opts.control_fd), INTEREST)?;
        kdebug!("epoll prepared fd={} events={}", fd, cap);
        Ok(())
    }

    fn work(&self, sink: &dyn EventSink, timeout: Duration) -> NetResult<PassStats> {
        let epfd = self.epfd.load(Ordering::Acquire);
        if epfd < 0 {
            return Err(NetError::NotRunning);
        }

        let ready: Vec<Readiness> = {
            let mut events = self.events.lock().unwrap();
            let n = unsafe {
                libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as libc::c_int, timeout_ms(timeout))
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
                    let bits = ev.events;
                    let data = ev.u64;
                    Readiness {
                        token: Token(data),
                        error: bits & libc::EPOLLERR as u32 != 0,
                        hangup: bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
                    }
                })
                .collect()
        };

        Ok(handle_input(sink, &ready))
    }

    fn off(&self) {
        let fd = self.epfd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }

    fn sock_add(&self, fd: RawFd, id: ConnId) -> NetResult<()> {
        let token = Token::conn(fd, id);
        match self.ctl(libc::EPOLL_CTL_ADD, fd, token, INTEREST) {
            Err(NetError::Os(Errno::EEXIST)) => self.ctl(libc::EPOLL_CTL_MOD, fd, token, INTEREST),
            r => r,
        }
    }

    fn sock_remove(&self, fd: RawFd, id: ConnId) -> NetResult<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, Token::conn(fd, id), INTEREST) {
            Err(NetError::Os(Errno::ENOENT)) | Err(NetError::Os(Errno::EBADF)) => Ok(()),
            r => r,
        }
    }

    fn sock_want_write(&self, fd: RawFd, id: ConnId, on: bool) -> NetResult<()> {
        let events = if on { INTEREST_WRITE } else { INTEREST };
        match self.ctl(libc::EPOLL_CTL_MOD, fd, Token::conn(fd, id), events) {
            Err(NetError::Os(Errno::ENOENT)) | Err(NetError::Os(Errno::EBADF)) => Ok(()),
            r => r,
        }
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        self.off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlPipe;
    use std::cell::RefCell;

    struct Sink<'a> {
        pipe: &'a ControlPipe,
        stopped: RefCell<bool>,
        queued: RefCell<Vec<ConnId>>,
    }

    impl<'a> Sink<'a> {
        fn new(pipe: &'a ControlPipe) -> Self {
            Self { pipe, stopped: RefCell::new(false), queued: RefCell::new(Vec::new()) }
        }
    }

    impl EventSink for Sink<'_> {
        fn accept(&self) -> bool {
            false
        }
        fn enqueue(&self, id: ConnId) {
            self.queued.borrow_mut().push(id);
        }
        fn remove(&self, _id: ConnId) {}
        fn owns_fd(&self, _id: ConnId, _fd: RawFd) -> bool {
            true
        }
        fn drain_control(&self, out: &mut Vec<u8>) -> usize {
            self.pipe.drain(out)
        }
        fn request_stop(&self) {
            *self.stopped.borrow_mut() = true;
        }
    }

    #[test]
    fn test_control_kill_wakes_wait() {
        let pipe = ControlPipe::new().unwrap();
        let b = EpollBackend::new();
        b.prepare(&PrepareOptions { max_count: 4, listen_fd: None, control_fd: pipe.reader_fd() }).unwrap();

        let sink = Sink::new(&pipe);
        let idle = b.work(&sink, Duration::from_millis(10)).unwrap();
        assert_eq!(idle.events, 0);

        pipe.kill().unwrap();
        let stats = b.work(&sink, Duration::from_secs(5)).unwrap();
        assert!(stats.stop_requested);
        assert!(*sink.stopped.borrow());

        b.off();
        b.off();
        assert_eq!(b.work(&sink, Duration::from_millis(1)), Err(NetError::NotRunning));
    }

    #[test]
    fn test_remove_unknown_is_ok() {
        let pipe = ControlPipe::new().unwrap();
        let b = EpollBackend::new();
        b.prepare(&PrepareOptions { max_count: 4, listen_fd: None, control_fd: pipe.reader_fd() }).unwrap();
        let id = ConnId::new(1).unwrap();
        assert_eq!(b.sock_remove(pipe.reader_fd() + 1000, id), Ok(()));
        assert_eq!(b.sock_want_write(pipe.reader_fd() + 1000, id, true), Ok(()));
    }

    #[test]
    fn test_write_interest_reports_writable() {
        use std::os::fd::AsRawFd;
        use std::os::unix::net::UnixStream;

        let pipe = ControlPipe::new().unwrap();
        let b = EpollBackend::new();
        b.prepare(&PrepareOptions { max_count: 4, listen_fd: None, control_fd: pipe.reader_fd() }).unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        let id = ConnId::new(3).unwrap();
        b.sock_add(local.as_raw_fd(), id).unwrap();

        let sink = Sink::new(&pipe);
        b.work(&sink, Duration::from_millis(10)).unwrap();
        assert!(sink.queued.borrow().is_empty());

        b.sock_want_write(local.as_raw_fd(), id, true).unwrap();
        b.work(&sink, Duration::from_secs(5)).unwrap();
        assert_eq!(sink.queued.borrow().as_slice(), &[id]);

        sink.queued.borrow_mut().clear();
        b.sock_want_write(local.as_raw_fd(), id, false).unwrap();
        b.work(&sink, Duration::from_millis(10)).unwrap();
        assert!(sink.queued.borrow().is_empty());
    }
}
