//! io_uring poll backend (Linux)
//!
//! Readiness through multishot `PollAdd`, one per descriptor, keyed by the
//! packed token. Write interest is a one-shot `POLLOUT` poll tagged with
//! `WRITE_BIT`; it is not re-armed, the next stalled pass asks again. The ring is only touched by the reactor thread inside
//! `work()`; `sock_add`/`sock_remove` from any thread go through a
//! lock-free op queue applied at the start of the next pass.
//!
//! ```text
//!   any thread               reactor (work)
//!   ──────────               ──────────────
//!   sock_add ─► ops.push     apply ops → SQEs
//!   sock_remove ─► ops.push  submit_with_args(1, timeout)
//!   sock_want_write ─► ops.push
//!                            reap CQEs → readiness
//!                            re-arm polls the kernel ended
//!                            handle_input
//! ```

use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use io_uring::{cqueue, opcode, squeue, types, IoUring};

use netcore_core::{kdebug, ConnId, Mode, NetError, NetResult, Token};

use super::{handle_input, Backend, EventSink, PassStats, PrepareOptions, Readiness};

/// user_data of `PollRemove` SQEs; fd -1 is never registered.
const REMOVE_TAG: u64 = u64::MAX;

/// Marks the user_data of a `POLLOUT` poll. Conn tokens keep a non-negative
/// fd in the high half, so the bit is otherwise always clear.
const WRITE_BIT: u64 = 1 << 63;

enum RingOp {
    Add(RawFd, Token),
    Write(RawFd, Token),
    /// Cancel the poll with this user_data
    Remove(u64),
}

pub struct UringBackend {
    ring: Mutex<Option<IoUring>>,
    ops: SegQueue<RingOp>,
}

fn poll_entry(fd: RawFd, token: Token) -> squeue::Entry {
    opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
        .multi(true)
        .build()
        .user_data(token.0)
}

fn write_entry(fd: RawFd, token: Token) -> squeue::Entry {
    opcode::PollAdd::new(types::Fd(fd), libc::POLLOUT as u32)
        .build()
        .user_data(token.0 | WRITE_BIT)
}

fn remove_entry(user_data: u64) -> squeue::Entry {
    opcode::PollRemove::new(user_data).build().user_data(REMOVE_TAG)
}

/// Queue one SQE, submitting once to make room if the ring is full.
fn push(ring: &mut IoUring, entry: &squeue::Entry) -> NetResult<()> {
    if unsafe { ring.submission().push(entry) }.is_ok() {
        return Ok(());
    }
    ring.submit().map_err(NetError::from)?;
    unsafe { ring.submission().push(entry) }.map_err(|_| NetError::Full)
}

impl UringBackend {
    pub fn new() -> Self {
        Self { ring: Mutex::new(None), ops: SegQueue::new() }
    }

    fn apply_ops(&self, ring: &mut IoUring) -> NetResult<()> {
        while let Some(op) = self.ops.pop() {
            match op {
                RingOp::Add(fd, token) => push(ring, &poll_entry(fd, token))?,
                RingOp::Write(fd, token) => push(ring, &write_entry(fd, token))?,
                RingOp::Remove(data) => push(ring, &remove_entry(data))?,
            }
        }
        Ok(())
    }
}

impl Default for UringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for UringBackend {
    fn mode(&self) -> Mode {
        Mode::IoUring
    }

    fn prepare(&self, opts: &PrepareOptions) -> NetResult<()> {
        let entries = (opts.max_count.saturating_add(2)).next_power_of_two().clamp(64, 4096);
        let mut ring = IoUring::new(entries).map_err(NetError::from)?;

        if let Some(listen) = opts.listen_fd {
            push(&mut ring, &poll_entry(listen, Token::listen(listen)))?;
        }
        push(&mut ring, &poll_entry(opts.control_fd, Token::control(opts.control_fd)))?;
        ring.submit().map_err(NetError::from)?;

        while self.ops.pop().is_some() {}
        *self.ring.lock().unwrap() = Some(ring);
        kdebug!("io_uring prepared entries={}", entries);
        Ok(())
    }

    fn work(&self, sink: &dyn EventSink, timeout: Duration) -> NetResult<PassStats> {
        let ready = {
            let mut guard = self.ring.lock().unwrap();
            let ring = guard.as_mut().ok_or(NetError::NotRunning)?;
            self.apply_ops(ring)?;

            let ts = types::Timespec::new().sec(timeout.as_secs()).nsec(timeout.subsec_nanos());
            let args = types::SubmitArgs::new().timespec(&ts);
            if let Err(e) = ring.submitter().submit_with_args(1, &args) {
                match e.raw_os_error() {
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                    _ => return Err(NetError::from(e)),
                }
            }

            let reaped: Vec<(u64, i32, u32)> =
                ring.completion().map(|cqe| (cqe.user_data(), cqe.result(), cqe.flags())).collect();

            let mut ready = Vec::with_capacity(reaped.len());
            for (data, res, flags) in reaped {
                if data == REMOVE_TAG || res == -libc::ECANCELED {
                    continue;
                }
                if data & WRITE_BIT != 0 {
                    let token = Token(data & !WRITE_BIT);
                    ready.push(Readiness { token, error: res < 0, hangup: false });
                    continue;
                }
                let token = Token(data);
                if res < 0 {
                    ready.push(Readiness { token, error: true, hangup: false });
                    continue;
                }
                let mask = res as u32;
                ready.push(Readiness {
                    token,
                    error: mask & libc::POLLERR as u32 != 0,
                    hangup: mask & (libc::POLLHUP | libc::POLLRDHUP) as u32 != 0,
                });

                // The kernel ended this multishot poll; arm a fresh one
                if !cqueue::more(flags) {
                    let still_owned = match token.conn_id() {
                        Some(id) => sink.owns_fd(id, token.fd()),
                        None => true,
                    };
                    if still_owned {
                        push(ring, &poll_entry(token.fd(), token))?;
                    }
                }
            }
            ready
        };

        Ok(handle_input(sink, &ready))
    }

    fn off(&self) {
        self.ring.lock().unwrap().take();
        while self.ops.pop().is_some() {}
    }

    fn sock_add(&self, fd: RawFd, id: ConnId) -> NetResult<()> {
        self.ops.push(RingOp::Add(fd, Token::conn(fd, id)));
        Ok(())
    }

    fn sock_remove(&self, fd: RawFd, id: ConnId) -> NetResult<()> {
        let token = Token::conn(fd, id);
        self.ops.push(RingOp::Remove(token.0));
        self.ops.push(RingOp::Remove(token.0 | WRITE_BIT));
        Ok(())
    }

    fn sock_want_write(&self, fd: RawFd, id: ConnId, on: bool) -> NetResult<()> {
        let token = Token::conn(fd, id);
        self.ops.push(if on { RingOp::Write(fd, token) } else { RingOp::Remove(token.0 | WRITE_BIT) });
        Ok(())
    }
}
