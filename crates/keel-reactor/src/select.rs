use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io::{self, Read, Write},
    mem,
    os::{fd::AsRawFd, fd::RawFd, unix::net::UnixStream},
    panic::{catch_unwind, AssertUnwindSafe},
    ptr,
    time::{Duration, Instant},
};

use tracing::warn;

use crate::{
    panic_message, signal::SignalHub, timer::TimerWheel, ErrorHandler, IoCallback, Reactor,
    ReactorError, SignalCallback, TimerCallback, TimerId,
};

#[derive(Default)]
struct IoSlot {
    read: Option<IoCallback>,
    write: Option<IoCallback>,
}

/// Portable `select(2)` fallback driver.
///
/// Rebuilds the fd sets on every iteration and waits at most until the next
/// timer deadline; with no fds registered the wait degrades to a plain
/// sleep. Semantically interchangeable with [`crate::PollReactor`].
pub struct SelectReactor {
    io: RefCell<HashMap<RawFd, IoSlot>>,
    timers: RefCell<TimerWheel>,
    signals: SignalHub,
    wake_read: RefCell<UnixStream>,
    wake_write: UnixStream,
    stopped: Cell<bool>,
    error_handler: RefCell<Option<ErrorHandler>>,
}

impl SelectReactor {
    pub fn new() -> Result<Self, ReactorError> {
        let (wake_read, wake_write) = UnixStream::pair().map_err(ReactorError::Io)?;
        wake_read.set_nonblocking(true).map_err(ReactorError::Io)?;
        wake_write.set_nonblocking(true).map_err(ReactorError::Io)?;
        Ok(Self {
            io: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerWheel::new()),
            signals: SignalHub::new().map_err(ReactorError::Io)?,
            wake_read: RefCell::new(wake_read),
            wake_write,
            stopped: Cell::new(false),
            error_handler: RefCell::new(None),
        })
    }

    fn guard(&self, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            let msg = panic_message(payload.as_ref());
            let handler = self.error_handler.borrow().clone();
            match handler {
                Some(handler) => handler(&msg),
                None => warn!(%msg, "callback panicked with no error handler installed"),
            }
        }
    }

    fn set_io(&self, fd: RawFd, write_side: bool, cb: Option<IoCallback>) -> bool {
        if fd >= libc::FD_SETSIZE as RawFd {
            warn!(fd, "select: fd beyond FD_SETSIZE cannot be watched");
            return false;
        }
        let mut io = self.io.borrow_mut();
        let slot = io.entry(fd).or_default();
        let previous = if write_side {
            mem::replace(&mut slot.write, cb)
        } else {
            mem::replace(&mut slot.read, cb)
        };
        if slot.read.is_none() && slot.write.is_none() {
            io.remove(&fd);
        }
        previous.is_some()
    }

    fn drain_wake_pipe(&self) {
        let mut scratch = [0_u8; 64];
        loop {
            match self.wake_read.borrow_mut().read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn has_pending_work(&self) -> bool {
        self.timers.borrow().count() > 0
            || !self.io.borrow().is_empty()
            || self.signals.len() > 0
    }
}

fn to_timeval(wait: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: wait.as_secs() as libc::time_t,
        tv_usec: libc::suseconds_t::from(wait.subsec_micros()),
    }
}

impl Reactor for SelectReactor {
    fn delay(&self, after: Duration, cb: TimerCallback) -> TimerId {
        self.timers.borrow_mut().schedule(after, None, cb)
    }

    fn repeat(&self, interval: Duration, cb: TimerCallback) -> TimerId {
        self.timers.borrow_mut().schedule(interval, Some(interval), cb)
    }

    fn off_delay(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().cancel(id)
    }

    fn off_repeat(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().cancel(id)
    }

    fn on_readable(&self, fd: RawFd, cb: IoCallback) {
        self.set_io(fd, false, Some(cb));
    }

    fn on_writable(&self, fd: RawFd, cb: IoCallback) {
        self.set_io(fd, true, Some(cb));
    }

    fn off_readable(&self, fd: RawFd) -> bool {
        self.set_io(fd, false, None)
    }

    fn off_writable(&self, fd: RawFd) -> bool {
        self.set_io(fd, true, None)
    }

    fn on_signal(&self, signo: i32, cb: SignalCallback) -> Result<(), ReactorError> {
        self.signals.register(signo, cb)
    }

    fn off_signal(&self, signo: i32) -> bool {
        self.signals.unregister(signo)
    }

    fn run(&self) {
        self.stopped.set(false);
        while !self.stopped.get() && self.has_pending_work() {
            self.turn(None);
        }
    }

    fn stop(&self) {
        if !self.stopped.replace(true) {
            let _ = (&self.wake_write).write(&[1]);
        }
    }

    fn turn(&self, timeout: Option<Duration>) {
        let now = Instant::now();
        let next_deadline = self.timers.borrow_mut().until_next(now);
        let wait = match (timeout, next_deadline) {
            (Some(t), Some(d)) => Some(t.min(d)),
            (Some(t), None) => Some(t),
            (None, d) => d,
        };

        let signal_fd = self.signals.fd();
        let wake_fd = self.wake_read.borrow().as_raw_fd();

        // Snapshot watched fds so no borrow is held across dispatch.
        let watched: Vec<(RawFd, bool, bool)> = self
            .io
            .borrow()
            .iter()
            .map(|(&fd, slot)| (fd, slot.read.is_some(), slot.write.is_some()))
            .collect();

        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_SET(signal_fd, &mut read_set);
            libc::FD_SET(wake_fd, &mut read_set);
        }
        let mut max_fd = signal_fd.max(wake_fd);
        for &(fd, wants_read, wants_write) in &watched {
            unsafe {
                if wants_read {
                    libc::FD_SET(fd, &mut read_set);
                }
                if wants_write {
                    libc::FD_SET(fd, &mut write_set);
                }
            }
            max_fd = max_fd.max(fd);
        }

        let mut tv;
        let tv_ptr = match wait {
            Some(wait) => {
                tv = to_timeval(wait);
                &mut tv as *mut libc::timeval
            }
            None => ptr::null_mut(),
        };

        let n = unsafe {
            libc::select(max_fd + 1, &mut read_set, &mut write_set, ptr::null_mut(), tv_ptr)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(?err, "select: wait failed");
            }
            // EINTR: the signal pipe is in the read set, the next turn
            // observes it.
            return;
        }

        if unsafe { libc::FD_ISSET(wake_fd, &read_set) } {
            self.drain_wake_pipe();
        }
        if unsafe { libc::FD_ISSET(signal_fd, &read_set) } {
            for (signo, cb) in self.signals.drain() {
                self.guard(|| cb(signo));
            }
        }

        for (fd, wants_read, wants_write) in watched {
            if wants_read && unsafe { libc::FD_ISSET(fd, &read_set) } {
                let cb = self.io.borrow().get(&fd).and_then(|s| s.read.clone());
                if let Some(cb) = cb {
                    self.guard(|| cb(fd));
                }
            }
            if wants_write && unsafe { libc::FD_ISSET(fd, &write_set) } {
                let cb = self.io.borrow().get(&fd).and_then(|s| s.write.clone());
                if let Some(cb) = cb {
                    self.guard(|| cb(fd));
                }
            }
        }

        let due = self.timers.borrow_mut().collect_due(Instant::now());
        for timer in due {
            self.guard(|| (timer.cb)());
        }
    }

    fn delete_all_timer(&self) {
        self.timers.borrow_mut().clear();
    }

    fn timer_count(&self) -> usize {
        self.timers.borrow().count()
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.borrow_mut() = Some(handler);
    }

    fn name(&self) -> &'static str {
        "select"
    }
}
