use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    os::fd::RawFd,
    panic::{catch_unwind, AssertUnwindSafe},
    time::{Duration, Instant},
};

use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};
use tracing::{debug, warn};

use crate::{
    panic_message, signal::SignalHub, timer::TimerWheel, ErrorHandler, IoCallback, Reactor,
    ReactorError, SignalCallback, TimerCallback, TimerId,
};

const WAKER: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

#[derive(Default)]
struct IoSlot {
    read: Option<IoCallback>,
    write: Option<IoCallback>,
}

impl IoSlot {
    fn interest(&self) -> Option<Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct Ready {
    fd: RawFd,
    readable: bool,
    writable: bool,
}

/// `mio::Poll` driver — epoll on Linux, kqueue on the BSDs.
///
/// Fds are registered through `SourceFd`, so the reactor never owns the
/// sockets it watches; connections keep their own fds and only lend the
/// raw descriptor.
pub struct PollReactor {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    io: RefCell<HashMap<RawFd, IoSlot>>,
    timers: RefCell<TimerWheel>,
    signals: SignalHub,
    waker: Waker,
    stopped: Cell<bool>,
    error_handler: RefCell<Option<ErrorHandler>>,
}

impl PollReactor {
    pub fn new() -> Result<Self, ReactorError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let signals = SignalHub::new()?;
        let signal_fd = signals.fd();
        poll.registry().register(
            &mut SourceFd(&signal_fd),
            Token(signal_fd as usize),
            Interest::READABLE,
        )?;

        Ok(Self {
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(EVENTS_CAPACITY)),
            io: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerWheel::new()),
            signals,
            waker,
            stopped: Cell::new(false),
            error_handler: RefCell::new(None),
        })
    }

    /// Run `f`, translating a panic into error-handler dispatch so it never
    /// unwinds through the poll loop.
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

    fn apply_interest(&self, fd: RawFd, had: Option<Interest>, wants: Option<Interest>) {
        let registry_result: io::Result<()> = {
            let poll = self.poll.borrow();
            let registry = poll.registry();
            match (had, wants) {
                (None, Some(interest)) => {
                    registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)
                }
                (Some(_), Some(interest)) => {
                    registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                }
                (Some(_), None) => registry.deregister(&mut SourceFd(&fd)),
                (None, None) => Ok(()),
            }
        };
        if let Err(err) = registry_result {
            debug!(fd, ?err, "poll: interest update failed");
        }
    }

    fn set_io(&self, fd: RawFd, write_side: bool, cb: Option<IoCallback>) -> bool {
        let mut io = self.io.borrow_mut();
        let slot = io.entry(fd).or_default();
        let had = slot.interest();
        let previous = if write_side {
            std::mem::replace(&mut slot.write, cb)
        } else {
            std::mem::replace(&mut slot.read, cb)
        };
        let wants = slot.interest();
        if wants.is_none() {
            io.remove(&fd);
        }
        drop(io);
        self.apply_interest(fd, had, wants);
        previous.is_some()
    }

    fn has_pending_work(&self) -> bool {
        self.timers.borrow().count() > 0
            || !self.io.borrow().is_empty()
            || self.signals.len() > 0
    }
}

impl Reactor for PollReactor {
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
            if let Err(err) = self.waker.wake() {
                debug!(?err, "poll: waker");
            }
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

        let mut ready = Vec::new();
        {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            match poll.poll(&mut events, wait) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => warn!(?err, "poll: wait failed"),
            }
            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                // Error and hup conditions surface on both directions so a
                // handler is reached whichever side is registered.
                ready.push(Ready {
                    fd: event.token().0 as RawFd,
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed() || event.is_error(),
                });
            }
        }

        let signal_fd = self.signals.fd();
        for event in ready {
            if event.fd == signal_fd {
                for (signo, cb) in self.signals.drain() {
                    self.guard(|| cb(signo));
                }
                continue;
            }
            if event.readable {
                let cb = self.io.borrow().get(&event.fd).and_then(|s| s.read.clone());
                if let Some(cb) = cb {
                    self.guard(|| cb(event.fd));
                }
            }
            if event.writable {
                let cb = self.io.borrow().get(&event.fd).and_then(|s| s.write.clone());
                if let Some(cb) = cb {
                    self.guard(|| cb(event.fd));
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
        "poll"
    }

    fn has_suspension(&self) -> bool {
        true
    }
}
