//! The two timer implementations behind one facade: reactor-backed
//! (sub-second, used inside workers) and the SIGALRM tick scheduler
//! (1-second resolution, used by the reactor-less master).

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashSet},
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use keel_reactor::{Reactor, ReactorHandle, TimerId};

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

struct TickTask {
    id: u64,
    interval: u64,
    persistent: bool,
    cb: Rc<dyn Fn()>,
}

/// Coarse scheduler driven by `alarm(1)`.
///
/// The master process has no reactor; it re-arms a one-second alarm and
/// executes due tasks from its signal loop when SIGALRM arrives. Stop
/// escalation and reload timeouts run on this.
#[derive(Default)]
pub struct TickScheduler {
    tasks: RefCell<BTreeMap<u64, Vec<TickTask>>>,
    live: RefCell<HashSet<u64>>,
    next_id: Cell<u64>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `cb` after `seconds` (floor 1). Persistent tasks re-insert
    /// themselves at `now + interval` after each run.
    pub fn add(&self, seconds: u64, persistent: bool, cb: Rc<dyn Fn()>) -> u64 {
        let interval = seconds.max(1);
        let id = self.next_id.get().wrapping_add(1).max(1);
        self.next_id.set(id);
        self.live.borrow_mut().insert(id);
        self.tasks
            .borrow_mut()
            .entry(unix_now() + interval)
            .or_default()
            .push(TickTask { id, interval, persistent, cb });
        nix::unistd::alarm::set(1);
        id
    }

    pub fn del(&self, id: u64) -> bool {
        self.live.borrow_mut().remove(&id)
    }

    pub fn del_all(&self) {
        self.tasks.borrow_mut().clear();
        self.live.borrow_mut().clear();
        nix::unistd::alarm::cancel();
    }

    pub fn len(&self) -> usize {
        self.live.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.borrow().is_empty()
    }

    /// Run every task due by now. Called on each SIGALRM.
    pub fn tick(&self) {
        let now = unix_now();
        let mut due = Vec::new();
        {
            let mut tasks = self.tasks.borrow_mut();
            let expired: Vec<u64> = tasks.range(..=now).map(|(k, _)| *k).collect();
            for key in expired {
                if let Some(batch) = tasks.remove(&key) {
                    due.extend(batch);
                }
            }
        }

        for task in due {
            if !self.live.borrow().contains(&task.id) {
                continue;
            }
            (task.cb)();
            if task.persistent {
                self.tasks.borrow_mut().entry(now + task.interval).or_default().push(task);
            } else {
                self.live.borrow_mut().remove(&task.id);
            }
        }

        if self.tasks.borrow().is_empty() {
            nix::unistd::alarm::cancel();
        } else {
            nix::unistd::alarm::set(1);
        }
    }
}

/// Facade over whichever implementation the current process carries.
pub enum Timer {
    Reactor(ReactorHandle),
    Tick(Rc<TickScheduler>),
}

/// Identifier usable with [`Timer::del`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerHandle {
    Reactor(TimerId),
    Tick(u64),
}

impl Timer {
    /// Schedule `cb` after (and, when persistent, every) `interval`.
    pub fn add(&self, interval: Duration, persistent: bool, cb: Rc<dyn Fn()>) -> TimerHandle {
        match self {
            Self::Reactor(reactor) => {
                let id = if persistent {
                    reactor.repeat(interval, cb)
                } else {
                    reactor.delay(interval, cb)
                };
                TimerHandle::Reactor(id)
            }
            Self::Tick(ticker) => TimerHandle::Tick(ticker.add(interval.as_secs(), persistent, cb)),
        }
    }

    pub fn del(&self, handle: TimerHandle) -> bool {
        match (self, handle) {
            (Self::Reactor(reactor), TimerHandle::Reactor(id)) => {
                reactor.off_repeat(id) || reactor.off_delay(id)
            }
            (Self::Tick(ticker), TimerHandle::Tick(id)) => ticker.del(id),
            _ => false,
        }
    }

    pub fn del_all(&self) {
        match self {
            Self::Reactor(reactor) => reactor.delete_all_timer(),
            Self::Tick(ticker) => ticker.del_all(),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Self::Reactor(reactor) => reactor.timer_count(),
            Self::Tick(ticker) => ticker.len(),
        }
    }
}
