use std::{cell::Cell, rc::Rc, time::Duration};

use crate::{Reactor, ReactorHandle};

/// Cooperative suspension of the current task.
///
/// `suspend` pumps reactor turns until the paired [`Resumer`] fires, so
/// timers and other connections keep being serviced while the caller
/// waits. Single-threaded: the resumer must be invoked from a callback
/// running on the same loop.
pub struct Suspension {
    reactor: ReactorHandle,
    resumed: Rc<Cell<bool>>,
}

#[derive(Clone)]
pub struct Resumer {
    resumed: Rc<Cell<bool>>,
}

impl Resumer {
    pub fn resume(&self) {
        self.resumed.set(true);
    }
}

impl Suspension {
    pub fn new(reactor: ReactorHandle) -> (Self, Resumer) {
        let resumed = Rc::new(Cell::new(false));
        (Self { reactor, resumed: resumed.clone() }, Resumer { resumed })
    }

    /// Block the current task (not the loop) until resumed.
    pub fn suspend(self) {
        while !self.resumed.get() {
            self.reactor.turn(None);
        }
    }
}

/// Suspend the current task for at least `duration`.
///
/// On a driver with suspension support the loop keeps running underneath;
/// on the select fallback this is a plain blocking sleep.
pub fn sleep(reactor: &ReactorHandle, duration: Duration) {
    if !reactor.has_suspension() {
        std::thread::sleep(duration);
        return;
    }
    let (suspension, resumer) = Suspension::new(reactor.clone());
    reactor.delay(duration, Rc::new(move || resumer.resume()));
    suspension.suspend();
}
