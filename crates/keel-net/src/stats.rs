use std::cell::Cell;

/// Per-worker counters, exported on demand through the status dump.
///
/// Lives behind an `Rc` shared by the worker, its listeners, and every
/// connection; all mutation happens on the worker thread.
#[derive(Default)]
pub struct Statistics {
    pub connection_count: Cell<u64>,
    pub total_request: Cell<u64>,
    pub throw_exception: Cell<u64>,
    pub send_fail: Cell<u64>,
    /// `total_request` at the previous status dump; qps is the delta.
    pub last_total_request: Cell<u64>,
}

impl Statistics {
    pub fn bump_request(&self) {
        self.total_request.set(self.total_request.get() + 1);
    }

    pub fn bump_send_fail(&self) {
        self.send_fail.set(self.send_fail.get() + 1);
    }

    pub fn bump_exception(&self) {
        self.throw_exception.set(self.throw_exception.get() + 1);
    }

    /// Requests since the previous call; advances the qps baseline.
    pub fn take_qps(&self) -> u64 {
        let total = self.total_request.get();
        let qps = total - self.last_total_request.get();
        self.last_total_request.set(total);
        qps
    }
}
