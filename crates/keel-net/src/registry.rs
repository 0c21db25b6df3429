use std::{cell::Cell, cell::RefCell, collections::HashMap, rc::Rc};

use keel_utils::safe_panic;

use crate::TcpConnection;

/// The owning table of a listener's live connections.
///
/// This map is the sole strong owner of established connections; the
/// connection itself only keeps a back-handle for self-removal, so
/// `destroy` breaking the entry releases the last cycle.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Rc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    map: RefCell<HashMap<u64, TcpConnection>>,
    draining: Cell<bool>,
    on_empty: RefCell<Option<Rc<dyn Fn()>>>,
}

impl ConnectionRegistry {
    pub fn insert(&self, id: u64, conn: TcpConnection) {
        if self.inner.map.borrow_mut().insert(id, conn).is_some() {
            safe_panic!("connection id {id} reused while still registered");
        }
    }

    pub fn remove(&self, id: u64) {
        let emptied = {
            let mut map = self.inner.map.borrow_mut();
            map.remove(&id);
            map.is_empty()
        };
        if emptied && self.inner.draining.get() {
            let notify = self.inner.on_empty.borrow().clone();
            if let Some(notify) = notify {
                notify();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.borrow().is_empty()
    }

    /// Snapshot of the live handles, so callers can iterate while
    /// connections remove themselves from the table.
    pub fn connections(&self) -> Vec<TcpConnection> {
        self.inner.map.borrow().values().cloned().collect()
    }

    /// Arm the drain notification: once the table empties, `notify` runs.
    /// Fires immediately when the table is already empty.
    pub fn drain_then(&self, notify: Rc<dyn Fn()>) {
        self.inner.draining.set(true);
        if self.is_empty() {
            notify();
        } else {
            *self.inner.on_empty.borrow_mut() = Some(notify);
        }
    }

    /// Close every live connection, flushing pending sends first.
    pub fn close_all(&self) {
        for conn in self.connections() {
            conn.close(None);
        }
    }
}
