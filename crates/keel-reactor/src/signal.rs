use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, Read},
    os::{fd::AsRawFd, fd::RawFd, unix::net::UnixStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use signal_hook::{consts::FORBIDDEN, flag, low_level, SigId};

use crate::{ReactorError, SignalCallback};

struct SignalEntry {
    flag: Arc<AtomicBool>,
    flag_id: SigId,
    pipe_id: SigId,
    cb: SignalCallback,
}

/// Self-pipe signal delivery shared by both drivers.
///
/// Each registered signal sets an atomic flag and writes one byte into the
/// pipe from the OS handler; the loop watches the read end like any other
/// fd and dispatches on its thread. Arrivals between two drains coalesce
/// into a single callback invocation.
pub(crate) struct SignalHub {
    read_end: RefCell<UnixStream>,
    write_end: UnixStream,
    entries: RefCell<HashMap<i32, SignalEntry>>,
}

impl SignalHub {
    pub fn new() -> io::Result<Self> {
        let (read_end, write_end) = UnixStream::pair()?;
        read_end.set_nonblocking(true)?;
        write_end.set_nonblocking(true)?;
        Ok(Self {
            read_end: RefCell::new(read_end),
            write_end,
            entries: RefCell::new(HashMap::new()),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.read_end.borrow().as_raw_fd()
    }

    pub fn register(&self, signo: i32, cb: SignalCallback) -> Result<(), ReactorError> {
        if FORBIDDEN.contains(&signo) {
            return Err(ReactorError::ForbiddenSignal(signo));
        }
        self.unregister(signo);

        let flag_value = Arc::new(AtomicBool::new(false));
        let flag_id = flag::register(signo, Arc::clone(&flag_value))
            .map_err(ReactorError::Io)?;
        let pipe_id = match low_level::pipe::register_raw(signo, self.write_end.as_raw_fd()) {
            Ok(id) => id,
            Err(err) => {
                low_level::unregister(flag_id);
                return Err(ReactorError::Io(err));
            }
        };

        self.entries
            .borrow_mut()
            .insert(signo, SignalEntry { flag: flag_value, flag_id, pipe_id, cb });
        Ok(())
    }

    pub fn unregister(&self, signo: i32) -> bool {
        match self.entries.borrow_mut().remove(&signo) {
            Some(entry) => {
                low_level::unregister(entry.flag_id);
                low_level::unregister(entry.pipe_id);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Drain pending wake bytes and collect the callbacks of every signal
    /// that arrived since the last drain. The caller dispatches them, so no
    /// borrow is held while user code runs.
    pub fn drain(&self) -> Vec<(i32, SignalCallback)> {
        let mut scratch = [0_u8; 64];
        loop {
            match self.read_end.borrow_mut().read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }

        self.entries
            .borrow()
            .iter()
            .filter(|(_, entry)| entry.flag.swap(false, Ordering::AcqRel))
            .map(|(signo, entry)| (*signo, entry.cb.clone()))
            .collect()
    }
}

impl Drop for SignalHub {
    fn drop(&mut self) {
        for (_, entry) in self.entries.borrow_mut().drain() {
            low_level::unregister(entry.flag_id);
            low_level::unregister(entry.pipe_id);
        }
    }
}
