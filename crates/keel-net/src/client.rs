use std::{
    cell::RefCell,
    net::SocketAddr,
    os::fd::{FromRawFd, IntoRawFd},
    rc::Rc,
    time::Duration,
};

use keel_reactor::{Reactor, ReactorHandle, TimerId};
use tracing::debug;

use crate::{
    tcp::{ConnectionOptions, StreamSocket},
    CallbackSet, CodecHandle, NetError, Statistics, TcpConnection,
};

struct ClientState {
    reactor: ReactorHandle,
    addr: SocketAddr,
    transport: &'static str,
    codec: Option<CodecHandle>,
    callbacks: CallbackSet,
    stats: Option<Rc<Statistics>>,
    next_id: u64,
    current: Option<TcpConnection>,
    reconnect_timer: Option<TimerId>,
}

/// Client-side connection with single-shot reconnect scheduling.
///
/// `connect` starts a non-blocking connect; the engine reports the outcome
/// through `on_connect` or `on_error(ConnectFail, _)`. A later
/// [`AsyncTcpConnection::reconnect`] replaces any outstanding attempt.
#[derive(Clone)]
pub struct AsyncTcpConnection {
    state: Rc<RefCell<ClientState>>,
}

impl AsyncTcpConnection {
    pub fn new(
        reactor: ReactorHandle,
        addr: SocketAddr,
        codec: Option<CodecHandle>,
        callbacks: CallbackSet,
        stats: Option<Rc<Statistics>>,
    ) -> Self {
        Self {
            state: Rc::new(RefCell::new(ClientState {
                reactor,
                addr,
                transport: "tcp",
                codec,
                callbacks,
                stats,
                next_id: 1,
                current: None,
                reconnect_timer: None,
            })),
        }
    }

    /// Begin a non-blocking connect attempt, replacing any live connection.
    pub fn connect(&self) -> Result<(), NetError> {
        // Destroy outside the borrow: on_close may call back into us.
        let old = self.state.borrow_mut().current.take();
        if let Some(old) = old {
            old.destroy();
        }

        let (reactor, addr, opts) = {
            let mut state = self.state.borrow_mut();
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1).max(1);
            let opts = ConnectionOptions {
                id,
                transport: state.transport,
                codec: state.codec.clone(),
                callbacks: state.callbacks.clone(),
                stats: state.stats.clone(),
                ..ConnectionOptions::new(id)
            };
            (state.reactor.clone(), state.addr, opts)
        };

        // mio performs the non-blocking connect; the fd then lives in a
        // std stream driven by our own readiness callbacks.
        let mio_stream = mio::net::TcpStream::connect(addr)?;
        let stream = unsafe { std::net::TcpStream::from_raw_fd(mio_stream.into_raw_fd()) };
        let conn = TcpConnection::connecting(reactor, StreamSocket::Tcp(stream), opts)?;

        self.state.borrow_mut().current = Some(conn);
        Ok(())
    }

    /// Schedule a single-shot reconnect after `after`, cancelling any
    /// outstanding one.
    pub fn reconnect(&self, after: Duration) {
        self.cancel_reconnect();
        let reactor = self.state.borrow().reactor.clone();
        let this = self.clone();
        let id = reactor.delay(
            after,
            Rc::new(move || {
                this.state.borrow_mut().reconnect_timer = None;
                if let Err(err) = this.connect() {
                    debug!(?err, "client: reconnect attempt failed");
                }
            }),
        );
        self.state.borrow_mut().reconnect_timer = Some(id);
    }

    /// Drop the pending reconnect without retrying.
    pub fn cancel_reconnect(&self) {
        let (reactor, timer) = {
            let mut state = self.state.borrow_mut();
            (state.reactor.clone(), state.reconnect_timer.take())
        };
        if let Some(id) = timer {
            reactor.off_delay(id);
        }
    }

    /// Handle to the live connection, when one exists.
    pub fn connection(&self) -> Option<TcpConnection> {
        self.state.borrow().current.clone()
    }

    pub fn send(&self, data: bytes::Bytes) -> bool {
        match self.connection() {
            Some(conn) => conn.send(data),
            None => false,
        }
    }

    pub fn close(&self) {
        self.cancel_reconnect();
        if let Some(conn) = self.connection() {
            conn.close(None);
        }
    }
}
