use std::{
    cell::RefCell,
    io::{self, Read, Write},
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
    sync::Arc,
};

use bytes::{Buf, Bytes, BytesMut};
use keel_reactor::{Reactor, ReactorHandle};
use tracing::{debug, warn};

use crate::{
    tls::{HandshakeStatus, TlsSession},
    BufferCallback, CallbackSet, CloseCallback, Codec, CodecHandle, Conn, ConnectCallback,
    ConnectionContext, ConnectionRegistry, ConnectionStatus, ErrorCallback, ErrorCode,
    FrameVerdict, MessageCallback, Statistics, DEFAULT_MAX_PACKAGE_SIZE,
    DEFAULT_MAX_SEND_BUFFER_SIZE, READ_BUFFER_SIZE,
};

/// A connected stream socket, TCP or Unix-domain.
pub enum StreamSocket {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

impl StreamSocket {
    fn fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(true),
            Self::Unix(s) => s.set_nonblocking(true),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            Self::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Self::Tcp(s) => s.take_error(),
            Self::Unix(s) => s.take_error(),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(s) => s.peer_addr().ok(),
            Self::Unix(_) => None,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(s) => s.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }
}

impl Read for StreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for StreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

/// Set SO_KEEPALIVE on an accepted TCP socket.
fn enable_keepalive(fd: RawFd) {
    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Everything a connection needs at construction beyond its socket.
pub struct ConnectionOptions {
    pub id: u64,
    pub transport: &'static str,
    pub codec: Option<CodecHandle>,
    pub callbacks: CallbackSet,
    pub max_send_buffer_size: usize,
    pub max_package_size: usize,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub stats: Option<Rc<Statistics>>,
    pub registry: Option<ConnectionRegistry>,
}

impl ConnectionOptions {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            transport: "tcp",
            codec: None,
            callbacks: CallbackSet::default(),
            max_send_buffer_size: DEFAULT_MAX_SEND_BUFFER_SIZE,
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            tls: None,
            stats: None,
            registry: None,
        }
    }
}

struct Inner {
    id: u64,
    socket: Option<StreamSocket>,
    reactor: ReactorHandle,
    status: ConnectionStatus,
    transport: &'static str,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    codec: Option<CodecHandle>,
    callbacks: CallbackSet,
    /// Receives panics out of user callbacks; absent, they unwind into
    /// the reactor's error handler (worker policy: exit 250).
    panic_handler: Option<Rc<dyn Fn(&Conn, &str)>>,
    recv_buffer: BytesMut,
    send_buffer: BytesMut,
    read_chunk: Vec<u8>,
    current_package_length: usize,
    paused: bool,
    writable_armed: bool,
    buffer_full_fired: bool,
    connect_fired: bool,
    counted: bool,
    max_send_buffer_size: usize,
    max_package_size: usize,
    bytes_read: u64,
    bytes_written: u64,
    tls: Option<TlsSession>,
    stats: Option<Rc<Statistics>>,
    registry: Option<ConnectionRegistry>,
}

impl Inner {
    fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(StreamSocket::fd)
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            connection_id: self.id,
            remote_addr: self.remote,
            transport: self.transport,
            max_package_size: self.max_package_size,
        }
    }

    fn bump_send_fail(&self) {
        if let Some(stats) = &self.stats {
            stats.bump_send_fail();
        }
    }

    fn handshake_done(&self) -> bool {
        self.tls.as_ref().map_or(true, |t| t.handshake_done)
    }

    /// Records an upward crossing of the send-buffer threshold.
    /// Returns true exactly once per crossing.
    fn note_full_crossing(&mut self) -> bool {
        if self.send_buffer.len() >= self.max_send_buffer_size && !self.buffer_full_fired {
            self.buffer_full_fired = true;
            true
        } else {
            false
        }
    }

    fn tls_pending(&self) -> bool {
        self.tls.as_ref().is_some_and(TlsSession::wants_write)
    }
}

/// Callback work staged while a borrow was held.
#[derive(Clone, Copy, PartialEq, Eq)]
enum After {
    Nothing,
    BufferFull,
    /// Buffer crossed full and drained again within one call (TLS flush).
    BufferFullThenDrain,
    DropPackage,
    PeerClosed,
}

enum FlushResult {
    Drained { fire_drain: bool },
    Pending,
    Fatal,
}

/// Handle to one TCP (or Unix-stream, or TLS-wrapped) connection.
///
/// The handle is cheap to clone; all state lives behind a single-threaded
/// cell owned by the worker's reactor. Engine methods never hold a borrow
/// across a user callback, so callbacks may freely call back into the
/// connection (send from `on_message`, close from `on_buffer_full`, ...).
pub struct TcpConnection {
    inner: Rc<RefCell<Inner>>,
}

impl Clone for TcpConnection {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl TcpConnection {
    /// Build a server-side connection around a freshly accepted socket,
    /// register it for readability, and enter ESTABLISHED (TLS connections
    /// stay gated on the handshake flag).
    ///
    /// The caller fires `on_connect` via [`TcpConnection::fire_connect`]
    /// once its own wiring is complete.
    pub fn accept(
        reactor: ReactorHandle,
        socket: StreamSocket,
        opts: ConnectionOptions,
    ) -> Result<Self, crate::NetError> {
        socket.set_nonblocking()?;
        if let StreamSocket::Tcp(stream) = &socket {
            stream.set_nodelay(true)?;
            enable_keepalive(socket.fd());
        }

        let tls = match &opts.tls {
            Some(config) => Some(TlsSession::new(Arc::clone(config))?),
            None => None,
        };

        let conn = Self::build(reactor, socket, opts, tls, ConnectionStatus::Established);
        {
            let inner = conn.inner.borrow();
            if let Some(stats) = &inner.stats {
                stats.connection_count.set(stats.connection_count.get() + 1);
            }
            if let Some(registry) = &inner.registry {
                registry.insert(inner.id, conn.clone());
            }
        }
        conn.arm_read();
        Ok(conn)
    }

    /// Build a client-side connection whose socket has a non-blocking
    /// connect in flight. Writability reports the outcome.
    pub(crate) fn connecting(
        reactor: ReactorHandle,
        socket: StreamSocket,
        opts: ConnectionOptions,
    ) -> Result<Self, crate::NetError> {
        socket.set_nonblocking()?;
        let tls = match &opts.tls {
            Some(config) => Some(TlsSession::new(Arc::clone(config))?),
            None => None,
        };
        let conn = Self::build(reactor, socket, opts, tls, ConnectionStatus::Connecting);
        conn.arm_write();
        Ok(conn)
    }

    fn build(
        reactor: ReactorHandle,
        socket: StreamSocket,
        opts: ConnectionOptions,
        tls: Option<TlsSession>,
        status: ConnectionStatus,
    ) -> Self {
        let remote = socket.peer_addr();
        let local = socket.local_addr();
        let counted = status == ConnectionStatus::Established;
        Self {
            inner: Rc::new(RefCell::new(Inner {
                id: opts.id,
                socket: Some(socket),
                reactor,
                status,
                transport: opts.transport,
                remote,
                local,
                codec: opts.codec,
                callbacks: opts.callbacks,
                panic_handler: None,
                recv_buffer: BytesMut::new(),
                send_buffer: BytesMut::new(),
                read_chunk: vec![0; READ_BUFFER_SIZE],
                current_package_length: 0,
                paused: false,
                writable_armed: false,
                buffer_full_fired: false,
                connect_fired: false,
                counted,
                max_send_buffer_size: opts.max_send_buffer_size,
                max_package_size: opts.max_package_size,
                bytes_read: 0,
                bytes_written: 0,
                tls,
                stats: opts.stats,
                registry: opts.registry,
            })),
        }
    }

    // ---- accessors -------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.borrow().status
    }

    pub fn status_label(&self) -> &'static str {
        match self.status() {
            ConnectionStatus::Initial => "INITIAL",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Established => "ESTABLISHED",
            ConnectionStatus::Closing => "CLOSING",
            ConnectionStatus::Closed => "CLOSED",
        }
    }

    pub fn transport(&self) -> &'static str {
        self.inner.borrow().transport
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().local
    }

    pub fn remote_ip(&self) -> Option<std::net::IpAddr> {
        self.remote_addr().map(|a| a.ip())
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_addr().map(|a| a.port())
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.borrow().bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.borrow().bytes_written
    }

    pub fn recv_queue_bytes(&self) -> usize {
        self.inner.borrow().recv_buffer.len()
    }

    pub fn send_queue_bytes(&self) -> usize {
        self.inner.borrow().send_buffer.len()
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.inner.borrow().send_buffer.is_empty()
    }

    /// The underlying descriptor, while the socket is open.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.borrow().fd()
    }

    pub fn set_max_send_buffer_size(&self, size: usize) {
        self.inner.borrow_mut().max_send_buffer_size = size;
    }

    pub fn set_max_package_size(&self, size: usize) {
        self.inner.borrow_mut().max_package_size = size;
    }

    // ---- per-connection callback overrides -------------------------------

    pub fn set_on_message(&self, cb: MessageCallback) {
        self.inner.borrow_mut().callbacks.on_message = Some(cb);
    }

    pub fn set_on_connect(&self, cb: ConnectCallback) {
        self.inner.borrow_mut().callbacks.on_connect = Some(cb);
    }

    pub fn set_on_close(&self, cb: CloseCallback) {
        self.inner.borrow_mut().callbacks.on_close = Some(cb);
    }

    pub fn set_on_error(&self, cb: ErrorCallback) {
        self.inner.borrow_mut().callbacks.on_error = Some(cb);
    }

    pub fn set_on_buffer_full(&self, cb: BufferCallback) {
        self.inner.borrow_mut().callbacks.on_buffer_full = Some(cb);
    }

    pub fn set_on_buffer_drain(&self, cb: BufferCallback) {
        self.inner.borrow_mut().callbacks.on_buffer_drain = Some(cb);
    }

    /// Route user-callback panics on this connection to `handler` instead
    /// of the worker-fatal default.
    pub fn set_panic_handler(&self, handler: Rc<dyn Fn(&Conn, &str)>) {
        self.inner.borrow_mut().panic_handler = Some(handler);
    }

    // ---- reactor wiring --------------------------------------------------

    fn arm_read(&self) {
        let (reactor, fd) = {
            let inner = self.inner.borrow();
            let Some(fd) = inner.fd() else { return };
            (inner.reactor.clone(), fd)
        };
        let weak = Rc::downgrade(&self.inner);
        reactor.on_readable(
            fd,
            Rc::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    TcpConnection { inner }.base_read();
                }
            }),
        );
    }

    fn arm_write(&self) {
        let (reactor, fd, already) = {
            let mut inner = self.inner.borrow_mut();
            let Some(fd) = inner.fd() else { return };
            let already = inner.writable_armed;
            inner.writable_armed = true;
            (inner.reactor.clone(), fd, already)
        };
        if already {
            return;
        }
        let weak = Rc::downgrade(&self.inner);
        reactor.on_writable(
            fd,
            Rc::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    TcpConnection { inner }.base_write();
                }
            }),
        );
    }

    fn disarm_write(&self) {
        let (reactor, fd) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.writable_armed {
                return;
            }
            inner.writable_armed = false;
            let Some(fd) = inner.fd() else { return };
            (inner.reactor.clone(), fd)
        };
        reactor.off_writable(fd);
    }

    // ---- user-callback dispatch ------------------------------------------

    /// Run one user callback. A panic goes to the per-connection panic
    /// handler when set; otherwise it unwinds into the reactor dispatch
    /// guard, where the worker's policy applies.
    fn dispatch(&self, f: impl FnOnce(&Conn)) {
        let handle = Conn::Tcp(self.clone());
        let handler = self.inner.borrow().panic_handler.clone();
        match handler {
            None => f(&handle),
            Some(handler) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(&handle))) {
                    let msg = panic_text(payload.as_ref());
                    let stats = self.inner.borrow().stats.clone();
                    if let Some(stats) = stats {
                        stats.bump_exception();
                    }
                    handler(&handle, &msg);
                }
            }
        }
    }

    /// Fire the connect pair: user first, then the codec hook.
    pub fn fire_connect(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.connect_fired {
                return;
            }
            inner.connect_fired = true;
        }
        let (user, codec) = {
            let inner = self.inner.borrow();
            (inner.callbacks.on_connect.clone(), inner.codec.clone())
        };
        if let Some(cb) = user {
            self.dispatch(|conn| cb(conn));
        }
        if let Some(codec) = codec {
            self.dispatch(|conn| codec.on_connect(conn));
        }
    }

    fn dispatch_error(&self, code: ErrorCode, msg: &str) {
        let cb = self.inner.borrow().callbacks.on_error.clone();
        if let Some(cb) = cb {
            self.dispatch(|conn| cb(conn, code, msg));
        }
    }

    fn fire_buffer_full(&self) {
        let cb = self.inner.borrow().callbacks.on_buffer_full.clone();
        if let Some(cb) = cb {
            self.dispatch(|conn| cb(conn));
        }
    }

    fn fire_buffer_drain(&self) {
        let cb = self.inner.borrow().callbacks.on_buffer_drain.clone();
        if let Some(cb) = cb {
            self.dispatch(|conn| cb(conn));
        }
    }

    // ---- inbound ---------------------------------------------------------

    /// Readiness handler: TLS handshake stepping, bulk read, frame loop.
    pub(crate) fn base_read(&self) {
        let handshake = {
            let mut inner = self.inner.borrow_mut();
            let Inner { tls, socket, .. } = &mut *inner;
            match (tls.as_mut(), socket.as_mut()) {
                (Some(tls), Some(sock)) if !tls.handshake_done => Some(tls.step_handshake(sock)),
                _ => None,
            }
        };
        match handshake {
            Some(HandshakeStatus::Fatal) => {
                self.destroy();
                return;
            }
            Some(HandshakeStatus::InProgress) => {
                // Flush the rest of our handshake records when the socket
                // unblocks, or the peer waits forever.
                if self.inner.borrow().tls_pending() {
                    self.arm_write();
                }
                return;
            }
            Some(HandshakeStatus::Done) => {
                // Sends queued during the handshake can flow now.
                let pending = {
                    let inner = self.inner.borrow();
                    !inner.send_buffer.is_empty() || inner.tls_pending()
                };
                if pending {
                    self.arm_write();
                }
            }
            None => {}
        }

        let mut peer_closed = false;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.status == ConnectionStatus::Closed {
                return;
            }
            let Inner { tls, socket, recv_buffer, read_chunk, bytes_read, .. } = &mut *inner;
            let Some(sock) = socket.as_mut() else { return };
            loop {
                let result = match tls.as_mut() {
                    Some(tls) => tls.read_plain(sock, read_chunk),
                    None => sock.read(read_chunk),
                };
                match result {
                    Ok(0) => {
                        peer_closed = true;
                        break;
                    }
                    Ok(n) => {
                        recv_buffer.extend_from_slice(&read_chunk[..n]);
                        *bytes_read += n as u64;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        // Peer reset: destroyed silently, no error callback.
                        debug!(?err, "connection: read");
                        peer_closed = true;
                        break;
                    }
                }
            }
        }

        self.process_buffer();
        if peer_closed {
            self.destroy();
        }
    }

    /// Drive the codec over `recv_buffer` until it wants more bytes.
    fn process_buffer(&self) {
        enum Step {
            Deliver(Bytes),
            Again,
            NeedMore,
            Fatal,
        }

        loop {
            let step = {
                let mut inner = self.inner.borrow_mut();
                if inner.status == ConnectionStatus::Closed
                    || inner.paused
                    || inner.recv_buffer.is_empty()
                {
                    Step::NeedMore
                } else {
                    match inner.codec.clone() {
                        None => Step::Deliver(inner.recv_buffer.split().freeze()),
                        Some(codec) => {
                            let ctx = inner.context();
                            if inner.current_package_length == 0 {
                                match codec.input(&inner.recv_buffer, &ctx) {
                                    FrameVerdict::Incomplete => Step::NeedMore,
                                    FrameVerdict::Frame(len)
                                        if len == 0 || len > inner.max_package_size =>
                                    {
                                        Step::Fatal
                                    }
                                    FrameVerdict::Frame(len) => {
                                        inner.current_package_length = len;
                                        Step::Again
                                    }
                                    FrameVerdict::Invalid => Step::Fatal,
                                }
                            } else if inner.recv_buffer.len() >= inner.current_package_length {
                                let len = inner.current_package_length;
                                inner.current_package_length = 0;
                                let frame = inner.recv_buffer.split_to(len).freeze();
                                Step::Deliver(codec.decode(frame, &ctx))
                            } else {
                                Step::NeedMore
                            }
                        }
                    }
                }
            };

            match step {
                Step::Again => {}
                Step::NeedMore => break,
                Step::Deliver(msg) => {
                    let (stats, cb) = {
                        let inner = self.inner.borrow();
                        (inner.stats.clone(), inner.callbacks.on_message.clone())
                    };
                    if let Some(stats) = stats {
                        stats.bump_request();
                    }
                    if let Some(cb) = cb {
                        self.dispatch(|conn| cb(conn, msg));
                    }
                }
                Step::Fatal => {
                    warn!(id = self.id(), "connection: protocol error, dropping connection");
                    self.destroy();
                    break;
                }
            }
        }
    }

    // ---- outbound --------------------------------------------------------

    /// Encode `data` through the codec (when present) and transmit.
    /// Returns false when the payload was refused or the peer is gone.
    pub fn send(&self, data: Bytes) -> bool {
        self.send_impl(data, false)
    }

    /// Transmit without the encode step.
    pub fn send_raw(&self, data: Bytes) -> bool {
        self.send_impl(data, true)
    }

    fn send_impl(&self, data: Bytes, raw: bool) -> bool {
        let mut arm = false;
        let (result, after) = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.status, ConnectionStatus::Closing | ConnectionStatus::Closed) {
                return false;
            }

            let payload = if raw {
                data
            } else if let Some(codec) = inner.codec.clone() {
                let encoded = codec.encode(data, &inner.context());
                if encoded.is_empty() {
                    return true;
                }
                encoded
            } else {
                data
            };

            let ready = inner.status == ConnectionStatus::Established && inner.handshake_done();
            if !ready {
                // Queued until the connection (or its handshake) completes.
                if inner.send_buffer.len() >= inner.max_send_buffer_size {
                    inner.bump_send_fail();
                    (false, After::Nothing)
                } else {
                    inner.send_buffer.extend_from_slice(&payload);
                    let crossed = inner.note_full_crossing();
                    (true, if crossed { After::BufferFull } else { After::Nothing })
                }
            } else if inner.tls.is_some() {
                // TLS always goes through the buffered path.
                if !inner.send_buffer.is_empty()
                    && inner.send_buffer.len() >= inner.max_send_buffer_size
                {
                    inner.bump_send_fail();
                    (false, After::DropPackage)
                } else {
                    inner.send_buffer.extend_from_slice(&payload);
                    let crossed = inner.note_full_crossing();
                    match flush_tls_buffer(&mut inner) {
                        FlushResult::Fatal => {
                            inner.bump_send_fail();
                            (false, After::PeerClosed)
                        }
                        FlushResult::Pending => {
                            arm = true;
                            (true, if crossed { After::BufferFull } else { After::Nothing })
                        }
                        FlushResult::Drained { fire_drain } => {
                            let after = match (crossed, fire_drain) {
                                (true, true) => After::BufferFullThenDrain,
                                (true, false) => After::BufferFull,
                                _ => After::Nothing,
                            };
                            (true, after)
                        }
                    }
                }
            } else if inner.send_buffer.is_empty() {
                let write_result =
                    inner.socket.as_mut().map(|sock| sock.write(&payload));
                let Some(write_result) = write_result else { return false };
                match write_result {
                    Ok(0) => {
                        inner.bump_send_fail();
                        (false, After::PeerClosed)
                    }
                    Ok(n) if n == payload.len() => {
                        inner.bytes_written += n as u64;
                        (true, After::Nothing)
                    }
                    Ok(n) => {
                        inner.bytes_written += n as u64;
                        inner.send_buffer.extend_from_slice(&payload[n..]);
                        let crossed = inner.note_full_crossing();
                        arm = true;
                        (true, if crossed { After::BufferFull } else { After::Nothing })
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        inner.send_buffer.extend_from_slice(&payload);
                        let crossed = inner.note_full_crossing();
                        arm = true;
                        (true, if crossed { After::BufferFull } else { After::Nothing })
                    }
                    Err(err) => {
                        debug!(?err, "connection: direct write");
                        inner.bump_send_fail();
                        (false, After::PeerClosed)
                    }
                }
            } else if inner.send_buffer.len() >= inner.max_send_buffer_size {
                inner.bump_send_fail();
                (false, After::DropPackage)
            } else {
                inner.send_buffer.extend_from_slice(&payload);
                let crossed = inner.note_full_crossing();
                (true, if crossed { After::BufferFull } else { After::Nothing })
            }
        };

        if arm {
            self.arm_write();
        }
        match after {
            After::Nothing => {}
            After::BufferFull => self.fire_buffer_full(),
            After::BufferFullThenDrain => {
                self.fire_buffer_full();
                self.fire_buffer_drain();
            }
            After::DropPackage => {
                self.dispatch_error(ErrorCode::SendFail, "send buffer full and drop package");
            }
            After::PeerClosed => {
                self.dispatch_error(ErrorCode::SendFail, "client closed");
                self.destroy();
            }
        }
        result
    }

    /// Writability handler: connect completion, then buffer flushing.
    pub(crate) fn base_write(&self) {
        if self.status() == ConnectionStatus::Connecting {
            self.finish_connect();
            if self.status() != ConnectionStatus::Established {
                return;
            }
        }

        let flushed = {
            let mut inner = self.inner.borrow_mut();
            if inner.status == ConnectionStatus::Closed {
                return;
            }
            if inner.tls.is_some() {
                flush_tls_buffer(&mut inner)
            } else {
                flush_plain_buffer(&mut inner)
            }
        };

        match flushed {
            FlushResult::Fatal => {
                self.inner.borrow().bump_send_fail();
                self.destroy();
            }
            FlushResult::Pending => {}
            FlushResult::Drained { fire_drain } => {
                self.disarm_write();
                if fire_drain {
                    self.fire_buffer_drain();
                }
                if self.status() == ConnectionStatus::Closing && self.buffer_is_empty() {
                    self.destroy();
                }
            }
        }
    }

    /// Resolve a client-side non-blocking connect.
    fn finish_connect(&self) {
        let verdict = {
            let inner = self.inner.borrow();
            match inner.socket.as_ref() {
                None => Err("socket gone".to_string()),
                Some(sock) => match sock.take_error() {
                    Ok(None) => Ok(()),
                    Ok(Some(err)) => Err(err.to_string()),
                    Err(err) => Err(err.to_string()),
                },
            }
        };

        match verdict {
            Ok(()) => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.status = ConnectionStatus::Established;
                    inner.remote = inner.socket.as_ref().and_then(StreamSocket::peer_addr);
                    inner.local = inner.socket.as_ref().and_then(StreamSocket::local_addr);
                    inner.counted = true;
                    if let Some(stats) = &inner.stats {
                        stats.connection_count.set(stats.connection_count.get() + 1);
                    }
                }
                self.arm_read();
                self.fire_connect();
                let idle = {
                    let inner = self.inner.borrow();
                    inner.send_buffer.is_empty() && !inner.tls_pending()
                };
                if idle {
                    self.disarm_write();
                }
            }
            Err(msg) => {
                // Connect-phase failure: on_error fires, on_close never does.
                self.dispatch_error(ErrorCode::ConnectFail, &msg);
                self.destroy();
            }
        }
    }

    // ---- close path ------------------------------------------------------

    /// Optionally send a farewell, then stop accepting sends and destroy
    /// once the buffer drains.
    pub fn close(&self, data: Option<Bytes>) {
        self.close_impl(data, false);
    }

    pub fn close_raw(&self, data: Option<Bytes>) {
        self.close_impl(data, true);
    }

    fn close_impl(&self, data: Option<Bytes>, raw: bool) {
        match self.status() {
            ConnectionStatus::Connecting => {
                self.destroy();
                return;
            }
            ConnectionStatus::Closing | ConnectionStatus::Closed => return,
            _ => {}
        }
        if let Some(data) = data {
            self.send_impl(data, raw);
        }

        let drained = {
            let mut inner = self.inner.borrow_mut();
            inner.status = ConnectionStatus::Closing;
            inner.send_buffer.is_empty() && !inner.tls_pending()
        };
        if drained {
            self.destroy();
        } else {
            self.pause_recv();
        }
    }

    /// Tear everything down. Idempotent; safe to call from any callback.
    pub fn destroy(&self) {
        let (reactor, fd, was_connected) = {
            let mut inner = self.inner.borrow_mut();
            if inner.status == ConnectionStatus::Closed {
                return;
            }
            inner.status = ConnectionStatus::Closed;
            (inner.reactor.clone(), inner.fd(), inner.connect_fired)
        };

        if let Some(fd) = fd {
            reactor.off_readable(fd);
            reactor.off_writable(fd);
        }

        let (socket, codec, registry, id) = {
            let mut inner = self.inner.borrow_mut();
            inner.writable_armed = false;
            if inner.counted {
                inner.counted = false;
                if let Some(stats) = &inner.stats {
                    stats.connection_count.set(stats.connection_count.get().saturating_sub(1));
                }
            }
            (inner.socket.take(), inner.codec.clone(), inner.registry.take(), inner.id)
        };
        if let Some(socket) = socket {
            socket.shutdown();
        }

        if was_connected {
            let cb = self.inner.borrow().callbacks.on_close.clone();
            if let Some(cb) = cb {
                self.dispatch(|conn| cb(conn));
            }
            if let Some(codec) = codec {
                self.dispatch(|conn| codec.on_close(conn));
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.recv_buffer = BytesMut::new();
            inner.send_buffer = BytesMut::new();
            inner.read_chunk = Vec::new();
            inner.current_package_length = 0;
            inner.buffer_full_fired = false;
            inner.callbacks.clear();
            inner.panic_handler = None;
            inner.tls = None;
        }
        if let Some(registry) = registry {
            registry.remove(id);
        }
    }

    // ---- flow control ----------------------------------------------------

    /// Stop reading from the socket. Already-buffered bytes stay put until
    /// [`TcpConnection::resume_recv`].
    pub fn pause_recv(&self) {
        let (reactor, fd) = {
            let mut inner = self.inner.borrow_mut();
            inner.paused = true;
            let Some(fd) = inner.fd() else { return };
            (inner.reactor.clone(), fd)
        };
        reactor.off_readable(fd);
    }

    /// Re-register for reads and synchronously drain anything already
    /// buffered, without waiting for a fresh read event.
    pub fn resume_recv(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.paused || inner.status == ConnectionStatus::Closed {
                return;
            }
            inner.paused = false;
        }
        self.arm_read();
        self.process_buffer();
    }

    /// Forward this connection into `dest`: messages flow onward, closes
    /// propagate, and `dest`'s backpressure throttles our reads.
    pub fn pipe(&self, dest: &TcpConnection) {
        let downstream = dest.clone();
        self.set_on_message(Rc::new(move |_, data| {
            downstream.send(data);
        }));
        let downstream = dest.clone();
        self.set_on_close(Rc::new(move |_| downstream.close(None)));

        let upstream = self.clone();
        dest.set_on_buffer_full(Rc::new(move |_| upstream.pause_recv()));
        let upstream = self.clone();
        dest.set_on_buffer_drain(Rc::new(move |_| upstream.resume_recv()));
    }
}

/// Flush the plain-TCP send buffer until empty or the kernel blocks.
fn flush_plain_buffer(inner: &mut Inner) -> FlushResult {
    {
        let Inner { socket, send_buffer, bytes_written, .. } = &mut *inner;
        let Some(sock) = socket.as_mut() else { return FlushResult::Fatal };

        while !send_buffer.is_empty() {
            match sock.write(&send_buffer[..]) {
                Ok(0) => return FlushResult::Fatal,
                Ok(n) => {
                    *bytes_written += n as u64;
                    send_buffer.advance(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return FlushResult::Pending;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "connection: buffered write");
                    return FlushResult::Fatal;
                }
            }
        }
    }

    let fire_drain = inner.buffer_full_fired;
    inner.buffer_full_fired = false;
    FlushResult::Drained { fire_drain }
}

/// Flush pending TLS records, then stage more plaintext in bounded chunks.
fn flush_tls_buffer(inner: &mut Inner) -> FlushResult {
    {
        let Inner { tls, socket, send_buffer, bytes_written, .. } = &mut *inner;
        let (Some(tls), Some(sock)) = (tls.as_mut(), socket.as_mut()) else {
            return FlushResult::Fatal;
        };
        if let HandshakeStatus::Fatal = tls.flush_tls(sock) {
            return FlushResult::Fatal;
        }
        if !tls.handshake_done {
            // Queued plaintext stays put until the handshake is over; the
            // read path re-arms writability once it completes.
            return if tls.wants_write() {
                FlushResult::Pending
            } else {
                FlushResult::Drained { fire_drain: false }
            };
        }

        while !send_buffer.is_empty() && !tls.wants_write() {
            match tls.write_plain(sock, &send_buffer[..]) {
                Ok(0) => break,
                Ok(n) => {
                    *bytes_written += n as u64;
                    send_buffer.advance(n);
                }
                Err(err) => {
                    debug!(?err, "connection: tls write");
                    return FlushResult::Fatal;
                }
            }
        }

        if !send_buffer.is_empty() || tls.wants_write() {
            return FlushResult::Pending;
        }
    }

    let fire_drain = inner.buffer_full_fired;
    inner.buffer_full_fired = false;
    FlushResult::Drained { fire_drain }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
