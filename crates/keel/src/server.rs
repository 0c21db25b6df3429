//! The listener object: socket setup, accept wiring, per-listener
//! callbacks. One `Server` is replicated into `count` worker processes.

use std::{
    cell::{Cell, RefCell},
    net::{SocketAddr, TcpListener, ToSocketAddrs, UdpSocket},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
    os::unix::net::UnixListener,
    rc::Rc,
    sync::Arc,
};

use bytes::BytesMut;
use keel_net::{
    dispatch_datagram, BufferCallback, CallbackSet, CloseCallback, CodecHandle, CodecRegistry,
    ConnectCallback, ConnectionOptions, ConnectionRegistry, ErrorCallback, MessageCallback,
    Statistics, StreamSocket, TcpConnection, TlsContext, UdpConnection,
};
use keel_reactor::{Reactor, ReactorHandle};
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrStorage};
use tracing::{debug, info, warn};

use crate::{
    scheme::{parse_listen, ListenTarget, Transport},
    ServerError,
};

const LISTEN_BACKLOG: usize = 102400;
const UDP_DATAGRAM_MAX: usize = 65535;

/// Hook run at worker lifecycle points.
pub type LifecycleHook = Rc<dyn Fn()>;

enum BoundSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
    Udp(Rc<UdpSocket>),
}

impl BoundSocket {
    fn fd(&self) -> RawFd {
        match self {
            Self::Tcp(l) => l.as_raw_fd(),
            Self::Unix(l) => l.as_raw_fd(),
            Self::Udp(s) => s.as_raw_fd(),
        }
    }
}

/// One listener definition: socket string, codec, callbacks, worker count.
///
/// Configure before handing it to the supervisor; the supervisor freezes
/// and replicates it into workers by fork.
pub struct Server {
    name: String,
    listen: ListenTarget,
    count: usize,
    user: Option<String>,
    group: Option<String>,
    reloadable: bool,
    reuse_port: bool,
    protocol_override: Option<String>,
    tls: Option<TlsContext>,
    callbacks: CallbackSet,
    on_server_start: Option<LifecycleHook>,
    on_server_stop: Option<LifecycleHook>,
    on_server_reload: Option<LifecycleHook>,
    max_send_buffer_size: usize,
    max_package_size: usize,

    // Resolved/opened at startup.
    codec: Option<CodecHandle>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    socket: Option<BoundSocket>,
    registry: ConnectionRegistry,
    next_conn_id: Cell<u64>,
}

impl Server {
    pub fn new(listen: &str) -> Result<Self, ServerError> {
        let listen = parse_listen(listen)?;
        Ok(Self {
            name: "none".to_string(),
            listen,
            count: 1,
            user: None,
            group: None,
            reloadable: true,
            reuse_port: false,
            protocol_override: None,
            tls: None,
            callbacks: CallbackSet::default(),
            on_server_start: None,
            on_server_stop: None,
            on_server_reload: None,
            max_send_buffer_size: keel_net::DEFAULT_MAX_SEND_BUFFER_SIZE,
            max_package_size: keel_net::DEFAULT_MAX_PACKAGE_SIZE,
            codec: None,
            tls_config: None,
            socket: None,
            registry: ConnectionRegistry::default(),
            next_conn_id: Cell::new(0),
        })
    }

    // ---- configuration ---------------------------------------------------

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Worker replication factor.
    pub fn set_count(&mut self, count: usize) {
        self.count = count.max(1);
    }

    pub fn set_user(&mut self, user: impl Into<String>) {
        self.user = Some(user.into());
    }

    pub fn set_group(&mut self, group: impl Into<String>) {
        self.group = Some(group.into());
    }

    /// Whether SIGUSR1/SIGUSR2 recycle this listener's workers.
    pub fn set_reloadable(&mut self, reloadable: bool) {
        self.reloadable = reloadable;
    }

    /// Bind one listening socket per worker via SO_REUSEPORT.
    pub fn set_reuse_port(&mut self, reuse_port: bool) {
        self.reuse_port = reuse_port;
    }

    /// Codec override, replacing whatever the listen scheme implies.
    pub fn set_protocol(&mut self, scheme: impl Into<String>) {
        self.protocol_override = Some(scheme.into());
    }

    /// Transport override, e.g. running a codec scheme over `ssl`.
    pub fn set_transport(&mut self, transport: Transport) {
        self.listen.transport = transport;
    }

    /// Certificate material for the `ssl` transport.
    pub fn set_tls(&mut self, tls: TlsContext) {
        self.tls = Some(tls);
    }

    pub fn set_max_send_buffer_size(&mut self, size: usize) {
        self.max_send_buffer_size = size;
    }

    pub fn set_max_package_size(&mut self, size: usize) {
        self.max_package_size = size;
    }

    pub fn set_on_connect(&mut self, cb: ConnectCallback) {
        self.callbacks.on_connect = Some(cb);
    }

    pub fn set_on_message(&mut self, cb: MessageCallback) {
        self.callbacks.on_message = Some(cb);
    }

    pub fn set_on_close(&mut self, cb: CloseCallback) {
        self.callbacks.on_close = Some(cb);
    }

    pub fn set_on_error(&mut self, cb: ErrorCallback) {
        self.callbacks.on_error = Some(cb);
    }

    pub fn set_on_buffer_full(&mut self, cb: BufferCallback) {
        self.callbacks.on_buffer_full = Some(cb);
    }

    pub fn set_on_buffer_drain(&mut self, cb: BufferCallback) {
        self.callbacks.on_buffer_drain = Some(cb);
    }

    pub fn set_on_websocket_connect(&mut self, cb: ConnectCallback) {
        self.callbacks.on_websocket_connect = Some(cb);
    }

    pub fn set_on_server_start(&mut self, hook: LifecycleHook) {
        self.on_server_start = Some(hook);
    }

    pub fn set_on_server_stop(&mut self, hook: LifecycleHook) {
        self.on_server_stop = Some(hook);
    }

    pub fn set_on_server_reload(&mut self, hook: LifecycleHook) {
        self.on_server_reload = Some(hook);
    }

    // ---- accessors -------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listen_display(&self) -> String {
        self.listen.display()
    }

    pub fn transport(&self) -> Transport {
        self.listen.transport
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reloadable(&self) -> bool {
        self.reloadable
    }

    pub fn reuse_port(&self) -> bool {
        self.reuse_port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn connections(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    pub(crate) fn protocol_label(&self) -> String {
        self.protocol_override
            .clone()
            .or_else(|| self.listen.codec_scheme.clone())
            .unwrap_or_else(|| self.listen.transport.label().to_string())
    }

    pub(crate) fn lifecycle_hooks(
        &self,
    ) -> (Option<LifecycleHook>, Option<LifecycleHook>, Option<LifecycleHook>) {
        (
            self.on_server_start.clone(),
            self.on_server_stop.clone(),
            self.on_server_reload.clone(),
        )
    }

    pub(crate) fn listen_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(BoundSocket::fd)
    }

    /// The bound address, once listening. Mostly useful with port 0.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        match self.socket.as_ref()? {
            BoundSocket::Tcp(listener) => listener.local_addr().ok(),
            BoundSocket::Udp(socket) => socket.local_addr().ok(),
            BoundSocket::Unix(_) => None,
        }
    }

    // ---- startup ---------------------------------------------------------

    /// Resolve the codec scheme and load TLS material. Called once by the
    /// supervisor before any fork so misconfiguration fails fast.
    pub(crate) fn resolve(&mut self, codecs: &CodecRegistry) -> Result<(), ServerError> {
        let scheme = self
            .protocol_override
            .clone()
            .or_else(|| self.listen.codec_scheme.clone());
        if let Some(scheme) = scheme {
            self.codec = Some(codecs.resolve(&scheme)?);
        }

        if self.listen.transport == Transport::Ssl {
            let tls = self.tls.as_ref().ok_or_else(|| {
                ServerError::Config(format!(
                    "listener `{}` uses ssl but has no certificate configured",
                    self.name
                ))
            })?;
            self.tls_config = Some(tls.server_config()?);
        }
        Ok(())
    }

    /// Bind the listening socket unless already bound (inherited from the
    /// master across fork).
    pub(crate) fn ensure_bound(&mut self) -> Result<(), ServerError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let address = self.listen.address.clone();
        let socket = match self.listen.transport {
            Transport::Tcp | Transport::Ssl => {
                BoundSocket::Tcp(bind_tcp(&address, self.reuse_port)?)
            }
            Transport::Udp => BoundSocket::Udp(Rc::new(bind_udp(&address, self.reuse_port)?)),
            Transport::Unix => {
                let listener = bind_unix(&address)?;
                self.apply_unix_ownership(&address)?;
                BoundSocket::Unix(listener)
            }
        };
        info!(listen = %self.listen.display(), "listening");
        self.socket = Some(socket);
        Ok(())
    }

    /// Drop the listening socket. Used by workers to close fds inherited
    /// for other listeners.
    pub(crate) fn close_socket(&mut self) {
        self.socket = None;
    }

    fn apply_unix_ownership(&self, path: &str) -> Result<(), ServerError> {
        let uid = match &self.user {
            Some(name) => Some(
                nix::unistd::User::from_name(name)?
                    .ok_or_else(|| ServerError::UnknownUser(name.clone()))?
                    .uid,
            ),
            None => None,
        };
        let gid = match &self.group {
            Some(name) => Some(
                nix::unistd::Group::from_name(name)?
                    .ok_or_else(|| ServerError::UnknownGroup(name.clone()))?
                    .gid,
            ),
            None => None,
        };
        if uid.is_some() || gid.is_some() {
            nix::unistd::chown(std::path::Path::new(path), uid, gid)?;
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        let id = self.next_conn_id.get().wrapping_add(1).max(1);
        self.next_conn_id.set(id);
        id
    }

    fn connection_options(&self, stats: &Rc<Statistics>) -> ConnectionOptions {
        let mut opts = ConnectionOptions::new(self.next_id());
        opts.transport = self.listen.transport.label();
        opts.codec = self.codec.clone();
        opts.callbacks = self.callbacks.clone();
        opts.max_send_buffer_size = self.max_send_buffer_size;
        opts.max_package_size = self.max_package_size;
        opts.tls = self.tls_config.clone();
        opts.stats = Some(stats.clone());
        opts.registry = Some(self.registry.clone());
        opts
    }

    fn accept_stream(&self) -> Option<StreamSocket> {
        match self.socket.as_ref() {
            Some(BoundSocket::Tcp(listener)) => match listener.accept() {
                Ok((stream, _)) => Some(StreamSocket::Tcp(stream)),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                Err(err) => {
                    // Transient kernel errors: log and keep accepting.
                    debug!(?err, "accept");
                    None
                }
            },
            Some(BoundSocket::Unix(listener)) => match listener.accept() {
                Ok((stream, _)) => Some(StreamSocket::Unix(stream)),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                Err(err) => {
                    debug!(?err, "accept");
                    None
                }
            },
            _ => None,
        }
    }
}

// ---- worker-side wiring --------------------------------------------------

/// Register the listening fd for readability and service accepts.
pub fn start_accepting(
    server: &Rc<RefCell<Server>>,
    reactor: &ReactorHandle,
    stats: &Rc<Statistics>,
) {
    let Some(fd) = server.borrow().listen_fd() else { return };
    let is_udp = server.borrow().transport() == Transport::Udp;

    let server = Rc::clone(server);
    let reactor_for_conns = reactor.clone();
    let stats = stats.clone();
    reactor.on_readable(
        fd,
        Rc::new(move |_| {
            if is_udp {
                service_datagrams(&server, &stats);
            } else {
                service_accepts(&server, &reactor_for_conns, &stats);
            }
        }),
    );
}

/// Admission-layer backpressure: stop watching the listening fd.
pub fn pause_accept(server: &Rc<RefCell<Server>>, reactor: &ReactorHandle) {
    if let Some(fd) = server.borrow().listen_fd() {
        reactor.off_readable(fd);
    }
}

/// Undo [`pause_accept`].
pub fn resume_accept(
    server: &Rc<RefCell<Server>>,
    reactor: &ReactorHandle,
    stats: &Rc<Statistics>,
) {
    start_accepting(server, reactor, stats);
}

fn service_accepts(
    server: &Rc<RefCell<Server>>,
    reactor: &ReactorHandle,
    stats: &Rc<Statistics>,
) {
    loop {
        let (stream, opts) = {
            let server = server.borrow();
            match server.accept_stream() {
                Some(stream) => (stream, server.connection_options(stats)),
                None => return,
            }
        };
        match TcpConnection::accept(reactor.clone(), stream, opts) {
            Ok(conn) => conn.fire_connect(),
            Err(err) => warn!(?err, "failed to wire accepted connection"),
        }
    }
}

fn service_datagrams(server: &Rc<RefCell<Server>>, stats: &Rc<Statistics>) {
    let (socket, codec, callbacks) = {
        let server = server.borrow();
        let Some(BoundSocket::Udp(socket)) = server.socket.as_ref() else { return };
        (Rc::clone(socket), server.codec.clone(), server.callbacks.clone())
    };

    let mut buf = [0_u8; UDP_DATAGRAM_MAX];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                let id = server.borrow().next_id();
                let conn = UdpConnection::new(Rc::clone(&socket), peer, id, codec.clone());
                dispatch_datagram(&conn, BytesMut::from(&buf[..n]), &callbacks, Some(stats));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                debug!(?err, "udp: recv_from");
                return;
            }
        }
    }
}

// ---- socket setup --------------------------------------------------------

fn resolve_addr(address: &str) -> Result<SocketAddr, ServerError> {
    address
        .to_socket_addrs()
        .map_err(|e| ServerError::Bind { addr: address.to_string(), source: e })?
        .next()
        .ok_or_else(|| ServerError::Config(format!("address `{address}` resolves to nothing")))
}

fn new_inet_socket(
    addr: SocketAddr,
    kind: SockType,
    reuse_port: bool,
) -> Result<std::os::fd::OwnedFd, ServerError> {
    let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
    let fd = socket::socket(family, kind, SockFlag::SOCK_CLOEXEC, None)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    if reuse_port {
        // The kernel may not support it; fall back to a master-bound
        // socket inherited by every worker.
        if let Err(err) = socket::setsockopt(&fd, sockopt::ReusePort, &true) {
            warn!(?err, "SO_REUSEPORT unavailable, sharing one listening socket");
        }
    }
    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))
        .map_err(|e| ServerError::Bind { addr: addr.to_string(), source: e.into() })?;
    Ok(fd)
}

fn bind_tcp(address: &str, reuse_port: bool) -> Result<TcpListener, ServerError> {
    let addr = resolve_addr(address)?;
    let fd = new_inet_socket(addr, SockType::Stream, reuse_port)?;
    socket::listen(&fd, LISTEN_BACKLOG)?;
    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn bind_udp(address: &str, reuse_port: bool) -> Result<UdpSocket, ServerError> {
    let addr = resolve_addr(address)?;
    let fd = new_inet_socket(addr, SockType::Datagram, reuse_port)?;
    let socket = unsafe { UdpSocket::from_raw_fd(fd.into_raw_fd()) };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_unix(path: &str) -> Result<UnixListener, ServerError> {
    // A previous run may have left the socket file behind.
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ServerError::Bind { addr: path.to_string(), source: e }),
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| ServerError::Bind { addr: path.to_string(), source: e })?;
    listener.set_nonblocking(true)?;
    socket::listen(&listener, LISTEN_BACKLOG)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Write},
        net::TcpStream,
        thread,
    };

    use keel_net::CodecRegistry;
    use keel_reactor::PollReactor;

    use super::*;

    #[test]
    fn text_listener_accepts_and_echoes() {
        let reactor: ReactorHandle = Rc::new(PollReactor::new().expect("poll reactor"));
        let stats = Rc::new(Statistics::default());

        let mut server = Server::new("text://127.0.0.1:0").expect("listen target");
        server.set_name("echo-test");
        server.set_on_message(Rc::new(|conn, line| {
            conn.send(line);
        }));
        {
            let reactor = reactor.clone();
            server.set_on_close(Rc::new(move |_| reactor.stop()));
        }
        server.resolve(&CodecRegistry::default()).expect("resolve codec");
        server.ensure_bound().expect("bind");
        let addr = server.bound_addr().expect("bound addr");

        let server = Rc::new(RefCell::new(server));
        start_accepting(&server, &reactor, &stats);

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("connect");
            stream.write_all(b"ping\n").expect("write");
            let mut reply = String::new();
            BufReader::new(&stream).read_line(&mut reply).expect("read reply");
            reply
        });

        reactor.run();

        assert_eq!(client.join().expect("client thread"), "ping\n");
        assert_eq!(stats.total_request.get(), 1);
        assert!(server.borrow().connections().is_empty());
    }

    #[test]
    fn udp_listener_replies_per_datagram() {
        let reactor: ReactorHandle = Rc::new(PollReactor::new().expect("poll reactor"));
        let stats = Rc::new(Statistics::default());

        let mut server = Server::new("udp://127.0.0.1:0").expect("listen target");
        server.set_name("udp-test");
        {
            let reactor = reactor.clone();
            server.set_on_message(Rc::new(move |conn, data| {
                let mut reply = b"received: ".to_vec();
                reply.extend_from_slice(&data);
                conn.send(bytes::Bytes::from(reply));
                reactor.stop();
            }));
        }
        server.resolve(&CodecRegistry::default()).expect("resolve");
        server.ensure_bound().expect("bind");
        let addr = server.bound_addr().expect("bound addr");

        let server = Rc::new(RefCell::new(server));
        start_accepting(&server, &reactor, &stats);

        let client = thread::spawn(move || {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind client");
            socket.send_to(b"xiami", addr).expect("send");
            let mut buf = [0_u8; 64];
            let (n, _) = socket.recv_from(&mut buf).expect("recv");
            buf[..n].to_vec()
        });

        reactor.run();

        assert_eq!(client.join().expect("client thread"), b"received: xiami");
        assert_eq!(stats.total_request.get(), 1);
    }

    #[test]
    fn unknown_codec_scheme_fails_at_resolve() {
        let mut server = Server::new("nosuch://127.0.0.1:0").expect("listen target");
        assert!(server.resolve(&CodecRegistry::default()).is_err());
    }

    #[test]
    fn ssl_without_certificate_fails_at_resolve() {
        let mut server = Server::new("ssl://127.0.0.1:0").expect("listen target");
        assert!(server.resolve(&CodecRegistry::default()).is_err());
    }
}
