use std::{
    cell::RefCell,
    io,
    net::{SocketAddr, UdpSocket},
    os::fd::AsRawFd,
    rc::Rc,
};

use bytes::{Bytes, BytesMut};
use keel_reactor::{Reactor, ReactorHandle};
use tracing::{debug, warn};

use crate::{
    CallbackSet, Codec, CodecHandle, Conn, ConnectionContext, FrameVerdict, Statistics,
    DEFAULT_MAX_PACKAGE_SIZE,
};

/// Connection-shaped view of one inbound datagram.
///
/// Short-lived: it exists for the duration of the dispatch and writes
/// replies back through the listener's shared socket via `send_to`.
#[derive(Clone)]
pub struct UdpConnection {
    socket: Rc<UdpSocket>,
    peer: SocketAddr,
    id: u64,
    codec: Option<CodecHandle>,
    max_package_size: usize,
    /// The kernel rejects `send_to` on a connected socket (EISCONN).
    connected: bool,
}

impl UdpConnection {
    pub fn new(
        socket: Rc<UdpSocket>,
        peer: SocketAddr,
        id: u64,
        codec: Option<CodecHandle>,
    ) -> Self {
        Self {
            socket,
            peer,
            id,
            codec,
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            connected: false,
        }
    }

    fn new_connected(
        socket: Rc<UdpSocket>,
        peer: SocketAddr,
        id: u64,
        codec: Option<CodecHandle>,
    ) -> Self {
        Self { connected: true, ..Self::new(socket, peer, id, codec) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            connection_id: self.id,
            remote_addr: Some(self.peer),
            transport: "udp",
            max_package_size: self.max_package_size,
        }
    }

    /// Encode through the codec (when present) and write one datagram back.
    pub fn send(&self, data: Bytes) -> bool {
        let payload = match &self.codec {
            Some(codec) => {
                let encoded = codec.encode(data, &self.context());
                if encoded.is_empty() {
                    return true;
                }
                encoded
            }
            None => data,
        };
        self.send_datagram(&payload)
    }

    pub fn send_raw(&self, data: Bytes) -> bool {
        self.send_datagram(&data)
    }

    fn send_datagram(&self, payload: &[u8]) -> bool {
        let result = if self.connected {
            self.socket.send(payload)
        } else {
            self.socket.send_to(payload, self.peer)
        };
        match result {
            Ok(_) => true,
            Err(err) => {
                debug!(?err, peer = %self.peer, "udp: send");
                false
            }
        }
    }
}

/// Run the codec loop over one datagram and deliver the messages.
///
/// With a codec, `input` may frame several messages inside the packet and
/// is driven against the remaining tail; without one, the datagram is the
/// message.
pub fn dispatch_datagram(
    conn: &UdpConnection,
    datagram: BytesMut,
    callbacks: &CallbackSet,
    stats: Option<&Rc<Statistics>>,
) {
    let Some(on_message) = callbacks.on_message.clone() else { return };
    let handle = Conn::Udp(conn.clone());

    match conn.codec.clone() {
        None => {
            if let Some(stats) = stats {
                stats.bump_request();
            }
            on_message(&handle, datagram.freeze());
        }
        Some(codec) => {
            let ctx = conn.context();
            let mut rest = datagram.freeze();
            while !rest.is_empty() {
                let len = match codec.input(&rest, &ctx) {
                    FrameVerdict::Frame(len) if len > 0 && len <= rest.len() => len,
                    FrameVerdict::Frame(_) | FrameVerdict::Incomplete => {
                        // A datagram either holds whole frames or is junk;
                        // there is no stream to wait on.
                        warn!(peer = %conn.peer, "udp: truncated frame in datagram");
                        return;
                    }
                    FrameVerdict::Invalid => {
                        warn!(peer = %conn.peer, "udp: protocol error in datagram");
                        return;
                    }
                };
                let frame = rest.split_to(len);
                if let Some(stats) = stats {
                    stats.bump_request();
                }
                let message = codec.decode(frame, &ctx);
                on_message(&handle, message);
            }
        }
    }
}

struct AsyncUdpState {
    socket: Rc<UdpSocket>,
    callbacks: CallbackSet,
    codec: Option<CodecHandle>,
    connect_fired: bool,
    id: u64,
}

/// Client-side UDP: a long-lived connected socket with reactor-driven
/// reads. `on_connect` fires once, after `connect`.
pub struct AsyncUdpConnection {
    reactor: ReactorHandle,
    peer: SocketAddr,
    state: Rc<RefCell<AsyncUdpState>>,
}

impl AsyncUdpConnection {
    pub fn new(
        reactor: ReactorHandle,
        peer: SocketAddr,
        codec: Option<CodecHandle>,
        callbacks: CallbackSet,
        id: u64,
    ) -> io::Result<Self> {
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().expect("ipv4 any")
        } else {
            "[::]:0".parse().expect("ipv6 any")
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            reactor,
            peer,
            state: Rc::new(RefCell::new(AsyncUdpState {
                socket: Rc::new(socket),
                callbacks,
                codec,
                connect_fired: false,
                id,
            })),
        })
    }

    fn as_udp_conn(&self) -> UdpConnection {
        let state = self.state.borrow();
        if state.connect_fired {
            UdpConnection::new_connected(
                Rc::clone(&state.socket),
                self.peer,
                state.id,
                state.codec.clone(),
            )
        } else {
            UdpConnection::new(Rc::clone(&state.socket), self.peer, state.id, state.codec.clone())
        }
    }

    /// Connect the socket, fire `on_connect` once, and start reading.
    pub fn connect(&self) -> io::Result<()> {
        let fd = {
            let state = self.state.borrow();
            state.socket.connect(self.peer)?;
            state.socket.as_raw_fd()
        };

        let fire = {
            let mut state = self.state.borrow_mut();
            if state.connect_fired {
                false
            } else {
                state.connect_fired = true;
                true
            }
        };
        if fire {
            let cb = self.state.borrow().callbacks.on_connect.clone();
            if let Some(cb) = cb {
                cb(&Conn::Udp(self.as_udp_conn()));
            }
        }

        let state = Rc::clone(&self.state);
        let peer = self.peer;
        self.reactor.on_readable(
            fd,
            Rc::new(move |_| {
                let (socket, callbacks, codec, id) = {
                    let state = state.borrow();
                    (
                        Rc::clone(&state.socket),
                        state.callbacks.clone(),
                        state.codec.clone(),
                        state.id,
                    )
                };
                let mut buf = [0_u8; 65535];
                loop {
                    match socket.recv(&mut buf) {
                        Ok(n) => {
                            let conn = UdpConnection::new_connected(
                                Rc::clone(&socket),
                                peer,
                                id,
                                codec.clone(),
                            );
                            dispatch_datagram(
                                &conn,
                                BytesMut::from(&buf[..n]),
                                &callbacks,
                                None,
                            );
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            debug!(?err, "udp: recv");
                            break;
                        }
                    }
                }
            }),
        );
        Ok(())
    }

    pub fn send(&self, data: Bytes) -> bool {
        self.as_udp_conn().send(data)
    }

    pub fn close(&self) {
        let fd = self.state.borrow().socket.as_raw_fd();
        self.reactor.off_readable(fd);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::BufMut;

    use super::*;
    use crate::{Codec, FrameCodec};

    fn pair() -> (Rc<UdpSocket>, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
        let client = UdpSocket::bind("127.0.0.1:0").expect("bind client");
        (Rc::new(server), client)
    }

    #[test]
    fn reply_goes_back_to_the_datagram_peer() {
        let (server, client) = pair();
        let peer = client.local_addr().expect("client addr");

        let conn = UdpConnection::new(Rc::clone(&server), peer, 1, None);
        assert!(conn.send(Bytes::from_static(b"received: xiami")));

        let mut buf = [0_u8; 64];
        let (n, from) = client.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"received: xiami");
        assert_eq!(from, server.local_addr().expect("server addr"));
    }

    #[test]
    fn codec_frames_within_one_datagram_all_deliver() {
        let (server, client) = pair();
        let peer = client.local_addr().expect("client addr");
        let codec: CodecHandle = Arc::new(FrameCodec);

        let ctx = ConnectionContext {
            connection_id: 2,
            remote_addr: Some(peer),
            transport: "udp",
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
        };
        let mut packet = BytesMut::new();
        packet.put_slice(&codec.encode(Bytes::from_static(b"one"), &ctx));
        packet.put_slice(&codec.encode(Bytes::from_static(b"two"), &ctx));

        let got = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&got);
        let mut callbacks = CallbackSet::default();
        callbacks.on_message = Some(Rc::new(move |_, msg| sink.borrow_mut().push(msg)));

        let conn = UdpConnection::new(Rc::clone(&server), peer, 2, Some(codec));
        dispatch_datagram(&conn, packet, &callbacks, None);

        let got_ref = got.borrow();
        let got: Vec<&[u8]> = got_ref.iter().map(|m| &m[..]).collect::<Vec<_>>();
        assert_eq!(got, vec![&b"one"[..], b"two"]);
    }

    #[test]
    fn async_udp_fires_connect_once_and_receives_replies() {
        use std::cell::Cell;

        let reactor: ReactorHandle =
            Rc::new(keel_reactor::PollReactor::new().expect("poll reactor"));

        let peer = UdpSocket::bind("127.0.0.1:0").expect("bind peer");
        let peer_addr = peer.local_addr().expect("peer addr");
        let responder = std::thread::spawn(move || {
            let mut buf = [0_u8; 64];
            let (n, from) = peer.recv_from(&mut buf).expect("recv");
            assert_eq!(&buf[..n], b"ping");
            peer.send_to(b"pong", from).expect("reply");
        });

        let connects = Rc::new(Cell::new(0_u32));
        let got = Rc::new(RefCell::new(Vec::new()));

        let mut callbacks = CallbackSet::default();
        let connects_in_cb = connects.clone();
        callbacks.on_connect = Some(Rc::new(move |conn| {
            connects_in_cb.set(connects_in_cb.get() + 1);
            conn.send(Bytes::from_static(b"ping"));
        }));
        let sink = Rc::clone(&got);
        let stopper = reactor.clone();
        callbacks.on_message = Some(Rc::new(move |_, msg| {
            sink.borrow_mut().push(msg);
            stopper.stop();
        }));

        let client = AsyncUdpConnection::new(reactor.clone(), peer_addr, None, callbacks, 9)
            .expect("client socket");
        client.connect().expect("connect");
        reactor.run();

        assert_eq!(connects.get(), 1);
        let got_ref = got.borrow();
        let got: Vec<&[u8]> = got_ref.iter().map(|m| &m[..]).collect::<Vec<_>>();
        assert_eq!(got, vec![&b"pong"[..]]);
        client.close();
        responder.join().expect("responder thread");
    }

    #[test]
    fn truncated_frame_drops_the_whole_datagram() {
        let (server, client) = pair();
        let peer = client.local_addr().expect("client addr");
        let codec: CodecHandle = Arc::new(FrameCodec);

        // Header claims 32 bytes, packet carries 8.
        let mut packet = BytesMut::new();
        packet.put_u32(32);
        packet.put_slice(b"shrt");

        let got = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&got);
        let mut callbacks = CallbackSet::default();
        callbacks.on_message = Some(Rc::new(move |_, msg| sink.borrow_mut().push(msg)));

        let conn = UdpConnection::new(Rc::clone(&server), peer, 3, Some(codec));
        dispatch_datagram(&conn, packet, &callbacks, None);
        assert!(got.borrow().is_empty());
    }
}
