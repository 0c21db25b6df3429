//! Client-side connect semantics and connection piping.

use std::{
    cell::{Cell, RefCell},
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    rc::Rc,
    sync::Arc,
    thread,
    time::Duration,
};

use bytes::Bytes;
use keel_net::{
    AsyncTcpConnection, CallbackSet, ConnectionOptions, ErrorCode, StreamSocket, TcpConnection,
    TextCodec,
};
use keel_reactor::{PollReactor, Reactor, ReactorHandle};

fn reactor() -> ReactorHandle {
    Rc::new(PollReactor::new().expect("poll reactor"))
}

fn arm_watchdog(reactor: &ReactorHandle, expired: &Rc<Cell<bool>>) {
    let expired = expired.clone();
    let handle = reactor.clone();
    reactor.delay(
        Duration::from_secs(10),
        Rc::new(move || {
            expired.set(true);
            handle.stop();
        }),
    );
}

#[test]
fn connect_fires_on_connect_then_exchanges_messages() {
    let reactor = reactor();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    let echo = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = [0_u8; 64];
        let n = stream.read(&mut buf).expect("read");
        stream.write_all(&buf[..n]).expect("write back");
    });

    let connected = Rc::new(Cell::new(false));
    let replies = Rc::new(RefCell::new(Vec::new()));

    let mut callbacks = CallbackSet::default();
    let connected_flag = connected.clone();
    callbacks.on_connect = Some(Rc::new(move |conn| {
        connected_flag.set(true);
        conn.send(Bytes::from_static(b"hello"));
    }));
    let sink = replies.clone();
    let stopper = reactor.clone();
    callbacks.on_message = Some(Rc::new(move |_, msg| {
        sink.borrow_mut().push(msg);
        stopper.stop();
    }));

    let client = AsyncTcpConnection::new(
        reactor.clone(),
        addr,
        Some(Arc::new(TextCodec)),
        callbacks,
        None,
    );
    client.connect().expect("connect");

    let expired = Rc::new(Cell::new(false));
    arm_watchdog(&reactor, &expired);
    reactor.run();
    assert!(!expired.get(), "echo exchange timed out");

    assert!(connected.get(), "on_connect must fire on successful connect");
    assert_eq!(replies.borrow().len(), 1);
    assert_eq!(&replies.borrow()[0][..], b"hello");
    echo.join().expect("echo thread");
}

#[test]
fn failed_connect_reports_connect_fail_and_no_close() {
    let reactor = reactor();
    // Grab a port that is then immediately closed again.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    };

    let errors = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(false));

    let mut callbacks = CallbackSet::default();
    let sink = errors.clone();
    let stopper = reactor.clone();
    callbacks.on_error = Some(Rc::new(move |_, code, _| {
        sink.borrow_mut().push(code);
        stopper.stop();
    }));
    let closed_flag = closed.clone();
    callbacks.on_close = Some(Rc::new(move |_| closed_flag.set(true)));

    let client = AsyncTcpConnection::new(reactor.clone(), dead_addr, None, callbacks, None);
    client.connect().expect("connect starts");

    let expired = Rc::new(Cell::new(false));
    arm_watchdog(&reactor, &expired);
    reactor.run();
    assert!(!expired.get(), "connect failure never surfaced");

    assert_eq!(*errors.borrow(), vec![ErrorCode::ConnectFail]);
    assert!(!closed.get(), "connect-phase failures never fire on_close");
}

#[test]
fn cancel_reconnect_drops_the_pending_attempt() {
    let reactor = reactor();
    let addr = "127.0.0.1:9".parse().expect("addr");
    let client = AsyncTcpConnection::new(reactor.clone(), addr, None, CallbackSet::default(), None);

    client.reconnect(Duration::from_secs(30));
    assert_eq!(reactor.timer_count(), 1);

    // Replacing the outstanding attempt keeps a single timer.
    client.reconnect(Duration::from_secs(30));
    assert_eq!(reactor.timer_count(), 1);

    client.cancel_reconnect();
    assert_eq!(reactor.timer_count(), 0);
}

#[test]
fn pipe_forwards_messages_and_propagates_close() {
    let reactor = reactor();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    let upstream_peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).expect("connect upstream");
        stream.write_all(b"through\n").expect("write");
        // Closing the source must ripple to the destination.
        drop(stream);
    });
    let (src_stream, _) = listener.accept().expect("accept src");

    let downstream_done = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).expect("connect downstream");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).expect("read until close");
        received
    });
    let (dest_stream, _) = listener.accept().expect("accept dest");

    let mut src_opts = ConnectionOptions::new(1);
    src_opts.codec = Some(Arc::new(TextCodec));
    let src = TcpConnection::accept(reactor.clone(), StreamSocket::Tcp(src_stream), src_opts)
        .expect("wrap src");
    src.fire_connect();

    let mut dest_opts = ConnectionOptions::new(2);
    dest_opts.codec = Some(Arc::new(TextCodec));
    let dest = TcpConnection::accept(reactor.clone(), StreamSocket::Tcp(dest_stream), dest_opts)
        .expect("wrap dest");
    dest.fire_connect();

    src.pipe(&dest);
    {
        let stopper = reactor.clone();
        dest.set_on_close(Rc::new(move |_| stopper.stop()));
    }

    let expired = Rc::new(Cell::new(false));
    arm_watchdog(&reactor, &expired);
    reactor.run();
    assert!(!expired.get(), "pipe never completed");

    let received = downstream_done.join().expect("downstream thread");
    assert_eq!(received, b"through\n");
    upstream_peer.join().expect("upstream thread");
}
