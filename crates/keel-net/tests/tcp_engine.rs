//! Engine behaviour over real loopback sockets: framing, backpressure,
//! close draining, pause/resume.

use std::{
    cell::{Cell, RefCell},
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    os::fd::RawFd,
    rc::Rc,
    sync::Arc,
    thread,
    time::Duration,
};

use bytes::Bytes;
use keel_net::{
    CallbackSet, ConnectionOptions, ConnectionRegistry, ConnectionStatus, Statistics,
    StreamSocket, TcpConnection, TextCodec,
};
use keel_reactor::{PollReactor, Reactor, ReactorHandle};

fn reactor() -> ReactorHandle {
    Rc::new(PollReactor::new().expect("poll reactor"))
}

/// Sets a small SO_SNDBUF so tests can provoke partial writes.
fn shrink_send_buffer(fd: RawFd) {
    let size: libc::c_int = 4096;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            std::ptr::addr_of!(size).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Accept one connection from `listener` and wrap it in the engine.
fn accept_wrapped(
    reactor: &ReactorHandle,
    listener: &TcpListener,
    opts: ConnectionOptions,
) -> TcpConnection {
    let (stream, _) = listener.accept().expect("accept");
    let conn = TcpConnection::accept(reactor.clone(), StreamSocket::Tcp(stream), opts)
        .expect("wrap accepted socket");
    conn.fire_connect();
    conn
}

/// Stop the loop if the scenario hangs; asserts on the flag afterwards.
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
fn codec_messages_arrive_identically_for_any_chunking() {
    let chunkings: [&[&[u8]]; 3] = [
        &[b"alpha\nbeta\ngamma\n"],
        &[b"alp", b"ha\nbe", b"ta\ngam", b"ma\n"],
        &[
            b"a", b"l", b"p", b"h", b"a", b"\n", b"beta", b"\n", b"g", b"amma\n",
        ],
    ];

    for (i, chunks) in chunkings.iter().enumerate() {
        let reactor = reactor();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let chunks: Vec<Vec<u8>> = chunks.iter().map(|c| c.to_vec()).collect();
        let writer = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).expect("connect");
            for chunk in chunks {
                client.write_all(&chunk).expect("write chunk");
                client.flush().expect("flush");
                thread::sleep(Duration::from_millis(5));
            }
            client
        });

        let messages = Rc::new(RefCell::new(Vec::new()));
        let connect_seen = Rc::new(Cell::new(false));

        let mut callbacks = CallbackSet::default();
        let connect_flag = connect_seen.clone();
        callbacks.on_connect = Some(Rc::new(move |_| connect_flag.set(true)));
        let sink = messages.clone();
        let stopper = reactor.clone();
        let connect_order = connect_seen.clone();
        callbacks.on_message = Some(Rc::new(move |_, msg| {
            assert!(connect_order.get(), "on_message before on_connect");
            sink.borrow_mut().push(msg);
            if sink.borrow().len() == 3 {
                stopper.stop();
            }
        }));

        let mut opts = ConnectionOptions::new(1);
        opts.codec = Some(Arc::new(TextCodec));
        opts.callbacks = callbacks;
        let _conn = accept_wrapped(&reactor, &listener, opts);

        let expired = Rc::new(Cell::new(false));
        arm_watchdog(&reactor, &expired);
        reactor.run();
        assert!(!expired.get(), "chunking {i}: timed out");

        let messages_ref = messages.borrow();
        let got: Vec<&[u8]> = messages_ref.iter().map(|m| &m[..]).collect::<Vec<_>>();
        assert_eq!(got, vec![&b"alpha"[..], b"beta", b"gamma"], "chunking {i}");
        writer.join().expect("writer thread");
    }
}

#[test]
fn backpressure_fires_full_and_drain_exactly_once() {
    const MAX_SEND_BUFFER: usize = 16 * 1024;
    const CHUNK: usize = 8 * 1024;

    let reactor = reactor();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    let reader = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).expect("connect");
        // Let the server-side buffer build up before draining.
        thread::sleep(Duration::from_millis(500));
        let mut total = 0_usize;
        let mut buf = [0_u8; 16 * 1024];
        loop {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => break,
            }
        }
        total
    });

    let full_count = Rc::new(Cell::new(0_u32));
    let drain_count = Rc::new(Cell::new(0_u32));
    let drop_errors = Rc::new(Cell::new(0_u32));

    let mut callbacks = CallbackSet::default();
    let full = full_count.clone();
    callbacks.on_buffer_full = Some(Rc::new(move |_| full.set(full.get() + 1)));
    let drain = drain_count.clone();
    let stopper = reactor.clone();
    callbacks.on_buffer_drain = Some(Rc::new(move |_| {
        drain.set(drain.get() + 1);
        stopper.stop();
    }));
    let errors = drop_errors.clone();
    callbacks.on_error = Some(Rc::new(move |_, _, _| errors.set(errors.get() + 1)));

    let stats = Rc::new(Statistics::default());
    let mut opts = ConnectionOptions::new(7);
    opts.callbacks = callbacks;
    opts.max_send_buffer_size = MAX_SEND_BUFFER;
    opts.stats = Some(stats.clone());
    let conn = accept_wrapped(&reactor, &listener, opts);
    shrink_send_buffer(conn_fd(&conn));

    let payload = Bytes::from(vec![b'x'; CHUNK]);
    let mut accepted_bytes = 0_usize;
    let mut rounds = 0_u32;
    while full_count.get() == 0 {
        assert!(rounds < 4096, "kernel swallowed everything, no crossing");
        assert!(conn.send(payload.clone()), "send before crossing must succeed");
        accepted_bytes += CHUNK;
        rounds += 1;
    }

    // Threshold reached: the next payload is dropped whole.
    assert!(!conn.send(payload.clone()), "send at full buffer must drop");
    assert_eq!(drop_errors.get(), 1, "drop must surface through on_error");
    assert_eq!(stats.send_fail.get(), 1);

    let expired = Rc::new(Cell::new(false));
    arm_watchdog(&reactor, &expired);
    reactor.run();
    assert!(!expired.get(), "drain never happened");

    assert_eq!(full_count.get(), 1, "one crossing, one on_buffer_full");
    assert_eq!(drain_count.get(), 1, "one on_buffer_drain after drain");

    conn.close(None);
    let received = reader.join().expect("reader thread");
    assert_eq!(received, accepted_bytes, "every accepted byte must arrive");
}

#[test]
fn close_waits_for_the_send_buffer_to_drain() {
    let reactor = reactor();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    let reader = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).expect("connect");
        thread::sleep(Duration::from_millis(300));
        let mut received = Vec::new();
        client.read_to_end(&mut received).expect("read_to_end");
        received.len()
    });

    let closed = Rc::new(Cell::new(0_u32));
    let mut callbacks = CallbackSet::default();
    let closed_in_cb = closed.clone();
    let stopper = reactor.clone();
    callbacks.on_close = Some(Rc::new(move |_| {
        closed_in_cb.set(closed_in_cb.get() + 1);
        stopper.stop();
    }));

    let mut opts = ConnectionOptions::new(9);
    opts.callbacks = callbacks;
    let conn = accept_wrapped(&reactor, &listener, opts);
    shrink_send_buffer(conn_fd(&conn));

    // Queue more than the kernel takes synchronously, then close.
    let big = Bytes::from(vec![b'z'; 4 * 1024 * 1024]);
    assert!(conn.send(big.clone()));
    conn.close(None);
    assert_eq!(conn.status(), ConnectionStatus::Closing);

    // Closing connections refuse further sends.
    assert!(!conn.send(Bytes::from_static(b"late")));

    let expired = Rc::new(Cell::new(false));
    arm_watchdog(&reactor, &expired);
    reactor.run();
    assert!(!expired.get(), "close drain never completed");

    assert_eq!(closed.get(), 1, "exactly one on_close");
    assert_eq!(conn.status(), ConnectionStatus::Closed);
    assert_eq!(reader.join().expect("reader thread"), big.len());
}

#[test]
fn protocol_error_destroys_the_connection() {
    let reactor = reactor();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    let writer = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).expect("connect");
        // No terminator, longer than the package cap below.
        client.write_all(&[b'a'; 128]).expect("write");
        client
    });

    let closed = Rc::new(Cell::new(false));
    let errored = Rc::new(Cell::new(false));

    let mut callbacks = CallbackSet::default();
    let closed_in_cb = closed.clone();
    let stopper = reactor.clone();
    callbacks.on_close = Some(Rc::new(move |_| {
        closed_in_cb.set(true);
        stopper.stop();
    }));
    let errored_in_cb = errored.clone();
    callbacks.on_error = Some(Rc::new(move |_, _, _| errored_in_cb.set(true)));

    let mut opts = ConnectionOptions::new(11);
    opts.codec = Some(Arc::new(TextCodec));
    opts.callbacks = callbacks;
    opts.max_package_size = 64;
    let conn = accept_wrapped(&reactor, &listener, opts);

    let expired = Rc::new(Cell::new(false));
    arm_watchdog(&reactor, &expired);
    reactor.run();
    assert!(!expired.get(), "protocol error never detected");

    assert!(closed.get(), "framing violation must close the connection");
    assert!(!errored.get(), "framing violation is not an on_error event");
    assert_eq!(conn.status(), ConnectionStatus::Closed);
    writer.join().expect("writer thread");
}

#[test]
fn pause_holds_messages_until_resume() {
    let reactor = reactor();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    let writer = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).expect("connect");
        client.write_all(b"queued\n").expect("write");
        client
    });

    let messages = Rc::new(RefCell::new(Vec::new()));
    let mut callbacks = CallbackSet::default();
    let sink = messages.clone();
    let stopper = reactor.clone();
    callbacks.on_message = Some(Rc::new(move |_, msg| {
        sink.borrow_mut().push(msg);
        stopper.stop();
    }));

    let mut opts = ConnectionOptions::new(13);
    opts.codec = Some(Arc::new(TextCodec));
    opts.callbacks = callbacks;
    let conn = accept_wrapped(&reactor, &listener, opts);

    conn.pause_recv();

    // Give the bytes time to arrive while paused.
    let probe = reactor.clone();
    reactor.delay(Duration::from_millis(100), Rc::new(move || probe.stop()));
    reactor.run();
    assert!(messages.borrow().is_empty(), "paused connection must not deliver");

    conn.resume_recv();
    let expired = Rc::new(Cell::new(false));
    arm_watchdog(&reactor, &expired);
    reactor.run();
    assert!(!expired.get(), "resume never delivered");

    assert_eq!(messages.borrow().len(), 1);
    assert_eq!(&messages.borrow()[0][..], b"queued");
    writer.join().expect("writer thread");
}

#[test]
fn registry_owns_connections_until_destroy() {
    let reactor = reactor();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = TcpStream::connect(addr).expect("connect");

    let registry = ConnectionRegistry::default();
    let mut opts = ConnectionOptions::new(21);
    opts.registry = Some(registry.clone());
    let conn = accept_wrapped(&reactor, &listener, opts);
    assert_eq!(registry.len(), 1);

    let drained = Rc::new(Cell::new(false));
    let flag = drained.clone();
    registry.drain_then(Rc::new(move || flag.set(true)));

    conn.destroy();
    assert!(registry.is_empty(), "destroy must remove the table entry");
    assert!(drained.get(), "drain notification fires when the table empties");
    drop(client);
}

fn conn_fd(conn: &TcpConnection) -> RawFd {
    conn.raw_fd().expect("fd for live connection")
}
