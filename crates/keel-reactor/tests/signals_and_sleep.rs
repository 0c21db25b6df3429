use std::{cell::Cell, rc::Rc, time::Duration};

use keel_reactor::{sleep, PollReactor, Reactor, ReactorHandle};

#[test]
fn signal_is_delivered_on_the_loop_thread() {
    // SIGUSR2 is reserved for this test binary; nothing else registers it.
    let reactor: ReactorHandle = Rc::new(PollReactor::new().expect("poll reactor"));

    let seen = Rc::new(Cell::new(0));
    let seen_in_cb = seen.clone();
    let reactor_in_cb = reactor.clone();
    reactor
        .on_signal(
            libc::SIGUSR2,
            Rc::new(move |signo| {
                seen_in_cb.set(signo);
                reactor_in_cb.stop();
            }),
        )
        .expect("register SIGUSR2");

    reactor.delay(
        Duration::from_millis(5),
        Rc::new(|| unsafe {
            libc::kill(libc::getpid(), libc::SIGUSR2);
        }),
    );
    reactor.run();

    assert_eq!(seen.get(), libc::SIGUSR2);
    assert!(reactor.off_signal(libc::SIGUSR2));
    assert!(!reactor.off_signal(libc::SIGUSR2));
}

#[test]
fn sleep_keeps_the_loop_running_underneath() {
    let reactor: ReactorHandle = Rc::new(PollReactor::new().expect("poll reactor"));

    let ticks = Rc::new(Cell::new(0_u32));
    let ticks_in_cb = ticks.clone();
    let id = reactor.repeat(
        Duration::from_millis(5),
        Rc::new(move || ticks_in_cb.set(ticks_in_cb.get() + 1)),
    );

    sleep(&reactor, Duration::from_millis(40));

    assert!(ticks.get() >= 3, "repeat timer starved during sleep: {} ticks", ticks.get());
    reactor.off_repeat(id);
}

#[test]
fn forbidden_signals_are_refused() {
    let reactor = PollReactor::new().expect("poll reactor");
    assert!(reactor.on_signal(libc::SIGKILL, Rc::new(|_| {})).is_err());
}
