//! Everything that runs inside a forked worker: reactor setup, signal
//! wiring, privilege drop, graceful drain, and the dump appenders.

use std::{
    cell::{Cell, RefCell},
    ffi::CString,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    process,
    rc::Rc,
    time::Duration,
};

use keel_net::Statistics;
use keel_reactor::{PollReactor, Reactor, ReactorHandle, SelectReactor};
use keel_utils::{format_bytes, proc, LockedFile};
use tracing::{error, info, warn};

use crate::{
    server::{self, Server},
    supervisor::Backend,
    EXIT_CALLBACK_FAILURE,
};

pub(crate) struct WorkerArgs {
    pub servers: Vec<Rc<RefCell<Server>>>,
    pub index: usize,
    pub backend: Backend,
    pub status_file: PathBuf,
}

struct WorkerRuntime {
    reactor: ReactorHandle,
    server: Rc<RefCell<Server>>,
    stats: Rc<Statistics>,
    status_file: PathBuf,
    draining: Cell<bool>,
}

/// Entry point of a freshly forked child. Never returns.
pub(crate) fn run(args: WorkerArgs) -> ! {
    let code = run_inner(args);
    process::exit(code);
}

fn run_inner(args: WorkerArgs) -> i32 {
    // Inherited fds of the other listeners are not ours to hold open.
    for (i, server) in args.servers.iter().enumerate() {
        if i != args.index {
            server.borrow_mut().close_socket();
        }
    }
    let server = Rc::clone(&args.servers[args.index]);

    if server.borrow().reuse_port() {
        if let Err(err) = server.borrow_mut().ensure_bound() {
            error!(?err, "worker failed to bind its listening socket");
            std::thread::sleep(Duration::from_secs(1));
            return EXIT_CALLBACK_FAILURE;
        }
    }

    drop_privileges(&server);
    set_process_title(&server);

    let reactor: ReactorHandle = match args.backend {
        Backend::Poll => match PollReactor::new() {
            Ok(reactor) => Rc::new(reactor),
            Err(err) => {
                error!(?err, "worker could not create its event loop");
                return EXIT_CALLBACK_FAILURE;
            }
        },
        Backend::Select => match SelectReactor::new() {
            Ok(reactor) => Rc::new(reactor),
            Err(err) => {
                error!(?err, "worker could not create its event loop");
                return EXIT_CALLBACK_FAILURE;
            }
        },
    };

    // Panics that no per-connection handler claimed stop the worker; the
    // master respawns it and the exit histogram shows the 250.
    reactor.set_error_handler(Rc::new(|msg| {
        error!(%msg, "uncaught callback panic, stopping worker");
        process::exit(EXIT_CALLBACK_FAILURE);
    }));

    let runtime = Rc::new(WorkerRuntime {
        reactor: reactor.clone(),
        server: Rc::clone(&server),
        stats: Rc::new(Statistics::default()),
        status_file: args.status_file,
        draining: Cell::new(false),
    });

    install_signals(&runtime);

    let (on_start, on_stop, _) = server.borrow().lifecycle_hooks();
    server::start_accepting(&server, &reactor, &runtime.stats);

    if let Some(hook) = on_start {
        if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
            error!("on_server_start failed, backing off before exit");
            // Without the pause a crashing hook turns respawn into a
            // fork storm.
            std::thread::sleep(Duration::from_secs(1));
            return EXIT_CALLBACK_FAILURE;
        }
    }

    info!(
        server = %server.borrow().name(),
        listen = %server.borrow().listen_display(),
        "worker started"
    );
    reactor.run();

    if let Some(hook) = on_stop {
        let _ = catch_unwind(AssertUnwindSafe(|| hook()));
    }
    info!("worker stopped");
    0
}

fn install_signals(runtime: &Rc<WorkerRuntime>) {
    let reactor = &runtime.reactor;

    for signo in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGTSTP] {
        let rt = Rc::clone(runtime);
        if let Err(err) = reactor.on_signal(signo, Rc::new(move |_| rt.stop(false))) {
            warn!(signo, ?err, "worker signal registration");
        }
    }

    let rt = Rc::clone(runtime);
    let _ = reactor.on_signal(libc::SIGQUIT, Rc::new(move |_| rt.stop(true)));

    let rt = Rc::clone(runtime);
    let _ = reactor.on_signal(libc::SIGUSR1, Rc::new(move |_| rt.reload(false)));
    let rt = Rc::clone(runtime);
    let _ = reactor.on_signal(libc::SIGUSR2, Rc::new(move |_| rt.reload(true)));

    // SIGIOT on Linux; requests one status row.
    let rt = Rc::clone(runtime);
    let _ = reactor.on_signal(libc::SIGABRT, Rc::new(move |_| rt.append_status_row()));
    let rt = Rc::clone(runtime);
    let _ = reactor.on_signal(libc::SIGIO, Rc::new(move |_| rt.append_connection_rows()));

    let _ = reactor.on_signal(libc::SIGPIPE, Rc::new(|_| {}));
}

impl WorkerRuntime {
    /// Stop this worker. Ungraceful tears connections down immediately;
    /// graceful stops accepting and waits for the table to drain.
    fn stop(&self, graceful: bool) {
        if graceful {
            if self.draining.replace(true) {
                return;
            }
            server::pause_accept(&self.server, &self.reactor);
            let registry = self.server.borrow().connections();
            let reactor = self.reactor.clone();
            registry.drain_then(Rc::new(move || reactor.stop()));
        } else {
            let registry = self.server.borrow().connections();
            for conn in registry.connections() {
                conn.destroy();
            }
            self.reactor.stop();
        }
    }

    /// Reload request. Only reloadable listeners recycle their workers;
    /// the hook runs either way.
    fn reload(&self, graceful: bool) {
        let (_, _, on_reload) = self.server.borrow().lifecycle_hooks();
        if let Some(hook) = on_reload {
            hook();
        }
        if self.server.borrow().reloadable() {
            self.stop(graceful);
        }
    }

    fn append_status_row(&self) {
        let row = self.status_row();
        append_line(&self.status_file, &row);
    }

    fn status_row(&self) -> String {
        let pid = process::id();
        let memory = proc::memory_kib(pid as i32)
            .map_or_else(|| "-".to_string(), |kib| format_bytes(kib * 1024));
        let server = self.server.borrow();
        format!(
            "{:<10} {:<9} {:<28} {:<16} {:<11} {:<9} {:<6} {:<13} {:<6} [ok]\n",
            pid,
            memory,
            server.listen_display(),
            server.name(),
            server.connections().len(),
            self.stats.send_fail.get(),
            self.reactor.timer_count(),
            self.stats.total_request.get(),
            self.stats.take_qps(),
        )
    }

    fn append_connection_rows(&self) {
        let mut rows = String::new();
        let pid = process::id();
        let server = self.server.borrow();
        let protocol = server.protocol_label();
        for conn in server.connections().connections() {
            let (ipv4, ipv6) = match conn.remote_ip() {
                Some(ip) => (u8::from(ip.is_ipv4()), u8::from(ip.is_ipv6())),
                None => (0, 0),
            };
            let local = conn
                .local_addr()
                .map_or_else(|| "-".to_string(), |a| a.to_string());
            let foreign = conn
                .remote_addr()
                .map_or_else(|| "-".to_string(), |a| a.to_string());
            rows.push_str(&format!(
                "{:<9} {:<14} {:<6} {:<7} {:<10} {:<5} {:<5} {:<8} {:<8} {:<9} {:<9} {:<12} {:<22} {}\n",
                pid,
                server.name(),
                conn.id(),
                conn.transport(),
                protocol,
                ipv4,
                ipv6,
                format_bytes(conn.recv_queue_bytes() as u64),
                format_bytes(conn.send_queue_bytes() as u64),
                format_bytes(conn.bytes_read()),
                format_bytes(conn.bytes_written()),
                conn.status_label(),
                local,
                foreign,
            ));
        }
        if !rows.is_empty() {
            append_line(&self.status_file, &rows);
        }
    }
}

fn append_line(path: &Path, line: &str) {
    match LockedFile::open(path) {
        Ok(mut file) => {
            if let Err(err) = file.append(line.as_bytes()) {
                warn!(?err, "could not append to the status file");
            }
        }
        Err(err) => warn!(?err, "could not open the status file"),
    }
}

fn drop_privileges(server: &Rc<RefCell<Server>>) {
    let (user, group) = {
        let server = server.borrow();
        (server.user().map(String::from), server.group().map(String::from))
    };

    let group_entry = group.as_deref().and_then(|name| {
        nix::unistd::Group::from_name(name)
            .ok()
            .flatten()
            .or_else(|| {
                warn!(group = name, "unknown group, keeping current gid");
                None
            })
    });
    let user_entry = user.as_deref().and_then(|name| {
        nix::unistd::User::from_name(name)
            .ok()
            .flatten()
            .or_else(|| {
                warn!(user = name, "unknown user, keeping current uid");
                None
            })
    });

    if let Some(user) = &user_entry {
        let gid = group_entry.as_ref().map_or(user.gid, |g| g.gid);
        if let Ok(name) = CString::new(user.name.clone()) {
            let _ = nix::unistd::initgroups(&name, gid);
        }
        if let Err(err) = nix::unistd::setgid(gid) {
            warn!(?err, "setgid failed, check master privileges");
        }
        if let Err(err) = nix::unistd::setuid(user.uid) {
            warn!(?err, "setuid failed, check master privileges");
        }
    } else if let Some(group) = &group_entry {
        if let Err(err) = nix::unistd::setgid(group.gid) {
            warn!(?err, "setgid failed, check master privileges");
        }
    }
}

fn set_process_title(server: &Rc<RefCell<Server>>) {
    let title = {
        let server = server.borrow();
        format!("keel: worker {} {}", server.name(), server.listen_display())
    };
    if let Ok(title) = CString::new(title) {
        let _ = nix::sys::prctl::set_name(&title);
    }
}
