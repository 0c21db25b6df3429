//! The master process: CLI dispatch, daemonisation, worker forking,
//! signal-driven lifecycle, rolling reloads, and the dump protocol.

mod cli;
mod daemon;

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, VecDeque},
    ffi::CString,
    path::{Path, PathBuf},
    process,
    rc::Rc,
    time::{Duration, SystemTime},
};

use clap::Parser;
use keel_net::CodecRegistry;
use keel_utils::{proc, LockedFile};
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use crate::{
    server::Server,
    supervisor::cli::{Cli, Command},
    timer::TickScheduler,
    worker::{self, WorkerArgs},
    ServerError,
};

/// Which reactor driver workers install.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Poll,
    Select,
}

impl Backend {
    fn label(self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Select => "select",
        }
    }
}

const MASTER_SIGNALS: [i32; 11] = [
    libc::SIGCHLD,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGHUP,
    libc::SIGTSTP,
    libc::SIGQUIT,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGABRT,
    libc::SIGIO,
    libc::SIGALRM,
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Stopping,
}

#[derive(Default)]
struct MasterState {
    /// pid → (server index, ordinal).
    pids: HashMap<i32, (usize, usize)>,
    /// server index → ordinal → pid.
    slots: HashMap<usize, BTreeMap<usize, i32>>,
    /// Rolling reload queue, signalled one pid at a time.
    pids_to_restart: VecDeque<i32>,
    reload_graceful: bool,
    /// server index → exit status → count.
    exit_histogram: HashMap<usize, BTreeMap<i32, u64>>,
}

/// What the master still owes after [`Supervisor::record_exit`].
struct ExitOutcome {
    respawn: Option<(usize, usize)>,
    resume_reload: bool,
}

/// Record a newly spawned worker in the master's pid maps.
fn record_spawn(state: &mut MasterState, idx: usize, ordinal: usize, pid: i32) {
    state.pids.insert(pid, (idx, ordinal));
    state.slots.entry(idx).or_default().insert(ordinal, pid);
}

pub type MasterHook = Rc<dyn Fn()>;
pub type ServerExitHook = Rc<dyn Fn(&str, i32, i32)>;

/// Owns every listener and runs the whole master/worker lifecycle.
pub struct Supervisor {
    name: String,
    servers: Vec<Rc<RefCell<Server>>>,
    codecs: CodecRegistry,
    backend: Backend,
    stop_timeout: Duration,
    pid_file: PathBuf,
    log_file: PathBuf,
    status_file: PathBuf,
    on_master_reload: Option<MasterHook>,
    on_master_stop: Option<MasterHook>,
    on_server_exit: Option<ServerExitHook>,

    ticker: Rc<TickScheduler>,
    start_time: SystemTime,
    phase: Phase,
}

impl Supervisor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let stem = program_stem().unwrap_or_else(|| name.clone());
        Self {
            name,
            servers: Vec::new(),
            codecs: CodecRegistry::default(),
            backend: Backend::Poll,
            stop_timeout: Duration::from_secs(2),
            pid_file: PathBuf::from(format!("{stem}.pid")),
            log_file: PathBuf::from(format!("{stem}.log")),
            status_file: PathBuf::from(format!("{stem}.status")),
            on_master_reload: None,
            on_master_stop: None,
            on_server_exit: None,
            ticker: Rc::new(TickScheduler::new()),
            start_time: SystemTime::now(),
            phase: Phase::Running,
        }
    }

    // ---- configuration ---------------------------------------------------

    pub fn add_server(&mut self, server: Server) {
        self.servers.push(Rc::new(RefCell::new(server)));
    }

    pub fn set_backend(&mut self, backend: Backend) {
        self.backend = backend;
    }

    /// Seconds before an ungraceful stop escalates to SIGKILL.
    pub fn set_stop_timeout(&mut self, timeout: Duration) {
        self.stop_timeout = timeout;
    }

    pub fn set_pid_file(&mut self, path: impl Into<PathBuf>) {
        self.pid_file = path.into();
    }

    pub fn set_log_file(&mut self, path: impl Into<PathBuf>) {
        self.log_file = path.into();
    }

    pub fn set_status_file(&mut self, path: impl Into<PathBuf>) {
        self.status_file = path.into();
    }

    /// Register application codecs beyond the built-ins.
    pub fn codecs_mut(&mut self) -> &mut CodecRegistry {
        &mut self.codecs
    }

    pub fn set_on_master_reload(&mut self, hook: MasterHook) {
        self.on_master_reload = Some(hook);
    }

    pub fn set_on_master_stop(&mut self, hook: MasterHook) {
        self.on_master_stop = Some(hook);
    }

    /// Runs in the master for every worker exit: (server name, pid, status).
    pub fn set_on_server_exit(&mut self, hook: ServerExitHook) {
        self.on_server_exit = Some(hook);
    }

    // ---- entry -----------------------------------------------------------

    /// Parse the command line and run the requested verb. The `start`
    /// path only returns on configuration or bind failure.
    pub fn run_all(mut self) -> Result<(), ServerError> {
        let cli = Cli::parse();
        let signature = program_stem().unwrap_or_else(|| self.name.clone());
        let existing = daemon::read_pid(&self.pid_file)
            .filter(|pid| daemon::master_is_alive(*pid, &signature));

        match cli.command {
            Command::Start { daemon, quiet } => {
                if let Some(pid) = existing {
                    eprintln!("keel: already running (pid {pid})");
                    process::exit(1);
                }
                self.start(daemon, quiet)
            }
            Command::Stop { graceful } => {
                self.cli_stop(existing, graceful);
                process::exit(0);
            }
            Command::Restart { daemon, graceful, quiet } => {
                if existing.is_some() {
                    self.cli_stop(existing, graceful);
                }
                self.start(daemon, quiet)
            }
            Command::Reload { graceful } => {
                let pid = require_master(existing);
                let signo = if graceful { Signal::SIGUSR2 } else { Signal::SIGUSR1 };
                let _ = kill(Pid::from_raw(pid), signo);
                println!("keel: reload signal sent");
                process::exit(0);
            }
            Command::Status { live } => {
                let pid = require_master(existing);
                loop {
                    if live {
                        // Live mode repaints from the top-left each round.
                        print!("\x1b[H\x1b[2J");
                    }
                    let _ = kill(Pid::from_raw(pid), Signal::SIGABRT);
                    std::thread::sleep(Duration::from_millis(500));
                    print_status_file(&self.status_file);
                    if !live {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(500));
                }
                process::exit(0);
            }
            Command::Connections => {
                let pid = require_master(existing);
                let _ = kill(Pid::from_raw(pid), Signal::SIGIO);
                std::thread::sleep(Duration::from_millis(500));
                print!("{}", std::fs::read_to_string(&self.status_file).unwrap_or_default());
                process::exit(0);
            }
        }
    }

    fn cli_stop(&self, existing: Option<i32>, graceful: bool) {
        let pid = require_master(existing);
        let signo = if graceful { Signal::SIGQUIT } else { Signal::SIGTERM };
        let _ = kill(Pid::from_raw(pid), signo);
        println!("keel: stopping master (pid {pid})...");

        let deadline = (!graceful)
            .then(|| std::time::Instant::now() + self.stop_timeout + Duration::from_secs(3));
        loop {
            if kill(Pid::from_raw(pid), None).is_err() {
                println!("keel: stopped");
                return;
            }
            if let Some(deadline) = deadline {
                if std::time::Instant::now() > deadline {
                    eprintln!("keel: stop timed out");
                    process::exit(1);
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    // ---- start path ------------------------------------------------------

    fn start(mut self, daemonize: bool, quiet: bool) -> Result<(), ServerError> {
        if self.servers.is_empty() {
            return Err(ServerError::Config("no listeners configured".to_string()));
        }

        if daemonize {
            daemon::daemonize(&self.log_file)?;
        }
        let _ = crate::logging::init(&self.log_file, daemonize);

        // Resolve codecs and certificates, then bind shared sockets, all
        // before the first fork so failures surface immediately.
        for server in &self.servers {
            server.borrow_mut().resolve(&self.codecs)?;
            if !server.borrow().reuse_port() {
                server.borrow_mut().ensure_bound()?;
            }
        }

        daemon::write_pid(&self.pid_file)?;
        set_master_title();
        if !quiet && !daemonize {
            self.print_banner();
        }
        info!(pid = process::id(), "master started");

        let mut state = MasterState::default();
        let mut signals = Some(
            Signals::new(MASTER_SIGNALS).map_err(ServerError::Io)?,
        );

        for idx in 0..self.servers.len() {
            let count = self.servers[idx].borrow().count();
            for ordinal in 0..count {
                self.fork_one(idx, ordinal, &mut state, &mut signals)?;
            }
        }

        self.master_loop(&mut state, &mut signals);

        daemon::remove_pid(&self.pid_file);
        if let Some(hook) = &self.on_master_stop {
            hook();
        }
        info!("master stopped");
        Ok(())
    }

    fn master_loop(&mut self, state: &mut MasterState, signals: &mut Option<Signals>) {
        loop {
            let pending: Vec<i32> = match signals.as_mut() {
                Some(signals) => signals.wait().collect(),
                None => return,
            };
            for signo in pending {
                match signo {
                    libc::SIGCHLD => self.reap_children(state, signals),
                    libc::SIGALRM => self.ticker.tick(),
                    libc::SIGINT | libc::SIGTERM | libc::SIGHUP | libc::SIGTSTP => {
                        self.stop_all(state, false);
                    }
                    libc::SIGQUIT => self.stop_all(state, true),
                    libc::SIGUSR1 => self.reload(state, false),
                    libc::SIGUSR2 => self.reload(state, true),
                    libc::SIGABRT => self.dump_status(state),
                    libc::SIGIO => self.dump_connections(state),
                    _ => {}
                }
            }
            if self.phase == Phase::Stopping && state.pids.is_empty() {
                return;
            }
        }
    }

    // ---- forking ---------------------------------------------------------

    fn fork_one(
        &self,
        idx: usize,
        ordinal: usize,
        state: &mut MasterState,
        signals: &mut Option<Signals>,
    ) -> Result<(), ServerError> {
        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                record_spawn(state, idx, ordinal, child.as_raw());
                Ok(())
            }
            ForkResult::Child => {
                // Tear the master's signal plumbing out of this process
                // before the worker installs its own handlers; the pipe
                // behind it is shared with the master.
                drop(signals.take());
                worker::run(WorkerArgs {
                    servers: self.servers.clone(),
                    index: idx,
                    backend: self.backend,
                    status_file: self.status_file.clone(),
                })
            }
        }
    }

    fn reap_children(&mut self, state: &mut MasterState, signals: &mut Option<Signals>) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.child_exited(pid.as_raw(), code, state, signals);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.child_exited(pid.as_raw(), 128 + signal as i32, state, signals);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    fn child_exited(
        &mut self,
        pid: i32,
        status: i32,
        state: &mut MasterState,
        signals: &mut Option<Signals>,
    ) {
        let outcome = self.record_exit(pid, status, state);
        if let Some((idx, ordinal)) = outcome.respawn {
            if let Err(err) = self.fork_one(idx, ordinal, state, signals) {
                error!(?err, "respawn failed");
            }
        }
        if outcome.resume_reload {
            self.advance_reload(state);
        }
    }

    /// Bookkeeping for one reaped worker: pid maps, exit histogram, the
    /// exit hook, and the rolling-reload queue. Returns what the caller
    /// still has to do; the fork itself stays out so the queue mechanics
    /// run under test without spawning processes.
    fn record_exit(&mut self, pid: i32, status: i32, state: &mut MasterState) -> ExitOutcome {
        let Some((idx, ordinal)) = state.pids.remove(&pid) else {
            return ExitOutcome { respawn: None, resume_reload: false };
        };
        if let Some(slots) = state.slots.get_mut(&idx) {
            slots.remove(&ordinal);
        }
        *state
            .exit_histogram
            .entry(idx)
            .or_default()
            .entry(status)
            .or_default() += 1;

        let server_name = self.servers[idx].borrow().name().to_string();
        if status == 0 {
            info!(pid, server = %server_name, "worker exited");
        } else {
            warn!(pid, status, server = %server_name, "worker exited abnormally");
        }
        if let Some(hook) = &self.on_server_exit {
            hook(&server_name, pid, status);
        }

        if self.phase == Phase::Stopping {
            return ExitOutcome { respawn: None, resume_reload: false };
        }

        let was_reloading = state.pids_to_restart.front() == Some(&pid);
        state.pids_to_restart.retain(|p| *p != pid);
        ExitOutcome { respawn: Some((idx, ordinal)), resume_reload: was_reloading }
    }

    // ---- lifecycle verbs -------------------------------------------------

    fn stop_all(&mut self, state: &mut MasterState, graceful: bool) {
        if self.phase == Phase::Stopping {
            return;
        }
        self.phase = Phase::Stopping;
        info!(graceful, "stopping all workers");

        let signo = if graceful { Signal::SIGQUIT } else { Signal::SIGINT };
        let targets: Vec<i32> = state.pids.keys().copied().collect();
        for pid in &targets {
            let _ = kill(Pid::from_raw(*pid), signo);
        }

        if !graceful {
            // Escalate stragglers once the stop timeout elapses.
            self.ticker.add(
                self.stop_timeout.as_secs().max(1),
                false,
                Rc::new(move || {
                    for pid in &targets {
                        let _ = kill(Pid::from_raw(*pid), Signal::SIGKILL);
                    }
                }),
            );
        }
    }

    fn reload(&mut self, state: &mut MasterState, graceful: bool) {
        if self.phase == Phase::Stopping {
            return;
        }
        info!(graceful, "rolling reload");
        if let Some(hook) = &self.on_master_reload {
            hook();
        }
        state.reload_graceful = graceful;

        let signo = if graceful { Signal::SIGUSR2 } else { Signal::SIGUSR1 };
        state.pids_to_restart.clear();
        for (idx, server) in self.servers.iter().enumerate() {
            let reloadable = server.borrow().reloadable();
            let pids = state.slots.get(&idx).into_iter().flat_map(|m| m.values().copied());
            if reloadable {
                state.pids_to_restart.extend(pids);
            } else {
                // Informational only: signalled once, never restarted.
                for pid in pids {
                    let _ = kill(Pid::from_raw(pid), signo);
                }
            }
        }
        self.advance_reload(state);
    }

    /// Signal the next queued pid; the chain continues from SIGCHLD.
    fn advance_reload(&self, state: &mut MasterState) {
        loop {
            let Some(&pid) = state.pids_to_restart.front() else { return };
            if !state.pids.contains_key(&pid) {
                state.pids_to_restart.pop_front();
                continue;
            }

            let signo = if state.reload_graceful { Signal::SIGUSR2 } else { Signal::SIGUSR1 };
            let _ = kill(Pid::from_raw(pid), signo);
            if !state.reload_graceful {
                self.ticker.add(
                    self.stop_timeout.as_secs().max(1),
                    false,
                    Rc::new(move || {
                        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                    }),
                );
            }
            return;
        }
    }

    // ---- dumps -----------------------------------------------------------

    fn dump_status(&self, state: &MasterState) {
        let mut header = String::new();
        let rule = "-".repeat(100);
        header.push_str(&format!("{rule}\nGLOBAL STATUS\n{rule}\n"));
        header.push_str(&format!("keel version: {}\n", env!("CARGO_PKG_VERSION")));
        let uptime = self
            .start_time
            .elapsed()
            .map_or_else(|_| "-".to_string(), |d| {
                humantime::format_duration(Duration::from_secs(d.as_secs())).to_string()
            });
        header.push_str(&format!("uptime: {uptime}\n"));
        header.push_str(&format!(
            "load average: {}\n",
            proc::loadavg().unwrap_or_else(|| "-".to_string())
        ));
        header.push_str(&format!("event-loop: {}\n", self.backend.label()));
        header.push_str(&format!(
            "{} servers, {} processes\n",
            self.servers.len(),
            state.pids.len()
        ));
        header.push_str(&format!("{:<20} {:<13} {}\n", "server_name", "exit_status", "exit_count"));
        for (idx, server) in self.servers.iter().enumerate() {
            let name = server.borrow().name().to_string();
            match state.exit_histogram.get(&idx) {
                None => header.push_str(&format!("{name:<20} {:<13} 0\n", 0)),
                Some(statuses) => {
                    for (status, count) in statuses {
                        header.push_str(&format!("{name:<20} {status:<13} {count}\n"));
                    }
                }
            }
        }
        header.push_str(&format!("{rule}\nPROCESS STATUS\n{rule}\n"));
        header.push_str(&format!(
            "{:<10} {:<9} {:<28} {:<16} {:<11} {:<9} {:<6} {:<13} {:<6} status\n",
            "pid",
            "memory",
            "listening",
            "server_name",
            "connections",
            "send_fail",
            "timers",
            "total_request",
            "qps",
        ));

        // Truncate first, then fan out; workers append their own rows.
        self.rewrite_status_file(&header);
        for pid in state.pids.keys() {
            let _ = kill(Pid::from_raw(*pid), Signal::SIGABRT);
        }
    }

    fn dump_connections(&self, state: &MasterState) {
        let header = format!(
            "{:<9} {:<14} {:<6} {:<7} {:<10} {:<5} {:<5} {:<8} {:<8} {:<9} {:<9} {:<12} {:<22} {}\n",
            "PID",
            "Server",
            "CID",
            "Trans",
            "Protocol",
            "ipv4",
            "ipv6",
            "Recv-Q",
            "Send-Q",
            "Bytes-R",
            "Bytes-W",
            "Status",
            "Local",
            "Foreign",
        );
        self.rewrite_status_file(&header);
        for pid in state.pids.keys() {
            let _ = kill(Pid::from_raw(*pid), Signal::SIGIO);
        }
    }

    fn rewrite_status_file(&self, header: &str) {
        match LockedFile::open(&self.status_file) {
            Ok(mut file) => {
                if let Err(err) =
                    file.truncate().and_then(|()| file.append(header.as_bytes()))
                {
                    warn!(?err, "could not rewrite the status file");
                }
            }
            Err(err) => warn!(?err, "could not open the status file"),
        }
    }

    fn print_banner(&self) {
        let rule = "-".repeat(76);
        println!("{rule}");
        println!("keel {} (event-loop: {})", env!("CARGO_PKG_VERSION"), self.backend.label());
        println!("{rule}");
        println!("{:<20} {:<32} {:<6} reloadable", "server", "listen", "count");
        for server in &self.servers {
            let server = server.borrow();
            println!(
                "{:<20} {:<32} {:<6} {}",
                server.name(),
                server.listen_display(),
                server.count(),
                server.reloadable(),
            );
        }
        println!("Press Ctrl+C to stop. Start with `-d` to daemonise.");
    }
}

/// Programmatic stop from inside a worker: signals the master (our
/// parent), which fans the stop out to every worker.
pub fn stop_all(graceful: bool) {
    let master = nix::unistd::getppid();
    let signo = if graceful { Signal::SIGQUIT } else { Signal::SIGTERM };
    let _ = kill(master, signo);
}

fn require_master(existing: Option<i32>) -> i32 {
    match existing {
        Some(pid) => pid,
        None => {
            eprintln!("keel: not running");
            process::exit(1);
        }
    }
}

static PROGRAM_STEM: once_cell::sync::Lazy<Option<String>> = once_cell::sync::Lazy::new(|| {
    let arg0 = std::env::args().next()?;
    Path::new(&arg0)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
});

fn program_stem() -> Option<String> {
    PROGRAM_STEM.clone()
}

fn set_master_title() {
    let arg0 = std::env::args().next().unwrap_or_default();
    if let Ok(title) = CString::new(format!("keel: master start_file={arg0}")) {
        let _ = nix::sys::prctl::set_name(&title);
    }
}

#[derive(Default, Debug, PartialEq, Eq)]
struct DumpTotals {
    rows: u64,
    connections: u64,
    send_fail: u64,
    requests: u64,
    qps: u64,
}

/// Sum the per-worker columns of a status dump: every line after the
/// `pid` header whose connections/send_fail/total_request/qps fields
/// parse as numbers.
fn sum_worker_rows(content: &str) -> DumpTotals {
    let mut totals = DumpTotals::default();
    let mut in_rows = false;
    for line in content.lines() {
        if line.starts_with("pid") {
            in_rows = true;
            continue;
        }
        if !in_rows {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let parsed = (
            fields[4].parse::<u64>(),
            fields[5].parse::<u64>(),
            fields[7].parse::<u64>(),
            fields[8].parse::<u64>(),
        );
        if let (Ok(c), Ok(s), Ok(r), Ok(q)) = parsed {
            totals.connections += c;
            totals.send_fail += s;
            totals.requests += r;
            totals.qps += q;
            totals.rows += 1;
        }
    }
    totals
}

/// Print the status file, appending a summary row that totals the
/// per-worker columns.
fn print_status_file(path: &Path) {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    print!("{content}");

    let totals = sum_worker_rows(&content);
    if totals.rows > 0 {
        println!(
            "{:<10} {:<9} {:<28} {:<16} {:<11} {:<9} {:<6} {:<13} {:<6} [summary]",
            "summary",
            "-",
            "-",
            "-",
            totals.connections,
            totals.send_fail,
            "-",
            totals.requests,
            totals.qps,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, Arc};

    use super::*;

    /// Fake worker pids for driving the master bookkeeping. The kernel
    /// caps real pids at 2^22, so `kill` on anything this large is a
    /// guaranteed ESRCH no-op.
    const FAKE_PID_BASE: i32 = 5_000_000;

    /// Ungraceful paths arm a real `alarm(1)` through the tick
    /// scheduler; keep SIGALRM from its default (fatal) disposition.
    fn absorb_sigalrm() {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            let flag = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register(libc::SIGALRM, flag).expect("register SIGALRM");
        });
    }

    fn supervisor_with(servers: &[(&str, bool)]) -> Supervisor {
        let mut supervisor = Supervisor::new("master-test");
        for (name, reloadable) in servers {
            let mut server = Server::new("tcp://127.0.0.1:0").expect("listen target");
            server.set_name(*name);
            server.set_reloadable(*reloadable);
            supervisor.add_server(server);
        }
        supervisor
    }

    fn seed_workers(state: &mut MasterState, idx: usize, count: usize, base: i32) -> Vec<i32> {
        (0..count)
            .map(|ordinal| {
                let pid = base + ordinal as i32;
                record_spawn(state, idx, ordinal, pid);
                pid
            })
            .collect()
    }

    #[test]
    fn rolling_reload_recycles_one_worker_at_a_time() {
        let mut supervisor = supervisor_with(&[("app", true)]);
        let mut state = MasterState::default();
        let old = seed_workers(&mut state, 0, 4, FAKE_PID_BASE);

        supervisor.reload(&mut state, true);
        assert_eq!(state.pids_to_restart.len(), 4, "every reloadable worker is queued");

        let mut fresh = Vec::new();
        for (round, &pid) in old.iter().enumerate() {
            // Only the queue head is ever in flight.
            assert_eq!(state.pids_to_restart.front(), Some(&pid));

            let outcome = supervisor.record_exit(pid, 0, &mut state);
            assert!(outcome.resume_reload, "the head's exit resumes the chain");
            let (idx, ordinal) = outcome.respawn.expect("recycled slot respawns");

            // The replacement lands before the next worker is signalled,
            // so the serving set never dips below count - 1.
            assert_eq!(state.pids.len(), 3);
            let new_pid = FAKE_PID_BASE + 100 + round as i32;
            record_spawn(&mut state, idx, ordinal, new_pid);
            fresh.push(new_pid);
            supervisor.advance_reload(&mut state);
            assert_eq!(state.pids.len(), 4, "all slots filled between rounds");
        }

        assert!(state.pids_to_restart.is_empty(), "queue drains completely");
        for pid in old {
            assert!(!state.pids.contains_key(&pid), "old pid {pid} must be gone");
        }
        for pid in fresh {
            assert!(state.pids.contains_key(&pid), "fresh pid {pid} must serve");
        }
    }

    #[test]
    fn non_reloadable_workers_are_not_queued() {
        let mut supervisor = supervisor_with(&[("static", false), ("app", true)]);
        let mut state = MasterState::default();
        let pinned = seed_workers(&mut state, 0, 2, FAKE_PID_BASE);
        let recycled = seed_workers(&mut state, 1, 2, FAKE_PID_BASE + 10);

        supervisor.reload(&mut state, true);

        assert_eq!(state.pids_to_restart.len(), 2);
        for pid in &recycled {
            assert!(state.pids_to_restart.contains(pid));
        }
        for pid in &pinned {
            assert!(!state.pids_to_restart.contains(pid), "non-reloadable stays put");
            assert!(state.pids.contains_key(pid));
        }
    }

    #[test]
    fn ungraceful_reload_arms_the_kill_escalation() {
        absorb_sigalrm();
        let mut supervisor = supervisor_with(&[("app", true)]);
        let mut state = MasterState::default();
        seed_workers(&mut state, 0, 2, FAKE_PID_BASE);

        supervisor.reload(&mut state, false);
        assert_eq!(
            supervisor.ticker.len(),
            1,
            "one SIGKILL escalation pending for the queue head"
        );
        supervisor.ticker.del_all();
    }

    #[test]
    fn advance_reload_skips_entries_that_already_died() {
        let supervisor = supervisor_with(&[("app", true)]);
        let mut state = MasterState::default();
        state.reload_graceful = true;
        let live = seed_workers(&mut state, 0, 1, FAKE_PID_BASE)[0];

        // A pid that was reaped before its turn came up.
        state.pids_to_restart.push_back(FAKE_PID_BASE + 999);
        state.pids_to_restart.push_back(live);

        supervisor.advance_reload(&mut state);
        assert_eq!(state.pids_to_restart.front(), Some(&live), "dead entry dropped");
        assert_eq!(state.pids_to_restart.len(), 1);
    }

    #[test]
    fn exits_while_stopping_do_not_respawn() {
        let mut supervisor = supervisor_with(&[("app", true)]);
        supervisor.phase = Phase::Stopping;
        let mut state = MasterState::default();
        let pid = seed_workers(&mut state, 0, 1, FAKE_PID_BASE)[0];

        let outcome = supervisor.record_exit(pid, 0, &mut state);
        assert!(outcome.respawn.is_none());
        assert!(!outcome.resume_reload);
        assert!(state.pids.is_empty());
    }

    #[test]
    fn abnormal_exits_land_in_the_histogram_and_fire_the_hook() {
        let mut supervisor = supervisor_with(&[("app", true)]);
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            supervisor.set_on_server_exit(Rc::new(move |name, pid, status| {
                seen.borrow_mut().push((name.to_string(), pid, status));
            }));
        }
        let mut state = MasterState::default();
        let pid = seed_workers(&mut state, 0, 1, FAKE_PID_BASE)[0];

        let outcome = supervisor.record_exit(pid, 250, &mut state);
        assert!(outcome.respawn.is_some(), "a crashed worker is replaced");
        assert_eq!(state.exit_histogram[&0][&250], 1);
        assert_eq!(*seen.borrow(), vec![("app".to_string(), pid, 250)]);

        // An unknown pid is not ours; nothing changes.
        let outcome = supervisor.record_exit(FAKE_PID_BASE + 999, 1, &mut state);
        assert!(outcome.respawn.is_none());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn summary_totals_equal_the_sum_of_worker_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.status");
        let fixture = "\
GLOBAL STATUS\n\
keel version: 0.1.0\n\
pid        memory    listening                    server_name      connections send_fail timers total_request qps    status\n\
5000001    1.5M      text://127.0.0.1:8080        app              3           1         2      100           7      [ok]\n\
5000002    2.0M      text://127.0.0.1:8080        app              5           0         2      50            3      [ok]\n";
        std::fs::write(&path, fixture).expect("write fixture");

        let content = std::fs::read_to_string(&path).expect("read fixture");
        let totals = sum_worker_rows(&content);
        assert_eq!(
            totals,
            DumpTotals { rows: 2, connections: 8, send_fail: 1, requests: 150, qps: 10 }
        );
    }

    #[test]
    fn summary_ignores_preamble_and_malformed_rows() {
        // Nothing counts before the process header.
        let totals = sum_worker_rows("5000001 1.5M x app 3 1 2 100 7 [ok]\n");
        assert_eq!(totals.rows, 0);

        // After it, short and non-numeric lines are skipped.
        let fixture = "\
pid memory listening server_name connections send_fail timers total_request qps status\n\
garbage line\n\
5000001    1.5M      text://127.0.0.1:8080        app              2           0         1      20            4      [ok]\n\
summary    -         -                            -                not-a-number 0        -      20            4      [summary]\n";
        let totals = sum_worker_rows(fixture);
        assert_eq!(
            totals,
            DumpTotals { rows: 1, connections: 2, send_fail: 0, requests: 20, qps: 4 }
        );
    }
}
