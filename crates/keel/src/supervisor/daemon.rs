//! Daemonisation and pid-file plumbing for the master process.

use std::{fs, path::Path, process};

use keel_utils::proc;
use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::{dup2, fork, setsid, ForkResult},
};

use crate::ServerError;

/// Classic double fork: detach from the controlling terminal, start a new
/// session, and point stdio at /dev/null and the log file.
pub(crate) fn daemonize(log_file: &Path) -> Result<(), ServerError> {
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }
    setsid()?;
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }
    nix::sys::stat::umask(Mode::empty());
    redirect_stdio(log_file)
}

fn redirect_stdio(log_file: &Path) -> Result<(), ServerError> {
    let devnull = open("/dev/null", OFlag::O_RDONLY, Mode::empty())?;
    dup2(devnull, 0)?;
    let _ = nix::unistd::close(devnull);

    let log = open(
        log_file,
        OFlag::O_WRONLY | OFlag::O_APPEND | OFlag::O_CREAT,
        Mode::from_bits_truncate(0o644),
    )?;
    dup2(log, 1)?;
    dup2(log, 2)?;
    let _ = nix::unistd::close(log);
    Ok(())
}

pub(crate) fn write_pid(path: &Path) -> Result<(), ServerError> {
    fs::write(path, format!("{}\n", process::id()))?;
    Ok(())
}

pub(crate) fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub(crate) fn remove_pid(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Liveness probe: kill-0, then compare `/proc/<pid>/cmdline` with our own
/// program name so a recycled pid is not mistaken for the master.
pub(crate) fn master_is_alive(pid: i32, signature: &str) -> bool {
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
        return false;
    }
    match proc::cmdline(pid) {
        Some(cmdline) => cmdline.contains(signature),
        // No /proc on this platform: kill-0 is the best we have.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.pid");

        write_pid(&path).expect("write pid");
        assert_eq!(read_pid(&path), Some(process::id() as i32));

        remove_pid(&path);
        assert_eq!(read_pid(&path), None);
        remove_pid(&path);
    }

    #[test]
    fn dead_pid_is_not_alive() {
        // Fork and reap a child so its pid is definitely gone.
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => process::exit(0),
            ForkResult::Parent { child } => {
                nix::sys::wait::waitpid(child, None).expect("waitpid");
                assert!(!master_is_alive(child.as_raw(), "anything"));
            }
        }
    }

    #[test]
    fn own_pid_matches_own_signature() {
        let me = process::id() as i32;
        let arg0 = std::env::args().next().expect("argv0");
        let stem = Path::new(&arg0)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .expect("stem");
        assert!(master_is_alive(me, &stem));
    }
}
