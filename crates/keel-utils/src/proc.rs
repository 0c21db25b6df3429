//! Best-effort `/proc` readers for the status and connection dumps.
//!
//! Every function degrades to `None` off Linux or when the file is gone
//! (e.g. the process exited between listing and reading).

use std::fs;

/// Resident set size of `pid` in KiB, from `/proc/<pid>/status` VmRSS.
pub fn memory_kib(pid: i32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// The three load averages as printed by the kernel.
pub fn loadavg() -> Option<String> {
    let raw = fs::read_to_string("/proc/loadavg").ok()?;
    let fields: Vec<&str> = raw.split_whitespace().take(3).collect();
    if fields.len() == 3 {
        Some(fields.join(" "))
    } else {
        None
    }
}

/// Command line of `pid` with NULs flattened to spaces.
pub fn cmdline(pid: i32) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    let text: String =
        raw.iter().map(|&b| if b == 0 { ' ' } else { b as char }).collect();
    Some(text.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::{cmdline, loadavg, memory_kib};

    #[test]
    fn self_readings_are_sane() {
        let pid = std::process::id() as i32;
        assert!(memory_kib(pid).is_some_and(|kib| kib > 0));
        assert!(cmdline(pid).is_some_and(|c| !c.is_empty()));
        assert!(loadavg().is_some());
    }

    #[test]
    fn dead_pid_reads_none() {
        // Pid 0 has no /proc entry from a normal process' view.
        assert_eq!(memory_kib(0), None);
        assert_eq!(cmdline(0), None);
    }
}
