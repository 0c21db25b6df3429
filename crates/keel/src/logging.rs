use std::{
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use keel_utils::LockedFile;
use tracing_subscriber::fmt::{time::FormatTime, writer::MakeWriter};

/// Prefixes every line with `YYYY-MM-DD HH:MM:SS pid:<pid>`.
struct StampAndPid;

impl FormatTime for StampAndPid {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{} pid:{}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            std::process::id()
        )
    }
}

/// Appends each formatted event to the shared log file under flock, so
/// master and worker lines never interleave mid-record. Outside of
/// daemon mode the line is echoed to stdout as well.
#[derive(Clone)]
struct LogWriter {
    file: Arc<Mutex<LockedFile>>,
    echo: bool,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.echo {
            let _ = io::stdout().write_all(buf);
        }
        let mut file = self.file.lock().map_err(|_| io::Error::from(io::ErrorKind::Other))?;
        file.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the runtime's tracing subscriber. Safe to call more than once;
/// later calls keep the first subscriber.
pub fn init(log_file: &Path, daemonized: bool) -> io::Result<()> {
    let file = LockedFile::open(log_file)?;
    let writer = LogWriter { file: Arc::new(Mutex::new(file)), echo: !daemonized };

    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_timer(StampAndPid)
        .with_target(false)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}
