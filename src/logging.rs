//! Log-sink fan-out: stdout, syslog and file sinks behind one tracing
//! subscriber. Every selected sink receives every line; selecting none
//! leaves the agent silent.

use anyhow::Context;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// A log destination selected with `-o`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Stdout,
    Syslog,
    File(PathBuf),
}

impl FromStr for Sink {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Sink::Stdout),
            "syslog" => Ok(Sink::Syslog),
            other => match other.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(Sink::File(PathBuf::from(path))),
                _ => Err(format!(
                    "expected stdout, syslog or file:<path>, got {other:?}"
                )),
            },
        }
    }
}

/// Install a subscriber fanning out to the chosen sinks.
pub fn init(sinks: &[Sink]) -> anyhow::Result<()> {
    let mut stdout = false;
    let mut syslog = false;
    let mut file: Option<File> = None;

    for sink in sinks {
        match sink {
            Sink::Stdout => stdout = true,
            Sink::Syslog => syslog = true,
            Sink::File(path) => {
                file = Some(
                    File::create(path)
                        .with_context(|| format!("open log file {}", path.display()))?,
                );
            }
        }
    }

    if syslog {
        unsafe { libc::openlog(c"host-agent".as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
    }

    let stdout_layer = stdout.then(|| fmt::layer().with_target(false));
    let file_layer = file.map(|f| {
        fmt::layer()
            .with_writer(Arc::new(f))
            .with_ansi(false)
            .with_target(false)
    });
    let syslog_layer = syslog.then(|| {
        fmt::layer()
            .with_writer(SyslogWriter::default)
            .with_ansi(false)
            .with_target(false)
            .without_time()
    });

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(syslog_layer)
        .init();
    Ok(())
}

/// Collects one formatted event and hands it to `syslog(3)` when flushed
/// or dropped.
#[derive(Default)]
struct SyslogWriter {
    line: Vec<u8>,
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let end = self
            .line
            .iter()
            .rposition(|&b| b != b'\n' && b != b'\r')
            .map_or(0, |i| i + 1);
        if end > 0 {
            if let Ok(msg) = std::ffi::CString::new(&self.line[..end]) {
                unsafe { libc::syslog(libc::LOG_INFO, c"%s".as_ptr(), msg.as_ptr()) };
            }
        }
        self.line.clear();
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
