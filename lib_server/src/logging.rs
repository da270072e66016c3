//! Logging setup: a console layer plus a non-blocking append-only file
//! layer, filtered by `RUST_LOG`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking file writer alive; drop it last.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber. Safe to call again (e.g. in a forked
/// worker that inherited the parent's subscriber): later calls are no-ops.
pub fn init(log_file: &Path, console: bool) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (dir, name) = match (log_file.parent(), log_file.file_name()) {
        (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_os_string()),
        _ => (std::env::temp_dir(), "server.log".into()),
    };
    let appender = tracing_appender::rolling::never(dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer().with_ansi(false).with_writer(writer);
    let console_layer = console.then(|| fmt::layer().with_target(true).with_ansi(true));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_ok();

    LogGuard {
        _file: installed.then_some(guard),
    }
}

/// Fallback sink for moments when the subscriber is unavailable or stdio
/// redirection failed: append one `timestamp pid message` line directly.
pub fn raw_line(log_file: &Path, message: &str) {
    let line = format!(
        "{} pid:{} {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        std::process::id(),
        message
    );
    let _ = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .and_then(|mut file| file.write_all(line.as_bytes()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_line_appends_timestamp_and_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("server.log");
        raw_line(&log, "first");
        raw_line(&log, "second");
        let content = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(&format!("pid:{}", std::process::id())));
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }
}
