//! Daemonization: the classic double fork.
//!
//! First fork drops the shell's job control, `setsid` takes session
//! leadership, the second fork guarantees the daemon can never reacquire a
//! controlling terminal. Handlers are installed only after this completes,
//! so a terminal SIGINT cannot reach the daemonised master; one delivered
//! later via `kill` is treated as a forceful stop.

use std::path::Path;

use nix::sys::stat::{umask, Mode};
use nix::unistd::{fork, setsid, ForkResult};

use crate::error::ServerError;
use crate::logging;

/// Detaches the process. Stdio keeps pointing at the inherited streams
/// until [`redirect_stdio`] runs, after the worker pool is up.
pub fn daemonize() -> Result<(), ServerError> {
    umask(Mode::empty());

    match unsafe { fork() }.map_err(ServerError::Fork)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid()?;

    match unsafe { fork() }.map_err(ServerError::Fork)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    Ok(())
}

/// Rebinds stdout/stderr to the log file and stdin to /dev/null. A failure
/// here falls back to the raw append sink so the event is not lost.
pub fn redirect_stdio(log_file: &Path) {
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;

    let devnull = OpenOptions::new().read(true).open("/dev/null");
    let sink = OpenOptions::new().create(true).append(true).open(log_file);

    match (devnull, sink) {
        (Ok(devnull), Ok(sink)) => unsafe {
            libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
            libc::dup2(sink.as_raw_fd(), libc::STDOUT_FILENO);
            libc::dup2(sink.as_raw_fd(), libc::STDERR_FILENO);
        },
        _ => logging::raw_line(log_file, "stdio redirection failed; keeping inherited streams"),
    }
}
