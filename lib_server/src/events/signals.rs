//! Self-pipe signal plumbing.
//!
//! The OS handler does exactly one async-signal-safe thing: write the signal
//! number as a single byte into a non-blocking pipe. The loop watches the
//! read end like any other descriptor and dispatches queued signals at tick
//! boundaries. Duplicate deliveries of the same signal coalesce into one
//! dispatch.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

// Write end of the current process's signal pipe. After fork the child
// inherits the parent's value; `reset_in_child` must run before the child
// installs its own handlers so stray deliveries cannot land in the shared
// inherited pipe.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn enqueue_signal(signum: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // Best effort: a full pipe only drops coalescable duplicates.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Drops any signal routing inherited across `fork` and restores default
/// dispositions for the given signals. Call first thing in a freshly forked
/// worker, before it builds its own event loop.
pub fn reset_in_child(signals: &[Signal]) {
    PIPE_WRITE_FD.store(-1, Ordering::Relaxed);
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for &sig in signals {
        unsafe {
            let _ = sigaction(sig, &default);
        }
    }
}

pub struct SignalPipe {
    read_fd: RawFd,
    write_fd: RawFd,
    watched: Vec<Signal>,
}

impl SignalPipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                let fd_flags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC);
            }
        }
        PIPE_WRITE_FD.store(fds[1], Ordering::Relaxed);
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
            watched: Vec::new(),
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Routes `sig` into the pipe. SA_RESTART keeps interruptible syscalls
    /// out of the picture; the poll wakes through the pipe itself.
    pub fn watch(&mut self, sig: Signal) -> nix::Result<()> {
        let action = SigAction::new(
            SigHandler::Handler(enqueue_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(sig, &action)? };
        if !self.watched.contains(&sig) {
            self.watched.push(sig);
        }
        Ok(())
    }

    /// Restores the default disposition for `sig`.
    pub fn unwatch(&mut self, sig: Signal) -> nix::Result<()> {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(sig, &default)? };
        self.watched.retain(|&s| s != sig);
        Ok(())
    }

    /// Drains every queued signal byte, coalescing duplicates while keeping
    /// first-arrival order.
    pub fn drain(&self) -> Vec<i32> {
        let mut out: Vec<i32> = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            for &byte in &buf[..n as usize] {
                let signum = byte as i32;
                if !out.contains(&signum) {
                    out.push(signum);
                }
            }
        }
        out
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for &sig in &self.watched {
            unsafe {
                let _ = sigaction(sig, &default);
            }
        }
        PIPE_WRITE_FD.compare_exchange(
            self.write_fd,
            -1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        )
        .ok();
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_coalesces_duplicates() {
        let pipe = SignalPipe::new().unwrap();
        for sig in [10u8, 10, 12, 10, 12] {
            unsafe {
                libc::write(pipe.write_fd, &sig as *const u8 as *const libc::c_void, 1);
            }
        }
        assert_eq!(pipe.drain(), vec![10, 12]);
        assert!(pipe.drain().is_empty());
    }
}
