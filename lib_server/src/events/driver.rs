//! Readiness-polling drivers.
//!
//! One trait, two implementations: the preferred kernel-queue driver built on
//! `mio` (epoll on Linux, kqueue on the BSDs) and a portable `select(2)`
//! fallback. The factory picks the best available at construction time; the
//! `SERVER_EVENTLOOP` environment variable forces a specific one.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::EventError;

/// Environment variable forcing a specific driver (`mio` or `select`).
pub const DRIVER_ENV: &str = "SERVER_EVENTLOOP";

/// One readiness report from a driver poll.
#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// A readiness-polling backend.
///
/// Interest is level-triggered in both drivers: a descriptor with pending
/// data keeps reporting readable until it is drained or the interest is
/// dropped. `set_interest` with both directions false deregisters the fd.
pub trait Poller {
    fn set_interest(&mut self, fd: RawFd, readable: bool, writable: bool) -> Result<(), EventError>;

    /// Blocks up to `timeout` (forever when `None`) and appends ready
    /// descriptors to `events`. An interrupted wait is not an error; the
    /// driver reports an empty tick instead.
    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<IoEvent>)
        -> Result<(), EventError>;

    fn name(&self) -> &'static str;
}

/// Builds the best driver for this platform, honouring [`DRIVER_ENV`].
pub fn create_poller() -> Result<Box<dyn Poller>, EventError> {
    match std::env::var(DRIVER_ENV) {
        Ok(name) => match name.as_str() {
            "mio" => Ok(Box::new(super::driver_mio::MioDriver::new()?)),
            "select" => Ok(Box::new(super::driver_select::SelectDriver::new())),
            other => Err(EventError::UnknownDriver(other.to_string())),
        },
        Err(_) => {
            if cfg!(unix) {
                Ok(Box::new(super::driver_mio::MioDriver::new()?))
            } else {
                Ok(Box::new(super::driver_select::SelectDriver::new()))
            }
        }
    }
}

/// Maps a raw poll errno to driver semantics: EINTR means "no events this
/// tick", everything else is fatal.
pub(crate) fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test so the env-var mutation cannot race a parallel sibling.
    #[test]
    fn factory_honours_the_driver_env() {
        std::env::set_var(DRIVER_ENV, "uring");
        let err = create_poller().err().expect("unknown driver must fail");
        assert!(matches!(err, EventError::UnknownDriver(ref n) if n == "uring"));

        std::env::set_var(DRIVER_ENV, "select");
        let driver = create_poller().expect("select driver");
        assert_eq!(driver.name(), "select");

        std::env::remove_var(DRIVER_ENV);
    }
}
