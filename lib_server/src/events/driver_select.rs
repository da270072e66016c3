//! Portable `select(2)` fallback driver.
//!
//! Slower than the kernel-queue driver and capped at `FD_SETSIZE`
//! descriptors, but available everywhere. Descriptors past the cap are
//! refused up front with an actionable error instead of the opaque EINVAL
//! the syscall would give.

use std::collections::HashMap;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use super::driver::{IoEvent, Poller};
use crate::error::EventError;

pub struct SelectDriver {
    interests: HashMap<RawFd, (bool, bool)>,
}

impl SelectDriver {
    pub fn new() -> Self {
        Self {
            interests: HashMap::new(),
        }
    }
}

impl Default for SelectDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for SelectDriver {
    fn set_interest(&mut self, fd: RawFd, readable: bool, writable: bool) -> Result<(), EventError> {
        if fd as i64 >= libc::FD_SETSIZE as i64 {
            return Err(EventError::SelectCapacity {
                fd,
                limit: libc::FD_SETSIZE as i32,
            });
        }
        if readable || writable {
            self.interests.insert(fd, (readable, writable));
        } else {
            self.interests.remove(&fd);
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<IoEvent>,
    ) -> Result<(), EventError> {
        unsafe {
            let mut read_set: libc::fd_set = mem::zeroed();
            let mut write_set: libc::fd_set = mem::zeroed();
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);

            let mut max_fd: RawFd = -1;
            for (&fd, &(readable, writable)) in &self.interests {
                if readable {
                    libc::FD_SET(fd, &mut read_set);
                }
                if writable {
                    libc::FD_SET(fd, &mut write_set);
                }
                max_fd = max_fd.max(fd);
            }

            let mut tv = timeout.map(|t| libc::timeval {
                tv_sec: t.as_secs() as libc::time_t,
                tv_usec: t.subsec_micros() as libc::suseconds_t,
            });
            let tv_ptr = tv
                .as_mut()
                .map(|tv| tv as *mut libc::timeval)
                .unwrap_or(ptr::null_mut());

            let ret = libc::select(max_fd + 1, &mut read_set, &mut write_set, ptr::null_mut(), tv_ptr);
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                // An interrupted select is a normal empty tick.
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return Ok(());
                }
                if err.raw_os_error() == Some(libc::EINVAL) || err.raw_os_error() == Some(libc::EMFILE)
                {
                    return Err(EventError::SelectCapacity {
                        fd: max_fd,
                        limit: libc::FD_SETSIZE as i32,
                    });
                }
                return Err(err.into());
            }
            if ret == 0 {
                return Ok(());
            }

            for (&fd, _) in &self.interests {
                let readable = libc::FD_ISSET(fd, &read_set);
                let writable = libc::FD_ISSET(fd, &write_set);
                if readable || writable {
                    events.push(IoEvent {
                        fd,
                        readable,
                        writable,
                    });
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "select"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_fd_over_setsize() {
        let mut driver = SelectDriver::new();
        let err = driver
            .set_interest(libc::FD_SETSIZE as RawFd, true, false)
            .err()
            .expect("over-limit fd must fail");
        assert!(matches!(err, EventError::SelectCapacity { .. }));
    }

    #[test]
    fn pipe_becomes_readable_after_write() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let mut driver = SelectDriver::new();
        driver.set_interest(read_fd, true, false).unwrap();

        let mut events = Vec::new();
        driver
            .poll(Some(Duration::from_millis(0)), &mut events)
            .unwrap();
        assert!(events.is_empty());

        assert_eq!(unsafe { libc::write(write_fd, b"x".as_ptr().cast(), 1) }, 1);
        driver
            .poll(Some(Duration::from_millis(100)), &mut events)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, read_fd);
        assert!(events[0].readable);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
