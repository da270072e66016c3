//! Kernel event queue driver over `mio` (epoll/kqueue underneath).

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::driver::{interrupted, IoEvent, Poller};
use crate::error::EventError;

pub struct MioDriver {
    poll: Poll,
    events: Events,
    // fd -> (readable, writable) interest currently registered.
    registered: HashMap<RawFd, (bool, bool)>,
}

impl MioDriver {
    pub fn new() -> Result<Self, EventError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            registered: HashMap::new(),
        })
    }

    fn interest(readable: bool, writable: bool) -> Option<Interest> {
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl Poller for MioDriver {
    fn set_interest(&mut self, fd: RawFd, readable: bool, writable: bool) -> Result<(), EventError> {
        let registry = self.poll.registry();
        match (self.registered.get(&fd).copied(), Self::interest(readable, writable)) {
            (None, None) => {}
            (None, Some(interest)) => {
                registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                self.registered.insert(fd, (readable, writable));
            }
            (Some(_), Some(interest)) => {
                registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                self.registered.insert(fd, (readable, writable));
            }
            (Some(_), None) => {
                // The fd may already be closed; deregistration failure is
                // indistinguishable from that and not actionable.
                let _ = registry.deregister(&mut SourceFd(&fd));
                self.registered.remove(&fd);
            }
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<IoEvent>,
    ) -> Result<(), EventError> {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if interrupted(&err) {
                return Ok(());
            }
            return Err(err.into());
        }
        for event in self.events.iter() {
            events.push(IoEvent {
                fd: event.token().0 as RawFd,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mio"
    }
}
