//! Per-worker traffic counters, reported in status dumps.

use std::cell::Cell;
use std::rc::Rc;

/// Counters owned by one worker process. `connection_count` must fall back
/// to zero during a graceful shutdown before the worker exits.
#[derive(Debug, Default)]
pub struct Statistics {
    pub connection_count: Cell<i64>,
    pub total_request: Cell<u64>,
    pub send_fail: Cell<u64>,
    pub throw_exception: Cell<u64>,
}

impl Statistics {
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        self.connection_count.set(self.connection_count.get() + 1);
    }

    pub fn connection_closed(&self) {
        self.connection_count.set(self.connection_count.get() - 1);
    }

    pub fn request_decoded(&self) {
        self.total_request.set(self.total_request.get() + 1);
    }

    pub fn send_failed(&self) {
        self.send_fail.set(self.send_fail.get() + 1);
    }

    pub fn exception_thrown(&self) {
        self.throw_exception.set(self.throw_exception.get() + 1);
    }

    /// One status-file row: `connections requests send_fail exceptions`.
    pub fn summary(&self) -> String {
        format!(
            "{} {} {} {}",
            self.connection_count.get(),
            self.total_request.get(),
            self.send_fail.get(),
            self.throw_exception.get()
        )
    }
}
