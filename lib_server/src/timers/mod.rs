//! Integer-id timer registry.
//!
//! Thin facade over the event loop for callers that prefer plain integer
//! handles to the loop's opaque callback ids. The master process needs
//! timers before any event loop exists (stop-timeout SIGKILL fallbacks, the
//! status-file settle delay), so the registry also runs on a signal-driven
//! backend: a `SIGALRM` fired every second walks a pure-data
//! `unix_time -> tasks` table. Tasks landing in the same whole-second bucket
//! fire in insertion order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{CallbackResult, EventError};
use crate::events::{CallbackId, LoopHandle, Resumer};

pub mod alarm;

pub use alarm::AlarmTimers;

/// A registry task. Captures its own context; repeating tasks are re-run
/// until deleted.
pub type TimerTask = Box<dyn FnMut() -> CallbackResult>;

enum Backend {
    EventLoop(LoopHandle),
    Alarm(AlarmTimers),
}

struct Registered {
    loop_id: Option<CallbackId>,
}

pub struct Timers {
    backend: Backend,
    next_id: Rc<RefCell<i32>>,
    live: Rc<RefCell<HashMap<i32, Registered>>>,
}

impl Timers {
    /// Registry over a running worker's event loop.
    pub fn new(handle: LoopHandle) -> Self {
        Self {
            backend: Backend::EventLoop(handle),
            next_id: Rc::new(RefCell::new(0)),
            live: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Signal-driven registry for the master process, usable before (and
    /// without) an event loop.
    pub fn with_alarm() -> Self {
        Self {
            backend: Backend::Alarm(AlarmTimers::new()),
            next_id: Rc::new(RefCell::new(0)),
            live: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    fn issue_id(&self) -> i32 {
        let mut next = self.next_id.borrow_mut();
        *next = next.wrapping_add(1).max(1);
        *next
    }

    /// Schedules `task` after `interval`; with `persistent` it repeats every
    /// `interval` until deleted. Returns the integer handle.
    pub fn add(
        &self,
        interval: Duration,
        mut task: TimerTask,
        persistent: bool,
    ) -> Result<i32, EventError> {
        let id = self.issue_id();
        match &self.backend {
            Backend::EventLoop(handle) => {
                let live = self.live.clone();
                let loop_id = if persistent {
                    handle.repeat(interval, move |_| task())?
                } else {
                    handle.delay(interval, move |_| {
                        let result = task();
                        live.borrow_mut().remove(&id);
                        result
                    })?
                };
                self.live.borrow_mut().insert(
                    id,
                    Registered {
                        loop_id: Some(loop_id),
                    },
                );
            }
            Backend::Alarm(alarm) => {
                alarm.add(id, interval, task, persistent);
                self.live
                    .borrow_mut()
                    .insert(id, Registered { loop_id: None });
            }
        }
        Ok(id)
    }

    /// Deletes a timer; reports whether it was still registered.
    pub fn del(&self, id: i32) -> bool {
        let Some(registered) = self.live.borrow_mut().remove(&id) else {
            return false;
        };
        match &self.backend {
            Backend::EventLoop(handle) => {
                if let Some(loop_id) = registered.loop_id {
                    handle.cancel(&loop_id);
                }
            }
            Backend::Alarm(alarm) => alarm.del(id),
        }
        true
    }

    pub fn del_all(&self) {
        let ids: Vec<i32> = self.live.borrow().keys().copied().collect();
        for id in ids {
            self.del(id);
        }
    }

    /// Suspends the calling callback for `duration`, then runs
    /// `continuation`. Only valid on the event-loop backend: the calling
    /// callback installs the continuation and returns, and a timer resume
    /// schedules it.
    pub fn sleep<F>(&self, duration: Duration, continuation: F) -> Result<(), EventError>
    where
        F: FnOnce(&LoopHandle, CallbackResult) -> CallbackResult + 'static,
    {
        let Backend::EventLoop(handle) = &self.backend else {
            return Err(EventError::SleepWithoutLoop);
        };
        let (suspension, resumer) = handle.suspension()?;
        suspension.on_resume(continuation);
        let slot: Rc<RefCell<Option<Resumer>>> = Rc::new(RefCell::new(Some(resumer)));
        handle.delay(duration, move |_| {
            if let Some(resumer) = slot.borrow_mut().take() {
                resumer.resume();
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Alarm backend only: process any due second buckets. The master's
    /// monitor loop calls this whenever `SIGALRM` interrupts its wait.
    pub fn tick(&self) {
        if let Backend::Alarm(alarm) = &self.backend {
            let finished = alarm.tick();
            let mut live = self.live.borrow_mut();
            for id in finished {
                live.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{driver_select::SelectDriver, EventLoop};
    use std::cell::Cell;

    #[test]
    fn add_and_fire_over_the_loop() {
        let mut ev = EventLoop::with_driver(Box::new(SelectDriver::new()));
        let handle = ev.handle();
        let timers = Timers::new(handle.clone());
        let fired = Rc::new(Cell::new(0u32));

        let counter = fired.clone();
        timers
            .add(
                Duration::from_millis(1),
                Box::new(move || {
                    counter.set(counter.get() + 1);
                    Ok(())
                }),
                false,
            )
            .unwrap();
        ev.run().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn del_prevents_firing_and_reports_presence() {
        let mut ev = EventLoop::with_driver(Box::new(SelectDriver::new()));
        let timers = Timers::new(ev.handle());
        let fired = Rc::new(Cell::new(false));

        let flag = fired.clone();
        let id = timers
            .add(
                Duration::from_millis(1),
                Box::new(move || {
                    flag.set(true);
                    Ok(())
                }),
                true,
            )
            .unwrap();
        assert!(timers.del(id));
        assert!(!timers.del(id));
        ev.run().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn sleep_requires_the_loop_backend() {
        let timers = Timers::with_alarm();
        let err = timers
            .sleep(Duration::from_secs(1), |_, _| Ok(()))
            .err()
            .expect("alarm backend cannot sleep");
        assert!(matches!(err, EventError::SleepWithoutLoop));
    }

    #[test]
    fn sleep_resumes_the_continuation() {
        let mut ev = EventLoop::with_driver(Box::new(SelectDriver::new()));
        let handle = ev.handle();
        let timers = Timers::new(handle);
        let woke = Rc::new(Cell::new(false));

        let flag = woke.clone();
        timers
            .sleep(Duration::from_millis(1), move |h, outcome| {
                outcome?;
                flag.set(true);
                h.stop();
                Ok(())
            })
            .unwrap();
        ev.run().unwrap();
        assert!(woke.get());
    }
}
