//! Cron scheduler.
//!
//! Jobs register a rule and a callback; a single per-process tick wakes on
//! every whole-minute boundary, checks each job's calendar fields against
//! the current minute and schedules one timer per eligible second offset.
//! A zero offset is pushed one microsecond out so it still goes through the
//! timer queue instead of firing synchronously inside the tick.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use chrono::{Local, Timelike};
use tracing::{debug, info};

use crate::error::{CallbackResult, CronError};
use crate::events::LoopHandle;

pub mod parser;

pub use parser::Schedule;

pub type CronTask = Rc<RefCell<Box<dyn FnMut() -> CallbackResult>>>;

pub struct CronJob {
    pub id: i32,
    pub rule: String,
    pub name: String,
    schedule: Schedule,
    task: CronTask,
}

struct CrontabInner {
    jobs: HashMap<i32, Rc<CronJob>>,
    next_id: i32,
    tick_armed: bool,
}

/// Per-process cron registry, driven by the worker's event loop.
#[derive(Clone)]
pub struct Crontab {
    handle: LoopHandle,
    inner: Rc<RefCell<CrontabInner>>,
}

impl Crontab {
    pub fn new(handle: LoopHandle) -> Self {
        Self {
            handle,
            inner: Rc::new(RefCell::new(CrontabInner {
                jobs: HashMap::new(),
                next_id: 0,
                tick_armed: false,
            })),
        }
    }

    /// Registers a job. The rule is validated synchronously; a malformed
    /// rule fails here and leaves the existing schedule untouched.
    pub fn add<F>(&self, rule: &str, name: &str, task: F) -> Result<i32, CronError>
    where
        F: FnMut() -> CallbackResult + 'static,
    {
        let schedule = Schedule::parse(rule)?;
        let id = {
            let mut inner = self.inner.borrow_mut();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.jobs.insert(
                id,
                Rc::new(CronJob {
                    id,
                    rule: rule.to_string(),
                    name: name.to_string(),
                    schedule,
                    task: Rc::new(RefCell::new(Box::new(task))),
                }),
            );
            id
        };
        info!(cron_id = id, rule, name, "cron job registered");
        self.arm_tick();
        Ok(id)
    }

    /// Removes a job; reports whether it existed.
    pub fn remove(&self, id: i32) -> bool {
        self.inner.borrow_mut().jobs.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().jobs.is_empty()
    }

    /// Arms the delay to the next whole-minute boundary, once.
    fn arm_tick(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.tick_armed || inner.jobs.is_empty() {
                return;
            }
            inner.tick_armed = true;
        }
        let this = self.clone();
        let wait = duration_to_next_minute();
        let scheduled = self.handle.delay(wait, move |_| {
            this.inner.borrow_mut().tick_armed = false;
            this.on_minute();
            this.arm_tick();
            Ok(())
        });
        if scheduled.is_err() {
            self.inner.borrow_mut().tick_armed = false;
        }
    }

    /// Runs at a minute boundary: schedules this minute's firings for every
    /// job whose calendar fields match.
    fn on_minute(&self) {
        let now = Local::now();
        let into_minute = Duration::from_secs(now.second() as u64)
            + Duration::from_nanos(now.nanosecond() as u64);
        let jobs: Vec<Rc<CronJob>> = self.inner.borrow().jobs.values().cloned().collect();
        for job in jobs {
            if !job.schedule.matches_minute(&now) {
                continue;
            }
            for &offset in &job.schedule.seconds {
                let target = Duration::from_secs(offset as u64);
                let wait = target
                    .checked_sub(into_minute)
                    .filter(|w| !w.is_zero())
                    .unwrap_or(Duration::from_micros(1));
                debug!(cron_id = job.id, name = %job.name, offset, "cron firing scheduled");
                let task = job.task.clone();
                let _ = self.handle.delay(wait, move |_| (task.borrow_mut())());
            }
        }
    }
}

fn duration_to_next_minute() -> Duration {
    let now = Local::now();
    let into_minute = Duration::from_secs(now.second() as u64)
        + Duration::from_nanos(now.nanosecond() as u64);
    Duration::from_secs(60).saturating_sub(into_minute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{driver_select::SelectDriver, EventLoop};

    #[test]
    fn malformed_rule_fails_registration_synchronously() {
        let ev = EventLoop::with_driver(Box::new(SelectDriver::new()));
        let cron = Crontab::new(ev.handle());
        assert!(cron.add("not a rule", "broken", || Ok(())).is_err());
        assert!(cron.is_empty());
    }

    #[test]
    fn remove_reports_presence() {
        let ev = EventLoop::with_driver(Box::new(SelectDriver::new()));
        let cron = Crontab::new(ev.handle());
        let id = cron.add("* * * * *", "noop", || Ok(())).unwrap();
        assert!(cron.remove(id));
        assert!(!cron.remove(id));
    }

    #[test]
    fn boundary_wait_is_at_most_a_minute() {
        let wait = duration_to_next_minute();
        assert!(wait <= Duration::from_secs(60));
    }

    #[test]
    fn every_second_rule_schedules_sixty_offsets() {
        let schedule = Schedule::parse("* * * * * *").unwrap();
        assert_eq!(schedule.seconds.len(), 60);
        let now = Local::now();
        assert!(schedule.matches_minute(&now));
    }
}
