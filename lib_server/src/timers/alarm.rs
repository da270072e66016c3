//! SIGALRM-driven timer backend for the master process.
//!
//! The master has no event loop; it sits in `waitpid`. A one-second alarm
//! interrupts that wait, the monitor loop calls [`AlarmTimers::tick`], and
//! due buckets run. Granularity is a whole second; sub-second intervals
//! round up.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::error;

use super::TimerTask;

static ALARM_FIRED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_alarm(_signum: libc::c_int) {
    ALARM_FIRED.store(true, Ordering::Relaxed);
    // Keep the one-second heartbeat going; alarm(2) is async-signal-safe.
    unsafe {
        libc::alarm(1);
    }
}

struct AlarmTask {
    id: i32,
    interval: Duration,
    task: TimerTask,
    persistent: bool,
    dead: Rc<RefCell<bool>>,
}

struct AlarmInner {
    buckets: BTreeMap<u64, Vec<AlarmTask>>,
    kill_switches: BTreeMap<i32, Rc<RefCell<bool>>>,
}

pub struct AlarmTimers {
    inner: Rc<RefCell<AlarmInner>>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn bucket_for(interval: Duration) -> u64 {
    unix_now() + interval.as_secs().max(1)
}

impl AlarmTimers {
    /// Installs the SIGALRM handler (interruptible on purpose: the alarm
    /// must break the master out of `waitpid`) and arms the heartbeat.
    pub fn new() -> Self {
        let action = SigAction::new(
            SigHandler::Handler(on_alarm),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            let _ = sigaction(Signal::SIGALRM, &action);
            libc::alarm(1);
        }
        Self {
            inner: Rc::new(RefCell::new(AlarmInner {
                buckets: BTreeMap::new(),
                kill_switches: BTreeMap::new(),
            })),
        }
    }

    pub fn add(&self, id: i32, interval: Duration, task: TimerTask, persistent: bool) {
        let dead = Rc::new(RefCell::new(false));
        let mut inner = self.inner.borrow_mut();
        inner.kill_switches.insert(id, dead.clone());
        inner
            .buckets
            .entry(bucket_for(interval))
            .or_default()
            .push(AlarmTask {
                id,
                interval,
                task,
                persistent,
                dead,
            });
    }

    pub fn del(&self, id: i32) {
        if let Some(flag) = self.inner.borrow_mut().kill_switches.remove(&id) {
            *flag.borrow_mut() = true;
        }
    }

    /// Runs every bucket due at or before the current second, in insertion
    /// order within a bucket. Returns the ids of finished one-shot tasks.
    pub fn tick(&self) -> Vec<i32> {
        if !ALARM_FIRED.swap(false, Ordering::Relaxed) {
            return Vec::new();
        }
        let now = unix_now();
        let mut finished = Vec::new();
        loop {
            let batch = {
                let mut inner = self.inner.borrow_mut();
                match inner.buckets.first_key_value() {
                    Some((&ts, _)) if ts <= now => inner.buckets.remove(&ts),
                    _ => None,
                }
            };
            let Some(batch) = batch else { break };
            for mut entry in batch {
                if *entry.dead.borrow() {
                    continue;
                }
                if let Err(err) = (entry.task)() {
                    error!(timer_id = entry.id, %err, "timer task failed");
                }
                if entry.persistent && !*entry.dead.borrow() {
                    let mut inner = self.inner.borrow_mut();
                    inner
                        .buckets
                        .entry(now + entry.interval.as_secs().max(1))
                        .or_default()
                        .push(entry);
                } else {
                    finished.push(entry.id);
                    self.inner.borrow_mut().kill_switches.remove(&entry.id);
                }
            }
        }
        finished
    }
}

impl Default for AlarmTimers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn due_buckets_run_in_insertion_order() {
        let timers = AlarmTimers::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (id, tag) in ["a", "b", "c"].into_iter().enumerate() {
            let order = order.clone();
            timers.add(
                id as i32 + 1,
                Duration::from_secs(1),
                Box::new(move || {
                    order.borrow_mut().push(tag);
                    Ok(())
                }),
                false,
            );
        }

        ALARM_FIRED.store(true, Ordering::Relaxed);
        // Tasks sit one second out; simulate the heartbeat after expiry.
        std::thread::sleep(Duration::from_millis(1100));
        timers.tick();
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn deleted_tasks_never_run() {
        let timers = AlarmTimers::new();
        let fired = Rc::new(Cell::new(false));

        let flag = fired.clone();
        timers.add(
            7,
            Duration::from_secs(1),
            Box::new(move || {
                flag.set(true);
                Ok(())
            }),
            false,
        );
        timers.del(7);

        ALARM_FIRED.store(true, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(1100));
        timers.tick();
        assert!(!fired.get());
    }
}
