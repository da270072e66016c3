//! # Single-Threaded Cooperative Event Loop
//!
//! The multiplexer every worker process runs on. One loop owns every timer,
//! descriptor callback and signal route of its process, and drives them from
//! a single thread in fixed tick phases:
//!
//! 1. microtasks queued with [`LoopHandle::queue`] (FIFO, ahead of anything
//!    else in the tick),
//! 2. deferred callbacks from [`LoopHandle::defer`] (queued on an earlier
//!    tick),
//! 3. expired timers, ascending by expiration, insertion order on ties,
//! 4. descriptor readiness from the polling driver,
//! 5. queued OS signals.
//!
//! A callback armed during tick *t* is never invoked in tick *t*; activation
//! happens at the following tick boundary. Repeating timers re-arm right
//! after firing under the same rule, so an interval of zero still fires at
//! most once per tick.
//!
//! Callbacks report failure through their `Result`; the loop hands failures
//! to the installed error handler and keeps going. Without a handler, or
//! when the handler itself fails, the loop unwinds `run()` with the cause.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::RawFd;
use std::panic::Location;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{error, trace_span};

use crate::error::{BoxError, CallbackResult, EventError};

pub mod driver;
pub mod driver_mio;
pub mod driver_select;
mod heap;
pub mod signals;
pub mod suspension;

pub use driver::{create_poller, IoEvent, Poller, DRIVER_ENV};
pub use nix::sys::signal::Signal;
pub use suspension::{Resumer, Suspension};

use heap::{TimerHeap, TimerKey};
use signals::SignalPipe;

/// Environment variable enabling per-dispatch trace spans.
pub const TRACE_ENV: &str = "SERVER_TRACE_EVENTS";

/// Stable opaque identifier for a registered callback.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CallbackId(pub(crate) Rc<str>);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type TimerCallback = Box<dyn FnMut(&LoopHandle) -> CallbackResult>;
pub type IoCallback = Box<dyn FnMut(&LoopHandle, RawFd) -> CallbackResult>;
pub type SignalCallback = Box<dyn FnMut(&LoopHandle, Signal) -> CallbackResult>;
pub type ErrorHandler = Rc<dyn Fn(&LoopHandle, BoxError) -> CallbackResult>;
type Microtask = Box<dyn FnOnce(&LoopHandle) -> CallbackResult>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Kind {
    Defer,
    Delay,
    Repeat,
    Readable,
    Writable,
    Signal,
}

enum Payload {
    Timer {
        interval: Duration,
        cb: Rc<RefCell<TimerCallback>>,
    },
    Io {
        fd: RawFd,
        cb: Rc<RefCell<IoCallback>>,
    },
    Sig {
        signal: Signal,
        cb: Rc<RefCell<SignalCallback>>,
    },
}

struct Entry {
    kind: Kind,
    enabled: bool,
    referenced: bool,
    armed_tick: u64,
    generation: u64,
    payload: Payload,
}

struct Inner {
    driver: Box<dyn Poller>,
    entries: HashMap<CallbackId, Entry>,
    read_fds: HashMap<RawFd, CallbackId>,
    write_fds: HashMap<RawFd, CallbackId>,
    signal_ids: HashMap<Signal, CallbackId>,
    signal_pipe: Option<SignalPipe>,
    pending_signals: Vec<i32>,
    heap: TimerHeap,
    defer_queue: VecDeque<CallbackId>,
    microtasks: VecDeque<Microtask>,
    tick: u64,
    next_seq: u64,
    running: bool,
    stopped: bool,
    fatal: Option<BoxError>,
    error_handler: Option<ErrorHandler>,
    suspensions: HashMap<u64, &'static Location<'static>>,
    next_suspension: u64,
    trace: bool,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn make_id(&mut self, kind: &str) -> CallbackId {
        let seq = self.next_seq();
        CallbackId(Rc::from(format!("{kind}:{seq}")))
    }

    fn has_referenced_work(&self) -> bool {
        !self.microtasks.is_empty()
            || !self.defer_queue.is_empty()
            || self
                .entries
                .values()
                .any(|entry| entry.referenced)
    }

    fn io_interest(&mut self, fd: RawFd) -> Result<(), EventError> {
        let readable = self
            .read_fds
            .get(&fd)
            .and_then(|id| self.entries.get(id))
            .map(|e| e.enabled)
            .unwrap_or(false);
        let writable = self
            .write_fds
            .get(&fd)
            .and_then(|id| self.entries.get(id))
            .map(|e| e.enabled)
            .unwrap_or(false);
        self.driver.set_interest(fd, readable, writable)
    }
}

/// Cheap, clonable scheduling handle. Every callback receives one; all
/// registration, cancellation and control operations go through it.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Weak<RefCell<Inner>>,
}

/// The reactor. Owns the driver and all registered callbacks; consumed by
/// [`EventLoop::run`] until stopped or out of referenced work.
pub struct EventLoop {
    inner: Rc<RefCell<Inner>>,
}

impl EventLoop {
    /// Builds a loop on the platform's preferred driver, honouring
    /// [`DRIVER_ENV`].
    pub fn new() -> Result<Self, EventError> {
        Ok(Self::with_driver(create_poller()?))
    }

    pub fn with_driver(driver: Box<dyn Poller>) -> Self {
        let trace = std::env::var(TRACE_ENV).map(|v| v == "1").unwrap_or(false);
        Self {
            inner: Rc::new(RefCell::new(Inner {
                driver,
                entries: HashMap::new(),
                read_fds: HashMap::new(),
                write_fds: HashMap::new(),
                signal_ids: HashMap::new(),
                signal_pipe: None,
                pending_signals: Vec::new(),
                heap: TimerHeap::new(),
                defer_queue: VecDeque::new(),
                microtasks: VecDeque::new(),
                tick: 0,
                next_seq: 0,
                running: false,
                stopped: false,
                fatal: None,
                error_handler: None,
                suspensions: HashMap::new(),
                next_suspension: 0,
                trace,
            })),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.inner.borrow().driver.name()
    }

    /// Runs tick phases until `stop()` is called or only unreferenced
    /// callbacks remain. Returns the fatal cause when a callback error could
    /// not be absorbed by the error handler.
    pub fn run(&mut self) -> Result<(), EventError> {
        let handle = self.handle();
        {
            let mut inner = self.inner.borrow_mut();
            inner.running = true;
            inner.stopped = false;
        }

        let result = loop {
            self.inner.borrow_mut().tick += 1;

            self.run_microtasks(&handle);
            self.run_deferred(&handle);
            self.fire_timers(&handle);
            if self.fatal() {
                break self.take_fatal();
            }

            if let Err(err) = self.poll_io(&handle) {
                break Err(err);
            }
            self.dispatch_signals(&handle);
            self.run_microtasks(&handle);
            if self.fatal() {
                break self.take_fatal();
            }

            let inner = self.inner.borrow();
            if inner.stopped || !inner.has_referenced_work() {
                break Ok(());
            }
        };

        let mut inner = self.inner.borrow_mut();
        inner.running = false;
        if !inner.suspensions.is_empty() {
            for location in inner.suspensions.values() {
                error!(
                    suspended_at = %location,
                    "suspension never resumed; resumer unreachable at loop exit"
                );
            }
            inner.suspensions.clear();
        }
        result
    }

    fn fatal(&self) -> bool {
        self.inner.borrow().fatal.is_some()
    }

    fn take_fatal(&self) -> Result<(), EventError> {
        match self.inner.borrow_mut().fatal.take() {
            Some(source) => Err(EventError::Uncaught { source }),
            None => Ok(()),
        }
    }

    fn route(&self, handle: &LoopHandle, result: CallbackResult) {
        let Err(err) = result else { return };
        let handler = self.inner.borrow().error_handler.clone();
        match handler {
            Some(handler) => {
                if let Err(handler_err) = handler(handle, err) {
                    self.inner.borrow_mut().fatal = Some(handler_err);
                }
            }
            None => self.inner.borrow_mut().fatal = Some(err),
        }
    }

    fn run_microtasks(&self, handle: &LoopHandle) {
        loop {
            if self.fatal() {
                return;
            }
            let task = self.inner.borrow_mut().microtasks.pop_front();
            let Some(task) = task else { return };
            let result = task(handle);
            self.route(handle, result);
        }
    }

    fn run_deferred(&self, handle: &LoopHandle) {
        let batch = {
            let mut inner = self.inner.borrow_mut();
            std::mem::take(&mut inner.defer_queue)
        };
        for id in batch {
            if self.fatal() {
                return;
            }
            enum Verdict {
                Run(Rc<RefCell<TimerCallback>>),
                Requeue,
                Skip,
            }
            let verdict = {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                match inner.entries.get(&id) {
                    // Deferred this very tick: hold until the next one.
                    Some(entry) if entry.armed_tick == inner.tick => Verdict::Requeue,
                    Some(entry) if entry.enabled => match &entry.payload {
                        Payload::Timer { cb, .. } => Verdict::Run(cb.clone()),
                        _ => Verdict::Skip,
                    },
                    _ => Verdict::Skip,
                }
            };
            match verdict {
                Verdict::Requeue => {
                    self.inner.borrow_mut().defer_queue.push_back(id);
                }
                Verdict::Skip => {}
                Verdict::Run(cb) => {
                    let span = self.trace_span("defer", &id);
                    let result = (cb.borrow_mut())(handle);
                    drop(span);
                    self.inner.borrow_mut().entries.remove(&id);
                    self.route(handle, result);
                }
            }
        }
    }

    fn fire_timers(&self, handle: &LoopHandle) {
        let now = Instant::now();
        let mut not_yet_active: Vec<TimerKey> = Vec::new();
        loop {
            if self.fatal() {
                break;
            }
            let due = {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                let mut picked = None;
                while let Some(key) = inner.heap.pop_due(now) {
                    match inner.entries.get(&key.id) {
                        None => continue,
                        Some(entry) if entry.generation != key.generation || !entry.enabled => {
                            continue
                        }
                        Some(entry) if entry.armed_tick == inner.tick => {
                            not_yet_active.push(key);
                            continue;
                        }
                        Some(entry) => {
                            let cb = match &entry.payload {
                                Payload::Timer { cb, .. } => cb.clone(),
                                _ => unreachable!("heap only holds timer ids"),
                            };
                            picked = Some((key, cb, entry.kind));
                            break;
                        }
                    }
                }
                picked
            };
            let Some((key, cb, kind)) = due else { break };

            let span = self.trace_span("timer", &key.id);
            let result = (cb.borrow_mut())(handle);
            drop(span);

            {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                match kind {
                    Kind::Repeat => {
                        inner.next_seq += 1;
                        let seq = inner.next_seq;
                        let tick = inner.tick;
                        let rearm = match inner.entries.get_mut(&key.id) {
                            Some(entry)
                                if entry.enabled && entry.generation == key.generation =>
                            {
                                entry.generation += 1;
                                entry.armed_tick = tick;
                                let interval = match &entry.payload {
                                    Payload::Timer { interval, .. } => *interval,
                                    _ => unreachable!(),
                                };
                                Some((interval, entry.generation))
                            }
                            _ => None,
                        };
                        if let Some((interval, generation)) = rearm {
                            inner.heap.push(TimerKey {
                                at: Instant::now() + interval,
                                seq,
                                id: key.id.clone(),
                                generation,
                            });
                        }
                    }
                    _ => {
                        inner.entries.remove(&key.id);
                    }
                }
            }
            self.route(handle, result);
        }
        let mut inner = self.inner.borrow_mut();
        for key in not_yet_active {
            inner.heap.push(key);
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let inner = self.inner.borrow();
        if inner.stopped || !inner.microtasks.is_empty() {
            return Some(Duration::ZERO);
        }
        if !inner.defer_queue.is_empty() {
            return Some(Duration::ZERO);
        }
        match inner.heap.next_deadline() {
            Some(at) => Some(at.saturating_duration_since(Instant::now())),
            None if inner.has_referenced_work() => None,
            None => Some(Duration::ZERO),
        }
    }

    fn poll_io(&self, handle: &LoopHandle) -> Result<(), EventError> {
        let timeout = self.poll_timeout();
        let mut events = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            inner.driver.poll(timeout, &mut events)?;
        }

        for event in events {
            if self.fatal() {
                return Ok(());
            }
            let is_signal_pipe = {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                match &inner.signal_pipe {
                    Some(pipe) if pipe.read_fd() == event.fd => {
                        let drained = pipe.drain();
                        inner.pending_signals.extend(drained);
                        true
                    }
                    _ => false,
                }
            };
            if is_signal_pipe {
                continue;
            }
            if event.readable {
                self.dispatch_io(handle, event.fd, true);
            }
            if event.writable {
                self.dispatch_io(handle, event.fd, false);
            }
        }
        Ok(())
    }

    fn dispatch_io(&self, handle: &LoopHandle, fd: RawFd, readable: bool) {
        let cb = {
            let inner = self.inner.borrow();
            let map = if readable {
                &inner.read_fds
            } else {
                &inner.write_fds
            };
            let Some(id) = map.get(&fd) else { return };
            let Some(entry) = inner.entries.get(id) else {
                return;
            };
            if !entry.enabled || entry.armed_tick == inner.tick {
                return;
            }
            match &entry.payload {
                Payload::Io { cb, .. } => (id.clone(), cb.clone()),
                _ => return,
            }
        };
        let span = self.trace_span(if readable { "readable" } else { "writable" }, &cb.0);
        let result = (cb.1.borrow_mut())(handle, fd);
        drop(span);
        self.route(handle, result);
    }

    fn dispatch_signals(&self, handle: &LoopHandle) {
        let pending = std::mem::take(&mut self.inner.borrow_mut().pending_signals);
        for signum in pending {
            if self.fatal() {
                return;
            }
            let Ok(signal) = Signal::try_from(signum) else {
                continue;
            };
            let cb = {
                let inner = self.inner.borrow();
                let Some(id) = inner.signal_ids.get(&signal) else {
                    continue;
                };
                let Some(entry) = inner.entries.get(id) else {
                    continue;
                };
                if !entry.enabled {
                    continue;
                }
                match &entry.payload {
                    Payload::Sig { cb, .. } => (id.clone(), cb.clone()),
                    _ => continue,
                }
            };
            let span = self.trace_span("signal", &cb.0);
            let result = (cb.1.borrow_mut())(handle, signal);
            drop(span);
            self.route(handle, result);
        }
    }

    fn trace_span(&self, phase: &'static str, id: &CallbackId) -> Option<tracing::span::EnteredSpan> {
        if self.inner.borrow().trace {
            Some(trace_span!("event_dispatch", phase, id = %id).entered())
        } else {
            None
        }
    }
}

impl Drop for EventLoop {
    // Callbacks capture LoopHandles; clearing them here breaks the cycles so
    // a dropped loop releases its closures.
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.entries.clear();
        inner.microtasks.clear();
        inner.defer_queue.clear();
        inner.error_handler = None;
    }
}

impl LoopHandle {
    fn upgrade(&self) -> Result<Rc<RefCell<Inner>>, EventError> {
        self.inner.upgrade().ok_or(EventError::LoopGone)
    }

    /// Runs `cb` once after `delay`.
    pub fn delay<F>(&self, delay: Duration, cb: F) -> Result<CallbackId, EventError>
    where
        F: FnMut(&LoopHandle) -> CallbackResult + 'static,
    {
        self.add_timer(Kind::Delay, delay, Box::new(cb))
    }

    /// Runs `cb` every `interval` until cancelled.
    pub fn repeat<F>(&self, interval: Duration, cb: F) -> Result<CallbackId, EventError>
    where
        F: FnMut(&LoopHandle) -> CallbackResult + 'static,
    {
        self.add_timer(Kind::Repeat, interval, Box::new(cb))
    }

    fn add_timer(
        &self,
        kind: Kind,
        interval: Duration,
        cb: TimerCallback,
    ) -> Result<CallbackId, EventError> {
        let rc = self.upgrade()?;
        let mut inner = rc.borrow_mut();
        let id = inner.make_id(if kind == Kind::Repeat { "repeat" } else { "delay" });
        let seq = inner.next_seq();
        let tick = inner.tick;
        inner.entries.insert(
            id.clone(),
            Entry {
                kind,
                enabled: true,
                referenced: true,
                armed_tick: tick,
                generation: 0,
                payload: Payload::Timer {
                    interval,
                    cb: Rc::new(RefCell::new(cb)),
                },
            },
        );
        inner.heap.push(TimerKey {
            at: Instant::now() + interval,
            seq,
            id: id.clone(),
            generation: 0,
        });
        Ok(id)
    }

    /// Enqueues `cb` to run once at the start of the next tick, ahead of
    /// timers, descriptor events and signals.
    pub fn defer<F>(&self, cb: F) -> Result<CallbackId, EventError>
    where
        F: FnMut(&LoopHandle) -> CallbackResult + 'static,
    {
        let rc = self.upgrade()?;
        let mut inner = rc.borrow_mut();
        let id = inner.make_id("defer");
        let tick = inner.tick;
        inner.entries.insert(
            id.clone(),
            Entry {
                kind: Kind::Defer,
                enabled: true,
                referenced: true,
                armed_tick: tick,
                generation: 0,
                payload: Payload::Timer {
                    interval: Duration::ZERO,
                    cb: Rc::new(RefCell::new(Box::new(cb))),
                },
            },
        );
        inner.defer_queue.push_back(id.clone());
        Ok(id)
    }

    /// Enqueues a microtask for the next safe point of the current or next
    /// tick. Microtasks run in FIFO order before any other event.
    pub fn queue<F>(&self, f: F)
    where
        F: FnOnce(&LoopHandle) -> CallbackResult + 'static,
    {
        if let Ok(rc) = self.upgrade() {
            rc.borrow_mut().microtasks.push_back(Box::new(f));
        }
    }

    /// Arms a readable callback on `fd`, replacing any prior one.
    pub fn on_readable<F>(&self, fd: RawFd, cb: F) -> Result<CallbackId, EventError>
    where
        F: FnMut(&LoopHandle, RawFd) -> CallbackResult + 'static,
    {
        self.add_io(fd, true, Box::new(cb))
    }

    /// Arms a writable callback on `fd`, replacing any prior one.
    pub fn on_writable<F>(&self, fd: RawFd, cb: F) -> Result<CallbackId, EventError>
    where
        F: FnMut(&LoopHandle, RawFd) -> CallbackResult + 'static,
    {
        self.add_io(fd, false, Box::new(cb))
    }

    fn add_io(&self, fd: RawFd, readable: bool, cb: IoCallback) -> Result<CallbackId, EventError> {
        let rc = self.upgrade()?;
        let mut inner = rc.borrow_mut();
        let id = inner.make_id(if readable { "readable" } else { "writable" });
        let tick = inner.tick;
        // Replace-not-append: the previous callback on this (fd, direction)
        // is cancelled by arming a new one.
        let map = if readable {
            &mut inner.read_fds
        } else {
            &mut inner.write_fds
        };
        if let Some(old) = map.insert(fd, id.clone()) {
            inner.entries.remove(&old);
        }
        inner.entries.insert(
            id.clone(),
            Entry {
                kind: if readable { Kind::Readable } else { Kind::Writable },
                enabled: true,
                referenced: true,
                // I/O callbacks participate from the next poll; the current
                // tick's event set was computed without them.
                armed_tick: tick,
                generation: 0,
                payload: Payload::Io {
                    fd,
                    cb: Rc::new(RefCell::new(cb)),
                },
            },
        );
        inner.io_interest(fd)?;
        Ok(id)
    }

    /// Disarms the readable callback on `fd`; reports whether one existed.
    pub fn off_readable(&self, fd: RawFd) -> bool {
        self.remove_io(fd, true)
    }

    /// Disarms the writable callback on `fd`; reports whether one existed.
    pub fn off_writable(&self, fd: RawFd) -> bool {
        self.remove_io(fd, false)
    }

    fn remove_io(&self, fd: RawFd, readable: bool) -> bool {
        let Ok(rc) = self.upgrade() else { return false };
        let mut inner = rc.borrow_mut();
        let map = if readable {
            &mut inner.read_fds
        } else {
            &mut inner.write_fds
        };
        let Some(id) = map.remove(&fd) else {
            return false;
        };
        inner.entries.remove(&id);
        let _ = inner.io_interest(fd);
        true
    }

    /// Registers an OS signal callback; dispatch happens at tick boundaries.
    pub fn on_signal<F>(&self, signal: Signal, cb: F) -> Result<CallbackId, EventError>
    where
        F: FnMut(&LoopHandle, Signal) -> CallbackResult + 'static,
    {
        let cb: Box<dyn FnMut(&LoopHandle, Signal) -> CallbackResult + 'static> = Box::new(cb);
        let rc = self.upgrade()?;
        let mut inner = rc.borrow_mut();
        if inner.signal_pipe.is_none() {
            let pipe = SignalPipe::new().map_err(EventError::Driver)?;
            let fd = pipe.read_fd();
            inner.signal_pipe = Some(pipe);
            inner.driver.set_interest(fd, true, false)?;
        }
        if let Some(pipe) = inner.signal_pipe.as_mut() {
            pipe.watch(signal)
                .map_err(|e| EventError::Driver(std::io::Error::from(e)))?;
        }
        let id = inner.make_id("signal");
        let tick = inner.tick;
        if let Some(old) = inner.signal_ids.insert(signal, id.clone()) {
            inner.entries.remove(&old);
        }
        inner.entries.insert(
            id.clone(),
            Entry {
                kind: Kind::Signal,
                enabled: true,
                // Signal routes alone must not keep an idle worker alive.
                referenced: false,
                armed_tick: tick,
                generation: 0,
                payload: Payload::Sig {
                    signal,
                    cb: Rc::new(RefCell::new(cb)),
                },
            },
        );
        Ok(id)
    }

    /// Unregisters the callback for `signal`; reports whether one existed.
    pub fn off_signal(&self, signal: Signal) -> bool {
        let Ok(rc) = self.upgrade() else { return false };
        let mut inner = rc.borrow_mut();
        let Some(id) = inner.signal_ids.remove(&signal) else {
            return false;
        };
        inner.entries.remove(&id);
        if let Some(pipe) = inner.signal_pipe.as_mut() {
            let _ = pipe.unwatch(signal);
        }
        true
    }

    /// Re-enables a disabled callback. Invalid on cancelled ids.
    pub fn enable(&self, id: &CallbackId) -> Result<(), EventError> {
        let rc = self.upgrade()?;
        let mut guard = rc.borrow_mut();
        let inner = &mut *guard;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let tick = inner.tick;
        enum Rearm {
            Timer(Duration, u64),
            Io(RawFd),
            None,
        }
        let rearm = {
            let entry = inner
                .entries
                .get_mut(id)
                .ok_or_else(|| EventError::InvalidCallbackId(id.to_string()))?;
            if entry.enabled {
                return Ok(());
            }
            entry.enabled = true;
            entry.armed_tick = tick;
            match &entry.payload {
                Payload::Timer { interval, .. } => {
                    entry.generation += 1;
                    Rearm::Timer(*interval, entry.generation)
                }
                Payload::Io { fd, .. } => Rearm::Io(*fd),
                Payload::Sig { .. } => Rearm::None,
            }
        };
        match rearm {
            Rearm::Timer(interval, generation) => {
                if matches!(
                    inner.entries.get(id).map(|e| e.kind),
                    Some(Kind::Delay | Kind::Repeat)
                ) {
                    inner.heap.push(TimerKey {
                        at: Instant::now() + interval,
                        seq,
                        id: id.clone(),
                        generation,
                    });
                } else {
                    // Re-enabled defer: queue it again.
                    inner.defer_queue.push_back(id.clone());
                }
            }
            Rearm::Io(fd) => inner.io_interest(fd)?,
            Rearm::None => {}
        }
        Ok(())
    }

    /// Disables a callback without forgetting it. Invalid on cancelled ids.
    pub fn disable(&self, id: &CallbackId) -> Result<(), EventError> {
        let rc = self.upgrade()?;
        let mut guard = rc.borrow_mut();
        let inner = &mut *guard;
        let io_fd = {
            let entry = inner
                .entries
                .get_mut(id)
                .ok_or_else(|| EventError::InvalidCallbackId(id.to_string()))?;
            if !entry.enabled {
                return Ok(());
            }
            entry.enabled = false;
            // Invalidate any pending heap keys.
            entry.generation += 1;
            match &entry.payload {
                Payload::Io { fd, .. } => Some(*fd),
                _ => None,
            }
        };
        if let Some(fd) = io_fd {
            inner.io_interest(fd)?;
        }
        Ok(())
    }

    /// Cancels a callback. Never fails; unknown ids are a no-op. A cancelled
    /// callback is never invoked again and its id becomes invalid.
    pub fn cancel(&self, id: &CallbackId) {
        let Ok(rc) = self.upgrade() else { return };
        let mut inner = rc.borrow_mut();
        let Some(entry) = inner.entries.remove(id) else {
            return;
        };
        match entry.payload {
            Payload::Io { fd, .. } => {
                let map = if entry.kind == Kind::Readable {
                    &mut inner.read_fds
                } else {
                    &mut inner.write_fds
                };
                if map.get(&fd) == Some(id) {
                    map.remove(&fd);
                }
                let _ = inner.io_interest(fd);
            }
            Payload::Sig { signal, .. } => {
                if inner.signal_ids.get(&signal) == Some(id) {
                    inner.signal_ids.remove(&signal);
                    if let Some(pipe) = inner.signal_pipe.as_mut() {
                        let _ = pipe.unwatch(signal);
                    }
                }
            }
            Payload::Timer { .. } => {}
        }
    }

    pub fn is_enabled(&self, id: &CallbackId) -> bool {
        self.upgrade()
            .ok()
            .and_then(|rc| rc.borrow().entries.get(id).map(|e| e.enabled))
            .unwrap_or(false)
    }

    /// Marks the callback as keeping the loop alive. Invalid on cancelled ids.
    pub fn reference(&self, id: &CallbackId) -> Result<(), EventError> {
        self.set_referenced(id, true)
    }

    /// The loop may exit while this callback is still armed.
    pub fn unreference(&self, id: &CallbackId) -> Result<(), EventError> {
        self.set_referenced(id, false)
    }

    fn set_referenced(&self, id: &CallbackId, referenced: bool) -> Result<(), EventError> {
        let rc = self.upgrade()?;
        let mut inner = rc.borrow_mut();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| EventError::InvalidCallbackId(id.to_string()))?;
        entry.referenced = referenced;
        Ok(())
    }

    /// Requests loop exit at the current tick boundary.
    pub fn stop(&self) {
        if let Ok(rc) = self.upgrade() {
            rc.borrow_mut().stopped = true;
        }
    }

    pub fn is_running(&self) -> bool {
        self.upgrade()
            .map(|rc| rc.borrow().running)
            .unwrap_or(false)
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&LoopHandle, BoxError) -> CallbackResult + 'static,
    {
        if let Ok(rc) = self.upgrade() {
            rc.borrow_mut().error_handler = Some(Rc::new(handler));
        }
    }

    pub fn error_handler(&self) -> Option<ErrorHandler> {
        self.upgrade().ok().and_then(|rc| rc.borrow().error_handler.clone())
    }

    /// Creates a suspension bound to the calling location. The returned
    /// [`Resumer`] must eventually resolve it; unresolved suspensions are
    /// reported when the loop exits.
    #[track_caller]
    pub fn suspension(&self) -> Result<(Suspension, Resumer), EventError> {
        let location = Location::caller();
        let rc = self.upgrade()?;
        let id = {
            let mut inner = rc.borrow_mut();
            inner.next_suspension += 1;
            let id = inner.next_suspension;
            inner.suspensions.insert(id, location);
            id
        };
        Ok(suspension::new_pair(self.clone(), id))
    }

    pub(crate) fn forget_suspension(&self, id: u64) {
        if let Ok(rc) = self.upgrade() {
            rc.borrow_mut().suspensions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn test_loop() -> EventLoop {
        EventLoop::with_driver(Box::new(driver_select::SelectDriver::new()))
    }

    #[test]
    fn delay_fires_once_then_forgets_the_id() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let fired = Rc::new(Cell::new(0u32));
        let counter = fired.clone();
        let id = handle
            .delay(Duration::from_millis(1), move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            })
            .unwrap();
        ev.run().unwrap();
        assert_eq!(fired.get(), 1);
        assert!(matches!(
            handle.enable(&id),
            Err(EventError::InvalidCallbackId(_))
        ));
    }

    #[test]
    fn repeat_reschedules_until_cancelled() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let fired = Rc::new(Cell::new(0u32));
        let counter = fired.clone();
        handle
            .repeat(Duration::from_millis(1), move |h: &LoopHandle| {
                counter.set(counter.get() + 1);
                if counter.get() == 3 {
                    h.stop();
                }
                Ok(())
            })
            .unwrap();
        ev.run().unwrap();
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn microtasks_run_before_timers() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        handle
            .delay(Duration::ZERO, move |_| {
                o1.borrow_mut().push("timer");
                Ok(())
            })
            .unwrap();
        let o2 = order.clone();
        handle.queue(move |_| {
            o2.borrow_mut().push("micro");
            Ok(())
        });
        ev.run().unwrap();
        assert_eq!(*order.borrow(), vec!["micro", "timer"]);
    }

    #[test]
    fn defer_runs_ahead_of_timers_queued_earlier() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        handle
            .delay(Duration::ZERO, move |_| {
                o1.borrow_mut().push("timer");
                Ok(())
            })
            .unwrap();
        let o2 = order.clone();
        handle
            .defer(move |_| {
                o2.borrow_mut().push("defer");
                Ok(())
            })
            .unwrap();
        ev.run().unwrap();
        assert_eq!(*order.borrow(), vec!["defer", "timer"]);
    }

    #[test]
    fn cancel_is_idempotent_and_poisons_the_id() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let id = handle
            .delay(Duration::from_millis(1), move |_| {
                flag.set(true);
                Ok(())
            })
            .unwrap();
        handle.cancel(&id);
        handle.cancel(&id);
        assert!(matches!(
            handle.reference(&id),
            Err(EventError::InvalidCallbackId(_))
        ));
        ev.run().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn disable_enable_round_trip() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let fired = Rc::new(Cell::new(0u32));
        let counter = fired.clone();
        let id = handle
            .delay(Duration::from_millis(1), move |h| {
                counter.set(counter.get() + 1);
                h.stop();
                Ok(())
            })
            .unwrap();
        handle.disable(&id).unwrap();
        assert!(!handle.is_enabled(&id));
        handle.enable(&id).unwrap();
        assert!(handle.is_enabled(&id));
        ev.run().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn unreferenced_callbacks_do_not_hold_the_loop_open() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let id = handle
            .repeat(Duration::from_secs(3600), |_| Ok(()))
            .unwrap();
        handle.unreference(&id).unwrap();
        // Nothing referenced: run must return immediately.
        ev.run().unwrap();
    }

    #[test]
    fn callback_error_reaches_the_handler() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        handle.set_error_handler(move |_, err| {
            assert_eq!(err.to_string(), "boom");
            flag.set(true);
            Ok(())
        });
        handle
            .delay(Duration::from_millis(1), |_| Err("boom".into()))
            .unwrap();
        ev.run().unwrap();
        assert!(seen.get());
    }

    #[test]
    fn unhandled_error_unwinds_run() {
        let mut ev = test_loop();
        let handle = ev.handle();
        handle
            .delay(Duration::from_millis(1), |_| Err("boom".into()))
            .unwrap();
        let err = ev.run().err().expect("run must surface the failure");
        assert!(matches!(err, EventError::Uncaught { .. }));
    }

    #[test]
    fn readable_callback_sees_pipe_data() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;
        assert_eq!(unsafe { libc::write(write_fd, b"a".as_ptr().cast(), 1) }, 1);

        let mut ev = test_loop();
        let handle = ev.handle();
        let got = Rc::new(Cell::new(false));
        let flag = got.clone();
        handle
            .on_readable(read_fd, move |h, fd| {
                let mut buf = [0u8; 8];
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                assert_eq!(n, 1);
                flag.set(true);
                h.off_readable(fd);
                h.stop();
                Ok(())
            })
            .unwrap();
        ev.run().unwrap();
        assert!(got.get());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn rearming_a_fd_replaces_the_prior_callback() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;
        assert_eq!(unsafe { libc::write(write_fd, b"a".as_ptr().cast(), 1) }, 1);

        let mut ev = test_loop();
        let handle = ev.handle();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h1 = hits.clone();
        handle
            .on_readable(read_fd, move |_, _| {
                h1.borrow_mut().push("first");
                Ok(())
            })
            .unwrap();
        let h2 = hits.clone();
        handle
            .on_readable(read_fd, move |h, fd| {
                let mut buf = [0u8; 8];
                unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                h2.borrow_mut().push("second");
                h.off_readable(fd);
                h.stop();
                Ok(())
            })
            .unwrap();
        ev.run().unwrap();
        assert_eq!(*hits.borrow(), vec!["second"]);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn suspension_resume_runs_the_continuation() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        let (suspension, resumer) = handle.suspension().unwrap();
        suspension.on_resume(move |h, outcome| {
            outcome?;
            flag.set(true);
            h.stop();
            Ok(())
        });
        let slot = Rc::new(RefCell::new(Some(resumer)));
        handle
            .delay(Duration::from_millis(1), move |_| {
                if let Some(r) = slot.borrow_mut().take() {
                    r.resume();
                }
                Ok(())
            })
            .unwrap();
        ev.run().unwrap();
        assert!(done.get());
    }
}
