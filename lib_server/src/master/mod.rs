//! # Master Process Supervisor
//!
//! `Supervisor::run_all` is the entrypoint of a server binary. The phases
//! run strictly in order: platform check, global init, command parse,
//! master-lock acquisition, daemonization, per-server init, signal
//! installation, pid-file write, lock release, banner, worker forks, stdio
//! reset, monitor loop.
//!
//! Worker identity is the *slot*, not the pid: each server owns a
//! fixed-size slot array, an exiting worker vacates its slot, and the next
//! fork fills the lowest vacant one. Reloads roll serially: one reloadable
//! worker is signalled, its replacement forks on exit, then the next is
//! signalled.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{error, info, warn};

use crate::error::ServerError;
use crate::events::create_poller;
use crate::logging;
use crate::net::Server;
use crate::protocols::CodecRegistry;
use crate::runtime::RuntimeConfig;
use crate::timers::Timers;
use crate::worker;

pub mod command;
pub mod daemon;
pub mod pidfile;
pub mod signals;
pub mod status;

use command::{Cli, Verb};
use status::{MasterManifest, ServerManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStatus {
    Starting,
    Running,
    Reloading,
    Shutdown,
}

impl MasterStatus {
    fn as_str(self) -> &'static str {
        match self {
            MasterStatus::Starting => "STARTING",
            MasterStatus::Running => "RUNNING",
            MasterStatus::Reloading => "RELOADING",
            MasterStatus::Shutdown => "SHUTDOWN",
        }
    }
}

type MasterHook = Box<dyn FnMut(&mut [Server])>;

pub struct Supervisor {
    servers: Vec<Server>,
    registry: CodecRegistry,
    runtime: RuntimeConfig,
    state: MasterStatus,
    /// Per server: slot index -> worker pid (0 = vacant).
    slots: Vec<Vec<i32>>,
    /// pid -> (server index, slot index).
    pid_index: HashMap<i32, (usize, usize)>,
    pids_to_restart: VecDeque<i32>,
    reload_graceful: bool,
    exit_info: Vec<BTreeMap<i32, u64>>,
    timers: Option<Timers>,
    on_master_reload: Option<MasterHook>,
    on_master_stop: Option<MasterHook>,
    daemonized: bool,
}

impl Supervisor {
    pub fn new() -> Result<Self, ServerError> {
        Ok(Self {
            servers: Vec::new(),
            registry: CodecRegistry::with_builtins(),
            runtime: RuntimeConfig::resolve()?,
            state: MasterStatus::Starting,
            slots: Vec::new(),
            pid_index: HashMap::new(),
            pids_to_restart: VecDeque::new(),
            reload_graceful: false,
            exit_info: Vec::new(),
            timers: None,
            on_master_reload: None,
            on_master_stop: None,
            daemonized: false,
        })
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn codec_registry_mut(&mut self) -> &mut CodecRegistry {
        &mut self.registry
    }

    pub fn add_server(&mut self, server: Server) -> &mut Self {
        self.servers.push(server);
        self
    }

    /// Runs before reloadable workers are cycled; may mutate the server
    /// configuration the replacements will start with.
    pub fn on_master_reload<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&mut [Server]) + 'static,
    {
        self.on_master_reload = Some(Box::new(hook));
        self
    }

    pub fn on_master_stop<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&mut [Server]) + 'static,
    {
        self.on_master_stop = Some(Box::new(hook));
        self
    }

    /// Entry point: parse the command verb and act on it. Returns the
    /// process exit code.
    pub fn run_all(mut self) -> Result<i32, ServerError> {
        if !cfg!(unix) {
            eprintln!("this supervisor only runs on unix platforms");
            return Ok(1);
        }
        let cli = Cli::parse_args();
        match cli.verb {
            Verb::Start { daemon, quiet } => self.start(daemon, quiet),
            Verb::Stop { graceful } => self.command_stop(graceful),
            Verb::Restart {
                graceful,
                daemon,
                quiet,
            } => {
                let _ = self.command_stop(graceful);
                self.start(daemon, quiet)
            }
            Verb::Reload { graceful } => self.command_reload(graceful),
            Verb::Status { live } => self.command_dump(Signal::SIGABRT, live),
            Verb::Connections => self.command_dump(Signal::SIGIO, false),
        }
    }

    // ----- start path -------------------------------------------------

    /// Programmatic `start`, bypassing the CLI: init, fork the pool, run
    /// the monitor loop. Returns the master's exit code. `run_all` routes
    /// the `start` verb here; embedding callers and harnesses may call it
    /// directly.
    pub fn start(&mut self, daemon: bool, quiet: bool) -> Result<i32, ServerError> {
        if let Some(pid) = pidfile::running_master(&self.runtime.pid_file) {
            eprintln!("already running as pid {pid}");
            return Err(ServerError::AlreadyRunning(
                self.runtime.pid_file.display().to_string(),
            ));
        }
        let _log_guard = logging::init(&self.runtime.log_file, !daemon);

        let lock = pidfile::MasterLock::acquire(&self.runtime.lock_file)?;

        if daemon {
            daemon::daemonize()?;
            self.daemonized = true;
        }

        for server in &mut self.servers {
            server.init(&self.registry)?;
        }

        signals::install()?;
        pidfile::write_pid(&self.runtime.pid_file)?;
        lock.release();

        if !quiet {
            self.banner(daemon);
        }
        logging::raw_line(&self.runtime.log_file, "master started");

        self.slots = self.servers.iter().map(|s| vec![0; s.count]).collect();
        self.exit_info = self.servers.iter().map(|_| BTreeMap::new()).collect();
        self.state = MasterStatus::Running;

        for server_index in 0..self.servers.len() {
            for slot in 0..self.slots[server_index].len() {
                self.fork_one(server_index, slot)?;
            }
        }

        if self.daemonized {
            daemon::redirect_stdio(&self.runtime.log_file);
        }

        Ok(self.monitor())
    }

    fn banner(&self, daemon: bool) {
        println!("----------------------- server -----------------------");
        println!("{:<16}{:<32}{:<8}{:<10}", "name", "listen", "count", "reload");
        for server in &self.servers {
            println!(
                "{:<16}{:<32}{:<8}{:<10}",
                server.name,
                server.listen_url(),
                server.count,
                if server.reloadable { "yes" } else { "no" }
            );
        }
        println!("------------------------------------------------------");
        if !daemon {
            println!("Press Ctrl+C to stop. Start with -d to daemonize.");
        }
    }

    fn fork_one(&mut self, server_index: usize, slot: usize) -> Result<(), ServerError> {
        match unsafe { fork() }.map_err(ServerError::Fork)? {
            ForkResult::Parent { child } => {
                self.slots[server_index][slot] = child.as_raw();
                self.pid_index
                    .insert(child.as_raw(), (server_index, slot));
                Ok(())
            }
            ForkResult::Child => {
                if self.daemonized {
                    daemon::redirect_stdio(&self.runtime.log_file);
                }
                let server = self.servers.swap_remove(server_index);
                let code = worker::run(server, slot, self.runtime.clone());
                std::process::exit(code);
            }
        }
    }

    // ----- monitor loop ----------------------------------------------

    fn monitor(&mut self) -> i32 {
        self.timers = Some(Timers::with_alarm());
        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(WaitStatus::Exited(pid, code)) => self.handle_exit(pid.as_raw(), code),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.handle_exit(pid.as_raw(), 128 + signal as i32)
                }
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    if self.state == MasterStatus::Shutdown {
                        break;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(err) => {
                    error!(%err, "waitpid failed");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }

            if let Some(timers) = &self.timers {
                timers.tick();
            }
            for signal in signals::take_pending() {
                self.dispatch_signal(signal);
            }
            if self.state == MasterStatus::Shutdown && self.live_pids().is_empty() {
                break;
            }
        }

        let _ = std::fs::remove_file(&self.runtime.pid_file);
        if let Some(mut hook) = self.on_master_stop.take() {
            hook(&mut self.servers);
        }
        logging::raw_line(&self.runtime.log_file, "master stopped");
        info!("master stopped");
        0
    }

    fn live_pids(&self) -> Vec<i32> {
        self.slots
            .iter()
            .flatten()
            .copied()
            .filter(|&pid| pid != 0)
            .collect()
    }

    fn dispatch_signal(&mut self, signal: Signal) {
        match signal {
            Signal::SIGINT | Signal::SIGTERM | Signal::SIGHUP | Signal::SIGTSTP => {
                self.stop_all(false)
            }
            Signal::SIGQUIT => self.stop_all(true),
            Signal::SIGUSR1 => self.reload(false),
            Signal::SIGUSR2 => self.reload(true),
            Signal::SIGABRT => self.dump(Signal::SIGABRT),
            Signal::SIGIO => self.dump(Signal::SIGIO),
            _ => {}
        }
    }

    fn handle_exit(&mut self, pid: i32, code: i32) {
        let Some((server_index, slot)) = self.pid_index.remove(&pid) else {
            return;
        };
        self.slots[server_index][slot] = 0;
        *self.exit_info[server_index].entry(code).or_insert(0) += 1;
        if code != 0 {
            warn!(
                pid,
                code,
                server = %self.servers.get(server_index).map(|s| s.name.clone()).unwrap_or_default(),
                "worker exited abnormally"
            );
        }

        if self.state == MasterStatus::Shutdown {
            return;
        }

        // Stable worker indices: the replacement takes the lowest vacancy.
        if let Some(vacant) = self.slots[server_index].iter().position(|&p| p == 0) {
            if let Err(err) = self.fork_one(server_index, vacant) {
                error!(%err, "refork failed");
            }
        }

        if self.pids_to_restart.front() == Some(&pid) {
            self.pids_to_restart.pop_front();
            self.continue_reload();
        } else {
            self.pids_to_restart.retain(|&p| p != pid);
        }
    }

    // ----- stop & reload ---------------------------------------------

    fn stop_all(&mut self, graceful: bool) {
        info!(graceful, "stopping all workers");
        self.state = MasterStatus::Shutdown;
        let worker_signal = if graceful {
            Signal::SIGQUIT
        } else {
            Signal::SIGINT
        };
        let pids = self.live_pids();
        for &pid in &pids {
            let _ = kill(Pid::from_raw(pid), worker_signal);
        }
        // Stragglers get SIGKILL once the grace period lapses.
        if let Some(timers) = &self.timers {
            let stragglers = pids;
            let _ = timers.add(
                self.runtime.stop_timeout,
                Box::new(move || {
                    for &pid in &stragglers {
                        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                    }
                    Ok(())
                }),
                false,
            );
        }
    }

    fn reload(&mut self, graceful: bool) {
        info!(graceful, "reloading workers");
        self.state = MasterStatus::Reloading;
        self.reload_graceful = graceful;
        if let Some(mut hook) = self.on_master_reload.take() {
            hook(&mut self.servers);
            self.on_master_reload = Some(hook);
        }

        let signal = if graceful {
            Signal::SIGUSR2
        } else {
            Signal::SIGUSR1
        };
        self.pids_to_restart.clear();
        for (&pid, &(server_index, _)) in &self.pid_index {
            if self
                .servers
                .get(server_index)
                .map(|s| s.reloadable)
                .unwrap_or(false)
            {
                self.pids_to_restart.push_back(pid);
            } else {
                // Non-reloadable workers still get their reload hook.
                let _ = kill(Pid::from_raw(pid), signal);
            }
        }
        self.continue_reload();
    }

    /// Serial rollout: signal the head of the restart queue; the next one
    /// goes when this one's exit is reaped.
    fn continue_reload(&mut self) {
        let Some(&pid) = self.pids_to_restart.front() else {
            if self.state == MasterStatus::Reloading {
                self.state = MasterStatus::Running;
                info!("reload complete");
            }
            return;
        };
        let signal = if self.reload_graceful {
            Signal::SIGUSR2
        } else {
            Signal::SIGUSR1
        };
        let _ = kill(Pid::from_raw(pid), signal);
        if !self.reload_graceful {
            if let Some(timers) = &self.timers {
                let _ = timers.add(
                    self.runtime.stop_timeout,
                    Box::new(move || {
                        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                        Ok(())
                    }),
                    false,
                );
            }
        }
    }

    // ----- dumps ------------------------------------------------------

    fn manifest(&self) -> MasterManifest {
        MasterManifest {
            pid: std::process::id(),
            status: self.state.as_str().to_string(),
            event_driver: create_poller()
                .map(|driver| driver.name().to_string())
                .unwrap_or_else(|_| "unavailable".to_string()),
            servers: self
                .servers
                .iter()
                .enumerate()
                .map(|(index, server)| ServerManifest {
                    name: server.name.clone(),
                    listen: server.listen_url().to_string(),
                    count: server.count,
                    workers: self.slots.get(index).cloned().unwrap_or_default(),
                    exit_info: self.exit_info.get(index).cloned().unwrap_or_default(),
                })
                .collect(),
        }
    }

    /// Primes the status file and fans the dump signal out to the pool.
    fn dump(&mut self, signal: Signal) {
        if let Err(err) = status::prime(&self.runtime.status_file, &self.manifest()) {
            warn!(%err, "could not prime the status file");
            return;
        }
        for pid in self.live_pids() {
            let _ = kill(Pid::from_raw(pid), signal);
        }
    }

    // ----- control commands (sent to a running master) ----------------

    fn master_pid(&self) -> Result<Pid, ServerError> {
        pidfile::running_master(&self.runtime.pid_file).ok_or_else(|| {
            ServerError::NotRunning(self.runtime.pid_file.display().to_string())
        })
    }

    fn command_stop(&mut self, graceful: bool) -> Result<i32, ServerError> {
        let pid = match self.master_pid() {
            Ok(pid) => pid,
            Err(err) => {
                eprintln!("{err}");
                return Ok(1);
            }
        };
        let signal = if graceful {
            Signal::SIGQUIT
        } else {
            Signal::SIGINT
        };
        kill(pid, signal)?;
        print!("stopping master {pid} ...");
        let deadline = self.runtime.stop_timeout + Duration::from_secs(3);
        let started = std::time::Instant::now();
        while pidfile::alive(pid) {
            if started.elapsed() > deadline {
                println!(" still running");
                return Ok(1);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        println!(" stopped");
        Ok(0)
    }

    fn command_reload(&mut self, graceful: bool) -> Result<i32, ServerError> {
        let pid = match self.master_pid() {
            Ok(pid) => pid,
            Err(err) => {
                eprintln!("{err}");
                return Ok(1);
            }
        };
        let signal = if graceful {
            Signal::SIGUSR2
        } else {
            Signal::SIGUSR1
        };
        kill(pid, signal)?;
        println!("reload signalled");
        Ok(0)
    }

    /// `status` / `connections`: trigger a dump, give workers a moment to
    /// append, then print the settled file.
    fn command_dump(&mut self, signal: Signal, live: bool) -> Result<i32, ServerError> {
        loop {
            let pid = match self.master_pid() {
                Ok(pid) => pid,
                Err(err) => {
                    eprintln!("{err}");
                    return Ok(1);
                }
            };
            kill(pid, signal)?;
            std::thread::sleep(Duration::from_millis(500));
            match status::read(&self.runtime.status_file) {
                Ok(content) => print_dump(&content),
                Err(err) => eprintln!("no status file: {err}"),
            }
            if !live {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(1500));
            // Live mode repaints until interrupted.
            print!("\x1b[2J\x1b[H");
        }
    }
}

fn print_dump(content: &str) {
    match status::parse(content) {
        None => print!("{content}"),
        Some((manifest, rows)) => {
            println!(
                "master pid:{} status:{} driver:{}",
                manifest.pid, manifest.status, manifest.event_driver
            );
            for server in &manifest.servers {
                println!(
                    "  {} {} count:{} workers:{:?} exits:{:?}",
                    server.name, server.listen, server.count, server.workers, server.exit_info
                );
            }
            for row in rows {
                println!("  {row}");
            }
        }
    }
}
