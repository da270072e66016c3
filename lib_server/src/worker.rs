//! Worker process body.
//!
//! A worker owns exactly one server, one event loop and one statistics
//! block. Signals routed through the loop's machinery drive stop, reload
//! and dump behaviour at tick boundaries; an unhandled callback error
//! stops everything with the fatal exit code.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{error, info};

use crate::error::CallbackResult;
use crate::events::{signals, EventLoop, LoopHandle, Signal};
use crate::master::command::FATAL_EXIT_CODE;
use crate::master::signals::SUPERVISED;
use crate::master::status;
use crate::net::Server;
use crate::runtime::RuntimeConfig;
use crate::stats::Statistics;

struct WorkerState {
    server: Rc<RefCell<Server>>,
    slot: usize,
    handle: LoopHandle,
    stats: Rc<Statistics>,
    runtime: RuntimeConfig,
    exit_code: Rc<Cell<i32>>,
    stopping: Rc<Cell<bool>>,
}

/// Runs one worker to completion; the return value is the process exit
/// code the master will see.
pub(crate) fn run(server: Server, slot: usize, runtime: RuntimeConfig) -> i32 {
    // Shed the master's handler table and its (shared, inherited) signal
    // pipe before building our own.
    signals::reset_in_child(&SUPERVISED);

    let mut ev = match EventLoop::new() {
        Ok(ev) => ev,
        Err(err) => {
            error!(%err, "worker could not build an event loop");
            return FATAL_EXIT_CODE;
        }
    };
    info!(server = %server.name, slot, driver = ev.driver_name(), "worker started");

    let state = WorkerState {
        server: Rc::new(RefCell::new(server)),
        slot,
        handle: ev.handle(),
        stats: Statistics::shared(),
        runtime,
        exit_code: Rc::new(Cell::new(0)),
        stopping: Rc::new(Cell::new(false)),
    };

    state.server.borrow().apply_user_group();

    install_error_handler(&state);
    if let Err(err) = install_signal_handlers(&state) {
        error!(%err, "worker signal setup failed");
        return FATAL_EXIT_CODE;
    }

    {
        let mut server = state.server.borrow_mut();
        if let Err(err) = server.run(&state.handle, &state.stats) {
            error!(%err, "worker could not start serving");
            return FATAL_EXIT_CODE;
        }
        if let Some(hook) = server.on_server_start.clone() {
            drop(server);
            if let Err(err) = hook(&state.handle) {
                error!(%err, "server-start hook failed");
                return FATAL_EXIT_CODE;
            }
        }
    }

    match ev.run() {
        Ok(()) => state.exit_code.get(),
        Err(err) => {
            error!(%err, "worker event loop died");
            FATAL_EXIT_CODE
        }
    }
}

/// Unhandled callback errors stop the whole worker with the fatal code.
fn install_error_handler(state: &WorkerState) {
    let server = state.server.clone();
    let stats = state.stats.clone();
    let exit_code = state.exit_code.clone();
    state.handle.set_error_handler(move |handle, err| {
        error!(%err, "unhandled callback error; stopping worker");
        stats.exception_thrown();
        exit_code.set(FATAL_EXIT_CODE);
        let _ = server.borrow_mut().stop(handle, false);
        handle.stop();
        Ok(())
    });
}

fn install_signal_handlers(state: &WorkerState) -> Result<(), crate::error::EventError> {
    for signal in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGTSTP,
    ] {
        let stopper = stop_closure(state, false);
        state.handle.on_signal(signal, stopper)?;
    }
    state
        .handle
        .on_signal(Signal::SIGQUIT, stop_closure(state, true))?;

    state
        .handle
        .on_signal(Signal::SIGUSR1, reload_closure(state, false))?;
    state
        .handle
        .on_signal(Signal::SIGUSR2, reload_closure(state, true))?;

    {
        let server = state.server.clone();
        let stats = state.stats.clone();
        let runtime = state.runtime.clone();
        let slot = state.slot;
        state.handle.on_signal(Signal::SIGABRT, move |_, _| {
            let server = server.borrow();
            let row = format!(
                "pid:{} {} slot:{} listen:{} connections:{} {}",
                std::process::id(),
                server.name,
                slot,
                server.listen_url(),
                server.connection_count(),
                stats.summary()
            );
            let _ = status::append_row(&runtime.status_file, &row);
            Ok(())
        })?;
    }
    {
        let server = state.server.clone();
        let runtime = state.runtime.clone();
        state.handle.on_signal(Signal::SIGIO, move |_, _| {
            let server = server.borrow();
            for row in server.connections_dump() {
                let _ = status::append_row(
                    &runtime.status_file,
                    &format!("pid:{} {}", std::process::id(), row),
                );
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn stop_closure(
    state: &WorkerState,
    graceful: bool,
) -> impl FnMut(&LoopHandle, Signal) -> CallbackResult {
    let server = state.server.clone();
    let stopping = state.stopping.clone();
    move |handle, signal| {
        if stopping.replace(true) {
            return Ok(());
        }
        info!(?signal, graceful, "worker stopping");
        server.borrow_mut().stop(handle, graceful)?;
        if graceful {
            // Wait out the live connections, then leave.
            let server = server.borrow();
            server.drain_then(handle, |h| {
                h.stop();
                Ok(())
            });
        } else {
            handle.stop();
        }
        Ok(())
    }
}

/// Reload delivery: every worker runs its reload hook; only reloadable
/// workers then exit so the master can replace them.
fn reload_closure(
    state: &WorkerState,
    graceful: bool,
) -> impl FnMut(&LoopHandle, Signal) -> CallbackResult {
    let server = state.server.clone();
    let stopping = state.stopping.clone();
    move |handle, _| {
        let (hook, reloadable) = {
            let server = server.borrow();
            (server.on_server_reload.clone(), server.reloadable)
        };
        if let Some(hook) = hook {
            hook(handle)?;
        }
        if !reloadable || stopping.replace(true) {
            return Ok(());
        }
        info!(graceful, "worker reloading");
        server.borrow_mut().stop(handle, graceful)?;
        if graceful {
            let server = server.borrow();
            server.drain_then(handle, |h| {
                h.stop();
                Ok(())
            });
        } else {
            handle.stop();
        }
        Ok(())
    }
}
