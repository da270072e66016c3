//! One-shot cooperative suspension.
//!
//! A callback that needs to wait for something splits itself at the yield
//! point: it asks the loop for a `(Suspension, Resumer)` pair, installs the
//! rest of its work as the continuation, and returns. Whoever holds the
//! `Resumer` later schedules that continuation with `resume()` or delivers an
//! error into it with `throw()`. Both consume the resumer, so a suspension
//! resolves exactly once.
//!
//! A suspension whose resumer is dropped unresolved can never run again; the
//! loop reports such deadlocks when `run()` exits, naming the source location
//! that created each one.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{BoxError, CallbackResult};

use super::LoopHandle;

pub(crate) type Continuation = Box<dyn FnOnce(&LoopHandle, CallbackResult) -> CallbackResult>;

pub(crate) struct SuspState {
    continuation: Option<Continuation>,
    // Outcome delivered before the continuation was installed.
    outcome: Option<CallbackResult>,
}

/// The paused half: install the continuation here.
pub struct Suspension {
    handle: LoopHandle,
    state: Rc<RefCell<SuspState>>,
}

/// The waking half: resolve the suspension from another callback.
pub struct Resumer {
    id: u64,
    handle: LoopHandle,
    state: Rc<RefCell<SuspState>>,
}

pub(crate) fn new_pair(handle: LoopHandle, id: u64) -> (Suspension, Resumer) {
    let state = Rc::new(RefCell::new(SuspState {
        continuation: None,
        outcome: None,
    }));
    (
        Suspension {
            handle: handle.clone(),
            state: state.clone(),
        },
        Resumer { id, handle, state },
    )
}

impl Suspension {
    /// Installs the code that runs once the suspension is resolved. If the
    /// resumer already fired, the continuation is scheduled immediately.
    pub fn on_resume<F>(self, continuation: F)
    where
        F: FnOnce(&LoopHandle, CallbackResult) -> CallbackResult + 'static,
    {
        let pending = {
            let mut state = self.state.borrow_mut();
            match state.outcome.take() {
                Some(outcome) => Some(outcome),
                None => {
                    state.continuation = Some(Box::new(continuation));
                    return;
                }
            }
        };
        if let Some(outcome) = pending {
            self.handle.queue(move |h| continuation(h, outcome));
        }
    }
}

impl Resumer {
    /// Schedules the continuation with a success value on a later tick.
    pub fn resume(self) {
        self.finish(Ok(()));
    }

    /// Schedules the continuation with an error on a later tick.
    pub fn throw(self, err: BoxError) {
        self.finish(Err(err));
    }

    fn finish(self, outcome: CallbackResult) {
        self.handle.forget_suspension(self.id);
        let continuation = {
            let mut state = self.state.borrow_mut();
            match state.continuation.take() {
                Some(cont) => cont,
                None => {
                    state.outcome = Some(outcome);
                    return;
                }
            }
        };
        self.handle.queue(move |h| continuation(h, outcome));
    }
}
