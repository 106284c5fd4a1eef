//! Engine lifecycle state machine

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, XFlatError};

/// Lifecycle of an engine. Transitions only move forward, except that a
/// spun-down engine may be replaced by a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EngineState {
    Uninitialized = 0,
    SpinningUp = 1,
    SpunUp = 2,
    Running = 3,
    SpinningDown = 4,
    SpunDown = 5,
}

impl EngineState {
    fn from_u8(value: u8) -> EngineState {
        match value {
            0 => EngineState::Uninitialized,
            1 => EngineState::SpinningUp,
            2 => EngineState::SpunUp,
            3 => EngineState::Running,
            4 => EngineState::SpinningDown,
            _ => EngineState::SpunDown,
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Atomic state cell with compare-and-set transitions and a readiness
/// condition for callers that arrive while the engine is still spinning up.
pub(crate) struct StateCell {
    state: AtomicU8,
    lock: Mutex<()>,
    signal: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Uninitialized as u8),
            lock: Mutex::new(()),
            signal: Condvar::new(),
        }
    }

    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Guarded transition; returns false when the current state was not
    /// `from`.
    pub fn transition(&self, from: EngineState, to: EngineState) -> bool {
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            let _guard = self.lock.lock();
            self.signal.notify_all();
        }
        ok
    }

    /// Unconditional transition, used by forced shutdown.
    pub fn force(&self, to: EngineState) {
        self.state.store(to as u8, Ordering::Release);
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    /// Block until the engine is running. Fails once the engine moves to
    /// `SpinningDown` or beyond, or if it was never spun up.
    pub fn await_running(&self, name: &str) -> Result<()> {
        loop {
            match self.get() {
                EngineState::Running => return Ok(()),
                EngineState::SpinningUp | EngineState::SpunUp => {
                    let mut guard = self.lock.lock();
                    // re-check with the lock held so a transition between the
                    // check and the wait cannot be missed
                    match self.get() {
                        EngineState::SpinningUp | EngineState::SpunUp => {
                            self.signal.wait(&mut guard);
                        }
                        _ => {}
                    }
                }
                state => {
                    return Err(XFlatError::EngineState(format!(
                        "engine {name} is {state}, not accepting operations"
                    )));
                }
            }
        }
    }
}
