//! Run state: current phase + guard against overlapping runs.
//!
//! Один RunState на процесс, передаётся в Orchestrator::run по ссылке.
//! RunGuard очищает состояние ровно один раз: явным finish() или в Drop
//! (ранний выход / паника внутри прогона).

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use serde::Serialize;

use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    AcquiringLock,
    CreatingSnapshot,
    Mounting,
    Notifying,
    Unmounting,
    Pruning,
    Error,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Idle | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "Idle",
            Phase::AcquiringLock => "AcquiringLock",
            Phase::CreatingSnapshot => "CreatingSnapshot",
            Phase::Mounting => "Mounting",
            Phase::Notifying => "Notifying",
            Phase::Unmounting => "Unmounting",
            Phase::Pruning => "Pruning",
            Phase::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Inner {
    active: bool,
    phase: Phase,
    last_terminal: Option<Phase>,
    runs: u64,
}

#[derive(Debug)]
pub struct RunState {
    inner: Mutex<Inner>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: false,
                phase: Phase::Idle,
                last_terminal: None,
                runs: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Состояние: пара флагов, после паники держателя оно всё равно валидно.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take the run guard. `Busy` if a run is already active (skipped, not queued).
    pub fn begin(&self) -> Result<RunGuard<'_>, LifecycleError> {
        let mut g = self.lock();
        if g.active {
            return Err(LifecycleError::Busy);
        }
        g.active = true;
        g.phase = Phase::AcquiringLock;
        g.runs += 1;
        debug!("phase Idle -> AcquiringLock (run #{})", g.runs);
        Ok(RunGuard {
            state: self,
            finished: false,
        })
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Terminal phase (Idle or Error) of the last finished run.
    pub fn last_outcome(&self) -> Option<Phase> {
        self.lock().last_terminal
    }

    /// Runs started by this process (busy rejections not counted).
    pub fn runs(&self) -> u64 {
        self.lock().runs
    }
}

#[derive(Debug)]
pub struct RunGuard<'a> {
    state: &'a RunState,
    finished: bool,
}

impl RunGuard<'_> {
    pub fn enter(&self, next: Phase) {
        let mut g = self.state.lock();
        debug!("phase {} -> {}", g.phase, next);
        g.phase = next;
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Final transition. Clears the guard; `terminal` is Idle or Error.
    pub fn finish(mut self, terminal: Phase) {
        self.clear(terminal);
    }

    fn clear(&mut self, terminal: Phase) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut g = self.state.lock();
        debug!("phase {} -> {} (run finished)", g.phase, terminal);
        g.active = false;
        g.phase = Phase::Idle;
        g.last_terminal = Some(terminal);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.clear(Phase::Error);
    }
}
