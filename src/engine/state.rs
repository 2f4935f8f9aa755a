//! Engine lifecycle state shared between the handle and its worker thread.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one engine.
///
/// ```text
/// Idle ──start──► Running ──end of stream──► Completed ──┐
///                    │                                   ├──stop──► Stopped
///                    └────failure / panic──► Failed ─────┘
/// ```
/// `stop` is valid from every state except `Stopped` (where it is a no-op).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Stopped = 4,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Completed => "completed",
            EngineState::Failed => "failed",
            EngineState::Stopped => "stopped",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => EngineState::Idle,
            1 => EngineState::Running,
            2 => EngineState::Completed,
            3 => EngineState::Failed,
            _ => EngineState::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic cell holding an [`EngineState`]; clones share the same cell.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new(state: EngineState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub(crate) fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from → to`; returns `false` (and changes nothing) if the cell is not in `from`.
    pub(crate) fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_only_from_expected_state() {
        let cell = StateCell::new(EngineState::Running);
        let worker = cell.clone();

        cell.set(EngineState::Stopped);
        assert!(!worker.transition(EngineState::Running, EngineState::Completed));
        assert_eq!(cell.get(), EngineState::Stopped);

        cell.set(EngineState::Running);
        assert!(worker.transition(EngineState::Running, EngineState::Failed));
        assert_eq!(cell.get(), EngineState::Failed);
    }
}
