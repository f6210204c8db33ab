//! Phase observer system
//!
//! The orchestrator owns the phase cursor of a run and notifies registered
//! observers on every phase boundary. Observers are registered by identity:
//! adding the same `Arc` twice is a no-op, so a registry that is shared by
//! many units still hears each boundary exactly once.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::phase::PhaseNumber;

/// Listener for phase boundaries.
///
/// Start notifications fire before any unit does work in the phase; stop
/// notifications fire after every unit in the phase has finished.
pub trait PhaseObserver: Send + Sync {
    /// Called before the phase begins
    fn on_phase_start(&self, _phase: PhaseNumber) {}

    /// Called after the phase has ended
    fn on_phase_stop(&self, _phase: PhaseNumber) {}
}

pub struct Orchestrator {
    observers: RwLock<Vec<Arc<dyn PhaseObserver>>>,
    max_phase: AtomicU32,
    current_phase: AtomicU32,
    phase_active: AtomicBool,
    running: AtomicBool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("max_phase", &self.max_phase)
            .field("current_phase", &self.current_phase)
            .field("phase_active", &self.phase_active)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            max_phase: AtomicU32::new(0),
            current_phase: AtomicU32::new(0),
            phase_active: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    /// Register an observer. Returns false if this exact observer is
    /// already registered.
    pub fn add_observer(&self, observer: Arc<dyn PhaseObserver>) -> bool {
        let mut observers = self.observers.write();
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Make sure the run covers at least phases `0..=phase`.
    pub fn phases_at_least_to(&self, phase: PhaseNumber) {
        self.max_phase.fetch_max(phase, Ordering::SeqCst);
    }

    pub fn max_phase(&self) -> PhaseNumber {
        self.max_phase.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> PhaseNumber {
        self.current_phase.load(Ordering::SeqCst)
    }

    pub fn is_phase_active(&self) -> bool {
        self.phase_active.load(Ordering::SeqCst)
    }

    pub fn continue_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the run; sleepers wake up at their next check.
    pub fn abort(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Move the cursor to `phase` and run every start hook.
    pub fn start_phase(&self, phase: PhaseNumber) {
        self.current_phase.store(phase, Ordering::SeqCst);
        debug!("Starting phase {}", phase);
        for observer in self.snapshot() {
            observer.on_phase_start(phase);
        }
        self.phase_active.store(true, Ordering::SeqCst);
    }

    /// Close `phase` and run every stop hook.
    pub fn end_phase(&self, phase: PhaseNumber) {
        self.phase_active.store(false, Ordering::SeqCst);
        for observer in self.snapshot() {
            observer.on_phase_stop(phase);
        }
        debug!("Ended phase {}", phase);
    }

    // Hooks may block (the coordination channel waits on its peer), so they
    // run without the observer lock held.
    fn snapshot(&self) -> Vec<Arc<dyn PhaseObserver>> {
        self.observers.read().clone()
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PhaseObserver for Recorder {
        fn on_phase_start(&self, phase: PhaseNumber) {
            self.events.lock().push(format!("start {}", phase));
        }

        fn on_phase_stop(&self, phase: PhaseNumber) {
            self.events.lock().push(format!("stop {}", phase));
        }
    }

    #[test]
    fn test_observers_hear_boundaries() {
        let orchestrator = Orchestrator::new();
        let recorder = Arc::new(Recorder::default());
        assert!(orchestrator.add_observer(recorder.clone()));

        orchestrator.start_phase(0);
        assert!(orchestrator.is_phase_active());
        orchestrator.end_phase(0);
        orchestrator.start_phase(1);

        assert_eq!(
            *recorder.events.lock(),
            vec!["start 0", "stop 0", "start 1"]
        );
        assert_eq!(orchestrator.current_phase(), 1);
    }

    #[test]
    fn test_registration_by_identity() {
        let orchestrator = Orchestrator::new();
        let recorder = Arc::new(Recorder::default());
        assert!(orchestrator.add_observer(recorder.clone()));
        assert!(!orchestrator.add_observer(recorder.clone()));
        assert_eq!(orchestrator.observer_count(), 1);

        orchestrator.start_phase(4);
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[test]
    fn test_phases_at_least_to_only_grows() {
        let orchestrator = Orchestrator::new();
        orchestrator.phases_at_least_to(5);
        orchestrator.phases_at_least_to(2);
        assert_eq!(orchestrator.max_phase(), 5);
    }
}
