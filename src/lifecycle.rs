//! Uniform start/ready/stop contract shared by every long-lived component in
//! the fabric. Every runnable transitions `Created -> Starting -> Running
//! -> Stopping -> Stopped`; `wait_for_ready` blocks until `Running`, and
//! `stop` is idempotent regardless of how many callers invoke it
//! concurrently.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Shared state machine embedded in a component. Components compose this
/// rather than inheriting from it, favoring plain structs over
/// trait-object hierarchies.
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
    changed: Condvar,
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            state: Mutex::new(LifecycleState::Created),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    fn set(&self, next: LifecycleState) {
        let mut state = self.state.lock().unwrap();
        *state = next;
        self.changed.notify_all();
    }

    pub fn mark_starting(&self) {
        self.set(LifecycleState::Starting);
    }

    pub fn mark_running(&self) {
        self.set(LifecycleState::Running);
    }

    /// Idempotent: calling this after the component already reached
    /// `Stopping`/`Stopped` is a harmless no-op for the caller's purposes.
    pub fn mark_stopping(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == LifecycleState::Stopped {
            return;
        }
        *state = LifecycleState::Stopping;
        self.changed.notify_all();
    }

    pub fn mark_stopped(&self) {
        self.set(LifecycleState::Stopped);
    }

    /// Blocks until the component reaches `Running` (or has already moved
    /// past it, e.g. a component that stopped before a late caller checked).
    pub fn wait_for_ready(&self) {
        let mut state = self.state.lock().unwrap();
        while *state == LifecycleState::Created || *state == LifecycleState::Starting {
            state = self.changed.wait(state).unwrap();
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_for_ready_blocks_until_running() {
        let lifecycle = Arc::new(Lifecycle::new());
        let worker = Arc::clone(&lifecycle);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            worker.mark_starting();
            std::thread::sleep(Duration::from_millis(20));
            worker.mark_running();
        });
        lifecycle.wait_for_ready();
        assert_eq!(lifecycle.state(), LifecycleState::Running);
        handle.join().unwrap();
    }

    #[test]
    fn mark_stopping_is_idempotent_after_stopped() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_starting();
        lifecycle.mark_running();
        lifecycle.mark_stopping();
        lifecycle.mark_stopped();
        lifecycle.mark_stopping();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }
}
