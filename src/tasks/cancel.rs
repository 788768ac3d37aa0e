//! Cancellation registry keyed by verification identifier.
//!
//! Running tasks register themselves and poll `observe` at every checkpoint.
//! A cancel request either flags the caller's active tasks for an identifier
//! or, when none is running, leaves a pre-emptive marker that the next task
//! for that identifier consumes. Markers expire after the configured window.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

/// Response of `/cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResult {
    pub verification_id: String,
    pub already_cancelled: bool,
    pub current_step: String,
}

#[derive(Default)]
struct RegistryState {
    /// verification id -> tasks currently running for it
    active: HashMap<String, HashSet<Uuid>>,
    /// tasks asked to stop at their next checkpoint
    flagged: HashSet<Uuid>,
    /// (credential, verification id) -> when the pre-emptive cancel arrived
    markers: HashMap<(String, String), Instant>,
}

pub struct CancellationRegistry {
    state: Mutex<RegistryState>,
    window: Duration,
}

impl CancellationRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            window,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, task_id: Uuid, verification_id: &str) {
        self.lock()
            .active
            .entry(verification_id.to_string())
            .or_default()
            .insert(task_id);
    }

    pub fn unregister(&self, task_id: Uuid, verification_id: &str) {
        let mut state = self.lock();
        if let Some(ids) = state.active.get_mut(verification_id) {
            ids.remove(&task_id);
            if ids.is_empty() {
                state.active.remove(verification_id);
            }
        }
        state.flagged.remove(&task_id);
    }

    /// Tasks currently running for `verification_id`.
    pub fn active_for(&self, verification_id: &str) -> Vec<Uuid> {
        self.lock()
            .active
            .get(verification_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ask a running task to stop. Returns `false` if it was already flagged.
    pub fn flag(&self, task_id: Uuid) -> bool {
        self.lock().flagged.insert(task_id)
    }

    /// Record a pre-emptive cancellation. Returns `false` if a live marker existed.
    pub fn mark(&self, credential: &str, verification_id: &str) -> bool {
        let key = (credential.to_string(), verification_id.to_string());
        let now = Instant::now();
        let window = self.window;
        let mut state = self.lock();
        let fresh = state
            .markers
            .get(&key)
            .map_or(true, |at| now.duration_since(*at) >= window);
        state.markers.insert(key, now);
        fresh
    }

    /// Checkpoint: should this task stop now?
    ///
    /// Consumes a live pre-emptive marker for the task's credential and
    /// identifier, flagging the task so later checkpoints agree.
    pub fn observe(&self, task_id: Uuid, credential: &str, verification_id: &str) -> bool {
        let mut state = self.lock();
        if state.flagged.contains(&task_id) {
            return true;
        }
        let key = (credential.to_string(), verification_id.to_string());
        match state.markers.remove(&key) {
            Some(at) if at.elapsed() < self.window => {
                state.flagged.insert(task_id);
                true
            }
            _ => false,
        }
    }

    /// Drop markers older than the window. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let window = self.window;
        let mut state = self.lock();
        let before = state.markers.len();
        state.markers.retain(|_, at| at.elapsed() < window);
        before - state.markers.len()
    }

    pub fn marker_count(&self) -> usize {
        self.lock().markers.len()
    }
}
