//! Task storage.
//!
//! The store enforces the status state machine: every update is a checked
//! transition applied atomically per task id, and terminal records are frozen.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{TaskOutcome, TaskRecord, TaskStatus};

pub type SharedTaskStore = Arc<dyn TaskStore>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("task {0} already exists")]
    Duplicate(Uuid),

    #[error("invalid transition {from} -> {to} for task {id}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Option<TaskRecord>;

    /// Move a task to `next`, updating its step label and (for terminal
    /// states) its outcome. Returns the updated record.
    async fn transition(
        &self,
        id: Uuid,
        next: TaskStatus,
        step: &str,
        outcome: Option<TaskOutcome>,
    ) -> Result<TaskRecord, StoreError>;

    /// Most recently created task of `credential` for `verification_id`.
    async fn latest_for(&self, credential: &str, verification_id: &str) -> Option<TaskRecord>;

    /// Number of non-terminal tasks.
    async fn active_count(&self) -> usize;

    /// Remove terminal tasks that finished before `cutoff`. Returns how many.
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> usize;
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        tasks.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Option<TaskRecord> {
        self.tasks.read().await.get(&id).cloned()
    }

    async fn transition(
        &self,
        id: Uuid,
        next: TaskStatus,
        step: &str,
        outcome: Option<TaskOutcome>,
    ) -> Result<TaskRecord, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !task.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id,
                from: task.status,
                to: next,
            });
        }
        let now = Utc::now();
        task.status = next;
        task.current_step = step.to_string();
        task.updated_at = now;
        if next.is_terminal() {
            task.finished_at = Some(now);
            task.outcome = outcome;
        }
        Ok(task.clone())
    }

    async fn latest_for(&self, credential: &str, verification_id: &str) -> Option<TaskRecord> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.credential == credential && t.verification_id == verification_id)
            .max_by_key(|t| t.created_at)
            .cloned()
    }

    async fn active_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| match t.finished_at {
            Some(finished) if t.status.is_terminal() => finished >= cutoff,
            _ => true,
        });
        before - tasks.len()
    }
}
