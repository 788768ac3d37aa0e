//! Task record, status state machine, and the client-facing view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::mask_identifier;

/// Status of a verification task.
///
/// # State Machine
/// ```text
/// Pending -> Processing -> Polling -> Polling (self-loop)
///                   |          |
///                   +----------+--> Completed
/// any non-terminal ------------+--> Error
/// any non-terminal ------------+--> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Polling,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Polling) | (Polling, Polling) => true,
            (Processing, Completed) | (Polling, Completed) => true,
            (from, Error) | (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Polling => "polling",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal payload of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub redeem_url: Option<String>,
    pub detail: Option<String>,
    /// Whether settlement charged a credit for this task
    pub charged: bool,
}

impl TaskOutcome {
    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            redeem_url: None,
            detail: Some(detail.into()),
            charged: false,
        }
    }
}

/// A task as held by the task store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: Uuid,
    /// Owning credential (API key)
    pub credential: String,
    /// Normalised verification identifier
    pub verification_id: String,
    pub status: TaskStatus,
    /// Free-form progress marker
    pub current_step: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskOutcome>,
}

impl TaskRecord {
    pub fn new(credential: &str, verification_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            credential: credential.to_string(),
            verification_id: verification_id.to_string(),
            status: TaskStatus::Pending,
            current_step: TaskStatus::Pending.as_str().to_string(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            outcome: None,
        }
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.id,
            verification_id: mask_identifier(&self.verification_id),
            status: self.status,
            current_step: self.current_step.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            result: self.outcome.as_ref().map(|o| TaskResultView {
                success: o.success,
                redeem_url: o.redeem_url.clone(),
                error: if o.success { None } else { o.detail.clone() },
                credits_charged: u64::from(o.charged),
            }),
        }
    }
}

/// What `/verify/status/{task_id}` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub verification_id: String,
    pub status: TaskStatus,
    pub current_step: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResultView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResultView {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub credits_charged: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn allowed_transitions() {
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Polling));
        assert!(Polling.can_transition_to(Polling));
        assert!(Processing.can_transition_to(Completed));
        assert!(Polling.can_transition_to(Completed));
        for from in [Pending, Processing, Polling] {
            assert!(from.can_transition_to(Error));
            assert!(from.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn rejected_transitions() {
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Polling));
        assert!(!Polling.can_transition_to(Processing));
        for from in [Completed, Error, Cancelled] {
            for to in [Pending, Processing, Polling, Completed, Error, Cancelled] {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn view_masks_identifier_and_hides_success_detail() {
        let mut record = TaskRecord::new("key", "65a1f0c2b3d4e5f60718293a");
        record.status = Completed;
        record.outcome = Some(TaskOutcome {
            success: true,
            redeem_url: Some("https://r.example".to_string()),
            detail: Some("ok".to_string()),
            charged: true,
        });
        let view = record.view();
        assert_eq!(view.verification_id, "65a1f0****293a");
        let result = view.result.unwrap();
        assert!(result.error.is_none());
        assert_eq!(result.credits_charged, 1);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(Polling).unwrap(), serde_json::json!("polling"));
    }
}
