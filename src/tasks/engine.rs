//! Task engine: admits verification tasks, drives each one through the status
//! state machine against the upstream, and settles credits when it ends.
//!
//! # Invariants
//! - A task holds one reserved credit from admission until its terminal
//!   transition; the credit is captured only after a definitive upstream
//!   success and released on every other outcome.
//! - Only the engine mutates a task, and only through checked transitions.
//! - Cancellation is cooperative: it is observed at checkpoints between
//!   transitions, never in the middle of an upstream call.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::cancel::{CancelResult, CancellationRegistry};
use super::store::{SharedTaskStore, StoreError};
use super::types::{TaskOutcome, TaskRecord, TaskStatus, TaskView};
use crate::config::EngineConfig;
use crate::ledger::{CreditHold, LedgerError, SharedLedger};
use crate::upstream::{SharedUpstream, UpstreamError, UpstreamOutcome, UpstreamStep};
use crate::util::{mask_identifier, parse_verification_id};

/// Step label reported for a pre-emptive cancellation with no task behind it.
pub const CANCEL_REQUESTED_STEP: &str = "cancel_requested";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("insufficient credit: {required} required, {available} available")]
    InsufficientCredit { required: u64, available: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound => EngineError::NotFound("credential".to_string()),
            LedgerError::InvalidAmount(_) => EngineError::InvalidInput(err.to_string()),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(format!("task {}", id)),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

/// Why an upstream attempt did not produce an outcome.
enum Interrupt {
    Cancelled,
    Upstream(UpstreamError),
}

pub struct TaskEngine {
    store: SharedTaskStore,
    ledger: SharedLedger,
    upstream: SharedUpstream,
    cancellations: CancellationRegistry,
    config: EngineConfig,
}

impl TaskEngine {
    pub fn new(
        store: SharedTaskStore,
        ledger: SharedLedger,
        upstream: SharedUpstream,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            upstream,
            cancellations: CancellationRegistry::new(config.cancel_window),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn upstream(&self) -> &SharedUpstream {
        &self.upstream
    }

    /// Reserve `count` credits or fail with `InsufficientCredit`.
    pub async fn reserve(&self, credential: &str, count: u64) -> Result<CreditHold, EngineError> {
        match CreditHold::acquire(&self.ledger, credential, count).await? {
            Some(hold) => Ok(hold),
            None => {
                let available = self.ledger.snapshot(credential).await?.available();
                Err(EngineError::InsufficientCredit {
                    required: count,
                    available,
                })
            }
        }
    }

    /// Store a fresh `pending` task and make it cancellable.
    pub(crate) async fn admit(
        &self,
        credential: &str,
        verification_id: &str,
    ) -> Result<TaskRecord, EngineError> {
        let record = TaskRecord::new(credential, verification_id);
        self.store.insert(record.clone()).await?;
        self.cancellations.register(record.id, verification_id);
        tracing::info!(
            task_id = %record.id,
            verification_id = %mask_identifier(verification_id),
            "Task created"
        );
        Ok(record)
    }

    /// Validate, reserve a credit, store the task, and run it in the background.
    pub async fn create_task(
        self: &Arc<Self>,
        credential: &str,
        raw_verification_id: &str,
    ) -> Result<TaskRecord, EngineError> {
        let verification_id = parse_verification_id(raw_verification_id).ok_or_else(|| {
            EngineError::InvalidInput("verification_id is missing or malformed".to_string())
        })?;
        let hold = self.reserve(credential, 1).await?;
        let record = match self.admit(credential, &verification_id).await {
            Ok(record) => record,
            Err(err) => {
                hold.release().await;
                return Err(err);
            }
        };

        self.launch(record.clone(), hold, None);
        Ok(record)
    }

    /// Run an admitted task on its own tokio task, optionally waiting for a
    /// permit from `limit` first. The task reaches a terminal state even if
    /// the caller stops waiting on the handle.
    pub(crate) fn launch(
        self: &Arc<Self>,
        task: TaskRecord,
        hold: CreditHold,
        limit: Option<Arc<Semaphore>>,
    ) -> JoinHandle<TaskRecord> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match limit {
                Some(limit) => limit.acquire_owned().await.ok(),
                None => None,
            };
            engine.execute(task, hold).await
        })
    }

    /// Current view of a task owned by `credential`.
    pub async fn get_status(&self, credential: &str, task_id: Uuid) -> Result<TaskView, EngineError> {
        match self.store.get(task_id).await {
            Some(record) if record.credential == credential => Ok(record.view()),
            _ => Err(EngineError::NotFound(format!("task {}", task_id))),
        }
    }

    /// Drive an admitted task to a terminal state and return the final record.
    ///
    /// Never fails: engine faults are recorded as the task's `error` state.
    async fn execute(&self, task: TaskRecord, hold: CreditHold) -> TaskRecord {
        let id = task.id;
        match self.drive(&task, hold).await {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(task_id = %id, error = %err, "Task engine failure");
                let failed = self
                    .store
                    .transition(
                        id,
                        TaskStatus::Error,
                        TaskStatus::Error.as_str(),
                        Some(TaskOutcome::failure(err.to_string())),
                    )
                    .await;
                self.cancellations.unregister(id, &task.verification_id);
                match failed {
                    Ok(record) => record,
                    Err(_) => self.store.get(id).await.unwrap_or(task),
                }
            }
        }
    }

    async fn drive(&self, task: &TaskRecord, hold: CreditHold) -> Result<TaskRecord, EngineError> {
        if self.checkpoint(task) {
            return self.finish_cancelled(task, hold).await;
        }
        self.store
            .transition(task.id, TaskStatus::Processing, "processing", None)
            .await?;

        let mut outcome = match self.attempt(task).await {
            Ok(outcome) => outcome,
            Err(Interrupt::Cancelled) => return self.finish_cancelled(task, hold).await,
            Err(Interrupt::Upstream(err)) => {
                return self.finish_failed(task, hold, err.to_string()).await
            }
        };

        let mut polling_since: Option<Instant> = None;
        let mut checks: u32 = 0;
        loop {
            if self.checkpoint(task) {
                return self.finish_cancelled(task, hold).await;
            }
            match outcome.step {
                UpstreamStep::Success => return self.finish_success(task, hold, outcome).await,
                UpstreamStep::Ineligible => {
                    let detail = outcome
                        .detail
                        .unwrap_or_else(|| "not eligible for verification".to_string());
                    return self
                        .finish(
                            task,
                            hold,
                            TaskStatus::Completed,
                            &outcome.label,
                            TaskOutcome {
                                success: false,
                                redeem_url: None,
                                detail: Some(detail),
                                charged: false,
                            },
                        )
                        .await;
                }
                UpstreamStep::Failed => {
                    let detail = outcome
                        .detail
                        .unwrap_or_else(|| "upstream reported failure".to_string());
                    return self.finish_failed(task, hold, detail).await;
                }
                UpstreamStep::AwaitingConfirmation => {}
            }

            let since = *polling_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.config.max_poll_duration {
                return self.finish_poll_timeout(task, hold).await;
            }
            checks += 1;
            self.store
                .transition(
                    task.id,
                    TaskStatus::Polling,
                    &format!("{} (check {})", outcome.label, checks),
                    None,
                )
                .await?;

            tokio::time::sleep(self.config.poll_interval).await;

            if self.checkpoint(task) {
                return self.finish_cancelled(task, hold).await;
            }
            if since.elapsed() >= self.config.max_poll_duration {
                return self.finish_poll_timeout(task, hold).await;
            }
            outcome = match self.attempt(task).await {
                Ok(outcome) => outcome,
                Err(Interrupt::Cancelled) => return self.finish_cancelled(task, hold).await,
                Err(Interrupt::Upstream(err)) => {
                    return self.finish_failed(task, hold, err.to_string()).await
                }
            };
        }
    }

    /// One upstream attempt, retrying transient errors with backoff.
    async fn attempt(&self, task: &TaskRecord) -> Result<UpstreamOutcome, Interrupt> {
        let mut retries: u32 = 0;
        loop {
            match self.upstream.verify(&task.verification_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient() && retries < self.config.max_retries => {
                    let delay = err.suggested_delay(
                        retries,
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                    );
                    retries += 1;
                    tracing::warn!(
                        task_id = %task.id,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient upstream error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if self.checkpoint(task) {
                        return Err(Interrupt::Cancelled);
                    }
                }
                Err(err) => return Err(Interrupt::Upstream(err)),
            }
        }
    }

    fn checkpoint(&self, task: &TaskRecord) -> bool {
        let cancelled =
            self.cancellations
                .observe(task.id, &task.credential, &task.verification_id);
        if cancelled {
            tracing::debug!(task_id = %task.id, "Cancellation observed at checkpoint");
        }
        cancelled
    }

    async fn finish_success(
        &self,
        task: &TaskRecord,
        mut hold: CreditHold,
        outcome: UpstreamOutcome,
    ) -> Result<TaskRecord, EngineError> {
        if let Err(err) = hold.capture_one().await {
            tracing::error!(task_id = %task.id, error = %err, "Settlement failed");
            return self
                .finish_failed(task, hold, format!("settlement failed: {}", err))
                .await;
        }
        tracing::info!(task_id = %task.id, "Settled 1 credit");
        self.finish(
            task,
            hold,
            TaskStatus::Completed,
            &outcome.label,
            TaskOutcome {
                success: true,
                redeem_url: outcome.redeem_url,
                detail: outcome.detail,
                charged: true,
            },
        )
        .await
    }

    async fn finish_failed(
        &self,
        task: &TaskRecord,
        hold: CreditHold,
        detail: String,
    ) -> Result<TaskRecord, EngineError> {
        self.finish(
            task,
            hold,
            TaskStatus::Error,
            TaskStatus::Error.as_str(),
            TaskOutcome::failure(detail),
        )
        .await
    }

    async fn finish_poll_timeout(
        &self,
        task: &TaskRecord,
        hold: CreditHold,
    ) -> Result<TaskRecord, EngineError> {
        let detail = format!(
            "timed out after {} ms awaiting upstream confirmation",
            self.config.max_poll_duration.as_millis()
        );
        self.finish_failed(task, hold, detail).await
    }

    async fn finish_cancelled(
        &self,
        task: &TaskRecord,
        hold: CreditHold,
    ) -> Result<TaskRecord, EngineError> {
        self.finish(
            task,
            hold,
            TaskStatus::Cancelled,
            TaskStatus::Cancelled.as_str(),
            TaskOutcome::failure("cancelled by request"),
        )
        .await
    }

    async fn finish(
        &self,
        task: &TaskRecord,
        hold: CreditHold,
        status: TaskStatus,
        step: &str,
        outcome: TaskOutcome,
    ) -> Result<TaskRecord, EngineError> {
        let result = self
            .store
            .transition(task.id, status, step, Some(outcome))
            .await;
        self.cancellations.unregister(task.id, &task.verification_id);
        hold.release().await;
        let record = result?;
        tracing::info!(task_id = %task.id, status = %status, step, "Task finished");
        Ok(record)
    }

    /// Cancel the caller's tasks for a verification identifier.
    ///
    /// Running tasks are flagged and stop at their next checkpoint. With no
    /// running task a pre-emptive marker is left for the next one. Settled
    /// credits are never refunded.
    pub async fn cancel(
        &self,
        credential: &str,
        raw_verification_id: &str,
    ) -> Result<CancelResult, EngineError> {
        let verification_id = parse_verification_id(raw_verification_id).ok_or_else(|| {
            EngineError::InvalidInput("verification_id is missing or malformed".to_string())
        })?;

        let mut running = Vec::new();
        for id in self.cancellations.active_for(&verification_id) {
            if let Some(record) = self.store.get(id).await {
                if record.credential == credential && !record.status.is_terminal() {
                    running.push(record);
                }
            }
        }

        if let Some(latest) = running.iter().max_by_key(|r| r.created_at) {
            let mut newly_flagged = false;
            for record in &running {
                newly_flagged |= self.cancellations.flag(record.id);
            }
            tracing::info!(
                verification_id = %mask_identifier(&verification_id),
                tasks = running.len(),
                "Cancellation requested for running tasks"
            );
            return Ok(CancelResult {
                verification_id,
                already_cancelled: !newly_flagged,
                current_step: latest.current_step.clone(),
            });
        }

        let fresh = self.cancellations.mark(credential, &verification_id);
        tracing::info!(
            verification_id = %mask_identifier(&verification_id),
            "Pre-emptive cancellation recorded"
        );
        let result = match self.store.latest_for(credential, &verification_id).await {
            Some(previous) => CancelResult {
                verification_id,
                already_cancelled: previous.status.is_terminal(),
                current_step: previous.current_step,
            },
            None => CancelResult {
                verification_id,
                already_cancelled: !fresh,
                current_step: CANCEL_REQUESTED_STEP.to_string(),
            },
        };
        Ok(result)
    }

    /// Garbage-collect expired tasks and cancellation markers.
    pub async fn sweep(&self) -> (usize, usize) {
        let retention = chrono::Duration::from_std(self.config.task_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let purged = self.store.purge_finished_before(Utc::now() - retention).await;
        let pruned = self.cancellations.prune_expired();
        if purged > 0 || pruned > 0 {
            tracing::debug!(purged, pruned, "Swept expired tasks and markers");
        }
        (purged, pruned)
    }

    pub async fn active_tasks(&self) -> usize {
        self.store.active_count().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ledger::InMemoryLedger;
    use crate::tasks::store::InMemoryTaskStore;
    use crate::upstream::scripted::{Reply, ScriptedUpstream};
    use std::time::Duration;
    use tokio::sync::Notify;

    pub(crate) const VID: &str = "65a1f0c2b3d4e5f60718293a";
    pub(crate) const VID2: &str = "65a1f0c2b3d4e5f60718293b";
    const KEY: &str = "test-key";

    pub(crate) async fn engine_with(
        upstream: Arc<ScriptedUpstream>,
        balance: u64,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Arc<TaskEngine> {
        let mut config = Config::for_tests("http://127.0.0.1:9").engine;
        tweak(&mut config);
        let ledger: SharedLedger = Arc::new(InMemoryLedger::new());
        ledger.open_account(KEY, balance).await.unwrap();
        Arc::new(TaskEngine::new(
            Arc::new(InMemoryTaskStore::new()),
            ledger,
            upstream,
            config,
        ))
    }

    async fn wait_for(
        engine: &TaskEngine,
        id: Uuid,
        done: impl Fn(&TaskView) -> bool,
    ) -> TaskView {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let view = engine.get_status(KEY, id).await.unwrap();
                if done(&view) {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task did not reach the expected state in time")
    }

    async fn wait_terminal(engine: &TaskEngine, id: Uuid) -> TaskView {
        wait_for(engine, id, |v| v.status.is_terminal()).await
    }

    async fn snapshot(engine: &TaskEngine) -> crate::ledger::AccountSnapshot {
        engine.ledger().snapshot(KEY).await.unwrap()
    }

    #[tokio::test]
    async fn success_charges_exactly_once() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        let engine = engine_with(upstream, 3, |_| {}).await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        let view = wait_terminal(&engine, task.id).await;

        assert_eq!(view.status, TaskStatus::Completed);
        let result = view.result.clone().unwrap();
        assert!(result.success);
        assert_eq!(result.credits_charged, 1);
        assert!(result.redeem_url.is_some());

        for _ in 0..3 {
            assert_eq!(engine.get_status(KEY, task.id).await.unwrap(), view);
        }
        let snap = snapshot(&engine).await;
        assert_eq!(snap.balance, 2);
        assert_eq!(snap.held, 0);
    }

    #[tokio::test]
    async fn upstream_failure_ends_in_error_without_charge() {
        let upstream = Arc::new(ScriptedUpstream::new(Reply::Step(UpstreamStep::Failed)));
        let engine = engine_with(upstream, 2, |_| {}).await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        let view = wait_terminal(&engine, task.id).await;

        assert_eq!(view.status, TaskStatus::Error);
        let result = view.result.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("verification rejected"));
        assert_eq!(result.credits_charged, 0);
        assert_eq!(snapshot(&engine).await.balance, 2);
        assert_eq!(snapshot(&engine).await.held, 0);
    }

    #[tokio::test]
    async fn success_then_failure_example() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        upstream.script(VID2, vec![Reply::Step(UpstreamStep::Failed)]);
        let engine = engine_with(Arc::clone(&upstream), 3, |_| {}).await;

        let first = engine.create_task(KEY, VID).await.unwrap();
        assert_eq!(wait_terminal(&engine, first.id).await.status, TaskStatus::Completed);
        assert_eq!(snapshot(&engine).await.balance, 2);

        let second = engine.create_task(KEY, VID2).await.unwrap();
        assert_eq!(wait_terminal(&engine, second.id).await.status, TaskStatus::Error);
        assert_eq!(snapshot(&engine).await.balance, 2);
    }

    #[tokio::test]
    async fn ineligible_completes_unsuccessfully() {
        let upstream = Arc::new(ScriptedUpstream::new(Reply::Step(UpstreamStep::Ineligible)));
        let engine = engine_with(upstream, 1, |_| {}).await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        let view = wait_terminal(&engine, task.id).await;
        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.current_step, "docUpload");
        assert!(!view.result.unwrap().success);
        assert_eq!(snapshot(&engine).await.balance, 1);
    }

    #[tokio::test]
    async fn polling_until_confirmation() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        upstream.script(
            VID,
            vec![
                Reply::Step(UpstreamStep::AwaitingConfirmation),
                Reply::Step(UpstreamStep::AwaitingConfirmation),
                Reply::Step(UpstreamStep::Success),
            ],
        );
        let engine = engine_with(Arc::clone(&upstream), 1, |_| {}).await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        let view = wait_terminal(&engine, task.id).await;
        assert_eq!(view.status, TaskStatus::Completed);
        assert!(view.result.unwrap().success);
        assert_eq!(upstream.calls(VID), 3);
        assert_eq!(snapshot(&engine).await.balance, 0);
    }

    #[tokio::test]
    async fn polling_timeout_is_an_error_not_a_cancellation() {
        let upstream = Arc::new(ScriptedUpstream::new(Reply::Step(
            UpstreamStep::AwaitingConfirmation,
        )));
        let engine = engine_with(upstream, 1, |c| {
            c.max_poll_duration = Duration::from_millis(400);
        })
        .await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        let polling = wait_for(&engine, task.id, |v| v.status == TaskStatus::Polling).await;
        assert!(
            polling.current_step.starts_with("emailLoop (check "),
            "unexpected step {}",
            polling.current_step
        );

        let view = wait_terminal(&engine, task.id).await;
        assert_eq!(view.status, TaskStatus::Error);
        assert!(view.result.unwrap().error.unwrap().contains("timed out"));
        assert_eq!(snapshot(&engine).await.balance, 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        upstream.script(
            VID,
            vec![
                Reply::Fail(UpstreamError::network("connection reset")),
                Reply::Step(UpstreamStep::Success),
            ],
        );
        let engine = engine_with(Arc::clone(&upstream), 1, |c| c.max_retries = 1).await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        assert_eq!(wait_terminal(&engine, task.id).await.status, TaskStatus::Completed);
        assert_eq!(upstream.calls(VID), 2);
    }

    #[tokio::test]
    async fn exhausted_and_permanent_errors_fail_the_task() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        upstream.script(VID, vec![Reply::Fail(UpstreamError::timeout(Duration::from_millis(500)))]);
        upstream.script(VID2, vec![Reply::Fail(UpstreamError::http(400, "bad id"))]);
        let engine = engine_with(Arc::clone(&upstream), 2, |c| c.max_retries = 2).await;

        let timed_out = engine.create_task(KEY, VID).await.unwrap();
        let view = wait_terminal(&engine, timed_out.id).await;
        assert_eq!(view.status, TaskStatus::Error);
        assert!(view.result.unwrap().error.unwrap().contains("Upstream timeout"));
        assert_eq!(upstream.calls(VID), 3);

        let rejected = engine.create_task(KEY, VID2).await.unwrap();
        assert_eq!(wait_terminal(&engine, rejected.id).await.status, TaskStatus::Error);
        assert_eq!(upstream.calls(VID2), 1);
        assert_eq!(snapshot(&engine).await, crate::ledger::AccountSnapshot { balance: 2, held: 0 });
    }

    #[tokio::test]
    async fn insufficient_credit_blocks_creation() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        let engine = engine_with(Arc::clone(&upstream), 0, |_| {}).await;

        let err = engine.create_task(KEY, VID).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientCredit {
                required: 1,
                available: 0
            }
        );
        assert_eq!(engine.active_tasks().await, 0);
        assert_eq!(upstream.calls(VID), 0);
    }

    #[tokio::test]
    async fn in_flight_tasks_reserve_credit() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let upstream = Arc::new(ScriptedUpstream::new(Reply::Gated {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
            then: UpstreamStep::Success,
        }));
        let engine = engine_with(upstream, 1, |_| {}).await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        entered.notified().await;
        assert!(matches!(
            engine.create_task(KEY, VID2).await,
            Err(EngineError::InsufficientCredit { .. })
        ));

        release.notify_one();
        assert_eq!(wait_terminal(&engine, task.id).await.status, TaskStatus::Completed);
        assert_eq!(snapshot(&engine).await, crate::ledger::AccountSnapshot { balance: 0, held: 0 });
    }

    #[tokio::test]
    async fn malformed_ids_are_rejected() {
        let engine = engine_with(Arc::new(ScriptedUpstream::succeeding()), 1, |_| {}).await;
        for raw in ["", "gen", "   "] {
            assert!(matches!(
                engine.create_task(KEY, raw).await,
                Err(EngineError::InvalidInput(_))
            ));
        }
        assert_eq!(snapshot(&engine).await.held, 0);
    }

    #[tokio::test]
    async fn preemptive_cancel_stops_the_next_task() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        let engine = engine_with(Arc::clone(&upstream), 2, |_| {}).await;

        let cancel = engine.cancel(KEY, VID).await.unwrap();
        assert!(!cancel.already_cancelled);
        assert_eq!(cancel.current_step, CANCEL_REQUESTED_STEP);

        let task = engine.create_task(KEY, VID).await.unwrap();
        let view = wait_terminal(&engine, task.id).await;
        assert_eq!(view.status, TaskStatus::Cancelled);
        assert_eq!(upstream.calls(VID), 0);

        // the marker was consumed
        let again = engine.create_task(KEY, VID).await.unwrap();
        assert_eq!(wait_terminal(&engine, again.id).await.status, TaskStatus::Completed);
        assert_eq!(snapshot(&engine).await.balance, 1);
    }

    #[tokio::test]
    async fn cancel_mid_call_wins_over_success_and_never_charges() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let upstream = Arc::new(ScriptedUpstream::new(Reply::Gated {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
            then: UpstreamStep::Success,
        }));
        let engine = engine_with(upstream, 1, |_| {}).await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        entered.notified().await;

        let first = engine.cancel(KEY, VID).await.unwrap();
        assert!(!first.already_cancelled);
        assert_eq!(first.current_step, "processing");
        let second = engine.cancel(KEY, VID).await.unwrap();
        assert!(second.already_cancelled);

        release.notify_one();
        let view = wait_terminal(&engine, task.id).await;
        assert_eq!(view.status, TaskStatus::Cancelled);
        assert_eq!(view.result.unwrap().credits_charged, 0);
        assert_eq!(snapshot(&engine).await, crate::ledger::AccountSnapshot { balance: 1, held: 0 });

        let after = engine.cancel(KEY, VID).await.unwrap();
        assert!(after.already_cancelled);
        assert_eq!(after.current_step, "cancelled");
    }

    #[tokio::test]
    async fn cancel_after_success_never_refunds() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        let engine = engine_with(Arc::clone(&upstream), 3, |_| {}).await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        let done = wait_terminal(&engine, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(snapshot(&engine).await.balance, 2);

        let cancel = engine.cancel(KEY, VID).await.unwrap();
        assert!(cancel.already_cancelled);
        assert_eq!(cancel.current_step, "success");
        assert_eq!(snapshot(&engine).await, crate::ledger::AccountSnapshot { balance: 2, held: 0 });
        assert_eq!(engine.get_status(KEY, task.id).await.unwrap(), done);

        // the marker left behind stops the next task for the same id
        let next = engine.create_task(KEY, VID).await.unwrap();
        assert_eq!(wait_terminal(&engine, next.id).await.status, TaskStatus::Cancelled);
        assert_eq!(upstream.calls(VID), 1);
        assert_eq!(snapshot(&engine).await.balance, 2);
    }

    #[tokio::test]
    async fn cancel_during_polling() {
        let upstream = Arc::new(ScriptedUpstream::new(Reply::Step(
            UpstreamStep::AwaitingConfirmation,
        )));
        let engine = engine_with(upstream, 1, |c| {
            c.max_poll_duration = Duration::from_secs(30);
        })
        .await;

        let task = engine.create_task(KEY, VID).await.unwrap();
        wait_for(&engine, task.id, |v| v.status == TaskStatus::Polling).await;
        let cancel = engine.cancel(KEY, VID).await.unwrap();
        assert!(cancel.current_step.starts_with("emailLoop"));

        let view = wait_terminal(&engine, task.id).await;
        assert_eq!(view.status, TaskStatus::Cancelled);
        assert_eq!(snapshot(&engine).await.balance, 1);
    }

    #[tokio::test]
    async fn cancel_does_not_touch_other_credentials() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let upstream = Arc::new(ScriptedUpstream::new(Reply::Gated {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
            then: UpstreamStep::Success,
        }));
        let engine = engine_with(upstream, 1, |_| {}).await;
        engine.ledger().open_account("intruder", 0).await.unwrap();

        let task = engine.create_task(KEY, VID).await.unwrap();
        entered.notified().await;
        let foreign = engine.cancel("intruder", VID).await.unwrap();
        assert_eq!(foreign.current_step, CANCEL_REQUESTED_STEP);

        release.notify_one();
        assert_eq!(wait_terminal(&engine, task.id).await.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn status_is_private_to_the_owner() {
        let engine = engine_with(Arc::new(ScriptedUpstream::succeeding()), 1, |_| {}).await;
        let task = engine.create_task(KEY, VID).await.unwrap();
        assert!(matches!(
            engine.get_status("someone-else", task.id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.get_status(KEY, Uuid::new_v4()).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_successes_settle_sequentially() {
        let upstream = Arc::new(
            ScriptedUpstream::succeeding().with_latency(Duration::from_millis(5)),
        );
        let engine = engine_with(upstream, 10, |_| {}).await;

        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(engine.create_task(KEY, VID).await.unwrap().id);
        }
        assert!(engine.create_task(KEY, VID).await.is_err());

        for id in ids {
            let view = wait_terminal(&engine, id).await;
            assert_eq!(view.status, TaskStatus::Completed);
        }
        assert_eq!(snapshot(&engine).await, crate::ledger::AccountSnapshot { balance: 0, held: 0 });
    }

    #[tokio::test]
    async fn sweep_collects_finished_tasks_after_retention() {
        let engine = engine_with(Arc::new(ScriptedUpstream::succeeding()), 1, |c| {
            c.task_retention = Duration::from_millis(30);
        })
        .await;
        let task = engine.create_task(KEY, VID).await.unwrap();
        wait_terminal(&engine, task.id).await;

        assert_eq!(engine.sweep().await.0, 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.sweep().await.0, 1);
        assert!(matches!(
            engine.get_status(KEY, task.id).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
