//! Batch coordinator: runs a list of verification ids through the engine's
//! synchronous path with bounded concurrency and aggregates the outcomes.
//!
//! Credits for every well-formed id are reserved up front, so a batch either
//! starts fully funded or fails with `InsufficientCredit` before any upstream
//! call. Each task settles its own credit, which keeps `credits_deducted`
//! equal to `success_count`.
//!
//! Every admitted id runs on its own tokio task, so dropping the batch
//! future (client disconnect, timeout) never strands a task short of a
//! terminal state.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::engine::{EngineError, TaskEngine};
use super::types::{TaskRecord, TaskStatus};
use crate::ledger::CreditHold;
use crate::util::{mask_identifier, parse_verification_id};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub credits_deducted: u64,
    pub results: Vec<BatchItem>,
}

/// Outcome for one id, in the caller's input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub verification_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub success: bool,
    pub status: String,
    pub current_step: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_url: Option<String>,
}

impl BatchItem {
    fn rejected(raw: &str) -> Self {
        Self {
            verification_id: mask_identifier(raw.trim()),
            task_id: None,
            success: false,
            status: TaskStatus::Error.as_str().to_string(),
            current_step: "invalid".to_string(),
            message: "malformed verification id".to_string(),
            redeem_url: None,
        }
    }

    fn aborted(record: &TaskRecord) -> Self {
        Self {
            verification_id: mask_identifier(&record.verification_id),
            task_id: Some(record.id),
            success: false,
            status: TaskStatus::Error.as_str().to_string(),
            current_step: TaskStatus::Error.as_str().to_string(),
            message: "task aborted".to_string(),
            redeem_url: None,
        }
    }

    fn from_record(record: &TaskRecord) -> Self {
        let outcome = record.outcome.as_ref();
        let success = outcome.map_or(false, |o| o.success);
        let message = match outcome.and_then(|o| o.detail.clone()) {
            Some(detail) => detail,
            None if success => "verified".to_string(),
            None => record.status.as_str().to_string(),
        };
        Self {
            verification_id: mask_identifier(&record.verification_id),
            task_id: Some(record.id),
            success,
            status: record.status.as_str().to_string(),
            current_step: record.current_step.clone(),
            message,
            redeem_url: outcome.and_then(|o| o.redeem_url.clone()),
        }
    }
}

/// One input slot: either a rejected id or a launched task.
enum Slot {
    Rejected(String),
    Launched(TaskRecord, JoinHandle<TaskRecord>),
}

pub struct BatchCoordinator {
    engine: Arc<TaskEngine>,
}

impl BatchCoordinator {
    pub fn new(engine: Arc<TaskEngine>) -> Self {
        Self { engine }
    }

    pub async fn run_batch(
        &self,
        credential: &str,
        raw_ids: &[String],
    ) -> Result<BatchResult, EngineError> {
        let config = self.engine.config();
        if raw_ids.is_empty() {
            return Err(EngineError::InvalidInput(
                "verification_ids must not be empty".to_string(),
            ));
        }
        if raw_ids.len() > config.max_batch_size {
            return Err(EngineError::InvalidInput(format!(
                "at most {} verification ids per batch",
                config.max_batch_size
            )));
        }

        let parsed: Vec<Option<String>> = raw_ids
            .iter()
            .map(|raw| parse_verification_id(raw))
            .collect();
        let valid = parsed.iter().flatten().count() as u64;

        let mut funds = if valid > 0 {
            Some(self.engine.reserve(credential, valid).await?)
        } else {
            None
        };

        tracing::info!(
            total = raw_ids.len(),
            valid,
            concurrency = config.batch_concurrency,
            "Running verification batch"
        );

        // Launch right after admission: no await point separates the two.
        let limit = Arc::new(Semaphore::new(config.batch_concurrency));
        let mut slots = Vec::with_capacity(raw_ids.len());
        for (raw, id) in raw_ids.iter().zip(parsed) {
            let hold = id
                .as_ref()
                .and_then(|_| funds.as_mut().and_then(CreditHold::split_one));
            match (id, hold) {
                (Some(id), Some(hold)) => match self.engine.admit(credential, &id).await {
                    Ok(record) => {
                        let handle =
                            self.engine
                                .launch(record.clone(), hold, Some(Arc::clone(&limit)));
                        slots.push(Slot::Launched(record, handle));
                    }
                    Err(err) => {
                        hold.release().await;
                        return Err(err);
                    }
                },
                _ => slots.push(Slot::Rejected(raw.clone())),
            }
        }
        if let Some(rest) = funds {
            rest.release().await;
        }

        let results: Vec<BatchItem> = join_all(slots.into_iter().map(|slot| async move {
            match slot {
                Slot::Rejected(raw) => BatchItem::rejected(&raw),
                Slot::Launched(record, handle) => match handle.await {
                    Ok(finished) => BatchItem::from_record(&finished),
                    Err(err) => {
                        tracing::error!(task_id = %record.id, error = %err, "Batch task aborted");
                        BatchItem::aborted(&record)
                    }
                },
            }
        }))
        .await;

        let success_count = results.iter().filter(|r| r.success).count();
        let result = BatchResult {
            total: results.len(),
            success_count,
            failed_count: results.len() - success_count,
            credits_deducted: success_count as u64,
            results,
        };
        tracing::info!(
            total = result.total,
            success = result.success_count,
            failed = result.failed_count,
            "Batch finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::engine::tests::{engine_with, VID, VID2};
    use crate::upstream::scripted::{Reply, ScriptedUpstream};
    use crate::upstream::UpstreamStep;
    use std::time::Duration;

    const KEY: &str = "test-key";

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn two_successes_and_a_malformed_id() {
        let engine = engine_with(Arc::new(ScriptedUpstream::succeeding()), 5, |_| {}).await;
        let batch = BatchCoordinator::new(Arc::clone(&engine));

        let result = batch
            .run_batch(KEY, &ids(&[VID, "gen", VID2]))
            .await
            .unwrap();

        assert_eq!(result.total, 3);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.credits_deducted, 2);
        assert_eq!(result.results[0].verification_id, "65a1f0****293a");
        assert_eq!(result.results[1].verification_id, "g**");
        assert!(!result.results[1].success);
        assert!(result.results[1].task_id.is_none());
        assert_eq!(result.results[2].verification_id, "65a1f0****293b");

        let snap = engine.ledger().snapshot(KEY).await.unwrap();
        assert_eq!(snap.balance, 3);
        assert_eq!(snap.held, 0);
    }

    #[tokio::test]
    async fn results_keep_input_order_and_failures_stay_isolated() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        // the first id finishes last
        upstream.script(
            VID,
            vec![
                Reply::Step(UpstreamStep::AwaitingConfirmation),
                Reply::Step(UpstreamStep::AwaitingConfirmation),
                Reply::Step(UpstreamStep::Failed),
            ],
        );
        let engine = engine_with(upstream, 2, |_| {}).await;
        let batch = BatchCoordinator::new(Arc::clone(&engine));

        let result = batch.run_batch(KEY, &ids(&[VID, VID2])).await.unwrap();
        assert_eq!(result.results[0].status, "error");
        assert_eq!(result.results[0].message, "verification rejected");
        assert!(result.results[1].success);
        assert_eq!(result.results[1].verification_id, "65a1f0****293b");
        assert_eq!(result.credits_deducted, 1);
        assert_eq!(engine.ledger().get_balance(KEY).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let upstream = Arc::new(
            ScriptedUpstream::succeeding().with_latency(Duration::from_millis(20)),
        );
        let engine = engine_with(Arc::clone(&upstream), 20, |c| c.batch_concurrency = 3).await;
        let batch = BatchCoordinator::new(engine);

        let all: Vec<String> = (0..10).map(|i| format!("65a1f0c2b3d4e5f6071829{:02x}", i)).collect();
        let result = batch.run_batch(KEY, &all).await.unwrap();
        assert_eq!(result.success_count, 10);
        assert!(upstream.max_in_flight() <= 3);
        assert!(upstream.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn dropped_batch_still_finishes_its_tasks() {
        let upstream = Arc::new(
            ScriptedUpstream::succeeding().with_latency(Duration::from_millis(150)),
        );
        let engine = engine_with(Arc::clone(&upstream), 3, |_| {}).await;
        let batch = BatchCoordinator::new(Arc::clone(&engine));

        let request = ids(&[VID, VID2]);
        let cut_short =
            tokio::time::timeout(Duration::from_millis(30), batch.run_batch(KEY, &request)).await;
        assert!(cut_short.is_err());

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.active_tasks().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("batch tasks left unfinished");

        assert_eq!(upstream.calls(VID), 1);
        assert_eq!(upstream.calls(VID2), 1);
        let snap = engine.ledger().snapshot(KEY).await.unwrap();
        assert_eq!(snap.balance, 1);
        assert_eq!(snap.held, 0);

        // nothing is left running for either id
        let after = engine.cancel(KEY, VID).await.unwrap();
        assert!(after.already_cancelled);
        assert_eq!(after.current_step, "success");
    }

    #[tokio::test]
    async fn underfunded_batch_fails_before_any_upstream_call() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        let engine = engine_with(Arc::clone(&upstream), 1, |_| {}).await;
        let batch = BatchCoordinator::new(Arc::clone(&engine));

        let err = batch.run_batch(KEY, &ids(&[VID, VID2, "gen"])).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientCredit {
                required: 2,
                available: 1
            }
        );
        assert_eq!(upstream.calls(VID), 0);
        assert_eq!(engine.active_tasks().await, 0);
        assert_eq!(engine.ledger().snapshot(KEY).await.unwrap().held, 0);
    }

    #[tokio::test]
    async fn all_malformed_needs_no_credit() {
        let engine = engine_with(Arc::new(ScriptedUpstream::succeeding()), 0, |_| {}).await;
        let batch = BatchCoordinator::new(engine);
        let result = batch.run_batch(KEY, &ids(&["gen", ""])).await.unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.failed_count, 2);
        assert_eq!(result.credits_deducted, 0);
    }

    #[tokio::test]
    async fn size_limits_are_enforced() {
        let engine = engine_with(Arc::new(ScriptedUpstream::succeeding()), 100, |c| {
            c.max_batch_size = 2
        })
        .await;
        let batch = BatchCoordinator::new(engine);
        assert!(matches!(
            batch.run_batch(KEY, &[]).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            batch.run_batch(KEY, &ids(&[VID, VID, VID])).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn preemptive_cancel_applies_to_batch_members() {
        let upstream = Arc::new(ScriptedUpstream::succeeding());
        let engine = engine_with(Arc::clone(&upstream), 2, |_| {}).await;
        engine.cancel(KEY, VID).await.unwrap();

        let batch = BatchCoordinator::new(Arc::clone(&engine));
        let result = batch.run_batch(KEY, &ids(&[VID, VID2])).await.unwrap();
        assert_eq!(result.results[0].status, "cancelled");
        assert!(result.results[1].success);
        assert_eq!(result.credits_deducted, 1);
        assert_eq!(upstream.calls(VID), 0);
        assert_eq!(engine.ledger().get_balance(KEY).await.unwrap(), 1);
    }
}
