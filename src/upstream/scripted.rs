//! Scripted upstream used by engine and API tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ProbeReport, UpstreamClient, UpstreamError, UpstreamOutcome, UpstreamStep};

#[derive(Clone)]
pub(crate) enum Reply {
    Step(UpstreamStep),
    Fail(UpstreamError),
    /// Signal `entered`, wait for `release`, then answer with the step.
    Gated {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        then: UpstreamStep,
    },
}

/// Replies are consumed per verification id; the last one repeats forever.
/// Ids without a script answer with the default reply.
pub(crate) struct ScriptedUpstream {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    default: Reply,
    latency: Duration,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedUpstream {
    pub(crate) fn new(default: Reply) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default,
            latency: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn succeeding() -> Self {
        Self::new(Reply::Step(UpstreamStep::Success))
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn script(&self, verification_id: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(verification_id.to_string(), replies.into());
    }

    pub(crate) fn calls(&self, verification_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(verification_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, verification_id: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(verification_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| self.default.clone()),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| self.default.clone()),
            None => self.default.clone(),
        }
    }
}

fn outcome(step: UpstreamStep) -> UpstreamOutcome {
    let (label, detail, redeem_url) = match step {
        UpstreamStep::Success => ("success", None, Some("https://offers.example/redeem".to_string())),
        UpstreamStep::Failed => ("error", Some("verification rejected".to_string()), None),
        UpstreamStep::Ineligible => ("docUpload", Some("documents required".to_string()), None),
        UpstreamStep::AwaitingConfirmation => ("emailLoop", None, None),
    };
    UpstreamOutcome {
        step,
        label: label.to_string(),
        detail,
        redeem_url,
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn probe(&self) -> ProbeReport {
        ProbeReport {
            available: true,
            status_code: Some(200),
            latency_ms: self.latency.as_millis() as u64,
            error: None,
        }
    }

    async fn verify(&self, verification_id: &str) -> Result<UpstreamOutcome, UpstreamError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(verification_id.to_string())
            .or_insert(0) += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = match self.next_reply(verification_id) {
            Reply::Step(step) => Ok(outcome(step)),
            Reply::Fail(err) => Err(err),
            Reply::Gated {
                entered,
                release,
                then,
            } => {
                entered.notify_one();
                release.notified().await;
                Ok(outcome(then))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
