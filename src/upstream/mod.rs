//! Client side of the external verification service.
//!
//! The service is opaque: one call reports where a verification currently
//! stands. The client never retries; retry and polling policy belong to the
//! task engine.

mod error;
mod http;
#[cfg(test)]
pub(crate) mod scripted;

pub use error::{classify_http_status, UpstreamError, UpstreamErrorKind};
pub use http::HttpUpstreamClient;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

pub type SharedUpstream = Arc<dyn UpstreamClient>;

/// Where the upstream says a verification stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStep {
    /// Definitive success
    Success,
    /// The upstream failed the verification
    Failed,
    /// Definitive negative answer (not eligible, documents required)
    Ineligible,
    /// Waiting on an out-of-band confirmation, ask again later
    AwaitingConfirmation,
}

impl UpstreamStep {
    /// Map the upstream's `currentStep` label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "success" => Some(Self::Success),
            "error" => Some(Self::Failed),
            "docUpload" | "ineligible" | "rejected" => Some(Self::Ineligible),
            "pending" | "emailLoop" | "collectStudentPersonalInfo" => {
                Some(Self::AwaitingConfirmation)
            }
            _ => None,
        }
    }
}

/// Result of one `verify` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamOutcome {
    pub step: UpstreamStep,
    /// The upstream's own step label, surfaced as the task's current step
    pub label: String,
    pub detail: Option<String>,
    pub redeem_url: Option<String>,
}

/// Result of a reachability probe. Never an error: failures are reported inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Check reachability within the configured timeout.
    async fn probe(&self) -> ProbeReport;

    /// One verification attempt for `verification_id`.
    async fn verify(&self, verification_id: &str) -> Result<UpstreamOutcome, UpstreamError>;
}
