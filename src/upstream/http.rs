//! HTTP adapter for the verification service.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ProbeReport, UpstreamClient, UpstreamError, UpstreamOutcome, UpstreamStep};
use crate::config::UpstreamConfig;

#[derive(Clone)]
pub struct HttpUpstreamClient {
    base_url: String,
    client: reqwest::Client,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    current_step: String,
    #[serde(default)]
    redirect_url: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_ids: Vec<String>,
}

impl HttpUpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let mut base_url = config.base_url.clone();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            base_url,
            client,
            api_key: config.api_key.clone(),
            timeout: config.timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    fn transport_error(&self, err: reqwest::Error, started: Instant) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::timeout(started.elapsed())
        } else {
            UpstreamError::network(err.to_string())
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn probe(&self) -> ProbeReport {
        let url = format!("{}/health", self.base_url);
        let started = Instant::now();
        let send = self.request(self.client.get(&url)).send();

        let result = tokio::time::timeout(self.timeout, send).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(resp)) => {
                let status = resp.status();
                ProbeReport {
                    available: status.is_success(),
                    status_code: Some(status.as_u16()),
                    latency_ms,
                    error: (!status.is_success()).then(|| format!("upstream returned {}", status)),
                }
            }
            Ok(Err(err)) => ProbeReport {
                available: false,
                status_code: None,
                latency_ms,
                error: Some(self.transport_error(err, started).to_string()),
            },
            Err(_) => ProbeReport {
                available: false,
                status_code: None,
                latency_ms,
                error: Some(UpstreamError::timeout(self.timeout).to_string()),
            },
        }
    }

    async fn verify(&self, verification_id: &str) -> Result<UpstreamOutcome, UpstreamError> {
        let url = format!("{}/verify", self.base_url);
        let started = Instant::now();

        let resp = self
            .request(self.client.post(&url))
            .json(&json!({ "verificationId": verification_id }))
            .send()
            .await
            .map_err(|e| self.transport_error(e, started))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| self.transport_error(e, started))?;
        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), text));
        }

        let body: VerifyResponse = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::malformed(format!("{}: {}", e, text)))?;
        let step = UpstreamStep::from_label(&body.current_step).ok_or_else(|| {
            UpstreamError::malformed(format!("unknown step '{}'", body.current_step))
        })?;

        let detail = body.message.filter(|m| !m.is_empty()).or_else(|| {
            (!body.error_ids.is_empty()).then(|| body.error_ids.join(", "))
        });

        Ok(UpstreamOutcome {
            step,
            label: body.current_step,
            detail,
            redeem_url: body.redirect_url,
        })
    }
}
