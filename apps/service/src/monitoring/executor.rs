use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::challenge::Challenge;
use super::probe::{ProbeError, ProbeRegistry, ProbeStrategy, StreamedReply, ping};
use super::types::{CheckOutcome, CheckStatus};
use crate::database::Target;

/// Monitoring executor - probes targets and classifies the replies
pub struct MonitoringExecutor {
    client: reqwest::Client,
    registry: ProbeRegistry,
    max_concurrency: usize,
    ping_enabled: bool,
}

impl MonitoringExecutor {
    /// Create a new monitoring executor
    pub fn new(registry: ProbeRegistry, max_concurrency: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("modelwatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, registry, max_concurrency: max_concurrency.max(1), ping_enabled: true })
    }

    /// Skip the side-channel ping; probes still run.
    pub fn without_ping(mut self) -> Self {
        self.ping_enabled = false;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Probe one target. An aborted connection is retried once right away;
    /// no other failure is retried here.
    pub async fn execute_check(&self, target: &Target, cancel: &CancellationToken) -> CheckOutcome {
        let Some(strategy) = self.registry.get(target.vendor) else {
            return outcome(
                target,
                CheckStatus::Error,
                None,
                None,
                format!("no probe strategy for vendor {}", target.vendor),
            );
        };

        let settings = target.settings();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let challenge = Challenge::random();
            let (result, ping_ms) = tokio::join!(
                self.attempt(strategy.as_ref(), target, &challenge, settings.timeout(), cancel),
                self.ping(target),
            );

            match result {
                Err(ref err) if err.is_aborted() && attempt < 2 => {
                    warn!(target = %target.name, error = %err, "Connection aborted, retrying once");
                }
                result => {
                    return classify(
                        target,
                        settings.degraded_threshold_ms,
                        &challenge,
                        result,
                        ping_ms,
                    );
                }
            }
        }
    }

    async fn attempt(
        &self,
        strategy: &dyn ProbeStrategy,
        target: &Target,
        challenge: &Challenge,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StreamedReply, ProbeError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            result = tokio::time::timeout(timeout, strategy.stream_reply(&self.client, target, challenge)) => {
                result.unwrap_or(Err(ProbeError::Timeout))
            }
        }
    }

    async fn ping(&self, target: &Target) -> Option<u64> {
        if !self.ping_enabled {
            return None;
        }
        ping::ping_endpoint(&self.client, &target.endpoint).await
    }

    /// Probe every target with at most `max_concurrency` in flight.
    ///
    /// Targets still `failed` afterwards are probed once more as a batch and
    /// the second outcome replaces the first. Output order matches `targets`.
    pub async fn execute_batch(
        &self,
        targets: &[Target],
        cancel: &CancellationToken,
    ) -> Vec<CheckOutcome> {
        let mut outcomes = self.run_bounded(targets.to_vec(), cancel).await;

        let failed: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_failed())
            .map(|(i, _)| i)
            .collect();

        if failed.is_empty() || cancel.is_cancelled() {
            return outcomes;
        }

        info!("Confirming {} failed target(s) before recording", failed.len());
        let retry: Vec<Target> = failed.iter().map(|&i| targets[i].clone()).collect();
        let confirmed = self.run_bounded(retry, cancel).await;
        for (index, outcome) in failed.into_iter().zip(confirmed) {
            debug!(target = %outcome.name, status = %outcome.status, "Confirmation result");
            outcomes[index] = outcome;
        }

        outcomes
    }

    async fn run_bounded(
        &self,
        targets: Vec<Target>,
        cancel: &CancellationToken,
    ) -> Vec<CheckOutcome> {
        // Owned items keep the batch future `Send` for spawned ticks.
        let mut indexed: Vec<(usize, CheckOutcome)> = stream::iter(targets.into_iter().enumerate())
            .map(|(index, target)| async move { (index, self.execute_check(&target, cancel).await) })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

/// Map one probe result to a status.
pub fn classify(
    target: &Target,
    degraded_threshold_ms: u64,
    challenge: &Challenge,
    result: Result<StreamedReply, ProbeError>,
    ping_latency_ms: Option<u64>,
) -> CheckOutcome {
    let (status, latency_ms, message) = match result {
        Err(ProbeError::Timeout | ProbeError::Cancelled) => {
            (CheckStatus::Failed, None, "request timed out".to_string())
        }
        Err(err @ (ProbeError::Http { .. } | ProbeError::Stream(_) | ProbeError::InvalidRequest(_))) => {
            (CheckStatus::Error, None, err.to_string())
        }
        Err(err) => (CheckStatus::Failed, None, err.to_string()),
        Ok(reply) if reply.text.trim().is_empty() => {
            (CheckStatus::Failed, reply.first_token_ms, "empty reply".to_string())
        }
        Ok(reply) => {
            let verdict = challenge.verify(&reply.text);
            let latency = reply.first_token_ms.unwrap_or_default();
            if !verdict.passed {
                (CheckStatus::ValidationFailed, Some(latency), verdict.describe_mismatch())
            } else if latency <= degraded_threshold_ms {
                (CheckStatus::Operational, Some(latency), format!("ok, first token in {latency} ms"))
            } else {
                (
                    CheckStatus::Degraded,
                    Some(latency),
                    format!("slow: first token in {latency} ms exceeds {degraded_threshold_ms} ms"),
                )
            }
        }
    };

    outcome(target, status, latency_ms, ping_latency_ms, message)
}

fn outcome(
    target: &Target,
    status: CheckStatus,
    latency_ms: Option<u64>,
    ping_latency_ms: Option<u64>,
    message: String,
) -> CheckOutcome {
    CheckOutcome {
        target_id: target.id,
        name: target.name.clone(),
        vendor: target.vendor,
        model: target.model.clone(),
        endpoint: target.endpoint.clone(),
        status,
        latency_ms,
        ping_latency_ms,
        checked_at: Utc::now(),
        message,
        official_status: None,
    }
}
