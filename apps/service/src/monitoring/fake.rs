//! Scriptable probe strategy for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::challenge::Challenge;
use super::probe::{ProbeError, ProbeStrategy, StreamedReply};
use crate::database::Target;

type Respond = dyn Fn(usize, &Challenge) -> Result<StreamedReply, ProbeError> + Send + Sync;

pub(crate) struct FakeProbe {
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    delay: Duration,
    respond: Box<Respond>,
}

impl FakeProbe {
    /// `respond` receives the zero-based call index.
    pub fn with<F>(respond: F) -> Self
    where
        F: Fn(usize, &Challenge) -> Result<StreamedReply, ProbeError> + Send + Sync + 'static,
    {
        Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Duration::ZERO,
            respond: Box::new(respond),
        }
    }

    /// Always answers the challenge correctly with the given first-token latency.
    pub fn answering(latency_ms: u64) -> Self {
        Self::with(move |_, challenge| Ok(correct(challenge, latency_ms)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn correct(challenge: &Challenge, latency_ms: u64) -> StreamedReply {
    StreamedReply { text: challenge.expected.to_string(), first_token_ms: Some(latency_ms) }
}

#[async_trait]
impl ProbeStrategy for FakeProbe {
    async fn stream_reply(
        &self,
        _client: &reqwest::Client,
        _target: &Target,
        challenge: &Challenge,
    ) -> Result<StreamedReply, ProbeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.respond)(call, challenge)
    }
}
