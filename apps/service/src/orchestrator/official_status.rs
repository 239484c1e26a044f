//! Vendor self-reported health, polled from public status feeds.
//!
//! Runs on its own timer, independent of the scheduler and of leadership:
//! every instance keeps its own table so any of them can serve snapshots.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OfficialStatusConfig;
use crate::monitoring::types::{OfficialState, OfficialStatus, Vendor};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// Atlassian Statuspage v2 `status.json`
    Statuspage,
    /// Google Cloud `incidents.json`
    GoogleIncidents,
}

#[derive(Debug, Clone)]
pub struct Feed {
    pub vendor: Vendor,
    pub kind: FeedKind,
    pub url: String,
}

pub struct OfficialStatusPoller {
    client: reqwest::Client,
    feeds: Vec<Feed>,
    interval: Duration,
    statuses: RwLock<HashMap<Vendor, OfficialStatus>>,
    in_flight: AtomicBool,
}

impl OfficialStatusPoller {
    pub fn new(config: &OfficialStatusConfig, interval: Duration) -> anyhow::Result<Self> {
        let feeds = vec![
            Feed { vendor: Vendor::OpenAi, kind: FeedKind::Statuspage, url: config.openai_url.clone() },
            Feed {
                vendor: Vendor::Anthropic,
                kind: FeedKind::Statuspage,
                url: config.anthropic_url.clone(),
            },
            Feed {
                vendor: Vendor::Gemini,
                kind: FeedKind::GoogleIncidents,
                url: config.gemini_url.clone(),
            },
        ];
        Self::with_feeds(feeds, interval)
    }

    pub fn with_feeds(feeds: Vec<Feed>, interval: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("modelwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            feeds,
            interval,
            statuses: RwLock::new(HashMap::new()),
            in_flight: AtomicBool::new(false),
        })
    }

    pub async fn latest(&self, vendor: Vendor) -> Option<OfficialStatus> {
        self.statuses.read().await.get(&vendor).cloned()
    }

    pub async fn all(&self) -> HashMap<Vendor, OfficialStatus> {
        self.statuses.read().await.clone()
    }

    /// Fetch every feed once. Returns `false` when a poll was already running.
    pub async fn poll_once(&self) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Official status poll already in flight");
            return false;
        }

        let results =
            futures::future::join_all(self.feeds.iter().map(|feed| self.fetch(feed))).await;

        {
            let mut statuses = self.statuses.write().await;
            for status in results {
                debug!(vendor = %status.vendor, state = %status.state, "{}", status.message);
                statuses.insert(status.vendor, status);
            }
        }

        self.in_flight.store(false, Ordering::Release);
        true
    }

    async fn fetch(&self, feed: &Feed) -> OfficialStatus {
        let (state, message) = match self.fetch_json(&feed.url).await {
            Ok(body) => match feed.kind {
                FeedKind::Statuspage => classify_statuspage(&body),
                FeedKind::GoogleIncidents => classify_google_incidents(&body),
            },
            Err(message) => {
                warn!(vendor = %feed.vendor, "Official status fetch failed: {}", message);
                (OfficialState::Unknown, message)
            }
        };

        OfficialStatus { vendor: feed.vendor, state, message, checked_at: Utc::now() }
    }

    async fn fetch_json(&self, url: &str) -> Result<Value, String> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() { "status feed timed out".to_string() } else { format!("status feed unreachable: {e}") }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("status feed returned HTTP {}", status.as_u16()));
        }

        response.json::<Value>().await.map_err(|e| format!("status feed unparseable: {e}"))
    }

    /// Poll immediately, then on every interval until cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            info!("Official status poller started (interval {}s)", poller.interval.as_secs());
            let mut timer = tokio::time::interval(poller.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        poller.poll_once().await;
                    }
                }
            }
        })
    }
}

pub fn classify_statuspage(body: &Value) -> (OfficialState, String) {
    let indicator = body.pointer("/status/indicator").and_then(Value::as_str);
    let description = body
        .pointer("/status/description")
        .and_then(Value::as_str)
        .unwrap_or("no description")
        .to_string();

    let state = match indicator {
        Some("none") => OfficialState::Operational,
        Some("minor") => OfficialState::Degraded,
        Some("major") | Some("critical") => OfficialState::Down,
        Some(_) => OfficialState::Unknown,
        None => return (OfficialState::Unknown, "status feed missing indicator".to_string()),
    };
    (state, description)
}

pub fn classify_google_incidents(body: &Value) -> (OfficialState, String) {
    let Some(incidents) = body.as_array() else {
        return (OfficialState::Unknown, "incident feed is not a list".to_string());
    };

    let ongoing: Vec<&Value> = incidents
        .iter()
        .filter(|incident| incident.get("end").is_none_or(Value::is_null))
        .filter(|incident| mentions_gemini(incident))
        .collect();

    if ongoing.is_empty() {
        return (OfficialState::Operational, "No ongoing Gemini incidents".to_string());
    }

    let severe = ongoing
        .iter()
        .any(|incident| incident.get("severity").and_then(Value::as_str) == Some("high"));
    let summary = ongoing
        .first()
        .and_then(|incident| incident.get("external_desc"))
        .and_then(Value::as_str)
        .unwrap_or("ongoing incident")
        .trim()
        .to_string();

    let state = if severe { OfficialState::Down } else { OfficialState::Degraded };
    (state, summary)
}

fn mentions_gemini(incident: &Value) -> bool {
    let text_mentions = |v: Option<&Value>| {
        v.and_then(Value::as_str).is_some_and(|s| s.to_ascii_lowercase().contains("gemini"))
    };

    text_mentions(incident.get("service_name"))
        || text_mentions(incident.get("external_desc"))
        || incident
            .get("affected_products")
            .and_then(Value::as_array)
            .is_some_and(|products| products.iter().any(|p| text_mentions(p.get("title"))))
}
