use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// API family a target belongs to; selects the probe strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    OpenAi,
    Anthropic,
    Gemini,
}

impl Vendor {
    pub const ALL: [Vendor; 3] = [Vendor::OpenAi, Vendor::Anthropic, Vendor::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Anthropic => "anthropic",
            Vendor::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Vendor::OpenAi),
            "anthropic" => Ok(Vendor::Anthropic),
            "gemini" => Ok(Vendor::Gemini),
            other => Err(anyhow::anyhow!("Unknown vendor: {}", other)),
        }
    }
}

/// Status of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Operational,
    Degraded,
    ValidationFailed,
    Failed,
    Error,
    Maintenance,
}

impl CheckStatus {
    pub const ALL: [CheckStatus; 6] = [
        CheckStatus::Operational,
        CheckStatus::Degraded,
        CheckStatus::ValidationFailed,
        CheckStatus::Failed,
        CheckStatus::Error,
        CheckStatus::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Operational => "operational",
            CheckStatus::Degraded => "degraded",
            CheckStatus::ValidationFailed => "validation_failed",
            CheckStatus::Failed => "failed",
            CheckStatus::Error => "error",
            CheckStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown check status: {}", s))
    }
}

/// Health a vendor reports about itself on its public status page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfficialState {
    Operational,
    Degraded,
    Down,
    Unknown,
}

impl fmt::Display for OfficialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfficialState::Operational => write!(f, "operational"),
            OfficialState::Degraded => write!(f, "degraded"),
            OfficialState::Down => write!(f, "down"),
            OfficialState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Latest official-status reading for one vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfficialStatus {
    pub vendor: Vendor,
    pub state: OfficialState,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

/// Result of probing one target. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub target_id: Uuid,

    /// Display metadata copied at check time
    pub name: String,
    pub vendor: Vendor,
    pub model: String,
    pub endpoint: String,

    pub status: CheckStatus,

    /// Time from sending the request to the first streamed content chunk
    pub latency_ms: Option<u64>,

    /// Round trip of the connectivity ping to the endpoint host
    pub ping_latency_ms: Option<u64>,

    pub checked_at: DateTime<Utc>,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_status: Option<OfficialStatus>,
}

impl CheckOutcome {
    pub fn is_failed(&self) -> bool {
        self.status == CheckStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in CheckStatus::ALL {
            assert_eq!(status.as_str().parse::<CheckStatus>().unwrap(), status);
        }
        assert!("up".parse::<CheckStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&CheckStatus::ValidationFailed).unwrap();
        assert_eq!(json, "\"validation_failed\"");
    }

    #[test]
    fn test_vendor_parsing_is_case_insensitive() {
        assert_eq!("OpenAI".parse::<Vendor>().unwrap(), Vendor::OpenAi);
        assert_eq!(" gemini ".parse::<Vendor>().unwrap(), Vendor::Gemini);
        assert!("mistral".parse::<Vendor>().is_err());
        assert_eq!(serde_json::to_string(&Vendor::OpenAi).unwrap(), "\"openai\"");
    }
}
