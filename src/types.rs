use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Chat-level identifier of an operator.
pub type UserId = i64;

/// Identifier of a message previously sent through a transport.
pub type MessageId = u64;

/// One open (address, port) pair reported by the scan engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Named packets/second ceiling selectable by the operator.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateTier {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl RateTier {
    pub const ALL: [RateTier; 3] = [RateTier::Slow, RateTier::Normal, RateTier::Fast];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateTier::Slow => "slow",
            RateTier::Normal => "normal",
            RateTier::Fast => "fast",
        }
    }
}

impl fmt::Display for RateTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow" => Ok(RateTier::Slow),
            "normal" => Ok(RateTier::Normal),
            "fast" => Ok(RateTier::Fast),
            other => Err(format!("unknown rate tier: {other}")),
        }
    }
}

/// Terminal state of one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    TimedOut,
    Failed(String),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::Cancelled => f.write_str("cancelled"),
            RunOutcome::TimedOut => f.write_str("timed_out"),
            RunOutcome::Failed(_) => f.write_str("failed"),
        }
    }
}

/// What a finished run hands back to whoever awaited it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub discoveries: Vec<Discovery>,
}
