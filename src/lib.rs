pub mod action;
pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod sequence;
pub mod token;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire protocols exercised by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Epp,
    Whois,
}

impl Protocol {
    /// Label used for metric keys and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Epp => "epp",
            Protocol::Whois => "whois",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Classification of a completed action or probe sequence.
///
/// A sequence-level outcome is derived from its action outcomes with
/// "first non-success wins".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    ConnectionError,
    ProtocolError,
}

impl Outcome {
    /// Label used for metric keys.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Timeout => "TIMEOUT",
            Outcome::ConnectionError => "CONNECTION_ERROR",
            Outcome::ProtocolError => "PROTOCOL_ERROR",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Event published when a probe sequence reaches a terminal state.
///
/// Broadcast to all interested subscribers (health monitor, tests). The
/// broadcast channel may lag or drop messages for slow subscribers - this is
/// acceptable as probe cycles are continuously generated.
#[derive(Debug, Clone)]
pub struct ProbeEvent {
    /// Protocol the sequence ran over
    pub protocol: Protocol,

    /// Target that was probed
    pub target: String,

    /// Sequence-level outcome
    pub outcome: Outcome,

    /// Wall-clock duration of the whole sequence in milliseconds
    pub elapsed_ms: u64,

    /// When the sequence completed
    pub timestamp: DateTime<Utc>,
}
