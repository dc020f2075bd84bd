//! Dead-letter record and per-stage statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage where an event was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Publish retries exhausted.
    Publish,
    /// Circuit breaker was open, the bus was never contacted.
    CircuitOpen,
    /// Bus message envelope could not be parsed.
    Decode,
    /// Mapping or type coercion failed.
    Transform,
    /// Destination writer failed.
    Write,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Publish => "publish",
            FailureStage::CircuitOpen => "circuit_open",
            FailureStage::Decode => "decode",
            FailureStage::Transform => "transform",
            FailureStage::Write => "write",
        }
    }
}

/// An event that could not be processed. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The payload exactly as received (or as it would have been published).
    pub original_payload: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub stage: FailureStage,
}

impl DeadLetterRecord {
    pub fn new(
        original_payload: impl Into<String>,
        error_message: impl Into<String>,
        stage: FailureStage,
    ) -> Self {
        Self {
            original_payload: original_payload.into(),
            error_message: error_message.into(),
            timestamp: Utc::now(),
            stage,
        }
    }
}

/// Counts of dead letters by stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub publish: usize,
    pub circuit_open: usize,
    pub decode: usize,
    pub transform: usize,
    pub write: usize,
}

impl FailureStats {
    pub fn increment(&mut self, stage: FailureStage) {
        match stage {
            FailureStage::Publish => self.publish += 1,
            FailureStage::CircuitOpen => self.circuit_open += 1,
            FailureStage::Decode => self.decode += 1,
            FailureStage::Transform => self.transform += 1,
            FailureStage::Write => self.write += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.publish + self.circuit_open + self.decode + self.transform + self.write
    }
}
