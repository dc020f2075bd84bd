//! Persisted checkpoint record.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use freshet_core::ResumeToken;

fn default_schema_version() -> u32 {
    1
}

/// Resume position with its activity state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value")]
pub enum TokenState {
    /// Nothing committed yet; read from the start of the feed.
    #[default]
    Initial,
    Active(ResumeToken),
}

impl TokenState {
    pub fn token(&self) -> Option<ResumeToken> {
        match self {
            TokenState::Initial => None,
            TokenState::Active(token) => Some(*token),
        }
    }
}

/// Stored at `_freshet/{pipeline}_checkpoint.json`.
///
/// ```json
/// {
///   "schema_version": 1,
///   "token": {"state": "Active", "value": 184467},
///   "last_update_ts": 1718000000,
///   "events_since_checkpoint": 1000,
///   "save_count": 42,
///   "metadata": {"pipeline": "orders"}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub token: TokenState,
    /// Unix seconds of the last save.
    #[serde(default)]
    pub last_update_ts: i64,
    /// Events covered by the last save.
    #[serde(default)]
    pub events_since_checkpoint: u64,
    #[serde(default)]
    pub save_count: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Default for CheckpointRecord {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            token: TokenState::Initial,
            last_update_ts: 0,
            events_since_checkpoint: 0,
            save_count: 0,
            metadata: BTreeMap::new(),
        }
    }
}

impl CheckpointRecord {
    /// Move to `token`, bumping the counters.
    pub fn advance(&mut self, token: ResumeToken, now: DateTime<Utc>) {
        self.events_since_checkpoint = token.distance_from(self.token.token());
        self.token = TokenState::Active(token);
        self.last_update_ts = now.timestamp();
        self.save_count += 1;
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.last_update_ts, 0).single()
    }

    /// Time since the last save, if there was one.
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if self.token == TokenState::Initial {
            return None;
        }
        self.last_update().map(|at| now - at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let mut record = CheckpointRecord::default();
        record
            .metadata
            .insert("pipeline".to_string(), "orders".to_string());
        record.advance(ResumeToken::new(500), Utc.timestamp_opt(1_718_000_000, 0).unwrap());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["token"]["state"], "Active");
        assert_eq!(json["token"]["value"], 500);
        assert_eq!(json["last_update_ts"], 1_718_000_000);
        assert_eq!(json["events_since_checkpoint"], 500);
        assert_eq!(json["save_count"], 1);
        assert_eq!(json["metadata"]["pipeline"], "orders");
    }

    #[test]
    fn test_missing_fields_default() {
        let record: CheckpointRecord = serde_json::from_str(r#"{"token":{"state":"Initial"}}"#).unwrap();
        assert_eq!(record.schema_version, 1);
        assert_eq!(record.token.token(), None);
        assert_eq!(record.save_count, 0);
    }

    #[test]
    fn test_age_only_for_committed_tokens() {
        let now = Utc.timestamp_opt(1_718_100_000, 0).unwrap();
        assert!(CheckpointRecord::default().age(now).is_none());

        let mut record = CheckpointRecord::default();
        record.advance(ResumeToken::new(1), Utc.timestamp_opt(1_718_000_000, 0).unwrap());
        assert_eq!(record.age(now).unwrap().num_seconds(), 100_000);
    }

    #[test]
    fn test_events_since_checkpoint_counts_from_previous_token() {
        let mut record = CheckpointRecord::default();
        let now = Utc::now();
        record.advance(ResumeToken::new(1000), now);
        record.advance(ResumeToken::new(1750), now);
        assert_eq!(record.events_since_checkpoint, 750);
        assert_eq!(record.save_count, 2);
    }
}
