//! Versioned coding protocol ("super prompt").
//!
//! Each revision is an opaque string with a version counter and timestamp.
//! History is append-only; earlier revisions stay addressable so a
//! reliability report can name the exact protocol it was run against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevisionSource {
    Initial,
    /// Produced by a model drafting round.
    Refinement { instruction: String },
    /// Edited by hand.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRevision {
    /// 1-based, strictly increasing.
    pub version: u32,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub source: RevisionSource,
}

impl ProtocolRevision {
    pub fn content_hash(&self) -> String {
        protocol_hash(&self.text)
    }
}

/// blake3 of the protocol text, as hex.
pub fn protocol_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHistory")]
pub struct ProtocolHistory {
    revisions: Vec<ProtocolRevision>,
}

#[derive(Deserialize)]
struct RawHistory {
    revisions: Vec<ProtocolRevision>,
}

impl TryFrom<RawHistory> for ProtocolHistory {
    type Error = String;

    fn try_from(raw: RawHistory) -> Result<Self, Self::Error> {
        if raw.revisions.is_empty() {
            return Err("protocol history has no revisions".to_string());
        }
        if raw.revisions.windows(2).any(|w| w[1].version <= w[0].version) {
            return Err("protocol versions must be strictly increasing".to_string());
        }
        Ok(Self {
            revisions: raw.revisions,
        })
    }
}

impl ProtocolHistory {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            revisions: vec![ProtocolRevision {
                version: 1,
                text: initial.into(),
                created_at: Utc::now(),
                source: RevisionSource::Initial,
            }],
        }
    }

    pub fn current(&self) -> &ProtocolRevision {
        // Never empty: constructed with an initial revision and only appended to.
        &self.revisions[self.revisions.len() - 1]
    }

    /// Append a revision and return it. Identical text still bumps the version.
    pub fn revise(&mut self, text: impl Into<String>, source: RevisionSource) -> &ProtocolRevision {
        let version = self.current().version + 1;
        self.revisions.push(ProtocolRevision {
            version,
            text: text.into(),
            created_at: Utc::now(),
            source,
        });
        self.current()
    }

    pub fn get(&self, version: u32) -> Option<&ProtocolRevision> {
        self.revisions.iter().find(|r| r.version == version)
    }

    pub fn revisions(&self) -> &[ProtocolRevision] {
        &self.revisions
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}

impl Default for ProtocolHistory {
    fn default() -> Self {
        Self::new(DEFAULT_PROTOCOL)
    }
}

/// Starting protocol before any refinement round.
pub const DEFAULT_PROTOCOL: &str = "Read the survey response and decide what the respondent's trust \
(or distrust) is primarily based on. Assign the single category that best captures the main reason \
given. Code what is written, not what might be implied. If the response gives no reason, or the \
reason fits no category, assign 0.0.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_are_append_only_and_versioned() {
        let mut history = ProtocolHistory::new("v1 text");
        history.revise(
            "v2 text",
            RevisionSource::Refinement {
                instruction: "tighten".into(),
            },
        );
        history.revise("v3 text", RevisionSource::Manual);

        assert_eq!(history.len(), 3);
        assert_eq!(history.current().version, 3);
        assert_eq!(history.get(1).map(|r| r.text.as_str()), Some("v1 text"));
        assert!(history.get(4).is_none());
        assert!(history.revisions()[0].created_at <= history.current().created_at);
    }

    #[test]
    fn same_text_same_hash() {
        let mut history = ProtocolHistory::new("same");
        let first = history.current().content_hash();
        history.revise("same", RevisionSource::Manual);
        assert_eq!(history.current().content_hash(), first);
        assert_eq!(history.current().version, 2);
    }

    #[test]
    fn history_round_trips_through_json() {
        let mut history = ProtocolHistory::default();
        history.revise("edited", RevisionSource::Manual);
        let raw = serde_json::to_string(&history).unwrap();
        let back: ProtocolHistory = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, history);
    }

    #[test]
    fn empty_history_is_rejected() {
        let err = serde_json::from_str::<ProtocolHistory>(r#"{"revisions":[]}"#).unwrap_err();
        assert!(err.to_string().contains("no revisions"));
    }
}
