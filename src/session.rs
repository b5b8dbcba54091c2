//! Coding session: the explicit context carried across interaction rounds.
//!
//! A session owns the codebook, the protocol history, the refinement chat
//! transcript and the most recent reliability and batch results. It is
//! created at session start and mutated only by [`CodingSession::refine_protocol`],
//! [`CodingSession::record_reliability`] and [`CodingSession::record_batch`].
//! The CLI persists it between invocations as a JSON snapshot.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::batch::BatchResult;
use crate::codebook::Codebook;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError, Role};
use crate::prompts::render_refinement;
use crate::protocol::{ProtocolHistory, ProtocolRevision, RevisionSource};
use crate::reliability::ReliabilityReport;

/// Output budget for one drafting round; a full codebook runs long.
pub const REFINE_MAX_OUTPUT_TOKENS: u32 = 2048;

#[derive(Debug, thiserror::Error)]
pub enum RefineError {
    #[error("instruction is empty")]
    EmptyInstruction,
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("model returned an empty protocol draft")]
    EmptyResponse,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid session snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub codebook: Codebook,
    protocol: ProtocolHistory,
    #[serde(default)]
    transcript: Vec<TranscriptTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latest_reliability: Option<ReliabilityReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latest_batch: Option<BatchResult>,
}

impl CodingSession {
    pub fn new(codebook: Codebook) -> Self {
        Self::with_protocol(codebook, ProtocolHistory::default())
    }

    pub fn with_protocol(codebook: Codebook, protocol: ProtocolHistory) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            codebook,
            protocol,
            transcript: Vec::new(),
            latest_reliability: None,
            latest_batch: None,
        }
    }

    pub fn protocol(&self) -> &ProtocolRevision {
        self.protocol.current()
    }

    pub fn history(&self) -> &ProtocolHistory {
        &self.protocol
    }

    pub fn transcript(&self) -> &[TranscriptTurn] {
        &self.transcript
    }

    pub fn latest_reliability(&self) -> Option<&ReliabilityReport> {
        self.latest_reliability.as_ref()
    }

    pub fn latest_batch(&self) -> Option<&BatchResult> {
        self.latest_batch.as_ref()
    }

    /// One drafting round: ask the model to rewrite the protocol according
    /// to `instruction` and store its reply as the next revision.
    ///
    /// On any error the session is left untouched.
    pub async fn refine_protocol(
        &mut self,
        gateway: &dyn ChatGateway,
        model: &str,
        instruction: &str,
    ) -> Result<&ProtocolRevision, RefineError> {
        if instruction.trim().is_empty() {
            return Err(RefineError::EmptyInstruction);
        }
        let prompt = render_refinement(&self.codebook, &self.protocol.current().text, instruction);
        let req = ChatRequest::new(
            ChatModel::openrouter(model),
            prompt.to_messages(),
            Attribution::new("session::refine_protocol").with_session(self.id),
        )
        .temperature(0.7)
        .max_tokens(REFINE_MAX_OUTPUT_TOKENS);

        let resp = gateway.chat(req).await?;
        let draft = resp.content.trim();
        if draft.is_empty() {
            return Err(RefineError::EmptyResponse);
        }

        let now = Utc::now();
        self.transcript.push(TranscriptTurn {
            role: Role::User,
            content: instruction.trim().to_string(),
            at: now,
        });
        self.transcript.push(TranscriptTurn {
            role: Role::Assistant,
            content: draft.to_string(),
            at: now,
        });
        let revision = self.protocol.revise(
            draft,
            RevisionSource::Refinement {
                instruction: instruction.trim().to_string(),
            },
        );
        info!(
            session_id = %self.id,
            version = revision.version,
            output_tokens = resp.output_tokens,
            "protocol revised"
        );
        Ok(revision)
    }

    /// Replace the protocol with hand-edited text.
    pub fn edit_protocol(&mut self, text: impl Into<String>) -> &ProtocolRevision {
        self.protocol.revise(text, RevisionSource::Manual)
    }

    pub fn record_reliability(&mut self, report: ReliabilityReport) {
        self.latest_reliability = Some(report);
    }

    pub fn record_batch(&mut self, result: BatchResult) {
        self.latest_batch = Some(result);
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| io_error(path, source))?;
        }
        std::fs::write(path, json).map_err(|source| io_error(path, source))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| io_error(path, source))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SessionError {
    SessionError::Io {
        path: path.display().to_string(),
        source,
    }
}
