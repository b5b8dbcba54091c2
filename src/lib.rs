#![forbid(unsafe_code)]

//! # qualcode-harness
//!
//! LLM-assisted qualitative content coding with a reliability gate.
//!
//! A model assigns each free-text survey response one category from a fixed
//! codebook (`d.d` codes, `0.0` for uncodable). Before the model is trusted
//! with the full dataset, its codes on a small human-coded test set are
//! scored against the human coders with Cohen's kappa (two raters) or
//! Fleiss' kappa (three raters), and the score is mapped to one of three
//! recommendations: proceed, collect more examples, or revise the protocol.
//!
//! The pure core is [`extract`], [`kappa`] and [`recommend`]; [`coding`],
//! [`reliability`] and [`batch`] drive the model through the [`gateway`].

pub mod batch;
pub mod cache;
pub mod codebook;
pub mod coding;
pub mod config;
pub mod export;
pub mod extract;
pub mod gateway;
pub mod items;
pub mod kappa;
pub mod prompts;
pub mod protocol;
pub mod recommend;
pub mod reliability;
pub mod session;
pub mod trace;

pub use batch::{run_batch, BatchRequest, BatchResult};
pub use cache::{CodingCache, CodingCacheKey, SqliteCodingCache};
pub use codebook::{Category, Codebook};
pub use coding::{code_item, code_items, CodingOptions, ItemOutcome, RunContext};
pub use config::HarnessConfig;
pub use extract::{extract_code, extract_with_codebook, Extraction, ExtractionOutcome};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use items::CodingItem;
pub use kappa::{score, AgreementScore, KappaMethod, Rater, RatingTable, ScoreError};
pub use protocol::{ProtocolHistory, ProtocolRevision};
pub use recommend::{recommend, Recommendation};
pub use reliability::{run_reliability, score_collected, ReliabilityReport, ReliabilityRequest};
pub use session::CodingSession;
pub use trace::{JsonlTraceSink, TraceSink, TraceWorker};
