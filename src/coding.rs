//! Code a single item with the model.
//!
//! Pipeline per item: render prompt, consult cache, call the gateway, run the
//! extractor against the codebook, write back to cache. Transport failures
//! come back as `CodingError::Provider`; they are never folded into the
//! response text.

use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheError, CachedCoding, CodingCache, CodingCacheKey};
use crate::codebook::{Category, Codebook};
use crate::extract::{extract_with_codebook, Extraction, ExtractionOutcome};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::items::CodingItem;
use crate::prompts::{prompt_by_slug, render_coding, PromptTemplate, DEFAULT_CODING_PROMPT};
use crate::protocol::ProtocolRevision;
use crate::trace::{now_epoch_ms, CodingTrace, TraceSink};

pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-001";

/// Generation cap for one coding answer: a code plus a short justification.
pub const CODING_MAX_OUTPUT_TOKENS_DEFAULT: u32 = 128;
pub const CODING_MAX_OUTPUT_TOKENS_GPT5: u32 = 512;

pub fn coding_max_output_tokens(model: &str) -> u32 {
    // GPT-5 models spend part of the budget on hidden reasoning and can
    // return empty content under a small cap.
    if model.starts_with("openai/gpt-5") {
        CODING_MAX_OUTPUT_TOKENS_GPT5
    } else {
        CODING_MAX_OUTPUT_TOKENS_DEFAULT
    }
}

// =============================================================================
// Options and context
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodingOptions {
    pub model: String,
    pub template_slug: String,
    pub temperature: f32,
    /// `None` picks a per-model default.
    pub max_tokens: Option<u32>,
    /// Fail items that are not already cached instead of calling the model.
    pub cache_only: bool,
}

impl Default for CodingOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            template_slug: DEFAULT_CODING_PROMPT.slug.to_string(),
            temperature: 0.0,
            max_tokens: None,
            cache_only: false,
        }
    }
}

impl CodingOptions {
    /// Resolved template; unknown slugs fall back to the default.
    pub fn template(&self) -> PromptTemplate {
        prompt_by_slug(&self.template_slug).unwrap_or(DEFAULT_CODING_PROMPT)
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or_else(|| coding_max_output_tokens(&self.model))
    }
}

/// Everything a run needs besides the items themselves.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub gateway: &'a dyn ChatGateway,
    pub cache: Option<&'a dyn CodingCache>,
    pub trace: Option<&'a dyn TraceSink>,
    pub codebook: &'a Codebook,
    pub protocol: &'a ProtocolRevision,
    pub session_id: Option<Uuid>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        gateway: &'a dyn ChatGateway,
        codebook: &'a Codebook,
        protocol: &'a ProtocolRevision,
    ) -> Self {
        Self {
            gateway,
            cache: None,
            trace: None,
            codebook,
            protocol,
            session_id: None,
        }
    }

    pub fn with_cache(mut self, cache: &'a dyn CodingCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_trace(mut self, trace: &'a dyn TraceSink) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub(crate) fn attribution(&self, caller: &'static str, run_id: Uuid) -> Attribution {
        let attribution = Attribution::new(caller).with_run(run_id);
        match self.session_id {
            Some(id) => attribution.with_session(id),
            None => attribution,
        }
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CodingError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("cache miss for item {0}")]
    CacheMiss(String),
}

/// Usage for one item coding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodingUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCoding {
    pub raw_response: String,
    pub extraction: Extraction,
    pub usage: CodingUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key_hash: Option<String>,
}

// =============================================================================
// Coding
// =============================================================================

/// Code one item against the current protocol.
pub async fn code_item(
    ctx: &RunContext<'_>,
    options: &CodingOptions,
    item: &CodingItem,
    attribution: Attribution,
) -> Result<ItemCoding, CodingError> {
    let template = options.template();
    let prompt = render_coding(template, &ctx.protocol.text, ctx.codebook, item);

    let cache_key = ctx.cache.map(|_| {
        CodingCacheKey::new(
            &options.model,
            template.slug,
            &template.content_hash(),
            &ctx.protocol.text,
            &ctx.codebook.render_for_prompt(),
            &item.content_hash(),
        )
    });

    if let (Some(cache), Some(key)) = (ctx.cache, &cache_key) {
        match cache.get(key).await {
            Ok(Some(hit)) => {
                debug!(key = %key.key_hash, "coding cache hit");
                return Ok(ItemCoding {
                    extraction: extract_with_codebook(&hit.raw_response, ctx.codebook),
                    raw_response: hit.raw_response,
                    usage: CodingUsage {
                        cached: true,
                        ..CodingUsage::default()
                    },
                    cache_key_hash: Some(key.key_hash.clone()),
                });
            }
            Ok(None) => {}
            Err(err) => {
                if options.cache_only {
                    return Err(CodingError::Cache(err));
                }
                warn!(error = %err, "cache read failed; calling the model");
            }
        }
    }
    if options.cache_only {
        return Err(CodingError::CacheMiss(item.content_hash()));
    }

    let request = ChatRequest::new(
        ChatModel::openrouter(&options.model),
        prompt.to_messages(),
        attribution,
    )
    .temperature(options.temperature)
    .max_tokens(options.max_tokens());

    let response = ctx.gateway.chat(request).await?;
    let usage = CodingUsage {
        input_tokens: response.input_tokens,
        output_tokens: response.output_tokens,
        cost_nanodollars: response.cost_nanodollars,
        cached: false,
    };
    let extraction = extract_with_codebook(&response.content, ctx.codebook);

    // Empty answers are usually truncation; leave them uncached so a rerun retries.
    if let (Some(cache), Some(key)) = (ctx.cache, &cache_key) {
        if !response.content.trim().is_empty() {
            let entry = CachedCoding {
                raw_response: response.content.clone(),
                input_tokens: Some(usage.input_tokens),
                output_tokens: Some(usage.output_tokens),
                cost_nanodollars: Some(usage.cost_nanodollars),
            };
            if let Err(err) = cache.put(key, &entry).await {
                warn!(error = %err, "cache write failed");
            }
        }
    }

    Ok(ItemCoding {
        raw_response: response.content,
        extraction,
        usage,
        cache_key_hash: cache_key.map(|k| k.key_hash),
    })
}

// =============================================================================
// Dispatch
// =============================================================================

/// Upper bound on in-flight model calls per run.
pub const MAX_CONCURRENCY: usize = 16;

/// How an item's model code was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Extracted a codebook member (including an explicit `0.0`).
    Coded,
    /// The model answered but no code pattern was found.
    NoPattern,
    /// The model answered with a code outside the codebook.
    OutOfCodebook { found: Category },
    /// The model was never heard from.
    TransportFailed { code: String, message: String },
    /// Cache-only run and nothing was cached for this item.
    NotCached { message: String },
}

impl ItemOutcome {
    pub(crate) fn from_extraction(extraction: &Extraction) -> Self {
        match (extraction.outcome, extraction.found) {
            (ExtractionOutcome::Matched, _) => ItemOutcome::Coded,
            (ExtractionOutcome::OutOfCodebook, Some(found)) => ItemOutcome::OutOfCodebook { found },
            _ => ItemOutcome::NoPattern,
        }
    }

    fn from_error(err: &CodingError) -> Self {
        match err {
            CodingError::Provider(e) => ItemOutcome::TransportFailed {
                code: e.code().to_string(),
                message: e.to_string(),
            },
            other => ItemOutcome::NotCached {
                message: other.to_string(),
            },
        }
    }

    /// No model answer was obtained.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ItemOutcome::TransportFailed { .. } | ItemOutcome::NotCached { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Coded => "coded",
            ItemOutcome::NoPattern => "no_pattern",
            ItemOutcome::OutOfCodebook { .. } => "out_of_codebook",
            ItemOutcome::TransportFailed { .. } => "transport_failed",
            ItemOutcome::NotCached { .. } => "not_cached",
        }
    }
}

/// Model code for one item of a run. `category` is always a codebook member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodedItem {
    pub index: usize,
    pub category: Category,
    pub outcome: ItemOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default)]
    pub usage: CodingUsage,
}

/// Token and cost totals for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUsage {
    pub live_calls: usize,
    pub cache_hits: usize,
    pub failures: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

impl RunUsage {
    pub fn from_items(items: &[CodedItem]) -> Self {
        let mut usage = RunUsage::default();
        for item in items {
            if item.outcome.is_failure() {
                usage.failures += 1;
            } else if item.usage.cached {
                usage.cache_hits += 1;
            } else {
                usage.live_calls += 1;
            }
            usage.input_tokens += item.usage.input_tokens as u64;
            usage.output_tokens += item.usage.output_tokens as u64;
            usage.cost_nanodollars += item.usage.cost_nanodollars;
        }
        usage
    }
}

/// Code every item with at most `concurrency` calls in flight.
///
/// Results come back in input order regardless of completion order. A failed
/// item is recorded as the sentinel with a failure outcome; it never aborts
/// the run.
pub async fn code_items(
    ctx: &RunContext<'_>,
    options: &CodingOptions,
    items: &[CodingItem],
    concurrency: usize,
    run_id: Uuid,
    run_kind: &'static str,
) -> Vec<CodedItem> {
    let concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
    let caller = match run_kind {
        "batch" => "batch::run_batch",
        _ => "reliability::run_reliability",
    };

    stream::iter(items.iter().enumerate().map(|(index, item)| async move {
        let attribution = ctx.attribution(caller, run_id);
        let result = code_item(ctx, options, item, attribution).await;
        let coded = match &result {
            Ok(coding) => CodedItem {
                index,
                category: coding.extraction.category,
                outcome: ItemOutcome::from_extraction(&coding.extraction),
                raw_response: Some(coding.raw_response.clone()),
                usage: coding.usage,
            },
            Err(err) => {
                warn!(index, error = %err, "item coding failed");
                CodedItem {
                    index,
                    category: Category::UNCODABLE,
                    outcome: ItemOutcome::from_error(err),
                    raw_response: None,
                    usage: CodingUsage::default(),
                }
            }
        };
        if let Some(trace) = ctx.trace {
            let event = trace_event(ctx, options, item, &coded, &result, run_id, run_kind);
            if let Err(err) = trace.record(event) {
                warn!(error = %err, "trace write failed");
            }
        }
        coded
    }))
    .buffered(concurrency)
    .collect()
    .await
}

fn trace_event(
    ctx: &RunContext<'_>,
    options: &CodingOptions,
    item: &CodingItem,
    coded: &CodedItem,
    result: &Result<ItemCoding, CodingError>,
    run_id: Uuid,
    run_kind: &'static str,
) -> CodingTrace {
    let (found, outcome, cache_key_hash, error) = match result {
        Ok(c) => (
            c.extraction.found,
            Some(c.extraction.outcome),
            c.cache_key_hash.clone(),
            None,
        ),
        Err(e) => (None, None, None, Some(e.to_string())),
    };
    CodingTrace {
        timestamp_ms: now_epoch_ms(),
        run_id,
        run_kind,
        item_index: coded.index,
        item_hash: item.content_hash(),
        protocol_version: ctx.protocol.version,
        protocol_hash: ctx.protocol.content_hash(),
        template_slug: options.template().slug.to_string(),
        model: options.model.clone(),
        cache_key_hash,
        raw_response: coded.raw_response.clone(),
        category: coded.category,
        found,
        outcome,
        cached: coded.usage.cached,
        input_tokens: coded.usage.input_tokens,
        output_tokens: coded.usage.output_tokens,
        cost_nanodollars: coded.usage.cost_nanodollars,
        error,
    }
}

// =============================================================================
// Token estimates
// =============================================================================

static TOKENIZER: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

/// cl100k token count, falling back to chars/4 if the tokenizer fails to load.
pub fn count_tokens(text: &str) -> usize {
    match TOKENIZER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Conservative input-token estimate for coding one item. Used for dry runs.
pub fn estimate_item_input_tokens(
    options: &CodingOptions,
    protocol: &str,
    codebook: &Codebook,
    item: &CodingItem,
) -> u32 {
    let prompt = render_coding(options.template(), protocol, codebook, item);
    let messages = prompt.to_messages();
    let content: usize = messages.iter().map(|m| count_tokens(&m.content)).sum();
    let overhead = 8usize.saturating_mul(messages.len());
    (content + overhead) as u32
}
