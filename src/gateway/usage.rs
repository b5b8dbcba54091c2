//! Usage tracking via the UsageSink trait.
//!
//! The gateway reports every call through a UsageSink:
//! - the CLI uses `TracingUsageSink` (one structured log line per call)
//! - runs that report totals wrap any sink in `TallyUsageSink`
//! - tests use `NoopUsageSink`

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of one provider API call.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub session_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub caller: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(provider: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            session_id: None,
            run_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn cost(mut self, nanodollars: i64) -> Self {
        self.cost_nanodollars = nanodollars;
        self
    }

    pub fn session(mut self, session_id: Option<Uuid>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Sink for provider call records. Recording is fire-and-forget.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits one `tracing` event per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match record.status {
            CallStatus::Success => tracing::info!(
                target: "qualcode::usage",
                provider = record.provider,
                model = %record.model,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                cost_nanos = record.cost_nanodollars,
                latency_ms = record.latency_ms,
                caller = record.caller,
                "provider call"
            ),
            CallStatus::Error => tracing::warn!(
                target: "qualcode::usage",
                provider = record.provider,
                model = %record.model,
                error = record.error_code.as_deref().unwrap_or("unknown"),
                caller = record.caller,
                "provider call failed"
            ),
        }
    }
}

/// Running totals across a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

/// Accumulates totals and forwards every record to an inner sink.
#[derive(Debug, Default)]
pub struct TallyUsageSink<S> {
    inner: S,
    calls: AtomicU64,
    failed_calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cost_nanodollars: AtomicI64,
}

impl<S: UsageSink> TallyUsageSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            cost_nanodollars: AtomicI64::new(0),
        }
    }

    pub fn totals(&self) -> UsageTotals {
        UsageTotals {
            calls: self.calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            cost_nanodollars: self.cost_nanodollars.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl<S: UsageSink> UsageSink for TallyUsageSink<S> {
    async fn record(&self, record: ProviderCallRecord) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if record.status == CallStatus::Error {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.input_tokens
            .fetch_add(record.input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(record.output_tokens as u64, Ordering::Relaxed);
        self.cost_nanodollars
            .fetch_add(record.cost_nanodollars, Ordering::Relaxed);
        self.inner.record(record).await;
    }
}
