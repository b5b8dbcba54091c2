//! Coding items and dataset helpers.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// A free-text response to be coded. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodingItem {
    response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<String>,
}

impl CodingItem {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            rating: None,
            context: None,
        }
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        if !context.trim().is_empty() {
            self.context = Some(context);
        }
        self
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn rating(&self) -> Option<f64> {
        self.rating
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Stable hash over every field, used for cache keys and traces.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.response.as_bytes());
        hasher.update(b"|");
        if let Some(r) = self.rating {
            hasher.update(r.to_string().as_bytes());
        }
        hasher.update(b"|");
        if let Some(c) = &self.context {
            hasher.update(c.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// A row pasted from a spreadsheet: the item plus any human codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PastedRow {
    pub item: CodingItem,
    #[serde(default)]
    pub human_1: Option<String>,
    #[serde(default)]
    pub human_2: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ItemsError {
    #[error("line {line}: rating {value:?} is not a number")]
    BadRating { line: usize, value: String },
    #[error("line {line}: empty response")]
    EmptyResponse { line: usize },
    #[error("cannot sample {requested} items from {available}")]
    SampleTooLarge { requested: usize, available: usize },
}

/// Parse tab-separated rows: `response[\trating[\tcontext[\thuman_1[\thuman_2]]]]`.
///
/// Blank lines are skipped. Empty optional columns are treated as absent.
pub fn parse_pasted_rows(text: &str) -> Result<Vec<PastedRow>, ItemsError> {
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut cols = line.split('\t').map(str::trim);
        let response = cols.next().unwrap_or_default();
        if response.is_empty() {
            return Err(ItemsError::EmptyResponse { line: line_no });
        }
        let mut item = CodingItem::new(response);

        if let Some(raw) = cols.next().filter(|s| !s.is_empty()) {
            let rating: f64 = raw.parse().map_err(|_| ItemsError::BadRating {
                line: line_no,
                value: raw.to_string(),
            })?;
            item = item.with_rating(rating);
        }
        if let Some(ctx) = cols.next().filter(|s| !s.is_empty()) {
            item = item.with_context(ctx);
        }
        let human_1 = cols.next().filter(|s| !s.is_empty()).map(String::from);
        let human_2 = cols.next().filter(|s| !s.is_empty()).map(String::from);

        rows.push(PastedRow {
            item,
            human_1,
            human_2,
        });
    }
    Ok(rows)
}

/// Indices of a seeded random subsample of size `n`, in ascending order.
pub fn sample_indices(available: usize, n: usize, seed: u64) -> Result<Vec<usize>, ItemsError> {
    if n > available {
        return Err(ItemsError::SampleTooLarge {
            requested: n,
            available,
        });
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = sample(&mut rng, available, n).into_vec();
    picked.sort_unstable();
    Ok(picked)
}

/// Draw a reproducible reliability subsample, preserving dataset order.
pub fn sample_items<T: Clone>(items: &[T], n: usize, seed: u64) -> Result<Vec<T>, ItemsError> {
    Ok(sample_indices(items.len(), n, seed)?
        .into_iter()
        .map(|i| items[i].clone())
        .collect())
}
