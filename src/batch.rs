//! Apply the protocol to a full dataset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::codebook::{Category, Codebook};
use crate::coding::{code_items, CodingOptions, ItemOutcome, RunContext, RunUsage};
use crate::items::CodingItem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<CodingItem>,
    #[serde(default)]
    pub options: CodingOptions,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    8
}

impl BatchRequest {
    pub fn new(items: Vec<CodingItem>) -> Self {
        Self {
            items,
            options: CodingOptions::default(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch has no items")]
    NoItems,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRow {
    pub index: usize,
    pub item: CodingItem,
    pub category: Category,
    pub outcome: ItemOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: Category,
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub template_slug: String,
    pub protocol_version: u32,
    pub protocol_hash: String,
    pub codebook_name: String,
    pub rows: Vec<BatchRow>,
    /// Every codebook category plus the sentinel, in codebook order, zero
    /// counts included.
    pub distribution: Vec<CategoryCount>,
    pub usage: RunUsage,
}

impl BatchResult {
    /// Rows whose model call never produced an answer.
    pub fn failed_rows(&self) -> impl Iterator<Item = &BatchRow> {
        self.rows.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn count_for(&self, category: Category) -> usize {
        self.distribution
            .iter()
            .find(|c| c.category == category)
            .map_or(0, |c| c.count)
    }
}

pub async fn run_batch(
    ctx: &RunContext<'_>,
    request: &BatchRequest,
) -> Result<BatchResult, BatchError> {
    if request.items.is_empty() {
        return Err(BatchError::NoItems);
    }
    let run_id = Uuid::new_v4();
    info!(
        %run_id,
        items = request.items.len(),
        model = %request.options.model,
        protocol_version = ctx.protocol.version,
        "starting batch run"
    );

    let coded = code_items(
        ctx,
        &request.options,
        &request.items,
        request.concurrency,
        run_id,
        "batch",
    )
    .await;
    let usage = RunUsage::from_items(&coded);

    let rows: Vec<BatchRow> = request
        .items
        .iter()
        .zip(coded)
        .map(|(item, coded)| BatchRow {
            index: coded.index,
            item: item.clone(),
            category: coded.category,
            outcome: coded.outcome,
            raw_response: coded.raw_response,
        })
        .collect();

    let distribution = category_distribution(ctx.codebook, rows.iter().map(|r| r.category));
    let result = BatchResult {
        run_id,
        created_at: Utc::now(),
        model: request.options.model.clone(),
        template_slug: request.options.template().slug.to_string(),
        protocol_version: ctx.protocol.version,
        protocol_hash: ctx.protocol.content_hash(),
        codebook_name: ctx.codebook.name.clone(),
        rows,
        distribution,
        usage,
    };

    info!(
        %run_id,
        failed = result.failed_rows().count(),
        uncodable = result.count_for(Category::UNCODABLE),
        "batch run finished"
    );
    Ok(result)
}

/// Count codes per category; the sentinel comes last.
pub fn category_distribution(
    codebook: &Codebook,
    codes: impl IntoIterator<Item = Category>,
) -> Vec<CategoryCount> {
    let mut counts: Vec<CategoryCount> = codebook
        .categories()
        .chain(std::iter::once(Category::UNCODABLE))
        .map(|category| CategoryCount {
            category,
            label: codebook.label(category).unwrap_or_default().to_string(),
            count: 0,
        })
        .collect();
    for code in codes {
        if let Some(slot) = counts.iter_mut().find(|c| c.category == code) {
            slot.count += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_includes_zero_counts_and_sentinel() {
        let codebook = Codebook::trust_framework();
        let codes = ["1.1", "1.1", "3.4", "0.0"]
            .iter()
            .map(|c| c.parse::<Category>().unwrap());
        let dist = category_distribution(&codebook, codes);
        assert_eq!(dist.len(), 13);
        assert_eq!(dist[0].count, 2);
        assert_eq!(dist[0].label, "Competence");
        assert_eq!(dist.last().map(|c| c.category), Some(Category::UNCODABLE));
        assert_eq!(dist.iter().map(|c| c.count).sum::<usize>(), 4);
    }
}
