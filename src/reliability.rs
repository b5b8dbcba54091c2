//! Reliability test: human codes versus model codes on a small item set.
//!
//! Builds the rating table (Human-1, optional Human-2, Model), scores it,
//! and maps kappa to a recommendation. The live path codes items through
//! the gateway; `score_collected` rebuilds the same report from model
//! outputs that were gathered earlier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::codebook::{Category, Codebook, HumanCodeStatus};
use crate::coding::{code_items, CodedItem, CodingOptions, ItemOutcome, RunContext, RunUsage};
use crate::extract::extract_with_codebook;
use crate::items::CodingItem;
use crate::kappa::{
    pairwise_agreements, score, AgreementScore, ConfusionMatrix, PairwiseAgreement, Rater,
    RatingTable, ScoreError,
};
use crate::recommend::{recommend, Recommendation};

// =============================================================================
// Requests
// =============================================================================

/// One test item with the human codes as entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityItem {
    pub item: CodingItem,
    pub human_1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_2: Option<String>,
}

impl ReliabilityItem {
    pub fn new(item: CodingItem, human_1: impl Into<String>) -> Self {
        Self {
            item,
            human_1: human_1.into(),
            human_2: None,
        }
    }

    pub fn with_second_coder(mut self, human_2: impl Into<String>) -> Self {
        self.human_2 = Some(human_2.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityRequest {
    pub items: Vec<ReliabilityItem>,
    #[serde(default)]
    pub options: CodingOptions,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

impl ReliabilityRequest {
    pub fn new(items: Vec<ReliabilityItem>) -> Self {
        Self {
            items,
            options: CodingOptions::default(),
            concurrency: default_concurrency(),
        }
    }
}

/// Previously collected model output for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedRow {
    #[serde(flatten)]
    pub human: ReliabilityItem,
    pub model_output: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ReliabilityError {
    #[error("no items to score")]
    NoItems,
    #[error("item {index} has no second human code but others do")]
    MissingSecondCoder { index: usize },
    #[error("scoring failed: {0}")]
    Score(#[from] ScoreError),
}

// =============================================================================
// Report
// =============================================================================

/// One row of the assignment table with how each cell was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityRow {
    pub index: usize,
    pub item: CodingItem,
    pub human_1: Category,
    pub human_1_status: HumanCodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_2: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_2_status: Option<HumanCodeStatus>,
    pub model: Category,
    pub outcome: ItemOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ReliabilityRow {
    pub fn all_agree(&self) -> bool {
        self.human_1 == self.model && self.human_2.map_or(true, |h2| h2 == self.model)
    }
}

/// Counts of everything that degraded the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityDiagnostics {
    pub coded: usize,
    pub no_pattern: usize,
    pub out_of_codebook: usize,
    pub transport_failed: usize,
    pub not_cached: usize,
    pub invalid_human_codes: usize,
    pub blank_human_codes: usize,
}

impl ReliabilityDiagnostics {
    fn tally(rows: &[ReliabilityRow]) -> Self {
        let mut d = Self::default();
        for row in rows {
            match row.outcome {
                ItemOutcome::Coded => d.coded += 1,
                ItemOutcome::NoPattern => d.no_pattern += 1,
                ItemOutcome::OutOfCodebook { .. } => d.out_of_codebook += 1,
                ItemOutcome::TransportFailed { .. } => d.transport_failed += 1,
                ItemOutcome::NotCached { .. } => d.not_cached += 1,
            }
            for status in std::iter::once(&row.human_1_status).chain(row.human_2_status.as_ref()) {
                match status {
                    HumanCodeStatus::Valid => {}
                    HumanCodeStatus::Blank => d.blank_human_codes += 1,
                    HumanCodeStatus::Invalid { .. } => d.invalid_human_codes += 1,
                }
            }
        }
        d
    }

    /// Items whose model code did not come from a clean extraction.
    pub fn degraded_items(&self) -> usize {
        self.no_pattern + self.out_of_codebook + self.transport_failed + self.not_cached
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityReport {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Absent for offline scoring of collected outputs.
    pub model: Option<String>,
    pub template_slug: Option<String>,
    pub protocol_version: Option<u32>,
    pub protocol_hash: Option<String>,
    pub codebook_name: String,
    pub agreement: AgreementScore,
    pub recommendation: Recommendation,
    pub table: RatingTable,
    pub rows: Vec<ReliabilityRow>,
    /// Cohen's kappa per rater pair; populated in three-rater mode.
    #[serde(default)]
    pub pairwise: Vec<PairwiseAgreement>,
    /// Human-1 against Model.
    pub confusion: ConfusionMatrix,
    pub diagnostics: ReliabilityDiagnostics,
    #[serde(default)]
    pub usage: RunUsage,
}

struct RunMeta {
    run_id: Uuid,
    model: Option<String>,
    template_slug: Option<String>,
    protocol_version: Option<u32>,
    protocol_hash: Option<String>,
}

// =============================================================================
// Runs
// =============================================================================

/// Code every item with the model and score agreement with the human codes.
///
/// Items are dispatched concurrently but the table keeps input order. Item
/// failures degrade the score (the model cell becomes `0.0`) and are counted
/// in the diagnostics; they never abort the run.
pub async fn run_reliability(
    ctx: &RunContext<'_>,
    request: &ReliabilityRequest,
) -> Result<ReliabilityReport, ReliabilityError> {
    check_items(&request.items)?;
    let run_id = Uuid::new_v4();
    info!(
        %run_id,
        items = request.items.len(),
        model = %request.options.model,
        protocol_version = ctx.protocol.version,
        "starting reliability run"
    );

    let items: Vec<CodingItem> = request.items.iter().map(|i| i.item.clone()).collect();
    let coded = code_items(
        ctx,
        &request.options,
        &items,
        request.concurrency,
        run_id,
        "reliability",
    )
    .await;
    let usage = RunUsage::from_items(&coded);

    let meta = RunMeta {
        run_id,
        model: Some(request.options.model.clone()),
        template_slug: Some(request.options.template().slug.to_string()),
        protocol_version: Some(ctx.protocol.version),
        protocol_hash: Some(ctx.protocol.content_hash()),
    };
    let mut report = assemble_report(ctx.codebook, &request.items, coded, meta)?;
    report.usage = usage;

    info!(
        %run_id,
        kappa = report.agreement.kappa,
        method = report.agreement.method.label(),
        recommendation = ?report.recommendation,
        degraded = report.diagnostics.degraded_items(),
        "reliability run finished"
    );
    Ok(report)
}

/// Score model outputs that were collected outside a live run.
pub fn score_collected(
    rows: &[CollectedRow],
    codebook: &Codebook,
) -> Result<ReliabilityReport, ReliabilityError> {
    let humans: Vec<ReliabilityItem> = rows.iter().map(|r| r.human.clone()).collect();
    check_items(&humans)?;

    let coded: Vec<CodedItem> = rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let extraction = extract_with_codebook(&row.model_output, codebook);
            CodedItem {
                index,
                category: extraction.category,
                outcome: ItemOutcome::from_extraction(&extraction),
                raw_response: Some(row.model_output.clone()),
                usage: Default::default(),
            }
        })
        .collect();

    let meta = RunMeta {
        run_id: Uuid::new_v4(),
        model: None,
        template_slug: None,
        protocol_version: None,
        protocol_hash: None,
    };
    assemble_report(codebook, &humans, coded, meta)
}

fn check_items(items: &[ReliabilityItem]) -> Result<(), ReliabilityError> {
    if items.is_empty() {
        return Err(ReliabilityError::NoItems);
    }
    let any_second = items.iter().any(|i| i.human_2.is_some());
    if any_second {
        if let Some(index) = items.iter().position(|i| i.human_2.is_none()) {
            return Err(ReliabilityError::MissingSecondCoder { index });
        }
    }
    Ok(())
}

fn assemble_report(
    codebook: &Codebook,
    humans: &[ReliabilityItem],
    coded: Vec<CodedItem>,
    meta: RunMeta,
) -> Result<ReliabilityReport, ReliabilityError> {
    let three_raters = humans.iter().any(|h| h.human_2.is_some());
    let raters = if three_raters {
        vec![Rater::Human1, Rater::Human2, Rater::Model]
    } else {
        vec![Rater::Human1, Rater::Model]
    };

    let mut table = RatingTable::new(raters);
    let mut rows = Vec::with_capacity(humans.len());
    for (human, model) in humans.iter().zip(coded) {
        let (human_1, human_1_status) = codebook.normalize_human(&human.human_1);
        let second = human.human_2.as_deref().map(|h| codebook.normalize_human(h));

        let mut cells = vec![human_1];
        if let Some((h2, _)) = second {
            cells.push(h2);
        }
        cells.push(model.category);
        table.push_row(cells)?;

        rows.push(ReliabilityRow {
            index: model.index,
            item: human.item.clone(),
            human_1,
            human_1_status,
            human_2: second.as_ref().map(|(c, _)| *c),
            human_2_status: second.map(|(_, s)| s),
            model: model.category,
            outcome: model.outcome,
            raw_response: model.raw_response,
        });
    }

    let agreement = score(&table)?;
    let pairwise = if three_raters {
        pairwise_agreements(&table)?
    } else {
        Vec::new()
    };
    let model_col = table.raters.len() - 1;
    let confusion = ConfusionMatrix::from_columns(&table.column(0), &table.column(model_col))?;
    let diagnostics = ReliabilityDiagnostics::tally(&rows);

    Ok(ReliabilityReport {
        run_id: meta.run_id,
        created_at: Utc::now(),
        model: meta.model,
        template_slug: meta.template_slug,
        protocol_version: meta.protocol_version,
        protocol_hash: meta.protocol_hash,
        codebook_name: codebook.name.clone(),
        recommendation: recommend(agreement.kappa),
        agreement,
        table,
        rows,
        pairwise,
        confusion,
        diagnostics,
        usage: RunUsage::default(),
    })
}

// =============================================================================
// Rendering
// =============================================================================

pub fn render_report_markdown(report: &ReliabilityReport, codebook: &Codebook) -> String {
    let a = &report.agreement;
    let mut out = String::new();
    out.push_str("# Reliability Report\n\n");
    out.push_str(&format!("- Run: `{}`\n", report.run_id));
    out.push_str(&format!("- Codebook: {}\n", report.codebook_name));
    if let Some(model) = &report.model {
        out.push_str(&format!("- Model: {model}\n"));
    }
    if let Some(version) = report.protocol_version {
        out.push_str(&format!("- Protocol version: {version}\n"));
    }
    out.push_str(&format!("- Method: {} ({} raters)\n", a.method.label(), a.n_raters));
    out.push_str(&format!("- Items: {}\n", a.n_items));
    out.push_str(&format!("- Kappa: {:.3}\n", a.kappa));
    if let Some(ci) = &a.ci95 {
        out.push_str(&format!("- 95% CI: [{:.3}, {:.3}]\n", ci.lower, ci.upper));
    }
    out.push_str(&format!(
        "- Observed/expected agreement: {:.3}/{:.3}\n",
        a.observed_agreement, a.expected_agreement
    ));
    if a.degenerate {
        out.push_str("- Every rating is the same category; kappa set to 1\n");
    }
    out.push_str(&format!(
        "\n**Recommendation:** {}\n",
        report.recommendation.message()
    ));

    let d = &report.diagnostics;
    out.push_str("\n## Diagnostics\n\n");
    out.push_str(&format!(
        "- Coded/no pattern/out of codebook: {}/{}/{}\n",
        d.coded, d.no_pattern, d.out_of_codebook
    ));
    out.push_str(&format!(
        "- Transport failures: {}\n- Not cached: {}\n",
        d.transport_failed, d.not_cached
    ));
    out.push_str(&format!(
        "- Human codes invalid/blank: {}/{}\n",
        d.invalid_human_codes, d.blank_human_codes
    ));
    if report.usage.live_calls + report.usage.cache_hits > 0 {
        out.push_str(&format!(
            "- Calls live/cached: {}/{} (cost ${:.4})\n",
            report.usage.live_calls,
            report.usage.cache_hits,
            crate::gateway::nanos_to_usd(report.usage.cost_nanodollars)
        ));
    }

    if !report.pairwise.is_empty() {
        out.push_str("\n## Pairwise\n\n");
        for pair in &report.pairwise {
            out.push_str(&format!(
                "- {} vs {}: {:.3}\n",
                pair.a.label(),
                pair.b.label(),
                pair.score.kappa
            ));
        }
    }

    out.push_str("\n## Items\n\n");
    let mut header = String::from("| # | Human-1 |");
    let mut rule = String::from("|---|---|");
    if report.table.raters.contains(&Rater::Human2) {
        header.push_str(" Human-2 |");
        rule.push_str("---|");
    }
    header.push_str(" Model | Outcome | Response |\n");
    rule.push_str("---|---|---|\n");
    out.push_str(&header);
    out.push_str(&rule);
    for row in &report.rows {
        let mut line = format!("| {} | {} |", row.index + 1, row.human_1);
        if let Some(h2) = row.human_2 {
            line.push_str(&format!(" {h2} |"));
        }
        let label = codebook.label(row.model).unwrap_or("");
        line.push_str(&format!(
            " {} {} | {} | {} |\n",
            row.model,
            label,
            row.outcome.as_str(),
            truncate_cell(row.item.response(), 60)
        ));
        out.push_str(&line);
    }

    out
}

fn truncate_cell(text: &str, max_chars: usize) -> String {
    let flat = text.replace('|', "\\|").replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
