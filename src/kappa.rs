//! Chance-corrected inter-rater agreement.
//!
//! Two raters are scored with Cohen's kappa, three or more with Fleiss'
//! kappa. All counting is done in integers so the statistic is exactly
//! invariant under row permutation, and the zero-variance case (every rating
//! is the same single category) is detected exactly and reported as kappa = 1.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use statrs::function::erf::erf_inv;

use crate::codebook::Category;

// =============================================================================
// Raters and tables
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Rater {
    #[serde(rename = "human_1")]
    Human1,
    #[serde(rename = "human_2")]
    Human2,
    #[serde(rename = "model")]
    Model,
}

impl Rater {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rater::Human1 => "human_1",
            Rater::Human2 => "human_2",
            Rater::Model => "model",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Rater::Human1 => "Human-1",
            Rater::Human2 => "Human-2",
            Rater::Model => "Model",
        }
    }
}

/// One row per item, one column per rater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingTable {
    pub raters: Vec<Rater>,
    pub rows: Vec<Vec<Category>>,
}

impl RatingTable {
    pub fn new(raters: Vec<Rater>) -> Self {
        Self {
            raters,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(raters: Vec<Rater>, rows: Vec<Vec<Category>>) -> Result<Self, ScoreError> {
        let table = Self { raters, rows };
        table.validate()?;
        Ok(table)
    }

    pub fn push_row(&mut self, row: Vec<Category>) -> Result<(), ScoreError> {
        if row.len() != self.raters.len() {
            return Err(ScoreError::RaggedRow {
                row: self.rows.len(),
                expected: self.raters.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn n_items(&self) -> usize {
        self.rows.len()
    }

    pub fn column(&self, index: usize) -> Vec<Category> {
        self.rows.iter().map(|row| row[index]).collect()
    }

    pub fn rater_index(&self, rater: Rater) -> Option<usize> {
        self.raters.iter().position(|r| *r == rater)
    }

    pub fn validate(&self) -> Result<(), ScoreError> {
        if self.raters.len() < 2 {
            return Err(ScoreError::TooFewRaters(self.raters.len()));
        }
        if self.rows.is_empty() {
            return Err(ScoreError::NoItems);
        }
        for (idx, row) in self.rows.iter().enumerate() {
            if row.len() != self.raters.len() {
                return Err(ScoreError::RaggedRow {
                    row: idx,
                    expected: self.raters.len(),
                    found: row.len(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreError {
    #[error("at least two raters are required, got {0}")]
    TooFewRaters(usize),
    #[error("no items to score")]
    NoItems,
    #[error("row {row} has {found} ratings, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("rater columns differ in length: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
}

// =============================================================================
// Scores
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KappaMethod {
    Cohen,
    Fleiss,
}

impl KappaMethod {
    pub fn label(&self) -> &'static str {
        match self {
            KappaMethod::Cohen => "Cohen's kappa",
            KappaMethod::Fleiss => "Fleiss' kappa",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub standard_error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementScore {
    pub method: KappaMethod,
    pub kappa: f64,
    pub observed_agreement: f64,
    pub expected_agreement: f64,
    pub n_items: usize,
    pub n_raters: usize,
    /// Every rating was the same single category; kappa is 1 by convention.
    pub degenerate: bool,
    /// Approximate 95% interval (Cohen only, absent when degenerate).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci95: Option<ConfidenceInterval>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseAgreement {
    pub a: Rater,
    pub b: Rater,
    pub score: AgreementScore,
}

/// Score a table: Cohen's kappa for two raters, Fleiss' kappa for more.
pub fn score(table: &RatingTable) -> Result<AgreementScore, ScoreError> {
    table.validate()?;
    if table.raters.len() == 2 {
        cohen_kappa(&table.column(0), &table.column(1))
    } else {
        fleiss_kappa(&table.rows)
    }
}

/// Cohen's kappa for two parallel rating columns.
pub fn cohen_kappa(a: &[Category], b: &[Category]) -> Result<AgreementScore, ScoreError> {
    if a.len() != b.len() {
        return Err(ScoreError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if a.is_empty() {
        return Err(ScoreError::NoItems);
    }
    let n = a.len();

    let mut marginals: BTreeMap<Category, (u64, u64)> = BTreeMap::new();
    let mut agreements: u64 = 0;
    for (x, y) in a.iter().zip(b) {
        marginals.entry(*x).or_default().0 += 1;
        marginals.entry(*y).or_default().1 += 1;
        if x == y {
            agreements += 1;
        }
    }

    let n_sq = (n as u64) * (n as u64);
    let chance_pairs: u64 = marginals.values().map(|(ca, cb)| ca * cb).sum();

    let po = agreements as f64 / n as f64;
    let pe = chance_pairs as f64 / n_sq as f64;

    if chance_pairs == n_sq {
        return Ok(degenerate_score(KappaMethod::Cohen, po, n, 2));
    }

    let kappa = (po - pe) / (1.0 - pe);
    let se = (po * (1.0 - po) / (n as f64 * (1.0 - pe).powi(2))).sqrt();
    let z = z_95();
    Ok(AgreementScore {
        method: KappaMethod::Cohen,
        kappa,
        observed_agreement: po,
        expected_agreement: pe,
        n_items: n,
        n_raters: 2,
        degenerate: false,
        ci95: Some(ConfidenceInterval {
            lower: (kappa - z * se).max(-1.0),
            upper: (kappa + z * se).min(1.0),
            standard_error: se,
        }),
    })
}

/// Fleiss' kappa over rows holding one category per rater.
pub fn fleiss_kappa(rows: &[Vec<Category>]) -> Result<AgreementScore, ScoreError> {
    let Some(first) = rows.first() else {
        return Err(ScoreError::NoItems);
    };
    let n_raters = first.len();
    if n_raters < 2 {
        return Err(ScoreError::TooFewRaters(n_raters));
    }

    let mut totals: BTreeMap<Category, u64> = BTreeMap::new();
    let mut agreeing_pairs: u64 = 0;
    for (idx, row) in rows.iter().enumerate() {
        if row.len() != n_raters {
            return Err(ScoreError::RaggedRow {
                row: idx,
                expected: n_raters,
                found: row.len(),
            });
        }
        let mut counts: BTreeMap<Category, u64> = BTreeMap::new();
        for category in row {
            *counts.entry(*category).or_default() += 1;
        }
        for (category, count) in counts {
            agreeing_pairs += count * (count - 1);
            *totals.entry(category).or_default() += count;
        }
    }

    let n_items = rows.len() as u64;
    let m = n_raters as u64;
    let total_ratings = n_items * m;
    let total_sq = total_ratings * total_ratings;
    let chance_sq: u64 = totals.values().map(|t| t * t).sum();

    let p_bar = agreeing_pairs as f64 / (n_items * m * (m - 1)) as f64;
    let pe = chance_sq as f64 / total_sq as f64;

    if chance_sq == total_sq {
        return Ok(degenerate_score(KappaMethod::Fleiss, p_bar, rows.len(), n_raters));
    }

    Ok(AgreementScore {
        method: KappaMethod::Fleiss,
        kappa: (p_bar - pe) / (1.0 - pe),
        observed_agreement: p_bar,
        expected_agreement: pe,
        n_items: rows.len(),
        n_raters,
        degenerate: false,
        ci95: None,
    })
}

/// Cohen's kappa for every pair of raters in the table.
pub fn pairwise_agreements(table: &RatingTable) -> Result<Vec<PairwiseAgreement>, ScoreError> {
    table.validate()?;
    let mut out = Vec::new();
    for i in 0..table.raters.len() {
        for j in (i + 1)..table.raters.len() {
            out.push(PairwiseAgreement {
                a: table.raters[i],
                b: table.raters[j],
                score: cohen_kappa(&table.column(i), &table.column(j))?,
            });
        }
    }
    Ok(out)
}

fn degenerate_score(
    method: KappaMethod,
    observed: f64,
    n_items: usize,
    n_raters: usize,
) -> AgreementScore {
    AgreementScore {
        method,
        kappa: 1.0,
        observed_agreement: observed,
        expected_agreement: 1.0,
        n_items,
        n_raters,
        degenerate: true,
        ci95: None,
    }
}

fn z_95() -> f64 {
    std::f64::consts::SQRT_2 * erf_inv(0.95)
}

// =============================================================================
// Confusion matrix
// =============================================================================

/// Cross-tabulation of two raters. Row = first rater, column = second.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub categories: Vec<Category>,
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn from_columns(a: &[Category], b: &[Category]) -> Result<Self, ScoreError> {
        if a.len() != b.len() {
            return Err(ScoreError::LengthMismatch {
                left: a.len(),
                right: b.len(),
            });
        }
        let mut categories: Vec<Category> = a.iter().chain(b).copied().collect();
        categories.sort();
        categories.dedup();

        let k = categories.len();
        let mut counts = vec![vec![0usize; k]; k];
        for (x, y) in a.iter().zip(b) {
            // Both are present by construction.
            let i = categories.binary_search(x).unwrap_or_default();
            let j = categories.binary_search(y).unwrap_or_default();
            counts[i][j] += 1;
        }
        Ok(Self { categories, counts })
    }

    pub fn agreements(&self) -> usize {
        (0..self.categories.len()).map(|i| self.counts[i][i]).sum()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cats(codes: &[&str]) -> Vec<Category> {
        codes.iter().map(|c| c.parse().unwrap()).collect()
    }

    #[test]
    fn cohen_textbook_example() {
        // 20 agree on 1.1, 15 agree on 1.2, 5 (1.1,1.2), 10 (1.2,1.1).
        let mut a = Vec::new();
        let mut b = Vec::new();
        for (x, y, n) in [
            ("1.1", "1.1", 20),
            ("1.1", "1.2", 5),
            ("1.2", "1.1", 10),
            ("1.2", "1.2", 15),
        ] {
            for _ in 0..n {
                a.push(x.parse().unwrap());
                b.push(y.parse().unwrap());
            }
        }
        let s = cohen_kappa(&a, &b).unwrap();
        assert!((s.observed_agreement - 0.7).abs() < 1e-12);
        assert!((s.expected_agreement - 0.5).abs() < 1e-12);
        assert!((s.kappa - 0.4).abs() < 1e-12);
        let ci = s.ci95.unwrap();
        assert!(ci.lower < 0.4 && ci.upper > 0.4);
    }

    #[test]
    fn cohen_zero_variance_is_one() {
        let a = cats(&["2.1", "2.1", "2.1"]);
        let s = cohen_kappa(&a, &a).unwrap();
        assert_eq!(s.kappa, 1.0);
        assert!(s.degenerate);
        assert!(s.ci95.is_none());
    }

    #[test]
    fn cohen_disjoint_constant_raters_is_zero() {
        let a = cats(&["1.1", "1.1", "1.1"]);
        let b = cats(&["0.0", "0.0", "0.0"]);
        let s = cohen_kappa(&a, &b).unwrap();
        assert!(!s.degenerate);
        assert_eq!(s.kappa, 0.0);
    }

    #[test]
    fn cohen_rejects_mismatched_lengths() {
        let err = cohen_kappa(&cats(&["1.1"]), &cats(&["1.1", "1.2"])).unwrap_err();
        assert_eq!(err, ScoreError::LengthMismatch { left: 1, right: 2 });
    }

    #[test]
    fn fleiss_small_hand_computed() {
        let rows = vec![
            cats(&["1.1", "1.1", "1.1"]),
            cats(&["1.1", "1.1", "1.2"]),
            cats(&["1.2", "1.2", "1.2"]),
            cats(&["1.2", "1.2", "1.2"]),
        ];
        let s = fleiss_kappa(&rows).unwrap();
        assert!((s.kappa - 23.0 / 35.0).abs() < 1e-12, "got {}", s.kappa);
        assert_eq!(s.n_raters, 3);
    }

    #[test]
    fn fleiss_zero_variance_is_one() {
        let rows = vec![cats(&["3.3", "3.3", "3.3"]); 4];
        let s = fleiss_kappa(&rows).unwrap();
        assert_eq!(s.kappa, 1.0);
        assert!(s.degenerate);
    }

    #[test]
    fn score_dispatches_on_rater_count() {
        let two = RatingTable::with_rows(
            vec![Rater::Human1, Rater::Model],
            vec![cats(&["1.1", "1.1"]), cats(&["1.2", "1.3"])],
        )
        .unwrap();
        assert_eq!(score(&two).unwrap().method, KappaMethod::Cohen);

        let three = RatingTable::with_rows(
            vec![Rater::Human1, Rater::Human2, Rater::Model],
            vec![cats(&["1.1", "1.1", "1.1"]), cats(&["1.2", "1.3", "1.2"])],
        )
        .unwrap();
        assert_eq!(score(&three).unwrap().method, KappaMethod::Fleiss);
    }

    #[test]
    fn table_validation_errors() {
        assert_eq!(
            RatingTable::with_rows(vec![Rater::Model], vec![cats(&["1.1"])]).unwrap_err(),
            ScoreError::TooFewRaters(1)
        );
        assert_eq!(
            RatingTable::with_rows(vec![Rater::Human1, Rater::Model], vec![]).unwrap_err(),
            ScoreError::NoItems
        );
        let mut t = RatingTable::new(vec![Rater::Human1, Rater::Model]);
        assert!(t.push_row(cats(&["1.1"])).is_err());
    }

    #[test]
    fn pairwise_covers_every_pair() {
        let table = RatingTable::with_rows(
            vec![Rater::Human1, Rater::Human2, Rater::Model],
            vec![cats(&["1.1", "1.1", "1.2"]), cats(&["2.1", "2.1", "2.1"])],
        )
        .unwrap();
        let pairs = pairwise_agreements(&table).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!((pairs[0].a, pairs[0].b), (Rater::Human1, Rater::Human2));
        assert_eq!(pairs[0].score.kappa, 1.0);
    }

    #[test]
    fn confusion_matrix_counts() {
        let a = cats(&["1.1", "1.2", "1.1"]);
        let b = cats(&["1.1", "1.1", "0.0"]);
        let m = ConfusionMatrix::from_columns(&a, &b).unwrap();
        assert_eq!(m.categories, cats(&["0.0", "1.1", "1.2"]));
        assert_eq!(m.total(), 3);
        assert_eq!(m.agreements(), 1);
        assert_eq!(m.counts[1][0], 1);
    }

    #[test]
    fn z_value_is_standard() {
        assert!((z_95() - 1.959964).abs() < 1e-5);
    }
}
