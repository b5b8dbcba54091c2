//! Translate an agreement statistic into next-step guidance.

use serde::{Deserialize, Serialize};

/// Kappa at or above this level is good enough to code the full dataset.
pub const PROCEED_THRESHOLD: f64 = 0.80;
/// Kappa at or above this level (but below [`PROCEED_THRESHOLD`]) warrants a
/// larger reliability sample before deciding.
pub const COLLECT_MORE_THRESHOLD: f64 = 0.65;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Proceed,
    CollectMore,
    RevisePrototype,
}

impl Recommendation {
    pub fn message(&self) -> &'static str {
        match self {
            Recommendation::Proceed => {
                "Agreement is strong. Proceed to code the full dataset with this protocol."
            }
            Recommendation::CollectMore => {
                "Agreement is moderate. Code more test items before committing to this protocol."
            }
            Recommendation::RevisePrototype => {
                "Agreement is weak. Revise the protocol and rerun the reliability test."
            }
        }
    }
}

/// Lower bounds are inclusive. NaN falls through to `RevisePrototype`.
pub fn recommend(kappa: f64) -> Recommendation {
    if kappa >= PROCEED_THRESHOLD {
        Recommendation::Proceed
    } else if kappa >= COLLECT_MORE_THRESHOLD {
        Recommendation::CollectMore
    } else {
        Recommendation::RevisePrototype
    }
}
