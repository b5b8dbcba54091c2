//! Extraction of a categorical code from free-text model output.
//!
//! The model is asked to lead with a code but routinely wraps it in prose,
//! so extraction scans for the first `digit.digit` substring and never fails.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::codebook::{Category, Codebook};

// ASCII digits only: `\d` would also match non-ASCII decimal digits.
static CODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]\.[0-9]").expect("Invalid code pattern regex"));

/// Return the left-most `d.d` substring, or `0.0` when none exists.
///
/// The result is not checked against any codebook.
pub fn extract_code(raw: &str) -> Category {
    find_code(raw).unwrap_or(Category::UNCODABLE)
}

fn find_code(raw: &str) -> Option<Category> {
    CODE_PATTERN
        .find(raw)
        .and_then(|m| m.as_str().parse::<Category>().ok())
}

/// What the extractor saw in a model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionOutcome {
    /// A code was found and belongs to the codebook.
    Matched,
    /// No `d.d` substring was present.
    NoPattern,
    /// A code was found but is not a codebook member; coerced to `0.0`.
    OutOfCodebook,
}

/// Extraction result checked against a codebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    /// Category used downstream. Always a codebook member.
    pub category: Category,
    /// Raw pattern found in the text, if any.
    pub found: Option<Category>,
    pub outcome: ExtractionOutcome,
}

impl Extraction {
    pub fn is_matched(&self) -> bool {
        self.outcome == ExtractionOutcome::Matched
    }
}

/// Extract and validate against `codebook`.
///
/// Out-of-codebook codes are coerced to the sentinel and reported as
/// [`ExtractionOutcome::OutOfCodebook`] so callers can count them.
pub fn extract_with_codebook(raw: &str, codebook: &Codebook) -> Extraction {
    match find_code(raw) {
        None => Extraction {
            category: Category::UNCODABLE,
            found: None,
            outcome: ExtractionOutcome::NoPattern,
        },
        Some(found) if codebook.contains(found) => Extraction {
            category: found,
            found: Some(found),
            outcome: ExtractionOutcome::Matched,
        },
        Some(found) => Extraction {
            category: Category::UNCODABLE,
            found: Some(found),
            outcome: ExtractionOutcome::OutOfCodebook,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(s: &str) -> Category {
        s.parse().unwrap()
    }

    #[test]
    fn finds_code_in_prose() {
        assert_eq!(extract_code("Primary code: 1.1 based on competence"), cat("1.1"));
    }

    #[test]
    fn left_most_code_wins() {
        assert_eq!(extract_code("Could be 3.2, but 1.4 fits better"), cat("3.2"));
    }

    #[test]
    fn multi_digit_numbers_match_one_digit_each_side() {
        assert_eq!(extract_code("score 12.34"), cat("2.3"));
    }

    #[test]
    fn empty_and_digitless_text_is_uncodable() {
        assert_eq!(extract_code(""), Category::UNCODABLE);
        assert_eq!(extract_code("no code here."), Category::UNCODABLE);
        assert_eq!(extract_code("version 3 of 4"), Category::UNCODABLE);
    }

    #[test]
    fn non_ascii_digits_are_ignored() {
        // Arabic-Indic digits one, dot, two.
        assert_eq!(extract_code("\u{0661}.\u{0662}"), Category::UNCODABLE);
    }

    #[test]
    fn unvalidated_extraction_keeps_out_of_codebook_codes() {
        assert_eq!(extract_code("maybe 4.5?"), cat("4.5"));
    }

    #[test]
    fn validated_extraction_coerces_out_of_codebook() {
        let cb = Codebook::trust_framework();
        let ex = extract_with_codebook("maybe 4.5?", &cb);
        assert_eq!(ex.category, Category::UNCODABLE);
        assert_eq!(ex.found, Some(cat("4.5")));
        assert_eq!(ex.outcome, ExtractionOutcome::OutOfCodebook);

        let ex = extract_with_codebook("code 2.2", &cb);
        assert!(ex.is_matched());
        assert_eq!(ex.category, cat("2.2"));

        let ex = extract_with_codebook("none", &cb);
        assert_eq!(ex.outcome, ExtractionOutcome::NoPattern);
    }

    #[test]
    fn explicit_sentinel_counts_as_match() {
        let cb = Codebook::trust_framework();
        let ex = extract_with_codebook("0.0 - off topic", &cb);
        assert_eq!(ex.outcome, ExtractionOutcome::Matched);
        assert_eq!(ex.category, Category::UNCODABLE);
    }
}
