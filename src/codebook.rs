//! Category identifiers and the canonical codebook.
//!
//! A category is a stable two-digit identifier (`major.minor`, e.g. `2.3`).
//! Display labels drift between protocol drafts, so the codebook keeps one
//! canonical label per identifier plus any number of label variants, and
//! every lookup resolves back to the numeric identifier.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Category
// =============================================================================

/// A categorical code of the form `d.d`.
///
/// Any pair of decimal digits is representable; membership in a codebook is a
/// separate question answered by [`Codebook::contains`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Category {
    major: u8,
    minor: u8,
}

impl Category {
    /// Reserved code meaning "uncodable or unresolved".
    pub const UNCODABLE: Category = Category { major: 0, minor: 0 };

    pub fn new(major: u8, minor: u8) -> Result<Self, CategoryError> {
        if major > 9 || minor > 9 {
            return Err(CategoryError::DigitOutOfRange { major, minor });
        }
        Ok(Self { major, minor })
    }

    const fn known(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u8 {
        self.major
    }

    pub fn minor(&self) -> u8 {
        self.minor
    }

    pub fn is_uncodable(&self) -> bool {
        *self == Self::UNCODABLE
    }

    /// Numeric value used by statistical packages (`2.3` -> 2.3).
    pub fn as_f64(&self) -> f64 {
        self.major as f64 + self.minor as f64 / 10.0
    }
}

impl Default for Category {
    fn default() -> Self {
        Self::UNCODABLE
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Category {
    type Err = CategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bytes = trimmed.as_bytes();
        match bytes {
            [m, b'.', n] if m.is_ascii_digit() && n.is_ascii_digit() => {
                Ok(Self::known(m - b'0', n - b'0'))
            }
            _ => Err(CategoryError::Malformed(trimmed.to_string())),
        }
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CategoryError {
    #[error("malformed category {0:?}: expected a code like 1.1")]
    Malformed(String),
    #[error("category digits out of range: {major}.{minor}")]
    DigitOutOfRange { major: u8, minor: u8 },
    #[error("duplicate category {0} in codebook")]
    DuplicateCategory(Category),
    #[error("category 0.0 is reserved for uncodable responses")]
    ReservedSentinel,
    #[error("codebook has no categories")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid codebook json: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// Groups
// =============================================================================

/// Top-level grouping of the trust framework. Presentational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryGroup {
    Trustor,
    Trustee,
    Context,
    Uncodable,
}

impl CategoryGroup {
    /// Order in which the framework presents its groups.
    pub const FRAMEWORK_ORDER: [CategoryGroup; 4] = [
        CategoryGroup::Trustor,
        CategoryGroup::Trustee,
        CategoryGroup::Context,
        CategoryGroup::Uncodable,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            CategoryGroup::Trustor => "Trustor-related",
            CategoryGroup::Trustee => "Trustee-related",
            CategoryGroup::Context => "Context-related",
            CategoryGroup::Uncodable => "Uncodable",
        }
    }
}

// =============================================================================
// Codebook
// =============================================================================

/// One row of the canonical enumeration-to-label table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodebookEntry {
    pub category: Category,
    pub group: CategoryGroup,
    pub label: String,
    /// Alternative display labels seen in earlier protocol drafts.
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl CodebookEntry {
    fn new(
        category: Category,
        group: CategoryGroup,
        label: &str,
        variants: &[&str],
        description: &str,
    ) -> Self {
        Self {
            category,
            group,
            label: label.to_string(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
            description: Some(description.to_string()),
        }
    }

    fn matches_label(&self, needle: &str) -> bool {
        self.label.eq_ignore_ascii_case(needle)
            || self.variants.iter().any(|v| v.eq_ignore_ascii_case(needle))
    }
}

/// How a human-entered code was interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HumanCodeStatus {
    /// Resolved to a codebook category (by identifier or label).
    Valid,
    /// Nothing was entered; recorded as uncodable.
    Blank,
    /// Input did not resolve; recorded as uncodable.
    Invalid { input: String },
}

/// Fixed, closed category enumeration plus the uncodable sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Codebook {
    pub name: String,
    pub entries: Vec<CodebookEntry>,
    #[serde(default = "default_uncodable_label")]
    pub uncodable_label: String,
}

fn default_uncodable_label() -> String {
    "Uncodable / missing".to_string()
}

impl Default for Codebook {
    fn default() -> Self {
        Self::trust_framework()
    }
}

impl Codebook {
    /// Build a codebook, rejecting duplicates and entries that reuse `0.0`.
    pub fn new(
        name: impl Into<String>,
        entries: Vec<CodebookEntry>,
    ) -> Result<Self, CategoryError> {
        let codebook = Self {
            name: name.into(),
            entries,
            uncodable_label: default_uncodable_label(),
        };
        codebook.validate()?;
        Ok(codebook)
    }

    /// The twelve-category trust framework.
    pub fn trust_framework() -> Self {
        use CategoryGroup::*;
        let c = Category::known;
        let entries = vec![
            CodebookEntry::new(
                c(1, 1),
                Trustee,
                "Competence",
                &["Ability", "Skill", "Expertise"],
                "The trustee is judged capable of doing what is expected.",
            ),
            CodebookEntry::new(
                c(1, 2),
                Trustee,
                "Benevolence",
                &["Goodwill", "Care"],
                "The trustee is believed to act in the trustor's interest.",
            ),
            CodebookEntry::new(
                c(1, 3),
                Trustee,
                "Integrity",
                &["Honesty", "Principles"],
                "The trustee is believed to keep promises and tell the truth.",
            ),
            CodebookEntry::new(
                c(1, 4),
                Trustee,
                "Predictability",
                &["Consistency", "Reliability"],
                "The trustee behaves consistently over time.",
            ),
            CodebookEntry::new(
                c(2, 1),
                Trustor,
                "Propensity to trust",
                &["Disposition to trust", "Trust propensity"],
                "A general willingness of the respondent to trust others.",
            ),
            CodebookEntry::new(
                c(2, 2),
                Trustor,
                "Prior experience",
                &["Past experience", "Experience"],
                "Trust grounded in the respondent's own history with the trustee.",
            ),
            CodebookEntry::new(
                c(2, 3),
                Trustor,
                "Perceived vulnerability",
                &["Risk perception", "Vulnerability"],
                "The respondent's sense of what they stand to lose.",
            ),
            CodebookEntry::new(
                c(2, 4),
                Trustor,
                "Dependence",
                &["Reliance", "Need"],
                "The respondent has no practical alternative to trusting.",
            ),
            CodebookEntry::new(
                c(3, 1),
                Context,
                "Institutional safeguards",
                &["Regulation", "Structural assurance"],
                "Rules, contracts or institutions that back the relationship.",
            ),
            CodebookEntry::new(
                c(3, 2),
                Context,
                "Reputation and social norms",
                &["Reputation", "Social proof"],
                "What others say or expect shapes the judgement.",
            ),
            CodebookEntry::new(
                c(3, 3),
                Context,
                "Situational risk",
                &["Stakes", "Uncertainty"],
                "Features of the situation raise or lower the stakes.",
            ),
            CodebookEntry::new(
                c(3, 4),
                Context,
                "Communication and transparency",
                &["Transparency", "Openness"],
                "Information sharing between the parties.",
            ),
        ];
        Self {
            name: "trust_framework_v1".to_string(),
            entries,
            uncodable_label: default_uncodable_label(),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CategoryError> {
        let codebook: Codebook = serde_json::from_str(raw)?;
        codebook.validate()?;
        Ok(codebook)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CategoryError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    fn validate(&self) -> Result<(), CategoryError> {
        if self.entries.is_empty() {
            return Err(CategoryError::Empty);
        }
        let mut seen = BTreeSet::new();
        for entry in &self.entries {
            if entry.category.is_uncodable() {
                return Err(CategoryError::ReservedSentinel);
            }
            if !seen.insert(entry.category) {
                return Err(CategoryError::DuplicateCategory(entry.category));
            }
        }
        Ok(())
    }

    /// Codebook categories, excluding the sentinel, in declaration order.
    pub fn categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.entries.iter().map(|e| e.category)
    }

    /// Membership test. The sentinel is always a member.
    pub fn contains(&self, category: Category) -> bool {
        category.is_uncodable() || self.entry(category).is_some()
    }

    pub fn entry(&self, category: Category) -> Option<&CodebookEntry> {
        self.entries.iter().find(|e| e.category == category)
    }

    pub fn label(&self, category: Category) -> Option<&str> {
        if category.is_uncodable() {
            return Some(&self.uncodable_label);
        }
        self.entry(category).map(|e| e.label.as_str())
    }

    pub fn group(&self, category: Category) -> Option<CategoryGroup> {
        if category.is_uncodable() {
            return Some(CategoryGroup::Uncodable);
        }
        self.entry(category).map(|e| e.group)
    }

    /// Resolve a code or any label variant to a member category.
    pub fn resolve(&self, input: &str) -> Option<Category> {
        let needle = input.trim();
        if needle.is_empty() {
            return None;
        }
        if let Ok(category) = needle.parse::<Category>() {
            return self.contains(category).then_some(category);
        }
        if needle.eq_ignore_ascii_case(&self.uncodable_label)
            || needle.eq_ignore_ascii_case("uncodable")
            || needle.eq_ignore_ascii_case("missing")
        {
            return Some(Category::UNCODABLE);
        }
        self.entries
            .iter()
            .find(|e| e.matches_label(needle))
            .map(|e| e.category)
    }

    /// Interpret a human-entered code; anything unresolvable becomes `0.0`.
    pub fn normalize_human(&self, input: &str) -> (Category, HumanCodeStatus) {
        if input.trim().is_empty() {
            return (Category::UNCODABLE, HumanCodeStatus::Blank);
        }
        match self.resolve(input) {
            Some(category) => (category, HumanCodeStatus::Valid),
            None => (
                Category::UNCODABLE,
                HumanCodeStatus::Invalid {
                    input: input.trim().to_string(),
                },
            ),
        }
    }

    /// Category list for inclusion in prompts, grouped by top-level group.
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::new();
        let mut current: Option<CategoryGroup> = None;
        for entry in &self.entries {
            if current != Some(entry.group) {
                if current.is_some() {
                    out.push('\n');
                }
                out.push_str(&format!("{}:\n", entry.group.label()));
                current = Some(entry.group);
            }
            out.push_str(&format!("  {} {}", entry.category, entry.label));
            if let Some(desc) = &entry.description {
                out.push_str(&format!(" - {desc}"));
            }
            out.push('\n');
        }
        out.push_str(&format!("\n{} {}\n", Category::UNCODABLE, self.uncodable_label));
        out
    }
}
