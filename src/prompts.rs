//! Prompt templates for item coding and protocol refinement.
//!
//! Templates are plain strings with `{name}` placeholders. Rendering is
//! provider-agnostic; the result converts to gateway messages.

use crate::codebook::{CategoryGroup, Codebook};
use crate::gateway::Message;
use crate::items::CodingItem;

// =============================================================================
// Prompt instances
// =============================================================================

/// Rendered prompt ready for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

// =============================================================================
// Templates
// =============================================================================

/// A prompt template with `{placeholder}` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Substitute every `{key}` in both messages. Substituted values are
    /// inserted verbatim and never scanned for further placeholders.
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: fill_placeholders(self.system, vars),
            user: fill_placeholders(self.user, vars),
        }
    }

    /// Hash of the template text. Part of every cache key, so editing a
    /// template invalidates its cached codings.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.slug.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.system.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.user.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Code one item against the protocol.
pub const CODING_V1: PromptTemplate = PromptTemplate {
    slug: "coding_v1",
    system: r#"You are a qualitative content coder. Apply the coding protocol below to a single survey response and assign exactly one category.

Coding protocol:
{protocol}

Categories:
{categories}

Reply with the code of the single best category in the form digit.digit (for example 1.1), followed by at most one sentence of justification. If no category applies, reply 0.0."#,
    user: r#"{item}

Code:"#,
};

/// Terse variant for models that over-explain.
pub const CODING_V2: PromptTemplate = PromptTemplate {
    slug: "coding_v2",
    system: r#"Qualitative coder. Protocol:
{protocol}

Categories:
{categories}

Output only one code (d.d). Use 0.0 when nothing applies."#,
    user: r#"{item}

Code:"#,
};

/// One collaborative drafting round of the codebook.
pub const REFINE_V1: PromptTemplate = PromptTemplate {
    slug: "refine_v1",
    system: r#"You are an expert academic researcher. Your goal is to help develop a codebook for qualitative content coding."#,
    user: r#"Framework: {framework}
Current codebook:
{current}

User instruction: {instruction}

Output a formal codebook including, for every category:
1. Category name
2. Definition
3. Inclusion/exclusion criteria
4. A prototypical example"#,
};

pub const CODING_PROMPTS: &[PromptTemplate] = &[CODING_V1, CODING_V2];
pub const DEFAULT_CODING_PROMPT: PromptTemplate = CODING_V1;

/// Look up a coding template. Refinement templates are not coding templates.
pub fn prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    CODING_PROMPTS.iter().find(|t| t.slug == slug).copied()
}

fn fill_placeholders(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (close, *value))
        });
        match value {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

// =============================================================================
// Rendering helpers
// =============================================================================

/// Item block: literal `Context:`, `Ranking:` and `Response:` labels, with
/// absent optional fields left out.
pub fn item_block(item: &CodingItem) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(ctx) = item.context() {
        parts.push(format!("Context: {}", ctx.trim()));
    }
    if let Some(rating) = item.rating() {
        parts.push(format!("Ranking: {rating}"));
    }
    parts.push(format!("Response: {}", item.response().trim()));
    parts.join("\n")
}

pub fn render_coding(
    template: PromptTemplate,
    protocol: &str,
    codebook: &Codebook,
    item: &CodingItem,
) -> PromptInstance {
    let categories = codebook.render_for_prompt();
    let item = item_block(item);
    template.render(&[
        ("protocol", protocol.trim()),
        ("categories", categories.trim_end()),
        ("item", &item),
    ])
}

/// One-line framework summary, e.g.
/// `12 categories (Trustor-related, Trustee-related, Context-related)`.
pub fn framework_summary(codebook: &Codebook) -> String {
    let groups: Vec<&'static str> = CategoryGroup::FRAMEWORK_ORDER
        .iter()
        .filter(|group| codebook.entries.iter().any(|e| e.group == **group))
        .map(|group| group.label())
        .collect();
    format!("{} categories ({})", codebook.entries.len(), groups.join(", "))
}

pub fn render_refinement(
    codebook: &Codebook,
    current_protocol: &str,
    instruction: &str,
) -> PromptInstance {
    let framework = framework_summary(codebook);
    REFINE_V1.render(&[
        ("framework", &framework),
        ("current", current_protocol.trim()),
        ("instruction", instruction.trim()),
    ])
}

// =============================================================================
// TESTS
// =============================================================================
