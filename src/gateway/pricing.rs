//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// OpenRouter list prices (verify periodically against the model pages).
// Gemini 1.5 Flash: $0.075/1M input, $0.30/1M output
// Gemini 2.0 Flash: $0.10/1M input, $0.40/1M output
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
// GPT-5-mini: $0.25/1M input, $2.00/1M output
// Claude 3.5 Haiku: $0.80/1M input, $4.00/1M output
const GEMINI_15_FLASH: ModelPricing = ModelPricing::new(75, 300);
const GEMINI_20_FLASH: ModelPricing = ModelPricing::new(100, 400);
const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600);
const GPT_5_MINI: ModelPricing = ModelPricing::new(250, 2_000);
const CLAUDE_35_HAIKU: ModelPricing = ModelPricing::new(800, 4_000);

/// Used for models missing from the registry.
const UNKNOWN_MODEL: ModelPricing = ModelPricing::new(1_000, 5_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();
    map.insert("google/gemini-flash-1.5", GEMINI_15_FLASH);
    map.insert("google/gemini-2.0-flash-001", GEMINI_20_FLASH);
    map.insert("openai/gpt-4o-mini", GPT_4O_MINI);
    map.insert("openai/gpt-5-mini", GPT_5_MINI);
    map.insert("anthropic/claude-3-5-haiku", CLAUDE_35_HAIKU);
    map
}

pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    PRICING_MAP.get_or_init(init_pricing).get(model_id).copied()
}

pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(UNKNOWN_MODEL)
        .calculate_cost(input_tokens, output_tokens)
}

/// Nanodollars to USD, for display.
pub fn nanos_to_usd(nanos: i64) -> f64 {
    nanos as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_cost() {
        // 1K in + 1K out on Gemini 2.0 Flash: 100_000 + 400_000 nanos.
        assert_eq!(chat_cost("google/gemini-2.0-flash-001", 1_000, 1_000), 500_000);
    }

    #[test]
    fn unknown_model_uses_fallback() {
        assert_eq!(chat_cost("acme/unknown", 1, 1), 6_000);
        assert!(get_pricing("acme/unknown").is_none());
    }

    #[test]
    fn usd_conversion() {
        assert!((nanos_to_usd(500_000) - 0.0005).abs() < 1e-12);
    }
}
