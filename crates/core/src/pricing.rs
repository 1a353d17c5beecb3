use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Per-1K-token USD rates for one provider/model pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    pub provider: String,
    pub model_pattern: String,
    pub request_kind: String,
    pub input_per_1k: Decimal,
    pub output_per_1k: Decimal,
}

const TOKENS_PER_RATE: u64 = 1_000;

/// Compute the USD cost for a token count against a rule. All arithmetic
/// stays in `Decimal`; the result is quantized to four decimal places at
/// this boundary only.
pub fn compute_cost(input_tokens: u64, output_tokens: u64, rule: &PricingRule) -> Decimal {
    let per = Decimal::from(TOKENS_PER_RATE);
    let input_cost = rule.input_per_1k * Decimal::from(input_tokens) / per;
    let output_cost = rule.output_per_1k * Decimal::from(output_tokens) / per;
    (input_cost + output_cost).round_dp(4)
}

/// Find the most specific matching rule for a provider/model/kind triple.
/// Exact model patterns win over wildcard ones.
pub fn find_rule<'a>(
    rules: &'a [PricingRule],
    provider: &str,
    model: &str,
    request_kind: &str,
) -> Option<&'a PricingRule> {
    rules
        .iter()
        .filter(|rule| {
            rule.provider == provider
                && rule.request_kind == request_kind
                && model_matches_pattern(model, &rule.model_pattern)
        })
        .max_by_key(|rule| !rule.model_pattern.contains('*'))
}

pub fn model_matches_pattern(model: &str, pattern: &str) -> bool {
    let model = model.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return model == pattern;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut remainder = model.as_str();
    let mut first = true;
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if let Some(index) = remainder.find(part) {
            if first && index != 0 {
                return false;
            }
            remainder = &remainder[index + part.len()..];
            first = false;
        } else {
            return false;
        }
    }
    if pattern.ends_with('*') {
        true
    } else {
        remainder.is_empty()
    }
}

/// Built-in pricing table (USD per 1K tokens, completion requests).
pub fn default_pricing_rules() -> Vec<PricingRule> {
    fn rule(provider: &str, pattern: &str, input: Decimal, output: Decimal) -> PricingRule {
        PricingRule {
            provider: provider.to_string(),
            model_pattern: pattern.to_string(),
            request_kind: "completion".to_string(),
            input_per_1k: input,
            output_per_1k: output,
        }
    }
    vec![
        rule("openai", "gpt-4", dec!(0.03), dec!(0.06)),
        rule("openai", "gpt-4-turbo", dec!(0.01), dec!(0.03)),
        rule("openai", "gpt-3.5-turbo", dec!(0.0005), dec!(0.0015)),
        rule("openai", "*", dec!(0.01), dec!(0.03)),
        rule("anthropic", "claude-opus-*", dec!(0.015), dec!(0.075)),
        rule("anthropic", "claude-sonnet-*", dec!(0.003), dec!(0.015)),
        rule("anthropic", "claude-haiku-*", dec!(0.001), dec!(0.005)),
        rule("anthropic", "*", dec!(0.003), dec!(0.015)),
    ]
}
