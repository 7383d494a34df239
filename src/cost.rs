//! Token and cost estimation for LLM calls.
//!
//! Token counts are approximated from whitespace-delimited words (1.3 tokens
//! per word) rather than a real tokenizer, and priced with a flat per-1K
//! rate per model. The figures are estimates and will not match provider
//! billing.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::util::count_words;

/// Rate applied to models missing from the table.
pub const DEFAULT_RATE_PER_1K: Decimal = dec!(0.002);

/// Decimal places kept on computed costs.
const COST_SCALE: u32 = 6;

/// Strip provider prefixes such as `openai/` before lookup.
fn normalize_model(model: &str) -> &str {
    let trimmed = model.trim();
    match trimmed.rsplit_once('/') {
        Some((_, name)) => name,
        None => trimmed,
    }
}

/// USD per 1000 tokens for `model`, if the model is priced.
pub fn known_rate_per_1k(model: &str) -> Option<Decimal> {
    match normalize_model(model) {
        "gpt-4" => Some(dec!(0.03)),
        "gpt-3.5-turbo" => Some(dec!(0.002)),
        "gpt-3.5-turbo-16k" => Some(dec!(0.004)),
        _ => None,
    }
}

/// USD per 1000 tokens for `model`, falling back to the default rate.
pub fn rate_per_1k(model: &str) -> Decimal {
    known_rate_per_1k(model).unwrap_or_else(|| {
        tracing::debug!(model = %model, "Unknown model for cost calculation, using default rate");
        DEFAULT_RATE_PER_1K
    })
}

/// Estimated tokens for `words` whitespace-delimited words.
pub fn tokens_for_words(words: u64) -> u64 {
    words.saturating_mul(13) / 10
}

/// Estimated tokens for a piece of text.
pub fn estimate_tokens(text: &str) -> u64 {
    tokens_for_words(count_words(text))
}

/// `tokens / 1000 * rate(model)`, rounded to six decimal places.
pub fn cost_for_tokens(model: &str, tokens: u64) -> Decimal {
    (Decimal::from(tokens) * rate_per_1k(model) / dec!(1000)).round_dp(COST_SCALE)
}

/// Estimate for one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEstimate {
    pub words_in: u64,
    pub words_out: u64,
    pub tokens: u64,
    pub cost: Decimal,
}

/// Estimate tokens and cost for an input message and the model's reply.
pub fn estimate_call(model: &str, input: &str, output: &str) -> CallEstimate {
    let words_in = count_words(input);
    let words_out = count_words(output);
    let tokens = tokens_for_words(words_in + words_out);
    CallEstimate {
        words_in,
        words_out,
        tokens,
        cost: cost_for_tokens(model, tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(normalize_model("openai/gpt-4"), "gpt-4");
        assert_eq!(normalize_model(" gpt-3.5-turbo "), "gpt-3.5-turbo");
    }

    #[test]
    fn test_rates() {
        assert_eq!(rate_per_1k("gpt-4"), dec!(0.03));
        assert_eq!(rate_per_1k("gpt-3.5-turbo-16k"), dec!(0.004));
        assert_eq!(rate_per_1k("some-new-model"), DEFAULT_RATE_PER_1K);
        assert!(known_rate_per_1k("some-new-model").is_none());
    }

    #[test]
    fn test_token_estimate_rounds_down() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one"), 1);
        assert_eq!(estimate_tokens("one two three four five six seven eight nine ten"), 13);
    }

    #[test]
    fn test_cost_is_exact_decimal() {
        // 1000 tokens of gpt-4 at $0.03/1K
        assert_eq!(cost_for_tokens("gpt-4", 1000), dec!(0.03));
        // 13 tokens at $0.002/1K
        assert_eq!(cost_for_tokens("gpt-3.5-turbo", 13), dec!(0.000026));
        assert_eq!(cost_for_tokens("gpt-4", 0), Decimal::ZERO);
    }

    #[test]
    fn test_estimate_call() {
        let est = estimate_call("gpt-4", "hello there", "general kenobi you are bold");
        assert_eq!(est.words_in, 2);
        assert_eq!(est.words_out, 5);
        assert_eq!(est.tokens, 9);
        assert_eq!(est.cost, dec!(0.00027));
    }
}
