use super::TokenUsage;

/// USD per million tokens `(model prefix, prompt, completion)`.
/// Longer prefixes come first so `gpt-4o-mini` wins over `gpt-4o`.
const PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4.1-nano", 0.10, 0.40),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1", 2.00, 8.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4-turbo", 10.00, 30.00),
    ("gpt-4", 30.00, 60.00),
    ("gpt-3.5-turbo", 0.50, 1.50),
];

/// Cost of one call. Unknown and local models are free.
pub fn cost_usd(model: &str, usage: &TokenUsage) -> f64 {
    PRICES
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, prompt, completion)| {
            (usage.prompt_tokens as f64 * prompt + usage.completion_tokens as f64 * completion) / 1_000_000.0
        })
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let usage = TokenUsage::new(1_000_000, 1_000_000);
        assert!((cost_usd("gpt-4o-mini-2024-07-18", &usage) - 0.75).abs() < 1e-9);
        assert!((cost_usd("gpt-4o", &usage) - 12.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_models_cost_nothing() {
        assert_eq!(cost_usd("llama3", &TokenUsage::new(500, 500)), 0.0);
    }
}
