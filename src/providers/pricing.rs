//! Static pricing data for upstream models.
//!
//! Prices are USD per 1M tokens (input/output). Updated manually — check the
//! vendor pricing pages for latest.
//!
//! Lookup is longest-prefix match on the vendor-native model ID, so dated
//! variants (`anthropic.claude-3-5-sonnet-20241022-v2:0`) resolve through
//! their family prefix. Unknown models price at zero; the invocation is still
//! billed but flagged so operators can extend the table.

/// Markup applied to base cost for managed-inference requests (33%).
pub const MARKUP_RATE: f64 = 0.33;

/// model_id prefix → (input_price_per_1M, output_price_per_1M, context_window)
const PRICING: &[(&str, f64, f64, u32)] = &[
    // Anthropic (Bedrock model IDs)
    ("anthropic.claude-3-5-sonnet", 3.00, 15.00, 200_000),
    ("anthropic.claude-3-5-haiku", 1.00, 5.00, 200_000),
    ("anthropic.claude-3-opus", 15.00, 75.00, 200_000),
    ("anthropic.claude-3-sonnet", 3.00, 15.00, 200_000),
    ("anthropic.claude-3-haiku", 0.25, 1.25, 200_000),
    ("anthropic.claude-v2", 8.00, 24.00, 100_000),
    ("anthropic.claude-instant", 0.80, 2.40, 100_000),
    // Anthropic (direct API)
    ("claude-3-5-sonnet", 3.00, 15.00, 200_000),
    ("claude-3-5-haiku", 1.00, 5.00, 200_000),
    ("claude-3-opus", 15.00, 75.00, 200_000),
    ("claude-3-haiku", 0.25, 1.25, 200_000),
    // OpenAI / Azure OpenAI
    ("gpt-4o-mini", 0.15, 0.60, 128_000),
    ("gpt-4o", 2.50, 10.00, 128_000),
    ("gpt-4-turbo", 10.00, 30.00, 128_000),
    ("gpt-4", 30.00, 60.00, 8_192),
    ("gpt-3.5-turbo", 0.50, 1.50, 16_385),
    ("o1-mini", 1.10, 4.40, 128_000),
    ("o1", 15.00, 60.00, 200_000),
    ("text-embedding-3-small", 0.02, 0.00, 8_191),
    ("text-embedding-3-large", 0.13, 0.00, 8_191),
    ("text-embedding-ada-002", 0.10, 0.00, 8_191),
    // Meta Llama (Bedrock)
    ("meta.llama3-1-405b", 5.32, 16.00, 128_000),
    ("meta.llama3-1-70b", 2.65, 3.50, 128_000),
    ("meta.llama3-1-8b", 0.30, 0.60, 128_000),
    ("meta.llama3-2-90b", 2.00, 2.00, 128_000),
    ("meta.llama3-2-11b", 0.35, 0.35, 128_000),
    ("meta.llama3-2-3b", 0.15, 0.15, 128_000),
    ("meta.llama3-2-1b", 0.10, 0.10, 128_000),
    ("meta.llama3-70b", 2.65, 3.50, 8_000),
    ("meta.llama3-8b", 0.30, 0.60, 8_000),
    // Groq-hosted Llama
    ("llama-3.3-70b", 0.59, 0.79, 128_000),
    ("llama-3.1-8b", 0.05, 0.08, 128_000),
    // Amazon Titan
    ("amazon.titan-text-premier", 0.50, 1.50, 32_000),
    ("amazon.titan-text-express", 0.20, 0.60, 8_000),
    ("amazon.titan-text-lite", 0.15, 0.20, 4_000),
    ("amazon.titan-embed-text-v2", 0.02, 0.00, 8_192),
    ("amazon.titan-embed-text", 0.01, 0.00, 8_192),
    // Cohere (Bedrock)
    ("cohere.command-r-plus", 3.00, 15.00, 128_000),
    ("cohere.command-r", 0.50, 1.50, 128_000),
    ("cohere.command-text", 1.50, 2.00, 4_096),
    ("cohere.command-light-text", 0.30, 0.60, 4_096),
    ("cohere.embed-english", 0.10, 0.00, 512),
    ("cohere.embed-multilingual", 0.10, 0.00, 512),
    // Mistral (Bedrock)
    ("mistral.mistral-large", 4.00, 12.00, 128_000),
    ("mistral.mistral-small", 1.00, 3.00, 32_000),
    ("mistral.mixtral-8x7b", 0.45, 0.70, 32_000),
    ("mistral.mistral-7b", 0.15, 0.20, 32_000),
    // AI21 (Bedrock)
    ("ai21.jamba-1-5-large", 2.00, 8.00, 256_000),
    ("ai21.jamba-1-5-mini", 0.20, 0.40, 256_000),
];

/// Find the best (longest) matching pricing entry for a model ID.
fn match_model(model_id: &str) -> Option<&'static (&'static str, f64, f64, u32)> {
    PRICING
        .iter()
        .filter(|(prefix, ..)| model_id.starts_with(prefix))
        .max_by_key(|(prefix, ..)| prefix.len())
}

/// `(input_price_per_1M, output_price_per_1M)`, or `None` for unknown models.
pub fn price_per_1m(model_id: &str) -> Option<(f64, f64)> {
    match_model(model_id).map(|&(_, input, output, _)| (input, output))
}

pub fn context_window(model_id: &str) -> Option<u32> {
    match_model(model_id).map(|&(_, _, _, window)| window)
}

/// Estimate cost in USD for a token count. `(cost, price_known)` — unknown
/// models cost 0.0 with `price_known = false` so the billed row can be
/// flagged rather than silently free.
pub fn estimate_cost(model_id: &str, input_tokens: u64, output_tokens: u64) -> (f64, bool) {
    match price_per_1m(model_id) {
        Some((input_price, output_price)) => (
            input_tokens as f64 * input_price / 1e6 + output_tokens as f64 * output_price / 1e6,
            true,
        ),
        None => (0.0, false),
    }
}

/// 33% markup on base cost for managed-inference billing, rounded to 6 dp.
pub fn marked_up_cost(base_cost: f64) -> f64 {
    (base_cost * (1.0 + MARKUP_RATE) * 1e6).round() / 1e6
}
