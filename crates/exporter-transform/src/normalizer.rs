//! Provider and model vocabulary normalization.
//!
//! Upstream rows name the same provider or model in several ways
//! ("aws-bedrock", "bedrock", "langgenius/bedrock/bedrock"; bare or Bedrock
//! ARN model ids). The partner API expects one canonical spelling.
//!
//! Empty providers become `"unknown"`. Empty models stay empty.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::models::{AggregatedModelRecord, NormalizedModelRecord};

/// Provider name used when upstream reports none.
pub const UNKNOWN_PROVIDER: &str = "unknown";

const PROVIDER_ALIASES: &[(&str, &str)] = &[
    ("aws-bedrock", "aws"),
    ("aws_bedrock", "aws"),
    ("amazon-bedrock", "aws"),
    ("bedrock", "aws"),
    ("aws", "aws"),
    ("x-ai", "xai"),
    ("x.ai", "xai"),
    ("xai", "xai"),
    ("grok", "xai"),
    ("azure_openai", "azure"),
    ("azure-openai", "azure"),
    ("azure", "azure"),
    ("openai", "openai"),
    ("anthropic", "anthropic"),
    ("vertex_ai", "google"),
    ("vertex-ai", "google"),
    ("gemini", "google"),
    ("google", "google"),
    ("mistralai", "mistral"),
    ("mistral", "mistral"),
    ("deepseek", "deepseek"),
];

const MODEL_ALIASES: &[(&str, &str)] = &[
    // Anthropic, bare names
    ("claude-3-5-sonnet", "claude-3-5-sonnet-20241022"),
    ("claude-3.5-sonnet", "claude-3-5-sonnet-20241022"),
    ("claude-3-5-sonnet-latest", "claude-3-5-sonnet-20241022"),
    ("claude-3-5-haiku", "claude-3-5-haiku-20241022"),
    ("claude-3.5-haiku", "claude-3-5-haiku-20241022"),
    ("claude-3-7-sonnet", "claude-3-7-sonnet-20250219"),
    ("claude-3.7-sonnet", "claude-3-7-sonnet-20250219"),
    ("claude-3-opus", "claude-3-opus-20240229"),
    ("claude-3-sonnet", "claude-3-sonnet-20240229"),
    ("claude-3-haiku", "claude-3-haiku-20240307"),
    // Anthropic, Bedrock model ids
    ("anthropic.claude-3-5-sonnet-20241022-v2:0", "claude-3-5-sonnet-20241022"),
    ("anthropic.claude-3-5-sonnet-20240620-v1:0", "claude-3-5-sonnet-20240620"),
    ("anthropic.claude-3-5-haiku-20241022-v1:0", "claude-3-5-haiku-20241022"),
    ("anthropic.claude-3-7-sonnet-20250219-v1:0", "claude-3-7-sonnet-20250219"),
    ("anthropic.claude-3-opus-20240229-v1:0", "claude-3-opus-20240229"),
    ("anthropic.claude-3-sonnet-20240229-v1:0", "claude-3-sonnet-20240229"),
    ("anthropic.claude-3-haiku-20240307-v1:0", "claude-3-haiku-20240307"),
    // OpenAI
    ("gpt-4o", "gpt-4o-2024-08-06"),
    ("gpt-4o-mini", "gpt-4o-mini-2024-07-18"),
    ("gpt-4-turbo", "gpt-4-turbo-2024-04-09"),
    // Google
    ("gemini-1.5-pro", "gemini-1.5-pro-002"),
    ("gemini-1.5-flash", "gemini-1.5-flash-002"),
    // xAI
    ("grok-2", "grok-2-1212"),
    ("grok-2-vision", "grok-2-vision-1212"),
];

/// Cross-region inference profile prefixes on Bedrock model ids.
const BEDROCK_REGION_PREFIXES: &[&str] = &["us.", "eu.", "apac.", "global."];

fn build_table(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
        .collect()
}

static DEFAULT_NORMALIZER: LazyLock<Normalizer> = LazyLock::new(Normalizer::default);

/// Normalize a provider name with the built-in table.
pub fn normalize_provider(raw: &str) -> String {
    DEFAULT_NORMALIZER.provider(raw)
}

/// Normalize a model name with the built-in table.
pub fn normalize_model(raw: &str) -> String {
    DEFAULT_NORMALIZER.model(raw)
}

/// Parse a decimal price string into a cost.
///
/// Returns NaN when the string is not a decimal so that schema validation
/// rejects the record instead of exporting a zero cost.
pub fn parse_cost(raw: &str) -> f64 {
    let trimmed = raw.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
        .and_then(|d| d.to_f64())
        .unwrap_or(f64::NAN)
}

/// Alias tables for providers and models.
#[derive(Debug, Clone)]
pub struct Normalizer {
    providers: HashMap<String, String>,
    models: HashMap<String, String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            providers: build_table(PROVIDER_ALIASES),
            models: build_table(MODEL_ALIASES),
        }
    }
}

impl Normalizer {
    /// Create a normalizer with the built-in tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extra provider alias. Matching is case-insensitive.
    pub fn with_provider_alias(mut self, alias: &str, canonical: &str) -> Self {
        self.providers
            .insert(alias.trim().to_lowercase(), canonical.trim().to_lowercase());
        self
    }

    /// Register an extra model alias. Matching is case-insensitive.
    pub fn with_model_alias(mut self, alias: &str, canonical: &str) -> Self {
        self.models
            .insert(alias.trim().to_lowercase(), canonical.trim().to_lowercase());
        self
    }

    /// Canonical provider name.
    pub fn provider(&self, raw: &str) -> String {
        let cleaned = raw.trim().to_lowercase();
        if cleaned.is_empty() {
            return UNKNOWN_PROVIDER.to_string();
        }

        if let Some(canonical) = self.providers.get(&cleaned) {
            return canonical.clone();
        }

        // Plugin-style ids: "langgenius/openai/openai"
        if let Some(last) = cleaned.rsplit('/').next().filter(|s| !s.is_empty())
            && let Some(canonical) = self.providers.get(last)
        {
            return canonical.clone();
        }

        cleaned
    }

    /// Canonical model name. Empty input stays empty.
    pub fn model(&self, raw: &str) -> String {
        let cleaned = raw.trim().to_lowercase();
        if cleaned.is_empty() {
            return cleaned;
        }

        if let Some(canonical) = self.models.get(&cleaned) {
            return canonical.clone();
        }

        for prefix in BEDROCK_REGION_PREFIXES {
            if let Some(stripped) = cleaned.strip_prefix(prefix)
                && let Some(canonical) = self.models.get(stripped)
            {
                return canonical.clone();
            }
        }

        cleaned
    }

    /// Normalize a single aggregated record.
    pub fn normalize_record(&self, record: &AggregatedModelRecord) -> NormalizedModelRecord {
        NormalizedModelRecord {
            provider: self.provider(&record.model_provider),
            model: self.model(&record.model_name),
            input_tokens: record.prompt_tokens,
            output_tokens: record.completion_tokens,
            total_tokens: record.total_tokens,
            cost_actual: parse_cost(&record.total_price),
            usage_date: record.period.clone(),
            app_id: non_empty(&record.app_id),
            app_name: non_empty(&record.app_name),
            user_id: record.user_id.as_deref().and_then(non_empty),
        }
    }

    /// Normalize a run's records. No filtering, no aggregation.
    pub fn normalize(&self, records: &[AggregatedModelRecord]) -> Vec<NormalizedModelRecord> {
        records.iter().map(|r| self.normalize_record(r)).collect()
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_empty_is_unknown() {
        assert_eq!(normalize_provider(""), "unknown");
        assert_eq!(normalize_provider("   "), "unknown");
    }

    #[test]
    fn test_provider_table() {
        assert_eq!(normalize_provider("AWS-BEDROCK"), "aws");
        assert_eq!(normalize_provider("bedrock"), "aws");
        assert_eq!(normalize_provider("x-ai"), "xai");
        assert_eq!(normalize_provider("Grok"), "xai");
        assert_eq!(normalize_provider(" azure_openai "), "azure");
        assert_eq!(normalize_provider("langgenius/bedrock/bedrock"), "aws");
    }

    #[test]
    fn test_provider_passthrough() {
        assert_eq!(normalize_provider("custom-xyz"), "custom-xyz");
        assert_eq!(normalize_provider("  Custom-XYZ "), "custom-xyz");
    }

    #[test]
    fn test_model_empty_stays_empty() {
        assert_eq!(normalize_model(""), "");
        assert_eq!(normalize_model("  "), "");
    }

    #[test]
    fn test_model_table() {
        assert_eq!(normalize_model("  CLAUDE-3-5-SONNET  "), "claude-3-5-sonnet-20241022");
        assert_eq!(
            normalize_model("anthropic.claude-3-5-sonnet-20241022-v2:0"),
            "claude-3-5-sonnet-20241022"
        );
        assert_eq!(
            normalize_model("us.anthropic.claude-3-5-haiku-20241022-v1:0"),
            "claude-3-5-haiku-20241022"
        );
        assert_eq!(normalize_model("gpt-4o"), "gpt-4o-2024-08-06");
    }

    #[test]
    fn test_model_passthrough() {
        assert_eq!(normalize_model("My-Finetune-v3"), "my-finetune-v3");
    }

    #[test]
    fn test_extra_aliases() {
        let normalizer = Normalizer::new()
            .with_provider_alias("Corp-Gateway", "openai")
            .with_model_alias("house-model", "gpt-4o-mini-2024-07-18");
        assert_eq!(normalizer.provider("corp-gateway"), "openai");
        assert_eq!(normalizer.model("HOUSE-MODEL"), "gpt-4o-mini-2024-07-18");
        // built-ins still apply
        assert_eq!(normalizer.provider("bedrock"), "aws");
    }

    #[test]
    fn test_parse_cost() {
        assert!((parse_cost("0.018") - 0.018).abs() < 1e-12);
        assert_eq!(parse_cost(" 12 "), 12.0);
        assert!((parse_cost("1.5e-3") - 0.0015).abs() < 1e-12);
        assert!(parse_cost("n/a").is_nan());
        assert!(parse_cost("").is_nan());
    }

    #[test]
    fn test_normalize_record_copies_tokens() {
        let record = AggregatedModelRecord::new("2025-12-01", "app-1", "aws-bedrock", "claude-3-5-sonnet")
            .with_tokens(10, 5, 99)
            .with_total_price("0.5");
        let normalized = Normalizer::new().normalize(&[record]);

        assert_eq!(normalized.len(), 1);
        let n = &normalized[0];
        assert_eq!(n.provider, "aws");
        assert_eq!(n.model, "claude-3-5-sonnet-20241022");
        // mismatched totals pass through untouched
        assert_eq!((n.input_tokens, n.output_tokens, n.total_tokens), (10, 5, 99));
        assert_eq!(n.usage_date, "2025-12-01");
        assert_eq!(n.app_id.as_deref(), Some("app-1"));
        assert!(n.app_name.is_none());
    }
}
