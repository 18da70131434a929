//! Deterministic identity for records and batches.
//!
//! The partner API deduplicates on these values, so they must depend only on
//! record content and never on ordering, timestamps or retry state.

use sha2::{Digest, Sha256};

/// Per-record key: `{date}_{app_id}_{provider}_{model}`.
pub fn record_key(date: &str, app_id: &str, provider: &str, model: &str) -> String {
    format!("{date}_{app_id}_{provider}_{model}")
}

/// Batch key: SHA-256 hex of the sorted, comma-joined record keys.
///
/// Returns an empty string for an empty key set.
pub fn batch_key<S: AsRef<str>>(record_keys: &[S]) -> String {
    if record_keys.is_empty() {
        return String::new();
    }

    let mut keys: Vec<&str> = record_keys.iter().map(AsRef::as_ref).collect();
    keys.sort_unstable();

    hex::encode(Sha256::digest(keys.join(",").as_bytes()))
}

/// Partner-side dedup id for one record: `dify-{date}-{provider}-{model}-{hash12}`.
///
/// `hash12` is the first 12 hex chars of SHA-256 over
/// `date|provider|model|app_id|user_id`; missing ids hash as empty strings.
pub fn source_event_id(
    usage_date: &str,
    provider: &str,
    model: &str,
    app_id: Option<&str>,
    user_id: Option<&str>,
) -> String {
    let material = format!(
        "{usage_date}|{provider}|{model}|{}|{}",
        app_id.unwrap_or_default(),
        user_id.unwrap_or_default()
    );
    let digest = hex::encode(Sha256::digest(material.as_bytes()));

    format!("dify-{usage_date}-{provider}-{model}-{}", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_format() {
        assert_eq!(
            record_key("2025-12-01", "app-1", "aws", "claude-3-5-sonnet-20241022"),
            "2025-12-01_app-1_aws_claude-3-5-sonnet-20241022"
        );
    }

    #[test]
    fn test_batch_key_empty() {
        let empty: [&str; 0] = [];
        assert_eq!(batch_key(&empty), "");
    }

    #[test]
    fn test_batch_key_order_independent() {
        let a = ["k3", "k1", "k2"];
        let b = ["k1", "k2", "k3"];
        let c = ["k2", "k3", "k1"];

        let key = batch_key(&a);
        assert_eq!(key, batch_key(&b));
        assert_eq!(key, batch_key(&c));
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_batch_key_content_sensitive() {
        assert_ne!(batch_key(&["k1", "k2"]), batch_key(&["k1", "k3"]));
        assert_ne!(batch_key(&["k1"]), batch_key(&["k1", "k1"]));
    }

    #[test]
    fn test_source_event_id_stable() {
        let a = source_event_id("2025-12-01", "aws", "m", Some("app"), Some("u"));
        let b = source_event_id("2025-12-01", "aws", "m", Some("app"), Some("u"));
        assert_eq!(a, b);
        assert!(a.starts_with("dify-2025-12-01-aws-m-"));
        assert_eq!(a.len(), "dify-2025-12-01-aws-m-".len() + 12);
    }

    #[test]
    fn test_source_event_id_changes_with_any_field() {
        let base = source_event_id("2025-12-01", "aws", "m", Some("app"), Some("u"));
        let variants = [
            source_event_id("2025-12-02", "aws", "m", Some("app"), Some("u")),
            source_event_id("2025-12-01", "openai", "m", Some("app"), Some("u")),
            source_event_id("2025-12-01", "aws", "n", Some("app"), Some("u")),
            source_event_id("2025-12-01", "aws", "m", Some("other"), Some("u")),
            source_event_id("2025-12-01", "aws", "m", Some("app"), None),
        ];
        for variant in variants {
            assert_ne!(base, variant);
        }
    }

    #[test]
    fn test_source_event_id_missing_ids_match_empty() {
        assert_eq!(
            source_event_id("2025-12-01", "aws", "m", None, None),
            source_event_id("2025-12-01", "aws", "m", Some(""), Some(""))
        );
    }
}
