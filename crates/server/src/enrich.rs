// Derived-data computation behind `POST /v1/records/{type}/{id}/enrich`.
//
// Enrichment is the expensive, run-once server operation that clients submit
// with an idempotency key.

use concord_common::types::VersionedRecord;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Computes derived data for a record. Implementations must be safe to
/// attempt concurrently; only one result is retained per idempotency key.
pub trait Enricher: Send + Sync + 'static {
    fn enrich(&self, record: &VersionedRecord) -> anyhow::Result<Value>;
}

/// Text statistics and a content digest.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextStatsEnricher;

impl Enricher for TextStatsEnricher {
    fn enrich(&self, record: &VersionedRecord) -> anyhow::Result<Value> {
        let mut strings = Vec::new();
        collect_strings(&record.data, &mut strings);

        let word_count: usize = strings.iter().map(|text| text.split_whitespace().count()).sum();
        let char_count: usize = strings.iter().map(|text| text.chars().count()).sum();
        let canonical = serde_json::to_vec(&record.data)?;
        let digest = format!("{:x}", Sha256::digest(&canonical));

        Ok(json!({
            "sourceVersion": record.version,
            "wordCount": word_count,
            "charCount": char_count,
            "digest": digest,
        }))
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(text) => out.push(text),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(fields) => {
            // The previous enrichment is derived data, not content.
            fields
                .iter()
                .filter(|(key, _)| key.as_str() != ENRICHMENT_FIELD)
                .for_each(|(_, item)| collect_strings(item, out));
        }
        _ => {}
    }
}

/// Field of the record's data the enrichment is stored under.
pub const ENRICHMENT_FIELD: &str = "enrichment";

/// `data` with `enrichment` stored under [`ENRICHMENT_FIELD`]. `None` when
/// `data` is not a JSON object.
pub fn with_enrichment(data: &Value, enrichment: Value) -> Option<Value> {
    let mut fields: Map<String, Value> = data.as_object()?.clone();
    fields.insert(ENRICHMENT_FIELD.to_owned(), enrichment);
    Some(Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(data: Value) -> VersionedRecord {
        let now = Utc::now();
        VersionedRecord {
            resource_type: "note".into(),
            id: "note123".into(),
            version: 3,
            data,
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn counts_words_across_nested_strings() {
        let enrichment = TextStatsEnricher
            .enrich(&record(json!({
                "title": "Case review",
                "sections": [{"body": "three words here"}, {"body": "two more"}],
                "pinned": true,
            })))
            .unwrap();
        assert_eq!(enrichment["wordCount"], 7);
        assert_eq!(enrichment["sourceVersion"], 3);
        assert_eq!(enrichment["digest"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn previous_enrichment_is_not_counted() {
        let plain = TextStatsEnricher.enrich(&record(json!({"body": "one two"}))).unwrap();
        let enriched_data = with_enrichment(&json!({"body": "one two"}), json!({"note": "a b c"})).unwrap();
        let again = TextStatsEnricher.enrich(&record(enriched_data)).unwrap();
        assert_eq!(plain["wordCount"], again["wordCount"]);
    }

    #[test]
    fn enrichment_requires_object_data() {
        assert!(with_enrichment(&json!("text"), json!({})).is_none());
        let merged = with_enrichment(&json!({"body": "x"}), json!({"wordCount": 1})).unwrap();
        assert_eq!(merged["body"], "x");
        assert_eq!(merged[ENRICHMENT_FIELD]["wordCount"], 1);
    }
}
