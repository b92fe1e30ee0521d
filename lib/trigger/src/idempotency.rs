//! Idempotency keys for trigger deliveries.
//!
//! A key is the SHA-256 hex digest of the trigger id, the delivery content
//! and the time bucket the delivery falls into. Equal content within one
//! bucket yields the same key.

use chrono::{DateTime, Utc};
use flowgate_core::TriggerId;
use ring::digest::{SHA256, digest};
use serde_json::Value as JsonValue;
use std::fmt::Write as _;
use std::time::Duration;

/// What identifies the content of a delivery.
#[derive(Debug, Clone, Copy)]
pub enum KeySource<'a> {
    /// Hash the normalized payload.
    Payload(&'a JsonValue),
    /// The sender supplied its own key.
    Explicit(&'a str),
}

/// Derives the idempotency key for a delivery.
#[must_use]
pub fn derive_key(
    trigger_id: TriggerId,
    source: KeySource<'_>,
    at: DateTime<Utc>,
    window: Duration,
) -> String {
    let content = match source {
        KeySource::Payload(payload) => format!("payload:{}", canonical_json(payload)),
        KeySource::Explicit(key) => format!("key:{key}"),
    };
    let material = format!("{trigger_id}\n{content}\n{}", time_bucket(at, window));
    hex::encode(digest(&SHA256, material.as_bytes()).as_ref())
}

/// Index of the window that contains `at`.
#[must_use]
pub fn time_bucket(at: DateTime<Utc>, window: Duration) -> i64 {
    let width = i64::try_from(window.as_secs().max(1)).unwrap_or(i64::MAX);
    at.timestamp().div_euclid(width)
}

/// JSON text with object keys sorted at every level and no whitespace.
#[must_use]
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", JsonValue::String(key.clone()));
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("timestamp")
    }

    #[test]
    fn canonical_form_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"d": [1, {"z": null, "y": "x"}], "c": true}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":true,"d":[1,{"y":"x","z":null}]},"b":1}"#
        );
    }

    #[test]
    fn key_ignores_field_order() {
        let trigger = TriggerId::new();
        let one = json!({"id": 1, "name": "ada"});
        let two = json!({"name": "ada", "id": 1});
        assert_eq!(
            derive_key(trigger, KeySource::Payload(&one), at(7200), HOUR),
            derive_key(trigger, KeySource::Payload(&two), at(7200), HOUR)
        );
    }

    #[test]
    fn key_changes_across_buckets_and_triggers() {
        let trigger = TriggerId::new();
        let payload = json!({"id": 1});
        let base = derive_key(trigger, KeySource::Payload(&payload), at(7200), HOUR);

        assert_eq!(
            base,
            derive_key(trigger, KeySource::Payload(&payload), at(7200 + 3599), HOUR)
        );
        assert_ne!(
            base,
            derive_key(trigger, KeySource::Payload(&payload), at(7200 + 3600), HOUR)
        );
        assert_ne!(
            base,
            derive_key(TriggerId::new(), KeySource::Payload(&payload), at(7200), HOUR)
        );
    }

    #[test]
    fn explicit_key_replaces_payload() {
        let trigger = TriggerId::new();
        let a = derive_key(trigger, KeySource::Explicit("evt_1"), at(0), HOUR);
        let b = derive_key(trigger, KeySource::Explicit("evt_1"), at(0), HOUR);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, derive_key(trigger, KeySource::Payload(&json!("evt_1")), at(0), HOUR));
    }
}
