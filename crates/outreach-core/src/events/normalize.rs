//! Webhook payload normalization

use chrono::{DateTime, TimeZone, Utc};
use outreach_common::types::{BounceSeverity, EventKind};
use outreach_common::{Error, Result};
use outreach_storage::models::{MessageRef, NewInboundEvent};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Webhook body as accepted by the intake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default)]
    pub provider_event_id: Option<String>,

    pub event_type: String,

    /// RFC 3339 text or integer Unix seconds
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,

    #[serde(default)]
    pub message_ref: MessageRef,

    #[serde(default)]
    pub bounce_type: Option<String>,

    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_provider() -> String {
    "unknown".to_string()
}

/// Turn an intake payload into an event ready for the log
pub fn normalize(payload: &WebhookPayload, now: DateTime<Utc>) -> Result<NewInboundEvent> {
    let kind = EventKind::from_provider(&payload.event_type).ok_or_else(|| {
        Error::Malformed(format!("Unknown event type: {:?}", payload.event_type))
    })?;
    let occurred_at = parse_timestamp(payload.timestamp.as_ref(), now)?;

    let bounce_label = payload.bounce_type.clone().or_else(|| {
        payload
            .payload
            .get("bounce_type")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    });
    let bounce_severity = bounce_label.as_deref().and_then(BounceSeverity::from_provider);

    let native_id = payload
        .provider_event_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());
    let (provider_event_id, id_synthesized) = match native_id {
        Some(id) => (id.to_string(), false),
        None => (synthesize_event_id(kind, payload, bounce_label.as_deref())?, true),
    };

    Ok(NewInboundEvent {
        provider_event_id,
        provider: payload.provider.clone(),
        kind,
        occurred_at,
        message_ref: payload.message_ref.clone(),
        bounce_severity,
        id_synthesized,
        payload: payload.payload.clone(),
    })
}

fn parse_timestamp(raw: Option<&serde_json::Value>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match raw {
        None | Some(serde_json::Value::Null) => Ok(now),
        Some(serde_json::Value::String(text)) => DateTime::parse_from_rfc3339(text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Malformed(format!("Invalid timestamp {:?}: {}", text, e))),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| Error::Malformed(format!("Invalid Unix timestamp: {}", n))),
        Some(other) => Err(Error::Malformed(format!("Invalid timestamp: {}", other))),
    }
}

fn payload_is_empty(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Content-derived id, so redelivery of an id-less event still dedups
fn synthesize_event_id(
    kind: EventKind,
    payload: &WebhookPayload,
    bounce_label: Option<&str>,
) -> Result<String> {
    if payload.message_ref.is_empty() && payload_is_empty(&payload.payload) {
        let id = format!("rnd_{}", uuid::Uuid::new_v4());
        warn!(
            event_id = %id,
            event_type = %kind,
            "Event has no id and no content to derive one from; duplicates will not be detected"
        );
        return Ok(id);
    }

    let canonical = sorted_keys(&serde_json::json!({
        "event_type": kind.as_str(),
        "timestamp": payload.timestamp,
        "message_ref": payload.message_ref,
        "bounce_type": bounce_label,
        "payload": payload.payload,
    }));
    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| Error::Internal(format!("Failed to encode event: {}", e)))?;

    Ok(format!("syn_{}", hex::encode(Sha256::digest(&bytes))))
}

/// Rebuild `value` with every object's keys in ascending order, whatever
/// order they were parsed or inserted in
fn sorted_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), sorted_keys(value)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sorted_keys).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn parse(value: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_normalizes_aliases_and_timestamps() {
        let event = normalize(
            &parse(serde_json::json!({
                "provider": "nylas",
                "provider_event_id": "evt_1",
                "event_type": "message.opened",
                "timestamp": 1709294400,
                "message_ref": {"provider_message_id": "pm-1"}
            })),
            now(),
        )
        .unwrap();

        assert_eq!(event.kind, EventKind::Opened);
        assert_eq!(event.provider_event_id, "evt_1");
        assert!(!event.id_synthesized);
        assert_eq!(event.occurred_at, Utc.timestamp_opt(1709294400, 0).unwrap());

        let event = normalize(
            &parse(serde_json::json!({
                "provider_event_id": "evt_2",
                "event_type": "BOUNCE",
                "timestamp": "2024-03-01T09:30:00+02:00",
                "bounce_type": "permanent"
            })),
            now(),
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::Bounced);
        assert_eq!(event.bounce_severity, Some(BounceSeverity::Hard));
        assert_eq!(event.occurred_at, Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap());
        assert_eq!(event.provider, "unknown");
    }

    #[test]
    fn test_missing_timestamp_defaults_to_now() {
        let event = normalize(
            &parse(serde_json::json!({"provider_event_id": "evt_3", "event_type": "reply"})),
            now(),
        )
        .unwrap();
        assert_eq!(event.occurred_at, now());
    }

    #[test]
    fn test_rejects_malformed_input() {
        let unknown = parse(serde_json::json!({"event_type": "message.teleported"}));
        assert!(matches!(normalize(&unknown, now()), Err(Error::Malformed(_))));

        let bad_time = parse(serde_json::json!({
            "provider_event_id": "evt_4",
            "event_type": "opened",
            "timestamp": "yesterday"
        }));
        assert!(matches!(normalize(&bad_time, now()), Err(Error::Malformed(_))));

        let bool_time = parse(serde_json::json!({
            "provider_event_id": "evt_5",
            "event_type": "opened",
            "timestamp": true
        }));
        assert!(matches!(normalize(&bool_time, now()), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_synthesized_id_is_deterministic() {
        let payload = parse(serde_json::json!({
            "event_type": "opened",
            "timestamp": "2024-03-01T09:30:00Z",
            "message_ref": {"provider_message_id": "pm-1"},
            "payload": {"ip": "10.0.0.1", "agent": "Mail"}
        }));
        let first = normalize(&payload, now()).unwrap();
        let second = normalize(&payload, now()).unwrap();

        assert!(first.id_synthesized);
        assert!(first.provider_event_id.starts_with("syn_"));
        assert_eq!(first.provider_event_id, second.provider_event_id);

        // Alias spelling does not change the key
        let mut aliased = payload.clone();
        aliased.event_type = "open".to_string();
        assert_eq!(
            normalize(&aliased, now()).unwrap().provider_event_id,
            first.provider_event_id
        );

        let mut other = payload;
        other.payload = serde_json::json!({"ip": "10.0.0.2", "agent": "Mail"});
        assert_ne!(
            normalize(&other, now()).unwrap().provider_event_id,
            first.provider_event_id
        );
    }

    #[test]
    fn test_synthesized_id_ignores_key_order() {
        let first: WebhookPayload = serde_json::from_str(
            r#"{"event_type": "clicked",
                "message_ref": {"provider_message_id": "pm-1", "provider_thread_id": "th-1"},
                "payload": {"url": "https://example.com", "meta": {"a": 1, "b": [{"x": 1, "y": 2}]}}}"#,
        )
        .unwrap();
        let second: WebhookPayload = serde_json::from_str(
            r#"{"payload": {"meta": {"b": [{"y": 2, "x": 1}], "a": 1}, "url": "https://example.com"},
                "message_ref": {"provider_thread_id": "th-1", "provider_message_id": "pm-1"},
                "event_type": "clicked"}"#,
        )
        .unwrap();

        assert_eq!(
            normalize(&first, now()).unwrap().provider_event_id,
            normalize(&second, now()).unwrap().provider_event_id
        );
    }

    #[test]
    fn test_sorted_keys_orders_nested_objects() {
        let value = sorted_keys(&serde_json::json!({"b": {"d": 1, "c": 2}, "a": [{"f": 1, "e": 2}]}));
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"a":[{"e":2,"f":1}],"b":{"c":2,"d":1}}"#
        );
    }

    #[test]
    fn test_contentless_event_gets_random_id() {
        let payload = parse(serde_json::json!({"event_type": "opened"}));
        let first = normalize(&payload, now()).unwrap();
        let second = normalize(&payload, now()).unwrap();

        assert!(first.provider_event_id.starts_with("rnd_"));
        assert_ne!(first.provider_event_id, second.provider_event_id);
    }
}
