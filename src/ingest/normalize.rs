//! Turns raw push messages into observations.
//!
//! Upstream has shipped the same score under different field names over time.
//! Which field is consulted first depends on the event type, and that mapping
//! lives in [`SCORE_FIELD_TABLE`] so a new upstream shape is one row.

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::core::{IngestError, IngestResult};

/// Event name used when the transport does not name the event
pub const DEFAULT_EVENT: &str = "message";

/// Event type -> score fields, highest priority first
pub const SCORE_FIELD_TABLE: &[(&str, &[&str])] = &[
    ("vks_update", &["vks_score", "trend_score"]),
    ("trend_update", &["trend_score", "vks_score"]),
    (DEFAULT_EVENT, &["vks_score", "trend_score"]),
];

/// Keep-alive events that carry nothing
pub const HEARTBEAT_EVENTS: &[&str] = &["heartbeat", "ping", "keepalive"];

const PLATFORM_FIELDS: &[&str] = &["platform", "source"];
const LABEL_FIELDS: &[&str] = &["hashtag", "topic"];
const AUTHOR_FIELDS: &[&str] = &["author", "creator", "username"];
const METRICS_FIELD: &str = "metrics";

/// A message that survived parsing and the noise policy
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub event_type: String,
    /// Score as sent, before clamping
    pub raw_score: f64,
    pub platform: String,
    pub label: Option<String>,
    pub author: Option<String>,
    pub metrics: Option<Value>,
}

/// Why a well-formed message was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoiseReason {
    ZeroScore,
    UnresolvedPlatform,
    UnknownEvent(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Observation(Observation),
    Heartbeat,
    Noise(NoiseReason),
}

pub fn is_heartbeat(event_type: &str) -> bool {
    HEARTBEAT_EVENTS
        .iter()
        .any(|name| name.eq_ignore_ascii_case(event_type))
}

/// Score fields for an event type, or `None` when the type is not mapped.
pub fn score_fields(event_type: &str) -> Option<&'static [&'static str]> {
    SCORE_FIELD_TABLE
        .iter()
        .find(|(name, _)| *name == event_type)
        .map(|(_, fields)| *fields)
}

/// Parse and classify one push message.
///
/// Returns `Err` only for bodies that are not JSON objects; everything else,
/// including noise and heartbeats, is a successful classification.
pub fn normalize(event_type: &str, raw_payload: &str) -> IngestResult<Normalized> {
    if is_heartbeat(event_type) {
        trace!(event_type, "Heartbeat received");
        return Ok(Normalized::Heartbeat);
    }

    let value: Value = serde_json::from_str(raw_payload).map_err(|source| IngestError::Parse {
        event_type: event_type.to_string(),
        source,
    })?;

    let Value::Object(envelope) = value else {
        return Err(IngestError::UnexpectedShape {
            event_type: event_type.to_string(),
            detail: "payload is not a JSON object".to_string(),
        });
    };

    let effective_type = resolve_event_type(event_type, &envelope);
    if is_heartbeat(&effective_type) {
        trace!(event_type = %effective_type, "Heartbeat received");
        return Ok(Normalized::Heartbeat);
    }

    let Some(fields) = score_fields(&effective_type) else {
        debug!(event_type = %effective_type, "Ignoring unmapped event type");
        return Ok(Normalized::Noise(NoiseReason::UnknownEvent(effective_type)));
    };

    let body = match envelope.get("data") {
        Some(Value::Object(inner)) => inner,
        _ => &envelope,
    };

    let raw_score = resolve_score(body, fields);
    if raw_score == 0.0 {
        return Ok(Normalized::Noise(NoiseReason::ZeroScore));
    }

    let Some(platform) = resolve_platform(body) else {
        return Ok(Normalized::Noise(NoiseReason::UnresolvedPlatform));
    };

    Ok(Normalized::Observation(Observation {
        event_type: effective_type,
        raw_score,
        platform,
        label: first_string(body, LABEL_FIELDS),
        author: first_string(body, AUTHOR_FIELDS),
        metrics: body.get(METRICS_FIELD).filter(|m| !m.is_null()).cloned(),
    }))
}

/// The transport's event name wins; an unnamed event takes the envelope's `type`.
fn resolve_event_type(event_type: &str, envelope: &Map<String, Value>) -> String {
    if event_type.is_empty() || event_type == DEFAULT_EVENT {
        if let Some(Value::String(inner)) = envelope.get("type") {
            if !inner.is_empty() {
                return inner.clone();
            }
        }
        return DEFAULT_EVENT.to_string();
    }
    event_type.to_string()
}

/// First non-zero numeric value among `fields`; 0 when none resolves.
fn resolve_score(body: &Map<String, Value>, fields: &[&str]) -> f64 {
    fields
        .iter()
        .filter_map(|field| body.get(*field).and_then(as_number))
        .find(|score| *score != 0.0)
        .unwrap_or(0.0)
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn resolve_platform(body: &Map<String, Value>) -> Option<String> {
    first_string(body, PLATFORM_FIELDS).filter(|p| !p.eq_ignore_ascii_case("unknown"))
}

fn first_string(body: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match body.get(*field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(event_type: &str, raw: &str) -> Observation {
        match normalize(event_type, raw).unwrap() {
            Normalized::Observation(obs) => obs,
            other => panic!("expected observation, got {:?}", other),
        }
    }

    #[test]
    fn test_vks_envelope() {
        let obs = observation(
            DEFAULT_EVENT,
            r##"{"type":"vks_update","data":{"vks_score":45,"platform":"tiktok","hashtag":"#x"}}"##,
        );
        assert_eq!(obs.event_type, "vks_update");
        assert_eq!(obs.raw_score, 45.0);
        assert_eq!(obs.platform, "tiktok");
        assert_eq!(obs.label.as_deref(), Some("#x"));
        assert_eq!(obs.author, None);
    }

    #[test]
    fn test_trend_update_uses_alternate_field() {
        let obs = observation(
            "trend_update",
            r#"{"trend_score":71.5,"platform":"instagram","author":"@ana","metrics":{"views":1200,"likes":88}}"#,
        );
        assert_eq!(obs.raw_score, 71.5);
        assert_eq!(obs.author.as_deref(), Some("@ana"));
        assert_eq!(obs.metrics.unwrap()["likes"], 88);
    }

    #[test]
    fn test_legacy_field_on_primary_event() {
        let obs = observation("vks_update", r#"{"trend_score":"33","source":"youtube","topic":"cats"}"#);
        assert_eq!(obs.raw_score, 33.0);
        assert_eq!(obs.platform, "youtube");
        assert_eq!(obs.label.as_deref(), Some("cats"));
    }

    #[test]
    fn test_zero_primary_falls_through_to_next_field() {
        let obs = observation("vks_update", r#"{"vks_score":0,"trend_score":40,"platform":"tiktok"}"#);
        assert_eq!(obs.raw_score, 40.0);

        // Both present and non-zero: the event's own field wins
        let obs = observation("trend_update", r#"{"vks_score":12,"trend_score":40,"platform":"tiktok"}"#);
        assert_eq!(obs.raw_score, 40.0);
    }

    #[test]
    fn test_zero_score_is_noise() {
        let result = normalize(
            DEFAULT_EVENT,
            r#"{"type":"trend_update","data":{"trend_score":0,"platform":"x"}}"#,
        )
        .unwrap();
        assert_eq!(result, Normalized::Noise(NoiseReason::ZeroScore));

        let missing = normalize("vks_update", r#"{"platform":"x"}"#).unwrap();
        assert_eq!(missing, Normalized::Noise(NoiseReason::ZeroScore));
    }

    #[test]
    fn test_unresolved_platform_is_noise() {
        for raw in [
            r#"{"vks_score":10}"#,
            r#"{"vks_score":10,"platform":""}"#,
            r#"{"vks_score":10,"platform":"Unknown"}"#,
        ] {
            assert_eq!(
                normalize("vks_update", raw).unwrap(),
                Normalized::Noise(NoiseReason::UnresolvedPlatform)
            );
        }
    }

    #[test]
    fn test_heartbeat_needs_no_body() {
        assert_eq!(normalize("heartbeat", "").unwrap(), Normalized::Heartbeat);
        assert_eq!(
            normalize(DEFAULT_EVENT, r#"{"type":"heartbeat","ts":1}"#).unwrap(),
            Normalized::Heartbeat
        );
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(
            normalize("vks_update", "{not json"),
            Err(IngestError::Parse { .. })
        ));
        assert!(matches!(
            normalize("vks_update", "[1,2,3]"),
            Err(IngestError::UnexpectedShape { .. })
        ));
    }

    #[test]
    fn test_unknown_event_dropped() {
        assert_eq!(
            normalize("image_ready", r#"{"url":"x"}"#).unwrap(),
            Normalized::Noise(NoiseReason::UnknownEvent("image_ready".to_string()))
        );
    }

    #[test]
    fn test_out_of_range_score_kept_raw() {
        let obs = observation("vks_update", r#"{"vks_score":250,"platform":"tiktok"}"#);
        assert_eq!(obs.raw_score, 250.0);
    }
}
