use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use lambda_runtime::{Error, LambdaEvent};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::Config;
use crate::context::{build_context, EventContext};
use crate::flatten::{flatten, sanitize_id, FlattenedEvent, ANONYMOUS_ID_FIELD};
use crate::partition::{partition, Partitioned};
use crate::segment::{DynEventSink, IdentifyPayload, SegmentSink, SinkError, TrackPayload};

pub mod config;
pub mod context;
pub mod flatten;
pub mod partition;
pub mod segment;

pub const DEFAULT_EVENT_NAME: &str = "unknown_event";
const ANONYMOUS_ID_PREFIX: &str = "anon-";
const EVENT_NAME_FIELD: &str = "event_name";
const EVENT_TIME_FIELD: &str = "event_time";

pub fn set_up_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .init();
}

pub fn set_up_segment_sink(config: &Config) -> Result<DynEventSink, SinkError> {
    Ok(Arc::new(SegmentSink::new(config)?))
}

/// API-Gateway-shaped response. The body is a JSON-encoded string, never
/// partial output: processing failures collapse into [`Response::failure`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Response {
    fn new(status_code: u16, body: Value) -> Self {
        let headers = HashMap::from([
            ("Access-Control-Allow-Origin".to_string(), "*".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]);
        Response {
            status_code,
            headers,
            body: body.to_string(),
        }
    }

    fn success(event_name: &str, user_id: Option<&str>, anonymous_id: &str) -> Self {
        Response::new(
            200,
            json!({
                "message": "Event processed successfully",
                "eventName": event_name,
                "userId": user_id,
                "anonymousId": anonymous_id,
            }),
        )
    }

    fn failure(message: &str) -> Self {
        Response::new(
            500,
            json!({
                "error": "Internal Server Error",
                "message": message,
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        )
    }
}

/// Lambda handler. Never fails the invocation: processing errors are logged
/// and shaped into a 500 response body.
pub async fn function_handler(
    sink: Option<DynEventSink>,
    config: &Config,
    request: LambdaEvent<Value>,
) -> Result<Response, Error> {
    debug!("Handling event payload: {:?}", request.payload);

    match process_event(sink, config, request.payload).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!("Failed to process webhook event: {}", e);
            Ok(Response::failure(&e.to_string()))
        }
    }
}

async fn process_event(
    sink: Option<DynEventSink>,
    config: &Config,
    payload: Value,
) -> Result<Response, Error> {
    let raw = parse_request(payload);
    let FlattenedEvent { fields, user_id } = flatten(&raw);

    let anonymous_id = fields
        .get(ANONYMOUS_ID_FIELD)
        .and_then(sanitize_id)
        .unwrap_or_else(|| format!("{}{}", ANONYMOUS_ID_PREFIX, Uuid::new_v4()));

    let event_name = fields
        .get(EVENT_NAME_FIELD)
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_EVENT_NAME)
        .to_string();
    let timestamp = resolve_timestamp(fields.get(EVENT_TIME_FIELD));

    let context = build_context(&fields);
    let Partitioned { traits, properties } = partition(&fields);

    info!(
        "Processed event '{}' (userId: {:?}, anonymousId: {})",
        event_name, user_id, anonymous_id
    );

    match sink {
        Some(sink) => {
            dispatch(
                sink,
                config,
                &event_name,
                user_id.as_deref(),
                &anonymous_id,
                traits,
                properties,
                context,
                &timestamp,
            )
            .await
        }
        None => info!("Segment sink unavailable, skipping forwarding"),
    }

    Ok(Response::success(
        &event_name,
        user_id.as_deref(),
        &anonymous_id,
    ))
}

/// Unwrap the invocation payload into the raw event mapping. Accepts either
/// the mapping itself or a wrapper with a `body` field holding the mapping
/// as an object or a JSON-encoded string. Malformed input degrades to an
/// empty mapping so processing can continue.
fn parse_request(payload: Value) -> Map<String, Value> {
    let Value::Object(mut wrapper) = payload else {
        warn!("Request payload is not a JSON object, proceeding with empty event");
        return Map::new();
    };

    match wrapper.remove("body") {
        None => wrapper,
        Some(Value::Object(body)) => body,
        Some(Value::String(body)) => match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(parsed)) => parsed,
            Ok(other) => {
                warn!("Request body is valid JSON but not an object: {}", other);
                Map::new()
            }
            Err(e) => {
                warn!("Failed to parse request body as JSON: {}", e);
                Map::new()
            }
        },
        Some(other) => {
            warn!("Unsupported request body type: {:?}", other);
            Map::new()
        }
    }
}

/// Use the event's own time when it parses, otherwise the processing time.
fn resolve_timestamp(event_time: Option<&Value>) -> String {
    event_time
        .and_then(Value::as_str)
        .and_then(parse_event_time)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // AppsFlyer renders event_time as "2024-01-01 00:00:00.000" in UTC
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Forward the event to Segment: identify only for known users, track
/// always, both concurrently with an independent per-call timeout. Failures
/// of either call are logged and swallowed without affecting the sibling.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    sink: DynEventSink,
    config: &Config,
    event_name: &str,
    user_id: Option<&str>,
    anonymous_id: &str,
    traits: Map<String, Value>,
    properties: Map<String, Value>,
    context: EventContext,
    timestamp: &str,
) {
    let per_call = Duration::from_millis(config.dispatch_timeout_millis);

    let identify = async {
        let Some(user_id) = user_id else {
            return;
        };
        let payload = IdentifyPayload {
            user_id: user_id.to_string(),
            anonymous_id: anonymous_id.to_string(),
            traits: traits.clone(),
            context: context.clone(),
            timestamp: timestamp.to_string(),
        };
        match timeout(per_call, sink.identify(&payload)).await {
            Ok(Ok(())) => debug!("Identify call delivered for user {}", user_id),
            Ok(Err(e)) => error!("Identify call failed: {}", e),
            Err(_) => error!(
                "Identify call timed out after {}ms",
                config.dispatch_timeout_millis
            ),
        }
    };

    let track = async {
        let payload = TrackPayload {
            event: event_name.to_string(),
            user_id: user_id.map(str::to_string),
            anonymous_id: anonymous_id.to_string(),
            properties,
            traits: traits.clone(),
            context: context.clone(),
            timestamp: timestamp.to_string(),
        };
        match timeout(per_call, sink.track(&payload)).await {
            Ok(Ok(())) => debug!("Track call delivered for event '{}'", event_name),
            Ok(Err(e)) => error!("Track call failed: {}", e),
            Err(_) => error!(
                "Track call timed out after {}ms",
                config.dispatch_timeout_millis
            ),
        }
    };

    // settle both regardless of individual outcome
    futures::join!(identify, track);
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions_sorted::assert_eq;

    #[test]
    fn test_parse_request_raw_mapping() {
        let raw = parse_request(json!({"event_name": "purchase"}));
        assert_eq!(raw.get("event_name"), Some(&json!("purchase")));
    }

    #[test]
    fn test_parse_request_object_body() {
        let raw = parse_request(json!({"body": {"event_name": "purchase"}}));
        assert_eq!(raw.get("event_name"), Some(&json!("purchase")));
    }

    #[test]
    fn test_parse_request_string_body() {
        let raw = parse_request(json!({"body": "{\"event_name\": \"purchase\"}"}));
        assert_eq!(raw.get("event_name"), Some(&json!("purchase")));
    }

    #[test]
    fn test_parse_request_malformed_body_degrades_to_empty() {
        let raw = parse_request(json!({"body": "{not json"}));
        assert!(raw.is_empty());

        let raw = parse_request(json!("just a string"));
        assert!(raw.is_empty());
    }

    #[test]
    fn test_resolve_timestamp_from_rfc3339() {
        let ts = resolve_timestamp(Some(&json!("2024-01-01T00:00:00Z")));
        assert_eq!(ts, "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_resolve_timestamp_from_appsflyer_format() {
        let ts = resolve_timestamp(Some(&json!("2024-01-01 12:30:45")));
        assert_eq!(ts, "2024-01-01T12:30:45.000Z");
    }

    #[test]
    fn test_resolve_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let ts = resolve_timestamp(Some(&json!("not a date")));
        let parsed = DateTime::parse_from_rfc3339(&ts).unwrap();
        assert!(parsed.with_timezone(&Utc) >= before - chrono::Duration::seconds(1));

        let ts = resolve_timestamp(None);
        assert!(DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn test_success_response_shape() {
        let response = Response::success("purchase", Some("42"), "anon-1");
        assert_eq!(response.status_code, 200);
        assert_eq!(
            response.headers.get("Access-Control-Allow-Origin"),
            Some(&"*".to_string())
        );
        assert_eq!(
            response.headers.get("Content-Type"),
            Some(&"application/json".to_string())
        );

        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["eventName"], json!("purchase"));
        assert_eq!(body["userId"], json!("42"));
        assert_eq!(body["anonymousId"], json!("anon-1"));
    }

    #[test]
    fn test_failure_response_shape() {
        let response = Response::failure("boom");
        assert_eq!(response.status_code, 500);

        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["error"], json!("Internal Server Error"));
        assert_eq!(body["message"], json!("boom"));
        assert!(body["timestamp"].is_string());
    }

    #[test]
    fn test_success_response_null_user() {
        let response = Response::success("purchase", None, "anon-1");
        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["userId"], Value::Null);
    }
}
