use async_trait::async_trait;
use lambda_runtime::{Context, LambdaEvent};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use appsflyer_segment_webhook::config::Config;
use appsflyer_segment_webhook::segment::{
    DynEventSink, EventSink, IdentifyPayload, SinkError, TrackPayload,
};
use appsflyer_segment_webhook::{function_handler, set_up_segment_sink, Response};

/// In-memory sink capturing every payload, with optional latency and
/// failure injection.
#[derive(Default)]
struct FakeEventSink {
    identifies: Mutex<Vec<IdentifyPayload>>,
    tracks: Mutex<Vec<TrackPayload>>,
    identify_delay: Option<Duration>,
    fail_track: bool,
}

impl FakeEventSink {
    fn take_identifies(&self) -> Vec<IdentifyPayload> {
        std::mem::take(&mut self.identifies.lock().unwrap())
    }

    fn take_tracks(&self) -> Vec<TrackPayload> {
        std::mem::take(&mut self.tracks.lock().unwrap())
    }
}

#[async_trait]
impl EventSink for FakeEventSink {
    async fn identify(&self, payload: &IdentifyPayload) -> Result<(), SinkError> {
        if let Some(delay) = self.identify_delay {
            tokio::time::sleep(delay).await;
        }
        self.identifies.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn track(&self, payload: &TrackPayload) -> Result<(), SinkError> {
        if self.fail_track {
            return Err(SinkError::Rejected {
                call: "track",
                status: http::StatusCode::BAD_GATEWAY,
            });
        }
        self.tracks.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

fn test_config() -> Config {
    Config {
        write_key: Some("test-write-key".to_string()),
        endpoint: "http://localhost:1".to_string(),
        dispatch_timeout_millis: 200,
    }
}

fn invocation(payload: Value) -> LambdaEvent<Value> {
    LambdaEvent::new(payload, Context::default())
}

fn body_json(response: &Response) -> Value {
    serde_json::from_str(&response.body).expect("response body must be valid JSON")
}

#[test_log::test(tokio::test)]
async fn test_end_to_end_purchase_event() {
    let fake = Arc::new(FakeEventSink::default());
    let sink: DynEventSink = fake.clone();

    let response = function_handler(
        Some(sink),
        &test_config(),
        invocation(json!({
            "event_name": "purchase",
            "user_id": "42",
            "event_time": "2024-01-01T00:00:00Z",
            "properties": {"amount": 9.99}
        })),
    )
    .await
    .unwrap();

    assert_eq!(response.status_code, 200);
    let body = body_json(&response);
    assert_eq!(body["eventName"], json!("purchase"));
    assert_eq!(body["userId"], json!("42"));
    let anonymous_id = body["anonymousId"].as_str().unwrap();
    assert!(anonymous_id.starts_with("anon-"));
    assert!(anonymous_id.len() > "anon-".len());

    let identifies = fake.take_identifies();
    assert_eq!(identifies.len(), 1);
    assert_eq!(identifies[0].user_id, "42");
    assert_eq!(identifies[0].anonymous_id, anonymous_id);
    assert_eq!(identifies[0].timestamp, "2024-01-01T00:00:00.000Z");

    let tracks = fake.take_tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].event, "purchase");
    assert_eq!(tracks[0].user_id.as_deref(), Some("42"));
    assert_eq!(tracks[0].properties.get("amount"), Some(&json!(9.99)));
    assert_eq!(tracks[0].timestamp, "2024-01-01T00:00:00.000Z");
}

#[test_log::test(tokio::test)]
async fn test_identify_timeout_does_not_affect_track() {
    let fake = Arc::new(FakeEventSink {
        identify_delay: Some(Duration::from_millis(500)),
        ..FakeEventSink::default()
    });
    let sink: DynEventSink = fake.clone();

    let response = function_handler(
        Some(sink),
        &test_config(),
        invocation(json!({"event_name": "login", "user_id": "7"})),
    )
    .await
    .unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(body_json(&response)["eventName"], json!("login"));

    // identify never completed within the timeout, track was unaffected
    assert!(fake.take_identifies().is_empty());
    let tracks = fake.take_tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].event, "login");
}

#[tokio::test]
async fn test_track_failure_is_swallowed() {
    let fake = Arc::new(FakeEventSink {
        fail_track: true,
        ..FakeEventSink::default()
    });
    let sink: DynEventSink = fake.clone();

    let response = function_handler(
        Some(sink),
        &test_config(),
        invocation(json!({"event_name": "login", "user_id": "7"})),
    )
    .await
    .unwrap();

    assert_eq!(response.status_code, 200);
    // identify still went through
    assert_eq!(fake.take_identifies().len(), 1);
}

#[tokio::test]
async fn test_missing_sink_skips_forwarding() {
    let response = function_handler(
        None,
        &test_config(),
        invocation(json!({"event_name": "login"})),
    )
    .await
    .unwrap();

    assert_eq!(response.status_code, 200);
    let body = body_json(&response);
    assert_eq!(body["eventName"], json!("login"));
    assert_eq!(body["userId"], Value::Null);
}

#[tokio::test]
async fn test_anonymous_user_gets_track_only() {
    let fake = Arc::new(FakeEventSink::default());
    let sink: DynEventSink = fake.clone();

    let response = function_handler(
        Some(sink),
        &test_config(),
        invocation(json!({"event_name": "app_open"})),
    )
    .await
    .unwrap();

    assert_eq!(response.status_code, 200);
    assert!(fake.take_identifies().is_empty());

    let tracks = fake.take_tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].user_id, None);
    assert!(tracks[0].anonymous_id.starts_with("anon-"));
}

#[tokio::test]
async fn test_appsflyer_id_becomes_anonymous_id() {
    let fake = Arc::new(FakeEventSink::default());
    let sink: DynEventSink = fake.clone();

    let response = function_handler(
        Some(sink),
        &test_config(),
        invocation(json!({"event_name": "install", "appsflyer_id": "af-123"})),
    )
    .await
    .unwrap();

    assert_eq!(body_json(&response)["anonymousId"], json!("af-123"));
    assert_eq!(fake.take_tracks()[0].anonymous_id, "af-123");
}

#[tokio::test]
async fn test_string_body_is_unwrapped() {
    let response = function_handler(
        None,
        &test_config(),
        invocation(json!({"body": "{\"event_name\": \"signup\", \"user_id\": \"9\"}"})),
    )
    .await
    .unwrap();

    let body = body_json(&response);
    assert_eq!(body["eventName"], json!("signup"));
    assert_eq!(body["userId"], json!("9"));
}

#[tokio::test]
async fn test_malformed_body_still_answers() {
    let response = function_handler(
        None,
        &test_config(),
        invocation(json!({"body": "{definitely not json"})),
    )
    .await
    .unwrap();

    assert_eq!(response.status_code, 200);
    let body = body_json(&response);
    assert_eq!(body["eventName"], json!("unknown_event"));
    assert_eq!(body["userId"], Value::Null);
}

#[tokio::test]
async fn test_generated_anonymous_ids_are_unique() {
    let mut seen = Vec::new();
    for _ in 0..3 {
        let response = function_handler(
            None,
            &test_config(),
            invocation(json!({"event_name": "ping"})),
        )
        .await
        .unwrap();
        let body = body_json(&response);
        let anonymous_id = body["anonymousId"].as_str().unwrap().to_string();
        assert!(anonymous_id.starts_with("anon-"));
        assert!(!seen.contains(&anonymous_id));
        seen.push(anonymous_id);
    }
}

#[test_log::test(tokio::test)]
async fn test_segment_sink_posts_identify_and_track() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/identify"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({"userId": "42"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/track"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({"event": "purchase"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = Config {
        write_key: Some("test-write-key".to_string()),
        endpoint: server.uri(),
        dispatch_timeout_millis: 3000,
    };
    let sink = set_up_segment_sink(&config).unwrap();

    let response = function_handler(
        Some(sink),
        &config,
        invocation(json!({"event_name": "purchase", "user_id": "42"})),
    )
    .await
    .unwrap();

    assert_eq!(response.status_code, 200);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        let auth = request.headers.get("authorization").unwrap();
        assert!(auth.to_str().unwrap().starts_with("Basic "));
    }
}

#[tokio::test]
async fn test_segment_rejection_does_not_fail_invocation() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = Config {
        write_key: Some("test-write-key".to_string()),
        endpoint: server.uri(),
        dispatch_timeout_millis: 3000,
    };
    let sink = set_up_segment_sink(&config).unwrap();

    let response = function_handler(
        Some(sink),
        &config,
        invocation(json!({"event_name": "purchase", "user_id": "42"})),
    )
    .await
    .unwrap();

    assert_eq!(response.status_code, 200);
}
