use async_trait::async_trait;
use http::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::context::EventContext;

pub type DynEventSink = Arc<dyn EventSink>;

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("SEGMENT_WRITE_KEY not set - events cannot be forwarded to segment")]
    MissingWriteKey,
    #[error("failed to build segment http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed to send request to segment: {0}")]
    Request(#[from] reqwest::Error),
    #[error("segment rejected {call} call with status {status}")]
    Rejected { call: &'static str, status: StatusCode },
}

/// Identify call body, following the Segment HTTP tracking API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyPayload {
    pub user_id: String,
    pub anonymous_id: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub traits: Map<String, Value>,
    pub context: EventContext,
    pub timestamp: String,
}

/// Track call body. Traits ride along so downstream destinations that only
/// receive track calls still see the profile fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPayload {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub anonymous_id: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub traits: Map<String, Value>,
    pub context: EventContext,
    pub timestamp: String,
}

/// The outbound analytics platform, seen by the orchestrator as an opaque
/// pair of asynchronous calls. Injected so tests can substitute a fake.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn identify(&self, payload: &IdentifyPayload) -> Result<(), SinkError>;
    async fn track(&self, payload: &TrackPayload) -> Result<(), SinkError>;
}

/// HTTP sink posting to the Segment tracking API with the write key as
/// basic-auth username.
pub struct SegmentSink {
    client: reqwest::Client,
    endpoint: String,
    write_key: String,
}

impl SegmentSink {
    pub fn new(config: &Config) -> Result<Self, SinkError> {
        let write_key = config.write_key.clone().ok_or(SinkError::MissingWriteKey)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .map_err(SinkError::Client)?;

        Ok(SegmentSink {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            write_key,
        })
    }

    async fn post<B: Serialize + Sync>(
        &self,
        call: &'static str,
        body: &B,
    ) -> Result<(), SinkError> {
        let response = self
            .client
            .post(format!("{}/{}", self.endpoint, call))
            .basic_auth(&self.write_key, Some(""))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Rejected { call, status });
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink for SegmentSink {
    async fn identify(&self, payload: &IdentifyPayload) -> Result<(), SinkError> {
        self.post("identify", payload).await
    }

    async fn track(&self, payload: &TrackPayload) -> Result<(), SinkError> {
        self.post("track", payload).await
    }
}
