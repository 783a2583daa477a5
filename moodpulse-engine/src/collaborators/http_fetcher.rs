//! HTTP content source client
//!
//! Fetches `GET {base_url}/entities/{id}/items`, which answers
//! `{"items": [{"id": "...", "text": "...", "published_at": "..."}]}`.
//! Requests are spaced by a minimum interval to stay polite to the source.
//!
//! Error mapping: connection errors, timeouts, 429 and 5xx are transient and fail
//! the call (the invoker retries it); any other 4xx is recorded as a per-entity
//! failure, and a malformed item as a per-item failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moodpulse_common::config::SourceConfig;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{FetchBatch, Fetcher, ItemFailure, RawItem};
use crate::error::{PipelineError, PipelineResult};

const USER_AGENT: &str = concat!("moodpulse/", env!("CARGO_PKG_VERSION"));

/// Enforces a minimum spacing between requests
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireItem {
    id: String,
    text: String,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

/// What a non-success status means for the call
#[derive(Debug, PartialEq, Eq)]
enum StatusClass {
    Ok,
    Transient,
    EntityFailed,
}

fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Ok
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StatusClass::Transient
    } else {
        StatusClass::EntityFailed
    }
}

/// Split a response body into items and per-item failures
fn parse_items(entity_id: &str, values: Vec<serde_json::Value>, batch: &mut FetchBatch) {
    for (position, value) in values.into_iter().enumerate() {
        let hint = value
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        match serde_json::from_value::<WireItem>(value) {
            Ok(item) if !item.id.trim().is_empty() => batch.items.push(RawItem {
                entity_id: entity_id.to_string(),
                item_id: item.id,
                text: item.text,
                published_at: item.published_at,
            }),
            Ok(_) => batch.failures.push(ItemFailure {
                entity_id: entity_id.to_string(),
                item_id: None,
                reason: format!("item {} has an empty id", position),
            }),
            Err(e) => batch.failures.push(ItemFailure {
                entity_id: entity_id.to_string(),
                item_id: hint,
                reason: format!("malformed item {}: {}", position, e),
            }),
        }
    }
}

/// Fetcher backed by a JSON HTTP source
pub struct HttpFetcher {
    http_client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>, config: &SourceConfig) -> PipelineResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Permanent(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::new(Duration::from_millis(
                config.min_request_interval_ms,
            ))),
        })
    }

    fn items_url(&self, entity_id: &str) -> String {
        format!("{}/entities/{}/items", self.base_url, encode_segment(entity_id))
    }

    async fn fetch_entity(&self, entity_id: &str, batch: &mut FetchBatch) -> PipelineResult<()> {
        self.rate_limiter.wait().await;

        let url = self.items_url(entity_id);
        debug!(entity = %entity_id, url = %url, "Fetching items");

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            PipelineError::TransientIo(format!("request for {} failed: {}", entity_id, e))
        })?;

        let status = response.status();
        match classify_status(status) {
            StatusClass::Ok => {}
            StatusClass::Transient => {
                return Err(PipelineError::TransientIo(format!(
                    "source answered {} for {}",
                    status, entity_id
                )));
            }
            StatusClass::EntityFailed => {
                batch.failures.push(ItemFailure {
                    entity_id: entity_id.to_string(),
                    item_id: None,
                    reason: format!("source answered {}", status),
                });
                return Ok(());
            }
        }

        let body: ItemsResponse = response.json().await.map_err(|e| {
            PipelineError::TransientIo(format!("unreadable response for {}: {}", entity_id, e))
        })?;
        parse_items(entity_id, body.items, batch);
        Ok(())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, entity_ids: &[String]) -> PipelineResult<FetchBatch> {
        let mut batch = FetchBatch::default();
        let mut seen = HashSet::new();

        for entity_id in entity_ids {
            if !seen.insert(entity_id.as_str()) {
                continue;
            }
            self.fetch_entity(entity_id, &mut batch).await?;
        }

        let mut item_keys = HashSet::new();
        batch
            .items
            .retain(|item| item_keys.insert((item.entity_id.clone(), item.item_id.clone())));
        Ok(batch)
    }
}

/// Percent-encode a path segment (ids such as "South Korea" contain spaces)
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
