//! IronMQ v3 adapter.
//!
//! Reservations map onto leases: a reserved message carries a
//! `reservation_id` that scopes delete and release. IronMQ has native delay
//! but no bury, so a bury republishes the body to a dead-letter queue and
//! deletes the original. Without a configured dead-letter queue the adapter
//! declares bury unsupported. Priorities are ignored.

use super::{Adapter, AdapterOptions, Capabilities, Lease, MessageId, PushOptions};
use crate::envelope::Envelope;
use async_trait::async_trait;
use quay_config::IronSettings;
use quay_core::{QueueError, QueueResult};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const NAME: &str = "iron";

/// Longest server-side wait IronMQ accepts on a reservation.
const MAX_WAIT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct NewMessage<'a> {
    body: &'a str,
    delay: u64,
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    messages: Vec<NewMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReserveRequest {
    n: u32,
    timeout: u64,
    wait: u64,
}

#[derive(Debug, Deserialize)]
struct ReserveResponse {
    #[serde(default)]
    messages: Vec<ReservedMessage>,
}

#[derive(Debug, Deserialize)]
struct ReservedMessage {
    id: String,
    body: String,
    #[serde(default)]
    reserved_count: u32,
    reservation_id: String,
}

#[derive(Debug, Deserialize)]
struct QueueInfoResponse {
    queue: QueueInfo,
}

#[derive(Debug, Deserialize)]
struct QueueInfo {
    #[serde(default)]
    size: u64,
}

/// IronMQ adapter over HTTP.
pub struct IronAdapter {
    client: Client,
    base_url: String,
    project_id: String,
    token: String,
    dead_letter_queue: Option<String>,
    options: AdapterOptions,
}

impl IronAdapter {
    /// Creates an adapter for `base_url` (scheme, host and port).
    pub fn new(
        base_url: &str,
        project_id: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> QueueResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                QueueError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            token: token.into(),
            dead_letter_queue: None,
            options: AdapterOptions::default(),
        })
    }

    /// Creates an adapter from settings.
    pub fn from_settings(settings: &IronSettings) -> QueueResult<Self> {
        let mut adapter = Self::new(
            &settings.base_url(),
            settings.project_id.clone(),
            settings.token.clone(),
            settings.request_timeout(),
        )?;
        adapter.dead_letter_queue = settings.dead_letter_queue.clone();

        info!(
            base_url = %adapter.base_url,
            project_id = %adapter.project_id,
            dead_letter_queue = ?adapter.dead_letter_queue,
            "IronMQ adapter configured"
        );

        Ok(adapter)
    }

    /// Enables bury by republishing to `queue`.
    #[must_use]
    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }

    /// Replaces the push defaults.
    #[must_use]
    pub fn with_options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    fn queue_url(&self, queue: &str) -> String {
        format!(
            "{}/3/projects/{}/queues/{}",
            self.base_url, self.project_id, queue
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("OAuth {}", self.token))
    }

    async fn post_message(&self, queue: &str, body: &str, delay: Duration) -> QueueResult<MessageId> {
        let request = PushRequest {
            messages: vec![NewMessage {
                body,
                delay: delay.as_secs(),
            }],
        };

        let response = self
            .authorized(self.client.post(format!("{}/messages", self.queue_url(queue))))
            .json(&request)
            .send()
            .await
            .map_err(http_error)?;

        let pushed: PushResponse = handle_response(response).await?;
        pushed
            .ids
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::Backend("IronMQ returned no message id".to_string()))
    }

    async fn reserve(&self, queue: &str, wait_secs: u64) -> QueueResult<Option<Lease>> {
        let request = ReserveRequest {
            n: 1,
            timeout: self.options.default_lease_timeout.as_secs(),
            wait: wait_secs,
        };

        let response = self
            .authorized(self.client.post(format!("{}/reservations", self.queue_url(queue))))
            .json(&request)
            .send()
            .await
            .map_err(http_error)?;

        let reserved: ReserveResponse = handle_response(response).await?;

        Ok(reserved.messages.into_iter().next().map(|message| Lease {
            id: message.id,
            token: Some(message.reservation_id),
            body: message.body,
            attempts: message.reserved_count.max(1),
        }))
    }
}

#[async_trait]
impl Adapter for IronAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            delay: true,
            bury: self.dead_letter_queue.is_some(),
            priority: false,
        }
    }

    async fn is_connected(&self) -> bool {
        let url = format!("{}/3/projects/{}/queues", self.base_url, self.project_id);
        match self.authorized(self.client.get(url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "IronMQ health check failed");
                false
            }
        }
    }

    async fn push(
        &self,
        queue: &str,
        envelope: &Envelope,
        options: &PushOptions,
    ) -> QueueResult<MessageId> {
        let body = envelope.encode()?;
        let push = self.options.resolve(options);

        let id = self.post_message(queue, &body, push.delay).await?;

        debug!(queue = %queue, message_id = %id, delay_secs = push.delay.as_secs(), "Message pushed");

        Ok(id)
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> QueueResult<Lease> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.as_secs().min(MAX_WAIT_SECS);

            if let Some(lease) = self.reserve(queue, wait).await? {
                return Ok(lease);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QueueError::QueueEmpty(queue.to_string()));
            }
            if wait == 0 {
                tokio::time::sleep(remaining.min(Duration::from_millis(500))).await;
            }
        }
    }

    async fn count(&self, queue: &str) -> QueueResult<u64> {
        let response = self
            .authorized(self.client.get(self.queue_url(queue)))
            .send()
            .await
            .map_err(http_error)?;

        // IronMQ creates queues lazily; an unknown queue is empty.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }

        let info: QueueInfoResponse = handle_response(response).await?;
        Ok(info.queue.size)
    }

    async fn delete(&self, queue: &str, lease: &Lease) -> QueueResult<()> {
        let response = self
            .authorized(
                self.client
                    .delete(format!("{}/messages/{}", self.queue_url(queue), lease.id)),
            )
            .json(&json!({ "reservation_id": lease.token }))
            .send()
            .await
            .map_err(http_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(queue = %queue, message_id = %lease.id, "Delete of missing message ignored");
            return Ok(());
        }

        let _: serde_json::Value = handle_response(response).await?;
        debug!(queue = %queue, message_id = %lease.id, "Message deleted");
        Ok(())
    }

    async fn release(&self, queue: &str, lease: &Lease, delay: Duration) -> QueueResult<()> {
        let response = self
            .authorized(self.client.post(format!(
                "{}/messages/{}/release",
                self.queue_url(queue),
                lease.id
            )))
            .json(&json!({
                "reservation_id": lease.token,
                "delay": delay.as_secs(),
            }))
            .send()
            .await
            .map_err(http_error)?;

        let _: serde_json::Value = handle_response(response).await?;
        debug!(queue = %queue, message_id = %lease.id, delay_secs = delay.as_secs(), "Message released");
        Ok(())
    }

    async fn bury(&self, queue: &str, lease: &Lease) -> QueueResult<()> {
        let Some(dead_letter) = self.dead_letter_queue.as_deref() else {
            return Err(QueueError::Capability {
                adapter: NAME,
                capability: "bury",
            });
        };

        let id = self.post_message(dead_letter, &lease.body, Duration::ZERO).await?;
        self.delete(queue, lease).await?;

        debug!(
            queue = %queue,
            message_id = %lease.id,
            dead_letter_queue = %dead_letter,
            dead_letter_id = %id,
            "Message buried"
        );
        Ok(())
    }

    async fn clear(&self, queue: &str) -> QueueResult<()> {
        let response = self
            .authorized(self.client.delete(format!("{}/messages", self.queue_url(queue))))
            .json(&json!({}))
            .send()
            .await
            .map_err(http_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        let _: serde_json::Value = handle_response(response).await?;
        info!(queue = %queue, "Queue cleared");
        Ok(())
    }
}

fn http_error(err: reqwest::Error) -> QueueError {
    if err.is_connect() || err.is_timeout() {
        QueueError::Connection(err.to_string())
    } else {
        QueueError::Backend(format!("HTTP error: {}", err))
    }
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> QueueResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(map_http_error(status, &body));
    }

    response
        .json()
        .await
        .map_err(|e| QueueError::Backend(format!("JSON parse error: {}", e)))
}

fn map_http_error(status: StatusCode, body: &str) -> QueueError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            QueueError::Configuration(format!("IronMQ rejected credentials: {}", body))
        }
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            QueueError::Connection(format!("IronMQ unavailable ({}): {}", status, body))
        }
        _ => QueueError::Backend(format!("IronMQ error {}: {}", status, body)),
    }
}
