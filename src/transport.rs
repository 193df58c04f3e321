//! HTTP delivery to the ingestion service
//!
//! Three endpoints on one configured base URL:
//! - `/capture/` for event batches and replay batches
//! - `/decide/` for feature-flag refresh
//!
//! The client is a connection pool, so concurrent callers (the capture flush
//! worker and the replay worker) need no shared-handle locking; in-flight
//! requests serialize on the transport's single-threaded runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use crate::error::{Error, Result};
use crate::event::{CaptureBatch, DecideRequest, Event};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one POST
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status in [200, 300)
    pub success: bool,
    /// HTTP status code; 0 when the request never completed
    pub status: u16,
    /// Response body (may be empty)
    pub body: String,
}

/// HTTP client for the ingestion API
pub struct Transport {
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    base_url: String,
    api_key: String,
    debug: AtomicBool,
}

impl Transport {
    /// Create a transport for the given host and project API key.
    ///
    /// The base URL is normalized by stripping a trailing `/`.
    pub fn new(base_url: &str, api_key: &str, debug: bool) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Transport(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            client,
            runtime,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            debug: AtomicBool::new(debug),
        })
    }

    /// Toggle verbose request logging.
    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::SeqCst);
    }

    /// POST a batch of queued event JSON strings to `/capture/`.
    pub fn post_capture(&self, events: &[String]) -> TransportResponse {
        if events.is_empty() {
            return TransportResponse {
                success: false,
                status: 0,
                body: String::new(),
            };
        }

        let payload = self.build_capture_payload(events);
        self.post("/capture/", payload)
    }

    /// POST a decide request for the given identity to `/decide/`.
    pub fn post_decide(&self, distinct_id: &str, properties: &serde_json::Value) -> TransportResponse {
        let request = DecideRequest {
            api_key: &self.api_key,
            distinct_id,
            properties,
        };
        let payload = serde_json::to_string(&request).unwrap_or_default();
        tracing::debug!(distinct_id, "Fetching feature flags");
        self.post("/decide/", payload)
    }

    /// POST a pre-built replay payload to `/capture/`.
    pub fn post_replay(&self, payload: String) -> TransportResponse {
        self.post("/capture/", payload)
    }

    /// Project API key this transport was configured with.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Assemble the `{api_key, batch}` envelope from queued event JSON.
    ///
    /// Each event is re-parsed so the batch is emitted as proper JSON; if any
    /// single event fails to parse, fall back to a concatenation envelope
    /// rather than dropping the batch.
    fn build_capture_payload(&self, events: &[String]) -> String {
        let mut batch = Vec::with_capacity(events.len());
        for raw in events {
            match serde_json::from_str::<Event>(raw) {
                Ok(event) => batch.push(event),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "queued event failed to re-parse, using raw envelope"
                    );
                    return format!(
                        "{{\"api_key\":\"{}\",\"batch\":[{}]}}",
                        self.api_key,
                        events.join(",")
                    );
                }
            }
        }

        let envelope = CaptureBatch {
            api_key: &self.api_key,
            batch,
        };
        serde_json::to_string(&envelope).unwrap_or_default()
    }

    fn post(&self, endpoint: &str, payload: String) -> TransportResponse {
        let url = format!("{}{}", self.base_url, endpoint);

        if self.debug.load(Ordering::SeqCst) {
            tracing::debug!(url = %url, bytes = payload.len(), "POST");
        }

        let outcome = self.runtime.block_on(async {
            let response = self.client.post(&url).body(payload).send().await?;
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Ok::<_, reqwest::Error>((status, body))
        });

        match outcome {
            Ok((status, body)) => {
                let success = (200..300).contains(&status);
                if !success {
                    tracing::error!(url = %url, status, "API request rejected");
                }
                TransportResponse {
                    success,
                    status,
                    body,
                }
            }
            Err(err) => {
                tracing::error!(url = %url, error = %err, "HTTP request failed");
                TransportResponse {
                    success: false,
                    status: 0,
                    body: String::new(),
                }
            }
        }
    }
}
