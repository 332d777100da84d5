//! Stream store clients.
//!
//! [`StreamClient`] is the seam between the flush path and the store. The
//! production implementation is [`HttpStreamClient`]; [`MemoryStreamClient`]
//! keeps everything in process for dry runs and tests.
//!
//! Uses native async fn in traits. [`StreamClientBoxed`] is the object-safe
//! twin used wherever the client is held as `Arc<dyn _>`.

use crate::config::ExporterConfig;
use crate::error::{ClientError, ConfigError};
use crate::event::Event;
use crate::retry::{retry_with_backoff, RetryConfig};
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Body of a create-stream request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStreamRequest {
    pub stream: String,
}

/// One record of an append request; `body` is a serialized [`Event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRecord {
    pub body: String,
}

/// Body of an append request. Records are stored in list order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRecordsRequest {
    pub records: Vec<AppendRecord>,
}

impl AppendRecordsRequest {
    /// Serializes every event into one record, preserving order.
    pub fn from_events(events: &[Event]) -> Result<Self, ClientError> {
        let records = events
            .iter()
            .map(|event| Ok(AppendRecord { body: event.to_json()? }))
            .collect::<Result<Vec<_>, ClientError>>()?;
        Ok(Self { records })
    }
}

/// Trait for delivering event batches to a stream store.
pub trait StreamClient: Send + Sync {
    /// Makes sure `stream` exists. Idempotent; repeated calls for a stream
    /// already known to exist must not touch the network.
    fn ensure_stream(
        &self,
        stream: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Appends `events` to `stream` as one request, in slice order.
    fn append_events(
        &self,
        stream: &str,
        events: &[Event],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Returns the client name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`StreamClient`] for dynamic dispatch.
pub trait StreamClientBoxed: Send + Sync {
    fn ensure_stream_boxed<'a>(
        &'a self,
        stream: &'a str,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>>;

    fn append_events_boxed<'a>(
        &'a self,
        stream: &'a str,
        events: &'a [Event],
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any StreamClient can be used as StreamClientBoxed
impl<T: StreamClient> StreamClientBoxed for T {
    fn ensure_stream_boxed<'a>(
        &'a self,
        stream: &'a str,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
        Box::pin(self.ensure_stream(stream, cancel))
    }

    fn append_events_boxed<'a>(
        &'a self,
        stream: &'a str,
        events: &'a [Event],
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
        Box::pin(self.append_events(stream, events, cancel))
    }

    fn name(&self) -> &str {
        StreamClient::name(self)
    }
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

type CreationSlot = Arc<tokio::sync::Mutex<()>>;

/// Client for the stream store's HTTP API.
///
/// Streams are created lazily on first use and remembered for the lifetime of
/// the client. Every request is retried per the configured [`RetryConfig`].
pub struct HttpStreamClient {
    base_url: Url,
    api_key: String,
    http: reqwest::Client,
    retry: RetryConfig,
    /// Streams confirmed to exist. Grows monotonically.
    known_streams: RwLock<HashSet<String>>,
    /// One guard per stream whose creation is in progress.
    creating: Mutex<HashMap<String, CreationSlot>>,
    streams_created: AtomicU64,
    requests_retried: AtomicU64,
}

impl HttpStreamClient {
    /// Builds a client from a validated configuration.
    pub fn new(config: &ExporterConfig) -> Result<Self, ConfigError> {
        let base_url = config.endpoint_url()?;
        if config.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            http,
            retry: config.retry.clone(),
            known_streams: RwLock::new(HashSet::new()),
            creating: Mutex::new(HashMap::new()),
            streams_created: AtomicU64::new(0),
            requests_retried: AtomicU64::new(0),
        })
    }

    /// Returns `true` if `stream` is in the known-stream cache.
    pub async fn is_known(&self, stream: &str) -> bool {
        self.known_streams.read().await.contains(stream)
    }

    /// Guard shared by every caller currently provisioning `stream`.
    fn creation_slot(&self, stream: &str) -> CreationSlot {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(creating.entry(stream.to_owned()).or_default())
    }

    /// Forgets the guard once its last holder is done with it.
    fn release_slot(&self, stream: &str, slot: CreationSlot) {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        // the map's copy plus ours
        if Arc::strong_count(&slot) == 2 {
            creating.remove(stream);
        }
    }

    /// Creates `stream` unless a caller holding the same guard already did.
    ///
    /// Racing callers for one stream wait on its guard; the known-stream lock
    /// is only taken briefly, so other streams are never held up by a slow
    /// create.
    async fn create_once(
        &self,
        stream: &str,
        slot: &tokio::sync::Mutex<()>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let _creating = slot.lock().await;
        if self.is_known(stream).await {
            return Ok(());
        }
        self.create_stream(stream, cancel).await?;
        self.known_streams.write().await.insert(stream.to_owned());
        self.streams_created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Streams created (or found to exist) by this client.
    pub fn streams_created(&self) -> u64 {
        self.streams_created.load(Ordering::Relaxed)
    }

    /// Attempts beyond the first, across all requests.
    pub fn requests_retried(&self) -> u64 {
        self.requests_retried.load(Ordering::Relaxed)
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidStreamName(format!("endpoint {} cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// POSTs `body` with retry. Server errors are retried; any response below
    /// 500 is handed back for the caller to interpret.
    async fn post_json(
        &self,
        url: Url,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ClientError> {
        retry_with_backoff(&self.retry, cancel, |attempt| {
            if attempt > 0 {
                self.requests_retried.fetch_add(1, Ordering::Relaxed);
            }
            let request = self
                .http
                .post(url.clone())
                .bearer_auth(&self.api_key)
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());

            async move {
                let response = request.send().await?;
                let status = response.status();
                if status.is_server_error() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ClientError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Ok(response)
            }
        })
        .await
    }

    async fn create_stream(&self, stream: &str, cancel: &CancellationToken) -> Result<(), ClientError> {
        let body = serde_json::to_vec(&CreateStreamRequest {
            stream: stream.to_owned(),
        })?;
        let response = self.post_json(self.url(&["streams"])?, body, cancel).await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            tracing::debug!(stream, "stream already exists");
            return Ok(());
        }
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(stream, "created stream");
        Ok(())
    }
}

fn check_stream_name(stream: &str) -> Result<(), ClientError> {
    if stream.is_empty() {
        return Err(ClientError::InvalidStreamName("stream name is empty".into()));
    }
    Ok(())
}

impl StreamClient for HttpStreamClient {
    async fn ensure_stream(&self, stream: &str, cancel: &CancellationToken) -> Result<(), ClientError> {
        check_stream_name(stream)?;

        if self.known_streams.read().await.contains(stream) {
            return Ok(());
        }

        let slot = self.creation_slot(stream);
        let result = self.create_once(stream, &slot, cancel).await;
        self.release_slot(stream, slot);
        result
    }

    async fn append_events(
        &self,
        stream: &str,
        events: &[Event],
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        if events.is_empty() {
            return Ok(());
        }
        check_stream_name(stream)?;

        let body = serde_json::to_vec(&AppendRecordsRequest::from_events(events)?)?;
        let url = self.url(&["streams", stream, "records"])?;
        let response = self.post_json(url, body, cancel).await?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

// =============================================================================
// IN-MEMORY CLIENT
// =============================================================================

/// Keeps streams in process memory. Useful for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStreamClient {
    streams: Mutex<HashMap<String, Vec<Event>>>,
    create_calls: AtomicU64,
    append_calls: AtomicU64,
}

impl MemoryStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events appended to `stream`, in append order.
    pub fn events(&self, stream: &str) -> Vec<Event> {
        self.lock().get(stream).cloned().unwrap_or_default()
    }

    /// Names of all streams created so far, sorted.
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Total events across all streams.
    pub fn total_events(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::Relaxed)
    }

    pub fn append_calls(&self) -> u64 {
        self.append_calls.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Event>>> {
        // a panic while holding the lock cannot leave the map half-updated
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamClient for MemoryStreamClient {
    async fn ensure_stream(&self, stream: &str, _cancel: &CancellationToken) -> Result<(), ClientError> {
        check_stream_name(stream)?;
        let mut streams = self.lock();
        if !streams.contains_key(stream) {
            self.create_calls.fetch_add(1, Ordering::Relaxed);
            streams.insert(stream.to_owned(), Vec::new());
        }
        Ok(())
    }

    async fn append_events(
        &self,
        stream: &str,
        events: &[Event],
        _cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        if events.is_empty() {
            return Ok(());
        }
        self.append_calls.fetch_add(1, Ordering::Relaxed);
        let mut streams = self.lock();
        match streams.get_mut(stream) {
            Some(records) => {
                records.extend_from_slice(events);
                Ok(())
            }
            None => Err(ClientError::Status {
                status: 404,
                body: format!("stream {stream} not found"),
            }),
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn event(conversation_id: &str, span_id: &str) -> Event {
        Event {
            timestamp: Utc::now(),
            trace_id: "trace-1".into(),
            span_id: span_id.into(),
            parent_span_id: None,
            conversation_id: conversation_id.into(),
            operation_type: "chat".into(),
            span_name: "test".into(),
            duration_ns: 0,
            status: EventStatus::Ok,
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_append_request_preserves_order() {
        let events = vec![event("c", "span-1"), event("c", "span-2"), event("c", "span-3")];
        let request = AppendRecordsRequest::from_events(&events).unwrap();

        let span_ids: Vec<_> = request
            .records
            .iter()
            .map(|r| Event::from_json(&r.body).unwrap().span_id)
            .collect();
        assert_eq!(span_ids, ["span-1", "span-2", "span-3"]);
    }

    #[test]
    fn test_urls_are_percent_encoded() {
        let config = ExporterConfig::new("http://localhost:8080/v1/", "key");
        let client = HttpStreamClient::new(&config).unwrap();

        let url = client.url(&["streams", "agent-session-a/b c", "records"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/v1/streams/agent-session-a%2Fb%20c/records"
        );
        assert_eq!(client.url(&["streams"]).unwrap().as_str(), "http://localhost:8080/v1/streams");
    }

    #[test]
    fn test_new_requires_api_key() {
        let config = ExporterConfig::new("http://localhost:8080", "");
        assert!(matches!(HttpStreamClient::new(&config), Err(ConfigError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_memory_client_requires_stream() {
        let client = MemoryStreamClient::new();
        let cancel = CancellationToken::new();

        let result = client.append_events("s", &[event("c", "1")], &cancel).await;
        assert!(matches!(result, Err(ClientError::Status { status: 404, .. })));

        client.ensure_stream("s", &cancel).await.unwrap();
        client.ensure_stream("s", &cancel).await.unwrap();
        client.append_events("s", &[event("c", "1")], &cancel).await.unwrap();

        assert_eq!(client.create_calls(), 1);
        assert_eq!(client.events("s").len(), 1);
        assert_eq!(client.stream_names(), ["s"]);
    }

    #[tokio::test]
    async fn test_empty_append_is_noop() {
        let client = MemoryStreamClient::new();
        client
            .append_events("missing", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(client.append_calls(), 0);
    }
}
