//! End-to-end tests against an in-process mock stream store.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_exporter::client::{AppendRecordsRequest, CreateStreamRequest};
use stream_exporter::{
    ClientError, Event, ExporterConfig, HttpStreamClient, ResourceSpans, RetryConfig, Span,
    SpanKind, SpanStatus, StreamClient, StreamExporter,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const API_KEY: &str = "test-key";

/// Records every request; scripted statuses are returned before normal handling.
#[derive(Default)]
struct MockStore {
    streams: Mutex<HashMap<String, Vec<Event>>>,
    create_calls: AtomicU32,
    append_calls: AtomicU32,
    auth_headers: Mutex<Vec<String>>,
    create_script: Mutex<VecDeque<u16>>,
    append_script: Mutex<VecDeque<u16>>,
    create_delay: Mutex<Option<Duration>>,
}

impl MockStore {
    fn events(&self, stream: &str) -> Vec<Event> {
        self.streams.lock().unwrap().get(stream).cloned().unwrap_or_default()
    }

    fn span_names(&self, stream: &str) -> Vec<String> {
        self.events(stream).into_iter().map(|e| e.span_name).collect()
    }

    fn script_creates(&self, statuses: &[u16]) {
        self.create_script.lock().unwrap().extend(statuses);
    }

    fn script_appends(&self, statuses: &[u16]) {
        self.append_script.lock().unwrap().extend(statuses);
    }

    fn record_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        self.auth_headers.lock().unwrap().push(value);
    }
}

fn scripted(script: &Mutex<VecDeque<u16>>) -> Option<StatusCode> {
    script
        .lock()
        .unwrap()
        .pop_front()
        .map(|code| StatusCode::from_u16(code).unwrap())
}

async fn create_stream(
    State(store): State<Arc<MockStore>>,
    headers: HeaderMap,
    Json(request): Json<CreateStreamRequest>,
) -> StatusCode {
    store.record_auth(&headers);
    store.create_calls.fetch_add(1, Ordering::SeqCst);

    let delay = *store.create_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if let Some(status) = scripted(&store.create_script) {
        return status;
    }

    let mut streams = store.streams.lock().unwrap();
    if streams.contains_key(&request.stream) {
        return StatusCode::CONFLICT;
    }
    streams.insert(request.stream, Vec::new());
    StatusCode::CREATED
}

async fn append_records(
    State(store): State<Arc<MockStore>>,
    Path(stream): Path<String>,
    headers: HeaderMap,
    Json(request): Json<AppendRecordsRequest>,
) -> StatusCode {
    store.record_auth(&headers);
    store.append_calls.fetch_add(1, Ordering::SeqCst);

    if let Some(status) = scripted(&store.append_script) {
        return status;
    }

    let mut streams = store.streams.lock().unwrap();
    let Some(records) = streams.get_mut(&stream) else {
        return StatusCode::NOT_FOUND;
    };
    for record in request.records {
        records.push(Event::from_json(&record.body).unwrap());
    }
    StatusCode::OK
}

/// Serves a fresh mock store on an OS-assigned port.
async fn spawn_store() -> (Arc<MockStore>, String) {
    let store = Arc::new(MockStore::default());
    let app = Router::new()
        .route("/streams", post(create_stream))
        .route("/streams/:name/records", post(append_records))
        .with_state(Arc::clone(&store));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (store, format!("http://{addr}"))
}

fn fast_retry() -> RetryConfig {
    RetryConfig::default().with_initial_delay(Duration::from_millis(10))
}

fn config(endpoint: &str) -> ExporterConfig {
    ExporterConfig::new(endpoint, API_KEY).with_retry(fast_retry())
}

fn conversation(id: &str, steps: u64) -> ResourceSpans {
    let mut resource = ResourceSpans::default();
    for i in 0..steps {
        let mut span = Span::new(42, i + 1, 0, format!("step-{i}"), SpanKind::Client)
            .with_attribute("gen_ai.conversation.id", id)
            .with_attribute("gen_ai.operation.name", "chat");
        span.finish(SpanStatus::Ok);
        resource.add(span);
    }
    resource
}

async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

#[tokio::test]
async fn test_timer_flush_end_to_end() {
    let (store, endpoint) = spawn_store().await;
    let exporter = StreamExporter::from_config(
        config(&endpoint)
            .with_batch_size(100)
            .with_flush_interval(Duration::from_millis(200)),
    )
    .unwrap();
    exporter.start();

    exporter.ingest(&[conversation("conv-123", 3)]);

    // Below the threshold nothing goes out before the timer fires.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);

    assert!(
        wait_until(Duration::from_secs(5), || store.events("agent-session-conv-123").len() == 3).await,
        "timer flush did not deliver the events"
    );
    assert_eq!(store.span_names("agent-session-conv-123"), ["step-0", "step-1", "step-2"]);

    let event = &store.events("agent-session-conv-123")[0];
    assert_eq!(event.conversation_id, "conv-123");
    assert_eq!(event.operation_type, "chat");

    exporter.shutdown().await;
    assert_eq!(store.events("agent-session-conv-123").len(), 3);
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_drains_every_partition() {
    let (store, endpoint) = spawn_store().await;
    let exporter = StreamExporter::from_config(
        config(&endpoint)
            .with_batch_size(4)
            .with_flush_interval(Duration::from_secs(60)),
    )
    .unwrap();
    exporter.start();

    exporter.ingest(&[conversation("a", 10), conversation("b", 3)]);
    exporter.shutdown().await;

    let expected: Vec<_> = (0..10).map(|i| format!("step-{i}")).collect();
    assert_eq!(store.span_names("agent-session-a"), expected);
    assert_eq!(store.span_names("agent-session-b"), ["step-0", "step-1", "step-2"]);
    // a: 4 + 4 by size, 2 at shutdown; b: 3 at shutdown
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 4);
    assert_eq!(store.create_calls.load(Ordering::SeqCst), 2);
    assert_eq!(exporter.metrics().events_exported(), 13);
}

#[tokio::test]
async fn test_requests_carry_bearer_token() {
    let (store, endpoint) = spawn_store().await;
    let exporter = StreamExporter::from_config(config(&endpoint)).unwrap();

    exporter.ingest(&[conversation("conv-1", 1)]);
    exporter.shutdown().await;

    let headers = store.auth_headers.lock().unwrap().clone();
    assert_eq!(headers.len(), 2);
    assert!(headers.iter().all(|h| h == "Bearer test-key"));
}

#[tokio::test]
async fn test_append_retries_server_errors() {
    let (store, endpoint) = spawn_store().await;
    store.script_appends(&[503, 503]);

    let client = HttpStreamClient::new(&config(&endpoint)).unwrap();
    let cancel = CancellationToken::new();
    let event = stream_exporter::EventConverter::new().convert_batch(&[conversation("r", 1)]);

    client.ensure_stream("agent-session-r", &cancel).await.unwrap();
    client.append_events("agent-session-r", &event, &cancel).await.unwrap();

    assert_eq!(store.append_calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.requests_retried(), 2);
    assert_eq!(store.events("agent-session-r").len(), 1);
}

#[tokio::test]
async fn test_append_gives_up_after_three_attempts() {
    let (store, endpoint) = spawn_store().await;
    store.script_appends(&[500, 502, 503]);

    let client = HttpStreamClient::new(&config(&endpoint)).unwrap();
    let cancel = CancellationToken::new();
    let events = stream_exporter::EventConverter::new().convert_batch(&[conversation("r", 2)]);

    client.ensure_stream("agent-session-r", &cancel).await.unwrap();
    let err = client
        .append_events("agent-session-r", &events, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let (store, endpoint) = spawn_store().await;
    store.script_appends(&[400]);

    let client = HttpStreamClient::new(&config(&endpoint)).unwrap();
    let cancel = CancellationToken::new();
    let events = stream_exporter::EventConverter::new().convert_batch(&[conversation("r", 1)]);

    client.ensure_stream("agent-session-r", &cancel).await.unwrap();
    let err = client
        .append_events("agent-session-r", &events, &cancel)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ClientError::Status {
            status: 400,
            body: String::new()
        }
    );
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_existing_stream_is_not_an_error() {
    let (store, endpoint) = spawn_store().await;
    store.script_creates(&[409]);

    let client = HttpStreamClient::new(&config(&endpoint)).unwrap();
    client
        .ensure_stream("agent-session-x", &CancellationToken::new())
        .await
        .unwrap();

    assert!(client.is_known("agent-session-x").await);
    assert_eq!(store.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_create_is_not_cached() {
    let (store, endpoint) = spawn_store().await;
    store.script_creates(&[403]);

    let client = HttpStreamClient::new(&config(&endpoint)).unwrap();
    let cancel = CancellationToken::new();

    let err = client.ensure_stream("agent-session-x", &cancel).await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 403, .. }));
    assert!(!client.is_known("agent-session-x").await);

    client.ensure_stream("agent-session-x", &cancel).await.unwrap();
    assert_eq!(store.create_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_ensure_creates_once() {
    let (store, endpoint) = spawn_store().await;
    *store.create_delay.lock().unwrap() = Some(Duration::from_millis(50));

    let client = Arc::new(HttpStreamClient::new(&config(&endpoint)).unwrap());
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client
                .ensure_stream("agent-session-shared", &CancellationToken::new())
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(store.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.streams_created(), 1);
}

#[tokio::test]
async fn test_slow_create_does_not_block_other_streams() {
    let (store, endpoint) = spawn_store().await;
    let client = Arc::new(HttpStreamClient::new(&config(&endpoint)).unwrap());
    let cancel = CancellationToken::new();
    client.ensure_stream("agent-session-known", &cancel).await.unwrap();

    *store.create_delay.lock().unwrap() = Some(Duration::from_millis(500));
    let started = std::time::Instant::now();
    let creates: Vec<_> = ["agent-session-a", "agent-session-c"]
        .into_iter()
        .map(|stream| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.ensure_stream(stream, &CancellationToken::new()).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // a cached stream answers while both creates are still in flight
    tokio::time::timeout(
        Duration::from_millis(200),
        client.ensure_stream("agent-session-known", &cancel),
    )
    .await
    .expect("cached ensure waited on an unrelated create")
    .unwrap();

    for create in creates {
        create.await.unwrap().unwrap();
    }
    // the two creates overlapped instead of running back to back
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(store.create_calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.streams_created(), 3);
    assert!(client.is_known("agent-session-a").await);
    assert!(client.is_known("agent-session-c").await);
}

#[tokio::test]
async fn test_failing_partition_is_isolated() {
    let (store, endpoint) = spawn_store().await;
    // the first create, for whichever stream flushes first, fails for good
    store.script_creates(&[400]);

    let exporter = StreamExporter::from_config(config(&endpoint)).unwrap();
    exporter.ingest(&[conversation("a", 3), conversation("b", 3)]);
    exporter.shutdown().await;

    let delivered = [store.events("agent-session-a").len(), store.events("agent-session-b").len()];
    assert!(delivered == [3, 0] || delivered == [0, 3], "delivered: {delivered:?}");
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 1);

    let metrics = exporter.metrics();
    assert_eq!(metrics.events_exported(), 3);
    assert_eq!(metrics.batches_dropped(), 1);
    assert_eq!(metrics.events_dropped(), 3);
}

#[tokio::test]
async fn test_cancellation_stops_retries() {
    let (store, endpoint) = spawn_store().await;
    store.script_appends(&[503, 503, 503]);

    let retry = RetryConfig::default().with_initial_delay(Duration::from_millis(500));
    let exporter = StreamExporter::from_config(ExporterConfig::new(&endpoint, API_KEY).with_retry(retry)).unwrap();
    let cancel = exporter.cancellation_token();

    exporter.ingest(&[conversation("slow", 1)]);
    exporter.flush();

    assert!(wait_until(Duration::from_secs(5), || store.append_calls.load(Ordering::SeqCst) == 1).await);
    cancel.cancel();
    exporter.shutdown().await;

    assert_eq!(store.append_calls.load(Ordering::SeqCst), 1);
    assert_eq!(exporter.metrics().events_dropped(), 1);
}
