//! Stream exporter - the pipeline façade.
//!
//! Converts inbound span batches to [`Event`]s, buffers them per stream and
//! flushes each stream's batch to a [`StreamClientBoxed`] when it reaches the
//! batch size or when the periodic timer fires.
//!
//! # Flush lanes
//!
//! A stream with batches in flight owns a lane: a task fed by an unbounded
//! channel that flushes its batches one at a time. Batches are cut and handed
//! to the lane inside the same critical section of the buffer mutex, so a lane
//! sees its stream's batches in ingestion order and there is never more than
//! one in-flight batch per stream. Different lanes run concurrently.
//!
//! A lane whose queue runs dry takes the same mutex, checks the queue once
//! more and unregisters itself, so idle conversations cost nothing. The next
//! batch for that stream spawns a fresh lane.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stream_exporter::{ExporterConfig, MemoryStreamClient, StreamExporter};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(MemoryStreamClient::new());
//! let exporter = StreamExporter::new(ExporterConfig::default(), client)?;
//! exporter.start();
//! // exporter.ingest(&resource_spans);
//! exporter.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::buffer::{BufferMetrics, PartitionBuffer};
use crate::client::{HttpStreamClient, StreamClientBoxed};
use crate::config::ExporterConfig;
use crate::converter::EventConverter;
use crate::error::{ClientError, ExporterError};
use crate::event::Event;
use crate::partition::StreamNamer;
use crate::span::ResourceSpans;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// METRICS
// =============================================================================

/// Thread-safe export counters, shared by every flush lane.
///
/// Separate from [`BufferMetrics`], which uses plain u64 behind the buffer
/// mutex.
#[derive(Debug, Default)]
pub struct ExportMetrics {
    /// Events acknowledged by the store
    pub events_exported: AtomicU64,
    /// Batches acknowledged by the store
    pub batches_exported: AtomicU64,
    /// Batches dropped after a failed flush
    pub batches_dropped: AtomicU64,
    /// Events contained in dropped batches
    pub events_dropped: AtomicU64,
    /// Events refused because the exporter was already shut down
    pub events_rejected: AtomicU64,
    /// Batches handed to a lane and not yet finished
    pub inflight_batches: AtomicU64,
}

impl ExportMetrics {
    pub fn events_exported(&self) -> u64 {
        self.events_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn events_rejected(&self) -> u64 {
        self.events_rejected.load(Ordering::Relaxed)
    }

    pub fn inflight_batches(&self) -> u64 {
        self.inflight_batches.load(Ordering::Relaxed)
    }

    fn record_success(&self, event_count: u64) {
        self.events_exported.fetch_add(event_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self, event_count: u64) {
        self.events_dropped.fetch_add(event_count, Ordering::Relaxed);
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_inflight(&self) {
        self.inflight_batches.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_inflight(&self) {
        self.inflight_batches.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// FLUSH LANES
// =============================================================================

enum LaneMessage {
    Batch(Vec<Event>),
    /// Acknowledged once every batch queued before it has been flushed.
    Barrier(oneshot::Sender<()>),
}

/// What a lane needs to flush; shared by all lanes.
struct FlushContext {
    client: Arc<dyn StreamClientBoxed>,
    metrics: Arc<ExportMetrics>,
    cancel: CancellationToken,
}

impl FlushContext {
    /// Provisions the stream, then appends the batch. Empty batches make no
    /// remote call.
    async fn flush_batch(&self, stream: &str, batch: &[Event]) -> Result<(), ClientError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.client.ensure_stream_boxed(stream, &self.cancel).await?;
        self.client
            .append_events_boxed(stream, batch, &self.cancel)
            .await
    }
}

/// What `dispatch` needs to spawn a lane; shared by the exporter and its lanes.
struct LaneEnv {
    ctx: Arc<FlushContext>,
    runtime: Handle,
    state: Weak<Mutex<FlushState>>,
}

/// Called when a lane's queue looks empty. Under the state lock, returns a
/// message that raced in, or unregisters the lane and returns `None`.
///
/// Batches are only sent while holding this lock, so nothing can arrive for
/// the stream once its entry is gone from the registry.
fn next_or_retire(
    state: &Mutex<FlushState>,
    stream: &str,
    rx: &mut mpsc::UnboundedReceiver<LaneMessage>,
) -> Option<LaneMessage> {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    match rx.try_recv() {
        Ok(message) => Some(message),
        Err(TryRecvError::Empty) => {
            state.lanes.remove(stream);
            None
        }
        Err(TryRecvError::Disconnected) => None,
    }
}

async fn run_lane(
    ctx: Arc<FlushContext>,
    state: Weak<Mutex<FlushState>>,
    stream: String,
    mut rx: mpsc::UnboundedReceiver<LaneMessage>,
) {
    loop {
        let message = match rx.try_recv() {
            Ok(message) => message,
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => match state.upgrade() {
                Some(state) => match next_or_retire(&state, &stream, &mut rx) {
                    Some(message) => message,
                    None => break,
                },
                // Exporter dropped: finish what is already queued.
                None => match rx.recv().await {
                    Some(message) => message,
                    None => break,
                },
            },
        };

        match message {
            LaneMessage::Batch(batch) => {
                let event_count = batch.len() as u64;
                match ctx.flush_batch(&stream, &batch).await {
                    Ok(()) => {
                        ctx.metrics.record_success(event_count);
                        debug!(stream = %stream, event_count, "flushed batch");
                    }
                    Err(e) => {
                        ctx.metrics.record_drop(event_count);
                        error!(
                            stream = %stream,
                            event_count,
                            error = %e,
                            "failed to flush batch, dropping events"
                        );
                    }
                }
                ctx.metrics.dec_inflight();
            }
            LaneMessage::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Buffer plus lane registry, guarded by one mutex.
struct FlushState {
    buffer: PartitionBuffer,
    lanes: HashMap<String, mpsc::UnboundedSender<LaneMessage>>,
    lane_tasks: JoinSet<()>,
    closed: bool,
}

impl FlushState {
    /// Hands a batch to its stream's lane, spawning the lane if the stream has
    /// none.
    ///
    /// Must be called while holding the state lock that cut the batch.
    fn dispatch(&mut self, env: &LaneEnv, stream: String, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let ctx = &env.ctx;
        ctx.metrics.inc_inflight();

        if !self.lanes.contains_key(&stream) {
            self.reap_lanes();
        }
        let lane_tasks = &mut self.lane_tasks;
        let lane = self.lanes.entry(stream.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            lane_tasks.spawn_on(
                run_lane(Arc::clone(ctx), Weak::clone(&env.state), stream.clone(), rx),
                &env.runtime,
            );
            tx
        });

        if let Err(mpsc::error::SendError(message)) = lane.send(LaneMessage::Batch(batch)) {
            // The lane task is gone (it panicked); drop the batch and let the
            // next dispatch start a fresh lane.
            self.lanes.remove(&stream);
            ctx.metrics.dec_inflight();
            if let LaneMessage::Batch(batch) = message {
                ctx.metrics.record_drop(batch.len() as u64);
                error!(
                    stream = %stream,
                    event_count = batch.len(),
                    "flush lane stopped, dropping events"
                );
            }
        }
    }

    fn dispatch_all(&mut self, env: &LaneEnv) -> usize {
        let batches = self.buffer.take_all();
        let count = batches.len();
        for (stream, batch) in batches {
            self.dispatch(env, stream, batch);
        }
        count
    }

    /// Collects lanes that have already retired.
    fn reap_lanes(&mut self) {
        while let Some(result) = self.lane_tasks.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "flush lane panicked");
            }
        }
    }
}

// =============================================================================
// EXPORTER
// =============================================================================

struct Inner {
    converter: EventConverter,
    namer: StreamNamer,
    flush_interval: Duration,
    state: Arc<Mutex<FlushState>>,
    env: LaneEnv,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, FlushState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn buffer_event(&self, event: Event) {
        let stream = self.namer.stream_name(&event.conversation_id);
        let mut state = self.lock_state();

        if state.closed {
            self.env.ctx.metrics.record_rejected();
            warn!(stream = %stream, "exporter is shut down, dropping event");
            return;
        }

        if let Some(batch) = state.buffer.push(&stream, event) {
            state.dispatch(&self.env, stream, batch);
        }
    }

    fn flush_all(&self) -> usize {
        let mut state = self.lock_state();
        state.dispatch_all(&self.env)
    }
}

struct Timer {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

async fn run_timer(inner: Arc<Inner>, stop: CancellationToken) {
    let period = inner.flush_interval;
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = ticks.tick() => {
                let flushed = inner.flush_all();
                if flushed > 0 {
                    debug!(partitions = flushed, "timer flush");
                }
            }
        }
    }
}

/// Buffers agent telemetry per conversation and exports it to a stream store.
///
/// All methods take `&self`; share the exporter behind an `Arc` to ingest
/// from several tasks.
pub struct StreamExporter {
    inner: Arc<Inner>,
    timer: Mutex<Option<Timer>>,
    started: Mutex<bool>,
    /// Held for the whole drain; `true` once a shutdown has completed.
    shut_down: tokio::sync::Mutex<bool>,
}

impl StreamExporter {
    /// Creates an exporter that flushes through `client`.
    ///
    /// Zero or empty optional values in `config` fall back to their defaults.
    /// Must be called from within a Tokio runtime; flush tasks are spawned on it.
    pub fn new(
        mut config: ExporterConfig,
        client: Arc<dyn StreamClientBoxed>,
    ) -> Result<Self, ExporterError> {
        let runtime = Handle::try_current().map_err(|e| ExporterError::NoRuntime(e.to_string()))?;
        config.apply_defaults();

        let ctx = Arc::new(FlushContext {
            client,
            metrics: Arc::new(ExportMetrics::default()),
            cancel: CancellationToken::new(),
        });

        let state = Arc::new(Mutex::new(FlushState {
            buffer: PartitionBuffer::new(config.batch_size),
            lanes: HashMap::new(),
            lane_tasks: JoinSet::new(),
            closed: false,
        }));

        let inner = Arc::new(Inner {
            converter: EventConverter::new(),
            namer: StreamNamer::new(config.stream_prefix),
            flush_interval: config.flush_interval,
            env: LaneEnv {
                ctx,
                runtime,
                state: Arc::downgrade(&state),
            },
            state,
        });

        Ok(Self {
            inner,
            timer: Mutex::new(None),
            started: Mutex::new(false),
            shut_down: tokio::sync::Mutex::new(false),
        })
    }

    /// Validates `config` and creates an exporter backed by an
    /// [`HttpStreamClient`].
    pub fn from_config(mut config: ExporterConfig) -> Result<Self, ExporterError> {
        config.validate()?;
        let client = HttpStreamClient::new(&config)?;
        Self::new(config, Arc::new(client))
    }

    /// Starts the periodic flush timer. Calling it again has no effect.
    pub fn start(&self) {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        if *started || self.inner.lock_state().closed {
            return;
        }
        *started = true;

        let stop = CancellationToken::new();
        let task = self
            .inner
            .env
            .runtime
            .spawn(run_timer(Arc::clone(&self.inner), stop.clone()));
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Timer { stop, task });

        info!(
            client = self.inner.env.ctx.client.name(),
            stream_prefix = self.inner.namer.prefix(),
            flush_interval_ms = self.inner.flush_interval.as_millis() as u64,
            "stream exporter started"
        );
    }

    /// Converts and buffers every span in `batch`. Never fails; events that
    /// cannot be delivered are logged and counted.
    pub fn ingest(&self, batch: &[ResourceSpans]) {
        for event in self.inner.converter.convert_batch(batch) {
            self.inner.buffer_event(event);
        }
    }

    /// Buffers an already converted event.
    pub fn ingest_event(&self, event: Event) {
        self.inner.buffer_event(event);
    }

    /// Hands every pending batch to its lane without waiting.
    ///
    /// Returns the number of streams that had pending events.
    pub fn flush(&self) -> usize {
        self.inner.flush_all()
    }

    /// Flushes every pending batch and waits until all batches handed to a
    /// lane so far have been flushed or dropped.
    pub async fn force_flush(&self) {
        let barriers: Vec<_> = {
            let mut state = self.inner.lock_state();
            state.dispatch_all(&self.inner.env);
            state
                .lanes
                .values()
                .filter_map(|lane| {
                    let (tx, rx) = oneshot::channel();
                    lane.send(LaneMessage::Barrier(tx)).ok().map(|()| rx)
                })
                .collect()
        };

        for barrier in barriers {
            let _ = barrier.await;
        }
    }

    /// Stops the timer, flushes everything pending and waits for every lane to
    /// finish. Events ingested afterwards are rejected.
    ///
    /// Concurrent and repeated calls are safe: every caller returns only after
    /// the drain has completed, and only the first one performs it.
    pub async fn shutdown(&self) {
        let mut shut_down = self.shut_down.lock().await;
        if *shut_down {
            return;
        }

        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(timer) = timer {
            timer.stop.cancel();
            if let Err(e) = timer.task.await {
                error!(error = %e, "flush timer task failed");
            }
        }

        let mut lane_tasks = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            state.dispatch_all(&self.inner.env);
            // Dropping the senders lets each lane exit once its queue is empty.
            state.lanes.clear();
            std::mem::take(&mut state.lane_tasks)
        };

        while let Some(result) = lane_tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "flush lane panicked");
            }
        }
        *shut_down = true;

        let metrics = self.metrics();
        info!(
            events_exported = metrics.events_exported(),
            batches_exported = metrics.batches_exported(),
            events_dropped = metrics.events_dropped(),
            "stream exporter shut down"
        );
    }

    /// Export counters, shared with the flush lanes.
    pub fn metrics(&self) -> &Arc<ExportMetrics> {
        &self.inner.env.ctx.metrics
    }

    /// Snapshot of the buffer counters.
    pub fn buffer_metrics(&self) -> BufferMetrics {
        self.inner.lock_state().buffer.metrics().clone()
    }

    /// Token that aborts in-flight store requests when cancelled.
    ///
    /// Cancelling it makes pending flushes fail fast (and their batches drop);
    /// it does not stop the exporter.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.env.ctx.cancel.clone()
    }

    /// Stream name used for `conversation_id`.
    pub fn stream_name(&self, conversation_id: &str) -> String {
        self.inner.namer.stream_name(conversation_id)
    }

    /// Number of events buffered for `stream` and not yet handed to a lane.
    pub fn pending_len(&self, stream: &str) -> usize {
        self.inner.lock_state().buffer.pending_len(stream)
    }

    /// Total number of buffered events.
    pub fn total_pending(&self) -> usize {
        self.inner.lock_state().buffer.total_pending()
    }

    /// Number of streams that currently have a flush lane.
    pub fn active_lanes(&self) -> usize {
        self.inner.lock_state().lanes.len()
    }
}

impl Drop for StreamExporter {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.stop.cancel();
        }
    }
}
