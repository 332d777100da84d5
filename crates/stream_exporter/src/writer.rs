//! Queued writer for instrumentation-side writes.
//!
//! Code that produces single events on a hot path (an agent loop, a tool
//! wrapper) should never wait on the network. [`QueuedWriter::try_write`]
//! puts the event on a bounded queue and returns immediately; one worker task
//! drains the queue in FIFO order, provisioning each stream before appending
//! to it. When the queue is full the event is dropped and counted.

use crate::client::StreamClientBoxed;
use crate::error::{ExporterError, WriteError};
use crate::event::Event;
use crate::partition::StreamNamer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Default number of entries the queue holds before `try_write` starts dropping.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Counters for the queued writer
#[derive(Debug, Default)]
pub struct WriterMetrics {
    /// Events appended to the store
    pub written: AtomicU64,
    /// Events refused because the queue was full or closed
    pub dropped: AtomicU64,
    /// Events the worker could not deliver
    pub failed: AtomicU64,
}

impl WriterMetrics {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

type Entry = (String, Event);

async fn run_worker(
    client: Arc<dyn StreamClientBoxed>,
    mut rx: mpsc::Receiver<Entry>,
    metrics: Arc<WriterMetrics>,
    cancel: CancellationToken,
) {
    while let Some((stream, event)) = rx.recv().await {
        let result = match client.ensure_stream_boxed(&stream, &cancel).await {
            Ok(()) => {
                client
                    .append_events_boxed(&stream, std::slice::from_ref(&event), &cancel)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                metrics.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                metrics.failed.fetch_add(1, Ordering::Relaxed);
                error!(stream = %stream, span_id = %event.span_id, error = %e, "failed to write event");
            }
        }
    }
}

/// Non-blocking single-event writer backed by a bounded queue.
pub struct QueuedWriter {
    tx: Mutex<Option<mpsc::Sender<Entry>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    namer: StreamNamer,
    metrics: Arc<WriterMetrics>,
    cancel: CancellationToken,
}

impl QueuedWriter {
    /// Spawns the worker on the current Tokio runtime.
    ///
    /// A `capacity` of 0 is treated as 1.
    pub fn new(
        client: Arc<dyn StreamClientBoxed>,
        stream_prefix: impl Into<String>,
        capacity: usize,
    ) -> Result<Self, ExporterError> {
        let runtime = Handle::try_current().map_err(|e| ExporterError::NoRuntime(e.to_string()))?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let metrics = Arc::new(WriterMetrics::default());
        let cancel = CancellationToken::new();

        let worker = runtime.spawn(run_worker(client, rx, Arc::clone(&metrics), cancel.clone()));

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            namer: StreamNamer::new(stream_prefix),
            metrics,
            cancel,
        })
    }

    /// Queues `event` for `stream` without waiting.
    ///
    /// A full or closed queue drops the event; the drop is logged and counted.
    pub fn try_write(&self, stream: impl Into<String>, event: Event) -> Result<(), WriteError> {
        let stream = stream.into();
        let result = match self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.try_send((stream, event)).map_err(|e| match e {
                mpsc::error::TrySendError::Full(entry) => (WriteError::Full, entry.0),
                mpsc::error::TrySendError::Closed(entry) => (WriteError::Closed, entry.0),
            }),
            None => Err((WriteError::Closed, stream)),
        };

        result.map_err(|(err, stream)| {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(stream = %stream, error = %err, "dropping event");
            err
        })
    }

    /// Queues `event` on the stream derived from its conversation id.
    pub fn try_write_event(&self, event: Event) -> Result<(), WriteError> {
        let stream = self.namer.stream_name(&event.conversation_id);
        self.try_write(stream, event)
    }

    /// Stops accepting events, then waits for the worker to drain the queue.
    pub async fn close(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "writer task panicked");
            }
        }
    }

    pub fn metrics(&self) -> &Arc<WriterMetrics> {
        &self.metrics
    }

    /// Token that aborts the worker's in-flight store requests.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
