//! Agent Telemetry Stream Exporter
//!
//! Turns OpenTelemetry-style spans emitted by AI agents into flat, self-contained
//! JSON events and appends them, one stream per conversation, to a remote
//! append-only stream store over HTTP.
//!
//! The pipeline:
//!
//! ```text
//! ResourceSpans ──► EventConverter ──► PartitionBuffer ──► flush lanes ──► StreamClient
//!                                       (per stream)       (one per stream)
//! ```
//!
//! Batches leave the buffer when a stream reaches the batch size or when the
//! periodic timer fires. Each stream is flushed by its own lane, so a stream
//! has at most one batch in flight and receives its events in ingestion order.
//!
//! Clients use native async fn in traits (no `#[async_trait]` macro), with a
//! boxed twin trait for dynamic dispatch.

pub mod buffer;
pub mod client;
pub mod config;
pub mod converter;
pub mod error;
pub mod event;
pub mod exporter;
pub mod partition;
pub mod retry;
pub mod span;
pub mod writer;

// Re-export main types
pub use buffer::{BufferMetrics, PartitionBuffer};
pub use client::{HttpStreamClient, MemoryStreamClient, StreamClient, StreamClientBoxed};
pub use config::ExporterConfig;
pub use converter::EventConverter;
pub use error::{ClientError, ConfigError, ExporterError, WriteError};
pub use event::{Event, EventStatus, ALLOWED_ATTRIBUTES};
pub use exporter::{ExportMetrics, StreamExporter};
pub use partition::{StreamNamer, DEFAULT_PARTITION};
pub use retry::{retry_with_backoff, RetryConfig};
pub use span::{AttributeValue, Attributes, ResourceSpans, Span, SpanKind, SpanStatus};
pub use writer::{QueuedWriter, WriterMetrics, DEFAULT_QUEUE_CAPACITY};
