//! Partitioned Buffer - Pure Batching Abstraction
//!
//! Groups pending events by stream name and decides when a stream's batch is
//! full. Like the rest of the batching layer it has no concurrency of its own:
//! the exporter wraps it in a single mutex and moves batches out with
//! [`PartitionBuffer::push`] and [`PartitionBuffer::take_all`].
//!
//! A batch leaves the buffer by value. The slot it came from is removed in the
//! same call, so an event can never be part of two batches.

use crate::event::Event;
use std::collections::HashMap;

/// Counters for buffer activity (plain u64; the buffer lives behind a mutex)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferMetrics {
    /// Events accepted into the buffer
    pub events_buffered: u64,
    /// Batches cut because a stream reached the batch size
    pub size_triggered: u64,
    /// Batches cut by a drain of every stream (timer, shutdown, force flush)
    pub drained: u64,
}

/// Pending events, grouped by stream name, in arrival order.
#[derive(Debug)]
pub struct PartitionBuffer {
    pending: HashMap<String, Vec<Event>>,
    batch_size: usize,
    metrics: BufferMetrics,
}

impl PartitionBuffer {
    /// Creates an empty buffer. A `batch_size` of 0 is treated as 1.
    pub fn new(batch_size: usize) -> Self {
        Self {
            pending: HashMap::new(),
            batch_size: batch_size.max(1),
            metrics: BufferMetrics::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Appends `event` to `stream`.
    ///
    /// Returns the stream's whole pending batch when this append brings it to
    /// the batch size; the stream is then empty again.
    pub fn push(&mut self, stream: &str, event: Event) -> Option<Vec<Event>> {
        self.metrics.events_buffered += 1;

        let len = match self.pending.get_mut(stream) {
            Some(events) => {
                events.push(event);
                events.len()
            }
            None => {
                let mut events = Vec::with_capacity(self.batch_size.min(64));
                events.push(event);
                self.pending.insert(stream.to_owned(), events);
                1
            }
        };

        if len >= self.batch_size {
            self.metrics.size_triggered += 1;
            self.pending.remove(stream)
        } else {
            None
        }
    }

    /// Removes and returns the pending batch of every non-empty stream.
    pub fn take_all(&mut self) -> Vec<(String, Vec<Event>)> {
        let batches: Vec<_> = self
            .pending
            .drain()
            .filter(|(_, events)| !events.is_empty())
            .collect();
        self.metrics.drained += batches.len() as u64;
        batches
    }

    /// Number of events pending for `stream`.
    pub fn pending_len(&self, stream: &str) -> usize {
        self.pending.get(stream).map_or(0, Vec::len)
    }

    /// Returns the total number of pending events
    pub fn total_pending(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Number of streams with pending events.
    pub fn partition_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn metrics(&self) -> &BufferMetrics {
        &self.metrics
    }
}
