//! Per-binding frame metrics.
//!
//! The dispatcher reports every stream-control frame, and every reply data
//! frame, once for its origin binding and once for its routed binding.
//! Rendering or exporting the counts is left to the caller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::frame::{
    FrameView, ABORT_TYPE_ID, BEGIN_TYPE_ID, CHALLENGE_TYPE_ID, DATA_TYPE_ID, END_TYPE_ID,
    FLUSH_TYPE_ID, RESET_TYPE_ID, SIGNAL_TYPE_ID, WINDOW_TYPE_ID,
};

/// Which side of a route a metric is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MetricHandlerKind {
    /// The binding a frame originates from.
    Origin,
    /// The binding a frame is routed to.
    Routed,
}

/// Receives one callback per frame and binding.
pub trait MetricRecorder: Send + Sync {
    /// Records `frame` of type `type_id` against `binding_id`.
    fn record(&self, kind: MetricHandlerKind, binding_id: u64, type_id: i32, frame: &[u8]);
}

/// Recorder that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricRecorder for NoopMetrics {
    fn record(&self, _kind: MetricHandlerKind, _binding_id: u64, _type_id: i32, _frame: &[u8]) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Counts for one binding at a point in time.
pub struct BindingMetricsSnapshot {
    /// BEGIN frames.
    pub begin: u64,
    /// DATA frames.
    pub data: u64,
    /// Declared DATA payload bytes, negatives counted as zero.
    pub data_bytes: u64,
    /// END frames.
    pub end: u64,
    /// ABORT frames.
    pub abort: u64,
    /// FLUSH frames.
    pub flush: u64,
    /// RESET frames.
    pub reset: u64,
    /// WINDOW frames.
    pub window: u64,
    /// SIGNAL frames.
    pub signal: u64,
    /// CHALLENGE frames.
    pub challenge: u64,
    /// Frames with an unrecognised type id.
    pub other: u64,
}

impl BindingMetricsSnapshot {
    /// Total frames of any type.
    pub fn frames_total(&self) -> u64 {
        self.begin
            + self.data
            + self.end
            + self.abort
            + self.flush
            + self.reset
            + self.window
            + self.signal
            + self.challenge
            + self.other
    }
}

#[derive(Debug, Clone, Default, Serialize)]
/// Counts for every binding seen so far.
pub struct MetricsSnapshot {
    /// Keyed by origin binding id.
    pub origin: BTreeMap<u64, BindingMetricsSnapshot>,
    /// Keyed by routed binding id.
    pub routed: BTreeMap<u64, BindingMetricsSnapshot>,
}

#[derive(Default)]
struct BindingCounters {
    begin: AtomicU64,
    data: AtomicU64,
    data_bytes: AtomicU64,
    end: AtomicU64,
    abort: AtomicU64,
    flush: AtomicU64,
    reset: AtomicU64,
    window: AtomicU64,
    signal: AtomicU64,
    challenge: AtomicU64,
    other: AtomicU64,
}

impl BindingCounters {
    fn record(&self, type_id: i32, frame: &[u8]) {
        let counter = match type_id {
            BEGIN_TYPE_ID => &self.begin,
            DATA_TYPE_ID => {
                let bytes = FrameView::wrap(frame)
                    .ok()
                    .and_then(|view| view.data_length())
                    .unwrap_or(0)
                    .max(0);
                self.data_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                &self.data
            }
            END_TYPE_ID => &self.end,
            ABORT_TYPE_ID => &self.abort,
            FLUSH_TYPE_ID => &self.flush,
            RESET_TYPE_ID => &self.reset,
            WINDOW_TYPE_ID => &self.window,
            SIGNAL_TYPE_ID => &self.signal,
            CHALLENGE_TYPE_ID => &self.challenge,
            _ => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BindingMetricsSnapshot {
        BindingMetricsSnapshot {
            begin: self.begin.load(Ordering::Relaxed),
            data: self.data.load(Ordering::Relaxed),
            data_bytes: self.data_bytes.load(Ordering::Relaxed),
            end: self.end.load(Ordering::Relaxed),
            abort: self.abort.load(Ordering::Relaxed),
            flush: self.flush.load(Ordering::Relaxed),
            reset: self.reset.load(Ordering::Relaxed),
            window: self.window.load(Ordering::Relaxed),
            signal: self.signal.load(Ordering::Relaxed),
            challenge: self.challenge.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe frame counters keyed by binding id.
#[derive(Default)]
pub struct FrameMetrics {
    origin: DashMap<u64, Arc<BindingCounters>>,
    routed: DashMap<u64, Arc<BindingCounters>>,
}

impl FrameMetrics {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: MetricHandlerKind) -> &DashMap<u64, Arc<BindingCounters>> {
        match kind {
            MetricHandlerKind::Origin => &self.origin,
            MetricHandlerKind::Routed => &self.routed,
        }
    }

    /// Counts for one binding, if it has been seen.
    pub fn binding(
        &self,
        kind: MetricHandlerKind,
        binding_id: u64,
    ) -> Option<BindingMetricsSnapshot> {
        self.table(kind)
            .get(&binding_id)
            .map(|counters| counters.snapshot())
    }

    /// Counts for every binding.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let collect = |table: &DashMap<u64, Arc<BindingCounters>>| {
            table
                .iter()
                .map(|entry| (*entry.key(), entry.value().snapshot()))
                .collect()
        };

        MetricsSnapshot {
            origin: collect(&self.origin),
            routed: collect(&self.routed),
        }
    }

    /// Forgets a binding, as when it is detached.
    pub fn remove(&self, binding_id: u64) {
        self.origin.remove(&binding_id);
        self.routed.remove(&binding_id);
    }
}

impl MetricRecorder for FrameMetrics {
    fn record(&self, kind: MetricHandlerKind, binding_id: u64, type_id: i32, frame: &[u8]) {
        let counters = self
            .table(kind)
            .entry(binding_id)
            .or_default()
            .value()
            .clone();
        counters.record(type_id, frame);
    }
}

impl std::fmt::Debug for FrameMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
