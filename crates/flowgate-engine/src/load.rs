//! Load counters per routed binding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Cumulative stream counters for one binding.
///
/// Counters only grow. The number of streams still open is derived from
/// them, so closing a stream shows up as that gauge going down.
#[derive(Debug, Default)]
pub struct LoadEntry {
    initial_opened: AtomicU64,
    initial_closed: AtomicU64,
    initial_errored: AtomicU64,
    reply_opened: AtomicU64,
    reply_closed: AtomicU64,
    reply_errored: AtomicU64,
    reply_bytes_written: AtomicU64,
}

impl LoadEntry {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts initial streams opened.
    pub fn initial_opened(&self, count: u64) -> &Self {
        self.initial_opened.fetch_add(count, Ordering::Relaxed);
        self
    }

    /// Counts initial streams closed.
    pub fn initial_closed(&self, count: u64) -> &Self {
        self.initial_closed.fetch_add(count, Ordering::Relaxed);
        self
    }

    /// Counts initial streams closed by error.
    pub fn initial_errored(&self, count: u64) -> &Self {
        self.initial_errored.fetch_add(count, Ordering::Relaxed);
        self
    }

    /// Counts reply streams opened.
    pub fn reply_opened(&self, count: u64) -> &Self {
        self.reply_opened.fetch_add(count, Ordering::Relaxed);
        self
    }

    /// Counts reply streams closed.
    pub fn reply_closed(&self, count: u64) -> &Self {
        self.reply_closed.fetch_add(count, Ordering::Relaxed);
        self
    }

    /// Counts reply streams closed by error.
    pub fn reply_errored(&self, count: u64) -> &Self {
        self.reply_errored.fetch_add(count, Ordering::Relaxed);
        self
    }

    /// Adds reply payload bytes written.
    pub fn reply_bytes_written(&self, bytes: u64) -> &Self {
        self.reply_bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            initial_opened: self.initial_opened.load(Ordering::Relaxed),
            initial_closed: self.initial_closed.load(Ordering::Relaxed),
            initial_errored: self.initial_errored.load(Ordering::Relaxed),
            reply_opened: self.reply_opened.load(Ordering::Relaxed),
            reply_closed: self.reply_closed.load(Ordering::Relaxed),
            reply_errored: self.reply_errored.load(Ordering::Relaxed),
            reply_bytes_written: self.reply_bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Snapshot of a [`LoadEntry`].
pub struct LoadSnapshot {
    /// Initial streams opened.
    pub initial_opened: u64,
    /// Initial streams closed.
    pub initial_closed: u64,
    /// Initial streams closed by error.
    pub initial_errored: u64,
    /// Reply streams opened.
    pub reply_opened: u64,
    /// Reply streams closed.
    pub reply_closed: u64,
    /// Reply streams closed by error.
    pub reply_errored: u64,
    /// Reply payload bytes written.
    pub reply_bytes_written: u64,
}

impl LoadSnapshot {
    /// Initial streams opened and not yet closed.
    pub fn initial_active(&self) -> u64 {
        self.initial_opened.saturating_sub(self.initial_closed)
    }

    /// Reply streams opened and not yet closed.
    pub fn reply_active(&self) -> u64 {
        self.reply_opened.saturating_sub(self.reply_closed)
    }
}

/// Load entries keyed by binding id, shared across dispatchers.
#[derive(Debug, Default)]
pub struct LoadManager {
    entries: DashMap<u64, Arc<LoadEntry>>,
}

impl LoadManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `binding_id`, created on first use.
    pub fn entry(&self, binding_id: u64) -> Arc<LoadEntry> {
        self.entries.entry(binding_id).or_default().value().clone()
    }

    /// Snapshot for `binding_id`, if any counter was touched.
    pub fn snapshot(&self, binding_id: u64) -> Option<LoadSnapshot> {
        self.entries.get(&binding_id).map(|entry| entry.snapshot())
    }

    /// Drops the entry for a detached binding.
    pub fn remove(&self, binding_id: u64) -> Option<Arc<LoadEntry>> {
        self.entries.remove(&binding_id).map(|(_, entry)| entry)
    }

    /// Number of tracked bindings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no binding is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
