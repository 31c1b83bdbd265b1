//! Per-destination frame dispatch.
//!
//! A [`Target`] is the write side of one worker's streams ring. Every frame
//! addressed to that worker passes through [`Target::write`], which classifies
//! it by stream direction and type, keeps the stream, throttle and
//! correlation tables in step with what was actually written, and records
//! metrics and load. On [`Target::close`] every sender still registered
//! receives a synthetic RESET so no upstream half is left waiting.
//!
//! Tables are keyed the way stream ids route: `streams[stream_index]` and
//! `throttles[throttle_index]`, each mapping instance id to handler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::frame::{
    is_stream_control, FrameHeader, FrameView, ABORT_TYPE_ID, BEGIN_TYPE_ID, CHALLENGE_TYPE_ID,
    DATA_TYPE_ID, END_TYPE_ID, FLUSH_TYPE_ID, RESET_TYPE_ID, SIGNAL_TYPE_ID, WINDOW_TYPE_ID,
};
use crate::layout::StreamsLayout;
use crate::load::LoadManager;
use crate::metrics::{MetricHandlerKind, MetricRecorder};
use crate::ring::ManyToOneRing;
use crate::state::LifecycleState;
use crate::stream_id::{
    initial_id, instance_id, is_initial, stream_index, throttle_id, throttle_index,
};

/// Receives frames delivered outside the ring: synthetic frames and throttle traffic.
pub trait MessageConsumer: Send + Sync {
    /// Handles one encoded frame.
    fn accept(&self, type_id: i32, frame: &[u8]);
}

impl<F> MessageConsumer for F
where
    F: Fn(i32, &[u8]) + Send + Sync,
{
    fn accept(&self, type_id: i32, frame: &[u8]) {
        self(type_id, frame)
    }
}

/// Shared handle to a registered consumer.
pub type Handler = Arc<dyn MessageConsumer>;

/// Writes one frame to the destination; `Ok(false)` means it was not written.
pub type WritePredicate = Box<dyn FnMut(i32, &[u8]) -> Result<bool> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    System,
    Initial,
    Reply,
}

fn scope(stream_id: u64) -> Scope {
    if stream_id == 0 {
        Scope::System
    } else if is_initial(stream_id) {
        Scope::Initial
    } else {
        Scope::Reply
    }
}

/// Write path and tracking tables for one destination worker.
pub struct Target {
    local_index: usize,
    name: String,
    layout: Option<StreamsLayout>,
    streams_buffer: WritePredicate,
    synthetic_abort: bool,
    correlations: HashMap<u64, Handler>,
    streams: Vec<HashMap<u64, Handler>>,
    throttles: Vec<HashMap<u64, Handler>>,
    stream_sets: HashMap<u64, HashSet<u64>>,
    lifecycles: HashMap<u64, LifecycleState>,
    metrics: Arc<dyn MetricRecorder>,
    loads: Arc<LoadManager>,
}

impl Target {
    /// Attaches to the existing `data<index>` streams file under the configured directory.
    pub fn open(
        config: &EngineConfig,
        index: usize,
        metrics: Arc<dyn MetricRecorder>,
        loads: Arc<LoadManager>,
    ) -> Result<Self> {
        config.validate()?;
        check_index(index, config.worker_count)?;

        let layout = StreamsLayout::open(&config.streams_path(index))?;
        let ring = layout.ring().clone();
        let name = layout.name();

        let mut target = Self::with_ring(index, name, config, ring, metrics, loads)?;
        target.layout = Some(layout);
        Ok(target)
    }

    /// Writes into an already mapped ring.
    pub fn with_ring(
        index: usize,
        name: impl Into<String>,
        config: &EngineConfig,
        ring: Arc<ManyToOneRing>,
        metrics: Arc<dyn MetricRecorder>,
        loads: Arc<LoadManager>,
    ) -> Result<Self> {
        let writer: WritePredicate =
            Box::new(move |type_id: i32, frame: &[u8]| ring.write(type_id, frame));
        Self::with_writer(index, name, config, writer, metrics, loads)
    }

    /// Writes through an arbitrary predicate.
    pub fn with_writer(
        index: usize,
        name: impl Into<String>,
        config: &EngineConfig,
        writer: WritePredicate,
        metrics: Arc<dyn MetricRecorder>,
        loads: Arc<LoadManager>,
    ) -> Result<Self> {
        check_index(index, config.worker_count)?;

        let worker_count = config.worker_count;
        Ok(Self {
            local_index: index,
            name: name.into(),
            layout: None,
            streams_buffer: writer,
            synthetic_abort: config.synthetic_abort,
            correlations: HashMap::new(),
            streams: (0..worker_count).map(|_| HashMap::new()).collect(),
            throttles: (0..worker_count).map(|_| HashMap::new()).collect(),
            stream_sets: HashMap::new(),
            lifecycles: HashMap::new(),
            metrics,
            loads,
        })
    }

    /// Index of the worker this target writes to.
    pub fn local_index(&self) -> usize {
        self.local_index
    }

    /// Name of the destination, `data<N>` for file-backed targets.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatches one encoded frame.
    ///
    /// Returns [`EngineError::Unwritable`] if the destination refused a frame
    /// that had to be delivered. The tables have already been updated as if it
    /// had been, so the target must not be used afterwards.
    pub fn write(&mut self, type_id: i32, frame: &[u8]) -> Result<()> {
        let view = FrameView::wrap(frame)?;
        let origin_id = view.origin_id();
        let routed_id = view.routed_id();
        let stream_id = view.stream_id();

        let handled = match scope(stream_id) {
            Scope::System => self.write_system(type_id, frame)?,
            Scope::Initial => self.write_initial(origin_id, routed_id, stream_id, type_id, &view)?,
            Scope::Reply => self.write_reply(origin_id, routed_id, stream_id, type_id, &view)?,
        };

        if !handled {
            return Err(EngineError::Unwritable {
                target: self.name.clone(),
                type_id,
                stream_id,
            });
        }

        Ok(())
    }

    fn write_system(&mut self, type_id: i32, frame: &[u8]) -> Result<bool> {
        // FLUSH and WINDOW are the only system frames with a defined meaning;
        // anything else is passed through untouched.
        (self.streams_buffer)(type_id, frame)
    }

    fn write_initial(
        &mut self,
        origin_id: u64,
        routed_id: u64,
        stream_id: u64,
        type_id: i32,
        view: &FrameView<'_>,
    ) -> Result<bool> {
        let frame = view.as_bytes();

        if !is_stream_control(type_id) {
            let handled = match type_id {
                BEGIN_TYPE_ID => {
                    let handled = (self.streams_buffer)(type_id, frame)?;
                    self.track(stream_id, true, LifecycleState::open_initial);
                    handled
                }
                DATA_TYPE_ID | FLUSH_TYPE_ID => (self.streams_buffer)(type_id, frame)?,
                END_TYPE_ID | ABORT_TYPE_ID => {
                    let handled = (self.streams_buffer)(type_id, frame)?;
                    self.remove_throttle(stream_id);
                    self.track(stream_id, false, LifecycleState::close_initial);
                    handled
                }
                _ => true,
            };
            return Ok(handled);
        }

        self.record_metrics(origin_id, routed_id, type_id, frame);

        let handled = match type_id {
            WINDOW_TYPE_ID | SIGNAL_TYPE_ID | CHALLENGE_TYPE_ID => {
                (self.streams_buffer)(type_id, frame)?
            }
            RESET_TYPE_ID => {
                let handled = (self.streams_buffer)(type_id, frame)?;
                self.remove_stream(stream_id);
                self.loads
                    .entry(routed_id)
                    .initial_closed(1)
                    .initial_errored(1);
                self.remove_route_stream(routed_id, stream_id);
                self.track(stream_id, false, LifecycleState::close_initial);
                handled
            }
            _ => true,
        };
        Ok(handled)
    }

    fn write_reply(
        &mut self,
        origin_id: u64,
        routed_id: u64,
        stream_id: u64,
        type_id: i32,
        view: &FrameView<'_>,
    ) -> Result<bool> {
        let frame = view.as_bytes();

        if !is_stream_control(type_id) {
            self.record_metrics(origin_id, routed_id, type_id, frame);

            let handled = match type_id {
                BEGIN_TYPE_ID => {
                    self.loads.entry(routed_id).reply_opened(1);
                    let handled = (self.streams_buffer)(type_id, frame)?;
                    self.track(stream_id, true, LifecycleState::open_reply);
                    handled
                }
                DATA_TYPE_ID => {
                    // may be negative if the producer has not filled it in
                    let bytes_written = view.data_length().unwrap_or(0).max(0);
                    self.loads
                        .entry(routed_id)
                        .reply_bytes_written(bytes_written as u64);
                    (self.streams_buffer)(type_id, frame)?
                }
                END_TYPE_ID => {
                    self.loads.entry(routed_id).reply_closed(1);
                    let handled = (self.streams_buffer)(type_id, frame)?;
                    self.remove_throttle(stream_id);
                    self.track(stream_id, false, LifecycleState::close_reply);
                    handled
                }
                ABORT_TYPE_ID => {
                    self.loads.entry(routed_id).reply_closed(1).reply_errored(1);
                    let handled = (self.streams_buffer)(type_id, frame)?;
                    self.remove_throttle(stream_id);
                    self.track(stream_id, false, LifecycleState::abort_reply);
                    handled
                }
                FLUSH_TYPE_ID => (self.streams_buffer)(type_id, frame)?,
                _ => true,
            };
            return Ok(handled);
        }

        let handled = match type_id {
            WINDOW_TYPE_ID | SIGNAL_TYPE_ID | CHALLENGE_TYPE_ID => {
                (self.streams_buffer)(type_id, frame)?
            }
            RESET_TYPE_ID => {
                let handled = (self.streams_buffer)(type_id, frame)?;
                self.remove_stream(stream_id);
                self.correlations.remove(&stream_id);
                self.remove_route_stream(routed_id, stream_id);
                self.track(stream_id, false, LifecycleState::close_reply);
                handled
            }
            _ => true,
        };
        Ok(handled)
    }

    fn record_metrics(&self, origin_id: u64, routed_id: u64, type_id: i32, frame: &[u8]) {
        self.metrics
            .record(MetricHandlerKind::Origin, origin_id, type_id, frame);
        self.metrics
            .record(MetricHandlerKind::Routed, routed_id, type_id, frame);
    }

    fn remove_stream(&mut self, stream_id: u64) -> Option<Handler> {
        self.streams
            .get_mut(stream_index(stream_id))
            .and_then(|table| table.remove(&instance_id(stream_id)))
    }

    fn remove_throttle(&mut self, stream_id: u64) -> Option<Handler> {
        self.throttles
            .get_mut(throttle_index(stream_id))
            .and_then(|table| table.remove(&instance_id(stream_id)))
    }

    fn remove_route_stream(&mut self, routed_id: u64, stream_id: u64) {
        if let Some(stream_ids) = self.stream_sets.get_mut(&routed_id) {
            stream_ids.remove(&stream_id);
        }
    }

    fn track(
        &mut self,
        stream_id: u64,
        create: bool,
        transition: fn(LifecycleState) -> LifecycleState,
    ) {
        let key = initial_id(stream_id);
        if !create && !self.lifecycles.contains_key(&key) {
            return;
        }

        let state = self.lifecycles.entry(key).or_default();
        *state = transition(*state);

        // the other half may be written by another worker's target
        if !create && state.settled() {
            self.lifecycles.remove(&key);
            trace!(name = %self.name, initial_id = key, "stream pair closed");
        }
    }

    /// Registers the handler that receives frames for `stream_id`.
    pub fn register_stream(&mut self, stream_id: u64, handler: Handler) -> Result<()> {
        let index = stream_index(stream_id);
        let limit = self.streams.len();
        let table = self
            .streams
            .get_mut(index)
            .ok_or(EngineError::WorkerIndexOutOfRange { index, limit })?;
        table.insert(instance_id(stream_id), handler);
        Ok(())
    }

    /// Registers the sender that receives throttle frames for `stream_id`.
    pub fn register_throttle(&mut self, stream_id: u64, handler: Handler) -> Result<()> {
        let index = throttle_index(stream_id);
        let limit = self.throttles.len();
        let table = self
            .throttles
            .get_mut(index)
            .ok_or(EngineError::WorkerIndexOutOfRange { index, limit })?;
        table.insert(instance_id(stream_id), handler);
        Ok(())
    }

    /// Parks the handler waiting for the reply BEGIN of `reply_id`.
    pub fn register_correlation(&mut self, reply_id: u64, handler: Handler) {
        self.correlations.insert(reply_id, handler);
    }

    /// Moves the handler waiting on `reply_id` into the stream table.
    ///
    /// Returns `false` if nothing was waiting.
    pub fn resolve_correlation(&mut self, reply_id: u64) -> Result<bool> {
        match self.correlations.remove(&reply_id) {
            Some(handler) => {
                self.register_stream(reply_id, handler)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Records `stream_id` as an active stream of binding `routed_id`.
    pub fn register_route_stream(&mut self, routed_id: u64, stream_id: u64) {
        if self
            .stream_sets
            .entry(routed_id)
            .or_default()
            .insert(stream_id)
        {
            self.loads.entry(routed_id).initial_opened(1);
        }
    }

    /// Drops the throttle entry for `stream_id` without sending anything.
    pub fn detach_sender(&mut self, stream_id: u64) -> Option<Handler> {
        self.remove_throttle(stream_id)
    }

    /// Forgets every active stream of binding `routed_id`.
    ///
    /// Each stream handler still registered is removed and, unless disabled
    /// in the configuration, receives a synthetic ABORT. Returns the number of
    /// handlers removed.
    pub fn detach_streams(&mut self, routed_id: u64) -> usize {
        let Some(stream_ids) = self.stream_sets.remove(&routed_id) else {
            return 0;
        };

        let mut detached = 0;
        for stream_id in stream_ids {
            self.lifecycles.remove(&initial_id(stream_id));

            if let Some(handler) = self.remove_stream(stream_id) {
                if self.synthetic_abort {
                    let abort = FrameHeader::synthetic_abort(stream_id).to_bytes();
                    handler.accept(ABORT_TYPE_ID, &abort);
                }
                detached += 1;
            }
        }

        debug!(name = %self.name, routed_id, detached, "detached streams");
        detached
    }

    /// Current lifecycle of the pair `stream_id` belongs to.
    pub fn lifecycle(&self, stream_id: u64) -> Option<LifecycleState> {
        self.lifecycles.get(&initial_id(stream_id)).copied()
    }

    /// Whether a stream handler is registered for `stream_id`.
    pub fn has_stream(&self, stream_id: u64) -> bool {
        self.streams
            .get(stream_index(stream_id))
            .is_some_and(|table| table.contains_key(&instance_id(stream_id)))
    }

    /// Whether a throttle handler is registered for `stream_id`.
    pub fn has_throttle(&self, stream_id: u64) -> bool {
        self.throttles
            .get(throttle_index(stream_id))
            .is_some_and(|table| table.contains_key(&instance_id(stream_id)))
    }

    /// Whether a handler is waiting on `reply_id`.
    pub fn has_correlation(&self, reply_id: u64) -> bool {
        self.correlations.contains_key(&reply_id)
    }

    /// Active streams of binding `routed_id`.
    pub fn route_streams(&self, routed_id: u64) -> Option<&HashSet<u64>> {
        self.stream_sets.get(&routed_id)
    }

    /// Number of throttle entries across all workers.
    pub fn throttle_count(&self) -> usize {
        self.throttles.iter().map(HashMap::len).sum()
    }

    /// Stops writing to the destination.
    ///
    /// Writes issued afterwards report success without touching the ring, so
    /// producers racing the teardown do not fail.
    pub fn detach(&mut self) {
        self.streams_buffer = Box::new(|_, _| Ok(true));
        debug!(name = %self.name, "detached");
    }

    /// Sends a synthetic RESET to every registered sender and releases the layout.
    ///
    /// Returns the number of RESET frames delivered.
    pub fn close(mut self) -> usize {
        let local_index = self.local_index;
        let mut resets = 0;

        for (remote_index, table) in self.throttles.iter_mut().enumerate() {
            for (id, handler) in table.drain() {
                let reset =
                    FrameHeader::synthetic_reset(throttle_id(local_index, remote_index, id))
                        .to_bytes();
                handler.accept(RESET_TYPE_ID, &reset);
                resets += 1;
            }
        }

        self.lifecycles.clear();
        info!(name = %self.name, resets, "closed");

        drop(self.layout.take());
        resets
    }
}

fn check_index(index: usize, limit: usize) -> Result<()> {
    if index >= limit {
        return Err(EngineError::WorkerIndexOutOfRange { index, limit });
    }
    Ok(())
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("local_index", &self.local_index)
            .field("correlations", &self.correlations.len())
            .field("throttles", &self.throttle_count())
            .field("lifecycles", &self.lifecycles.len())
            .finish()
    }
}
