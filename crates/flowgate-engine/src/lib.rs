#![warn(missing_docs)]

//! Flowgate engine core: many-to-one shared-memory streams, bit-packed stream ids,
//! half-stream lifecycle and per-worker frame dispatch

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod layout;
pub mod load;
pub mod metrics;
pub mod ring;
pub mod state;
pub mod stream_id;
pub mod target;

pub use buffer::AtomicBuffer;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use frame::{FrameHeader, FrameType, FrameView, FRAME_HEADER_SIZE};
pub use layout::StreamsLayout;
pub use load::{LoadEntry, LoadManager, LoadSnapshot};
pub use metrics::{FrameMetrics, MetricHandlerKind, MetricRecorder, NoopMetrics};
pub use ring::ManyToOneRing;
pub use state::LifecycleState;
pub use target::{Handler, MessageConsumer, Target, WritePredicate};
