//! Error types for the engine core.

use thiserror::Error;

/// Errors raised by the ring transport, layouts and frame dispatch.
///
/// Capacity exhaustion is not an error: it is reported as `Ok(false)` from
/// [`ManyToOneRing::write`](crate::ring::ManyToOneRing::write) and as
/// `Ok(None)` from [`try_claim`](crate::ring::ManyToOneRing::try_claim).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Usable ring capacity is not a power of two.
    #[error("ring capacity must be a positive power of two, got {capacity}")]
    InvalidCapacity {
        /// The offending capacity in bytes.
        capacity: usize,
    },

    /// Backing memory is not aligned for atomic record access.
    #[error("buffer at 0x{address:x} is not 8-byte aligned")]
    MisalignedBuffer {
        /// Base address of the buffer.
        address: usize,
    },

    /// Record type ids must be positive; `-1` is reserved for padding.
    #[error("message type id must be greater than zero, got {0}")]
    InvalidTypeId(i32),

    /// Payload exceeds the ring's maximum message length.
    #[error("encoded message exceeds max message length of {max_length}, length={length}")]
    MessageTooLarge {
        /// Payload length in bytes.
        length: usize,
        /// Maximum payload length accepted by the ring.
        max_length: usize,
    },

    /// Frame bytes do not contain a complete header or extension.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// Configuration failed validation.
    #[error("invalid engine configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// Worker index does not fit the configured worker count.
    #[error("worker index {index} out of range (limit {limit})")]
    WorkerIndexOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of addressable workers.
        limit: usize,
    },

    /// A frame that must be delivered could not be written.
    ///
    /// The tracking tables no longer match what was transmitted, so the
    /// dispatcher that raised this must not be used further.
    #[error("unable to write to streams buffer {target}: type 0x{type_id:08x} stream 0x{stream_id:016x}")]
    Unwritable {
        /// Name of the destination streams buffer.
        target: String,
        /// Frame type id.
        type_id: i32,
        /// Frame stream id.
        stream_id: u64,
    },

    /// Layout file creation or mapping failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
