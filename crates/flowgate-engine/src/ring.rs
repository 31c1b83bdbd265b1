//! Many-to-one ring buffer over shared memory.
//!
//! Any number of producers claim space by compare-and-swap on the length field
//! at the current tail; exactly one consumer drains published records in order.
//!
//! # Layout
//!
//! ```text
//! [0, capacity)             records, each [type:i32][length:i32][payload], 8-byte aligned
//! capacity + 128            tail position (i64)
//! capacity + 256            head cache position (i64)
//! capacity + 384            head position (i64)
//! capacity + 512            correlation counter (i64)
//! capacity + 640            consumer heartbeat (i64)
//! ```
//!
//! A negative record length marks space that is claimed but not yet published;
//! a record type of [`PADDING_MSG_TYPE_ID`] marks space the consumer skips.

use std::sync::atomic::{fence, Ordering};

use tracing::warn;

use crate::buffer::AtomicBuffer;
use crate::error::{EngineError, Result};

/// Record type id of padding records.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Record header length: type id plus length.
pub const HEADER_LENGTH: usize = 8;

/// Alignment of every record.
pub const ALIGNMENT: usize = 8;

const TYPE_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = 4;

/// Offset of the tail position within the trailer.
pub const TAIL_POSITION_OFFSET: usize = 128;
/// Offset of the cached head position within the trailer.
pub const HEAD_CACHE_POSITION_OFFSET: usize = 256;
/// Offset of the head position within the trailer.
pub const HEAD_POSITION_OFFSET: usize = 384;
/// Offset of the correlation id counter within the trailer.
pub const CORRELATION_COUNTER_OFFSET: usize = 512;
/// Offset of the consumer heartbeat timestamp within the trailer.
pub const CONSUMER_HEARTBEAT_OFFSET: usize = 640;
/// Length of the trailer that follows the record area.
pub const TRAILER_LENGTH: usize = 768;

#[inline]
fn type_offset(record_index: usize) -> usize {
    record_index + TYPE_OFFSET
}

#[inline]
fn length_offset(record_index: usize) -> usize {
    record_index + LENGTH_OFFSET
}

#[inline]
fn encoded_msg_offset(record_index: usize) -> usize {
    record_index + HEADER_LENGTH
}

/// Rounds `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn check_type_id(msg_type_id: i32) -> Result<()> {
    if msg_type_id < 1 {
        return Err(EngineError::InvalidTypeId(msg_type_id));
    }
    Ok(())
}

/// Ring buffer exchanging typed records from many producers to one consumer.
pub struct ManyToOneRing {
    buffer: AtomicBuffer,
    capacity: usize,
    max_msg_length: usize,
    tail_position_index: usize,
    head_cache_position_index: usize,
    head_position_index: usize,
    correlation_counter_index: usize,
    consumer_heartbeat_index: usize,
}

/// Publishes the consumed block when a read finishes, even if the handler panics.
struct HeadAdvance<'a> {
    ring: &'a ManyToOneRing,
    head: i64,
    bytes_read: usize,
}

impl Drop for HeadAdvance<'_> {
    fn drop(&mut self) {
        if self.bytes_read != 0 {
            self.ring.buffer.put_i64_ordered(
                self.ring.head_position_index,
                self.head + self.bytes_read as i64,
            );
        }
    }
}

impl ManyToOneRing {
    /// Wraps `buffer`, whose length must be a power of two plus [`TRAILER_LENGTH`].
    pub fn new(buffer: AtomicBuffer) -> Result<Self> {
        let total = buffer.capacity();
        let capacity = total.saturating_sub(TRAILER_LENGTH);
        if total < TRAILER_LENGTH || !capacity.is_power_of_two() || capacity > i32::MAX as usize {
            return Err(EngineError::InvalidCapacity { capacity });
        }

        buffer.verify_alignment()?;

        Ok(Self {
            buffer,
            capacity,
            max_msg_length: capacity / 8,
            tail_position_index: capacity + TAIL_POSITION_OFFSET,
            head_cache_position_index: capacity + HEAD_CACHE_POSITION_OFFSET,
            head_position_index: capacity + HEAD_POSITION_OFFSET,
            correlation_counter_index: capacity + CORRELATION_COUNTER_OFFSET,
            consumer_heartbeat_index: capacity + CONSUMER_HEARTBEAT_OFFSET,
        })
    }

    /// Allocates a heap-backed ring with `capacity` usable bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::new(AtomicBuffer::allocate(capacity + TRAILER_LENGTH))
    }

    /// Usable record capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload accepted by `write` and `try_claim`.
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// The underlying buffer, for writing payloads into claimed space.
    pub fn buffer(&self) -> &AtomicBuffer {
        &self.buffer
    }

    /// Writes a record; returns `Ok(false)` when the ring is currently full.
    pub fn write(&self, msg_type_id: i32, src: &[u8]) -> Result<bool> {
        check_type_id(msg_type_id)?;
        self.check_msg_length(src.len())?;

        let record_length = src.len() + HEADER_LENGTH;
        let Some(record_index) = self.claim_capacity(record_length) else {
            return Ok(false);
        };

        self.buffer.put_i32(type_offset(record_index), msg_type_id);
        self.buffer.put_bytes(encoded_msg_offset(record_index), src);
        self.buffer
            .put_i32_ordered(length_offset(record_index), record_length as i32);

        Ok(true)
    }

    /// Reserves space for a `length` byte payload without publishing it.
    ///
    /// Returns the payload offset, or `None` when the ring is currently full.
    /// The claim must be released with [`commit`](Self::commit) or
    /// [`abort`](Self::abort); until then the consumer cannot pass it.
    pub fn try_claim(&self, msg_type_id: i32, length: usize) -> Result<Option<usize>> {
        check_type_id(msg_type_id)?;
        self.check_msg_length(length)?;

        let record_length = length + HEADER_LENGTH;
        let Some(record_index) = self.claim_capacity(record_length) else {
            return Ok(None);
        };

        self.buffer
            .put_i32_ordered(length_offset(record_index), -(record_length as i32));
        fence(Ordering::Release);
        self.buffer.put_i32(type_offset(record_index), msg_type_id);

        Ok(Some(encoded_msg_offset(record_index)))
    }

    /// Publishes a record previously claimed at `index`.
    ///
    /// # Panics
    ///
    /// If `index` was not returned by `try_claim` or was already released.
    pub fn commit(&self, index: usize) {
        let record_index = self.compute_record_index(index);
        let record_length = self.verify_claimed_space_not_released(record_index);

        self.buffer
            .put_i32_ordered(length_offset(record_index), -record_length);
    }

    /// Turns a record previously claimed at `index` into padding.
    ///
    /// # Panics
    ///
    /// If `index` was not returned by `try_claim` or was already released.
    pub fn abort(&self, index: usize) {
        let record_index = self.compute_record_index(index);
        let record_length = self.verify_claimed_space_not_released(record_index);

        self.buffer
            .put_i32(type_offset(record_index), PADDING_MSG_TYPE_ID);
        self.buffer
            .put_i32_ordered(length_offset(record_index), -record_length);
    }

    /// Delivers up to `message_count_limit` published records to `handler`.
    ///
    /// Stops at the first record that is not yet published. Padding is
    /// consumed without being delivered. A single call never wraps past the
    /// end of the buffer and reads at most half the capacity.
    pub fn read<F>(&self, mut handler: F, message_count_limit: usize) -> usize
    where
        F: FnMut(i32, &[u8]),
    {
        let head = self.buffer.get_i64_volatile(self.head_position_index);
        let head_index = (head as usize) & (self.capacity - 1);
        let max_block_length = (self.capacity - head_index).min(self.capacity >> 1);

        let mut advance = HeadAdvance {
            ring: self,
            head,
            bytes_read: 0,
        };
        let mut messages_read = 0;

        while advance.bytes_read < max_block_length && messages_read < message_count_limit {
            let record_index = head_index + advance.bytes_read;
            let record_length = self.buffer.get_i32_volatile(length_offset(record_index));
            if record_length <= 0 {
                break;
            }

            advance.bytes_read += align(record_length as usize, ALIGNMENT);

            let msg_type_id = self.buffer.get_i32(type_offset(record_index));
            if msg_type_id == PADDING_MSG_TYPE_ID {
                continue;
            }

            messages_read += 1;
            handler(
                msg_type_id,
                self.buffer.bytes(
                    encoded_msg_offset(record_index),
                    record_length as usize - HEADER_LENGTH,
                ),
            );
        }

        messages_read
    }

    /// Delivers every currently readable record in the next block.
    pub fn read_all<F>(&self, handler: F) -> usize
    where
        F: FnMut(i32, &[u8]),
    {
        self.read(handler, usize::MAX)
    }

    /// Next value of the shared correlation counter.
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer.get_and_add_i64(self.correlation_counter_index, 1)
    }

    /// Records the consumer's liveness timestamp.
    pub fn set_consumer_heartbeat_time(&self, time: i64) {
        self.buffer.put_i64_ordered(self.consumer_heartbeat_index, time);
    }

    /// Last consumer liveness timestamp.
    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.buffer.get_i64_volatile(self.consumer_heartbeat_index)
    }

    /// Total bytes ever claimed by producers.
    pub fn producer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.tail_position_index)
    }

    /// Total bytes ever consumed.
    pub fn consumer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.head_position_index)
    }

    /// Bytes currently queued, sampled consistently against a moving head.
    pub fn size(&self) -> usize {
        let mut head_after = self.buffer.get_i64_volatile(self.head_position_index);
        loop {
            let head_before = head_after;
            let tail = self.buffer.get_i64_volatile(self.tail_position_index);
            head_after = self.buffer.get_i64_volatile(self.head_position_index);
            if head_after == head_before {
                return (tail - head_after) as usize;
            }
        }
    }

    /// Converts a record left claimed by a dead producer into padding.
    ///
    /// Returns `true` if the consumer was unblocked. Intended for a supervising
    /// thread, never for the producer hot path.
    pub fn unblock(&self) -> bool {
        let mask = self.capacity - 1;
        let consumer_index =
            (self.buffer.get_i64_volatile(self.head_position_index) as usize) & mask;
        let producer_index =
            (self.buffer.get_i64_volatile(self.tail_position_index) as usize) & mask;

        if producer_index == consumer_index {
            return false;
        }

        let mut unblocked = false;
        let length = self.buffer.get_i32_volatile(length_offset(consumer_index));
        if length < 0 {
            self.buffer
                .put_i32(type_offset(consumer_index), PADDING_MSG_TYPE_ID);
            self.buffer
                .put_i32_ordered(length_offset(consumer_index), -length);
            unblocked = true;
        } else if length == 0 {
            let limit = if producer_index > consumer_index {
                producer_index
            } else {
                self.capacity
            };

            // the slot after the head is always probed, even when it is the tail
            let mut i = consumer_index + ALIGNMENT;
            loop {
                if self.buffer.get_i32_volatile(length_offset(i)) != 0 {
                    if self.scan_back_to_confirm_still_zeroed(i, consumer_index) {
                        self.buffer
                            .put_i32(type_offset(consumer_index), PADDING_MSG_TYPE_ID);
                        self.buffer.put_i32_ordered(
                            length_offset(consumer_index),
                            (i - consumer_index) as i32,
                        );
                        unblocked = true;
                    }
                    break;
                }

                i += ALIGNMENT;
                if i >= limit {
                    break;
                }
            }
        }

        if unblocked {
            warn!(
                consumer_index,
                producer_index, "unblocked streams ring stuck on unpublished record"
            );
        }

        unblocked
    }

    fn scan_back_to_confirm_still_zeroed(&self, from: usize, limit: usize) -> bool {
        let mut i = from;
        while i > limit {
            i -= ALIGNMENT;
            if self.buffer.get_i32_volatile(length_offset(i)) != 0 {
                return false;
            }
        }
        true
    }

    fn check_msg_length(&self, length: usize) -> Result<()> {
        if length > self.max_msg_length {
            return Err(EngineError::MessageTooLarge {
                length,
                max_length: self.max_msg_length,
            });
        }
        Ok(())
    }

    fn claim_capacity(&self, record_length: usize) -> Option<usize> {
        let buffer = &self.buffer;
        let aligned_record_length = align(record_length, ALIGNMENT);
        let capacity = self.capacity;
        let mask = capacity - 1;
        let required_capacity = aligned_record_length + HEADER_LENGTH;

        let mut head = buffer.get_i64_volatile(self.head_cache_position_index);
        let mut tail;
        let mut tail_index;
        let mut padding;

        loop {
            tail = buffer.get_i64_volatile(self.tail_position_index);
            let available_capacity = capacity as i64 - (tail - head);

            if required_capacity as i64 > available_capacity {
                head = buffer.get_i64_volatile(self.head_position_index);

                if required_capacity as i64 > capacity as i64 - (tail - head) {
                    return None;
                }

                buffer.put_i64_ordered(self.head_cache_position_index, head);
            }

            padding = 0;
            tail_index = (tail as usize) & mask;
            let to_buffer_end_length = capacity - tail_index;

            if required_capacity > to_buffer_end_length {
                let mut head_index = (head as usize) & mask;

                if required_capacity > head_index {
                    head = buffer.get_i64_volatile(self.head_position_index);
                    head_index = (head as usize) & mask;

                    if required_capacity > head_index {
                        return None;
                    }

                    buffer.put_i64_ordered(self.head_cache_position_index, head);
                }

                padding = to_buffer_end_length;
            }

            if buffer.compare_and_set_i32(length_offset(tail_index), 0, -(record_length as i32)) {
                break;
            }

            std::hint::spin_loop();
        }

        fence(Ordering::Release);

        if padding != 0 {
            buffer.put_i32(length_offset(0), -(record_length as i32));
            fence(Ordering::Release);

            buffer.put_i32(type_offset(tail_index), PADDING_MSG_TYPE_ID);
            buffer.put_i32_ordered(length_offset(tail_index), padding as i32);
            tail_index = 0;
        }

        buffer.put_i32(length_offset(tail_index + aligned_record_length), 0);
        buffer.put_i64_ordered(
            self.tail_position_index,
            tail + (aligned_record_length + padding) as i64,
        );

        Some(tail_index)
    }

    fn compute_record_index(&self, index: usize) -> usize {
        let record_index = index.wrapping_sub(HEADER_LENGTH);
        assert!(
            index >= HEADER_LENGTH && record_index <= self.capacity - HEADER_LENGTH,
            "invalid message index {index}"
        );
        record_index
    }

    fn verify_claimed_space_not_released(&self, record_index: usize) -> i32 {
        let record_length = self.buffer.get_i32(length_offset(record_index));
        if record_length < 0 {
            return record_length;
        }

        if record_length == 0 {
            panic!("no claimed space at record index {record_index}");
        }

        let released = if self.buffer.get_i32(type_offset(record_index)) == PADDING_MSG_TYPE_ID {
            "aborted"
        } else {
            "committed"
        };
        panic!("claimed space previously {released}");
    }
}

impl std::fmt::Debug for ManyToOneRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManyToOneRing")
            .field("capacity", &self.capacity)
            .field("producer_position", &self.producer_position())
            .field("consumer_position", &self.consumer_position())
            .finish()
    }
}
