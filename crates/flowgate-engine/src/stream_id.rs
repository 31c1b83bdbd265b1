//! Stream identifier bit packing.
//!
//! A stream id carries everything needed to route a frame without a lookup:
//!
//! ```text
//!  63  62..56       55  54..48        47..32   31..1     0
//! [0 | local index | 0 | remote index | unused | instance | initial]
//! ```
//!
//! The low bit tells the initial half (client to server) from the reply
//! half. For an initial id the worker owning the stream sits in the local
//! field; for a reply id it sits in the remote field. The throttle id is the
//! mirror image, addressing the worker that sent the frame.

/// Largest number of workers addressable by a 7-bit index.
pub const MAX_WORKERS: usize = 128;

const INDEX_MASK: u64 = 0x7f;
const INSTANCE_MASK: u64 = 0xffff_ffff;
const LOCAL_SHIFT: u32 = 56;
const REMOTE_SHIFT: u32 = 48;

/// Worker index packed in bits 56..=62.
#[inline]
pub const fn local_index(stream_id: u64) -> usize {
    ((stream_id >> LOCAL_SHIFT) & INDEX_MASK) as usize
}

/// Worker index packed in bits 48..=54.
#[inline]
pub const fn remote_index(stream_id: u64) -> usize {
    ((stream_id >> REMOTE_SHIFT) & INDEX_MASK) as usize
}

/// Per-connection instance id in the low 32 bits.
#[inline]
pub const fn instance_id(stream_id: u64) -> u64 {
    stream_id & INSTANCE_MASK
}

/// Whether the id names the initial half of a stream.
#[inline]
pub const fn is_initial(stream_id: u64) -> bool {
    stream_id & 1 != 0
}

/// Index of the worker whose stream table holds this id.
#[inline]
pub const fn stream_index(stream_id: u64) -> usize {
    if is_initial(stream_id) {
        local_index(stream_id)
    } else {
        remote_index(stream_id)
    }
}

/// Index of the worker whose throttle table holds this id.
#[inline]
pub const fn throttle_index(stream_id: u64) -> usize {
    if is_initial(stream_id) {
        remote_index(stream_id)
    } else {
        local_index(stream_id)
    }
}

/// Packs an id whose stream index is `local_index` and throttle index is `remote_index`.
#[inline]
pub const fn stream_id(local_index: usize, remote_index: usize, instance_id: u64) -> u64 {
    debug_assert!(local_index < MAX_WORKERS && remote_index < MAX_WORKERS);
    debug_assert!(instance_id <= INSTANCE_MASK);

    if is_initial(instance_id) {
        pack(local_index, remote_index, instance_id)
    } else {
        pack(remote_index, local_index, instance_id)
    }
}

/// Packs the mirror of [`stream_id`] for the same arguments.
#[inline]
pub const fn throttle_id(local_index: usize, remote_index: usize, instance_id: u64) -> u64 {
    debug_assert!(local_index < MAX_WORKERS && remote_index < MAX_WORKERS);
    debug_assert!(instance_id <= INSTANCE_MASK);

    if is_initial(instance_id) {
        pack(remote_index, local_index, instance_id)
    } else {
        pack(local_index, remote_index, instance_id)
    }
}

/// The initial half of the stream pair `stream_id` belongs to.
#[inline]
pub const fn initial_id(stream_id: u64) -> u64 {
    stream_id | 1
}

/// The reply half of the stream pair opened by `initial_id`.
#[inline]
pub const fn reply_id(initial_id: u64) -> u64 {
    initial_id & !1
}

#[inline]
const fn pack(high: usize, low: usize, instance_id: u64) -> u64 {
    (((high as u64) & INDEX_MASK) << LOCAL_SHIFT)
        | (((low as u64) & INDEX_MASK) << REMOTE_SHIFT)
        | (instance_id & INSTANCE_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_initial_packing() {
        let id = stream_id(5, 9, 3);
        assert_eq!(id, (5u64 << 56) | (9u64 << 48) | 3);
        assert_eq!(throttle_id(5, 9, 3), (9u64 << 56) | (5u64 << 48) | 3);
    }

    #[test]
    fn test_stream_id_reply_packing_swaps() {
        let id = stream_id(5, 9, 4);
        assert_eq!(id, (9u64 << 56) | (5u64 << 48) | 4);
        assert!(!is_initial(id));
        assert_eq!(stream_index(id), 5);
        assert_eq!(throttle_index(id), 9);
    }

    #[test]
    fn test_decoders() {
        let id = stream_id(127, 1, 0xffff_ffff);
        assert_eq!(local_index(id), 127);
        assert_eq!(remote_index(id), 1);
        assert_eq!(instance_id(id), 0xffff_ffff);
        assert!(is_initial(id));
        assert_eq!(id >> 63, 0);
    }

    #[test]
    fn test_initial_and_reply_ids() {
        let initial = stream_id(2, 7, 41);
        let reply = reply_id(initial);

        assert!(!is_initial(reply));
        assert_eq!(initial_id(reply), initial);
        assert_eq!(initial_id(initial), initial);
        assert_eq!(stream_index(reply), throttle_index(initial));
        assert_eq!(throttle_index(reply), stream_index(initial));
        assert_eq!(reply, stream_id(7, 2, 40));
    }
}
