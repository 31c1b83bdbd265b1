//! Frame wire format.
//!
//! Every frame starts with a fixed 48-byte little-endian header:
//!
//! ```text
//! offset  field        type
//!      0  type_id      i32
//!      4  origin_id    u64
//!     12  routed_id    u64
//!     20  stream_id    u64
//!     28  sequence     i64
//!     36  acknowledge  i64
//!     44  maximum      i32
//!     48  extension    type specific
//! ```
//!
//! DATA frames carry `budget_id:i64, reserved:i32, length:i32` followed by
//! `length` payload bytes. Type ids with [`STREAM_CONTROL_BIT`] set flow
//! against the stream direction (receiver to sender).

use bytes::{Buf, BufMut};

use crate::error::{EngineError, Result};

/// Type id bit marking frames that travel back toward the sender.
pub const STREAM_CONTROL_BIT: i32 = 0x4000_0000;

/// Opens a stream half.
pub const BEGIN_TYPE_ID: i32 = 0x0000_0001;
/// Carries payload.
pub const DATA_TYPE_ID: i32 = 0x0000_0002;
/// Ends a stream half normally.
pub const END_TYPE_ID: i32 = 0x0000_0003;
/// Ends a stream half abnormally.
pub const ABORT_TYPE_ID: i32 = 0x0000_0004;
/// Out-of-band flush.
pub const FLUSH_TYPE_ID: i32 = 0x0000_0005;
/// Rejects a stream half from the receiving side.
pub const RESET_TYPE_ID: i32 = 0x4000_0001;
/// Grants flow-control credit.
pub const WINDOW_TYPE_ID: i32 = 0x4000_0002;
/// Receiver to sender signal.
pub const SIGNAL_TYPE_ID: i32 = 0x4000_0003;
/// Receiver to sender challenge.
pub const CHALLENGE_TYPE_ID: i32 = 0x4000_0004;

/// Fixed header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 48;

const TYPE_ID_OFFSET: usize = 0;
const ORIGIN_ID_OFFSET: usize = 4;
const ROUTED_ID_OFFSET: usize = 12;
const STREAM_ID_OFFSET: usize = 20;
const SEQUENCE_OFFSET: usize = 28;
const ACKNOWLEDGE_OFFSET: usize = 36;
const MAXIMUM_OFFSET: usize = 44;

/// Offset of the DATA budget id.
pub const DATA_BUDGET_ID_OFFSET: usize = FRAME_HEADER_SIZE;
/// Offset of the DATA reserved byte count.
pub const DATA_RESERVED_OFFSET: usize = FRAME_HEADER_SIZE + 8;
/// Offset of the DATA payload length.
pub const DATA_LENGTH_OFFSET: usize = FRAME_HEADER_SIZE + 12;
/// Offset of the DATA payload.
pub const DATA_PAYLOAD_OFFSET: usize = FRAME_HEADER_SIZE + 16;

/// Whether `type_id` names a frame flowing from receiver to sender.
#[inline]
pub const fn is_stream_control(type_id: i32) -> bool {
    type_id & STREAM_CONTROL_BIT != 0
}

/// Known frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FrameType {
    /// BEGIN
    Begin = BEGIN_TYPE_ID,
    /// DATA
    Data = DATA_TYPE_ID,
    /// END
    End = END_TYPE_ID,
    /// ABORT
    Abort = ABORT_TYPE_ID,
    /// FLUSH
    Flush = FLUSH_TYPE_ID,
    /// RESET
    Reset = RESET_TYPE_ID,
    /// WINDOW
    Window = WINDOW_TYPE_ID,
    /// SIGNAL
    Signal = SIGNAL_TYPE_ID,
    /// CHALLENGE
    Challenge = CHALLENGE_TYPE_ID,
}

impl FrameType {
    /// Wire type id.
    pub const fn type_id(self) -> i32 {
        self as i32
    }

    /// Maps a wire type id back to a known frame type.
    pub const fn from_type_id(type_id: i32) -> Option<Self> {
        match type_id {
            BEGIN_TYPE_ID => Some(Self::Begin),
            DATA_TYPE_ID => Some(Self::Data),
            END_TYPE_ID => Some(Self::End),
            ABORT_TYPE_ID => Some(Self::Abort),
            FLUSH_TYPE_ID => Some(Self::Flush),
            RESET_TYPE_ID => Some(Self::Reset),
            WINDOW_TYPE_ID => Some(Self::Window),
            SIGNAL_TYPE_ID => Some(Self::Signal),
            CHALLENGE_TYPE_ID => Some(Self::Challenge),
            _ => None,
        }
    }

    /// Whether this type flows from receiver to sender.
    pub const fn is_stream_control(self) -> bool {
        is_stream_control(self.type_id())
    }
}

/// Decoded fixed frame header.
///
/// A plain value: build one per frame, encode it, drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type id.
    pub type_id: i32,
    /// Binding the frame originates from.
    pub origin_id: u64,
    /// Binding the frame is routed to.
    pub routed_id: u64,
    /// Stream id, zero for system frames.
    pub stream_id: u64,
    /// Sender sequence.
    pub sequence: i64,
    /// Acknowledged sequence.
    pub acknowledge: i64,
    /// Flow-control window maximum.
    pub maximum: i32,
}

impl FrameHeader {
    /// Creates a header with zeroed routing and flow-control fields.
    pub fn new(frame_type: FrameType, stream_id: u64) -> Self {
        Self {
            type_id: frame_type.type_id(),
            origin_id: 0,
            routed_id: 0,
            stream_id,
            sequence: 0,
            acknowledge: 0,
            maximum: 0,
        }
    }

    /// Sets the origin and routed binding ids.
    pub fn with_route(mut self, origin_id: u64, routed_id: u64) -> Self {
        self.origin_id = origin_id;
        self.routed_id = routed_id;
        self
    }

    /// Sets sequence, acknowledge and maximum.
    pub fn with_window(mut self, sequence: i64, acknowledge: i64, maximum: i32) -> Self {
        self.sequence = sequence;
        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self
    }

    /// RESET sent to a sender whose receiver is gone.
    pub fn synthetic_reset(stream_id: u64) -> Self {
        Self::new(FrameType::Reset, stream_id).with_window(-1, -1, 0)
    }

    /// ABORT delivered to a handler whose binding is detached.
    pub fn synthetic_abort(stream_id: u64) -> Self {
        Self::new(FrameType::Abort, stream_id).with_window(-1, -1, 0)
    }

    /// Known frame type, if any.
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_type_id(self.type_id)
    }

    /// Appends the encoded header to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.type_id);
        buf.put_u64_le(self.origin_id);
        buf.put_u64_le(self.routed_id);
        buf.put_u64_le(self.stream_id);
        buf.put_i64_le(self.sequence);
        buf.put_i64_le(self.acknowledge);
        buf.put_i32_le(self.maximum);
    }

    /// Encodes the header alone, as for frames without an extension.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE);
        self.encode(&mut buf);
        buf
    }

    /// Encodes the header followed by opaque extension bytes.
    pub fn to_bytes_with_extension(&self, extension: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + extension.len());
        self.encode(&mut buf);
        buf.put_slice(extension);
        buf
    }

    /// Decodes the fixed header from the front of `frame`.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < FRAME_HEADER_SIZE {
            return Err(EngineError::InvalidFrame {
                reason: format!(
                    "frame length {} shorter than header size {}",
                    frame.len(),
                    FRAME_HEADER_SIZE
                ),
            });
        }

        let mut cursor = frame;
        Ok(Self {
            type_id: cursor.get_i32_le(),
            origin_id: cursor.get_u64_le(),
            routed_id: cursor.get_u64_le(),
            stream_id: cursor.get_u64_le(),
            sequence: cursor.get_i64_le(),
            acknowledge: cursor.get_i64_le(),
            maximum: cursor.get_i32_le(),
        })
    }
}

/// Encodes a DATA frame: header, extension, payload.
pub fn encode_data(header: &FrameHeader, budget_id: i64, reserved: i32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DATA_PAYLOAD_OFFSET + payload.len());
    header.encode(&mut buf);
    buf.put_i64_le(budget_id);
    buf.put_i32_le(reserved);
    buf.put_i32_le(payload.len() as i32);
    buf.put_slice(payload);
    buf
}

/// Read-only view over an encoded frame.
///
/// Construction checks the fixed header is present; extension accessors
/// check their own bounds and return `None` when the frame is too short.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    bytes: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// Wraps `bytes`, failing if it cannot hold a header.
    pub fn wrap(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(EngineError::InvalidFrame {
                reason: format!(
                    "frame length {} shorter than header size {}",
                    bytes.len(),
                    FRAME_HEADER_SIZE
                ),
            });
        }
        Ok(Self { bytes })
    }

    #[inline]
    fn at(&self, offset: usize) -> &'a [u8] {
        &self.bytes[offset..]
    }

    /// Frame type id.
    pub fn type_id(&self) -> i32 {
        self.at(TYPE_ID_OFFSET).get_i32_le()
    }

    /// Origin binding id.
    pub fn origin_id(&self) -> u64 {
        self.at(ORIGIN_ID_OFFSET).get_u64_le()
    }

    /// Routed binding id.
    pub fn routed_id(&self) -> u64 {
        self.at(ROUTED_ID_OFFSET).get_u64_le()
    }

    /// Stream id.
    pub fn stream_id(&self) -> u64 {
        self.at(STREAM_ID_OFFSET).get_u64_le()
    }

    /// Sender sequence.
    pub fn sequence(&self) -> i64 {
        self.at(SEQUENCE_OFFSET).get_i64_le()
    }

    /// Acknowledged sequence.
    pub fn acknowledge(&self) -> i64 {
        self.at(ACKNOWLEDGE_OFFSET).get_i64_le()
    }

    /// Window maximum.
    pub fn maximum(&self) -> i32 {
        self.at(MAXIMUM_OFFSET).get_i32_le()
    }

    /// The header as a plain value.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            type_id: self.type_id(),
            origin_id: self.origin_id(),
            routed_id: self.routed_id(),
            stream_id: self.stream_id(),
            sequence: self.sequence(),
            acknowledge: self.acknowledge(),
            maximum: self.maximum(),
        }
    }

    /// Bytes following the fixed header.
    pub fn extension(&self) -> &'a [u8] {
        self.at(FRAME_HEADER_SIZE)
    }

    /// DATA budget id, if the frame is long enough.
    pub fn data_budget_id(&self) -> Option<i64> {
        (self.bytes.len() >= DATA_BUDGET_ID_OFFSET + 8)
            .then(|| self.at(DATA_BUDGET_ID_OFFSET).get_i64_le())
    }

    /// DATA declared payload length, read from its fixed offset.
    ///
    /// The value is taken as written and may be negative.
    pub fn data_length(&self) -> Option<i32> {
        (self.bytes.len() >= DATA_LENGTH_OFFSET + 4)
            .then(|| self.at(DATA_LENGTH_OFFSET).get_i32_le())
    }

    /// DATA payload, bounded by both the declared length and the frame.
    pub fn data_payload(&self) -> Option<&'a [u8]> {
        let length = usize::try_from(self.data_length()?).ok()?;
        let end = DATA_PAYLOAD_OFFSET.checked_add(length)?;
        self.bytes.get(DATA_PAYLOAD_OFFSET..end)
    }

    /// Underlying bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

impl std::fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameView")
            .field("type_id", &format_args!("0x{:08x}", self.type_id()))
            .field("stream_id", &format_args!("0x{:016x}", self.stream_id()))
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_ids() {
        assert_eq!(FrameType::Begin.type_id(), 1);
        assert_eq!(FrameType::Challenge.type_id(), 0x4000_0004);
        assert_eq!(FrameType::from_type_id(RESET_TYPE_ID), Some(FrameType::Reset));
        assert_eq!(FrameType::from_type_id(0x0000_0006), None);
    }

    #[test]
    fn test_stream_control_classification() {
        for frame_type in [
            FrameType::Begin,
            FrameType::Data,
            FrameType::End,
            FrameType::Abort,
            FrameType::Flush,
        ] {
            assert!(!frame_type.is_stream_control(), "{:?}", frame_type);
        }
        for frame_type in [
            FrameType::Reset,
            FrameType::Window,
            FrameType::Signal,
            FrameType::Challenge,
        ] {
            assert!(frame_type.is_stream_control(), "{:?}", frame_type);
        }
    }

    #[test]
    fn test_header_layout_offsets() {
        let header = FrameHeader::new(FrameType::Window, 0x0102_0304_0506_0708)
            .with_route(11, 22)
            .with_window(33, 44, 55);
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
        assert_eq!(&bytes[0..4], &WINDOW_TYPE_ID.to_le_bytes());
        assert_eq!(&bytes[4..12], &11u64.to_le_bytes());
        assert_eq!(&bytes[12..20], &22u64.to_le_bytes());
        assert_eq!(&bytes[20..28], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&bytes[28..36], &33i64.to_le_bytes());
        assert_eq!(&bytes[36..44], &44i64.to_le_bytes());
        assert_eq!(&bytes[44..48], &55i32.to_le_bytes());
    }

    #[test]
    fn test_decode_matches_view() {
        let header = FrameHeader::new(FrameType::Begin, 7).with_route(1, 2);
        let bytes = header.to_bytes_with_extension(b"ext");

        assert_eq!(FrameHeader::decode(&bytes).unwrap(), header);
        let view = FrameView::wrap(&bytes).unwrap();
        assert_eq!(view.header(), header);
        assert_eq!(view.extension(), b"ext");
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            FrameView::wrap(&[0u8; 47]).unwrap_err(),
            EngineError::InvalidFrame { .. }
        ));
        assert!(FrameHeader::decode(&[]).is_err());
    }

    #[test]
    fn test_synthetic_frames() {
        let reset = FrameHeader::synthetic_reset(9);
        assert_eq!(reset.type_id, RESET_TYPE_ID);
        assert_eq!((reset.sequence, reset.acknowledge, reset.maximum), (-1, -1, 0));
        assert_eq!((reset.origin_id, reset.routed_id), (0, 0));

        let abort = FrameHeader::synthetic_abort(9);
        assert_eq!(abort.frame_type(), Some(FrameType::Abort));
        assert_eq!(abort.stream_id, 9);
    }

    #[test]
    fn test_data_extension() {
        let header = FrameHeader::new(FrameType::Data, 3);
        let bytes = encode_data(&header, 99, 5, b"hello");
        let view = FrameView::wrap(&bytes).unwrap();

        assert_eq!(view.data_budget_id(), Some(99));
        assert_eq!(view.data_length(), Some(5));
        assert_eq!(view.data_payload(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_data_length_missing_or_negative() {
        let header = FrameHeader::new(FrameType::Data, 3).to_bytes();
        let view = FrameView::wrap(&header).unwrap();
        assert_eq!(view.data_length(), None);
        assert_eq!(view.data_payload(), None);

        let mut bytes = encode_data(&FrameHeader::new(FrameType::Data, 3), 0, 0, b"");
        bytes[DATA_LENGTH_OFFSET..DATA_LENGTH_OFFSET + 4].copy_from_slice(&(-8i32).to_le_bytes());
        let view = FrameView::wrap(&bytes).unwrap();
        assert_eq!(view.data_length(), Some(-8));
        assert_eq!(view.data_payload(), None);
    }
}
