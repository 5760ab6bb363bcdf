//! Frame encoding and decoding for the radio transport.
//!
//! Two framing levels ride on a link frame:
//!
//! - **Link frames** are the fixed-size units a [`Link`](crate::link::Link)
//!   moves: BEGIN/END control frames (with an ack flag and, on acks, a
//!   selective-ack bitmap) and PAYLOAD frames carrying one fragment each.
//! - **Sub-frames** are reassembly windows of the air-frame (user payload
//!   followed by its CRC16), sized so that one END-ack bitmap can cover
//!   every fragment inside the window.

use thiserror::Error;

use crate::core::constants::{
    ACK_BITMAP_OFFSET, MASK_ACK, MASK_FRAME_TYPE, PAYLOAD_OVERHEAD, SUB_FRAME_HEADER_SIZE,
};
use crate::core::crc16::crc16;
use crate::link::Frame;

/// Link-frame type, carried in bits 0-1 of the first payload byte.
///
/// Bit 2 is the ack flag; bits 3-7 are reserved and sent as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A fragment of a sub-frame, tagged with its sequence id.
    Payload = 0b00,
    /// Start of a sub-frame exchange.
    Begin = 0b01,
    /// End of a sub-frame exchange; the ack carries the bitmap.
    End = 0b10,
}

impl FrameType {
    /// Parse the frame type out of the first payload byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & MASK_FRAME_TYPE {
            0b00 => Some(Self::Payload),
            0b01 => Some(Self::Begin),
            0b10 => Some(Self::End),
            _ => None,
        }
    }

    /// Convert the frame type to its wire representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Whether the ack flag is set in the first payload byte.
pub fn is_ack(byte: u8) -> bool {
    byte & MASK_ACK != 0
}

/// Build a BEGIN or END control frame.
///
/// The payload is zero-filled to `max_payload_size`; on ack frames the
/// caller then sets bitmap bits with [`bitmap_set`]. Panics if called with
/// [`FrameType::Payload`].
pub fn build_begin_end_frame(
    address: u32,
    frame_type: FrameType,
    ack: bool,
    max_payload_size: usize,
) -> Frame {
    assert!(
        frame_type == FrameType::Begin || frame_type == FrameType::End,
        "frame type must be BEGIN or END"
    );

    let mut payload = vec![0u8; max_payload_size];
    payload[0] = frame_type.as_byte() | if ack { MASK_ACK } else { 0 };
    Frame { address, payload }
}

/// Build a PAYLOAD frame carrying one fragment.
///
/// Panics unless `fragment` is exactly `max_payload_size - 2` bytes;
/// callers zero-pad the tail fragment of a sub-frame to that length.
pub fn build_payload_frame(
    address: u32,
    sequence_id: u8,
    fragment: &[u8],
    max_payload_size: usize,
) -> Frame {
    let expected = max_payload_size - PAYLOAD_OVERHEAD;
    assert!(
        fragment.len() == expected,
        "invalid fragment size ({} vs expected {})",
        fragment.len(),
        expected
    );

    let mut payload = Vec::with_capacity(max_payload_size);
    payload.push(FrameType::Payload.as_byte());
    payload.push(sequence_id);
    payload.extend_from_slice(fragment);
    Frame { address, payload }
}

/// Set the bit for `sequence_id` in a BEGIN/END ack payload. A sequence id
/// beyond the bitmap (possible only with a misbehaving peer) is ignored.
pub fn bitmap_set(payload: &mut [u8], sequence_id: u8) {
    if let Some(byte) = payload.get_mut(ACK_BITMAP_OFFSET + (sequence_id / 8) as usize) {
        *byte |= 1 << (sequence_id % 8);
    }
}

/// Read the bit for `sequence_id` from a BEGIN/END ack payload. A sequence
/// id beyond the bitmap reads as unacknowledged.
pub fn bitmap_get(payload: &[u8], sequence_id: u8) -> bool {
    payload
        .get(ACK_BITMAP_OFFSET + (sequence_id / 8) as usize)
        .is_some_and(|byte| byte & (1 << (sequence_id % 8)) != 0)
}

/// Sub-frame header: 12 bytes of little-endian lengths prefixed to every
/// sub-frame body.
///
/// Wire format:
/// ```text
/// +----------------+----------------+----------------+
/// | Body Length    | Body Offset    | Total Length   |
/// | 4 bytes (LE32) | 4 bytes (LE32) | 4 bytes (LE32) |
/// +----------------+----------------+----------------+
/// ```
///
/// `sub_offset` positions the body inside the air-frame; `total_len` is the
/// air-frame length, letting the receiver know when reassembly is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubFrameHeader {
    /// Number of air-frame bytes in this sub-frame's body.
    pub sub_len: u32,
    /// Offset of the body inside the air-frame.
    pub sub_offset: u32,
    /// Total air-frame length.
    pub total_len: u32,
}

impl SubFrameHeader {
    /// Serialize the header to its 12-byte wire form.
    pub fn to_bytes(self) -> [u8; SUB_FRAME_HEADER_SIZE] {
        let mut buf = [0u8; SUB_FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.sub_len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sub_offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.total_len.to_le_bytes());
        buf
    }

    /// Parse a header from the start of a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < SUB_FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: SUB_FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            sub_len: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            sub_offset: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            total_len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

/// Errors that can occur when parsing wire structures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer shorter than the structure being parsed.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size available.
        actual: usize,
    },
}

/// The largest sub-frame (header plus body) for a given link payload size.
///
/// One END-ack bitmap spans `max_payload_size - 2` bytes, so it can
/// acknowledge `(max_payload_size - 2) * 8` sequence ids, each carrying
/// `max_payload_size - 2` bytes. This is the most that a single BEGIN/END
/// exchange can confirm.
pub fn max_sub_frame_size(max_payload_size: usize) -> usize {
    let fragment_size = max_payload_size - PAYLOAD_OVERHEAD;
    fragment_size * 8 * fragment_size
}

/// Number of PAYLOAD fragments needed to carry `sub_frame_len` bytes.
pub fn fragment_count(sub_frame_len: usize, fragment_size: usize) -> usize {
    (sub_frame_len + fragment_size - 1) / fragment_size
}

/// Split a user payload into sub-frames.
///
/// The air-frame is the payload followed by its CRC16 (little-endian); it
/// is cut into headered windows of at most `max_sub_frame_size` on-wire
/// bytes. On minimal links the window formula leaves no room for the
/// 12-byte header; the whole air-frame then goes into one sub-frame and the
/// sequence-id cap becomes the effective size limit.
pub fn build_sub_frames(payload: &[u8], max_sub_frame_size: usize) -> Vec<Vec<u8>> {
    let mut air_frame = Vec::with_capacity(payload.len() + crate::core::constants::CRC16_SIZE);
    air_frame.extend_from_slice(payload);
    air_frame.extend_from_slice(&crc16(payload).to_le_bytes());

    let mut max_body = max_sub_frame_size.saturating_sub(SUB_FRAME_HEADER_SIZE);
    if max_body == 0 {
        max_body = air_frame.len();
    }

    let mut sub_frames = Vec::new();
    let mut offset = 0;
    while offset < air_frame.len() {
        let body_len = max_body.min(air_frame.len() - offset);
        let header = SubFrameHeader {
            sub_len: body_len as u32,
            sub_offset: offset as u32,
            total_len: air_frame.len() as u32,
        };

        let mut sub_frame = Vec::with_capacity(SUB_FRAME_HEADER_SIZE + body_len);
        sub_frame.extend_from_slice(&header.to_bytes());
        sub_frame.extend_from_slice(&air_frame[offset..offset + body_len]);
        sub_frames.push(sub_frame);
        offset += body_len;
    }

    sub_frames
}
