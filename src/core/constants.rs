//! Protocol constants.
//!
//! These values define the wire format and timing behavior of the transport
//! and MUST NOT be changed without breaking compatibility with peers.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Mask selecting the frame type (bits 0-1 of the first payload byte).
pub const MASK_FRAME_TYPE: u8 = 0x03;

/// Mask selecting the acknowledgement flag (bit 2 of the first payload byte).
pub const MASK_ACK: u8 = 0x04;

/// Sub-frame header size: length (u32) + offset (u32) + total length (u32).
pub const SUB_FRAME_HEADER_SIZE: usize = 12;

/// Per-fragment overhead in a PAYLOAD frame: type byte + sequence id.
pub const PAYLOAD_OVERHEAD: usize = 2;

/// Offset of the selective-ack bitmap inside a BEGIN/END ack payload.
pub const ACK_BITMAP_OFFSET: usize = 2;

/// Size of the CRC16 trailer appended to every air-frame.
pub const CRC16_SIZE: usize = 2;

/// Maximum number of fragments in one sub-frame. Sequence ids are dense
/// `u8` values starting at zero, so a sub-frame that would split into more
/// fragments than this is rejected before any frame is transmitted.
pub const MAX_FRAGMENTS: usize = 255;

// =============================================================================
// ADDRESSING
// =============================================================================

/// Broadcast address used for beacons by the in-crate link implementations.
/// Not a valid station identity, and neither is address zero.
pub const BROADCAST_ADDRESS: u32 = u32::MAX;

/// Smallest usable link payload: type byte + sequence id + one data byte.
pub const MIN_LINK_PAYLOAD_SIZE: usize = 3;

/// Largest supported link payload.
pub const MAX_LINK_PAYLOAD_SIZE: usize = 257;

// =============================================================================
// TIMING
// =============================================================================

/// How long a sender waits for a BEGIN/END ack before retransmitting the
/// control frame.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(10);

/// Idle time after which receiver-side reassembly state is discarded.
pub const RECEIVER_TIMEOUT: Duration = Duration::from_millis(20);

/// Cadence for polling a link that reported nothing ready.
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default beacon emission interval.
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_millis(100);

/// Beacon jitter as a percentage of the interval, applied uniformly in
/// both directions.
pub const BEACON_JITTER_PERCENT: u64 = 10;
