//! Receiver-side reassembly state machine.
//!
//! Accepts link frames and assembles them back into whole payloads: PAYLOAD
//! fragments collect into one sub-frame at a time, completed sub-frames
//! append to the payload accumulator, and a payload whose CRC16 checks out
//! is handed back for delivery. The receiver tracks a single in-flight
//! transfer; a second station attempting to send concurrently gets no acks
//! and backs off by retrying.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::core::constants::{CRC16_SIZE, RECEIVER_TIMEOUT, SUB_FRAME_HEADER_SIZE};
use crate::core::crc16::crc16;
use crate::link::{Frame, Link};
use crate::transport::frame::{
    bitmap_set, build_begin_end_frame, is_ack, FrameType, SubFrameHeader,
};
use crate::transport::timing::Clock;

/// Reassembly state for the transfer currently in flight.
#[derive(Debug, Clone)]
pub struct ReceiveState {
    /// The station this transfer is bound to.
    pub address: u32,
    /// Fragments of the sub-frame currently being assembled, by sequence id.
    pub pieces: BTreeMap<u8, Vec<u8>>,
    /// Completed sub-frame bodies, accumulated in offset order.
    pub payload: Vec<u8>,
    /// Time of the last accepted frame, for timeout teardown.
    pub receive_time_us: u64,
}

/// Memory of the last delivered transfer. A sender whose final END-ack was
/// lost retransmits END; answering from here (with an all-ones bitmap)
/// keeps that retransmission from looking like a new transfer and from
/// redelivering the payload.
#[derive(Debug, Clone, Copy)]
struct LastReceive {
    address: u32,
    receive_time_us: u64,
}

/// Assembles link frames from one peer at a time into whole payloads.
pub struct TransportReceiver {
    clock: Arc<dyn Clock>,
    receive_state: Option<ReceiveState>,
    last_receive: Option<LastReceive>,
}

impl TransportReceiver {
    /// Create a receiver that reads timeouts from the supplied clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, receive_state: None, last_receive: None }
    }

    /// The reassembly state currently in flight, if any.
    pub fn receive_state(&self) -> Option<&ReceiveState> {
        self.receive_state.as_ref()
    }

    /// Drop reassembly and last-receive state that has gone stale.
    pub fn handle_timeout(&mut self) {
        let now_us = self.clock.now_us();
        let timeout_us = RECEIVER_TIMEOUT.as_micros() as u64;

        if let Some(state) = &self.receive_state {
            if now_us.saturating_sub(state.receive_time_us) > timeout_us {
                debug!("receive state for station {} timed out", state.address);
                self.receive_state = None;
            }
        }
        if let Some(last) = &self.last_receive {
            if now_us.saturating_sub(last.receive_time_us) > timeout_us {
                self.last_receive = None;
            }
        }
    }

    /// Feed one received link frame through the state machine. Acks go out
    /// on `link`; a fully reassembled, CRC-verified payload is returned for
    /// delivery to the event handler.
    pub fn handle_frame<L: Link>(&mut self, link: &mut L, frame: &Frame) -> Option<Vec<u8>> {
        self.handle_timeout();

        if frame.payload.len() != link.max_payload_size() {
            warn!(
                "dropping frame from station {} with unexpected length {}",
                frame.address,
                frame.payload.len()
            );
            return None;
        }

        let Some(frame_type) = FrameType::from_byte(frame.payload[0]) else {
            warn!("dropping frame from station {} with invalid type", frame.address);
            return None;
        };
        if is_ack(frame.payload[0]) {
            // Acks drive the sending side, never the receiver.
            return None;
        }

        match self.receive_state.as_ref().map(|state| state.address) {
            None => {
                if frame_type == FrameType::Begin {
                    self.receive_state = Some(ReceiveState {
                        address: frame.address,
                        pieces: BTreeMap::new(),
                        payload: Vec::new(),
                        receive_time_us: self.clock.now_us(),
                    });
                    self.respond_with_ack(link, FrameType::Begin);
                } else if frame_type == FrameType::End {
                    self.reack_completed_transfer(link, frame.address);
                }
                None
            }
            Some(address) if address == frame.address => {
                if let Some(state) = self.receive_state.as_mut() {
                    state.receive_time_us = self.clock.now_us();
                }
                match frame_type {
                    FrameType::Begin => {
                        self.respond_with_ack(link, FrameType::Begin);
                        None
                    }
                    FrameType::Payload => {
                        self.store_piece(frame);
                        None
                    }
                    FrameType::End => {
                        self.respond_with_ack(link, FrameType::End);
                        self.try_complete()
                    }
                }
            }
            Some(_) => {
                debug!(
                    "ignoring frame from station {} while receiving from another",
                    frame.address
                );
                None
            }
        }
    }

    fn store_piece(&mut self, frame: &Frame) {
        let Some(state) = self.receive_state.as_mut() else { return };
        let sequence_id = frame.payload[1];
        state
            .pieces
            .entry(sequence_id)
            .or_insert_with(|| frame.payload[2..].to_vec());
    }

    /// Transmit a BEGIN/END ack carrying the bitmap of received pieces. An
    /// ack that fails to transmit tears the transfer down; the sender will
    /// retry from BEGIN or give up on its deadline.
    fn respond_with_ack<L: Link>(&mut self, link: &mut L, frame_type: FrameType) {
        let Some(state) = self.receive_state.as_ref() else { return };

        let mut ack = build_begin_end_frame(state.address, frame_type, true, link.max_payload_size());
        for &sequence_id in state.pieces.keys() {
            bitmap_set(&mut ack.payload, sequence_id);
        }

        if let Err(err) = link.transmit(&ack) {
            error!("failed to transmit {frame_type:?} ack: {err}");
            self.receive_state = None;
        }
    }

    /// Answer a retransmitted END for an already-delivered transfer with an
    /// all-ones bitmap.
    fn reack_completed_transfer<L: Link>(&mut self, link: &mut L, address: u32) {
        let Some(last) = self.last_receive.as_mut() else { return };
        if last.address != address {
            return;
        }
        last.receive_time_us = self.clock.now_us();

        let mut ack = build_begin_end_frame(address, FrameType::End, true, link.max_payload_size());
        for byte in &mut ack.payload[crate::core::constants::ACK_BITMAP_OFFSET..] {
            *byte = 0xFF;
        }
        if let Err(err) = link.transmit(&ack) {
            error!("failed to re-ack END for station {address}: {err}");
        }
    }

    /// Attempt to complete the current sub-frame and, with it, the whole
    /// transfer. Missing pieces leave the state untouched: the sender reads
    /// the bitmap we just acked and retransmits what is absent.
    fn try_complete(&mut self) -> Option<Vec<u8>> {
        let state = self.receive_state.as_mut()?;

        let mut chunk = Vec::new();
        for sequence_id in 0..=u8::MAX {
            match state.pieces.get(&sequence_id) {
                Some(piece) => chunk.extend_from_slice(piece),
                None => break,
            }
        }
        if chunk.len() < SUB_FRAME_HEADER_SIZE {
            return None;
        }

        // The header length check cannot fail past the guard above.
        let header = SubFrameHeader::from_bytes(&chunk).ok()?;
        let sub_len = header.sub_len as usize;
        if chunk.len() - SUB_FRAME_HEADER_SIZE < sub_len {
            // Trailing pieces are still missing.
            return None;
        }

        if header.sub_offset as usize != state.payload.len() {
            warn!(
                "sub-frame offset {} does not match assembled length {}, dropping transfer",
                header.sub_offset,
                state.payload.len()
            );
            self.receive_state = None;
            return None;
        }

        state
            .payload
            .extend_from_slice(&chunk[SUB_FRAME_HEADER_SIZE..SUB_FRAME_HEADER_SIZE + sub_len]);
        state.pieces.clear();

        if state.payload.len() < header.total_len as usize {
            // More sub-frames expected.
            return None;
        }

        let address = state.address;
        let payload = std::mem::take(&mut state.payload);
        self.receive_state = None;

        if payload.len() < CRC16_SIZE {
            warn!("dropping undersized transfer from station {address}");
            return None;
        }
        let (data, crc_bytes) = payload.split_at(payload.len() - CRC16_SIZE);
        let received_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let computed_crc = crc16(data);
        if received_crc != computed_crc {
            warn!(
                "dropping transfer from station {address}: crc mismatch \
                 (computed {computed_crc:#06x}, received {received_crc:#06x})"
            );
            return None;
        }

        self.last_receive =
            Some(LastReceive { address, receive_time_us: self.clock.now_us() });
        Some(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{ACK_TIMEOUT, RECEIVER_TIMEOUT};
    use crate::core::error::TransmitError;
    use crate::link::mock::MockLink;
    use crate::transport::frame::{build_payload_frame, build_sub_frames, max_sub_frame_size};
    use crate::transport::timing::MockClock;

    const STATION: u32 = 2000;

    fn make_receiver() -> (Arc<MockClock>, TransportReceiver, MockLink) {
        let clock = Arc::new(MockClock::new());
        let receiver = TransportReceiver::new(clock.clone());
        let link = MockLink::new(1000, 32);
        (clock, receiver, link)
    }

    fn begin_frame(address: u32) -> Frame {
        build_begin_end_frame(address, FrameType::Begin, false, 32)
    }

    fn end_frame(address: u32) -> Frame {
        build_begin_end_frame(address, FrameType::End, false, 32)
    }

    /// Cut a raw sub-frame into PAYLOAD frames, zero-padding the tail.
    fn payload_frames(address: u32, sub_frame: &[u8]) -> Vec<Frame> {
        sub_frame
            .chunks(30)
            .enumerate()
            .map(|(sequence_id, piece)| {
                let mut fragment = piece.to_vec();
                fragment.resize(30, 0);
                build_payload_frame(address, sequence_id as u8, &fragment, 32)
            })
            .collect()
    }

    #[test]
    fn test_prime_receiver_then_timeout() {
        let (clock, mut receiver, mut link) = make_receiver();
        assert!(receiver.receive_state().is_none());
        clock.set_time_us(1000);

        receiver.handle_frame(&mut link, &begin_frame(STATION));

        let state = receiver.receive_state().expect("receiver should be primed");
        assert_eq!(state.address, STATION);
        assert!(state.pieces.is_empty());
        assert!(state.payload.is_empty());
        assert_eq!(state.receive_time_us, 1000);

        let ack = &link.transmitted()[0];
        assert_eq!(ack.address, STATION);
        assert_eq!(ack.payload.len(), 32);
        assert_eq!(ack.payload[0], 0x05);
        assert!(ack.payload[1..].iter().all(|&b| b == 0));

        // One microsecond past the timeout the state is gone and the END
        // produces no output and no transmit.
        clock.set_time_us(1000 + RECEIVER_TIMEOUT.as_micros() as u64 + 1);
        let delivered = receiver.handle_frame(&mut link, &end_frame(STATION));
        assert!(delivered.is_none());
        assert!(receiver.receive_state().is_none());
        assert_eq!(link.transmitted().len(), 1);
    }

    #[test]
    fn test_begin_reacked_while_receiving() {
        let (_clock, mut receiver, mut link) = make_receiver();

        receiver.handle_frame(&mut link, &begin_frame(STATION));
        receiver.handle_frame(&mut link, &begin_frame(STATION));

        assert_eq!(link.transmitted().len(), 2);
        assert_eq!(link.transmitted()[1].payload[0], 0x05);
    }

    #[test]
    fn test_first_piece_wins() {
        let (_clock, mut receiver, mut link) = make_receiver();
        receiver.handle_frame(&mut link, &begin_frame(STATION));

        receiver.handle_frame(&mut link, &build_payload_frame(STATION, 0, &[0x11; 30], 32));
        receiver.handle_frame(&mut link, &build_payload_frame(STATION, 0, &[0x22; 30], 32));

        let state = receiver.receive_state().unwrap();
        assert_eq!(state.pieces.len(), 1);
        assert_eq!(state.pieces[&0], vec![0x11; 30]);
    }

    #[test]
    fn test_single_fragment_delivery_and_end_reack() {
        let (_clock, mut receiver, mut link) = make_receiver();
        let payload = vec![0xAA; 16];
        let sub_frames = build_sub_frames(&payload, max_sub_frame_size(32));
        assert_eq!(sub_frames.len(), 1);

        receiver.handle_frame(&mut link, &begin_frame(STATION));
        for frame in payload_frames(STATION, &sub_frames[0]) {
            receiver.handle_frame(&mut link, &frame);
        }
        let delivered = receiver.handle_frame(&mut link, &end_frame(STATION));
        assert_eq!(delivered, Some(payload));
        assert!(receiver.receive_state().is_none());

        // The END-ack carries the piece bitmap.
        let end_ack = link.transmitted().last().unwrap();
        assert_eq!(end_ack.payload[0], 0x06);
        assert_eq!(end_ack.payload[2], 0x01);

        // A retransmitted END is re-acked with an all-ones bitmap and does
        // not deliver again.
        link.take_transmitted();
        let redelivered = receiver.handle_frame(&mut link, &end_frame(STATION));
        assert!(redelivered.is_none());
        let reack = &link.transmitted()[0];
        assert_eq!(reack.payload[0], 0x06);
        assert!(reack.payload[2..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_last_receive_expires() {
        let (clock, mut receiver, mut link) = make_receiver();
        let payload = vec![0xAA; 16];
        let sub_frames = build_sub_frames(&payload, max_sub_frame_size(32));

        receiver.handle_frame(&mut link, &begin_frame(STATION));
        for frame in payload_frames(STATION, &sub_frames[0]) {
            receiver.handle_frame(&mut link, &frame);
        }
        assert!(receiver.handle_frame(&mut link, &end_frame(STATION)).is_some());

        clock.advance_us(RECEIVER_TIMEOUT.as_micros() as u64 + 1);
        link.take_transmitted();
        receiver.handle_frame(&mut link, &end_frame(STATION));
        assert!(link.transmitted().is_empty());
    }

    #[test]
    fn test_multi_sub_frame_assembly() {
        let (_clock, mut receiver, mut link) = make_receiver();

        // Hand-cut sub-frames smaller than the window: bodies of 10 and 12
        // bytes out of a 22-byte air-frame (20 bytes of data plus CRC).
        let payload: Vec<u8> = (0..20u8).collect();
        let mut air_frame = payload.clone();
        air_frame.extend_from_slice(&crc16(&payload).to_le_bytes());

        let mut first = SubFrameHeader { sub_len: 10, sub_offset: 0, total_len: 22 }
            .to_bytes()
            .to_vec();
        first.extend_from_slice(&air_frame[..10]);
        let mut second = SubFrameHeader { sub_len: 12, sub_offset: 10, total_len: 22 }
            .to_bytes()
            .to_vec();
        second.extend_from_slice(&air_frame[10..]);

        receiver.handle_frame(&mut link, &begin_frame(STATION));
        for frame in payload_frames(STATION, &first) {
            receiver.handle_frame(&mut link, &frame);
        }
        assert!(receiver.handle_frame(&mut link, &end_frame(STATION)).is_none());

        let state = receiver.receive_state().unwrap();
        assert_eq!(state.payload.len(), 10);
        assert!(state.pieces.is_empty());

        receiver.handle_frame(&mut link, &begin_frame(STATION));
        for frame in payload_frames(STATION, &second) {
            receiver.handle_frame(&mut link, &frame);
        }
        let delivered = receiver.handle_frame(&mut link, &end_frame(STATION));
        assert_eq!(delivered, Some(payload));
    }

    #[test]
    fn test_incomplete_sub_frame_waits_for_retransmission() {
        let (_clock, mut receiver, mut link) = make_receiver();
        let payload = vec![0x5A; 280];
        let sub_frames = build_sub_frames(&payload, max_sub_frame_size(32));
        let frames = payload_frames(STATION, &sub_frames[0]);
        assert_eq!(frames.len(), 10);

        receiver.handle_frame(&mut link, &begin_frame(STATION));
        for sequence_id in [0usize, 3, 9] {
            receiver.handle_frame(&mut link, &frames[sequence_id]);
        }
        assert!(receiver.handle_frame(&mut link, &end_frame(STATION)).is_none());

        // The END-ack advertises exactly the pieces held; the state keeps
        // waiting for the gaps instead of resetting.
        let end_ack = link.transmitted().last().unwrap();
        assert_eq!(end_ack.payload[0], 0x06);
        assert_eq!(end_ack.payload[2], 0x09);
        assert_eq!(end_ack.payload[3], 0x02);
        assert_eq!(receiver.receive_state().unwrap().pieces.len(), 3);

        // Retransmission of the gaps completes the transfer.
        for (sequence_id, frame) in frames.iter().enumerate() {
            if ![0usize, 3, 9].contains(&sequence_id) {
                receiver.handle_frame(&mut link, frame);
            }
        }
        let delivered = receiver.handle_frame(&mut link, &end_frame(STATION));
        assert_eq!(delivered, Some(payload));
    }

    #[test]
    fn test_offset_mismatch_drops_transfer() {
        let (_clock, mut receiver, mut link) = make_receiver();

        let mut sub_frame = SubFrameHeader { sub_len: 4, sub_offset: 7, total_len: 22 }
            .to_bytes()
            .to_vec();
        sub_frame.extend_from_slice(&[1, 2, 3, 4]);

        receiver.handle_frame(&mut link, &begin_frame(STATION));
        for frame in payload_frames(STATION, &sub_frame) {
            receiver.handle_frame(&mut link, &frame);
        }
        assert!(receiver.handle_frame(&mut link, &end_frame(STATION)).is_none());
        assert!(receiver.receive_state().is_none());
    }

    #[test]
    fn test_crc_mismatch_drops_silently() {
        let (_clock, mut receiver, mut link) = make_receiver();
        let payload = vec![0xAA; 16];
        let mut sub_frames = build_sub_frames(&payload, max_sub_frame_size(32));
        // Flip the last data byte before the CRC.
        let len = sub_frames[0].len();
        sub_frames[0][len - 3] ^= 0x01;

        receiver.handle_frame(&mut link, &begin_frame(STATION));
        for frame in payload_frames(STATION, &sub_frames[0]) {
            receiver.handle_frame(&mut link, &frame);
        }
        let delivered = receiver.handle_frame(&mut link, &end_frame(STATION));
        assert!(delivered.is_none());
        assert!(receiver.receive_state().is_none());

        // No delivery memory either: a retransmitted END gets no answer.
        link.take_transmitted();
        receiver.handle_frame(&mut link, &end_frame(STATION));
        assert!(link.transmitted().is_empty());
    }

    #[test]
    fn test_other_stations_ignored_while_receiving() {
        let (_clock, mut receiver, mut link) = make_receiver();
        receiver.handle_frame(&mut link, &begin_frame(STATION));
        link.take_transmitted();

        receiver.handle_frame(&mut link, &begin_frame(3000));
        receiver.handle_frame(&mut link, &build_payload_frame(3000, 0, &[0x33; 30], 32));
        receiver.handle_frame(&mut link, &end_frame(3000));

        assert!(link.transmitted().is_empty());
        let state = receiver.receive_state().unwrap();
        assert_eq!(state.address, STATION);
        assert!(state.pieces.is_empty());
    }

    #[test]
    fn test_ack_frames_do_not_prime_receiver() {
        let (_clock, mut receiver, mut link) = make_receiver();

        let ack = build_begin_end_frame(STATION, FrameType::Begin, true, 32);
        receiver.handle_frame(&mut link, &ack);

        assert!(receiver.receive_state().is_none());
        assert!(link.transmitted().is_empty());
    }

    #[test]
    fn test_wrong_length_frame_dropped() {
        let (_clock, mut receiver, mut link) = make_receiver();

        let mut frame = begin_frame(STATION);
        frame.payload.truncate(31);
        receiver.handle_frame(&mut link, &frame);

        assert!(receiver.receive_state().is_none());
    }

    #[test]
    fn test_ack_transmit_failure_resets_state() {
        let (_clock, mut receiver, mut link) = make_receiver();
        link.queue_transmit_result(Err(TransmitError::Failed));

        receiver.handle_frame(&mut link, &begin_frame(STATION));
        assert!(receiver.receive_state().is_none());
    }

    #[test]
    fn test_accepted_frames_refresh_timeout() {
        let (clock, mut receiver, mut link) = make_receiver();
        receiver.handle_frame(&mut link, &begin_frame(STATION));

        // Keep the transfer alive with traffic spaced inside the timeout.
        let step_us = ACK_TIMEOUT.as_micros() as u64;
        for _ in 0..5 {
            clock.advance_us(step_us);
            receiver.handle_frame(&mut link, &build_payload_frame(STATION, 0, &[0; 30], 32));
        }
        assert!(receiver.receive_state().is_some());
    }
}
