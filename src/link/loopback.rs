//! An in-memory pair of links wired back to back.
//!
//! Frames transmitted on one end arrive on the other, tagged with the
//! sender's station address the way a radio receiver would see them.
//! A tamper hook can mutate or drop outgoing frames to simulate a lossy
//! channel.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

use crate::core::error::{ReceiveError, TransmitError};
use crate::link::{Frame, Link};

/// Hook applied to every outgoing frame. Return `false` to drop the frame
/// on the air, as a radio-level CRC failure would.
pub type TamperFn = Box<dyn FnMut(&mut Frame) -> bool + Send>;

/// One end of an in-memory link pair created by [`loopback_pair`].
pub struct LoopbackLink {
    address: u32,
    max_payload_size: usize,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    tamper: Option<TamperFn>,
}

/// Create two links wired to each other.
///
/// Panics if `max_payload_size` is outside `[3, 257]`.
pub fn loopback_pair(
    address_a: u32,
    address_b: u32,
    max_payload_size: usize,
) -> (LoopbackLink, LoopbackLink) {
    assert!(
        (crate::core::constants::MIN_LINK_PAYLOAD_SIZE
            ..=crate::core::constants::MAX_LINK_PAYLOAD_SIZE)
            .contains(&max_payload_size),
        "invalid link payload size: {max_payload_size}"
    );

    let (tx_a, rx_b) = channel();
    let (tx_b, rx_a) = channel();
    let a = LoopbackLink {
        address: address_a,
        max_payload_size,
        tx: tx_a,
        rx: rx_a,
        tamper: None,
    };
    let b = LoopbackLink {
        address: address_b,
        max_payload_size,
        tx: tx_b,
        rx: rx_b,
        tamper: None,
    };
    (a, b)
}

impl LoopbackLink {
    /// Install a tamper hook applied to every outgoing frame.
    pub fn set_tamper(&mut self, tamper: impl FnMut(&mut Frame) -> bool + Send + 'static) {
        self.tamper = Some(Box::new(tamper));
    }

    fn deliver(&mut self, mut frame: Frame) -> Result<(), TransmitError> {
        if let Some(tamper) = self.tamper.as_mut() {
            if !tamper(&mut frame) {
                // Lost on the air; the radio still reports a clean send.
                return Ok(());
            }
        }
        self.tx.send(frame).map_err(|_| TransmitError::Failed)
    }
}

impl Link for LoopbackLink {
    fn beacon(&mut self) -> Result<(), TransmitError> {
        let frame = Frame { address: self.address, payload: Vec::new() };
        self.deliver(frame)
    }

    fn transmit(&mut self, frame: &Frame) -> Result<(), TransmitError> {
        if frame.payload.len() > self.max_payload_size {
            return Err(TransmitError::TooLarge);
        }
        // The peer sees the frame tagged with the sender's address.
        let outgoing = Frame { address: self.address, payload: frame.payload.clone() };
        self.deliver(outgoing)
    }

    fn receive(&mut self) -> Result<Option<Frame>, ReceiveError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ReceiveError::Failed),
        }
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    fn address(&self) -> u32 {
        self.address
    }
}
