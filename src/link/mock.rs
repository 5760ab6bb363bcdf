//! A scripted [`Link`] implementation for unit tests.
//!
//! Receive results and transmit outcomes are queued ahead of time;
//! everything the code under test transmits is recorded for inspection.
//! Beacon outcomes cycle through a configurable pattern, mirroring how a
//! flaky radio fails intermittently.

use std::collections::VecDeque;

use crate::core::error::{ReceiveError, TransmitError};
use crate::link::{Frame, Link};

/// A mock link driven entirely by scripted results.
#[derive(Debug)]
pub struct MockLink {
    address: u32,
    max_payload_size: usize,
    receive_script: VecDeque<Result<Option<Frame>, ReceiveError>>,
    transmit_script: VecDeque<Result<(), TransmitError>>,
    beacon_pattern: Vec<Result<(), TransmitError>>,
    beacon_calls: usize,
    transmitted: Vec<Frame>,
}

impl MockLink {
    /// Create a mock link for a station with the given address and frame
    /// payload size.
    pub fn new(address: u32, max_payload_size: usize) -> Self {
        Self {
            address,
            max_payload_size,
            receive_script: VecDeque::new(),
            transmit_script: VecDeque::new(),
            beacon_pattern: Vec::new(),
            beacon_calls: 0,
            transmitted: Vec::new(),
        }
    }

    /// Queue a frame to be returned by the next unclaimed `receive` call.
    pub fn queue_receive(&mut self, frame: Frame) {
        self.receive_script.push_back(Ok(Some(frame)));
    }

    /// Queue `count` polls that report nothing ready.
    pub fn queue_not_ready(&mut self, count: usize) {
        for _ in 0..count {
            self.receive_script.push_back(Ok(None));
        }
    }

    /// Queue a receive error.
    pub fn queue_receive_error(&mut self, error: ReceiveError) {
        self.receive_script.push_back(Err(error));
    }

    /// Queue an outcome for a future transmit. When the queue is empty,
    /// transmits succeed.
    pub fn queue_transmit_result(&mut self, result: Result<(), TransmitError>) {
        self.transmit_script.push_back(result);
    }

    /// Set the cyclic pattern of beacon outcomes. An empty pattern (the
    /// default) makes every beacon succeed.
    pub fn set_beacon_pattern(&mut self, pattern: Vec<Result<(), TransmitError>>) {
        self.beacon_pattern = pattern;
    }

    /// Number of times `beacon` has been called.
    pub fn beacon_calls(&self) -> usize {
        self.beacon_calls
    }

    /// Every frame transmitted so far, in order.
    pub fn transmitted(&self) -> &[Frame] {
        &self.transmitted
    }

    /// Drain the record of transmitted frames.
    pub fn take_transmitted(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.transmitted)
    }
}

impl Link for MockLink {
    fn beacon(&mut self) -> Result<(), TransmitError> {
        let call = self.beacon_calls;
        self.beacon_calls += 1;
        if self.beacon_pattern.is_empty() {
            Ok(())
        } else {
            self.beacon_pattern[call % self.beacon_pattern.len()]
        }
    }

    fn transmit(&mut self, frame: &Frame) -> Result<(), TransmitError> {
        self.transmitted.push(frame.clone());
        self.transmit_script.pop_front().unwrap_or(Ok(()))
    }

    fn receive(&mut self) -> Result<Option<Frame>, ReceiveError> {
        self.receive_script.pop_front().unwrap_or(Ok(None))
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    fn address(&self) -> u32 {
        self.address
    }
}
