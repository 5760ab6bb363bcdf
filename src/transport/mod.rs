//! The radio transport: reliable payloads over an unreliable fixed-frame
//! link.
//!
//! A [`RadioTransport`] owns three concerns that share one link behind a
//! mutex:
//!
//! - **Senders**: any thread may call [`RadioTransport::send`]. The call
//!   fragments the payload into sub-frames and runs the
//!   BEGIN / PAYLOAD / END handshake for each, retransmitting unacked
//!   fragments until the peer's selective-ack bitmap fills up or the
//!   deadline expires. The link mutex is held for the whole call.
//! - **The receive thread** polls the link, drives the
//!   [`TransportReceiver`](receiver::TransportReceiver) state machine, and
//!   dispatches reassembled payloads and beacons to the event handler.
//! - **The beacon thread** announces this station at a jittered interval.

pub mod frame;
pub mod receiver;
pub mod timing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::core::constants::{
    ACK_TIMEOUT, BROADCAST_ADDRESS, DEFAULT_BEACON_INTERVAL, MAX_FRAGMENTS,
    MAX_LINK_PAYLOAD_SIZE, MIN_LINK_PAYLOAD_SIZE, PAYLOAD_OVERHEAD, RECEIVE_POLL_INTERVAL,
};
use crate::core::error::{SendError, TransmitError};
use crate::link::{Frame, Link};
use self::frame::{
    bitmap_get, build_begin_end_frame, build_payload_frame, build_sub_frames, fragment_count,
    is_ack, max_sub_frame_size, FrameType,
};
use self::receiver::TransportReceiver;
use self::timing::{jittered_interval, Clock, RealClock};

/// Upper bound on one sleep slice in the beacon scheduler, so shutdown is
/// never stuck behind a full beacon interval.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Configuration for a [`RadioTransport`].
#[derive(Debug, Clone)]
pub struct RadioTransportConfig {
    /// Interval between beacons; each wait is jittered by ±10 %.
    pub beacon_interval: Duration,
}

impl Default for RadioTransportConfig {
    fn default() -> Self {
        Self { beacon_interval: DEFAULT_BEACON_INTERVAL }
    }
}

/// Callbacks raised by the transport.
///
/// Handlers are invoked from the transport's internal threads (and, for
/// beacons observed mid-send, from the sending thread) while transport
/// locks may be held: implementations must be thread-safe and must not
/// call back into the transport.
pub trait TransportEventHandler: Send + Sync {
    /// A beacon could not be transmitted. The beacon thread keeps running.
    fn on_beacon_failed(&self, error: TransmitError);

    /// A beacon was received from the given station.
    fn on_beacon_received(&self, address: u32);

    /// A payload was reassembled, CRC-verified and is ready for the
    /// application.
    fn on_frame_received(&self, address: u32, payload: Vec<u8>);
}

/// A reliable datagram transport over an abstract [`Link`].
pub struct RadioTransport<L: Link + Send + 'static> {
    link: Arc<Mutex<L>>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn TransportEventHandler>,
    running: Arc<AtomicBool>,
    beacon_thread: Option<JoinHandle<()>>,
    receive_thread: Option<JoinHandle<()>>,
}

impl<L: Link + Send + 'static> RadioTransport<L> {
    /// Set up a transport over the supplied link and start the beacon and
    /// receive threads.
    ///
    /// Panics if the link's payload size is outside `[3, 257]` or the
    /// station address is zero or the broadcast address; both are
    /// programming errors caught at startup.
    pub fn new(
        config: RadioTransportConfig,
        link: L,
        event_handler: Arc<dyn TransportEventHandler>,
    ) -> Self {
        Self::with_clock(config, link, event_handler, Arc::new(RealClock::new()))
    }

    /// Like [`RadioTransport::new`] but reading time from the supplied
    /// clock, for tests that control timeouts explicitly.
    pub fn with_clock(
        config: RadioTransportConfig,
        link: L,
        event_handler: Arc<dyn TransportEventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let max_payload_size = link.max_payload_size();
        assert!(
            (MIN_LINK_PAYLOAD_SIZE..=MAX_LINK_PAYLOAD_SIZE).contains(&max_payload_size),
            "link payload size {max_payload_size} outside [{MIN_LINK_PAYLOAD_SIZE}, {MAX_LINK_PAYLOAD_SIZE}]"
        );
        let station = link.address();
        assert!(
            station != 0 && station != BROADCAST_ADDRESS,
            "invalid station address {station:#010x}"
        );

        let link = Arc::new(Mutex::new(link));
        let running = Arc::new(AtomicBool::new(true));

        let beacon_thread = {
            let link = Arc::clone(&link);
            let event_handler = Arc::clone(&event_handler);
            let running = Arc::clone(&running);
            let interval = config.beacon_interval;
            thread::Builder::new()
                .name("picolink-beacon".into())
                .spawn(move || beacon_loop(&link, &*event_handler, &running, interval))
                .expect("failed to spawn beacon thread")
        };

        let receive_thread = {
            let link = Arc::clone(&link);
            let event_handler = Arc::clone(&event_handler);
            let running = Arc::clone(&running);
            let clock = Arc::clone(&clock);
            thread::Builder::new()
                .name("picolink-receive".into())
                .spawn(move || receive_loop(&link, &*event_handler, &running, clock))
                .expect("failed to spawn receive thread")
        };

        Self {
            link,
            clock,
            event_handler,
            running,
            beacon_thread: Some(beacon_thread),
            receive_thread: Some(receive_thread),
        }
    }

    /// Send an arbitrary-size payload to the given station, blocking until
    /// every fragment is acknowledged or `timeout` expires.
    ///
    /// The link mutex is held for the entire call, so the beacon and
    /// receive threads are scheduled around it. Concurrent `send` calls
    /// from different threads are serialized on the same mutex; ordering
    /// between them is unspecified.
    pub fn send(&self, payload: &[u8], address: u32, timeout: Duration) -> Result<(), SendError> {
        let mut link = self.link.lock().unwrap();
        send_frames(
            &mut *link,
            self.clock.as_ref(),
            self.event_handler.as_ref(),
            payload,
            address,
            timeout,
        )
    }

    /// The link associated with this transport.
    pub fn link(&self) -> &Arc<Mutex<L>> {
        &self.link
    }
}

impl<L: Link + Send + 'static> Drop for RadioTransport<L> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.beacon_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.receive_thread.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// SEND PATH
// =============================================================================

fn check_deadline(clock: &dyn Clock, deadline_us: u64) -> Result<(), SendError> {
    if clock.now_us() > deadline_us {
        Err(SendError::Timeout)
    } else {
        Ok(())
    }
}

/// Fragment `payload` and run the full handshake for every sub-frame.
/// Callers hold the link mutex.
fn send_frames<L: Link>(
    link: &mut L,
    clock: &dyn Clock,
    event_handler: &dyn TransportEventHandler,
    payload: &[u8],
    address: u32,
    timeout: Duration,
) -> Result<(), SendError> {
    let max_payload_size = link.max_payload_size();
    if max_payload_size <= PAYLOAD_OVERHEAD {
        return Err(SendError::TooLarge);
    }
    let fragment_size = max_payload_size - PAYLOAD_OVERHEAD;

    // Every fragment must have a sequence id and a bit in one END-ack
    // bitmap; whichever is scarcer bounds the sub-frame.
    let fragment_limit = MAX_FRAGMENTS.min(fragment_size * 8);

    let sub_frames = build_sub_frames(payload, max_sub_frame_size(max_payload_size));
    for sub_frame in &sub_frames {
        if fragment_count(sub_frame.len(), fragment_size) > fragment_limit {
            return Err(SendError::TooLarge);
        }
    }

    let deadline_us = clock.now_us() + timeout.as_micros() as u64;
    for sub_frame in &sub_frames {
        send_sub_frame(link, clock, event_handler, sub_frame, address, deadline_us)?;
    }
    Ok(())
}

/// One sub-frame: BEGIN exchange, then loop transmitting unacked fragments
/// and merging END-ack bitmaps until everything is acknowledged.
fn send_sub_frame<L: Link>(
    link: &mut L,
    clock: &dyn Clock,
    event_handler: &dyn TransportEventHandler,
    sub_frame: &[u8],
    address: u32,
    deadline_us: u64,
) -> Result<(), SendError> {
    let max_payload_size = link.max_payload_size();
    let fragment_size = max_payload_size - PAYLOAD_OVERHEAD;

    exchange_control(link, clock, event_handler, address, FrameType::Begin, deadline_us)?;

    let total = fragment_count(sub_frame.len(), fragment_size);
    let mut acknowledged = vec![false; total];
    let mut acknowledged_count = 0;
    while acknowledged_count < total {
        for (sequence_id, piece) in sub_frame.chunks(fragment_size).enumerate() {
            if acknowledged[sequence_id] {
                continue;
            }
            let mut fragment = piece.to_vec();
            fragment.resize(fragment_size, 0);
            let frame =
                build_payload_frame(address, sequence_id as u8, &fragment, max_payload_size);
            if let Err(err) = link.transmit(&frame) {
                // Absorbed: the fragment stays unacked and goes out again
                // on the next pass.
                warn!("fragment {sequence_id} transmit to station {address} failed: {err}");
            }
            check_deadline(clock, deadline_us)?;
        }

        let ack =
            exchange_control(link, clock, event_handler, address, FrameType::End, deadline_us)?;
        for sequence_id in 0..total {
            if !acknowledged[sequence_id] && bitmap_get(&ack.payload, sequence_id as u8) {
                acknowledged[sequence_id] = true;
                acknowledged_count += 1;
            }
        }
    }
    Ok(())
}

/// Transmit a BEGIN/END control frame and wait for the matching ack,
/// retransmitting whenever the peer stays silent past [`ACK_TIMEOUT`].
fn exchange_control<L: Link>(
    link: &mut L,
    clock: &dyn Clock,
    event_handler: &dyn TransportEventHandler,
    address: u32,
    frame_type: FrameType,
    deadline_us: u64,
) -> Result<Frame, SendError> {
    let max_payload_size = link.max_payload_size();
    let request = build_begin_end_frame(address, frame_type, false, max_payload_size);

    loop {
        link.transmit(&request)?;
        check_deadline(clock, deadline_us)?;

        let retry_at_us = clock.now_us() + ACK_TIMEOUT.as_micros() as u64;
        while clock.now_us() < retry_at_us {
            match link.receive()? {
                Some(frame) if frame.is_beacon() => {
                    event_handler.on_beacon_received(frame.address);
                }
                Some(frame) if frame.payload.len() != max_payload_size => {
                    warn!(
                        "ignoring frame from station {} with unexpected length {}",
                        frame.address,
                        frame.payload.len()
                    );
                }
                Some(frame) if frame.address != address => {
                    debug!("ignoring frame from unexpected station {}", frame.address);
                }
                Some(frame) => {
                    if FrameType::from_byte(frame.payload[0]) == Some(frame_type)
                        && is_ack(frame.payload[0])
                    {
                        return Ok(frame);
                    }
                    // The peer's own concurrent attempt, or a stale control
                    // frame; it has to back off by higher-level means.
                    debug!(
                        "ignoring frame from station {} while waiting for {frame_type:?} ack",
                        frame.address
                    );
                }
                None => thread::sleep(RECEIVE_POLL_INTERVAL),
            }
            check_deadline(clock, deadline_us)?;
        }
        debug!("no {frame_type:?} ack from station {address}, retransmitting");
    }
}

// =============================================================================
// BACKGROUND THREADS
// =============================================================================

fn beacon_loop<L: Link>(
    link: &Arc<Mutex<L>>,
    event_handler: &dyn TransportEventHandler,
    running: &AtomicBool,
    interval: Duration,
) {
    let mut next_beacon = Instant::now();
    while running.load(Ordering::Relaxed) {
        let result = link.lock().unwrap().beacon();
        if let Err(err) = result {
            warn!("beacon transmit failed: {err}");
            event_handler.on_beacon_failed(err);
        }

        // Schedule against wall-clock time: a beacon delayed by a long send
        // does not push the whole schedule back.
        next_beacon += jittered_interval(interval);
        let now = Instant::now();
        if next_beacon < now {
            next_beacon = now;
        }
        while running.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= next_beacon {
                break;
            }
            thread::sleep((next_beacon - now).min(SHUTDOWN_POLL_INTERVAL));
        }
    }
}

enum ReceiveOutcome {
    Delivered(u32, Vec<u8>),
    Beacon(u32),
    Handled,
    Idle,
}

fn receive_loop<L: Link>(
    link: &Arc<Mutex<L>>,
    event_handler: &dyn TransportEventHandler,
    running: &AtomicBool,
    clock: Arc<dyn Clock>,
) {
    let mut transport_receiver = TransportReceiver::new(clock);
    while running.load(Ordering::Relaxed) {
        // Acks go out under the same lock the frame came in on; handler
        // dispatch happens after the lock is released.
        let outcome = {
            let mut link = link.lock().unwrap();
            match link.receive() {
                Ok(Some(frame)) if frame.is_beacon() => ReceiveOutcome::Beacon(frame.address),
                Ok(Some(frame)) => match transport_receiver.handle_frame(&mut *link, &frame) {
                    Some(payload) => ReceiveOutcome::Delivered(frame.address, payload),
                    None => ReceiveOutcome::Handled,
                },
                Ok(None) => ReceiveOutcome::Idle,
                Err(err) => {
                    warn!("link receive failed: {err}");
                    ReceiveOutcome::Idle
                }
            }
        };

        match outcome {
            ReceiveOutcome::Delivered(address, payload) => {
                event_handler.on_frame_received(address, payload)
            }
            ReceiveOutcome::Beacon(address) => event_handler.on_beacon_received(address),
            ReceiveOutcome::Handled => {}
            ReceiveOutcome::Idle => thread::sleep(RECEIVE_POLL_INTERVAL),
        }
    }
}
