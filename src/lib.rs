//! # picolink
//!
//! Reliable datagram transport for tiny fixed-frame packet radios.
//!
//! NRF24L01-class radios move single 32-byte frames with no delivery
//! guarantee. `picolink` turns such a link into a best-effort but reliable
//! datagram service: hand it an arbitrary byte payload and a 32-bit station
//! address and it fragments, transmits, selectively retransmits and
//! reassembles until the peer holds a CRC-verified copy — or the deadline
//! expires. It provides:
//!
//! - **Reliability**: per-fragment selective acknowledgement via bitmaps,
//!   with retransmission of exactly the fragments that were lost
//! - **Framing**: two-level framing (sub-frames inside link frames) that
//!   keeps sequence ids one byte wide and reassembly memory bounded
//! - **Integrity**: CRC16 over every reassembled payload
//! - **Discovery**: a beacon thread announcing the station at a jittered
//!   interval
//! - **Portability**: generic over a five-method [`Link`] trait; loopback
//!   and scripted mock links ship in-crate
//!
//! ## Modules
//!
//! - [`core`]: constants, CRC16, error types
//! - [`link`]: the [`Link`] trait and the in-crate implementations
//! - [`transport`]: the transport itself, its receiver state machine,
//!   wire framing and time sources
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use picolink::link::loopback::loopback_pair;
//! use picolink::{RadioTransport, RadioTransportConfig, TransmitError, TransportEventHandler};
//!
//! struct PrintHandler;
//!
//! impl TransportEventHandler for PrintHandler {
//!     fn on_beacon_failed(&self, error: TransmitError) {
//!         eprintln!("beacon failed: {error}");
//!     }
//!
//!     fn on_beacon_received(&self, address: u32) {
//!         println!("station {address} is alive");
//!     }
//!
//!     fn on_frame_received(&self, address: u32, payload: Vec<u8>) {
//!         println!("{} bytes from station {address}", payload.len());
//!     }
//! }
//!
//! let (link_a, link_b) = loopback_pair(1000, 2000, 32);
//! let handler = Arc::new(PrintHandler);
//! let a = RadioTransport::new(RadioTransportConfig::default(), link_a, handler.clone());
//! let _b = RadioTransport::new(RadioTransportConfig::default(), link_b, handler);
//!
//! a.send(b"hello over the air", 2000, Duration::from_secs(1)).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod link;
pub mod transport;

// Re-export commonly used items at crate root
pub use crate::core::{ReceiveError, SendError, TransmitError};
pub use crate::link::{Frame, Link};
pub use crate::transport::{RadioTransport, RadioTransportConfig, TransportEventHandler};
