//! Interrupt-safe byte streaming from a USB bulk-OUT endpoint.
//!
//! The crate provides two pieces that are meant to be used together:
//!
//! - [`ring::RingBuffer`], a fixed-capacity single-producer/single-consumer byte ring. The
//!   producer side is fed from the USB interrupt, the consumer side is drained by a task (or
//!   the main loop) in fixed-size units.
//! - [`flow::FlowController`], which forces the endpoint to NAK once the ring runs low on
//!   space and releases it again after the consumer has made room.
//!
//! ```
//! use bulkflow::flow::{Endpoint, FlowConfig, FlowController};
//! use bulkflow::make_ring;
//!
//! struct Ep1;
//!
//! impl Endpoint for Ep1 {
//!     fn set_nak(&mut self, _nak: bool) {}
//! }
//!
//! static FLOW: FlowController = FlowController::new(FlowConfig::for_packet_size(64));
//!
//! let (mut producer, mut consumer) = make_ring!(1024);
//!
//! // USB interrupt
//! FLOW.on_data_received(&mut producer, &mut Ep1, &[0xAB; 64]);
//!
//! // Consumer
//! let mut row = [0; 32];
//! if consumer.has_data(row.len()) {
//!     consumer.read(&mut row);
//!     FLOW.on_consumer_progress(consumer.ring(), &mut Ep1);
//! }
//! ```

#![no_std]
#![deny(missing_docs)]

#[cfg(feature = "defmt-03")]
use defmt_03 as defmt;

#[macro_use]
mod log;

pub mod flow;
pub mod ring;
mod unsafecell;
mod waker;

pub use flow::{ConfigError, Endpoint, EndpointState, FlowConfig, FlowController, Rearm};
pub use portable_atomic;
pub use ring::{Consumer, Producer, ReadError, RingBuffer, WriteError};

#[cfg(test)]
#[macro_use]
extern crate std;
