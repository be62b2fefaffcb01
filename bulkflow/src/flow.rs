//! NAK based flow control for a bulk-OUT endpoint that feeds a [`RingBuffer`].
//!
//! The host keeps sending packets as long as the endpoint accepts them. Once the free space in
//! the ring drops below `low_water`, the controller forces the endpoint to NAK; the host then
//! keeps retrying until the consumer has drained enough for `available >= high_water`, at which
//! point the endpoint is released back to VALID.
//!
//! ```text
//!            packet received, available < low_water
//!   ┌──────┐ ─────────────────────────────────────> ┌─────────┐
//!   │ Open │                                        │ Stalled │
//!   └──────┘ <───────────────────────────────────── └─────────┘
//!            consumer progress, available >= high_water
//! ```
//!
//! Both thresholds default to twice the max packet size, so there is no hysteresis band
//! unless one is configured with [`FlowConfig::with_high_water`].

#[cfg(not(loom))]
use portable_atomic::{AtomicBool, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, Ordering};

use crate::ring::{Producer, RingBuffer};

#[cfg(feature = "defmt-03")]
use crate::defmt;

/// The receive side of a USB endpoint whose acceptance of new packets can be switched off.
///
/// Implementations usually poke the endpoint register of the USB peripheral directly. Each
/// execution context (interrupt handler, consumer task) holds its own handle.
pub trait Endpoint {
    /// Force the endpoint to answer NAK (`true`) or let it accept packets again (`false`).
    fn set_nak(&mut self, nak: bool);
}

impl<E: Endpoint + ?Sized> Endpoint for &mut E {
    fn set_nak(&mut self, nak: bool) {
        (**self).set_nak(nak)
    }
}

/// Acceptance state of the endpoint as seen by the [`FlowController`].
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Packets are accepted.
    Open,
    /// The endpoint is forced to NAK; buffered data is still being drained.
    Stalled,
}

/// How the USB stack returns the endpoint to VALID after a packet has been received.
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// The stack re-validates the endpoint as soon as the packet has been read out of it
    /// (libopencm3, `stm32-usbd`). One more packet may land before a forced NAK takes effect,
    /// and every packet read while stalled has to be followed by another forced NAK.
    Automatic,
    /// The endpoint NAKs after every packet until it is explicitly re-armed (STM32Cube
    /// `PrepareReceive`). The controller re-arms it while there is room.
    OnDemand,
}

impl Rearm {
    /// Packets that can still arrive after the controller decided to stall.
    pub const fn in_flight_packets(self) -> usize {
        match self {
            Rearm::Automatic => 1,
            Rearm::OnDemand => 0,
        }
    }
}

/// Thresholds of the [`FlowController`].
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    /// Largest packet the endpoint delivers, in bytes.
    pub max_packet_size: usize,
    /// The endpoint is stalled once fewer bytes than this are free after a packet.
    pub low_water: usize,
    /// A stalled endpoint is released once at least this many bytes are free.
    pub high_water: usize,
    /// Re-arm behavior of the USB stack.
    pub rearm: Rearm,
}

impl FlowConfig {
    /// Stall below, and release at, two packets of free space with automatic re-arm.
    pub const fn for_packet_size(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            low_water: 2 * max_packet_size,
            high_water: 2 * max_packet_size,
            rearm: Rearm::Automatic,
        }
    }

    /// Set the stall threshold. The release threshold is raised to match if it was lower.
    pub const fn with_low_water(mut self, low_water: usize) -> Self {
        self.low_water = low_water;
        if self.high_water < low_water {
            self.high_water = low_water;
        }
        self
    }

    /// Set the release threshold, opening a hysteresis band above `low_water`.
    pub const fn with_high_water(mut self, high_water: usize) -> Self {
        self.high_water = high_water;
        self
    }

    /// Set the re-arm behavior of the USB stack.
    pub const fn with_rearm(mut self, rearm: Rearm) -> Self {
        self.rearm = rearm;
        self
    }

    /// Smallest `low_water` that keeps a packet arriving at the worst moment from overflowing
    /// the ring: one packet for the one that crosses the threshold plus whatever may still be
    /// in flight.
    pub const fn min_low_water(&self) -> usize {
        self.max_packet_size * (1 + self.rearm.in_flight_packets())
    }

    /// Returns true if the release threshold lies above the stall threshold.
    pub const fn has_hysteresis(&self) -> bool {
        self.high_water > self.low_water
    }

    /// Check the thresholds against a ring of the given usable `capacity`.
    pub const fn validate(&self, capacity: usize) -> Result<(), ConfigError> {
        if self.max_packet_size == 0 {
            return Err(ConfigError::ZeroPacketSize);
        }

        let required = self.min_low_water();
        if self.low_water < required {
            return Err(ConfigError::LowWaterTooSmall {
                low_water: self.low_water,
                required,
            });
        }

        if self.high_water < self.low_water {
            return Err(ConfigError::HighWaterBelowLowWater {
                low_water: self.low_water,
                high_water: self.high_water,
            });
        }

        if self.high_water > capacity {
            return Err(ConfigError::ExceedsCapacity {
                threshold: self.high_water,
                capacity,
            });
        }

        Ok(())
    }
}

/// A [`FlowConfig`] that cannot work.
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The max packet size is zero.
    ZeroPacketSize,
    /// The stall threshold leaves too little room for packets still arriving.
    LowWaterTooSmall {
        /// Configured stall threshold.
        low_water: usize,
        /// Minimum for the configured packet size and re-arm behavior.
        required: usize,
    },
    /// The endpoint would be released while still below the stall threshold.
    HighWaterBelowLowWater {
        /// Configured stall threshold.
        low_water: usize,
        /// Configured release threshold.
        high_water: usize,
    },
    /// The ring can never have that much free space, a stalled endpoint would never be
    /// released.
    ExceedsCapacity {
        /// The offending threshold.
        threshold: usize,
        /// Usable capacity of the ring.
        capacity: usize,
    },
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::ZeroPacketSize => write!(f, "max packet size must not be zero"),
            ConfigError::LowWaterTooSmall {
                low_water,
                required,
            } => write!(
                f,
                "low water mark {low_water} is below the required {required} bytes"
            ),
            ConfigError::HighWaterBelowLowWater {
                low_water,
                high_water,
            } => write!(
                f,
                "high water mark {high_water} is below low water mark {low_water}"
            ),
            ConfigError::ExceedsCapacity {
                threshold,
                capacity,
            } => write!(
                f,
                "threshold {threshold} exceeds ring capacity of {capacity} bytes"
            ),
        }
    }
}

impl core::error::Error for ConfigError {}

/// Stalls and releases an endpoint according to the fill level of a ring.
///
/// `on_data_received` runs in the USB interrupt, `on_consumer_progress` in the consumer.
/// The decision and the endpoint update happen inside one critical section, so neither
/// side can observe the other half way through a transition.
pub struct FlowController {
    config: FlowConfig,
    forced_nak: AtomicBool,
}

impl core::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlowController")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl FlowController {
    /// Create a controller in the `Open` state. The configuration is not validated.
    #[cfg(not(loom))]
    pub const fn new(config: FlowConfig) -> Self {
        Self {
            config,
            forced_nak: AtomicBool::new(false),
        }
    }

    /// Create a controller in the `Open` state. The configuration is not validated.
    #[cfg(loom)]
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            forced_nak: AtomicBool::new(false),
        }
    }

    /// Create a controller after validating `config` against a ring of `capacity` bytes.
    pub fn checked(config: FlowConfig, capacity: usize) -> Result<Self, ConfigError> {
        config.validate(capacity)?;
        Ok(Self::new(config))
    }

    /// The thresholds in use.
    pub const fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Returns true if the endpoint is currently forced to NAK.
    pub fn is_forced_nak(&self) -> bool {
        self.forced_nak.load(Ordering::Acquire)
    }

    /// Current acceptance state.
    pub fn state(&self) -> EndpointState {
        if self.is_forced_nak() {
            EndpointState::Stalled
        } else {
            EndpointState::Open
        }
    }

    /// Back to `Open`. Call whenever the host (re-)configures the device; the USB stack arms
    /// the endpoint as part of that.
    pub fn reset(&self) {
        self.forced_nak.store(false, Ordering::Release);

        trace!("flow control reset");
    }

    /// Store a received `packet` and stall the endpoint if the ring is running out of space.
    ///
    /// Called from the USB interrupt for every packet, right after it has been read out of the
    /// endpoint. The packet must fit: the thresholds are what guarantees it (see
    /// [`FlowConfig::validate`]), it is only checked in debug builds.
    ///
    /// With [`Rearm::Automatic`] a packet arriving while stalled makes the controller write
    /// NAK again, since the read re-validated the endpoint. That is not a transition.
    /// Returns the new state if this call changed it.
    pub fn on_data_received<E: Endpoint, const N: usize>(
        &self,
        producer: &mut Producer<'_, N>,
        endpoint: &mut E,
        packet: &[u8],
    ) -> Option<EndpointState> {
        debug_assert!(
            packet.len() <= self.config.max_packet_size,
            "packet of {} bytes exceeds max packet size {}",
            packet.len(),
            self.config.max_packet_size
        );

        // Reading the packet out of the endpoint re-validated it. While stalled it has to be
        // forced back to NAK before the host can squeeze in another packet.
        if self.config.rearm == Rearm::Automatic {
            critical_section::with(|_| {
                if self.forced_nak.load(Ordering::Acquire) {
                    endpoint.set_nak(true);
                }
            });
        }

        producer.write(packet);

        critical_section::with(|_| {
            if self.forced_nak.load(Ordering::Acquire) {
                return None;
            }

            let available = producer.available();
            if available < self.config.low_water {
                // An on-demand endpoint is already NAKing; it just does not get re-armed.
                if self.config.rearm == Rearm::Automatic {
                    endpoint.set_nak(true);
                }
                self.forced_nak.store(true, Ordering::Release);

                debug!("bulk OUT stalled, {=usize} bytes free", available);
                Some(EndpointState::Stalled)
            } else {
                if self.config.rearm == Rearm::OnDemand {
                    endpoint.set_nak(false);
                }
                None
            }
        })
    }

    /// Release a stalled endpoint once the consumer has drained enough of `ring`.
    ///
    /// Called after every unit the consumer takes out. Returns the new state if this call
    /// changed it.
    pub fn on_consumer_progress<E: Endpoint, const N: usize>(
        &self,
        ring: &RingBuffer<N>,
        endpoint: &mut E,
    ) -> Option<EndpointState> {
        critical_section::with(|_| {
            if !self.forced_nak.load(Ordering::Acquire) {
                return None;
            }

            let available = ring.available();
            if available >= self.config.high_water {
                endpoint.set_nak(false);
                self.forced_nak.store(false, Ordering::Release);

                debug!("bulk OUT released, {=usize} bytes free", available);
                Some(EndpointState::Open)
            } else {
                None
            }
        })
    }
}
