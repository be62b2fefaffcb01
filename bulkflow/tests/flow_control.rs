//! Simulated USB interrupt feeding a ring through the flow controller.
//!
//! The host delivers packets only while the endpoint is not NAKing, except for the packet that
//! is already in flight when the controller decides to stall.

#![cfg(not(loom))]

use bulkflow::ring::{self, RingBuffer};
use bulkflow::{Endpoint, EndpointState, FlowConfig, FlowController, Producer, Rearm};

const P: usize = 64;

#[derive(Default)]
struct SimEndpoint {
    nak: bool,
    transitions: Vec<bool>,
    // Reading a packet sets the endpoint back to VALID, like `stm32-usbd` does.
    revalidates_on_read: bool,
}

impl Endpoint for SimEndpoint {
    fn set_nak(&mut self, nak: bool) {
        if nak != self.nak {
            self.transitions.push(nak);
        }
        self.nak = nak;
    }
}

impl SimEndpoint {
    fn revalidating() -> Self {
        Self {
            revalidates_on_read: true,
            ..Self::default()
        }
    }

    /// The driver copies a packet out of the endpoint.
    fn read_packet(&mut self) {
        if self.revalidates_on_read {
            self.nak = false;
        }
    }

    fn stalls(&self) -> usize {
        self.transitions.iter().filter(|nak| **nak).count()
    }

    fn releases(&self) -> usize {
        self.transitions.iter().filter(|nak| !**nak).count()
    }
}

/// Host side of the bus: a byte stream cut into packets of at most `P` bytes.
struct SimHost {
    data: Vec<u8>,
    sent: usize,
}

impl SimHost {
    fn new(data: Vec<u8>) -> Self {
        Self { data, sent: 0 }
    }

    fn done(&self) -> bool {
        self.sent == self.data.len()
    }

    fn next_packet(&mut self) -> Option<&[u8]> {
        if self.done() {
            return None;
        }
        let start = self.sent;
        self.sent = (start + P).min(self.data.len());
        Some(&self.data[start..self.sent])
    }
}

/// Tiny xorshift so the interleavings are reproducible.
struct Scheduler(u32);

impl Scheduler {
    fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }
}

/// Hand a packet to the controller, checking first that the ring has room for it.
fn deliver<const N: usize>(
    flow: &FlowController,
    producer: &mut Producer<'_, N>,
    ep: &mut SimEndpoint,
    packet: &[u8],
) -> Option<EndpointState> {
    let available = producer.available();
    assert!(
        packet.len() <= available,
        "packet of {} bytes would overflow the ring, {} bytes free",
        packet.len(),
        available
    );

    ep.read_packet();
    flow.on_data_received(producer, ep, packet)
}

fn image_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8) ^ ((i >> 8) as u8)).collect()
}

#[test]
fn stall_and_release_exactly_once() {
    let mut ring = RingBuffer::<256>::new();
    let (mut producer, mut consumer) = ring.split();
    let flow = FlowController::new(FlowConfig::for_packet_size(P));
    let mut ep = SimEndpoint::default();

    // 191 free, then 127 free: the second packet crosses 128.
    assert_eq!(flow.on_data_received(&mut producer, &mut ep, &[1; P]), None);
    assert_eq!(
        flow.on_data_received(&mut producer, &mut ep, &[2; P]),
        Some(EndpointState::Stalled)
    );

    // The in-flight packet lands while stalled and must not stall again.
    assert_eq!(flow.on_data_received(&mut producer, &mut ep, &[3; P]), None);
    assert_eq!(producer.available(), 63);
    assert_eq!(ep.stalls(), 1);

    let mut chunk = [0; 32];
    let mut released = 0;
    for _ in 0..6 {
        consumer.read(&mut chunk);
        if flow.on_consumer_progress(consumer.ring(), &mut ep) == Some(EndpointState::Open) {
            released += 1;
            // 63 + 3 * 32 = 159 is the first level at or above 128.
            assert_eq!(consumer.available(), 159);
        }
    }

    assert_eq!(released, 1);
    assert_eq!(ep.releases(), 1);
    assert_eq!(ep.transitions, [true, false]);
    assert!(!ep.nak);
}

#[test]
fn reset_clears_ring_and_controller() {
    let mut ring = RingBuffer::<256>::new();
    let (mut producer, mut consumer) = ring.split();
    let flow = FlowController::new(FlowConfig::for_packet_size(P));
    let mut ep = SimEndpoint::default();

    for _ in 0..3 {
        flow.on_data_received(&mut producer, &mut ep, &[0; P]);
    }
    assert!(flow.is_forced_nak());

    ring::reset(&mut producer, &mut consumer);
    flow.reset();

    assert_eq!(consumer.occupied(), 0);
    assert_eq!(producer.available(), 255);
    assert!(!flow.is_forced_nak());
    assert_eq!(flow.state(), EndpointState::Open);
}

#[test]
fn repeated_reconfiguration_while_stalled() {
    let mut ring = RingBuffer::<256>::new();
    let (mut producer, mut consumer) = ring.split();
    let flow = FlowController::new(FlowConfig::for_packet_size(P));
    let mut ep = SimEndpoint::revalidating();

    for round in 1..=3 {
        while !flow.is_forced_nak() {
            deliver(&flow, &mut producer, &mut ep, &[round as u8; P]);
        }
        assert!(ep.nak);
        assert_eq!(ep.stalls(), round);

        // The host selects the same configuration again; the stack re-arms the endpoint.
        ring::reset(&mut producer, &mut consumer);
        flow.reset();
        ep.nak = false;

        assert_eq!(consumer.occupied(), 0);
        assert_eq!(flow.state(), EndpointState::Open);
    }

    // Data after the last reconfiguration is all that is left.
    deliver(&flow, &mut producer, &mut ep, &[9; P]);
    let mut out = [0; P];
    consumer.read(&mut out);
    assert_eq!(out, [9; P]);
    assert!(consumer.ring().is_empty());
}

/// Streams packets with the in-flight packet injected after every stall, starting from every
/// possible fill level reachable with a short packet.
fn worst_case_never_overflows<const N: usize>(config: FlowConfig) {
    assert_eq!(config.validate(N - 1), Ok(()));

    worst_case_run::<N>(config);
}

fn worst_case_run<const N: usize>(config: FlowConfig) {
    for preamble in 0..P {
        let mut ring = RingBuffer::<N>::new();
        let (mut producer, _consumer) = ring.split();
        let flow = FlowController::new(config);
        let mut ep = SimEndpoint::default();

        if preamble > 0 {
            deliver(&flow, &mut producer, &mut ep, &vec![0; preamble]);
        }

        while !flow.is_forced_nak() {
            deliver(&flow, &mut producer, &mut ep, &[0; P]);
        }

        for _ in 0..config.rearm.in_flight_packets() {
            deliver(&flow, &mut producer, &mut ep, &[0; P]);
        }
    }
}

#[test]
fn worst_case_timing_with_two_packet_margin() {
    worst_case_never_overflows::<256>(FlowConfig::for_packet_size(P));
    worst_case_never_overflows::<1024>(FlowConfig::for_packet_size(P));
}

#[test]
fn worst_case_timing_with_single_packet_margin_on_demand() {
    let config = FlowConfig::for_packet_size(P)
        .with_rearm(Rearm::OnDemand)
        .with_low_water(P);

    worst_case_never_overflows::<256>(config);
}

#[test]
fn single_packet_margin_is_rejected_with_automatic_rearm() {
    let config = FlowConfig::for_packet_size(P).with_low_water(P);

    assert!(config.validate(255).is_err());
}

#[test]
#[should_panic(expected = "would overflow the ring")]
fn single_packet_margin_overflows_with_automatic_rearm() {
    worst_case_run::<256>(FlowConfig::for_packet_size(P).with_low_water(P));
}

#[test]
fn stalled_endpoint_stays_nak_when_driver_revalidates() {
    let mut ring = RingBuffer::<1024>::new();
    let (mut producer, _consumer) = ring.split();
    let flow = FlowController::new(FlowConfig::for_packet_size(P));
    let mut ep = SimEndpoint::revalidating();

    // Nobody drains: the host keeps trying and only gets through while the endpoint is VALID.
    for _ in 0..64 {
        if ep.nak {
            continue;
        }
        if deliver(&flow, &mut producer, &mut ep, &[0; P]) == Some(EndpointState::Stalled) {
            // Already on the bus; reading it re-validates the endpoint.
            assert_eq!(deliver(&flow, &mut producer, &mut ep, &[0; P]), None);
        }
    }

    assert!(flow.is_forced_nak());
    assert!(ep.nak);
    assert!(producer.available() < P);
}

#[test]
fn worst_case_fills_ring_exactly() {
    let mut ring = RingBuffer::<256>::new();
    let (mut producer, _consumer) = ring.split();
    let flow = FlowController::new(FlowConfig::for_packet_size(P));
    let mut ep = SimEndpoint::default();

    // 127 buffered leaves exactly low_water free, no stall yet.
    flow.on_data_received(&mut producer, &mut ep, &[0; 63]);
    assert_eq!(flow.on_data_received(&mut producer, &mut ep, &[0; P]), None);
    assert_eq!(producer.available(), 128);

    assert_eq!(
        flow.on_data_received(&mut producer, &mut ep, &[0; P]),
        Some(EndpointState::Stalled)
    );
    flow.on_data_received(&mut producer, &mut ep, &[0; P]);

    assert_eq!(producer.occupied(), 255);
    assert_eq!(producer.available(), 0);
}

/// Streams a full 128x160 RGB565 frame through a 1024 byte ring, drained in 256 byte rows.
fn stream_frame(config: FlowConfig, mut ep: SimEndpoint, seed: u32) {
    const ROW_LEN: usize = 256;

    let frame = image_bytes(128 * 160 * 2);
    let mut host = SimHost::new(frame.clone());
    let mut ring = RingBuffer::<1024>::new();
    let (mut producer, mut consumer) = ring.split();
    let flow = FlowController::checked(config, 1023).unwrap();
    let mut sched = Scheduler(seed);

    // An on-demand endpoint starts armed for the first packet.
    let mut armed = true;
    let mut received = Vec::with_capacity(frame.len());
    let mut row = [0; ROW_LEN];

    while received.len() < frame.len() {
        let accepting = match config.rearm {
            Rearm::Automatic => !ep.nak,
            Rearm::OnDemand => armed,
        };

        if sched.next() % 3 != 0 && accepting {
            let Some(packet) = host.next_packet() else {
                continue_drain(&mut consumer, &flow, &mut ep, &mut row, &mut received);
                continue;
            };
            let state = deliver(&flow, &mut producer, &mut ep, packet);

            match config.rearm {
                Rearm::Automatic => {
                    if state == Some(EndpointState::Stalled) {
                        // The packet already on the bus.
                        if let Some(packet) = host.next_packet() {
                            assert_eq!(deliver(&flow, &mut producer, &mut ep, packet), None);
                        }
                    }
                }
                // Re-armed unless this packet stalled it.
                Rearm::OnDemand => armed = state.is_none(),
            }
        } else {
            let was_stalled = flow.is_forced_nak();
            continue_drain(&mut consumer, &flow, &mut ep, &mut row, &mut received);
            if config.rearm == Rearm::OnDemand && was_stalled && !flow.is_forced_nak() {
                armed = true;
            }
        }
    }

    assert!(host.done());
    assert_eq!(received, frame);
    assert!(consumer.ring().is_empty());
    assert!(!flow.is_forced_nak());
}

fn continue_drain(
    consumer: &mut bulkflow::Consumer<'_, 1024>,
    flow: &FlowController,
    ep: &mut SimEndpoint,
    row: &mut [u8],
    received: &mut Vec<u8>,
) {
    if consumer.has_data(row.len()) {
        consumer.read(row);
        received.extend_from_slice(row);
    }
    flow.on_consumer_progress(consumer.ring(), ep);
}

#[test]
fn full_frame_automatic_rearm() {
    for seed in [1, 0xdead_beef, 0x1234_5678] {
        stream_frame(FlowConfig::for_packet_size(P), SimEndpoint::default(), seed);
    }
}

#[test]
fn full_frame_with_revalidating_driver() {
    for seed in [5, 0x0bad_f00d] {
        stream_frame(FlowConfig::for_packet_size(P), SimEndpoint::revalidating(), seed);
    }
}

#[test]
fn full_frame_on_demand_rearm() {
    let config = FlowConfig::for_packet_size(P)
        .with_rearm(Rearm::OnDemand)
        .with_low_water(P);
    for seed in [3, 0xcafe_ceaf] {
        stream_frame(config, SimEndpoint::default(), seed);
    }
}

#[test]
fn full_frame_with_hysteresis() {
    let config = FlowConfig::for_packet_size(P).with_high_water(512);
    stream_frame(config, SimEndpoint::default(), 7);
}

#[test]
fn full_frame_transitions_alternate() {
    let frame = image_bytes(128 * 160 * 2);
    let mut host = SimHost::new(frame.clone());
    let mut ring = RingBuffer::<1024>::new();
    let (mut producer, mut consumer) = ring.split();
    let flow = FlowController::new(FlowConfig::for_packet_size(P));
    let mut ep = SimEndpoint::default();
    let mut row = [0; 256];
    let mut received = Vec::new();

    // Producer runs until stalled before each row is drained, forcing a stall per cycle.
    while received.len() < frame.len() {
        while !ep.nak {
            match host.next_packet() {
                Some(packet) => {
                    flow.on_data_received(&mut producer, &mut ep, packet);
                }
                None => break,
            }
        }
        continue_drain(&mut consumer, &flow, &mut ep, &mut row, &mut received);
    }

    assert_eq!(received, frame);
    assert!(ep.stalls() > 0);
    assert_eq!(ep.stalls(), ep.releases());
    for pair in ep.transitions.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
}
