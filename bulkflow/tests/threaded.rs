//! The ring shared between real threads, with the consumer blocking on whole rows.

#![cfg(not(loom))]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulkflow::{make_ring, Endpoint, FlowConfig, FlowController};

const ROW_LEN: usize = 256;
const ROWS: usize = 160;

/// NAK bit shared between the "interrupt" thread and the consumer, like the endpoint register.
#[derive(Clone, Default)]
struct SharedEndpoint {
    nak: Arc<AtomicBool>,
    stalls: Arc<AtomicUsize>,
}

impl Endpoint for SharedEndpoint {
    fn set_nak(&mut self, nak: bool) {
        if nak {
            self.stalls.fetch_add(1, Ordering::SeqCst);
        }
        self.nak.store(nak, Ordering::SeqCst);
    }
}

fn pattern(i: usize) -> u8 {
    (i % 251) as u8
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rows_arrive_in_order() {
    let (mut producer, mut consumer) = make_ring!(1024);

    let writer = tokio::spawn(async move {
        let mut i = 0;
        let mut packet = [0; 64];
        while i < ROW_LEN * ROWS {
            for b in packet.iter_mut() {
                *b = pattern(i);
                i += 1;
            }
            producer.write_all(&packet).await;
        }
    });

    let mut row = [0; ROW_LEN];
    for r in 0..ROWS {
        consumer.read_exact(&mut row).await;
        for (j, b) in row.iter().enumerate() {
            assert_eq!(*b, pattern(r * ROW_LEN + j));
        }
    }

    writer.await.unwrap();
    assert!(consumer.ring().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flow_controlled_producer_thread() {
    static FLOW: FlowController = FlowController::new(FlowConfig::for_packet_size(64));

    let (mut producer, mut consumer) = make_ring!(1024);
    let ep = SharedEndpoint::default();

    let mut isr_ep = ep.clone();
    let isr = std::thread::spawn(move || {
        let mut i = 0;
        let mut packet = [0; 64];
        while i < ROW_LEN * ROWS {
            // The host retries until the endpoint stops NAKing.
            while isr_ep.nak.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            for b in packet.iter_mut() {
                *b = pattern(i);
                i += 1;
            }
            FLOW.on_data_received(&mut producer, &mut isr_ep, &packet);
        }
    });

    let mut consumer_ep = ep.clone();
    let mut row = [0; ROW_LEN];
    for r in 0..ROWS {
        consumer.read_exact(&mut row).await;
        FLOW.on_consumer_progress(consumer.ring(), &mut consumer_ep);

        assert_eq!(row[0], pattern(r * ROW_LEN));
        assert_eq!(row[ROW_LEN - 1], pattern(r * ROW_LEN + ROW_LEN - 1));

        // A slow display.
        if r % 16 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    isr.join().unwrap();
    assert!(!FLOW.is_forced_nak());
    assert!(ep.stalls.load(Ordering::SeqCst) > 0);
}
