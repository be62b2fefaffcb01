//! Streams RGB565 rows from a USB host to an ST7735 display.
//!
//! The USB interrupt pushes every bulk OUT packet into a ring; the display task pulls whole
//! rows out of it. The endpoint NAKs while the ring is nearly full.
#![deny(unsafe_code)]
#![deny(warnings)]
#![no_main]
#![no_std]

mod display;
mod endpoint;
mod sink;

use bulkflow::{ring, Consumer, FlowConfig, FlowController, Producer, RingBuffer};
use panic_rtt_target as _;
use rtic::app;
use rtic_monotonics::systick::prelude::*;
use rtt_target::{rprintln, rtt_init_print};
use stm32f1xx_hal::gpio::{Alternate, Floating, Input, Output, PinState, PushPull};
use stm32f1xx_hal::gpio::{PA1, PA2, PA3, PA5, PA6, PA7};
use stm32f1xx_hal::pac::SPI1;
use stm32f1xx_hal::prelude::*;
use stm32f1xx_hal::spi::{Mode, Phase, Polarity, Spi, Spi1NoRemap};
use stm32f1xx_hal::usb::{Peripheral, UsbBus, UsbBusType};
use usb_device::bus::UsbBusAllocator;
use usb_device::prelude::*;

use crate::display::{Step, St7735, HEIGHT, INIT_SEQUENCE};
use crate::endpoint::NakControl;
use crate::sink::BulkSink;

systick_monotonic!(Mono, 1000);

const RING_CAPACITY: usize = 1024;
const BULK_MAX_PACKET_SIZE: usize = 64;
const ROW_LEN: usize = 256;

const FLOW_CONFIG: FlowConfig = FlowConfig::for_packet_size(BULK_MAX_PACKET_SIZE);

const _: () = match FLOW_CONFIG.validate(RING_CAPACITY - 1) {
    Ok(()) => (),
    Err(_) => panic!("flow control thresholds do not fit the ring"),
};

static FLOW: FlowController = FlowController::new(FLOW_CONFIG);

type DisplaySpi = Spi<
    SPI1,
    Spi1NoRemap,
    (
        PA5<Alternate<PushPull>>,
        PA6<Input<Floating>>,
        PA7<Alternate<PushPull>>,
    ),
    u8,
>;
type Display =
    St7735<DisplaySpi, PA3<Output<PushPull>>, PA2<Output<PushPull>>, PA1<Output<PushPull>>>;

#[app(device = stm32f1xx_hal::pac, peripherals = true, dispatchers = [TAMPER])]
mod app {
    use super::*;

    #[shared]
    struct Shared {
        consumer: Consumer<'static, RING_CAPACITY>,
    }

    #[local]
    struct Local {
        usb_dev: UsbDevice<'static, UsbBusType>,
        sink: BulkSink<'static, UsbBusType>,
        producer: Producer<'static, RING_CAPACITY>,
        usb_nak: NakControl,
        display: Display,
        display_nak: NakControl,
        ring: &'static RingBuffer<RING_CAPACITY>,
    }

    #[init(local = [
        ring_storage: RingBuffer<RING_CAPACITY> = RingBuffer::new(),
        usb_bus: Option<UsbBusAllocator<UsbBusType>> = None,
    ])]
    fn init(cx: init::Context) -> (Shared, Local) {
        let mut flash = cx.device.FLASH.constrain();
        let rcc = cx.device.RCC.constrain();

        Mono::start(cx.core.SYST, 72_000_000);

        rtt_init_print!();
        rprintln!("init");

        let clocks = rcc
            .cfgr
            .use_hse(8.MHz())
            .sysclk(72.MHz())
            .pclk1(36.MHz())
            .freeze(&mut flash.acr);
        assert!(clocks.usbclk_valid());

        let mut gpioa = cx.device.GPIOA.split();
        let mut afio = cx.device.AFIO.constrain();

        // The Blue Pill has a fixed pull-up on D+. Pulling it low for a while makes the host
        // see a disconnect and enumerate the device again after a reflash.
        let mut usb_dp = gpioa.pa12.into_push_pull_output(&mut gpioa.crh);
        usb_dp.set_low();
        cortex_m::asm::delay(clocks.sysclk().raw() / 1000 * 80);

        let usb = Peripheral {
            usb: cx.device.USB,
            pin_dm: gpioa.pa11,
            pin_dp: usb_dp.into_floating_input(&mut gpioa.crh),
        };
        let usb_bus: &'static _ = cx.local.usb_bus.insert(UsbBus::new(usb));

        let sink = BulkSink::new(usb_bus, BULK_MAX_PACKET_SIZE as u16);
        let ep_index = sink.endpoint_index();

        let usb_dev = UsbDeviceBuilder::new(usb_bus, UsbVidPid(0xcafe, 0xceaf))
            .manufacturer("bulkflow")
            .product("USB display")
            .serial_number("0001")
            .max_packet_size_0(64)
            .build();

        let pins = (
            gpioa.pa5.into_alternate_push_pull(&mut gpioa.crl),
            gpioa.pa6.into_floating_input(&mut gpioa.crl),
            gpioa.pa7.into_alternate_push_pull(&mut gpioa.crl),
        );
        let mode = Mode {
            polarity: Polarity::IdleLow,
            phase: Phase::CaptureOnFirstTransition,
        };
        // PCLK2 / 32, as fast as the panel reliably takes.
        let spi = Spi::spi1(
            cx.device.SPI1,
            pins,
            &mut afio.mapr,
            mode,
            2250.kHz(),
            clocks,
        );

        let dc = gpioa
            .pa3
            .into_push_pull_output_with_state(&mut gpioa.crl, PinState::High);
        let rst = gpioa
            .pa2
            .into_push_pull_output_with_state(&mut gpioa.crl, PinState::High);
        let cs = gpioa
            .pa1
            .into_push_pull_output_with_state(&mut gpioa.crl, PinState::High);
        let display = St7735::new(spi, dc, rst, cs);

        let ring: &'static mut RingBuffer<RING_CAPACITY> = cx.local.ring_storage;
        let (producer, consumer) = ring.split();
        let ring = consumer.ring();

        rprintln!(
            "bulk OUT ep{}, ring {} bytes, {:?}",
            ep_index,
            ring.capacity(),
            FLOW.config()
        );

        refresh::spawn().ok();

        (
            Shared { consumer },
            Local {
                usb_dev,
                sink,
                producer,
                usb_nak: NakControl::new(ep_index),
                display,
                display_nak: NakControl::new(ep_index),
                ring,
            },
        )
    }

    #[task(
        binds = USB_LP_CAN_RX0,
        priority = 2,
        shared = [consumer],
        local = [usb_dev, sink, producer, usb_nak]
    )]
    fn usb_rx(mut cx: usb_rx::Context) {
        let readable = cx.local.usb_dev.poll(&mut [&mut *cx.local.sink]);

        if cx.local.sink.take_reconfigured() {
            // The endpoint was just armed again, drop whatever is left over.
            let producer = &mut *cx.local.producer;
            cx.shared
                .consumer
                .lock(|consumer| ring::reset(producer, consumer));
            FLOW.reset();

            rprintln!("configured");
        }

        if !readable {
            return;
        }

        let mut packet = [0; BULK_MAX_PACKET_SIZE];
        match cx.local.sink.read_packet(&mut packet) {
            Ok(len) => {
                FLOW.on_data_received(cx.local.producer, cx.local.usb_nak, &packet[..len]);
            }
            Err(UsbError::WouldBlock) => {}
            Err(e) => rprintln!("usb read failed: {:?}", e),
        }
    }

    #[task(priority = 1, shared = [consumer], local = [display, display_nak, ring])]
    async fn refresh(mut cx: refresh::Context) {
        let display = cx.local.display;
        let ring = *cx.local.ring;

        display.set_reset(false);
        Mono::delay(500.millis()).await;
        display.set_reset(true);
        Mono::delay(500.millis()).await;
        display.set_reset(false);
        Mono::delay(500.millis()).await;
        display.finish_reset();

        for step in INIT_SEQUENCE {
            match step {
                Step::Command(cmd, data) => {
                    if let Err(e) = display.command(*cmd, data) {
                        rprintln!("display init failed: {:?}", e);
                    }
                }
                Step::Sleep(ms) => Mono::delay((*ms).millis()).await,
            }
        }
        rprintln!("display ready");

        let mut row = [0; ROW_LEN];
        let mut y = 0;
        loop {
            ring.wait_for_data(ROW_LEN).await;

            // Fails only if the USB interrupt reset the ring in the meantime.
            if cx.shared.consumer.lock(|consumer| consumer.try_read(&mut row)).is_err() {
                continue;
            }

            if let Err(e) = display.draw_row(y, &row) {
                rprintln!("draw failed: {:?}", e);
            }
            y = (y + 1) % HEIGHT;

            FLOW.on_consumer_progress(ring, cx.local.display_nak);
        }
    }
}
