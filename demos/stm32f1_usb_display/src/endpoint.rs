//! Forcing the bulk OUT endpoint to NAK, bypassing `usb-device`.
//!
//! `usb-device` has no notion of a receiver that is temporarily full, so the STAT_RX field of
//! the endpoint register is toggled directly, like libopencm3's `usbd_ep_nak_set` does.
#![allow(unsafe_code)]

use bulkflow::Endpoint;

const USB_BASE: usize = 0x4000_5C00;

const CTR_RX: u32 = 1 << 15;
const CTR_TX: u32 = 1 << 7;
/// EP_TYPE, EP_KIND and EA; plain read/write bits.
const RW_MASK: u32 = 0x070F;
const STAT_RX_MASK: u32 = 0b11 << 12;
const STAT_RX_NAK: u32 = 0b10 << 12;
const STAT_RX_VALID: u32 = 0b11 << 12;

/// Handle on the `EPnR` register of one endpoint. Cheap to create, one per context.
pub struct NakControl {
    index: u8,
}

impl NakControl {
    /// `index` is the endpoint number; the bulk OUT endpoint of this device is 1.
    pub const fn new(index: u8) -> Self {
        Self { index }
    }

    fn register(&self) -> *mut u32 {
        (USB_BASE + 4 * self.index as usize) as *mut u32
    }
}

impl Endpoint for NakControl {
    fn set_nak(&mut self, nak: bool) {
        let target = if nak { STAT_RX_NAK } else { STAT_RX_VALID };

        // Only called from inside a critical section, so the read-modify-write does not
        // interleave with the USB driver touching the same register.
        //
        // SAFETY: valid, aligned MMIO register of the USB peripheral.
        unsafe {
            let epr = core::ptr::read_volatile(self.register());
            // Writing 1 to CTR_* leaves them as they are, toggle bits flip where 1 is written.
            let value = (epr & RW_MASK) | CTR_RX | CTR_TX | ((epr & STAT_RX_MASK) ^ target);
            core::ptr::write_volatile(self.register(), value);
        }
    }
}
