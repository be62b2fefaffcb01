//! Vendor specific USB class with a single bulk OUT endpoint.

use usb_device::class_prelude::*;
use usb_device::control::{Recipient, Request, RequestType};

const USB_CLASS_VENDOR: u8 = 0xff;

/// Receives raw bulk data; there is no protocol on top.
pub struct BulkSink<'a, B: UsbBus> {
    interface: InterfaceNumber,
    data_out: EndpointOut<'a, B>,
    // Set on every SET_CONFIGURATION, including one repeated while already configured.
    reconfigured: bool,
}

impl<'a, B: UsbBus> BulkSink<'a, B> {
    pub fn new(alloc: &'a UsbBusAllocator<B>, max_packet_size: u16) -> Self {
        Self {
            interface: alloc.interface(),
            data_out: alloc.bulk(max_packet_size),
            reconfigured: false,
        }
    }

    /// Endpoint number assigned to the bulk OUT endpoint.
    pub fn endpoint_index(&self) -> u8 {
        self.data_out.address().index() as u8
    }

    /// Returns true once after the host has (re-)selected a configuration, which re-arms the
    /// endpoint.
    pub fn take_reconfigured(&mut self) -> bool {
        core::mem::take(&mut self.reconfigured)
    }

    /// Copy a received packet out of the packet memory. The driver re-validates the endpoint
    /// as part of this, even while flow control holds it at NAK; `on_data_received` puts the
    /// NAK back.
    pub fn read_packet(&self, buf: &mut [u8]) -> usb_device::Result<usize> {
        self.data_out.read(buf)
    }
}

impl<B: UsbBus> UsbClass<B> for BulkSink<'_, B> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface(self.interface, USB_CLASS_VENDOR, 0x00, 0x00)?;
        writer.endpoint(&self.data_out)?;
        Ok(())
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = xfer.request();

        // Only observed; left unaccepted so the device still handles the standard request.
        if req.request_type == RequestType::Standard
            && req.recipient == Recipient::Device
            && req.request == Request::SET_CONFIGURATION
        {
            self.reconfigured = true;
        }
    }
}
