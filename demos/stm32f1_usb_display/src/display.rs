//! Minimal ST7735 driver: command transfers and full-width row blits, RGB565.

use core::convert::Infallible;

use embedded_hal::blocking::spi::Write;
use embedded_hal::digital::v2::OutputPin;

pub const WIDTH: u8 = 128;
pub const HEIGHT: u8 = 160;

const CASET: u8 = 0x2A;
const RASET: u8 = 0x2B;
const RAMWR: u8 = 0x2C;

/// One step of the power-up sequence.
pub enum Step {
    /// Command byte followed by its parameters.
    Command(u8, &'static [u8]),
    /// Pause, in milliseconds.
    Sleep(u32),
}

pub const INIT_SEQUENCE: &[Step] = &[
    Step::Command(0x01, &[]), // SWRESET
    Step::Sleep(150),
    Step::Command(0x11, &[]), // SLPOUT
    Step::Sleep(500),
    Step::Command(0xB1, &[0x01, 0x2C, 0x2D]), // FRMCTR1
    Step::Command(0xB2, &[0x01, 0x2C, 0x2D]), // FRMCTR2
    Step::Command(0xB3, &[0x01, 0x2C, 0x2D, 0x01, 0x2C, 0x2D]), // FRMCTR3
    Step::Command(0xB4, &[0x07]),             // INVCTR
    Step::Command(0xC0, &[0xA2, 0x02, 0x84]), // PWCTR1
    Step::Command(0xC1, &[0xC5]),             // PWCTR2
    Step::Command(0xC2, &[0x0A, 0x00]),       // PWCTR3
    Step::Command(0xC3, &[0x8A, 0x2A]),       // PWCTR4
    Step::Command(0xC4, &[0x8A, 0xEE]),       // PWCTR5
    Step::Command(0xC5, &[0x0E]),             // VMCTR1
    Step::Command(0x20, &[]),                 // INVOFF
    Step::Command(0x36, &[0xC8]),             // MADCTL
    Step::Command(0x3A, &[0x05]),             // COLMOD, 16 bit
    Step::Command(CASET, &[0x00, 0x00, 0x00, WIDTH - 1]),
    Step::Command(RASET, &[0x00, 0x00, 0x00, HEIGHT - 1]),
    Step::Command(
        0xE0, // GMCTRP1
        &[
            0x02, 0x1C, 0x07, 0x12, 0x37, 0x32, 0x29, 0x2D, 0x29, 0x25, 0x2B, 0x39, 0x00, 0x01,
            0x03, 0x10,
        ],
    ),
    Step::Command(
        0xE1, // GMCTRN1
        &[
            0x03, 0x1D, 0x07, 0x06, 0x2E, 0x2C, 0x29, 0x2D, 0x2E, 0x2E, 0x37, 0x3F, 0x00, 0x00,
            0x02, 0x10,
        ],
    ),
    Step::Command(0x13, &[]), // NORON
    Step::Sleep(10),
    Step::Command(0x29, &[]), // DISPON
    Step::Sleep(100),
];

fn drive<P: OutputPin<Error = Infallible>>(pin: &mut P, high: bool) {
    let result = if high { pin.set_high() } else { pin.set_low() };
    if let Err(never) = result {
        match never {}
    }
}

pub struct St7735<SPI, DC, RST, CS> {
    spi: SPI,
    dc: DC,
    rst: RST,
    cs: CS,
}

impl<SPI, DC, RST, CS> St7735<SPI, DC, RST, CS>
where
    SPI: Write<u8>,
    DC: OutputPin<Error = Infallible>,
    RST: OutputPin<Error = Infallible>,
    CS: OutputPin<Error = Infallible>,
{
    pub fn new(spi: SPI, dc: DC, rst: RST, cs: CS) -> Self {
        Self { spi, dc, rst, cs }
    }

    /// Drive the reset line; chip select is held while reset is active.
    pub fn set_reset(&mut self, active: bool) {
        drive(&mut self.cs, false);
        drive(&mut self.rst, !active);
    }

    /// Release chip select after the reset pulse.
    pub fn finish_reset(&mut self) {
        drive(&mut self.cs, true);
    }

    pub fn command(&mut self, cmd: u8, data: &[u8]) -> Result<(), SPI::Error> {
        drive(&mut self.dc, false);
        drive(&mut self.cs, false);

        let result = self.spi.write(&[cmd]).and_then(|()| {
            drive(&mut self.dc, true);
            if data.is_empty() {
                Ok(())
            } else {
                self.spi.write(data)
            }
        });

        drive(&mut self.cs, true);
        result
    }

    /// Blit one full-width row of RGB565 pixels, big endian, at row `y`.
    pub fn draw_row(&mut self, y: u8, pixels: &[u8]) -> Result<(), SPI::Error> {
        debug_assert_eq!(pixels.len(), 2 * WIDTH as usize);

        self.command(CASET, &[0, 0, 0, WIDTH - 1])?;
        self.command(RASET, &[0, y, 0, y])?;
        self.command(RAMWR, pixels)
    }
}
