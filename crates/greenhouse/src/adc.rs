//! MCP3008 10-bit ADC on SPI0 / CE0, used for the soil moisture and
//! temperature probes.
//!
//! The sampler only sees the [`AdcBus`] port.  The `gpio` feature compiles
//! the real rppal SPI adapter; development builds use `sim::SimBus`.

use thiserror::Error;

#[cfg(feature = "gpio")]
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

// ── Frame layout ────────────────────────────────────────────────────────────
//
// Request:  [start bit, SGL/DIFF + channel in the high nibble, don't care]
// Response: result bits are spread over bytes 1 and 2.

/// Start bit sent in the first byte of every request.
const START_BIT: u8 = 0x01;

/// Single-ended mode flag, OR-ed with the channel before shifting.
const SINGLE_ENDED: u8 = 8;

/// Highest single-ended input on the chip (CH0-CH7).
pub const MAX_CHANNEL: u8 = 7;

/// Largest value `decode_frame` can produce.
pub const MAX_READING: u16 = (0x03 << 8) + (0xFF << 6);

/// SPI clock for the MCP3008 at 3.3 V.
#[cfg(feature = "gpio")]
const SPI_CLOCK_HZ: u32 = 1_000_000;

// ── Errors ──────────────────────────────────────────────────────────────────

/// Hardware faults surfaced to the owning loop instead of halting the
/// process.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[cfg(feature = "gpio")]
    #[error("failed to open {bus}: {reason}")]
    Open { bus: &'static str, reason: String },
    #[error("bus transfer on channel {channel} failed: {reason}")]
    Transfer { channel: u8, reason: String },
    #[error("bus used before begin()")]
    NotOpen,
    #[error("output pin {pin}: {reason}")]
    Output { pin: u8, reason: String },
}

// ── Port ────────────────────────────────────────────────────────────────────

/// A bus that yields decoded ADC readings per channel.
///
/// Callers bracket a batch of reads with `begin` / `end`; the bus is a
/// single shared resource and must be held exclusively for the batch.
pub trait AdcBus: Send {
    fn begin(&mut self) -> Result<(), HardwareError>;
    fn read(&mut self, channel: u8) -> Result<u16, HardwareError>;
    fn end(&mut self);
}

// ── Codec ───────────────────────────────────────────────────────────────────

/// Build the 3-byte request for a single-ended read on `channel`.
pub fn request_frame(channel: u8) -> [u8; 3] {
    [START_BIT, (SINGLE_ENDED + channel) << 4, 0x00]
}

/// Decode a response frame.
///
/// The bit-packing matches the readings the greenhouse has always logged
/// (and the thresholds calibrated against them), so it is kept as-is even
/// though it is not the datasheet layout.
pub fn decode_frame(frame: [u8; 3]) -> u16 {
    (u16::from(frame[1] & 0x03) << 8) + (u16::from(frame[2]) << 6)
}

// ── rppal adapter ───────────────────────────────────────────────────────────

#[cfg(feature = "gpio")]
pub struct Mcp3008 {
    spi: Option<Spi>,
}

#[cfg(feature = "gpio")]
impl Mcp3008 {
    pub fn new() -> Self {
        Self { spi: None }
    }
}

#[cfg(feature = "gpio")]
impl AdcBus for Mcp3008 {
    fn begin(&mut self) -> Result<(), HardwareError> {
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, SPI_CLOCK_HZ, Mode::Mode0).map_err(
            |e| HardwareError::Open {
                bus: "spi0/ce0",
                reason: e.to_string(),
            },
        )?;
        self.spi = Some(spi);
        Ok(())
    }

    fn read(&mut self, channel: u8) -> Result<u16, HardwareError> {
        let spi = self.spi.as_mut().ok_or(HardwareError::NotOpen)?;
        let request = request_frame(channel);
        let mut response = [0u8; 3];
        spi.transfer(&mut response, &request)
            .map_err(|e| HardwareError::Transfer {
                channel,
                reason: e.to_string(),
            })?;
        Ok(decode_frame(response))
    }

    fn end(&mut self) {
        // Dropping the handle releases /dev/spidev0.0.
        self.spi = None;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_channel_0() {
        assert_eq!(request_frame(0), [0x01, 0x80, 0x00]);
    }

    #[test]
    fn request_frame_channel_7() {
        assert_eq!(request_frame(7), [0x01, 0xF0, 0x00]);
    }

    #[test]
    fn decode_masks_high_bits_of_byte_1() {
        // Only the low two bits of byte 1 contribute.
        assert_eq!(decode_frame([0x00, 0xFC, 0x00]), 0);
        assert_eq!(decode_frame([0x00, 0x03, 0x00]), 768);
    }

    #[test]
    fn decode_shifts_byte_2_by_six() {
        assert_eq!(decode_frame([0x00, 0x00, 0x01]), 64);
        assert_eq!(decode_frame([0x00, 0x01, 0x02]), 256 + 128);
    }

    #[test]
    fn decode_maximum() {
        assert_eq!(decode_frame([0xFF, 0xFF, 0xFF]), MAX_READING);
        assert_eq!(MAX_READING, 17088);
    }
}
