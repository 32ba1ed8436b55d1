//! MCP3201 current clamp converter
//!
//! The converter shifts a 12-bit conversion out twice per read: once MSB-first
//! and then again LSB-first, sharing the least significant bit. A 4-byte SPI
//! read therefore carries two alignments of the same reading.
//!
//! Byte layout of one frame:
//!
//! ```text
//! byte0: x x N B11 B10 B9 B8 B7     N = null bit, must be clear
//! byte1: B6 B5 B4 B3 B2 B1 B0 B1
//! byte2: B2 B3 B4 B5 B6 B7 B8 B9
//! byte3: B10 B11 x x x x x x
//! ```

use embedded_hal::spi::{Error as _, SpiDevice};
use log::{debug, error, info};

use super::FrameSource;
use crate::channel::ChannelId;
use crate::error::{DecodeError, TransportError};

/// Number of bytes clocked out of the converter per read
pub const FRAME_LEN: usize = 4;

/// One raw read from the converter
pub type Frame = [u8; FRAME_LEN];

/// Largest value a 12-bit sample can take
pub const SAMPLE_MAX: u16 = 0x0FFF;

const NULL_BIT: u8 = 1 << 5;

/// Both alignments of a single conversion.
///
/// They decode the same reading and are expected to be close, but a noisy
/// line can make them differ. Accounting uses `primary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Samples {
    /// MSB-first value from bytes 0 and 1
    pub primary: u16,
    /// LSB-first value from bytes 1 through 3
    pub secondary: u16,
}

/// Decode a raw frame into its two samples.
///
/// Fails without a partial result when the null bit is set.
pub fn decode(frame: &Frame) -> Result<Samples, DecodeError> {
    if frame[0] & NULL_BIT != 0 {
        return Err(DecodeError::MissingNullBit);
    }

    let primary = (u16::from(frame[0] & 0x1F) << 7) | u16::from(frame[1] >> 1);

    let mut secondary = 0u16;
    for i in 0..12u8 {
        let bit_set = match i {
            0..=1 => frame[1] & (1 << (1 - i)) != 0,
            2..=9 => frame[2] & (1 << (9 - i)) != 0,
            _ => frame[3] & (1 << (17 - i)) != 0,
        };
        if bit_set {
            secondary |= 1 << i;
        }
    }

    Ok(Samples { primary, secondary })
}

/// Build the frame a healthy converter shifts out for `value`.
///
/// Values above [`SAMPLE_MAX`] are truncated to 12 bits.
pub fn synthesize(value: u16) -> Frame {
    let value = value & SAMPLE_MAX;
    let bit = |n: u16| ((value >> n) & 1) as u8;

    let byte0 = ((value >> 7) & 0x1F) as u8;
    let byte1 = (((value & 0x7F) as u8) << 1) | bit(1);

    let mut byte2 = 0u8;
    for n in 2..10u16 {
        byte2 |= bit(n) << (9 - n);
    }

    let byte3 = (bit(10) << 7) | (bit(11) << 6);

    [byte0, byte1, byte2, byte3]
}

/// Reads both current clamps, each behind its own chip select.
pub struct SpiFrameSource<S> {
    ch0: S,
    ch1: S,
}

impl<S: SpiDevice<u8>> SpiFrameSource<S> {
    pub fn new(ch0: S, ch1: S) -> Self {
        info!("Setting up current clamp ADCs");
        Self { ch0, ch1 }
    }
}

impl<S: SpiDevice<u8>> FrameSource for SpiFrameSource<S> {
    fn read_frame(&mut self, channel: ChannelId) -> Result<Frame, TransportError> {
        let device = match channel {
            ChannelId::Ch0 => &mut self.ch0,
            ChannelId::Ch1 => &mut self.ch1,
        };

        let mut frame = [0u8; FRAME_LEN];
        device.read(&mut frame).map_err(|e| {
            error!("SPI read on {} failed: {:?}", channel, e.kind());
            TransportError::Spi {
                channel,
                kind: e.kind(),
            }
        })?;

        debug!(
            "Received 4 bytes from {}: {} {} {} {}",
            channel, frame[0], frame[1], frame[2], frame[3]
        );

        Ok(frame)
    }
}
