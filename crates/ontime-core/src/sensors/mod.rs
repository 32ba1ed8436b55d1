mod mcp3201;

use crate::channel::ChannelId;
use crate::error::TransportError;

pub use mcp3201::{FRAME_LEN, Frame, SAMPLE_MAX, Samples, SpiFrameSource, decode, synthesize};

/// Trait for the transport that clocks raw frames out of the converters.
///
/// Reads are synchronous and happen once per channel per sampling cycle.
pub trait FrameSource {
    /// Read one raw frame for `channel`.
    fn read_frame(&mut self, channel: ChannelId) -> Result<Frame, TransportError>;
}
