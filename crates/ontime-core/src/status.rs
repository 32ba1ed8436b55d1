//! Status slides for the device display
//!
//! The display shows four slides: the current draw and the live on-time of
//! each channel. Rendering is up to the sink; the engine only hands over the
//! formatted text.

use core::fmt::Write;

use heapless::String;

use crate::channel::ChannelId;

/// Amperes per raw ADC count for the fitted current clamps
pub const ADC_RAW_TO_AMP: f32 = 0.003_529_412;

/// Text for one slide. Fits the longest value either slide can show.
pub type SlideText = String<24>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slide {
    Current(ChannelId),
    Ontime(ChannelId),
}

impl Slide {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Current(ChannelId::Ch0) => "Current ch0",
            Self::Current(ChannelId::Ch1) => "Current ch1",
            Self::Ontime(ChannelId::Ch0) => "Ontime ch0",
            Self::Ontime(ChannelId::Ch1) => "Ontime ch1",
        }
    }
}

/// Destination for slide updates.
pub trait StatusSink {
    fn set(&mut self, slide: Slide, text: &str);
}

/// No display attached.
impl StatusSink for () {
    fn set(&mut self, _slide: Slide, _text: &str) {}
}

/// Current draw for a raw sample, e.g. `"3.53 A"`.
pub fn current_text(raw: u16) -> SlideText {
    let mut text = SlideText::new();
    let _ = write!(text, "{:.2} A", raw as f32 * ADC_RAW_TO_AMP);
    text
}

/// Live on-time in whole seconds, e.g. `"12 s"`.
pub fn ontime_text(runtime_ms: u64) -> SlideText {
    let mut text = SlideText::new();
    let _ = write!(text, "{} s", runtime_ms / 1000);
    text
}
