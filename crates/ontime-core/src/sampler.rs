//! Periodic sampling cycle
//!
//! Each cycle reads both converters, feeds the decoded samples into the
//! ledger, pushes the readings and a state report when connected, and
//! refreshes the status slides. A channel whose read or decode fails is
//! skipped for the cycle; the other channel is still accounted.

use embassy_time::{Instant, Timer};
use log::{debug, error, info, warn};

use crate::channel::{CHANNEL_COUNT, ChannelId, Transition};
use crate::config::SettingsSource;
use crate::engine::{Engine, PushOutcome};
use crate::error::EngineError;
use crate::remote::RemoteStore;
use crate::remote::payload::SensorReading;
use crate::sensors::{FrameSource, Samples, decode};
use crate::status::{Slide, StatusSink, current_text, ontime_text};

/// Everything one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub samples: [Option<Samples>; CHANNEL_COUNT],
    /// `None` when the sample was skipped or dropped on lock timeout
    pub transitions: [Option<Transition>; CHANNEL_COUNT],
    pub report: Result<PushOutcome, EngineError>,
}

pub struct Sampler<F, S, D = ()> {
    source: F,
    settings: S,
    sink: D,
}

impl<F, S, D> Sampler<F, S, D>
where
    F: FrameSource,
    S: SettingsSource,
    D: StatusSink,
{
    pub fn new(source: F, settings: S, sink: D) -> Self {
        Self {
            source,
            settings,
            sink,
        }
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }

    pub fn source_mut(&mut self) -> &mut F {
        &mut self.source
    }

    /// Run one sampling cycle at `now`.
    pub async fn run_cycle<R: RemoteStore>(&mut self, engine: &Engine<R>, now: Instant) -> CycleSummary {
        let mut samples = [None; CHANNEL_COUNT];
        let mut transitions = [None; CHANNEL_COUNT];

        for id in ChannelId::ALL {
            let decoded = self
                .source
                .read_frame(id)
                .map_err(EngineError::from)
                .and_then(|frame| decode(&frame).map_err(EngineError::from));

            let s = match decoded {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to process ADC readings for {}: {}", id, e);
                    continue;
                }
            };

            info!("{} ADC: {} {}", id, s.primary, s.secondary);
            samples[id.index()] = Some(s);

            let threshold = self.settings.adc_floor(id);
            transitions[id.index()] = engine.guard().update(id, s.primary, threshold, now).await.ok();
        }

        let reading = SensorReading {
            ch0: samples[ChannelId::Ch0.index()].map(|s| s.primary),
            ch1: samples[ChannelId::Ch1.index()].map(|s| s.primary),
        };

        let report = engine.report(reading).await;
        match &report {
            Ok(outcome) => debug!("Cycle report: {:?}", outcome),
            Err(e) => warn!("Cycle report incomplete: {}", e),
        }

        self.publish_status(engine, &samples).await;

        CycleSummary {
            samples,
            transitions,
            report,
        }
    }

    /// Sample forever, sleeping the configured loop delay between cycles.
    pub async fn run<R: RemoteStore>(&mut self, engine: &Engine<R>) -> ! {
        loop {
            self.run_cycle(engine, Instant::now()).await;
            Timer::after(self.settings.loop_period()).await;
        }
    }

    async fn publish_status<R: RemoteStore>(
        &mut self,
        engine: &Engine<R>,
        samples: &[Option<Samples>; CHANNEL_COUNT],
    ) {
        for id in ChannelId::ALL {
            if let Some(s) = samples[id.index()] {
                self.sink.set(Slide::Current(id), &current_text(s.primary));
            }
        }

        match engine.ontime().await {
            Ok(ontime) => {
                debug!("Ontime: (ch0): {}, (ch1): {}", ontime.ch0, ontime.ch1);
                self.sink.set(Slide::Ontime(ChannelId::Ch0), &ontime_text(ontime.ch0));
                self.sink.set(Slide::Ontime(ChannelId::Ch1), &ontime_text(ontime.ch1));
            }
            Err(e) => warn!("Status slides not refreshed: {}", e),
        }
    }
}
