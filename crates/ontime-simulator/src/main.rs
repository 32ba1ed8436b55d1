//! Desktop simulator for the two-channel on-time monitor.
//!
//! Runs the ontime-core sampler and engine against synthetic clamp readings
//! and an in-memory remote state store, so connection loss, reboots and
//! operator resets can be exercised without hardware.
//!
//! Each simulated boot starts a fresh engine against the same remote store.
//! The script below connects, drops and restores the connection, and raises
//! the operator reset flag once.
//!
//! Set `RUST_LOG=info` (or `debug`) to follow along.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use embassy_futures::block_on;
use embassy_time::Instant;
use log::{debug, error, info, warn};

use ontime_core::channel::ChannelId;
use ontime_core::config::DeviceSettings;
use ontime_core::engine::Engine;
use ontime_core::error::{NetworkError, TransportError};
use ontime_core::remote::payload::{
    ChannelTotals, Cumulative, StateReport, encode_cumulative, parse_desired,
};
use ontime_core::remote::{ContentType, Endpoint, RemoteStore};
use ontime_core::sampler::Sampler;
use ontime_core::sensors::{Frame, FrameSource, synthesize};
use ontime_core::status::{Slide, StatusSink};

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// Simulated reboots
const BOOTS: u32 = 2;

/// Sample cycles per boot
const CYCLES_PER_BOOT: u32 = 40;

/// Wall-clock delay between cycles. Much shorter than the device's loop delay.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Settings pushed by the settings service at boot
const BOOT_SETTINGS: &[u8] = br#"{"ADC_FLOOR_CH0":100,"ADC_FLOOR_CH1":100}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Connect,
    Disconnect,
    OperatorReset,
}

fn scripted_event(boot: u32, cycle: u32) -> Option<Event> {
    match (boot, cycle) {
        (0, 5) | (0, 25) | (1, 0) => Some(Event::Connect),
        (0, 20) => Some(Event::Disconnect),
        (1, 15) => Some(Event::OperatorReset),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Synthetic clamps
// ---------------------------------------------------------------------------

/// Square-wave load on each clamp, with an occasional corrupted frame on ch1.
struct ClampWave {
    cycle: u32,
}

impl ClampWave {
    fn new() -> Self {
        Self { cycle: 0 }
    }

    fn tick(&mut self) {
        self.cycle += 1;
    }

    fn value(&self, channel: ChannelId) -> u16 {
        let (period, on) = match channel {
            ChannelId::Ch0 => (12, 1200),
            ChannelId::Ch1 => (7, 600),
        };
        if self.cycle % period < period / 2 { on } else { 20 }
    }
}

impl FrameSource for ClampWave {
    fn read_frame(&mut self, channel: ChannelId) -> Result<Frame, TransportError> {
        if channel == ChannelId::Ch1 && self.cycle % 23 == 22 {
            // null bit set
            return Ok([0x20, 0x00, 0x00, 0x00]);
        }
        Ok(synthesize(self.value(channel)))
    }
}

/// Status slides go to the log.
struct LogSink;

impl StatusSink for LogSink {
    fn set(&mut self, slide: Slide, text: &str) {
        debug!("[{}] {}", slide.label(), text);
    }
}

// ---------------------------------------------------------------------------
// In-memory remote
// ---------------------------------------------------------------------------

/// State that survives a reboot: what the remote service has stored.
#[derive(Default)]
struct SimCloud {
    /// `None` until the first state report with a cumulative total
    cumulative: RefCell<Option<ChannelTotals>>,
    reset_cumulative: Cell<bool>,
    stream_points: Cell<usize>,
}

struct SimClient {
    cloud: Rc<SimCloud>,
    connected: Cell<bool>,
}

impl SimClient {
    fn new(cloud: Rc<SimCloud>) -> Self {
        Self {
            cloud,
            connected: Cell::new(false),
        }
    }
}

impl RemoteStore for SimClient {
    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    async fn push(
        &self,
        endpoint: Endpoint,
        payload: &[u8],
        content: ContentType,
    ) -> Result<(), NetworkError> {
        if !self.connected.get() {
            return Err(NetworkError::Disconnected);
        }

        match endpoint {
            Endpoint::SensorStream => {
                self.cloud.stream_points.set(self.cloud.stream_points.get() + 1);
                debug!("{} <- {}", endpoint.path(), String::from_utf8_lossy(payload));
            }
            Endpoint::State => {
                let report: StateReport =
                    serde_json::from_slice(payload).map_err(|_| NetworkError::Rejected(400))?;
                if let Some(reported) = report.cumulative {
                    let mut stored = self.cloud.cumulative.borrow_mut();
                    let current = (*stored).unwrap_or(ChannelTotals { ch0: 0, ch1: 0 });
                    *stored = Some(ChannelTotals {
                        ch0: reported.ch0.unwrap_or(current.ch0),
                        ch1: reported.ch1.unwrap_or(current.ch1),
                    });
                }
                info!("{} <- {}", endpoint.path(), String::from_utf8_lossy(payload));
            }
            Endpoint::Desired => {
                let reset = parse_desired(payload, content).map_err(|_| NetworkError::Rejected(400))?;
                self.cloud.reset_cumulative.set(reset);
                info!("{} <- reset_cumulative={}", endpoint.path(), reset);
            }
            Endpoint::Cumulative => return Err(NetworkError::Rejected(405)),
        }

        Ok(())
    }

    async fn fetch(&self, endpoint: Endpoint, _content: ContentType) -> Result<Vec<u8>, NetworkError> {
        if !self.connected.get() {
            return Err(NetworkError::Disconnected);
        }
        if endpoint != Endpoint::Cumulative {
            return Err(NetworkError::Rejected(404));
        }

        let cumulative = match *self.cloud.cumulative.borrow() {
            None => Cumulative::Uninitialized,
            Some(totals) => Cumulative::Baselines {
                ch0: totals.ch0,
                ch1: totals.ch1,
            },
        };
        encode_cumulative(cumulative).ok_or(NetworkError::Rejected(500))
    }
}

// ---------------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------------

fn desired_payload(cloud: &SimCloud) -> String {
    format!(r#"{{"reset_cumulative":{}}}"#, cloud.reset_cumulative.get())
}

async fn notify_desired(engine: &Engine<SimClient>, cloud: &SimCloud) {
    let payload = desired_payload(cloud);
    match engine.handle_desired(payload.as_bytes(), ContentType::Json).await {
        Ok(outcome) => info!("desired {} -> {:?}", payload, outcome),
        Err(e) => warn!("desired {} rejected: {}", payload, e),
    }
}

async fn run_boot(boot: u32, cloud: &Rc<SimCloud>) {
    let engine = Engine::new(SimClient::new(Rc::clone(cloud)));

    let settings = DeviceSettings::default();
    if let Err(e) = settings.apply_json(BOOT_SETTINGS) {
        error!("Boot settings rejected: {}", e);
    }

    let mut sampler = Sampler::new(ClampWave::new(), settings, LogSink);

    for cycle in 0..CYCLES_PER_BOOT {
        match scripted_event(boot, cycle) {
            Some(Event::Connect) => {
                info!("Connection established");
                engine.remote().connected.set(true);
                if let Err(e) = engine.on_connect().await {
                    warn!("Connect handling failed: {}", e);
                }
            }
            Some(Event::Disconnect) => {
                info!("Connection lost");
                engine.remote().connected.set(false);
            }
            Some(Event::OperatorReset) => {
                info!("Operator sets reset_cumulative");
                cloud.reset_cumulative.set(true);
                notify_desired(&engine, cloud).await;
                // the write-back itself is observed as a change
                notify_desired(&engine, cloud).await;
            }
            None => {}
        }

        sampler.run_cycle(&engine, Instant::now()).await;

        if let Some(Err(e)) = engine.service_bootstrap().await {
            warn!("Cumulative bootstrap failed: {}", e);
        }

        sampler.source_mut().tick();
        std::thread::sleep(SAMPLE_INTERVAL);
    }

    match engine.ontime().await {
        Ok(ontime) => info!("Boot {} ended with live runtime {:?}", boot, ontime),
        Err(e) => warn!("Boot {} ended, runtime unavailable: {}", boot, e),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    info!("Starting ontime simulator");
    info!(
        "{} boots of {} cycles, {} ms apart",
        BOOTS,
        CYCLES_PER_BOOT,
        SAMPLE_INTERVAL.as_millis()
    );

    let cloud = Rc::new(SimCloud::default());

    for boot in 0..BOOTS {
        info!("Boot {}", boot);
        block_on(run_boot(boot, &cloud));
        info!(
            "Remote cumulative after boot {}: {:?}",
            boot,
            *cloud.cumulative.borrow()
        );
    }

    info!(
        "Simulator exiting after {} stream points",
        cloud.stream_points.get()
    );
}
