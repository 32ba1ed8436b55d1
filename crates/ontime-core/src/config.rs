//! Runtime device settings
//!
//! Settings arrive from the remote settings service as individual key/value
//! updates. They are read on every sample, so a new floor applies from the
//! next sample on.

use alloc::collections::BTreeMap;
use alloc::string::String;
use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Duration;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::error::SettingsError;
use crate::sensors::SAMPLE_MAX;

pub const DEFAULT_ADC_FLOOR: u16 = 0;
pub const DEFAULT_LOOP_DELAY_S: u32 = 60;
pub const LOOP_DELAY_MIN_S: u32 = 1;
pub const LOOP_DELAY_MAX_S: u32 = 43_200;

/// Read access to the settings the engine needs.
pub trait SettingsSource {
    /// Threshold below which a channel counts as off
    fn adc_floor(&self, channel: ChannelId) -> u16;

    /// Delay between sample cycles
    fn loop_period(&self) -> Duration;
}

/// Plain settings values, named the way the settings service names them.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct SettingsValues {
    pub adc_floor_ch0: u16,
    pub adc_floor_ch1: u16,
    pub loop_delay_s: u32,
}

impl Default for SettingsValues {
    fn default() -> Self {
        Self {
            adc_floor_ch0: DEFAULT_ADC_FLOOR,
            adc_floor_ch1: DEFAULT_ADC_FLOOR,
            loop_delay_s: DEFAULT_LOOP_DELAY_S,
        }
    }
}

/// Settings shared between the settings callback and the sampler.
pub struct DeviceSettings {
    values: Mutex<CriticalSectionRawMutex, Cell<SettingsValues>>,
}

impl DeviceSettings {
    pub const fn new(values: SettingsValues) -> Self {
        Self {
            values: Mutex::new(Cell::new(values)),
        }
    }

    pub fn snapshot(&self) -> SettingsValues {
        self.values.lock(Cell::get)
    }

    /// Apply one update from the settings service.
    ///
    /// Out-of-range values are refused and the previous value is kept.
    pub fn apply(&self, key: &str, value: i64) -> Result<(), SettingsError> {
        let floor = || in_range(value, 0, SAMPLE_MAX as i64);
        let update: fn(&mut SettingsValues, i64) = match key {
            "ADC_FLOOR_CH0" => {
                floor()?;
                |values, v| values.adc_floor_ch0 = v as u16
            }
            "ADC_FLOOR_CH1" => {
                floor()?;
                |values, v| values.adc_floor_ch1 = v as u16
            }
            "LOOP_DELAY_S" => {
                in_range(value, LOOP_DELAY_MIN_S as i64, LOOP_DELAY_MAX_S as i64)?;
                |values, v| values.loop_delay_s = v as u32
            }
            _ => {
                warn!("Unknown setting {}", key);
                return Err(SettingsError::UnknownKey);
            }
        };

        // whole read-modify-write inside one critical section
        self.values.lock(|cell| {
            let mut values = cell.get();
            update(&mut values, value);
            cell.set(values);
        });
        info!("Setting {} = {}", key, value);
        Ok(())
    }

    /// Apply a JSON object of updates, e.g. `{"ADC_FLOOR_CH0": 120}`.
    ///
    /// Each key is applied on its own. Returns how many were accepted.
    pub fn apply_json(&self, payload: &[u8]) -> Result<usize, SettingsError> {
        let updates: BTreeMap<String, i64> =
            serde_json::from_slice(payload).map_err(|_| SettingsError::Malformed)?;

        let mut accepted = 0;
        for (key, value) in &updates {
            match self.apply(key, *value) {
                Ok(()) => accepted += 1,
                Err(e) => warn!("Rejected setting {}: {}", key, e),
            }
        }
        Ok(accepted)
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self::new(SettingsValues::default())
    }
}

impl SettingsSource for DeviceSettings {
    fn adc_floor(&self, channel: ChannelId) -> u16 {
        let values = self.snapshot();
        match channel {
            ChannelId::Ch0 => values.adc_floor_ch0,
            ChannelId::Ch1 => values.adc_floor_ch1,
        }
    }

    fn loop_period(&self) -> Duration {
        Duration::from_secs(self.snapshot().loop_delay_s as u64)
    }
}

impl<T: SettingsSource> SettingsSource for &T {
    fn adc_floor(&self, channel: ChannelId) -> u16 {
        (**self).adc_floor(channel)
    }

    fn loop_period(&self) -> Duration {
        (**self).loop_period()
    }
}

fn in_range(value: i64, min: i64, max: i64) -> Result<i64, SettingsError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(SettingsError::OutOfRange { value, min, max })
    }
}
