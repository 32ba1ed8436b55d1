//! Shared accounting state and its lock
//!
//! Both channels sit behind one lock. Reset addresses the device as a whole,
//! so the two channels are accounted jointly even though they are sampled
//! independently. Splitting the lock per channel would let a reset land
//! between the two channels.
//!
//! Every acquisition is bounded. A caller that cannot get the lock in time
//! abandons its operation for this invocation; nothing is queued or retried.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{Duration, Instant, with_timeout};
use log::{debug, error};

use crate::channel::{CHANNEL_COUNT, ChannelId, ChannelState, SyncStatus, Transition};
use crate::error::LockTimeout;

/// Bound for per-sample operations (update, report, fold, bootstrap)
pub const SAMPLE_LOCK_TIMEOUT: Duration = Duration::from_millis(300);

/// Bound for the joint reset of both channels
pub const RESET_LOCK_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Progress of an operator reset through its remote acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPhase {
    /// No reset outstanding; the next `true` flag triggers one
    Idle,
    /// Reset applied and write-back issued; waiting to observe `false`
    Applied,
    /// Reset applied but the write-back failed; the next `true` re-issues it
    WriteBackFailed,
}

/// Live runtime of both channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OnTime {
    pub ch0: u64,
    pub ch1: u64,
}

/// Everything the lock protects.
#[derive(Debug)]
pub struct Ledger {
    channels: [ChannelState; CHANNEL_COUNT],
    reset: ResetPhase,
    /// Bumped by every reset so acknowledgements of older reports are ignored
    epoch: u32,
}

impl Ledger {
    pub const fn new() -> Self {
        Self {
            channels: [
                ChannelState::new(ChannelId::Ch0),
                ChannelState::new(ChannelId::Ch1),
            ],
            reset: ResetPhase::Idle,
            epoch: 0,
        }
    }

    pub fn channel(&self, id: ChannelId) -> &ChannelState {
        &self.channels[id.index()]
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> &mut ChannelState {
        &mut self.channels[id.index()]
    }

    pub fn channels(&self) -> &[ChannelState; CHANNEL_COUNT] {
        &self.channels
    }

    pub(crate) fn channels_mut(&mut self) -> &mut [ChannelState; CHANNEL_COUNT] {
        &mut self.channels
    }

    pub const fn reset_phase(&self) -> ResetPhase {
        self.reset
    }

    pub(crate) fn set_reset_phase(&mut self, phase: ResetPhase) {
        self.reset = phase;
    }

    pub const fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Zero both channels' cumulative counters together, leaving both synced.
    pub(crate) fn clear_cumulative(&mut self) {
        for ch in self.channels.iter_mut() {
            ch.clear_cumulative();
        }
        self.epoch = self.epoch.wrapping_add(1);
    }

    pub fn ontime(&self) -> OnTime {
        OnTime {
            ch0: self.channel(ChannelId::Ch0).runtime_ms(),
            ch1: self.channel(ChannelId::Ch1).runtime_ms(),
        }
    }

    /// True when every channel has an authoritative baseline
    pub fn all_synced(&self) -> bool {
        self.channels
            .iter()
            .all(|ch| ch.sync_status() == SyncStatus::Synced)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

/// The single lock over both channels' accounting.
pub struct AccountingGuard {
    ledger: Mutex<CriticalSectionRawMutex, Ledger>,
}

impl AccountingGuard {
    pub const fn new() -> Self {
        Self {
            ledger: Mutex::new(Ledger::new()),
        }
    }

    /// Take the lock, giving up after `timeout`.
    pub async fn lock_within(
        &self,
        timeout: Duration,
    ) -> Result<MutexGuard<'_, CriticalSectionRawMutex, Ledger>, LockTimeout> {
        with_timeout(timeout, self.ledger.lock())
            .await
            .map_err(|_| LockTimeout {
                timeout_ms: timeout.as_millis(),
            })
    }

    /// Take the lock with the per-sample bound.
    pub async fn lock(&self) -> Result<MutexGuard<'_, CriticalSectionRawMutex, Ledger>, LockTimeout> {
        self.lock_within(SAMPLE_LOCK_TIMEOUT).await
    }

    /// Feed one decoded sample into `channel` using the current `threshold`.
    ///
    /// On lock timeout the sample is dropped and the miss is logged.
    pub async fn update(
        &self,
        channel: ChannelId,
        sample: u16,
        threshold: u16,
        now: Instant,
    ) -> Result<Transition, LockTimeout> {
        let mut ledger = self.lock().await.map_err(|e| {
            error!("Failed to update ontime for {}: {}", channel, e);
            e
        })?;

        let ch = ledger.channel_mut(channel);
        ch.set_threshold(threshold);
        let transition = ch.update(sample, now);
        debug!("{} sample {} -> {:?}", channel, sample, transition);

        Ok(transition)
    }

    /// Live runtime of both channels.
    pub async fn ontime(&self) -> Result<OnTime, LockTimeout> {
        Ok(self.lock().await?.ontime())
    }
}

impl Default for AccountingGuard {
    fn default() -> Self {
        Self::new()
    }
}
