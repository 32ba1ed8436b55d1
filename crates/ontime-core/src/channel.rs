//! Per-channel on-time state machine
//!
//! A channel is "on" while its samples read above the configured floor. The
//! state tracks three independent counters:
//!
//! - `runtime_ms`: the current continuous on-duration, restarted whenever a
//!   sample reads at or below the floor
//! - `unreported_ms`: on-time accrued since the last acknowledged push
//! - `cloud_baseline_ms`: the cumulative total the remote store has acknowledged
//!
//! The cumulative on-time of a channel is `cloud_baseline_ms + unreported_ms`,
//! and it is only meaningful once the baseline has been synced.

use core::fmt;

use embassy_time::Instant;

/// Number of monitored channels
pub const CHANNEL_COUNT: usize = 2;

/// Stable identity of a monitored channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Ch0,
    Ch1,
}

impl ChannelId {
    pub const ALL: [ChannelId; CHANNEL_COUNT] = [ChannelId::Ch0, ChannelId::Ch1];

    /// Index into per-channel arrays
    pub const fn index(self) -> usize {
        match self {
            Self::Ch0 => 0,
            Self::Ch1 => 1,
        }
    }

    /// Key used for this channel in remote payloads
    pub const fn key(self) -> &'static str {
        match self {
            Self::Ch0 => "ch0",
            Self::Ch1 => "ch1",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Whether the cloud baseline may be reported as part of a cumulative total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Baseline never loaded; the device must not claim a cumulative total
    Unsynced,
    /// A cumulative fetch has been requested but not processed yet
    Syncing,
    /// Baseline is authoritative
    Synced,
}

/// Result of feeding one sample into a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Sample read at or below the floor; runtime restarted
    Off,
    /// Sample read above the floor; `accrued_ms` added to both counters
    On { accrued_ms: u64 },
}

/// Accounting state for one channel.
///
/// Not synchronized on its own. Both channels live inside the
/// [`Ledger`](crate::guard::Ledger) and are only touched through the
/// [`AccountingGuard`](crate::guard::AccountingGuard).
#[derive(Debug, Clone)]
pub struct ChannelState {
    id: ChannelId,
    threshold: u16,
    last_on: Option<Instant>,
    runtime_ms: u64,
    unreported_ms: u64,
    cloud_baseline_ms: u64,
    sync: SyncStatus,
}

impl ChannelState {
    /// Fresh state at process start
    pub const fn new(id: ChannelId) -> Self {
        Self {
            id,
            threshold: 0,
            last_on: None,
            runtime_ms: 0,
            unreported_ms: 0,
            cloud_baseline_ms: 0,
            sync: SyncStatus::Unsynced,
        }
    }

    pub const fn id(&self) -> ChannelId {
        self.id
    }

    pub const fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: u16) {
        self.threshold = threshold;
    }

    pub const fn last_on(&self) -> Option<Instant> {
        self.last_on
    }

    pub const fn runtime_ms(&self) -> u64 {
        self.runtime_ms
    }

    pub const fn unreported_ms(&self) -> u64 {
        self.unreported_ms
    }

    pub const fn cloud_baseline_ms(&self) -> u64 {
        self.cloud_baseline_ms
    }

    pub const fn sync_status(&self) -> SyncStatus {
        self.sync
    }

    /// Cumulative on-time, or `None` while the baseline is not authoritative.
    pub fn cumulative_ms(&self) -> Option<u64> {
        match self.sync {
            SyncStatus::Synced => Some(self.cloud_baseline_ms.saturating_add(self.unreported_ms)),
            SyncStatus::Unsynced | SyncStatus::Syncing => None,
        }
    }

    /// Feed one sample taken at `now`.
    ///
    /// The first above-floor sample after an off period counts as a single
    /// millisecond so a short blip is never lost entirely.
    pub fn update(&mut self, sample: u16, now: Instant) -> Transition {
        if sample <= self.threshold {
            self.runtime_ms = 0;
            self.last_on = None;
            return Transition::Off;
        }

        let accrued_ms = self
            .last_on
            .filter(|last| last.as_ticks() > 0)
            .and_then(|last| now.checked_duration_since(last))
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(1);

        self.runtime_ms = self.runtime_ms.saturating_add(accrued_ms);
        self.unreported_ms = self.unreported_ms.saturating_add(accrued_ms);
        self.last_on = Some(now);

        Transition::On { accrued_ms }
    }

    pub(crate) fn set_sync_status(&mut self, sync: SyncStatus) {
        self.sync = sync;
    }

    /// Adopt a baseline loaded from the remote store.
    pub(crate) fn adopt_baseline(&mut self, baseline_ms: u64) {
        self.cloud_baseline_ms = baseline_ms;
        self.sync = SyncStatus::Synced;
    }

    /// Move `reported_ms` of unreported on-time into the baseline.
    ///
    /// `reported_ms` is what the acknowledged push carried. Anything accrued
    /// after the push was composed stays unreported.
    pub(crate) fn fold(&mut self, reported_ms: u64) {
        let folded = reported_ms.min(self.unreported_ms);
        self.cloud_baseline_ms = self.cloud_baseline_ms.saturating_add(folded);
        self.unreported_ms -= folded;
    }

    /// Zero the cumulative counters.
    ///
    /// Zero is an authoritative total, so the channel ends up `Synced` even if
    /// a cumulative fetch was still pending.
    pub(crate) fn clear_cumulative(&mut self) {
        self.unreported_ms = 0;
        self.adopt_baseline(0);
    }
}
