//! Reconciliation of local on-time with the remote cumulative store
//!
//! Three things move the cumulative counters besides sampling:
//!
//! 1. **Bootstrap**: the remote `state/cumulative` value is adopted as the
//!    baseline of both channels. A never-written (null) value bootstraps both
//!    channels at zero, so the next accrued on-time becomes the cumulative.
//! 2. **Fold**: once a push carrying a cumulative total is acknowledged, the
//!    unreported on-time it carried moves into the baseline.
//! 3. **Reset**: the operator's `reset_cumulative` flag zeroes the baseline
//!    and unreported on-time of both channels in one lock acquisition.

use log::{debug, error, info, warn};

use crate::channel::{ChannelId, SyncStatus};
use crate::error::{LockTimeout, ReconcileError};
use crate::guard::{AccountingGuard, RESET_LOCK_TIMEOUT, ResetPhase};
use crate::remote::ContentType;
use crate::remote::payload::{Cumulative, parse_cumulative};
use crate::report::AckToken;

/// What happened to an acknowledged report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Reported on-time moved into the baselines
    Folded,
    /// The report carried no cumulative total
    NothingToFold,
    /// A reset happened after the report was composed; nothing folded
    Stale,
}

/// Result of observing the operator reset flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Flag read `false`; ready for the next reset
    Idle,
    /// Counters zeroed; the flag must be written back to `false`
    Applied,
    /// Flag still reads `true` for a reset already applied; nothing to do
    AlreadyApplied,
    /// The previous write-back failed; write back again without resetting
    RetryWriteBack,
}

impl ResetOutcome {
    /// Whether the caller should write the flag back to `false`
    pub const fn needs_write_back(self) -> bool {
        matches!(self, Self::Applied | Self::RetryWriteBack)
    }
}

/// Entry points for remote responses. Borrow one from the engine per event.
pub struct Reconciler<'a> {
    guard: &'a AccountingGuard,
}

impl<'a> Reconciler<'a> {
    pub const fn new(guard: &'a AccountingGuard) -> Self {
        Self { guard }
    }

    /// Adopt the cumulative baselines from a `state/cumulative` response.
    ///
    /// Channels that are already synced keep their baseline; a late response
    /// must not roll back on-time folded since. On any error no channel is
    /// touched and sync status is left as it was.
    pub async fn bootstrap(&self, payload: &[u8], content: ContentType) -> Result<(), ReconcileError> {
        let cumulative = parse_cumulative(payload, content).map_err(|e| {
            error!("Cumulative decoding error ({} bytes): {:02x?}", payload.len(), payload);
            e
        })?;

        let mut ledger = self.guard.lock().await.map_err(|e| {
            error!("Could not adopt cumulative values: {}", e);
            e
        })?;

        let baselines = match cumulative {
            Cumulative::Uninitialized => {
                warn!("Cumulative state is null, use runtime as cumulative on next update.");
                [0, 0]
            }
            Cumulative::Baselines { ch0, ch1 } => {
                debug!("Decoded: ch0: {}, ch1: {}", ch0, ch1);
                [ch0, ch1]
            }
        };

        for id in ChannelId::ALL {
            let ch = ledger.channel_mut(id);
            if ch.sync_status() == SyncStatus::Synced {
                debug!("{} already synced, ignoring fetched baseline", id);
                continue;
            }
            ch.adopt_baseline(baselines[id.index()]);
        }

        Ok(())
    }

    /// Mark channels as waiting for a cumulative fetch.
    ///
    /// With `include_syncing` set, channels whose earlier fetch never resolved
    /// are re-requested too (used on connect). Returns true when a fetch should
    /// be issued.
    pub async fn begin_bootstrap(&self, include_syncing: bool) -> Result<bool, LockTimeout> {
        let mut ledger = self.guard.lock().await?;
        let mut wanted = false;

        for ch in ledger.channels_mut().iter_mut() {
            let request = match ch.sync_status() {
                SyncStatus::Unsynced => true,
                SyncStatus::Syncing => include_syncing,
                SyncStatus::Synced => false,
            };
            if request {
                ch.set_sync_status(SyncStatus::Syncing);
                wanted = true;
            }
        }

        Ok(wanted)
    }

    /// The cumulative fetch itself failed; let the next report ask again.
    pub async fn bootstrap_failed(&self) -> Result<(), LockTimeout> {
        let mut ledger = self.guard.lock().await?;
        for ch in ledger.channels_mut().iter_mut() {
            if ch.sync_status() == SyncStatus::Syncing {
                ch.set_sync_status(SyncStatus::Unsynced);
            }
        }
        Ok(())
    }

    /// Fold the on-time carried by an acknowledged report into the baselines.
    ///
    /// Consumes the token, so one report folds at most once. Call it only
    /// after the push was acknowledged; dropping the token instead keeps the
    /// on-time unreported for the next push.
    pub async fn fold_on_ack(&self, token: AckToken) -> Result<FoldOutcome, LockTimeout> {
        if !token.carries_cumulative() {
            return Ok(FoldOutcome::NothingToFold);
        }

        let mut ledger = self.guard.lock().await.map_err(|e| {
            error!("Could not fold reported on-time: {}", e);
            e
        })?;

        if token.epoch() != ledger.epoch() {
            info!("Cumulative reset since report was composed; not folding");
            return Ok(FoldOutcome::Stale);
        }

        for id in ChannelId::ALL {
            if let Some(reported) = token.reported(id) {
                ledger.channel_mut(id).fold(reported);
            }
        }

        Ok(FoldOutcome::Folded)
    }

    /// Zero the cumulative counters of both channels together.
    pub async fn reset(&self) -> Result<(), LockTimeout> {
        let mut ledger = self
            .guard
            .lock_within(RESET_LOCK_TIMEOUT)
            .await
            .map_err(|e| {
                error!("Could not reset cumulative values; blocked by lock: {}", e);
                e
            })?;

        ledger.clear_cumulative();
        info!("Cumulative values reset");
        Ok(())
    }

    /// Act on an observed value of the operator reset flag.
    ///
    /// A `true` flag resets once. Further `true` observations before a
    /// `false` one (the write-back racing the observation) do not reset again.
    /// On lock timeout the reset is abandoned and the phase is left untouched,
    /// so the next `true` observation tries again.
    pub async fn observe_reset_flag(&self, reset: bool) -> Result<ResetOutcome, LockTimeout> {
        let mut ledger = self
            .guard
            .lock_within(RESET_LOCK_TIMEOUT)
            .await
            .map_err(|e| {
                error!("Could not reset cumulative values; blocked by lock: {}", e);
                e
            })?;

        let outcome = match (reset, ledger.reset_phase()) {
            (false, _) => {
                ledger.set_reset_phase(ResetPhase::Idle);
                ResetOutcome::Idle
            }
            (true, ResetPhase::Idle) => {
                info!("Request to reset cumulative values received. Processing now.");
                ledger.clear_cumulative();
                ledger.set_reset_phase(ResetPhase::Applied);
                ResetOutcome::Applied
            }
            (true, ResetPhase::Applied) => {
                debug!("Reset already applied, waiting for flag to clear");
                ResetOutcome::AlreadyApplied
            }
            (true, ResetPhase::WriteBackFailed) => {
                ledger.set_reset_phase(ResetPhase::Applied);
                ResetOutcome::RetryWriteBack
            }
        };

        Ok(outcome)
    }

    /// The write-back of the reset flag failed.
    pub async fn write_back_failed(&self) -> Result<(), LockTimeout> {
        let mut ledger = self.guard.lock().await?;
        if ledger.reset_phase() == ResetPhase::Applied {
            ledger.set_reset_phase(ResetPhase::WriteBackFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::payload::encode_cumulative;
    use crate::report::ReportComposer;
    use crate::report::BootstrapSignal;
    use embassy_futures::block_on;
    use embassy_time::Instant;

    fn cbor(ch0: u64, ch1: u64) -> alloc::vec::Vec<u8> {
        encode_cumulative(Cumulative::Baselines { ch0, ch1 }).unwrap()
    }

    async fn accrue(guard: &AccountingGuard, from_ms: u64, to_ms: u64) {
        for id in ChannelId::ALL {
            guard.update(id, 900, 100, Instant::from_millis(from_ms)).await.unwrap();
            guard.update(id, 900, 100, Instant::from_millis(to_ms)).await.unwrap();
        }
    }

    #[test]
    fn test_bootstrap_null_syncs_both_at_zero() {
        let guard = AccountingGuard::new();
        block_on(async {
            Reconciler::new(&guard).bootstrap(&[0xF6], ContentType::Cbor).await.unwrap();

            let ledger = guard.lock().await.unwrap();
            for ch in ledger.channels() {
                assert_eq!(ch.sync_status(), SyncStatus::Synced);
                assert_eq!(ch.cloud_baseline_ms(), 0);
            }
        });
    }

    #[test]
    fn test_bootstrap_adopts_exact_baselines() {
        let guard = AccountingGuard::new();
        block_on(async {
            Reconciler::new(&guard)
                .bootstrap(&cbor(100, 200), ContentType::Cbor)
                .await
                .unwrap();

            let ledger = guard.lock().await.unwrap();
            assert_eq!(ledger.channel(ChannelId::Ch0).cloud_baseline_ms(), 100);
            assert_eq!(ledger.channel(ChannelId::Ch1).cloud_baseline_ms(), 200);
            assert!(ledger.all_synced());
        });
    }

    #[test]
    fn test_bootstrap_missing_channel_changes_nothing() {
        let guard = AccountingGuard::new();
        block_on(async {
            let reconciler = Reconciler::new(&guard);
            assert!(reconciler.begin_bootstrap(false).await.unwrap());

            let result = reconciler
                .bootstrap(br#"{"ch0":100}"#, ContentType::Json)
                .await;
            assert_eq!(result, Err(ReconcileError::MalformedPayload));

            let ledger = guard.lock().await.unwrap();
            for ch in ledger.channels() {
                assert_eq!(ch.sync_status(), SyncStatus::Syncing);
                assert_eq!(ch.cloud_baseline_ms(), 0);
            }
        });
    }

    #[test]
    fn test_late_bootstrap_does_not_overwrite_synced_baseline() {
        let guard = AccountingGuard::new();
        block_on(async {
            let reconciler = Reconciler::new(&guard);
            reconciler.bootstrap(&cbor(500, 600), ContentType::Cbor).await.unwrap();
            reconciler.bootstrap(&cbor(1, 2), ContentType::Cbor).await.unwrap();

            let ledger = guard.lock().await.unwrap();
            assert_eq!(ledger.channel(ChannelId::Ch0).cloud_baseline_ms(), 500);
            assert_eq!(ledger.channel(ChannelId::Ch1).cloud_baseline_ms(), 600);
        });
    }

    #[test]
    fn test_begin_bootstrap_only_once_per_unsynced_observation() {
        let guard = AccountingGuard::new();
        block_on(async {
            let reconciler = Reconciler::new(&guard);
            assert!(reconciler.begin_bootstrap(false).await.unwrap());
            assert!(!reconciler.begin_bootstrap(false).await.unwrap());
            // a connection event asks again
            assert!(reconciler.begin_bootstrap(true).await.unwrap());

            reconciler.bootstrap_failed().await.unwrap();
            assert!(reconciler.begin_bootstrap(false).await.unwrap());
        });
    }

    #[test]
    fn test_fold_on_ack_moves_reported_delta() {
        let guard = AccountingGuard::new();
        let signal = BootstrapSignal::new();
        block_on(async {
            let reconciler = Reconciler::new(&guard);
            reconciler.bootstrap(&cbor(10_000, 20_000), ContentType::Cbor).await.unwrap();
            accrue(&guard, 1_000, 3_000).await;

            let report = ReportComposer::new(&guard, &signal).compose().await.unwrap();
            let outcome = reconciler.fold_on_ack(report.token).await.unwrap();
            assert_eq!(outcome, FoldOutcome::Folded);

            let ledger = guard.lock().await.unwrap();
            assert_eq!(ledger.channel(ChannelId::Ch0).cloud_baseline_ms(), 12_001);
            assert_eq!(ledger.channel(ChannelId::Ch1).cloud_baseline_ms(), 22_001);
            for ch in ledger.channels() {
                assert_eq!(ch.unreported_ms(), 0);
            }
        });
    }

    #[test]
    fn test_unsynced_report_folds_nothing() {
        let guard = AccountingGuard::new();
        let signal = BootstrapSignal::new();
        block_on(async {
            accrue(&guard, 1_000, 2_000).await;

            let report = ReportComposer::new(&guard, &signal).compose().await.unwrap();
            let outcome = Reconciler::new(&guard).fold_on_ack(report.token).await.unwrap();
            assert_eq!(outcome, FoldOutcome::NothingToFold);

            let ledger = guard.lock().await.unwrap();
            assert_eq!(ledger.channel(ChannelId::Ch0).unreported_ms(), 1_001);
            assert_eq!(ledger.channel(ChannelId::Ch0).cloud_baseline_ms(), 0);
        });
    }

    #[test]
    fn test_ack_after_reset_is_stale() {
        let guard = AccountingGuard::new();
        let signal = BootstrapSignal::new();
        block_on(async {
            let reconciler = Reconciler::new(&guard);
            reconciler.bootstrap(&cbor(10_000, 0), ContentType::Cbor).await.unwrap();
            accrue(&guard, 1_000, 2_000).await;

            let report = ReportComposer::new(&guard, &signal).compose().await.unwrap();
            reconciler.reset().await.unwrap();
            let outcome = reconciler.fold_on_ack(report.token).await.unwrap();
            assert_eq!(outcome, FoldOutcome::Stale);

            let ledger = guard.lock().await.unwrap();
            for ch in ledger.channels() {
                assert_eq!(ch.cloud_baseline_ms(), 0);
                assert_eq!(ch.unreported_ms(), 0);
            }
        });
    }

    #[test]
    fn test_reset_zeroes_both_channels_and_keeps_sync() {
        let guard = AccountingGuard::new();
        block_on(async {
            let reconciler = Reconciler::new(&guard);
            reconciler.bootstrap(&cbor(7, 9), ContentType::Cbor).await.unwrap();
            accrue(&guard, 1_000, 5_000).await;

            reconciler.reset().await.unwrap();

            let ledger = guard.lock().await.unwrap();
            for ch in ledger.channels() {
                assert_eq!(ch.cloud_baseline_ms(), 0);
                assert_eq!(ch.unreported_ms(), 0);
                assert_eq!(ch.sync_status(), SyncStatus::Synced);
                // live runtime is not cumulative accounting
                assert_eq!(ch.runtime_ms(), 4_001);
            }
        });
    }

    #[test]
    fn test_reset_flag_applies_once_per_true_observation() {
        let guard = AccountingGuard::new();
        block_on(async {
            let reconciler = Reconciler::new(&guard);
            reconciler.bootstrap(&cbor(100, 100), ContentType::Cbor).await.unwrap();

            assert_eq!(
                reconciler.observe_reset_flag(true).await.unwrap(),
                ResetOutcome::Applied
            );

            accrue(&guard, 1_000, 2_000).await;

            // the flag still reads true before the write-back lands
            assert_eq!(
                reconciler.observe_reset_flag(true).await.unwrap(),
                ResetOutcome::AlreadyApplied
            );
            {
                let ledger = guard.lock().await.unwrap();
                assert_eq!(ledger.channel(ChannelId::Ch0).unreported_ms(), 1_001);
            }

            assert_eq!(
                reconciler.observe_reset_flag(false).await.unwrap(),
                ResetOutcome::Idle
            );
            assert_eq!(
                reconciler.observe_reset_flag(true).await.unwrap(),
                ResetOutcome::Applied
            );
            let ledger = guard.lock().await.unwrap();
            assert_eq!(ledger.channel(ChannelId::Ch0).unreported_ms(), 0);
        });
    }

    #[test]
    fn test_failed_write_back_is_retried_without_resetting_again() {
        let guard = AccountingGuard::new();
        block_on(async {
            let reconciler = Reconciler::new(&guard);
            reconciler.bootstrap(&[0xF6], ContentType::Cbor).await.unwrap();

            let first = reconciler.observe_reset_flag(true).await.unwrap();
            assert!(first.needs_write_back());
            reconciler.write_back_failed().await.unwrap();

            accrue(&guard, 1_000, 2_000).await;

            let retry = reconciler.observe_reset_flag(true).await.unwrap();
            assert_eq!(retry, ResetOutcome::RetryWriteBack);
            assert!(retry.needs_write_back());

            let ledger = guard.lock().await.unwrap();
            assert_eq!(ledger.channel(ChannelId::Ch1).unreported_ms(), 1_001);
        });
    }

    #[test]
    fn test_reset_abandoned_when_lock_is_held() {
        let guard = AccountingGuard::new();
        block_on(async {
            let reconciler = Reconciler::new(&guard);
            let held = guard.lock().await.unwrap();

            assert_eq!(
                reconciler.observe_reset_flag(true).await,
                Err(LockTimeout { timeout_ms: 5_000 })
            );

            drop(held);
            let ledger = guard.lock().await.unwrap();
            assert_eq!(ledger.reset_phase(), ResetPhase::Idle);
        });
    }
}
