//! State report composition
//!
//! A report always carries the live runtime of both channels. A channel's
//! cumulative total is included only while its baseline is synced; the
//! device never claims a cumulative value it cannot vouch for.

use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{debug, error, info};

use crate::channel::{CHANNEL_COUNT, ChannelId, SyncStatus};
use crate::error::{EngineError, LockTimeout, NetworkError};
use crate::guard::{AccountingGuard, OnTime};
use crate::reconcile::{FoldOutcome, Reconciler};
use crate::remote::payload::{ChannelTotals, PartialTotals, StateReport};

/// Raised by the composer when a cumulative fetch is needed; waited on by the
/// response dispatcher.
pub type BootstrapSignal = Signal<CriticalSectionRawMutex, ()>;

/// Proof that a report carrying cumulative totals was composed.
///
/// Records how much unreported on-time each included channel carried and the
/// reset epoch at compose time. Hand it to
/// [`Reconciler::fold_on_ack`] once the push is acknowledged, or drop it if
/// the push failed.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an acknowledged report must be folded, a failed one dropped"]
pub struct AckToken {
    epoch: u32,
    reported: [Option<u64>; CHANNEL_COUNT],
}

impl AckToken {
    pub const fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Unreported on-time the report carried for `channel`
    pub const fn reported(&self, channel: ChannelId) -> Option<u64> {
        self.reported[channel.index()]
    }

    pub fn carries_cumulative(&self) -> bool {
        self.reported.iter().any(Option::is_some)
    }
}

/// A composed state report ready to push.
#[derive(Debug)]
pub struct Report {
    pub body: StateReport,
    /// JSON encoding of `body`
    pub payload: Vec<u8>,
    pub token: AckToken,
    /// A cumulative fetch was requested while composing
    pub bootstrap_requested: bool,
}

/// Builds state reports from the ledger.
pub struct ReportComposer<'a> {
    guard: &'a AccountingGuard,
    bootstrap: &'a BootstrapSignal,
}

impl<'a> ReportComposer<'a> {
    pub const fn new(guard: &'a AccountingGuard, bootstrap: &'a BootstrapSignal) -> Self {
        Self { guard, bootstrap }
    }

    /// Snapshot the ledger into a report.
    ///
    /// A channel seen `Unsynced` moves to `Syncing` and a single cumulative
    /// fetch is requested; `Syncing` channels wait for the pending one.
    pub async fn compose(&self) -> Result<Report, EngineError> {
        let mut ledger = self.guard.lock().await.map_err(|e| {
            error!("Could not compose state report: {}", e);
            e
        })?;

        let ontime = ledger.ontime();
        let epoch = ledger.epoch();
        let mut cumulative = PartialTotals::default();
        let mut reported = [None; CHANNEL_COUNT];
        let mut bootstrap_requested = false;

        for ch in ledger.channels_mut().iter_mut() {
            match ch.sync_status() {
                SyncStatus::Synced => {
                    let total = ch.cumulative_ms();
                    match ch.id() {
                        ChannelId::Ch0 => cumulative.ch0 = total,
                        ChannelId::Ch1 => cumulative.ch1 = total,
                    }
                    reported[ch.id().index()] = Some(ch.unreported_ms());
                }
                SyncStatus::Unsynced => {
                    ch.set_sync_status(SyncStatus::Syncing);
                    bootstrap_requested = true;
                }
                SyncStatus::Syncing => {}
            }
        }
        drop(ledger);

        if bootstrap_requested {
            info!("Cumulative baseline not synced, requesting fetch");
            self.bootstrap.signal(());
        }

        let body = StateReport {
            live_runtime: totals(ontime),
            cumulative: (!cumulative.is_empty()).then_some(cumulative),
        };
        let payload = encode(&body)?;
        debug!("Composed state report: {:?}", body);

        Ok(Report {
            body,
            payload,
            token: AckToken { epoch, reported },
            bootstrap_requested,
        })
    }

    /// A report carrying only the live runtime. Nothing to fold.
    pub async fn compose_live(&self) -> Result<Vec<u8>, EngineError> {
        let ontime = self.guard.ontime().await?;
        encode(&StateReport {
            live_runtime: totals(ontime),
            cumulative: None,
        })
    }

    /// Settle a pushed report with the outcome of its push.
    ///
    /// On success the carried on-time is folded. On failure the token is
    /// dropped and the on-time stays unreported for the next report.
    pub async fn settle(
        &self,
        token: AckToken,
        pushed: Result<(), NetworkError>,
    ) -> Result<FoldOutcome, EngineError> {
        match pushed {
            Ok(()) => Ok(self.fold(token).await?),
            Err(e) => {
                error!("Failed to send state report: {}; keeping deltas", e);
                drop(token);
                Err(e.into())
            }
        }
    }

    async fn fold(&self, token: AckToken) -> Result<FoldOutcome, LockTimeout> {
        Reconciler::new(self.guard).fold_on_ack(token).await
    }
}

fn totals(ontime: OnTime) -> ChannelTotals {
    ChannelTotals {
        ch0: ontime.ch0,
        ch1: ontime.ch1,
    }
}

fn encode(body: &StateReport) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(body).map_err(|_| EngineError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ContentType;
    use embassy_futures::block_on;
    use embassy_time::Instant;

    async fn run_for(guard: &AccountingGuard, id: ChannelId, from_ms: u64, to_ms: u64) {
        guard.update(id, 900, 100, Instant::from_millis(from_ms)).await.unwrap();
        guard.update(id, 900, 100, Instant::from_millis(to_ms)).await.unwrap();
    }

    #[test]
    fn test_unsynced_report_is_live_only_and_requests_once() {
        let guard = AccountingGuard::new();
        let signal = BootstrapSignal::new();
        block_on(async {
            run_for(&guard, ChannelId::Ch0, 1_000, 2_000).await;
            let composer = ReportComposer::new(&guard, &signal);

            let first = composer.compose().await.unwrap();
            assert_eq!(
                first.payload,
                br#"{"live_runtime":{"ch0":1001,"ch1":0}}"#
            );
            assert!(first.bootstrap_requested);
            assert!(!first.token.carries_cumulative());
            assert!(signal.try_take().is_some());

            let second = composer.compose().await.unwrap();
            assert!(!second.bootstrap_requested);
            assert!(signal.try_take().is_none());
        });
    }

    #[test]
    fn test_synced_report_includes_cumulative() {
        let guard = AccountingGuard::new();
        let signal = BootstrapSignal::new();
        block_on(async {
            Reconciler::new(&guard)
                .bootstrap(br#"{"ch0":10000,"ch1":20000}"#, ContentType::Json)
                .await
                .unwrap();
            run_for(&guard, ChannelId::Ch0, 1_000, 2_000).await;

            let report = ReportComposer::new(&guard, &signal).compose().await.unwrap();
            assert_eq!(
                report.payload,
                br#"{"live_runtime":{"ch0":1001,"ch1":0},"cumulative":{"ch0":11001,"ch1":20000}}"#
            );
            assert_eq!(report.token.reported(ChannelId::Ch0), Some(1_001));
            assert_eq!(report.token.reported(ChannelId::Ch1), Some(0));
            assert!(!report.bootstrap_requested);
        });
    }

    #[test]
    fn test_failed_push_keeps_deltas() {
        let guard = AccountingGuard::new();
        let signal = BootstrapSignal::new();
        block_on(async {
            Reconciler::new(&guard)
                .bootstrap(&[0xF6], ContentType::Cbor)
                .await
                .unwrap();
            run_for(&guard, ChannelId::Ch1, 0, 3_000).await;

            let composer = ReportComposer::new(&guard, &signal);
            let report = composer.compose().await.unwrap();
            let result = composer.settle(report.token, Err(NetworkError::Timeout)).await;
            assert_eq!(result, Err(EngineError::Network(NetworkError::Timeout)));

            let ledger = guard.lock().await.unwrap();
            assert_eq!(ledger.channel(ChannelId::Ch1).cloud_baseline_ms(), 0);
            assert_eq!(ledger.channel(ChannelId::Ch1).cumulative_ms(), Some(2));
        });
    }

    #[test]
    fn test_acknowledged_push_folds() {
        let guard = AccountingGuard::new();
        let signal = BootstrapSignal::new();
        block_on(async {
            Reconciler::new(&guard)
                .bootstrap(&[0xF6], ContentType::Cbor)
                .await
                .unwrap();
            run_for(&guard, ChannelId::Ch0, 1_000, 1_500).await;

            let composer = ReportComposer::new(&guard, &signal);
            let report = composer.compose().await.unwrap();
            // accrues after compose and must survive the fold
            guard
                .update(ChannelId::Ch0, 900, 100, Instant::from_millis(1_700))
                .await
                .unwrap();

            assert_eq!(
                composer.settle(report.token, Ok(())).await,
                Ok(FoldOutcome::Folded)
            );

            let ledger = guard.lock().await.unwrap();
            let ch0 = ledger.channel(ChannelId::Ch0);
            assert_eq!(ch0.cloud_baseline_ms(), 501);
            assert_eq!(ch0.unreported_ms(), 200);
            assert_eq!(ch0.cumulative_ms(), Some(701));
        });
    }

    #[test]
    fn test_live_only_report() {
        let guard = AccountingGuard::new();
        let signal = BootstrapSignal::new();
        block_on(async {
            Reconciler::new(&guard)
                .bootstrap(&[0xF6], ContentType::Cbor)
                .await
                .unwrap();
            run_for(&guard, ChannelId::Ch1, 10, 20).await;

            let payload = ReportComposer::new(&guard, &signal).compose_live().await.unwrap();
            assert_eq!(payload, br#"{"live_runtime":{"ch0":0,"ch1":11}}"#);
        });
    }
}
