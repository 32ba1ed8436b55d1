//! Engine tying the ledger to the remote service
//!
//! The engine owns the accounting lock and the remote client. Everything that
//! reaches it, whether a sample cycle, a connection event, a cumulative fetch
//! response or a desired-state notification, goes through the same
//! [`AccountingGuard`].
//!
//! Two tasks drive it concurrently:
//!
//! - the [`Sampler`](crate::sampler::Sampler), which feeds samples and
//!   pushes reports
//! - the response dispatcher ([`Engine::run_dispatcher`]), which performs the
//!   cumulative fetches the composer asks for
//!
//! Desired-state notifications are delivered by the transport through
//! [`Engine::handle_desired`].

use log::{debug, error, info, warn};

use crate::error::{EngineError, LockTimeout};
use crate::guard::{AccountingGuard, OnTime};
use crate::reconcile::{FoldOutcome, Reconciler, ResetOutcome};
use crate::remote::payload::{SensorReading, encode_desired_default, parse_desired};
use crate::remote::{ContentType, Endpoint, RemoteStore};
use crate::report::{BootstrapSignal, ReportComposer};

/// What happened to the reports of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Not connected; nothing was sent and all on-time stays unreported
    Offline,
    /// Sensor stream and state report both acknowledged
    Pushed {
        fold: FoldOutcome,
        bootstrap_requested: bool,
    },
}

pub struct Engine<R> {
    guard: AccountingGuard,
    bootstrap: BootstrapSignal,
    remote: R,
}

impl<R: RemoteStore> Engine<R> {
    pub const fn new(remote: R) -> Self {
        Self {
            guard: AccountingGuard::new(),
            bootstrap: BootstrapSignal::new(),
            remote,
        }
    }

    pub fn guard(&self) -> &AccountingGuard {
        &self.guard
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.guard)
    }

    pub fn composer(&self) -> ReportComposer<'_> {
        ReportComposer::new(&self.guard, &self.bootstrap)
    }

    /// Live runtime of both channels.
    pub async fn ontime(&self) -> Result<OnTime, LockTimeout> {
        self.guard.ontime().await
    }

    /// Handle a (re)connection to the remote service.
    ///
    /// Requests a cumulative fetch unless every channel is already synced,
    /// then reports the live runtime.
    pub async fn on_connect(&self) -> Result<(), EngineError> {
        info!("Connected to remote service");

        if self.reconciler().begin_bootstrap(true).await? {
            self.bootstrap.signal(());
        }

        let payload = self.composer().compose_live().await?;
        self.remote
            .push(Endpoint::State, &payload, ContentType::Json)
            .await
            .map_err(|e| {
                error!("Failed to report live runtime on connect: {}", e);
                e
            })?;

        Ok(())
    }

    /// Push the cycle's samples and a state report.
    ///
    /// The state report is only sent once the sensor stream write is
    /// acknowledged. Unreported on-time is folded only when the state report
    /// itself is acknowledged.
    pub async fn report(&self, reading: SensorReading) -> Result<PushOutcome, EngineError> {
        if !self.remote.is_connected() {
            debug!("Not connected, keeping on-time unreported");
            return Ok(PushOutcome::Offline);
        }

        let stream = serde_json::to_vec(&reading).map_err(|_| EngineError::Encode)?;
        self.remote
            .push(Endpoint::SensorStream, &stream, ContentType::Json)
            .await
            .map_err(|e| {
                error!("Failed to push sensor data: {}", e);
                e
            })?;

        let composer = self.composer();
        let report = composer.compose().await?;
        let pushed = self
            .remote
            .push(Endpoint::State, &report.payload, ContentType::Json)
            .await;
        let fold = composer.settle(report.token, pushed).await?;

        Ok(PushOutcome::Pushed {
            fold,
            bootstrap_requested: report.bootstrap_requested,
        })
    }

    /// Take a pending cumulative fetch request, if any, and serve it.
    pub async fn service_bootstrap(&self) -> Option<Result<(), EngineError>> {
        self.bootstrap.try_take()?;
        Some(self.fetch_cumulative().await)
    }

    /// Serve cumulative fetch requests forever.
    pub async fn run_dispatcher(&self) -> ! {
        loop {
            self.bootstrap.wait().await;
            if let Err(e) = self.fetch_cumulative().await {
                warn!("Cumulative bootstrap failed: {}", e);
            }
        }
    }

    /// Fetch `state/cumulative` and adopt it.
    ///
    /// A failed fetch lets the next report request it again. A malformed
    /// response leaves the request pending until the next connection.
    async fn fetch_cumulative(&self) -> Result<(), EngineError> {
        let payload = match self
            .remote
            .fetch(Endpoint::Cumulative, ContentType::Cbor)
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to fetch cumulative state: {}", e);
                self.reconciler().bootstrap_failed().await?;
                return Err(e.into());
            }
        };

        self.reconciler()
            .bootstrap(&payload, ContentType::Cbor)
            .await?;
        Ok(())
    }

    /// Handle a desired-state notification.
    ///
    /// Anything other than a single `reset_cumulative` boolean is answered by
    /// writing the default desired state back.
    pub async fn handle_desired(
        &self,
        payload: &[u8],
        content: ContentType,
    ) -> Result<ResetOutcome, EngineError> {
        let reset = match parse_desired(payload, content) {
            Ok(reset) => reset,
            Err(e) => {
                error!("Desired state rejected: {}; restoring default", e);
                if let Err(write) = self.write_desired_default(content).await {
                    warn!("Could not restore default desired state: {}", write);
                }
                return Err(e.into());
            }
        };

        let reconciler = self.reconciler();
        let outcome = reconciler.observe_reset_flag(reset).await?;

        if outcome.needs_write_back() {
            if let Err(e) = self.write_desired_default(content).await {
                reconciler.write_back_failed().await?;
                return Err(e);
            }
        }

        Ok(outcome)
    }

    async fn write_desired_default(&self, content: ContentType) -> Result<(), EngineError> {
        let payload = encode_desired_default(content).ok_or(EngineError::Encode)?;
        self.remote
            .push(Endpoint::Desired, &payload, content)
            .await
            .map_err(|e| {
                error!("Failed to write desired state: {}", e);
                e.into()
            })
    }
}
