//! Remote telemetry and state service seam
//!
//! The engine never talks to the network directly. It issues requests through
//! [`RemoteStore`] and gets the acknowledgement (or the failure) back as the
//! result of the future. Observation of the desired-state endpoint is driven
//! by the transport, which hands each notification to
//! [`Engine::handle_desired`](crate::engine::Engine::handle_desired).

pub mod payload;

use alloc::vec::Vec;

use crate::error::NetworkError;

/// Encoding of a request or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Cbor,
}

/// Paths on the remote service the device reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Time-series stream of raw samples
    SensorStream,
    /// Actual state: live runtime plus the cumulative totals
    State,
    /// Cumulative totals, read back on connect
    Cumulative,
    /// Operator-writable desired state
    Desired,
}

impl Endpoint {
    pub const fn path(self) -> &'static str {
        match self {
            Self::SensorStream => "sensor",
            Self::State => "state",
            Self::Cumulative => "state/cumulative",
            Self::Desired => "desired",
        }
    }
}

/// Trait for the client of the remote telemetry/state service.
///
/// Methods take `&self` because the sampler and the response dispatcher share
/// one client.
pub trait RemoteStore {
    /// Whether requests can currently be issued
    fn is_connected(&self) -> bool;

    /// Write `payload` to `endpoint`; resolves once the service acknowledges.
    fn push(
        &self,
        endpoint: Endpoint,
        payload: &[u8],
        content: ContentType,
    ) -> impl Future<Output = Result<(), NetworkError>>;

    /// Read the current value of `endpoint`.
    fn fetch(
        &self,
        endpoint: Endpoint,
        content: ContentType,
    ) -> impl Future<Output = Result<Vec<u8>, NetworkError>>;
}
