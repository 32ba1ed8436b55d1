//! Error taxonomy for the accounting engine.
//!
//! None of these are fatal. Every failure is either recovered locally (the
//! sample, reset, or fold is abandoned for this invocation) or reported to the
//! caller, who decides whether a later event retries it.

use thiserror_no_std::Error;

use crate::channel::ChannelId;

/// The raw frame did not come from a healthy conversion.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is missing its null bit")]
    MissingNullBit,
}

/// Reading a frame from the converter failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("SPI read failed on {channel}: {kind:?}")]
    Spi {
        channel: ChannelId,
        kind: embedded_hal::spi::ErrorKind,
    },
    #[error("no converter attached to {0}")]
    NotConnected(ChannelId),
}

/// The accounting lock could not be taken within its bound.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("accounting lock not acquired within {timeout_ms} ms")]
pub struct LockTimeout {
    pub timeout_ms: u64,
}

/// A cumulative payload from the remote store could not be adopted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("malformed cumulative payload")]
    MalformedPayload,
    #[error("{0}")]
    Lock(#[from] LockTimeout),
}

/// A request to the remote service failed before it was acknowledged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    #[error("client is not connected")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("remote rejected request with code {0}")]
    Rejected(u16),
}

/// The observed desired-state object was not the one the device understands.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("desired state is null")]
    Null,
    #[error("unexpected key in desired state")]
    UnexpectedKey,
    #[error("undecodable desired state")]
    Malformed,
}

/// A settings update was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown setting key")]
    UnknownKey,
    #[error("value {value} outside {min}..={max}")]
    OutOfRange { value: i64, min: i64, max: i64 },
    #[error("undecodable settings payload")]
    Malformed,
}

/// Umbrella error for engine-level operations that touch more than one seam.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Lock(#[from] LockTimeout),
    #[error("reconcile failed: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("network failed: {0}")]
    Network(#[from] NetworkError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("payload encoding failed")]
    Encode,
}
