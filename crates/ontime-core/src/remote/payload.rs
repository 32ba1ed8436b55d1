//! Wire payloads exchanged with the remote service
//!
//! - `state/cumulative` is read back as a CBOR map `{ch0: uint, ch1: uint}`,
//!   or CBOR `null` (a single `0xF6` byte) when never written
//! - `desired` holds exactly `{"reset_cumulative": bool}`
//! - `state` and `sensor` are written as small JSON objects
//!
//! JSON equivalents of the two inbound payloads are accepted as well.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use log::debug;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use serde::{Deserialize, Serialize};

use super::ContentType;
use crate::error::{ProtocolError, ReconcileError};

/// Key of the operator reset flag in the desired-state object
pub const DESIRED_RESET_KEY: &str = "reset_cumulative";

const CBOR_NULL: u8 = 0xF6;

/// Cumulative totals as stored by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cumulative {
    /// The endpoint has never been written
    Uninitialized,
    /// Baselines for both channels, in milliseconds
    Baselines { ch0: u64, ch1: u64 },
}

#[derive(Deserialize)]
struct CumulativeJson {
    ch0: u64,
    ch1: u64,
}

/// Parse a `state/cumulative` response.
///
/// Both channels must be present; a payload carrying only one of them is
/// rejected as a whole.
pub fn parse_cumulative(payload: &[u8], content: ContentType) -> Result<Cumulative, ReconcileError> {
    match content {
        ContentType::Cbor => cumulative_from_cbor(payload).ok_or(ReconcileError::MalformedPayload),
        ContentType::Json => {
            match serde_json::from_slice::<Option<CumulativeJson>>(payload) {
                Ok(None) => Ok(Cumulative::Uninitialized),
                Ok(Some(c)) => Ok(Cumulative::Baselines {
                    ch0: c.ch0,
                    ch1: c.ch1,
                }),
                Err(_) => Err(ReconcileError::MalformedPayload),
            }
        }
    }
}

fn cumulative_from_cbor(payload: &[u8]) -> Option<Cumulative> {
    if payload == [CBOR_NULL] {
        return Some(Cumulative::Uninitialized);
    }

    let mut d = Decoder::new(payload);
    let mut remaining = d.map().ok()?;
    let mut ch0 = None;
    let mut ch1 = None;

    loop {
        match remaining {
            Some(0) => break,
            Some(n) => remaining = Some(n - 1),
            // indefinite-length map runs until the break marker
            None => {
                if d.datatype().ok()? == Type::Break {
                    break;
                }
            }
        }

        match d.str().ok()? {
            "ch0" => ch0 = Some(d.u64().ok()?),
            "ch1" => ch1 = Some(d.u64().ok()?),
            other => {
                debug!("Ignoring cumulative key {}", other);
                d.skip().ok()?;
            }
        }
    }

    Some(Cumulative::Baselines {
        ch0: ch0?,
        ch1: ch1?,
    })
}

/// Parse a desired-state notification into the reset flag.
pub fn parse_desired(payload: &[u8], content: ContentType) -> Result<bool, ProtocolError> {
    match content {
        ContentType::Cbor => desired_from_cbor(payload),
        ContentType::Json => desired_from_json(payload),
    }
}

fn desired_from_cbor(payload: &[u8]) -> Result<bool, ProtocolError> {
    if payload == [CBOR_NULL] {
        return Err(ProtocolError::Null);
    }

    let mut d = Decoder::new(payload);
    let len = d.map().map_err(|_| ProtocolError::Malformed)?;
    if matches!(len, Some(n) if n != 1) {
        return Err(ProtocolError::Malformed);
    }

    let key = d.str().map_err(|_| ProtocolError::Malformed)?;
    let value = d.bool().map_err(|_| ProtocolError::Malformed)?;

    if len.is_none() && d.datatype().map_err(|_| ProtocolError::Malformed)? != Type::Break {
        return Err(ProtocolError::Malformed);
    }

    if key != DESIRED_RESET_KEY {
        return Err(ProtocolError::UnexpectedKey);
    }

    Ok(value)
}

fn desired_from_json(payload: &[u8]) -> Result<bool, ProtocolError> {
    let object: Option<BTreeMap<String, serde_json::Value>> =
        serde_json::from_slice(payload).map_err(|_| ProtocolError::Malformed)?;
    let object = object.ok_or(ProtocolError::Null)?;

    if object.len() != 1 {
        return Err(ProtocolError::Malformed);
    }

    let (key, value) = object.iter().next().ok_or(ProtocolError::Malformed)?;
    let value = value.as_bool().ok_or(ProtocolError::Malformed)?;

    if key != DESIRED_RESET_KEY {
        return Err(ProtocolError::UnexpectedKey);
    }

    Ok(value)
}

#[derive(Serialize)]
struct DesiredJson {
    reset_cumulative: bool,
}

/// Encode the default desired state (`reset_cumulative = false`).
pub fn encode_desired_default(content: ContentType) -> Option<Vec<u8>> {
    match content {
        ContentType::Cbor => {
            let mut e = Encoder::new(Vec::new());
            e.map(1).ok()?.str(DESIRED_RESET_KEY).ok()?.bool(false).ok()?;
            Some(e.into_writer())
        }
        ContentType::Json => serde_json::to_vec(&DesiredJson {
            reset_cumulative: false,
        })
        .ok(),
    }
}

/// Encode cumulative totals the way the service stores them.
pub fn encode_cumulative(cumulative: Cumulative) -> Option<Vec<u8>> {
    let mut e = Encoder::new(Vec::new());
    match cumulative {
        Cumulative::Uninitialized => {
            e.null().ok()?;
        }
        Cumulative::Baselines { ch0, ch1 } => {
            e.map(2).ok()?.str("ch0").ok()?.u64(ch0).ok()?.str("ch1").ok()?.u64(ch1).ok()?;
        }
    }
    Some(e.into_writer())
}

/// Value for both channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTotals {
    pub ch0: u64,
    pub ch1: u64,
}

/// Value for whichever channels have one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartialTotals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ch0: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ch1: Option<u64>,
}

impl PartialTotals {
    pub fn is_empty(&self) -> bool {
        self.ch0.is_none() && self.ch1.is_none()
    }
}

/// Body written to the `state` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReport {
    pub live_runtime: ChannelTotals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative: Option<PartialTotals>,
}

/// Body written to the `sensor` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ch0: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ch1: Option<u16>,
}
