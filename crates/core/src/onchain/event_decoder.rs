//! Decoding of market actor events.
//!
//! Entry values are DAG-CBOR. A deal activation looks like
//! `$type = "deal-activated", id = <u64>, client = <u64>, provider = <u64>`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::chain::{ActorEvent, ActorEventBlock, EventEntry, DEAL_ACTIVATED_EVENT};
use crate::cid::codec;
use crate::errors::{Error, Result};

pub const EVENT_TYPE_KEY: &str = "$type";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("unexpected entry '{key}' (flags {flags}, codec 0x{codec:x})")]
    UnexpectedEntry { key: String, flags: u64, codec: u64 },

    #[error("entry '{key}' is not valid CBOR: {message}")]
    Malformed { key: String, message: String },

    #[error("event type '{0}' is not a deal activation")]
    OtherEventType(String),

    #[error("event has no '{EVENT_TYPE_KEY}' marker")]
    MissingMarker,

    #[error("deal activation is missing '{0}'")]
    MissingField(&'static str),
}

/// Identifiers carried by a deal activation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DealActivated {
    pub deal_id: u64,
    pub client_id: u64,
    pub provider_id: u64,
}

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| Error::invalid_input(format!("CBOR encoding failed: {e}")))?;
    Ok(buf)
}

/// Filter value matching a CBOR-encoded field.
pub fn cbor_block<T: Serialize>(value: &T) -> Result<ActorEventBlock> {
    Ok(ActorEventBlock {
        codec: codec::CBOR,
        value: encode_cbor(value)?,
    })
}

fn decode_entry<T: DeserializeOwned>(entry: &EventEntry) -> std::result::Result<T, EventDecodeError> {
    ciborium::de::from_reader(entry.value.as_slice()).map_err(|e| EventDecodeError::Malformed {
        key: entry.key.clone(),
        message: e.to_string(),
    })
}

fn unexpected(entry: &EventEntry) -> EventDecodeError {
    EventDecodeError::UnexpectedEntry {
        key: entry.key.clone(),
        flags: entry.flags,
        codec: entry.codec,
    }
}

/// Decodes a deal activation, rejecting the whole event on any entry that is
/// not part of the activation schema.
pub fn decode_deal_activated(
    event: &ActorEvent,
) -> std::result::Result<DealActivated, EventDecodeError> {
    let mut marker_seen = false;
    let mut deal_id = None;
    let mut client_id = None;
    let mut provider_id = None;

    for entry in &event.entries {
        match entry.key.as_str() {
            EVENT_TYPE_KEY => {
                let name: String = decode_entry(entry)?;
                if name != DEAL_ACTIVATED_EVENT {
                    return Err(EventDecodeError::OtherEventType(name));
                }
                marker_seen = true;
            }
            "id" if marker_seen => deal_id = Some(decode_entry::<u64>(entry)?),
            "client" if marker_seen => client_id = Some(decode_entry::<u64>(entry)?),
            "provider" if marker_seen => provider_id = Some(decode_entry::<u64>(entry)?),
            _ => return Err(unexpected(entry)),
        }
    }

    if !marker_seen {
        return Err(EventDecodeError::MissingMarker);
    }
    Ok(DealActivated {
        deal_id: deal_id.ok_or(EventDecodeError::MissingField("id"))?,
        client_id: client_id.ok_or(EventDecodeError::MissingField("client"))?,
        provider_id: provider_id.ok_or(EventDecodeError::MissingField("provider"))?,
    })
}
