use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::Error;

/// Actor id of the built-in storage market actor.
pub const STORAGE_MARKET_ACTOR_ID: u64 = 5;

/// Event name emitted by the market actor when a deal goes live.
pub const DEAL_ACTIVATED_EVENT: &str = "deal-activated";

/// Formats an actor id as an ID address (`f0123`).
pub fn id_address(network_prefix: &str, actor_id: u64) -> String {
    format!("{network_prefix}0{actor_id}")
}

/// Extracts the actor id from an ID address such as `f01234` or `t01234`.
pub fn parse_id_address(address: &str) -> Result<u64, Error> {
    let invalid = || Error::invalid_input(format!("not an ID address: '{address}'"));
    let rest = address
        .strip_prefix('f')
        .or_else(|| address.strip_prefix('t'))
        .ok_or_else(invalid)?;
    let digits = rest.strip_prefix('0').ok_or_else(invalid)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    digits.parse::<u64>().map_err(|_| invalid())
}

/// One value accepted for an event field in a subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorEventBlock {
    pub codec: u64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorEventFilter {
    /// Emitter addresses.
    pub addresses: Vec<String>,
    /// Entry key -> accepted values. Values under one key are OR-ed.
    pub fields: BTreeMap<String, Vec<ActorEventBlock>>,
}

/// Key/value pair carried by an actor event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    pub flags: u64,
    pub key: String,
    pub codec: u64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorEvent {
    pub entries: Vec<EventEntry>,
    pub emitter: String,
    pub reverted: bool,
    pub height: i64,
    pub msg_cid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("deal label bytes are not valid UTF-8")]
    InvalidUtf8,
}

/// Free-form deal label. By convention it carries the payload identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DealLabel {
    Text(String),
    Bytes(Vec<u8>),
}

impl Default for DealLabel {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl DealLabel {
    pub fn to_payload_string(&self) -> Result<String, LabelError> {
        match self {
            Self::Text(text) => Ok(text.clone()),
            Self::Bytes(bytes) => String::from_utf8(bytes.clone()).map_err(|_| LabelError::InvalidUtf8),
        }
    }
}

/// Deal proposal fields as exposed by the chain node and the deal snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DealProposal {
    pub client: String,
    pub provider: String,
    #[serde(default)]
    pub label: DealLabel,
    pub start_epoch: i64,
    pub end_epoch: i64,
    #[serde(default)]
    pub piece_size: u64,
    #[serde(default)]
    pub verified_deal: bool,
}

/// Snapshot/state entry for a single deal. The `State` half is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MarketDeal {
    pub proposal: DealProposal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_addresses_round_trip_through_prefix() {
        assert_eq!(id_address("f", 1234), "f01234");
        assert_eq!(parse_id_address("f01234").unwrap(), 1234);
        assert_eq!(parse_id_address("t05").unwrap(), 5);
        assert!(parse_id_address("f1abc").is_err());
        assert!(parse_id_address("f0").is_err());
        assert!(parse_id_address("x01").is_err());
    }

    #[test]
    fn proposal_parses_node_json() {
        let raw = r#"{
            "Proposal": {
                "PieceCID": {"/": "baga6ea4seaqao7s73y24kcutaosvacpdjgfe5pw76ooefnyqw4ynr3d2y6x2mpq"},
                "PieceSize": 34359738368,
                "VerifiedDeal": true,
                "Client": "f01000",
                "Provider": "f02000",
                "Label": "bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku",
                "StartEpoch": 100,
                "EndEpoch": 200,
                "StoragePricePerEpoch": "0"
            },
            "State": {"SectorStartEpoch": 90, "LastUpdatedEpoch": -1, "SlashEpoch": -1}
        }"#;
        let deal: MarketDeal = serde_json::from_str(raw).unwrap();
        assert_eq!(deal.proposal.client, "f01000");
        assert_eq!(deal.proposal.start_epoch, 100);
        assert!(deal.proposal.verified_deal);
        assert_eq!(
            deal.proposal.label.to_payload_string().unwrap(),
            "bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku"
        );
    }

    #[test]
    fn byte_labels_must_be_utf8() {
        assert_eq!(
            DealLabel::Bytes(b"bafy".to_vec()).to_payload_string().unwrap(),
            "bafy"
        );
        assert_eq!(
            DealLabel::Bytes(vec![0xff, 0xfe]).to_payload_string(),
            Err(LabelError::InvalidUtf8)
        );
    }
}
