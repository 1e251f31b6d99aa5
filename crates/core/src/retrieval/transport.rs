//! Transport metadata carried by indexer records.
//!
//! The metadata is a concatenation of varint protocol codes, each optionally
//! followed by a protocol-specific payload.

use integer_encoding::VarInt;
use thiserror::Error;

use super::retrieval_model::{RetrievalCandidate, TransportProtocol};
use crate::cid::Cid;

pub const TRANSPORT_BITSWAP: u64 = 0x0900;
pub const TRANSPORT_GRAPHSYNC_FILECOINV1: u64 = 0x0910;
pub const TRANSPORT_HTTP: u64 = 0x0920;

impl TransportProtocol {
    pub fn code(&self) -> u64 {
        match self {
            Self::Bitswap => TRANSPORT_BITSWAP,
            Self::GraphsyncFilecoinV1 => TRANSPORT_GRAPHSYNC_FILECOINV1,
            Self::Http => TRANSPORT_HTTP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("empty transport metadata")]
    Empty,
    #[error("malformed protocol code")]
    Varint,
    #[error("unsupported transport protocol 0x{0:x}")]
    UnsupportedProtocol(u64),
    #[error("malformed payload for protocol 0x{code:x}: {message}")]
    MalformedPayload { code: u64, message: String },
}

/// Lists the protocols in `metadata`. Fails on empty input or any protocol
/// code this crate does not know how to skip over.
pub fn parse_transport_metadata(metadata: &[u8]) -> Result<Vec<TransportProtocol>, MetadataError> {
    if metadata.is_empty() {
        return Err(MetadataError::Empty);
    }

    let mut rest = metadata;
    let mut protocols = Vec::new();
    while !rest.is_empty() {
        let (code, used) = u64::decode_var(rest).ok_or(MetadataError::Varint)?;
        rest = &rest[used..];
        match code {
            TRANSPORT_BITSWAP => protocols.push(TransportProtocol::Bitswap),
            TRANSPORT_HTTP => protocols.push(TransportProtocol::Http),
            TRANSPORT_GRAPHSYNC_FILECOINV1 => {
                // payload is a single CBOR map (piece cid, verified, fast retrieval)
                let _: ciborium::value::Value = ciborium::de::from_reader(&mut rest)
                    .map_err(|e| MetadataError::MalformedPayload {
                        code,
                        message: e.to_string(),
                    })?;
                protocols.push(TransportProtocol::GraphsyncFilecoinV1);
            }
            other => return Err(MetadataError::UnsupportedProtocol(other)),
        }
    }
    Ok(protocols)
}

/// Metadata advertising plain HTTP retrieval.
pub fn http_metadata() -> Vec<u8> {
    TRANSPORT_HTTP.encode_var_vec()
}

/// Keeps the first candidate published by `peer_id` for exactly `root`.
pub fn select_candidate(
    candidates: Vec<RetrievalCandidate>,
    root: &Cid,
    peer_id: &str,
) -> Option<RetrievalCandidate> {
    candidates
        .into_iter()
        .find(|candidate| candidate.peer_id == peer_id && &candidate.root == root)
}
