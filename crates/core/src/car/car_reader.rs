//! Streaming reader for content-addressed archives.
//!
//! CARv1 is a varint-prefixed DAG-CBOR header `{roots, version}` followed by
//! varint-prefixed sections, each `cid || block`. CARv2 wraps a CARv1 payload
//! behind an 11-byte pragma and a fixed 40-byte header.

use ciborium::value::Value;
use integer_encoding::VarInt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cid::{Cid, CidError};

/// Upper bound for a single section.
pub const MAX_SECTION_SIZE: u64 = 32 << 20;
const MAX_VARINT_LEN: usize = 10;
const CARV2_PRAGMA_LEN: u64 = 11;
const CARV2_HEADER_LEN: usize = 40;
const DAG_CBOR_LINK_TAG: u64 = 42;

#[derive(Debug, Error)]
pub enum CarError {
    #[error("I/O error reading container: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed varint")]
    Varint,
    #[error("unexpected end of container")]
    UnexpectedEof,
    #[error("invalid container header: {0}")]
    Header(String),
    #[error("unsupported container version {0}")]
    UnsupportedVersion(u64),
    #[error("section of {0} bytes exceeds the size limit")]
    SectionTooLarge(u64),
    #[error("section of {len} bytes overruns the {remaining} bytes left in the payload")]
    SectionOverrun { len: u64, remaining: u64 },
    #[error("invalid section identifier: {0}")]
    Cid(#[from] CidError),
    #[error("block: {0} not found")]
    BlockNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarHeader {
    pub version: u64,
    pub roots: Vec<Cid>,
}

/// Reads a varint one byte at a time. `None` on a clean end of stream.
async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<(u64, u64)>, CarError> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN);
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(CarError::UnexpectedEof);
        }
        buf.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
        if buf.len() >= MAX_VARINT_LEN {
            return Err(CarError::Varint);
        }
    }
    let (value, _) = u64::decode_var(&buf).ok_or(CarError::Varint)?;
    Ok(Some((value, buf.len() as u64)))
}

/// Reads one length-prefixed section. `remaining` bounds a CARv2 payload.
async fn read_section<R: AsyncRead + Unpin>(
    reader: &mut R,
    remaining: &mut Option<u64>,
) -> Result<Option<Vec<u8>>, CarError> {
    if *remaining == Some(0) {
        return Ok(None);
    }
    let Some((len, prefix_len)) = read_varint(reader).await? else {
        return Ok(None);
    };
    // zero-length sections only appear as trailing padding
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_SECTION_SIZE {
        return Err(CarError::SectionTooLarge(len));
    }
    if let Some(rem) = *remaining {
        if prefix_len.saturating_add(len) > rem {
            return Err(CarError::SectionOverrun {
                len,
                remaining: rem.saturating_sub(prefix_len),
            });
        }
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => CarError::UnexpectedEof,
        _ => CarError::Io(e),
    })?;
    if let Some(rem) = remaining.as_mut() {
        *rem -= prefix_len + len;
    }
    Ok(Some(buf))
}

fn decode_link(value: Value) -> Result<Cid, CarError> {
    match value {
        Value::Tag(DAG_CBOR_LINK_TAG, inner) => match *inner {
            Value::Bytes(bytes) if bytes.first() == Some(&0) => Ok(Cid::from_bytes(&bytes[1..])?),
            _ => Err(CarError::Header("malformed root link".into())),
        },
        _ => Err(CarError::Header("root is not a link".into())),
    }
}

fn decode_header(bytes: &[u8]) -> Result<CarHeader, CarError> {
    let value: Value =
        ciborium::de::from_reader(bytes).map_err(|e| CarError::Header(e.to_string()))?;
    let Value::Map(entries) = value else {
        return Err(CarError::Header("header is not a map".into()));
    };

    let mut version = None;
    let mut roots = Vec::new();
    for (key, value) in entries {
        match key.as_text() {
            Some("version") => {
                version = value.as_integer().and_then(|v| u64::try_from(v).ok());
            }
            Some("roots") => {
                let Value::Array(items) = value else {
                    return Err(CarError::Header("roots is not a list".into()));
                };
                for item in items {
                    roots.push(decode_link(item)?);
                }
            }
            _ => {}
        }
    }

    Ok(CarHeader {
        version: version.ok_or_else(|| CarError::Header("missing version".into()))?,
        roots,
    })
}

/// Sequential block reader over a container stream.
pub struct CarReader<R> {
    reader: R,
    header: CarHeader,
    remaining: Option<u64>,
}

impl<R: AsyncRead + Unpin> CarReader<R> {
    pub async fn new(mut reader: R) -> Result<Self, CarError> {
        let mut unbounded = None;
        let first = read_section(&mut reader, &mut unbounded)
            .await?
            .ok_or(CarError::UnexpectedEof)?;
        let header = decode_header(&first)?;

        match header.version {
            1 => Ok(Self {
                reader,
                header,
                remaining: None,
            }),
            2 => {
                let mut fixed = [0u8; CARV2_HEADER_LEN];
                reader.read_exact(&mut fixed).await?;
                let data_offset = le_u64(&fixed[16..24]);
                let data_size = le_u64(&fixed[24..32]);

                let consumed = CARV2_PRAGMA_LEN + CARV2_HEADER_LEN as u64;
                let skip = data_offset.checked_sub(consumed).ok_or_else(|| {
                    CarError::Header(format!("data offset {data_offset} inside the header"))
                })?;
                let skipped =
                    tokio::io::copy(&mut (&mut reader).take(skip), &mut tokio::io::sink()).await?;
                if skipped != skip {
                    return Err(CarError::UnexpectedEof);
                }

                let mut remaining = Some(data_size);
                let inner = read_section(&mut reader, &mut remaining)
                    .await?
                    .ok_or(CarError::UnexpectedEof)?;
                let inner_header = decode_header(&inner)?;
                if inner_header.version != 1 {
                    return Err(CarError::UnsupportedVersion(inner_header.version));
                }
                Ok(Self {
                    reader,
                    header: inner_header,
                    remaining,
                })
            }
            other => Err(CarError::UnsupportedVersion(other)),
        }
    }

    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Next `(cid, block)` pair, `None` at the end of the payload.
    pub async fn next_block(&mut self) -> Result<Option<(Cid, Vec<u8>)>, CarError> {
        let Some(mut section) = read_section(&mut self.reader, &mut self.remaining).await? else {
            return Ok(None);
        };
        let (cid, used) = Cid::decode_prefix(&section)?;
        let block = section.split_off(used);
        Ok(Some((cid, block)))
    }

    /// Scans forward until `target`. Blocks before it are discarded.
    pub async fn find_block(&mut self, target: &Cid) -> Result<Vec<u8>, CarError> {
        while let Some((cid, block)) = self.next_block().await? {
            if &cid == target {
                return Ok(block);
            }
        }
        Err(CarError::BlockNotFound(target.to_string()))
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}
