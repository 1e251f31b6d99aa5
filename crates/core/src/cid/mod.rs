//! Content identifiers.
//!
//! A content identifier (CID) is a self-describing hash: a version, a codec
//! telling how the bytes are structured, and a multihash naming the hash
//! function alongside the digest. Only the pieces the pipelines need are
//! implemented: CIDv0/CIDv1, base32/base58/hex string forms and the hash
//! functions deals are sealed with in practice.

mod verify;

pub use verify::{verify, MismatchError, VerifyError};

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use integer_encoding::VarInt;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Multicodec codes for block structure.
pub mod codec {
    pub const CBOR: u64 = 0x51;
    pub const RAW: u64 = 0x55;
    pub const DAG_PB: u64 = 0x70;
    pub const DAG_CBOR: u64 = 0x71;
}

/// Multihash function codes.
pub mod hash_code {
    pub const IDENTITY: u64 = 0x00;
    pub const SHA2_256: u64 = 0x12;
    pub const SHA2_512: u64 = 0x13;
}

const SHA2_256_LEN: usize = 32;
const CID_V0_LEN: usize = 34;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidError {
    #[error("empty identifier")]
    Empty,
    #[error("unsupported multibase prefix '{0}'")]
    UnsupportedMultibase(char),
    #[error("invalid base encoding: {0}")]
    Encoding(String),
    #[error("unsupported CID version {0}")]
    UnsupportedVersion(u64),
    #[error("malformed varint")]
    Varint,
    #[error("truncated identifier")]
    Truncated,
    #[error("trailing bytes after identifier")]
    TrailingBytes,
    #[error("CIDv0 requires a 32-byte sha2-256 multihash")]
    InvalidV0,
    #[error("unsupported multihash function 0x{0:x}")]
    UnsupportedHash(u64),
    #[error("digest length {requested} exceeds {max} for multihash 0x{code:x}")]
    DigestLength {
        code: u64,
        requested: usize,
        max: usize,
    },
}

fn read_varint(bytes: &[u8]) -> Result<(u64, usize), CidError> {
    u64::decode_var(bytes).ok_or(CidError::Varint)
}

/// A hash function code paired with its digest.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Multihash {
    code: u64,
    digest: Vec<u8>,
}

impl Multihash {
    pub fn wrap(code: u64, digest: Vec<u8>) -> Self {
        Self { code, digest }
    }

    pub fn code(&self) -> u64 {
        self.code
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.code.encode_var_vec();
        out.extend((self.digest.len() as u64).encode_var_vec());
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        let (hash, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(CidError::TrailingBytes);
        }
        Ok(hash)
    }

    /// Decodes a multihash from the front of `bytes`, returning it with the
    /// number of bytes consumed.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize), CidError> {
        let (code, n) = read_varint(bytes)?;
        let (len, m) = read_varint(&bytes[n..])?;
        let start = n + m;
        let end = start
            .checked_add(usize::try_from(len).map_err(|_| CidError::Truncated)?)
            .ok_or(CidError::Truncated)?;
        if bytes.len() < end {
            return Err(CidError::Truncated);
        }
        Ok((Self::wrap(code, bytes[start..end].to_vec()), end))
    }

    /// Base58btc form, as used in content indexer URLs.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }
}

impl fmt::Debug for Multihash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multihash(0x{:x}, {})", self.code, hex::encode(&self.digest))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    V0,
    V1,
}

/// Parameters needed to recompute an identifier from raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub version: Version,
    pub codec: u64,
    pub hash_code: u64,
    pub digest_len: usize,
}

impl Prefix {
    /// Hashes `data` and builds the identifier this prefix describes.
    pub fn sum(&self, data: &[u8]) -> Result<Cid, CidError> {
        let mut digest = digest(self.hash_code, data)?;
        if self.hash_code != hash_code::IDENTITY {
            if self.digest_len > digest.len() {
                return Err(CidError::DigestLength {
                    code: self.hash_code,
                    requested: self.digest_len,
                    max: digest.len(),
                });
            }
            digest.truncate(self.digest_len);
        }
        let hash = Multihash::wrap(self.hash_code, digest);
        match self.version {
            Version::V0 => Cid::new_v0(hash),
            Version::V1 => Ok(Cid::new_v1(self.codec, hash)),
        }
    }
}

fn digest(code: u64, data: &[u8]) -> Result<Vec<u8>, CidError> {
    match code {
        hash_code::SHA2_256 => Ok(Sha256::digest(data).to_vec()),
        hash_code::SHA2_512 => Ok(Sha512::digest(data).to_vec()),
        hash_code::IDENTITY => Ok(data.to_vec()),
        other => Err(CidError::UnsupportedHash(other)),
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    version: Version,
    codec: u64,
    hash: Multihash,
}

impl Cid {
    pub fn new_v0(hash: Multihash) -> Result<Self, CidError> {
        if hash.code != hash_code::SHA2_256 || hash.digest.len() != SHA2_256_LEN {
            return Err(CidError::InvalidV0);
        }
        Ok(Self {
            version: Version::V0,
            codec: codec::DAG_PB,
            hash,
        })
    }

    pub fn new_v1(codec: u64, hash: Multihash) -> Self {
        Self {
            version: Version::V1,
            codec,
            hash,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn codec(&self) -> u64 {
        self.codec
    }

    pub fn hash(&self) -> &Multihash {
        &self.hash
    }

    pub fn prefix(&self) -> Prefix {
        Prefix {
            version: self.version,
            codec: self.codec,
            hash_code: self.hash.code,
            digest_len: self.hash.digest.len(),
        }
    }

    /// Same version and codec, different multihash.
    pub fn with_hash(&self, hash: Multihash) -> Result<Self, CidError> {
        match self.version {
            Version::V0 => Self::new_v0(hash),
            Version::V1 => Ok(Self::new_v1(self.codec, hash)),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self.version {
            Version::V0 => self.hash.to_bytes(),
            Version::V1 => {
                let mut out = 1u64.encode_var_vec();
                out.extend(self.codec.encode_var_vec());
                out.extend(self.hash.to_bytes());
                out
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        let (cid, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(CidError::TrailingBytes);
        }
        Ok(cid)
    }

    /// Decodes an identifier from the front of `bytes`, returning it with the
    /// number of bytes consumed.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize), CidError> {
        if bytes.len() >= 2 && bytes[0] as u64 == hash_code::SHA2_256 && bytes[1] == 32 {
            if bytes.len() < CID_V0_LEN {
                return Err(CidError::Truncated);
            }
            let hash = Multihash::wrap(hash_code::SHA2_256, bytes[2..CID_V0_LEN].to_vec());
            return Ok((Self::new_v0(hash)?, CID_V0_LEN));
        }

        let (version, n) = read_varint(bytes)?;
        if version != 1 {
            return Err(CidError::UnsupportedVersion(version));
        }
        let (codec, m) = read_varint(&bytes[n..])?;
        let (hash, k) = Multihash::decode_prefix(&bytes[n + m..])?;
        Ok((Self::new_v1(codec, hash), n + m + k))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Version::V0 => f.write_str(&bs58::encode(self.hash.to_bytes()).into_string()),
            Version::V1 => write!(
                f,
                "b{}",
                BASE32_NOPAD.encode(&self.to_bytes()).to_ascii_lowercase()
            ),
        }
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CidError::Empty);
        }

        if s.len() == 46 && s.starts_with("Qm") {
            let bytes = bs58::decode(s)
                .into_vec()
                .map_err(|e| CidError::Encoding(e.to_string()))?;
            return Self::new_v0(Multihash::from_bytes(&bytes)?);
        }

        let mut chars = s.chars();
        let base = chars.next().ok_or(CidError::Empty)?;
        let body = chars.as_str();
        let bytes = match base {
            'b' | 'B' => BASE32_NOPAD
                .decode(body.to_ascii_uppercase().as_bytes())
                .map_err(|e| CidError::Encoding(e.to_string()))?,
            'z' => bs58::decode(body)
                .into_vec()
                .map_err(|e| CidError::Encoding(e.to_string()))?,
            'f' | 'F' => hex::decode(body).map_err(|e| CidError::Encoding(e.to_string()))?,
            other => return Err(CidError::UnsupportedMultibase(other)),
        };
        Self::from_bytes(&bytes)
    }
}
