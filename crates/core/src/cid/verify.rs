use thiserror::Error;

use super::{Cid, CidError};

/// Raised when bytes hash to a different identifier than the one claimed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("content mismatch: claimed {claimed}, computed {computed}")]
pub struct MismatchError {
    pub claimed: Cid,
    pub computed: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Mismatch(#[from] MismatchError),

    #[error("cannot recompute identifier: {0}")]
    Unsupported(#[from] CidError),
}

/// Recomputes the identifier of `bytes` with the claimed identifier's prefix
/// and checks that both are equal.
///
/// Pure function. A hash function this crate cannot compute is reported as an
/// error, never as a pass.
pub fn verify(claimed: &Cid, bytes: &[u8]) -> Result<(), VerifyError> {
    let computed = claimed.prefix().sum(bytes)?;
    if &computed != claimed {
        return Err(MismatchError {
            claimed: claimed.clone(),
            computed,
        }
        .into());
    }
    Ok(())
}
