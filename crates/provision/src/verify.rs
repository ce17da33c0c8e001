use polystore_model::EntitySpec;

use crate::error::{StageErrorKind, chain};
use crate::target::Target;

/// Result of a passed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verified {
    /// Backend count equals the staged cardinality.
    Exact(u64),
    /// Nothing to compare: the backend cannot count this entity or no
    /// staged cardinality is known.
    Unverified { observed: Option<u64> },
}

/// Compares the records the backend holds for `entity` with `expected`.
pub async fn verify<T: Target>(
    target: &T,
    entity: &EntitySpec,
    expected: Option<u64>,
) -> Result<Verified, StageErrorKind> {
    let observed = target
        .count(entity)
        .await
        .map_err(|err| StageErrorKind::Probe(chain(&err)))?;
    match (expected, observed) {
        (Some(expected), Some(observed)) if expected == observed => Ok(Verified::Exact(observed)),
        (Some(expected), Some(observed)) => Err(StageErrorKind::CountMismatch { expected, observed }),
        (_, observed) => Ok(Verified::Unverified { observed }),
    }
}
