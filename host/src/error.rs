//! Error taxonomy for the attestation engine.

use matchproof_core::ClaimStatus;
use thiserror::Error;
use uuid::Uuid;

use crate::chain::MirrorError;
use crate::store::StoreError;

/// Errors surfaced by mutating and query operations.
///
/// `ChainUnavailable` and `ChainTimeout` are reported after the off-chain
/// write has committed; callers treat them as "accepted, mirroring pending".
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("a claim with external reference {0} already exists")]
    DuplicateClaim(String),

    #[error("{verifier} already attested claim {claim_id}")]
    DuplicateAttestation { claim_id: Uuid, verifier: String },

    #[error("{disputer} already disputed claim {claim_id}")]
    DuplicateDispute { claim_id: Uuid, disputer: String },

    #[error("{identity} submitted claim {claim_id} and cannot vote on it")]
    SelfVerification { claim_id: Uuid, identity: String },

    #[error("{identity} already cast the opposite vote on claim {claim_id}")]
    ConflictingVote { claim_id: Uuid, identity: String },

    #[error("claim {0} not found")]
    NotFound(Uuid),

    #[error("claim {claim_id} is {status} and accepts no further votes")]
    ClaimClosed { claim_id: Uuid, status: ClaimStatus },

    #[error("claim {claim_id} is {status}, expected DISPUTED")]
    InvalidTransition { claim_id: Uuid, status: ClaimStatus },

    #[error("{identity} has reputation {score}, below the required {required}")]
    InsufficientReputation {
        identity: String,
        score: i64,
        required: i64,
    },

    #[error("{0} is not allowed to resolve disputes")]
    Unauthorized(String),

    #[error("chain mirror unavailable for claim {claim_id}: {reason}")]
    ChainUnavailable { claim_id: Uuid, reason: String },

    #[error("transaction {tx_id} for claim {claim_id} unconfirmed after {rounds} rounds")]
    ChainTimeout {
        claim_id: Uuid,
        tx_id: String,
        rounds: u32,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl EngineError {
    /// The off-chain write succeeded; only the ledger mirror is behind.
    pub fn is_mirror_pending(&self) -> bool {
        matches!(
            self,
            EngineError::ChainUnavailable { .. } | EngineError::ChainTimeout { .. }
        )
    }

    pub(crate) fn from_mirror(claim_id: Uuid, err: MirrorError) -> Self {
        match err {
            MirrorError::Timeout { tx_id, rounds } => EngineError::ChainTimeout {
                claim_id,
                tx_id,
                rounds,
            },
            other => EngineError::ChainUnavailable {
                claim_id,
                reason: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ClaimNotFound(id) => EngineError::NotFound(id),
            StoreError::DuplicateReference(external_ref) => EngineError::DuplicateClaim(external_ref),
            StoreError::DuplicateAttestation { claim_id, identity } => {
                EngineError::DuplicateAttestation {
                    claim_id,
                    verifier: identity,
                }
            }
            StoreError::DuplicateDispute { claim_id, identity } => EngineError::DuplicateDispute {
                claim_id,
                disputer: identity,
            },
            StoreError::ConflictingVote { claim_id, identity } => {
                EngineError::ConflictingVote { claim_id, identity }
            }
            StoreError::ClaimClosed { claim_id, status } => {
                EngineError::ClaimClosed { claim_id, status }
            }
            StoreError::InvalidState { claim_id, status } => {
                EngineError::InvalidTransition { claim_id, status }
            }
            other => EngineError::Store(other),
        }
    }
}
