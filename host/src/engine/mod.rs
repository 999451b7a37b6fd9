//! The attestation engine.
//!
//! Every mutating operation follows the same order:
//! 1. Validate input and eligibility (no writes yet)
//! 2. Take the per-claim lock and commit the off-chain change together
//!    with its reputation deltas
//! 3. Release the lock, publish status changes
//! 4. Mirror to the ledger; failures surface as `ChainUnavailable` or
//!    `ChainTimeout` and are retried out of band

mod dispute;
mod intake;
mod verification;

pub use dispute::{DisputeRequest, ResolutionReceipt, ResolveRequest};
pub use intake::SubmitClaim;
pub use verification::AttestRequest;

use matchproof_core::{Attestation, Dispute, MatchClaim, ReputationChange, ReputationEvent, ReputationRecord};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::chain::{ChainMirror, ChainOp, MirrorError, MirrorRecord, MirrorReport, MirrorTarget};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::EventSink;
use crate::locks::KeyedLocks;
use crate::reputation::ReputationLedger;
use crate::roles::RoleDirectory;
use crate::store::{ClaimFilter, ClaimPage, Store, MAX_PAGE_SIZE};

pub const MAX_IDENTITY_LEN: usize = 128;
pub const MAX_TEAM_LEN: usize = 64;
pub const MAX_REFERENCE_LEN: usize = 128;
pub const MAX_METADATA_LEN: usize = 2048;
pub const MAX_REASON_LEN: usize = 256;
pub const MAX_EVIDENCE_LEN: usize = 2048;
pub const MAX_RESOLUTION_LEN: usize = 1024;
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// A recorded vote together with the claim it moved (or not).
#[derive(Debug, Clone, Serialize)]
pub struct VoteReceipt<V> {
    pub vote: V,
    pub claim: MatchClaim,
}

/// Everything the reporting layer shows for one claim.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimDetail {
    pub claim: MatchClaim,
    pub attestations: Vec<Attestation>,
    pub disputes: Vec<Dispute>,
    pub mirror: Vec<MirrorRecord>,
}

pub struct Engine {
    store: Arc<dyn Store>,
    mirror: Arc<ChainMirror>,
    reputation: ReputationLedger,
    roles: Arc<dyn RoleDirectory>,
    events: Arc<dyn EventSink>,
    /// Single writer per claim.
    claims: KeyedLocks<Uuid>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        mirror: Arc<ChainMirror>,
        roles: Arc<dyn RoleDirectory>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            reputation: ReputationLedger::new(store.clone(), config.reputation),
            store,
            mirror,
            roles,
            events,
            claims: KeyedLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mirror(&self) -> &ChainMirror {
        &self.mirror
    }

    pub fn reputation_ledger(&self) -> &ReputationLedger {
        &self.reputation
    }

    pub async fn claim_detail(&self, id: Uuid) -> Result<ClaimDetail, EngineError> {
        let claim = self.store.claim(id).await?;
        let attestations = self.store.attestations(id).await?;
        let disputes = self.store.disputes(id).await?;
        let mut mirror = self
            .store
            .mirror_records(&MirrorTarget::Claim { claim_id: id })
            .await?;
        for attestation in &attestations {
            mirror.extend(
                self.store
                    .mirror_records(&MirrorTarget::Attestation {
                        claim_id: id,
                        attestation_id: attestation.id,
                    })
                    .await?,
            );
        }
        for dispute in &disputes {
            mirror.extend(
                self.store
                    .mirror_records(&MirrorTarget::Dispute {
                        claim_id: id,
                        dispute_id: dispute.id,
                    })
                    .await?,
            );
        }
        mirror.sort_by_key(|record| record.created_at);
        Ok(ClaimDetail {
            claim,
            attestations,
            disputes,
            mirror,
        })
    }

    pub async fn list_claims(&self, filter: &ClaimFilter) -> Result<ClaimPage, EngineError> {
        if let Some(team) = &filter.team {
            check_text("team", team, MAX_TEAM_LEN, false)?;
        }
        Ok(self.store.list_claims(filter).await?)
    }

    pub async fn reputation(&self, identity: &str) -> Result<ReputationRecord, EngineError> {
        check_identity(identity)?;
        Ok(self.reputation.get(identity).await?)
    }

    pub async fn reputation_history(
        &self,
        identity: &str,
        limit: Option<u32>,
    ) -> Result<Vec<ReputationEvent>, EngineError> {
        check_identity(identity)?;
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_PAGE_SIZE);
        Ok(self.reputation.history(identity, limit).await?)
    }

    pub async fn leaderboard(&self, limit: Option<u32>) -> Result<Vec<ReputationRecord>, EngineError> {
        let limit = limit.unwrap_or(10).clamp(1, MAX_PAGE_SIZE);
        Ok(self.reputation.leaderboard(limit).await?)
    }

    /// One pass of the out-of-band mirror retry.
    pub async fn retry_mirrors(&self) -> Result<MirrorReport, MirrorError> {
        self.mirror.retry_backlog().await
    }

    /// Mirror score changes without blocking the caller; failures stay in
    /// the outbox for the retry loop.
    fn mirror_reputation(&self, claim_id: Uuid, changes: Vec<ReputationChange>) {
        let changes: Vec<ReputationChange> = changes.into_iter().filter(|c| c.delta != 0).collect();
        if changes.is_empty() {
            return;
        }
        let mirror = self.mirror.clone();
        tokio::spawn(async move {
            for change in changes {
                let target = MirrorTarget::Reputation {
                    claim_id,
                    identity: change.identity.clone(),
                };
                let op = ChainOp::UpdateReputation {
                    identity: change.identity.clone(),
                    delta: change.delta,
                    reason: change.reason.clone(),
                };
                if let Err(err) = mirror.mirror(target, op).await {
                    warn!(
                        claim_id = %claim_id,
                        identity = %change.identity,
                        error = %err,
                        "Reputation mirror pending"
                    );
                }
            }
        });
    }

    /// Mirror a claim-scoped operation and translate failures into the
    /// "accepted, mirroring pending" errors.
    async fn mirror_op(&self, target: MirrorTarget, op: ChainOp) -> Result<String, EngineError> {
        let claim_id = target.claim_id();
        let name = op.name();
        self.mirror.mirror(target, op).await.map_err(|err| {
            warn!(claim_id = %claim_id, op = name, error = %err, "Chain mirror pending");
            EngineError::from_mirror(claim_id, err)
        })
    }
}

pub(crate) fn check_identity(identity: &str) -> Result<(), EngineError> {
    check_text("identity", identity, MAX_IDENTITY_LEN, false)?;
    if identity.chars().any(char::is_control) {
        return Err(EngineError::Validation("identity contains control characters".into()));
    }
    Ok(())
}

/// Non-empty (unless `allow_empty`) after trimming, and at most `max` chars.
pub(crate) fn check_text(
    field: &str,
    value: &str,
    max: usize,
    allow_empty: bool,
) -> Result<(), EngineError> {
    if !allow_empty && value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(EngineError::Validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}
