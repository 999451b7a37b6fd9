//! Authoritative persistence for claims, votes, reputation and the mirror outbox.
//!
//! Both backends commit a vote, recompute the claim's tallies from its vote
//! rows and apply the threshold policy as one step under a per-claim write
//! lock (a row lock for PostgreSQL), so concurrent voters can never both
//! observe a sub-threshold tally and skip the transition.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchproof_core::{
    next_status, Attestation, ClaimStatus, CounterBump, Dispute, MatchClaim, ReputationChange,
    ReputationEvent, ReputationPolicy, ReputationRecord, ResolutionOutcome, StatusChange, Tally,
    ThresholdPolicy,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::chain::{MirrorRecord, MirrorTarget};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("claim {0} not found")]
    ClaimNotFound(Uuid),
    #[error("external reference {0} already used")]
    DuplicateReference(String),
    #[error("{identity} already attested claim {claim_id}")]
    DuplicateAttestation { claim_id: Uuid, identity: String },
    #[error("{identity} already disputed claim {claim_id}")]
    DuplicateDispute { claim_id: Uuid, identity: String },
    #[error("{identity} already voted the other way on claim {claim_id}")]
    ConflictingVote { claim_id: Uuid, identity: String },
    #[error("claim {claim_id} is closed ({status})")]
    ClaimClosed { claim_id: Uuid, status: ClaimStatus },
    #[error("claim {claim_id} is {status}")]
    InvalidState { claim_id: Uuid, status: ClaimStatus },
    #[error("mirror record {0} not found")]
    MirrorNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Reporting-layer claim query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFilter {
    #[serde(default)]
    pub status: Option<ClaimStatus>,
    /// Matches either side, compared after normalization.
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl ClaimFilter {
    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimPage {
    pub claims: Vec<MatchClaim>,
    pub total: u64,
    pub has_more: bool,
}

impl ClaimPage {
    pub(crate) fn new(claims: Vec<MatchClaim>, total: u64, filter: &ClaimFilter) -> Self {
        let seen = u64::from(filter.offset()) + claims.len() as u64;
        Self {
            has_more: seen < total,
            claims,
            total,
        }
    }
}

/// Result of recording one vote: the stored row, the claim after the
/// threshold policy ran and the reputation changes applied with it.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteCommit<V> {
    pub vote: V,
    pub claim: MatchClaim,
    pub previous: ClaimStatus,
    pub reputation: Vec<ReputationChange>,
}

impl<V> VoteCommit<V> {
    pub fn transitioned(&self) -> Option<StatusChange> {
        status_change(&self.claim, self.previous)
    }
}

/// Result of closing a disputed claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionCommit {
    pub claim: MatchClaim,
    pub previous: ClaimStatus,
    /// Disputes that were live and are now closed.
    pub disputes: Vec<Dispute>,
    pub attestations: Vec<Attestation>,
    pub reputation: Vec<ReputationChange>,
}

impl ResolutionCommit {
    pub fn transitioned(&self) -> Option<StatusChange> {
        status_change(&self.claim, self.previous)
    }
}

fn status_change(claim: &MatchClaim, previous: ClaimStatus) -> Option<StatusChange> {
    (claim.status != previous).then(|| StatusChange {
        claim_id: claim.id,
        external_ref: claim.external_ref.clone(),
        from: previous,
        to: claim.status,
        at: claim.updated_at,
    })
}

/// Persistence operations the engine needs. Reads never take claim locks.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_claim(&self, claim: &MatchClaim) -> Result<(), StoreError>;

    async fn claim(&self, id: Uuid) -> Result<MatchClaim, StoreError>;

    async fn list_claims(&self, filter: &ClaimFilter) -> Result<ClaimPage, StoreError>;

    async fn attestations(&self, claim_id: Uuid) -> Result<Vec<Attestation>, StoreError>;

    async fn disputes(&self, claim_id: Uuid) -> Result<Vec<Dispute>, StoreError>;

    /// Insert an attestation, recompute tallies, apply the policy and the
    /// resulting reputation changes (see [`attestation_rewards`]) as one
    /// atomic step.
    async fn commit_attestation(
        &self,
        attestation: Attestation,
        thresholds: &ThresholdPolicy,
        reputation: &ReputationPolicy,
    ) -> Result<VoteCommit<Attestation>, StoreError>;

    /// Insert a dispute, recompute tallies, apply the policy and bump the
    /// disputer's counters as one atomic step.
    async fn commit_dispute(
        &self,
        dispute: Dispute,
        thresholds: &ThresholdPolicy,
        reputation: &ReputationPolicy,
    ) -> Result<VoteCommit<Dispute>, StoreError>;

    /// Move the OPEN disputes of a DISPUTED claim to INVESTIGATING.
    async fn mark_investigating(&self, claim_id: Uuid) -> Result<Vec<Dispute>, StoreError>;

    /// Close a DISPUTED claim and all of its live disputes, settling
    /// reputation (see [`settlement`]) in the same step.
    async fn commit_resolution(
        &self,
        claim_id: Uuid,
        outcome: ResolutionOutcome,
        resolution: &str,
        reputation: &ReputationPolicy,
    ) -> Result<ResolutionCommit, StoreError>;

    /// Write back a confirmed transaction id.
    async fn set_chain_tx(&self, target: &MirrorTarget, tx_id: &str) -> Result<(), StoreError>;

    async fn reputation(&self, identity: &str) -> Result<Option<ReputationRecord>, StoreError>;

    /// Atomic read-modify-write of one identity's record plus its audit entry.
    async fn apply_reputation(
        &self,
        change: &ReputationChange,
        policy: &ReputationPolicy,
    ) -> Result<(ReputationRecord, ReputationEvent), StoreError>;

    /// Most recent first.
    async fn reputation_history(
        &self,
        identity: &str,
        limit: u32,
    ) -> Result<Vec<ReputationEvent>, StoreError>;

    async fn leaderboard(&self, limit: u32) -> Result<Vec<ReputationRecord>, StoreError>;

    async fn enqueue_mirror(&self, record: &MirrorRecord) -> Result<(), StoreError>;

    async fn update_mirror(&self, record: &MirrorRecord) -> Result<(), StoreError>;

    /// Take a record for one drive: store its bumped `attempts` and
    /// `updated_at` only if the row still has the record's status and
    /// `seen_attempts`. Returns false when another worker got there first.
    async fn claim_mirror(
        &self,
        record: &MirrorRecord,
        seen_attempts: u32,
    ) -> Result<bool, StoreError>;

    /// Records the retry loop should re-drive, oldest first. Records touched
    /// after `stale_before` are assumed to be in flight and skipped.
    async fn mirror_backlog(
        &self,
        max_attempts: u32,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<MirrorRecord>, StoreError>;

    async fn mirror_records(&self, target: &MirrorTarget) -> Result<Vec<MirrorRecord>, StoreError>;
}

/// Reject votes on claims that can no longer change.
pub(crate) fn ensure_open(claim: &MatchClaim) -> Result<(), StoreError> {
    if claim.status.is_terminal() {
        return Err(StoreError::ClaimClosed {
            claim_id: claim.id,
            status: claim.status,
        });
    }
    Ok(())
}

/// Store the recomputed tally on the claim and apply the threshold policy.
/// Returns the status the claim had before.
pub(crate) fn settle_claim(
    claim: &mut MatchClaim,
    tally: Tally,
    policy: &ThresholdPolicy,
    now: DateTime<Utc>,
) -> ClaimStatus {
    let previous = claim.status;
    claim.approve_weight = tally.approve;
    claim.dispute_weight = tally.dispute;
    if let Some(next) = next_status(previous, claim.required_weight, policy, tally) {
        if next == ClaimStatus::Verified && claim.verified_at.is_none() {
            claim.verified_at = Some(now);
        }
        claim.status = next;
    }
    claim.updated_at = now;
    previous
}

/// Reputation changes of one attestation: a counter bump for the voter and,
/// when this vote moved the claim to VERIFIED, the reward for every
/// attester present at the transition.
pub fn attestation_rewards(
    vote: &Attestation,
    attesters: &[Attestation],
    previous: ClaimStatus,
    claim: &MatchClaim,
    policy: &ReputationPolicy,
) -> Vec<ReputationChange> {
    let mut changes = vec![ReputationChange::new(&vote.verifier, 0, "attestation recorded")
        .with_counters(CounterBump::verification())];
    if previous != ClaimStatus::Verified && claim.status == ClaimStatus::Verified {
        for attester in attesters {
            changes.push(
                ReputationChange::new(&attester.verifier, policy.verification_reward, "verification accepted")
                    .with_counters(CounterBump::successful_verification()),
            );
        }
    }
    changes
}

pub fn dispute_raised(dispute: &Dispute) -> Vec<ReputationChange> {
    vec![ReputationChange::new(&dispute.disputer, 0, "dispute raised")
        .with_counters(CounterBump::dispute_raised())]
}

/// Reputation consequences of a resolution.
///
/// Upheld: disputers win, the submitter and every attester are penalized.
/// Dismissed: disputers are penalized, attesters who were never rewarded
/// (the claim had not reached VERIFIED when they voted) are rewarded now.
pub fn settlement(
    claim: &MatchClaim,
    outcome: ResolutionOutcome,
    disputes: &[Dispute],
    attestations: &[Attestation],
    policy: &ReputationPolicy,
) -> Vec<ReputationChange> {
    let mut changes = Vec::new();
    match outcome {
        ResolutionOutcome::Upheld => {
            for dispute in disputes {
                changes.push(
                    ReputationChange::new(&dispute.disputer, policy.dispute_won_reward, "dispute upheld")
                        .with_counters(CounterBump::dispute_won()),
                );
            }
            changes.push(ReputationChange::new(
                &claim.submitter,
                -policy.upheld_submitter_penalty,
                "claim rejected",
            ));
            for attestation in attestations {
                changes.push(ReputationChange::new(
                    &attestation.verifier,
                    -policy.overturned_attestation_penalty,
                    "attested claim rejected",
                ));
            }
        }
        ResolutionOutcome::Dismissed => {
            for dispute in disputes {
                changes.push(ReputationChange::new(
                    &dispute.disputer,
                    -policy.dismissed_dispute_penalty,
                    "dispute dismissed",
                ));
            }
            let unrewarded = attestations
                .iter()
                .filter(|a| claim.verified_at.map_or(true, |at| a.created_at > at));
            for attestation in unrewarded {
                changes.push(
                    ReputationChange::new(
                        &attestation.verifier,
                        policy.verification_reward,
                        "verification accepted",
                    )
                    .with_counters(CounterBump::successful_verification()),
                );
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim() -> MatchClaim {
        let now = Utc::now();
        MatchClaim {
            id: Uuid::new_v4(),
            external_ref: "ref".into(),
            home_team: "Red Lions".into(),
            away_team: "Blue Sharks".into(),
            home_score: 2,
            away_score: 1,
            submitter: "alice".into(),
            submitter_reputation: 100,
            status: ClaimStatus::Pending,
            required_weight: 30,
            approve_weight: 0,
            dispute_weight: 0,
            metadata: None,
            chain_tx: None,
            played_at: now,
            verified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_settle_marks_verified_once() {
        let policy = ThresholdPolicy::default();
        let mut c = claim();
        let first = Utc::now();
        let previous = settle_claim(&mut c, Tally { approve: 30, dispute: 0 }, &policy, first);
        assert_eq!(previous, ClaimStatus::Pending);
        assert_eq!(c.status, ClaimStatus::Verified);
        assert_eq!(c.verified_at, Some(first));

        let later = first + chrono::Duration::seconds(5);
        settle_claim(&mut c, Tally { approve: 40, dispute: 0 }, &policy, later);
        assert_eq!(c.verified_at, Some(first));
        assert_eq!(c.approve_weight, 40);
    }

    #[test]
    fn test_vote_commit_reports_transition() {
        let mut c = claim();
        let previous = settle_claim(
            &mut c,
            Tally { approve: 0, dispute: 20 },
            &ThresholdPolicy::default(),
            Utc::now(),
        );
        let commit = VoteCommit {
            vote: (),
            claim: c,
            previous,
            reputation: Vec::new(),
        };
        let change = commit.transitioned().unwrap();
        assert_eq!(change.from, ClaimStatus::Pending);
        assert_eq!(change.to, ClaimStatus::Disputed);
    }

    #[test]
    fn test_filter_limit_is_bounded() {
        assert_eq!(ClaimFilter::default().limit(), DEFAULT_PAGE_SIZE);
        let filter = ClaimFilter {
            limit: Some(0),
            ..ClaimFilter::default()
        };
        assert_eq!(filter.limit(), 1);
        let filter = ClaimFilter {
            limit: Some(1000),
            ..ClaimFilter::default()
        };
        assert_eq!(filter.limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_closed_claims_reject_votes() {
        let mut c = claim();
        assert!(ensure_open(&c).is_ok());
        c.status = ClaimStatus::Rejected;
        assert!(matches!(ensure_open(&c), Err(StoreError::ClaimClosed { .. })));
    }
}
